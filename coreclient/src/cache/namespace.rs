// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use super::route::ResourceClass;

const NAMESPACE_PREFIX: &str = "fieldsync";

/// The namespaces of one application version, one per resource class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceSet {
    version: String,
}

impl NamespaceSet {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn name(&self, class: ResourceClass) -> String {
        format!("{NAMESPACE_PREFIX}-{}-{}", class.name(), self.version)
    }

    pub fn names(&self) -> impl Iterator<Item = String> + '_ {
        ResourceClass::ALL.into_iter().map(|class| self.name(class))
    }

    /// Namespace created by the cache layer for another version.
    pub fn is_superseded(&self, namespace: &str) -> bool {
        namespace.starts_with(&format!("{NAMESPACE_PREFIX}-"))
            && self.names().all(|name| name != namespace)
    }
}
