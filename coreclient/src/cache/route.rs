// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::fmt;

use fieldapiclient::Method;
use url::Url;

use super::request::Destination;

/// How a request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Network; on failure any cached copy; otherwise the failure
    NetworkFirst,
    /// Cache; on miss the network, populating the cache
    CacheFirst,
    /// Cache if present while refreshing it in the background; on miss the network
    StaleWhileRevalidate,
    /// Network; on failure the cached document or the offline document
    NetworkFirstWithFallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    Navigation,
    StaticAsset,
    ApiRead,
    ObjectStorage,
    Other,
}

impl ResourceClass {
    pub const ALL: [ResourceClass; 5] = [
        ResourceClass::Navigation,
        ResourceClass::StaticAsset,
        ResourceClass::ApiRead,
        ResourceClass::ObjectStorage,
        ResourceClass::Other,
    ];

    pub fn strategy(&self) -> Strategy {
        match self {
            ResourceClass::Navigation => Strategy::NetworkFirstWithFallback,
            ResourceClass::StaticAsset | ResourceClass::ObjectStorage => Strategy::CacheFirst,
            ResourceClass::ApiRead => Strategy::StaleWhileRevalidate,
            ResourceClass::Other => Strategy::NetworkFirst,
        }
    }

    /// Name of the namespace, without version.
    pub(crate) fn name(&self) -> &'static str {
        match self {
            ResourceClass::Navigation => "pages",
            ResourceClass::StaticAsset => "static",
            ResourceClass::ApiRead => "api",
            ResourceClass::ObjectStorage => "objects",
            ResourceClass::Other => "runtime",
        }
    }
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the predicates look at.
pub(crate) struct RouteTarget<'a> {
    pub(crate) method: &'a Method,
    pub(crate) url: &'a Url,
    pub(crate) destination: Destination,
}

#[derive(Debug, Clone)]
pub(crate) struct RouteRules {
    pub(crate) app_origin: Url,
    pub(crate) api_prefix: String,
    pub(crate) storage_hosts: Vec<String>,
}

type Predicate = fn(&RouteTarget<'_>, &RouteRules) -> bool;

const STATIC_EXTENSIONS: &[&str] = &[
    "js", "mjs", "css", "png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "woff", "woff2", "ttf",
    "otf", "webmanifest",
];

/// Evaluated top to bottom; the first match wins.
const ROUTES: [(Predicate, ResourceClass); 5] = [
    (is_navigation, ResourceClass::Navigation),
    (is_static_asset, ResourceClass::StaticAsset),
    (is_api_read, ResourceClass::ApiRead),
    (is_object_storage, ResourceClass::ObjectStorage),
    (matches_any, ResourceClass::Other),
];

impl RouteRules {
    pub(crate) fn classify(&self, target: &RouteTarget<'_>) -> ResourceClass {
        ROUTES
            .iter()
            .find(|(matches, _)| matches(target, self))
            .map(|(_, class)| *class)
            .unwrap_or(ResourceClass::Other)
    }

    fn is_app_origin(&self, url: &Url) -> bool {
        url.origin() == self.app_origin.origin()
    }
}

fn is_navigation(target: &RouteTarget<'_>, _rules: &RouteRules) -> bool {
    target.destination == Destination::Document
}

fn is_static_asset(target: &RouteTarget<'_>, rules: &RouteRules) -> bool {
    if !rules.is_app_origin(target.url) {
        return false;
    }
    let Some(file_name) = target.url.path_segments().and_then(|mut segments| segments.next_back())
    else {
        return false;
    };
    if file_name == "manifest.json" {
        return true;
    }
    file_name
        .rsplit_once('.')
        .is_some_and(|(_, extension)| {
            STATIC_EXTENSIONS
                .iter()
                .any(|known| extension.eq_ignore_ascii_case(known))
        })
}

fn is_api_read(target: &RouteTarget<'_>, rules: &RouteRules) -> bool {
    *target.method == Method::GET
        && rules.is_app_origin(target.url)
        && target.url.path().starts_with(&rules.api_prefix)
}

fn matches_any(_target: &RouteTarget<'_>, _rules: &RouteRules) -> bool {
    true
}

fn is_object_storage(target: &RouteTarget<'_>, rules: &RouteRules) -> bool {
    target
        .url
        .host_str()
        .is_some_and(|host| rules.storage_hosts.iter().any(|known| known == host))
}
