// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use fieldapiclient::{ApiRequest, Method};
use url::Url;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Destination {
    /// A document load caused by navigation
    Document,
    #[default]
    Subresource,
}

/// An outbound resource fetch passing through the cache layer.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub request: ApiRequest,
    pub destination: Destination,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        ApiRequest::get(url).into()
    }

    pub fn navigate(url: impl Into<String>) -> Self {
        Self {
            request: ApiRequest::get(url),
            destination: Destination::Document,
        }
    }
}

impl From<ApiRequest> for FetchRequest {
    fn from(request: ApiRequest) -> Self {
        Self {
            request,
            destination: Destination::Subresource,
        }
    }
}

/// Key of a response in its namespace: method and URL without fragment.
pub(crate) fn cache_key(method: &Method, url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    format!("{method} {url}")
}
