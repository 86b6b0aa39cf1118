// SPDX-FileCopyrightText: 2023 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Client for the inventory REST API

use std::{sync::Arc, time::Duration};

use reqwest::header::{CONTENT_TYPE, HeaderValue};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

pub use reqwest::Method;

pub use request::{ApiRequest, ApiResponse};
pub use transport::{
    Rejection, RequestSender, ResilientTransport, RetryPolicy, SendError, Transport,
    TransportOutcome,
};

mod metadata;
mod request;
mod transport;

/// Header carrying the locally generated id of a replayed mutation.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Errors that can occur when creating an API client.
#[derive(Error, Debug)]
pub enum ApiClientInitError {
    #[error("Invalid URL {0}")]
    InvalidUrl(String),
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),
}

/// ApiClient is a thin wrapper around a [`reqwest::Client`].
///
/// Relative request URLs are resolved against the base URL of the API. Internally, connections are
/// pooled by reqwest, so the client is cheap to clone.
#[derive(Debug, Clone)]
pub struct ApiClient {
    inner: Arc<ApiClientInner>,
}

#[derive(Debug)]
struct ApiClientInner {
    http: reqwest::Client,
    base_url: Url,
}

impl ApiClient {
    pub fn with_endpoint(url: &Url, request_timeout: Duration) -> Result<Self, ApiClientInitError> {
        info!(%url, "Creating API client");
        if url.cannot_be_a_base() {
            return Err(ApiClientInitError::InvalidUrl(url.to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(metadata::USER_AGENT.as_str())
            .build()?;
        // relative request paths resolve below the base path only if it ends with a slash
        let mut base_url = url.clone();
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self {
            inner: Arc::new(ApiClientInner { http, base_url }),
        })
    }

    pub fn new(url: &str, request_timeout: Duration) -> Result<Self, ApiClientInitError> {
        let url: Url = url
            .parse()
            .map_err(|_| ApiClientInitError::InvalidUrl(url.to_owned()))?;
        Self::with_endpoint(&url, request_timeout)
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    /// Resolves a request URL against the base URL.
    pub fn resolve(&self, url: &str) -> Result<Url, url::ParseError> {
        self.inner.base_url.join(url)
    }

    /// Sends a single request without any retries.
    async fn send_once(&self, request: &ApiRequest) -> Result<ApiResponse, SendError> {
        let url = self
            .resolve(&request.url)
            .map_err(|error| SendError::InvalidRequest(format!("{}: {error}", request.url)))?;
        debug!(method = %request.method, %url, "sending request");

        let mut builder = self.inner.http.request(request.method.clone(), url);
        if let Some(key) = &request.idempotency_key {
            builder = builder.header(IDEMPOTENCY_KEY_HEADER, key);
        }
        if let Some(body) = &request.body {
            builder = builder
                .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                .body(body.to_string());
        }
        let response = builder.send().await.map_err(SendError::from_reqwest)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_owned())))
            .collect();
        let body = response.bytes().await.map_err(SendError::from_reqwest)?;
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod test {
    use fieldcommon::{
        identifiers::ItemId,
        mutations::{ItemChanges, ItemUpdate, MovementDirection, MutationPayload, StockMovement},
    };

    use super::*;

    fn resolve_write(base_url: &str, payload: impl Into<MutationPayload>) -> String {
        let client = ApiClient::new(base_url, Duration::from_secs(1)).unwrap();
        let write = payload.into().remote_write().unwrap();
        client.resolve(&ApiRequest::from(write).url).unwrap().to_string()
    }

    #[test]
    fn writes_resolve_below_base_path() {
        let movement = StockMovement {
            item_id: ItemId::new("drill"),
            quantity: 1,
            direction: MovementDirection::In,
            note: None,
        };
        for base_url in ["https://inv.example.com/v2", "https://inv.example.com/v2/"] {
            assert_eq!(
                resolve_write(base_url, movement.clone()),
                "https://inv.example.com/v2/api/stock-movements"
            );
        }
        assert_eq!(
            resolve_write("https://inv.example.com", movement),
            "https://inv.example.com/api/stock-movements"
        );
    }

    #[test]
    fn item_id_cannot_leave_items_collection() {
        let update = ItemUpdate {
            item_id: ItemId::new("../../admin/users?x="),
            changes: ItemChanges::default(),
        };
        assert_eq!(
            resolve_write("https://inv.example.com/v2/", update),
            "https://inv.example.com/v2/api/items/..%2F..%2Fadmin%2Fusers%3Fx%3D"
        );
    }
}
