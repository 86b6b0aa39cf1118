// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use bytes::Bytes;
use fieldcommon::mutations::{RemoteWrite, WriteMethod};
use reqwest::Method;
use serde::de::DeserializeOwned;
use url::form_urlencoded;

/// A request against the remote API or any other HTTP origin.
///
/// The request is owned and cloneable: retries re-issue exactly the same request.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    /// Absolute URL, or a URL reference resolved against the client's base URL
    ///
    /// Relative paths resolve below the base path, paths starting with `/` against its origin.
    pub url: String,
    pub body: Option<serde_json::Value>,
    pub idempotency_key: Option<String>,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
            idempotency_key: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl ToString) -> Self {
        self.idempotency_key = Some(key.to_string());
        self
    }
}

impl From<RemoteWrite> for ApiRequest {
    fn from(write: RemoteWrite) -> Self {
        let method = match write.method {
            WriteMethod::Post => Method::POST,
            WriteMethod::Patch => Method::PATCH,
        };
        Self::new(method, api_path(&write.path)).with_body(write.body)
    }
}

/// Joins path segments into a path relative to the API base URL.
///
/// Each segment is percent-encoded, so ids containing `/`, `?` or `#` stay a single segment.
fn api_path(segments: &[String]) -> String {
    segments
        .iter()
        .map(|segment| {
            // form encoding turns spaces into `+` and encodes a literal `+` as `%2B`
            form_urlencoded::byte_serialize(segment.as_bytes())
                .collect::<String>()
                .replace('+', "%20")
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// A fully received HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    /// Best effort extraction of a human readable error reason from the body.
    ///
    /// Understands `{"error": ".."}` and `{"message": ".."}`; falls back to the status code.
    pub fn error_reason(&self) -> String {
        #[derive(serde::Deserialize)]
        struct ErrorBody {
            error: Option<String>,
            message: Option<String>,
        }

        match self.json::<ErrorBody>() {
            Ok(ErrorBody {
                error: Some(reason),
                ..
            })
            | Ok(ErrorBody {
                message: Some(reason),
                ..
            }) => reason,
            _ => format!("HTTP {}", self.status),
        }
    }
}

#[cfg(test)]
mod test {
    use fieldcommon::{
        identifiers::ItemId,
        mutations::{MovementDirection, MutationPayload, StockMovement},
    };
    use serde_json::json;

    use super::*;

    #[test]
    fn remote_write_becomes_request() {
        let payload = MutationPayload::from(StockMovement {
            item_id: ItemId::new("a"),
            quantity: 1,
            direction: MovementDirection::In,
            note: None,
        });
        let request = ApiRequest::from(payload.remote_write().unwrap());
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.url, "api/stock-movements");
        assert_eq!(
            request.body,
            Some(json!({ "item_id": "a", "quantity": 1, "direction": "in" }))
        );
        assert_eq!(request.idempotency_key, None);
    }

    #[test]
    fn path_segments_are_encoded() {
        let segments = ["api", "items", "../../admin/users?x=", "drill 7+"].map(str::to_owned);
        assert_eq!(
            api_path(&segments),
            "api/items/..%2F..%2Fadmin%2Fusers%3Fx%3D/drill%207%2B"
        );
    }

    #[test]
    fn error_reason_prefers_body() {
        let response = ApiResponse::new(422, r#"{"error": "quantity exceeds stock"}"#);
        assert_eq!(response.error_reason(), "quantity exceeds stock");

        let response = ApiResponse::new(404, r#"{"message": "item not found"}"#);
        assert_eq!(response.error_reason(), "item not found");

        let response = ApiResponse::new(401, "<html>nope</html>");
        assert_eq!(response.error_reason(), "HTTP 401");
    }

    #[test]
    fn header_lookup_ignores_case() {
        let mut response = ApiResponse::new(200, "");
        response
            .headers
            .push(("Content-Type".to_owned(), "text/html".to_owned()));
        assert_eq!(response.header("content-type"), Some("text/html"));
        assert_eq!(response.header("etag"), None);
    }
}
