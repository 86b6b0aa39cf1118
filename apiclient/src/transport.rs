// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Retrying transport which classifies the outcome of a remote call.
//!
//! Gateway-class failures (502, 503, 504) and failures without any response (connection refused,
//! timeouts, resets) are transient and retried with exponential backoff. Everything else is
//! permanent and returned immediately. Callers only ever see the final classification.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{ApiClient, ApiRequest, ApiResponse};

/// Failure to obtain any response for a single request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// No response was received: the remote is unreachable or did not answer in time.
    #[error("Remote unreachable: {0}")]
    Unreachable(String),
    /// The request could not be built; sending it again won't help.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl SendError {
    pub(crate) fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_builder() {
            Self::InvalidRequest(error.to_string())
        } else {
            Self::Unreachable(error.to_string())
        }
    }
}

/// Sends a single request, without retries.
pub trait RequestSender: Send + Sync + 'static {
    fn send(
        &self,
        request: &ApiRequest,
    ) -> impl Future<Output = Result<ApiResponse, SendError>> + Send;
}

impl RequestSender for ApiClient {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, SendError> {
        self.send_once(request).await
    }
}

/// Reason why the remote permanently refused a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// HTTP status, if the remote answered at all
    pub status: Option<u16>,
    pub reason: String,
    pub response: Option<ApiResponse>,
}

/// Final classification of a remote call after all retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOutcome {
    Success(ApiResponse),
    PermanentReject(Rejection),
    /// The remote kept failing transiently; contains the last failure reason.
    TransientExhausted(String),
}

/// Executes remote calls and classifies their outcome.
///
/// Never fails: every outcome is one of the [`TransportOutcome`] variants.
pub trait Transport: Send + Sync + 'static {
    fn execute(&self, request: &ApiRequest) -> impl Future<Output = TransportOutcome> + Send;
}

/// Backoff schedule for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Number of attempts after the initial one
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay inserted before the retry number `attempt` (counted from 1): `base * 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

const GATEWAY_STATUSES: [u16; 3] = [502, 503, 504];

enum Attempt {
    Success(ApiResponse),
    Transient(String),
    Permanent(Rejection),
}

fn classify(result: Result<ApiResponse, SendError>) -> Attempt {
    match result {
        Ok(response) if response.is_success() => Attempt::Success(response),
        Ok(response) if GATEWAY_STATUSES.contains(&response.status) => {
            Attempt::Transient(format!("HTTP {}", response.status))
        }
        Ok(response) => Attempt::Permanent(Rejection {
            status: Some(response.status),
            reason: response.error_reason(),
            response: Some(response),
        }),
        Err(SendError::Unreachable(reason)) => Attempt::Transient(reason),
        Err(SendError::InvalidRequest(reason)) => Attempt::Permanent(Rejection {
            status: None,
            reason,
            response: None,
        }),
    }
}

/// A [`Transport`] that retries transient failures of the wrapped [`RequestSender`].
///
/// The very same request is re-issued on each retry. This is safe as long as the caller does not
/// submit the same write concurrently, which the mutation queue guarantees.
#[derive(Debug, Clone)]
pub struct ResilientTransport<S = ApiClient> {
    sender: S,
    policy: RetryPolicy,
}

impl<S> ResilientTransport<S> {
    pub fn new(sender: S, policy: RetryPolicy) -> Self {
        Self { sender, policy }
    }
}

impl<S: RequestSender> Transport for ResilientTransport<S> {
    async fn execute(&self, request: &ApiRequest) -> TransportOutcome {
        let mut attempt = 0;
        loop {
            match classify(self.sender.send(request).await) {
                Attempt::Success(response) => return TransportOutcome::Success(response),
                Attempt::Permanent(rejection) => {
                    debug!(
                        url = %request.url,
                        status = ?rejection.status,
                        reason = %rejection.reason,
                        "request rejected"
                    );
                    return TransportOutcome::PermanentReject(rejection);
                }
                Attempt::Transient(reason) => {
                    if attempt >= self.policy.max_retries {
                        warn!(
                            url = %request.url,
                            %reason,
                            attempts = attempt + 1,
                            "giving up after transient failures"
                        );
                        return TransportOutcome::TransientExhausted(reason);
                    }
                    attempt += 1;
                    let delay = self.policy.delay_for(attempt);
                    warn!(
                        url = %request.url,
                        %reason,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure; retrying"
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
