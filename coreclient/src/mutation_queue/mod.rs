// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable, ordered store of writes which were not yet acknowledged by the server.
//!
//! Mutations are appended synchronously with the user action producing them, independent of the
//! network state. They are replayed in insertion order and removed only after the server
//! acknowledged them (or permanently rejected them).

use chrono::{DateTime, Utc};
use fieldcommon::{
    identifiers::MutationId,
    mutations::{MutationPayload, PayloadError, ResourceKind},
};
use thiserror::Error;

pub use persistence::MutationQueue;

mod persistence;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Pending,
    /// A drain pass is currently submitting the mutation. Never survives a restart.
    InFlight,
    /// The stored payload can no longer be decoded; the mutation is quarantined.
    Failed,
}

impl MutationStatus {
    pub(crate) fn repr(&self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::InFlight => "in_flight",
            MutationStatus::Failed => "failed",
        }
    }
}

/// One pending write.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMutation {
    pub id: MutationId,
    pub payload: MutationPayload,
    pub created_at: DateTime<Utc>,
    pub status: MutationStatus,
    /// Number of drain passes which gave up on this mutation due to transient failures
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl QueuedMutation {
    pub fn new(payload: impl Into<MutationPayload>) -> Self {
        Self {
            id: MutationId::random(),
            payload: payload.into(),
            created_at: Utc::now(),
            status: MutationStatus::Pending,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn resource_kind(&self) -> ResourceKind {
        self.payload.kind()
    }
}

/// A stored mutation which could not be decoded anymore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedMutation {
    pub id: MutationId,
    pub resource_kind: String,
    pub created_at: DateTime<Utc>,
    pub reason: String,
}

/// Data for displaying "N items pending since ...".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingSummary {
    pub count: usize,
    pub oldest_created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// Local persistence is inaccessible; the requested action must be reported as dropped.
    #[error("Local storage unavailable: {0}")]
    StorageUnavailable(#[from] sqlx::Error),
    #[error("Failed to encode mutation: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("Invalid mutation: {0}")]
    InvalidPayload(#[from] PayloadError),
}

/// Queue operations needed to drain pending mutations.
pub trait MutationStore: Send + Sync + 'static {
    fn append(
        &self,
        mutation: QueuedMutation,
    ) -> impl Future<Output = Result<MutationId, QueueError>> + Send;

    /// All mutations not yet acknowledged, oldest first. Includes in-flight mutations.
    fn list_pending(&self) -> impl Future<Output = Result<Vec<QueuedMutation>, QueueError>> + Send;

    /// Idempotent.
    fn remove(&self, id: MutationId) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Claims a pending mutation for submission.
    ///
    /// Returns `false` if the mutation is not pending anymore, i.e. it is in flight in another
    /// drain pass or already removed.
    fn mark_in_flight(&self, id: MutationId)
    -> impl Future<Output = Result<bool, QueueError>> + Send;

    fn clear_in_flight(&self, id: MutationId) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Remembers why a submission failed transiently. Does not change the status.
    fn record_transient_failure(
        &self,
        id: MutationId,
        reason: &str,
    ) -> impl Future<Output = Result<(), QueueError>> + Send;
}
