// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use fieldcommon::{identifiers::MutationId, mutations::ResourceKind};

/// What caused a drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncTrigger {
    #[default]
    AppStartup,
    AppForeground,
    ConnectivityRestored,
    UserRequest,
    MutationEnqueued,
}

/// A mutation the server refused for domain reasons. It was removed from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedMutation {
    pub id: MutationId,
    pub kind: ResourceKind,
    pub reason: String,
}

/// Aggregate outcome of one drain pass.
///
/// Surfaced to the user as a single notification instead of one per mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub trigger: SyncTrigger,
    pub success_count: usize,
    /// Rejected plus retained mutations
    pub failure_count: usize,
    /// Mutations skipped because another pass is submitting them
    pub skipped_in_flight: usize,
    pub rejected: Vec<RejectedMutation>,
}

impl SyncReport {
    pub(crate) fn new(trigger: SyncTrigger) -> Self {
        Self {
            trigger,
            ..Default::default()
        }
    }

    pub fn attempted(&self) -> usize {
        self.success_count + self.failure_count
    }

    /// Mutations which failed transiently and stay queued for the next pass.
    pub fn retained(&self) -> usize {
        self.failure_count - self.rejected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempted() == 0
    }

    pub fn summary(&self) -> String {
        format!(
            "Synchronized {} of {} items",
            self.success_count,
            self.attempted()
        )
    }

    pub(crate) fn record_success(&mut self) {
        self.success_count += 1;
    }

    pub(crate) fn record_rejection(&mut self, rejected: RejectedMutation) {
        self.failure_count += 1;
        self.rejected.push(rejected);
    }

    pub(crate) fn record_retained(&mut self) {
        self.failure_count += 1;
    }
}
