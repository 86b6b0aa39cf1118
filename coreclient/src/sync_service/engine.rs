// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use fieldapiclient::{ApiRequest, Rejection, ResilientTransport, Transport, TransportOutcome};
use fieldcommon::mutations::PayloadError;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::mutation_queue::{
    MutationQueue, MutationStatus, MutationStore, QueueError, QueuedMutation,
};

use super::report::{RejectedMutation, SyncReport, SyncTrigger};

/// A drain pass stopped by a failure of the local storage.
#[derive(Debug, Error)]
#[error("Drain pass aborted: {source}")]
pub struct DrainAborted {
    /// What the pass did before it was aborted
    pub report: SyncReport,
    #[source]
    pub source: QueueError,
}

/// Replays queued mutations against the remote API.
///
/// Mutations are submitted one at a time in queue order. Reordering would change intermediate
/// stock levels, and a just recovered backend should not be hit with a burst. The engine only
/// reacts to the three-way [`TransportOutcome`]; HTTP details are the transport's business.
#[derive(Debug, Clone)]
pub struct SyncEngine<Q = MutationQueue, T = ResilientTransport> {
    queue: Q,
    transport: T,
}

impl<Q: MutationStore, T: Transport> SyncEngine<Q, T> {
    pub fn new(queue: Q, transport: T) -> Self {
        Self { queue, transport }
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    /// Runs one drain pass over a snapshot of the pending mutations.
    ///
    /// The pass always runs to completion. Mutations appended meanwhile are left for the next
    /// pass. Mutations in flight in a concurrent pass are skipped, so no mutation is ever
    /// submitted twice at the same time.
    ///
    /// Only failures of the local storage abort the pass; per-mutation failures are aggregated in
    /// the returned report. An aborted pass still reports what it did before the failure.
    pub async fn drain_once(&self, trigger: SyncTrigger) -> Result<SyncReport, DrainAborted> {
        let mut report = SyncReport::new(trigger);
        if let Err(source) = self.drain_snapshot(&mut report).await {
            return Err(DrainAborted { report, source });
        }

        if !report.is_empty() {
            info!(
                ?trigger,
                success = report.success_count,
                failure = report.failure_count,
                "{}",
                report.summary()
            );
        }
        Ok(report)
    }

    async fn drain_snapshot(&self, report: &mut SyncReport) -> Result<(), QueueError> {
        let snapshot = self.queue.list_pending().await?;
        debug!(trigger = ?report.trigger, pending = snapshot.len(), "starting drain pass");

        for mutation in snapshot {
            if mutation.status == MutationStatus::InFlight
                || !self.queue.mark_in_flight(mutation.id).await?
            {
                debug!(id = %mutation.id, "mutation owned by another pass; skipping");
                report.skipped_in_flight += 1;
                continue;
            }

            if let Err(error) = self.replay(&mutation, report).await {
                // best effort: leave the mutation to the next pass instead of the next restart
                if let Err(release_error) = self.queue.clear_in_flight(mutation.id).await {
                    warn!(id = %mutation.id, %release_error, "failed to release mutation");
                }
                return Err(error);
            }
        }
        Ok(())
    }

    /// Submits a claimed mutation and settles it in the queue according to the outcome.
    async fn replay(
        &self,
        mutation: &QueuedMutation,
        report: &mut SyncReport,
    ) -> Result<(), QueueError> {
        match self.submit(mutation).await {
            TransportOutcome::Success(_) => {
                debug!(id = %mutation.id, "mutation acknowledged");
                self.queue.remove(mutation.id).await?;
                report.record_success();
            }
            TransportOutcome::PermanentReject(rejection) => {
                error!(
                    id = %mutation.id,
                    status = ?rejection.status,
                    reason = %rejection.reason,
                    "mutation rejected; dropping"
                );
                self.queue.remove(mutation.id).await?;
                report.record_rejection(RejectedMutation {
                    id: mutation.id,
                    kind: mutation.resource_kind(),
                    reason: rejection.reason,
                });
            }
            TransportOutcome::TransientExhausted(reason) => {
                warn!(id = %mutation.id, %reason, "failed to submit mutation; will retry later");
                self.queue
                    .record_transient_failure(mutation.id, &reason)
                    .await?;
                self.queue.clear_in_flight(mutation.id).await?;
                report.record_retained();
            }
        }
        Ok(())
    }

    async fn submit(&self, mutation: &QueuedMutation) -> TransportOutcome {
        match replay_request(mutation) {
            Ok(request) => self.transport.execute(&request).await,
            // queued before validation existed, or not replayable at all
            Err(error) => TransportOutcome::PermanentReject(Rejection {
                status: None,
                reason: error.to_string(),
                response: None,
            }),
        }
    }
}

fn replay_request(mutation: &QueuedMutation) -> Result<ApiRequest, PayloadError> {
    let request = ApiRequest::from(mutation.payload.remote_write()?);
    Ok(request.with_idempotency_key(mutation.id))
}
