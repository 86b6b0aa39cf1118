// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use pin_project::pin_project;
use tokio::sync::{broadcast, watch};
use tokio_stream::{Stream, StreamExt, wrappers::BroadcastStream};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, error};

use crate::mutation_queue::{MutationQueue, MutationStore};

use fieldapiclient::{ResilientTransport, Transport};

pub use engine::{DrainAborted, SyncEngine};
pub use report::{RejectedMutation, SyncReport, SyncTrigger};

mod engine;
mod report;

const REPORTS_CAPACITY: usize = 16;

/// A service which drains the mutation queue in the background.
///
/// The service starts a background task which runs drain passes. The initial state of the service
/// is `Stopped`, that is, the background task is not running. The background task only runs when
/// the service is started, and when it is triggered while started. Triggers arriving during a pass
/// are coalesced into a single follow-up pass.
///
/// Stopping never interrupts a pass which is already running: the pass finishes and its report is
/// published, no further passes are started.
#[derive(Debug)]
pub struct SyncService<C: SyncWork = SyncContext> {
    context: C,
    run_token_tx: watch::Sender<RunToken>,
}

pub trait SyncWork: Clone + Send + 'static {
    fn work(&self, trigger: SyncTrigger) -> impl Future<Output = ()> + Send;
}

impl<Q, T> SyncWork for SyncContext<Q, T>
where
    Q: MutationStore + Clone,
    T: Transport + Clone,
{
    async fn work(&self, trigger: SyncTrigger) {
        SyncContext::work(self, trigger).await;
    }
}

impl<Q, T> SyncService<SyncContext<Q, T>>
where
    Q: MutationStore + Clone,
    T: Transport + Clone,
{
    pub fn new(engine: SyncEngine<Q, T>) -> Self {
        let (reports_tx, _) = broadcast::channel(REPORTS_CAPACITY);
        Self::with_context(SyncContext { engine, reports_tx })
    }

    /// Reports of all future non-empty drain passes.
    ///
    /// A subscriber lagging behind more than a few passes misses the oldest reports.
    pub fn subscribe_reports(&self) -> impl Stream<Item = SyncReport> + Send + Unpin + 'static {
        BroadcastStream::new(self.context.reports_tx.subscribe()).filter_map(|report| report.ok())
    }

    pub fn engine(&self) -> &SyncEngine<Q, T> {
        &self.context.engine
    }
}

impl<C: SyncWork> SyncService<C> {
    fn with_context(context: C) -> Self {
        let (run_token_tx, run_token_rx) = watch::channel(RunToken::new_cancelled());
        let task = SyncTask {
            context: context.clone(),
        };
        tokio::spawn(task.run(run_token_rx));
        Self {
            context,
            run_token_tx,
        }
    }

    /// Starts the background task and requests a drain pass.
    ///
    /// Returns a future which finishes when the background task is done.
    pub fn start(&self, trigger: SyncTrigger) -> WaitForDoneFuture {
        let mut done_token = None;
        self.run_token_tx.send_if_modified(|run_token| {
            if !run_token.rotate() {
                run_token.rotate_done();
            }
            run_token.trigger = trigger;
            done_token = Some(run_token.done.clone());
            true // notify the background task
        });
        debug!(?trigger, "starting background task");
        WaitForDoneFuture::new(done_token)
    }

    /// Stops the background task after the currently running pass, if any.
    ///
    /// Returns a futures which resolves when the background task is idle.
    pub fn stop(&self) -> WaitForDoneFuture {
        let mut done_token = None;
        self.run_token_tx.send_if_modified(|run_token| {
            run_token.cancel();
            done_token = Some(run_token.done.clone());
            false // no more work => no need to wake up the background task
        });
        debug!("stopping background task");
        WaitForDoneFuture::new(done_token)
    }

    /// Requests a drain pass if the service is started. Otherwise, does nothing.
    pub fn trigger(&self, trigger: SyncTrigger) -> WaitForDoneFuture {
        let mut done_token = None;
        let notified = self.run_token_tx.send_if_modified(|run_token| {
            if run_token.is_cancelled() {
                false
            } else {
                run_token.rotate_done();
                run_token.trigger = trigger;
                done_token = Some(run_token.done.clone());
                true
            }
        });
        debug!(?trigger, ?notified, "notifying background task about new work");
        WaitForDoneFuture::new(done_token)
    }

    pub fn is_running(&self) -> bool {
        !self.run_token_tx.borrow().is_cancelled()
    }

    /// Runs a single drain pass and waits until it is done.
    ///
    /// If a pass is already running, just waits until it is done.
    ///
    /// The service is stopped in any case.
    pub async fn run_once(&self, trigger: SyncTrigger) {
        self.start(trigger).await;
        self.stop().await;
    }
}

struct SyncTask<C> {
    context: C,
}

impl<C: SyncWork> SyncTask<C> {
    async fn run(self, mut run_token_rx: watch::Receiver<RunToken>) {
        loop {
            if run_token_rx.changed().await.is_err() {
                break;
            }

            let run_token = {
                let current = run_token_rx.borrow_and_update();
                // while the cell is borrowed, no trigger can join this pass anymore
                current.mark_as_started();
                current.clone()
            };
            debug!(?run_token, "incoming work notification");

            if run_token.is_cancelled() {
                run_token.mark_as_done();
                continue;
            }

            debug!(trigger = ?run_token.trigger, "starting drain pass in background task");
            self.context.work(run_token.trigger).await;
            debug!("finished drain pass in background task");

            run_token.mark_as_done();
        }
    }
}

/// Drains the queue with the engine and publishes the reports.
#[derive(Debug, Clone)]
pub struct SyncContext<Q = MutationQueue, T = ResilientTransport> {
    engine: SyncEngine<Q, T>,
    reports_tx: broadcast::Sender<SyncReport>,
}

impl<Q: MutationStore, T: Transport> SyncContext<Q, T> {
    async fn work(&self, trigger: SyncTrigger) {
        let report = match self.engine.drain_once(trigger).await {
            Ok(report) => report,
            Err(DrainAborted { report, source }) => {
                error!(error = %source, "Failed to drain mutation queue");
                report
            }
        };
        if !report.is_empty() {
            // no subscribers is fine
            let _ = self.reports_tx.send(report);
        }
    }
}

/// A token send to the background task as work permit.
///
/// The token is stored in a [`tokio::sync::watch`] cell. Whenever the token is updated, the
/// background task is woken up and uses the token to start a pass (if it is not running one yet).
/// A cancelled token prevents further passes but does not interrupt a running one.
///
/// The `done` token is *shared* between the callers and the background task. The background task
/// uses it to mark the work as done. In case the run token is created but immediately cancelled
/// such that the background task never receives it, the done token is cancelled too.
///
/// Each pass has its own `done` token. Once the background task picked up a token, it marks it
/// as started; later triggers get a fresh `done` token resolved by the follow-up pass.
#[derive(Debug, Default, Clone)]
struct RunToken {
    cancel: CancellationToken,
    done: CancellationToken,
    started: CancellationToken,
    /// Latest trigger; earlier ones are coalesced
    trigger: SyncTrigger,
}

impl RunToken {
    fn new() -> Self {
        Default::default()
    }

    fn new_cancelled() -> Self {
        let run_token = RunToken::new();
        run_token.cancel();
        run_token.mark_as_done();
        run_token
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn rotate(&mut self) -> bool {
        if self.is_cancelled() {
            *self = RunToken::new();
            true
        } else {
            false
        }
    }

    fn rotate_done(&mut self) -> bool {
        if self.done.is_cancelled() || self.started.is_cancelled() {
            self.done = CancellationToken::new();
            self.started = CancellationToken::new();
            true
        } else {
            false
        }
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }

    fn mark_as_started(&self) {
        self.started.cancel();
    }

    fn mark_as_done(&self) {
        self.done.cancel();
    }
}

/// A future that resolves when the background task is done.
///
/// Not `must_use`: callers usually fire a trigger and move on.
#[pin_project]
pub struct WaitForDoneFuture {
    #[pin]
    done_fut: Option<WaitForCancellationFutureOwned>,
}

impl WaitForDoneFuture {
    fn new(done: Option<CancellationToken>) -> Self {
        Self {
            done_fut: done.map(|done| done.cancelled_owned()),
        }
    }
}

impl Future for WaitForDoneFuture {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project().done_fut.as_pin_mut() {
            Some(fut) => fut.poll(cx),
            None => Poll::Ready(()),
        }
    }
}
