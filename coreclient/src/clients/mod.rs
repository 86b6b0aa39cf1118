// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;

use anyhow::Context;
use fieldapiclient::{ApiClient, ResilientTransport};
use fieldcommon::{
    identifiers::MutationId,
    mutations::{ItemUpdate, MutationPayload, StockMovement},
};
use tokio_stream::Stream;
use tracing::{debug, info};

use crate::{
    cache::{CacheError, CacheLayer, CacheResponse, FetchRequest},
    mutation_queue::{
        FailedMutation, MutationQueue, MutationStore, PendingSummary, QueueError, QueuedMutation,
    },
    settings::Settings,
    sync_service::{SyncEngine, SyncReport, SyncService, SyncTrigger, WaitForDoneFuture},
    utils::persistence::{open_db, open_db_in_memory},
};

/// Entry point of the UI layer into the offline-first data layer.
///
/// Writes are recorded locally first and replayed by the background sync service; reads go
/// through the cache layer. Cloning is cheap: all clones share the same queue, service and cache.
#[derive(Clone)]
pub struct FieldClient {
    inner: Arc<FieldClientInner>,
}

struct FieldClientInner {
    queue: MutationQueue,
    sync: SyncService,
    cache: CacheLayer,
}

impl FieldClient {
    /// Opens the queue and wires up transport, sync service and cache layer.
    ///
    /// The sync service is not started; call [`Self::start`] once the application is ready.
    pub async fn new(settings: &Settings) -> anyhow::Result<Self> {
        let pool = match &settings.database.path {
            Some(path) => open_db(path)
                .await
                .with_context(|| format!("Failed to open database at {}", path.display()))?,
            None => open_db_in_memory()
                .await
                .context("Failed to open in-memory database")?,
        };
        let queue = MutationQueue::open(pool)
            .await
            .context("Failed to open mutation queue")?;

        let api_client =
            ApiClient::with_endpoint(&settings.api.base_url, settings.api.request_timeout)
                .context("Failed to create API client")?;
        let transport = ResilientTransport::new(api_client, settings.retry.policy());

        let sync = SyncService::new(SyncEngine::new(queue.clone(), transport.clone()));
        let cache = CacheLayer::new(settings.cache_config(), transport);
        info!(
            base_url = %settings.api.base_url,
            cache_version = %cache.active_version(),
            "field client ready"
        );

        Ok(Self {
            inner: Arc::new(FieldClientInner { queue, sync, cache }),
        })
    }

    /// Records a stock movement for replay.
    ///
    /// Succeeds independent of connectivity. Fails if the movement is invalid (e.g. has no
    /// quantity) or if local storage is unavailable; in both cases nothing is queued.
    pub async fn record_stock_movement(
        &self,
        movement: StockMovement,
    ) -> Result<MutationId, QueueError> {
        self.record(movement.into()).await
    }

    pub async fn record_item_update(&self, update: ItemUpdate) -> Result<MutationId, QueueError> {
        self.record(update.into()).await
    }

    async fn record(&self, payload: MutationPayload) -> Result<MutationId, QueueError> {
        let id = self.inner.queue.append(QueuedMutation::new(payload)).await?;
        debug!(%id, "recorded mutation");
        self.inner.sync.trigger(SyncTrigger::MutationEnqueued);
        Ok(id)
    }

    /// Starts the background sync service with an initial drain pass.
    pub fn start(&self) -> WaitForDoneFuture {
        self.inner.sync.start(SyncTrigger::AppStartup)
    }

    /// Stops the background sync service after the running pass, if any.
    pub fn stop(&self) -> WaitForDoneFuture {
        self.inner.sync.stop()
    }

    pub fn sync_now(&self) -> WaitForDoneFuture {
        self.inner.sync.start(SyncTrigger::UserRequest)
    }

    pub fn on_foreground(&self) -> WaitForDoneFuture {
        self.inner.sync.start(SyncTrigger::AppForeground)
    }

    /// Has no effect while the sync service is stopped.
    pub fn on_connectivity_restored(&self) -> WaitForDoneFuture {
        self.inner.sync.trigger(SyncTrigger::ConnectivityRestored)
    }

    /// One report per drain pass which attempted at least one mutation.
    pub fn subscribe_reports(&self) -> impl Stream<Item = SyncReport> + Send + Unpin + 'static {
        self.inner.sync.subscribe_reports()
    }

    pub async fn pending_summary(&self) -> Result<PendingSummary, QueueError> {
        self.inner.queue.pending_summary().await
    }

    pub async fn list_pending(&self) -> Result<Vec<QueuedMutation>, QueueError> {
        self.inner.queue.list_pending().await
    }

    pub async fn list_failed(&self) -> Result<Vec<FailedMutation>, QueueError> {
        self.inner.queue.list_failed().await
    }

    pub async fn discard_failed(&self, id: MutationId) -> Result<bool, QueueError> {
        self.inner.queue.discard_failed(id).await
    }

    pub async fn fetch(&self, request: FetchRequest) -> Result<CacheResponse, CacheError> {
        self.inner.cache.fetch(request).await
    }

    /// Switches the cache to the namespaces of a new application version.
    pub async fn activate_cache(
        &self,
        version: &str,
        precache: &[FetchRequest],
    ) -> Result<(), CacheError> {
        self.inner.cache.activate(version, precache).await
    }

    pub fn cache(&self) -> &CacheLayer {
        &self.inner.cache
    }
}

#[cfg(test)]
mod test {
    use fieldcommon::{identifiers::ItemId, mutations::MovementDirection};

    use crate::utils::init_test_tracing;

    use super::*;

    fn settings(database: Option<&std::path::Path>) -> Settings {
        let mut yaml = "api:\n  base_url: http://127.0.0.1:9\nretry:\n  base_delay_ms: 1\n".to_owned();
        if let Some(path) = database {
            yaml.push_str(&format!("database:\n  path: {}\n", path.display()));
        }
        Settings::from_yaml(&yaml).unwrap()
    }

    fn movement(item: &str) -> StockMovement {
        StockMovement {
            item_id: ItemId::new(item),
            quantity: 2,
            direction: MovementDirection::Out,
            note: Some("aisle 4".to_owned()),
        }
    }

    #[tokio::test]
    async fn records_without_connectivity() -> anyhow::Result<()> {
        init_test_tracing();
        let client = FieldClient::new(&settings(None)).await?;

        let id = client.record_stock_movement(movement("drill")).await?;
        let pending = client.list_pending().await?;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(client.pending_summary().await?.count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_movement_is_not_recorded() -> anyhow::Result<()> {
        init_test_tracing();
        let client = FieldClient::new(&settings(None)).await?;

        let empty = StockMovement {
            quantity: 0,
            ..movement("drill")
        };
        let result = client.record_stock_movement(empty).await;
        assert!(matches!(result, Err(QueueError::InvalidPayload(_))));
        assert!(client.list_pending().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn recorded_mutations_survive_restart() -> anyhow::Result<()> {
        init_test_tracing();
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("queue.sqlite");

        let recorded = {
            let client = FieldClient::new(&settings(Some(&path))).await?;
            let first = client.record_stock_movement(movement("drill")).await?;
            let second = client.record_stock_movement(movement("saw")).await?;
            [first, second]
        };

        let client = FieldClient::new(&settings(Some(&path))).await?;
        let pending: Vec<_> = client
            .list_pending()
            .await?
            .into_iter()
            .map(|mutation| mutation.id)
            .collect();
        assert_eq!(pending, recorded);
        Ok(())
    }
}
