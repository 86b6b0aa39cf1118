// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use chrono::{DateTime, Utc};
use fieldcommon::{
    identifiers::MutationId,
    mutations::{MutationPayload, PayloadError},
};
use sqlx::{
    Database, Decode, Encode, Sqlite, SqlitePool, Type, encode::IsNull, error::BoxDynError, query,
    query_as, query_scalar, sqlite::SqliteTypeInfo,
};
use tracing::{debug, error, info};

use super::{
    FailedMutation, MutationStatus, MutationStore, PendingSummary, QueueError, QueuedMutation,
};

/// [`MutationStore`] backed by the client's SQLite database.
///
/// Every operation writes through to the database, so once [`MutationStore::append`] returns the
/// mutation survives restarts until it is removed.
#[derive(Debug, Clone)]
pub struct MutationQueue {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct MutationRecord {
    mutation_id: MutationId,
    resource_kind: String,
    payload: String,
    created_at: DateTime<Utc>,
    status: MutationStatus,
    attempts: i64,
    last_error: Option<String>,
}

impl MutationRecord {
    fn into_mutation(self) -> Result<QueuedMutation, PayloadError> {
        let payload = MutationPayload::from_json(&self.resource_kind, &self.payload)?;
        Ok(QueuedMutation {
            id: self.mutation_id,
            payload,
            created_at: self.created_at,
            status: self.status,
            attempts: self.attempts.try_into().unwrap_or(u32::MAX),
            last_error: self.last_error,
        })
    }
}

impl MutationQueue {
    /// Loads the queue from storage.
    ///
    /// Mutations left in flight by an interrupted process are returned to pending: an interrupted
    /// attempt is indistinguishable from one that was never made.
    pub async fn open(pool: SqlitePool) -> Result<Self, QueueError> {
        let recovered = query("UPDATE mutation_queue SET status = ?1 WHERE status = ?2")
            .bind(MutationStatus::Pending)
            .bind(MutationStatus::InFlight)
            .execute(&pool)
            .await?
            .rows_affected();
        if recovered > 0 {
            info!(recovered, "Recovered interrupted mutations");
        }
        Ok(Self { pool })
    }

    pub async fn pending_summary(&self) -> Result<PendingSummary, QueueError> {
        let count: i64 = query_scalar("SELECT COUNT(*) FROM mutation_queue WHERE status != ?")
            .bind(MutationStatus::Failed)
            .fetch_one(&self.pool)
            .await?;
        let oldest_created_at: Option<DateTime<Utc>> = query_scalar(
            "SELECT created_at FROM mutation_queue
            WHERE status != ?
            ORDER BY seq ASC
            LIMIT 1",
        )
        .bind(MutationStatus::Failed)
        .fetch_optional(&self.pool)
        .await?;
        Ok(PendingSummary {
            count: count.try_into().unwrap_or_default(),
            oldest_created_at,
        })
    }

    /// Quarantined mutations, oldest first.
    pub async fn list_failed(&self) -> Result<Vec<FailedMutation>, QueueError> {
        let records = query_as::<_, MutationRecord>(
            "SELECT mutation_id, resource_kind, payload, created_at, status, attempts, last_error
            FROM mutation_queue
            WHERE status = ?
            ORDER BY seq ASC",
        )
        .bind(MutationStatus::Failed)
        .fetch_all(&self.pool)
        .await?;
        Ok(records
            .into_iter()
            .map(|record| FailedMutation {
                id: record.mutation_id,
                resource_kind: record.resource_kind,
                created_at: record.created_at,
                reason: record.last_error.unwrap_or_default(),
            })
            .collect())
    }

    /// Drops a quarantined mutation. Returns `false` if the mutation is not quarantined.
    pub async fn discard_failed(&self, id: MutationId) -> Result<bool, QueueError> {
        let discarded = query("DELETE FROM mutation_queue WHERE mutation_id = ?1 AND status = ?2")
            .bind(id)
            .bind(MutationStatus::Failed)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if discarded > 0 {
            info!(%id, "Discarded quarantined mutation");
        }
        Ok(discarded > 0)
    }

    async fn quarantine(&self, id: MutationId, reason: &str) -> Result<(), QueueError> {
        query("UPDATE mutation_queue SET status = ?1, last_error = ?2 WHERE mutation_id = ?3")
            .bind(MutationStatus::Failed)
            .bind(reason)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

impl MutationStore for MutationQueue {
    async fn append(&self, mutation: QueuedMutation) -> Result<MutationId, QueueError> {
        debug!(
            id = %mutation.id, kind = %mutation.resource_kind(), "Enqueueing mutation"
        );
        mutation.payload.validate()?;
        let payload = mutation.payload.to_json()?;
        query(
            "INSERT INTO mutation_queue
                (mutation_id, resource_kind, payload, created_at, status)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (mutation_id) DO NOTHING",
        )
        .bind(mutation.id)
        .bind(mutation.resource_kind().as_str())
        .bind(payload)
        .bind(mutation.created_at)
        .bind(MutationStatus::Pending)
        .execute(&self.pool)
        .await?;
        Ok(mutation.id)
    }

    async fn list_pending(&self) -> Result<Vec<QueuedMutation>, QueueError> {
        let records = query_as::<_, MutationRecord>(
            "SELECT mutation_id, resource_kind, payload, created_at, status, attempts, last_error
            FROM mutation_queue
            WHERE status IN (?1, ?2)
            ORDER BY seq ASC",
        )
        .bind(MutationStatus::Pending)
        .bind(MutationStatus::InFlight)
        .fetch_all(&self.pool)
        .await?;

        let mut mutations = Vec::with_capacity(records.len());
        for record in records {
            let id = record.mutation_id;
            match record.into_mutation() {
                Ok(mutation) => mutations.push(mutation),
                Err(error) => {
                    error!(%id, %error, "Failed to decode queued mutation; quarantining");
                    self.quarantine(id, &error.to_string()).await?;
                }
            }
        }
        Ok(mutations)
    }

    async fn remove(&self, id: MutationId) -> Result<(), QueueError> {
        query("DELETE FROM mutation_queue WHERE mutation_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_in_flight(&self, id: MutationId) -> Result<bool, QueueError> {
        let claimed = query(
            "UPDATE mutation_queue SET status = ?1
            WHERE mutation_id = ?2 AND status = ?3",
        )
        .bind(MutationStatus::InFlight)
        .bind(id)
        .bind(MutationStatus::Pending)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(claimed == 1)
    }

    async fn clear_in_flight(&self, id: MutationId) -> Result<(), QueueError> {
        query(
            "UPDATE mutation_queue SET status = ?1
            WHERE mutation_id = ?2 AND status = ?3",
        )
        .bind(MutationStatus::Pending)
        .bind(id)
        .bind(MutationStatus::InFlight)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_transient_failure(&self, id: MutationId, reason: &str) -> Result<(), QueueError> {
        query(
            "UPDATE mutation_queue
            SET attempts = attempts + 1, last_error = ?1
            WHERE mutation_id = ?2",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

impl Type<Sqlite> for MutationStatus {
    fn type_info() -> SqliteTypeInfo {
        <String as Type<Sqlite>>::type_info()
    }

    fn compatible(ty: &SqliteTypeInfo) -> bool {
        <String as Type<Sqlite>>::compatible(ty)
    }
}

impl<'r> Decode<'r, Sqlite> for MutationStatus {
    fn decode(value: <Sqlite as Database>::ValueRef<'r>) -> Result<Self, BoxDynError> {
        let s: &str = Decode::<Sqlite>::decode(value)?;
        match s {
            "pending" => Ok(MutationStatus::Pending),
            "in_flight" => Ok(MutationStatus::InFlight),
            "failed" => Ok(MutationStatus::Failed),
            _ => Err(format!("Unknown MutationStatus variant: {s}").into()),
        }
    }
}

impl<'q> Encode<'q, Sqlite> for MutationStatus {
    fn encode_by_ref(
        &self,
        buf: &mut <Sqlite as Database>::ArgumentBuffer<'q>,
    ) -> Result<IsNull, BoxDynError> {
        <&str as Encode<Sqlite>>::encode(self.repr(), buf)
    }
}

#[cfg(test)]
mod tests {
    use fieldcommon::{
        identifiers::ItemId,
        mutations::{MovementDirection, StockMovement},
    };

    use crate::utils::{
        init_test_tracing,
        persistence::{open_db, open_db_in_memory},
    };

    use super::*;

    fn movement(item: &str, quantity: u32) -> QueuedMutation {
        QueuedMutation::new(StockMovement {
            item_id: ItemId::new(item),
            quantity,
            direction: MovementDirection::In,
            note: None,
        })
    }

    async fn queue() -> anyhow::Result<MutationQueue> {
        init_test_tracing();
        let pool = open_db_in_memory().await?;
        Ok(MutationQueue::open(pool).await?)
    }

    async fn append_all(
        queue: &MutationQueue,
        mutations: &[QueuedMutation],
    ) -> anyhow::Result<Vec<MutationId>> {
        let mut ids = Vec::new();
        for mutation in mutations {
            ids.push(queue.append(mutation.clone()).await?);
        }
        Ok(ids)
    }

    fn ids(mutations: &[QueuedMutation]) -> Vec<MutationId> {
        mutations.iter().map(|mutation| mutation.id).collect()
    }

    #[tokio::test]
    async fn list_pending_preserves_insertion_order() -> anyhow::Result<()> {
        let queue = queue().await?;
        let mutations = [movement("a", 1), movement("b", 2), movement("a", 3)];
        let appended = append_all(&queue, &mutations).await?;

        let pending = queue.list_pending().await?;
        assert_eq!(ids(&pending), appended);
        assert_eq!(pending[2].payload, mutations[2].payload);
        assert!(
            pending
                .iter()
                .all(|mutation| mutation.status == MutationStatus::Pending)
        );
        Ok(())
    }

    #[tokio::test]
    async fn append_rejects_empty_movement() -> anyhow::Result<()> {
        let queue = queue().await?;
        let result = queue.append(movement("a", 0)).await;
        assert!(matches!(
            result,
            Err(QueueError::InvalidPayload(PayloadError::ZeroQuantity(_)))
        ));
        assert!(queue.list_pending().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn append_deduplicates_by_id() -> anyhow::Result<()> {
        let queue = queue().await?;
        let mutation = movement("a", 1);
        queue.append(mutation.clone()).await?;
        queue.append(mutation.clone()).await?;

        assert_eq!(ids(&queue.list_pending().await?), [mutation.id]);
        Ok(())
    }

    #[tokio::test]
    async fn restart_preserves_order_and_resets_in_flight() -> anyhow::Result<()> {
        init_test_tracing();
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("client.db");

        let mutations = [movement("a", 1), movement("b", 2), movement("c", 3)];
        let before = {
            let pool = open_db(&path).await?;
            let queue = MutationQueue::open(pool.clone()).await?;
            let appended = append_all(&queue, &mutations).await?;
            assert!(queue.mark_in_flight(appended[1]).await?);
            let before = queue.list_pending().await?;
            assert_eq!(before[1].status, MutationStatus::InFlight);
            pool.close().await;
            before
        };

        let pool = open_db(&path).await?;
        let queue = MutationQueue::open(pool).await?;
        let after = queue.list_pending().await?;

        assert_eq!(ids(&after), ids(&before));
        for (restored, original) in after.iter().zip(&mutations) {
            assert_eq!(restored.payload, original.payload);
            assert_eq!(restored.status, MutationStatus::Pending);
        }
        Ok(())
    }

    #[tokio::test]
    async fn remove_is_idempotent() -> anyhow::Result<()> {
        let queue = queue().await?;
        let appended = append_all(&queue, &[movement("a", 1), movement("b", 1)]).await?;

        queue.remove(appended[0]).await?;
        queue.remove(appended[0]).await?;
        queue.remove(MutationId::random()).await?;

        assert_eq!(ids(&queue.list_pending().await?), [appended[1]]);
        Ok(())
    }

    #[tokio::test]
    async fn in_flight_claim_is_exclusive() -> anyhow::Result<()> {
        let queue = queue().await?;
        let id = queue.append(movement("a", 1)).await?;

        assert!(queue.mark_in_flight(id).await?);
        assert!(!queue.mark_in_flight(id).await?);

        queue.clear_in_flight(id).await?;
        assert!(queue.mark_in_flight(id).await?);

        queue.remove(id).await?;
        assert!(!queue.mark_in_flight(id).await?);
        Ok(())
    }

    #[tokio::test]
    async fn transient_failure_is_recorded() -> anyhow::Result<()> {
        let queue = queue().await?;
        let id = queue.append(movement("a", 1)).await?;

        assert!(queue.mark_in_flight(id).await?);
        queue.record_transient_failure(id, "HTTP 504").await?;
        queue.clear_in_flight(id).await?;

        let pending = queue.list_pending().await?;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, MutationStatus::Pending);
        assert_eq!(pending[0].attempts, 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("HTTP 504"));
        Ok(())
    }

    #[tokio::test]
    async fn undecodable_mutation_is_quarantined() -> anyhow::Result<()> {
        let queue = queue().await?;
        let first = queue.append(movement("a", 1)).await?;
        let broken = MutationId::random();
        query(
            "INSERT INTO mutation_queue (mutation_id, resource_kind, payload, created_at)
            VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(broken)
        .bind("stock_movement")
        .bind("{not json")
        .bind(Utc::now())
        .execute(&queue.pool)
        .await?;
        let last = queue.append(movement("b", 1)).await?;

        assert_eq!(ids(&queue.list_pending().await?), [first, last]);
        // quarantined rows are not looked at again
        assert_eq!(ids(&queue.list_pending().await?), [first, last]);

        let failed = queue.list_failed().await?;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, broken);
        assert!(failed[0].reason.starts_with("Invalid payload"));

        assert!(!queue.discard_failed(first).await?);
        assert!(queue.discard_failed(broken).await?);
        assert!(queue.list_failed().await?.is_empty());
        assert_eq!(ids(&queue.list_pending().await?), [first, last]);
        Ok(())
    }

    #[tokio::test]
    async fn pending_summary_counts_unacknowledged() -> anyhow::Result<()> {
        let queue = queue().await?;
        assert_eq!(queue.pending_summary().await?, PendingSummary::default());

        let first = movement("a", 1);
        let appended = append_all(&queue, &[first.clone(), movement("b", 1)]).await?;
        queue.mark_in_flight(appended[1]).await?;

        let summary = queue.pending_summary().await?;
        assert_eq!(summary.count, 2);
        let oldest = summary.oldest_created_at.expect("oldest timestamp");
        assert_eq!(oldest.timestamp_millis(), first.created_at.timestamp_millis());
        Ok(())
    }

    #[tokio::test]
    async fn closed_storage_is_reported_as_unavailable() -> anyhow::Result<()> {
        let queue = queue().await?;
        queue.pool.close().await;

        let result = queue.append(movement("a", 1)).await;
        assert!(matches!(result, Err(QueueError::StorageUnavailable(_))));
        Ok(())
    }
}
