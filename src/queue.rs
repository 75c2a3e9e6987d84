//! Discovery Queue: the durable, priority-ordered mailbox between the
//! discovery stage and the research stage.
//!
//! Serving order is `priority DESC, enqueued_at ASC` with the insertion
//! sequence as a final tie-break, so equal-priority items are served FIFO
//! and never starved.
//!
//! Every operation is a single SQL statement (or a short read after one),
//! so no lock is ever held across a collaborator call. [`DiscoveryQueue::dequeue`]
//! selects and claims in one `UPDATE … RETURNING`, which SQLite executes
//! under its write lock: two concurrent callers can never claim the same row.
//! [`DiscoveryQueue::claim`] does the same for an explicit set of ids, and
//! [`DiscoveryQueue::transition`] only moves rows still in the expected status.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{PipelineError, Result};
use crate::models::{from_millis, to_millis, Discovery, ItemStatus, Payload, WorkItem, WorkKind};

const ITEM_COLUMNS: &str = "id, kind, payload_json, source_id, source_kind, priority, status, \
                            enqueued_at, claimed_at, updated_at";

const SERVING_ORDER: &str = "ORDER BY priority DESC, enqueued_at ASC, seq ASC";

/// Count and average priority for one status bucket.
#[derive(Debug, Clone, Serialize)]
pub struct StatusCount {
    pub status: ItemStatus,
    pub count: i64,
    pub avg_priority: f64,
}

/// Snapshot returned by [`DiscoveryQueue::stats`].
#[derive(Debug, Clone, Serialize, Default)]
pub struct QueueStats {
    pub by_status: Vec<StatusCount>,
    pub pending_by_kind: Vec<(WorkKind, i64)>,
}

impl QueueStats {
    pub fn count(&self, status: ItemStatus) -> i64 {
        self.by_status
            .iter()
            .find(|s| s.status == status)
            .map(|s| s.count)
            .unwrap_or(0)
    }

    pub fn total(&self) -> i64 {
        self.by_status.iter().map(|s| s.count).sum()
    }
}

pub struct DiscoveryQueue {
    pool: SqlitePool,
}

impl DiscoveryQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a discovery as a `pending` work item.
    ///
    /// Fails with [`PipelineError::Duplicate`] when the id was ever enqueued
    /// before, whatever its current status. The existing row is left as is.
    pub async fn enqueue(&self, discovery: &Discovery) -> Result<WorkItem> {
        if discovery.id.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "work item id must not be empty".to_string(),
            ));
        }
        if !(1..=10).contains(&discovery.priority) {
            return Err(PipelineError::InvalidInput(format!(
                "priority {} for '{}' is outside 1..=10",
                discovery.priority, discovery.id
            )));
        }

        let now = Utc::now();
        let payload_json = serde_json::to_string(&discovery.payload)?;

        let result = sqlx::query(
            r#"
            INSERT INTO discovery_queue (id, kind, payload_json, source_id, source_kind,
                                         priority, status, enqueued_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, 'pending', ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&discovery.id)
        .bind(discovery.kind.as_str())
        .bind(&payload_json)
        .bind(&discovery.source_id)
        .bind(discovery.source_kind.as_str())
        .bind(discovery.priority as i64)
        .bind(to_millis(now))
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let status: String =
                sqlx::query_scalar("SELECT status FROM discovery_queue WHERE id = ?")
                    .bind(&discovery.id)
                    .fetch_one(&self.pool)
                    .await?;
            return Err(PipelineError::Duplicate {
                id: discovery.id.clone(),
                status,
            });
        }

        tracing::debug!(
            id = %discovery.id,
            kind = %discovery.kind,
            priority = discovery.priority,
            "enqueued work item"
        );

        Ok(WorkItem {
            id: discovery.id.clone(),
            kind: discovery.kind,
            payload: discovery.payload.clone(),
            source_id: discovery.source_id.clone(),
            source_kind: discovery.source_kind,
            priority: discovery.priority,
            status: ItemStatus::Pending,
            enqueued_at: from_millis(to_millis(now)),
            claimed_at: None,
            updated_at: from_millis(to_millis(now)),
        })
    }

    /// Claim the next pending item in serving order.
    ///
    /// Returns [`PipelineError::Empty`] when nothing is pending.
    pub async fn dequeue(&self) -> Result<WorkItem> {
        let now = to_millis(Utc::now());
        let sql = format!(
            r#"
            UPDATE discovery_queue
            SET status = 'claimed', claimed_at = ?, updated_at = ?
            WHERE seq = (
                SELECT seq FROM discovery_queue
                WHERE status = 'pending'
                {SERVING_ORDER}
                LIMIT 1
            )
            RETURNING {ITEM_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(now)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let item = row_to_item(&row)?;
                tracing::debug!(id = %item.id, priority = item.priority, "claimed work item");
                Ok(item)
            }
            None => Err(PipelineError::Empty),
        }
    }

    /// The next `n` pending items in serving order. Read-only.
    pub async fn peek(&self, n: usize) -> Result<Vec<WorkItem>> {
        self.peek_page(n, 0).await
    }

    /// Up to `n` pending items in serving order, skipping the first `offset`.
    pub async fn peek_page(&self, n: usize, offset: usize) -> Result<Vec<WorkItem>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM discovery_queue WHERE status = 'pending' {SERVING_ORDER} LIMIT ? OFFSET ?"
        );
        let rows = sqlx::query(&sql)
            .bind(n as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_item).collect()
    }

    /// Claim the given ids, skipping any that are no longer pending.
    ///
    /// One `UPDATE … RETURNING`, so an id is handed to exactly one caller
    /// even when several controllers share the database. Returns the ids
    /// this call claimed, in the order they were passed.
    pub async fn claim(&self, ids: &[String]) -> Result<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let now = to_millis(Utc::now());
        let sql = format!(
            "UPDATE discovery_queue SET status = 'claimed', claimed_at = ?, updated_at = ? \
             WHERE status = 'pending' AND id IN ({}) RETURNING id",
            placeholders(ids.len())
        );
        let mut query = sqlx::query_scalar::<_, String>(&sql).bind(now).bind(now);
        for id in ids {
            query = query.bind(id);
        }
        let claimed = query.fetch_all(&self.pool).await?;

        if claimed.len() < ids.len() {
            tracing::debug!(
                requested = ids.len(),
                claimed = claimed.len(),
                "some items were already taken"
            );
        }
        Ok(ids.iter().filter(|id| claimed.contains(id)).cloned().collect())
    }

    /// Move the ids currently in `from` to `to`. Rows in any other status
    /// are left alone. Returns the ids that moved.
    pub async fn transition(
        &self,
        ids: &[String],
        from: ItemStatus,
        to: ItemStatus,
    ) -> Result<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "UPDATE discovery_queue SET status = ?, updated_at = ? \
             WHERE status = ? AND id IN ({}) RETURNING id",
            placeholders(ids.len())
        );
        let mut query = sqlx::query_scalar::<_, String>(&sql)
            .bind(to.as_str())
            .bind(to_millis(Utc::now()))
            .bind(from.as_str());
        for id in ids {
            query = query.bind(id);
        }
        let moved = query.fetch_all(&self.pool).await?;

        if moved.len() < ids.len() {
            tracing::warn!(
                from = %from,
                to = %to,
                requested = ids.len(),
                moved = moved.len(),
                "items changed status underneath us"
            );
        }
        Ok(ids.iter().filter(|id| moved.contains(id)).cloned().collect())
    }

    /// Return claims older than `older_than` to pending.
    ///
    /// A claim that outlives its run belongs to a controller that crashed
    /// or was killed mid-chunk.
    pub async fn release_stale(&self, older_than: Duration) -> Result<Vec<String>> {
        let now = Utc::now();
        let cutoff = to_millis(now) - older_than.as_millis() as i64;
        let released: Vec<String> = sqlx::query_scalar(
            "UPDATE discovery_queue SET status = 'pending', updated_at = ? \
             WHERE status = 'claimed' AND (claimed_at IS NULL OR claimed_at < ?) RETURNING id",
        )
        .bind(to_millis(now))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        if !released.is_empty() {
            tracing::warn!(count = released.len(), "released stale claims");
        }
        Ok(released)
    }

    /// Fetch one item by id, whatever its status.
    pub async fn get(&self, id: &str) -> Result<WorkItem> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM discovery_queue WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("work item {}", id)))?;
        row_to_item(&row)
    }

    /// Set an item's status and bump its `updated_at`.
    pub async fn update_status(&self, id: &str, status: ItemStatus) -> Result<()> {
        let result =
            sqlx::query("UPDATE discovery_queue SET status = ?, updated_at = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(to_millis(Utc::now()))
                .bind(id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::NotFound(format!("work item {}", id)));
        }
        Ok(())
    }

    pub async fn pending_count(&self) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM discovery_queue WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Counts grouped by status, and pending counts grouped by kind.
    pub async fn stats(&self) -> Result<QueueStats> {
        let status_rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS n, AVG(priority) AS avg_priority
            FROM discovery_queue
            GROUP BY status
            ORDER BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut by_status = Vec::with_capacity(status_rows.len());
        for row in &status_rows {
            let status: String = row.get("status");
            by_status.push(StatusCount {
                status: status.parse()?,
                count: row.get("n"),
                avg_priority: row.get::<Option<f64>, _>("avg_priority").unwrap_or(0.0),
            });
        }

        let kind_rows = sqlx::query(
            r#"
            SELECT kind, COUNT(*) AS n
            FROM discovery_queue
            WHERE status = 'pending'
            GROUP BY kind
            ORDER BY n DESC, kind
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut pending_by_kind = Vec::with_capacity(kind_rows.len());
        for row in &kind_rows {
            let kind: String = row.get("kind");
            pending_by_kind.push((kind.parse()?, row.get::<i64, _>("n")));
        }

        Ok(QueueStats {
            by_status,
            pending_by_kind,
        })
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn row_to_item(row: &SqliteRow) -> Result<WorkItem> {
    let kind: String = row.get("kind");
    let source_kind: String = row.get("source_kind");
    let status: String = row.get("status");
    let payload_json: String = row.get("payload_json");
    let payload: Payload = serde_json::from_str(&payload_json)?;
    let priority: i64 = row.get("priority");

    Ok(WorkItem {
        id: row.get("id"),
        kind: kind.parse()?,
        payload,
        source_id: row.get("source_id"),
        source_kind: source_kind.parse()?,
        priority: priority as u8,
        status: status.parse()?,
        enqueued_at: from_millis(row.get("enqueued_at")),
        claimed_at: row.get::<Option<i64>, _>("claimed_at").map(from_millis),
        updated_at: from_millis(row.get("updated_at")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::SourceKind;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn test_queue() -> (TempDir, DiscoveryQueue) {
        let tmp = TempDir::new().unwrap();
        let cfg = Config::minimal(tmp.path().join("queue.sqlite"));
        let pool = db::connect(&cfg).await.unwrap();
        migrate::migrate_pool(&pool).await.unwrap();
        (tmp, DiscoveryQueue::new(pool))
    }

    fn discovery(id: &str, priority: u8) -> Discovery {
        Discovery::new(id, WorkKind::Fact, format!("https://example.com/{}", id))
            .with_priority(priority)
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_keeps_first_record() {
        let (_tmp, queue) = test_queue().await;

        let mut first = discovery("tent-1", 4);
        first.payload.insert("name".into(), "Ultralight Tent".into());
        queue.enqueue(&first).await.unwrap();

        let second = discovery("tent-1", 9);
        let err = queue.enqueue(&second).await.unwrap_err();
        assert!(matches!(err, PipelineError::Duplicate { ref id, .. } if id == "tent-1"));

        let stored = queue.get("tent-1").await.unwrap();
        assert_eq!(stored.priority, 4);
        assert_eq!(stored.payload["name"], "Ultralight Tent");
        assert_eq!(queue.stats().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_rejected_after_terminal_status() {
        let (_tmp, queue) = test_queue().await;
        queue.enqueue(&discovery("a", 5)).await.unwrap();
        queue.update_status("a", ItemStatus::Committed).await.unwrap();

        let err = queue.enqueue(&discovery("a", 5)).await.unwrap_err();
        match err {
            PipelineError::Duplicate { status, .. } => assert_eq!(status, "committed"),
            other => panic!("expected duplicate, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dequeue_highest_priority_then_fifo() {
        let (_tmp, queue) = test_queue().await;
        queue.enqueue(&discovery("low", 2)).await.unwrap();
        queue.enqueue(&discovery("high-a", 8)).await.unwrap();
        queue.enqueue(&discovery("mid", 5)).await.unwrap();
        queue.enqueue(&discovery("high-b", 8)).await.unwrap();

        let order: Vec<String> = {
            let mut out = Vec::new();
            for _ in 0..4 {
                out.push(queue.dequeue().await.unwrap().id);
            }
            out
        };
        assert_eq!(order, vec!["high-a", "high-b", "mid", "low"]);

        assert!(matches!(queue.dequeue().await, Err(PipelineError::Empty)));
    }

    #[tokio::test]
    async fn test_dequeue_marks_claimed() {
        let (_tmp, queue) = test_queue().await;
        queue.enqueue(&discovery("x", 5)).await.unwrap();

        let claimed = queue.dequeue().await.unwrap();
        assert_eq!(claimed.status, ItemStatus::Claimed);
        assert!(claimed.claimed_at.is_some());

        let stored = queue.get("x").await.unwrap();
        assert_eq!(stored.status, ItemStatus::Claimed);
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_peek_does_not_mutate() {
        let (_tmp, queue) = test_queue().await;
        for (id, p) in [("a", 1), ("b", 10), ("c", 6)] {
            queue.enqueue(&discovery(id, p)).await.unwrap();
        }

        let ids: Vec<String> = queue.peek(2).await.unwrap().into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(queue.peek(10).await.unwrap().len(), 3);
        assert!(queue.peek(0).await.unwrap().is_empty());
        assert_eq!(queue.pending_count().await.unwrap(), 3);
        assert_eq!(queue.dequeue().await.unwrap().id, "b");
    }

    #[tokio::test]
    async fn test_peek_page_continues_past_offset() {
        let (_tmp, queue) = test_queue().await;
        for (id, p) in [("a", 9), ("b", 7), ("c", 5), ("d", 3)] {
            queue.enqueue(&discovery(id, p)).await.unwrap();
        }

        let ids = |items: Vec<WorkItem>| items.into_iter().map(|i| i.id).collect::<Vec<_>>();
        assert_eq!(ids(queue.peek_page(2, 0).await.unwrap()), vec!["a", "b"]);
        assert_eq!(ids(queue.peek_page(2, 2).await.unwrap()), vec!["c", "d"]);
        assert!(queue.peek_page(2, 4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_skips_items_already_taken() {
        let (_tmp, queue) = test_queue().await;
        for id in ["a", "b", "c"] {
            queue.enqueue(&discovery(id, 5)).await.unwrap();
        }
        queue.update_status("b", ItemStatus::Committed).await.unwrap();

        let ids: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let first = queue.claim(&ids).await.unwrap();
        assert_eq!(first, vec!["a", "c"]);
        assert!(queue.get("a").await.unwrap().claimed_at.is_some());

        // A second claimant gets nothing.
        assert!(queue.claim(&ids).await.unwrap().is_empty());
        assert_eq!(queue.get("b").await.unwrap().status, ItemStatus::Committed);
    }

    #[tokio::test]
    async fn test_concurrent_claims_are_disjoint() {
        let (_tmp, queue) = test_queue().await;
        let ids: Vec<String> = (0..20).map(|i| format!("item-{}", i)).collect();
        for id in &ids {
            queue.enqueue(&discovery(id, 5)).await.unwrap();
        }

        let (a, b) = tokio::join!(queue.claim(&ids), queue.claim(&ids));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.len() + b.len(), 20);
        assert!(a.iter().all(|id| !b.contains(id)));
    }

    #[tokio::test]
    async fn test_transition_only_moves_matching_status() {
        let (_tmp, queue) = test_queue().await;
        for id in ["a", "b"] {
            queue.enqueue(&discovery(id, 5)).await.unwrap();
        }
        let ids: Vec<String> = vec!["a".into(), "b".into()];
        queue.claim(&ids).await.unwrap();
        queue.update_status("b", ItemStatus::Committed).await.unwrap();

        let moved = queue
            .transition(&ids, ItemStatus::Claimed, ItemStatus::Pending)
            .await
            .unwrap();
        assert_eq!(moved, vec!["a"]);
        assert_eq!(queue.get("a").await.unwrap().status, ItemStatus::Pending);
        assert_eq!(queue.get("b").await.unwrap().status, ItemStatus::Committed);
    }

    #[tokio::test]
    async fn test_release_stale_returns_old_claims() {
        let (_tmp, queue) = test_queue().await;
        queue.enqueue(&discovery("stuck", 5)).await.unwrap();
        queue.enqueue(&discovery("done", 5)).await.unwrap();
        queue.dequeue().await.unwrap();
        queue.update_status("done", ItemStatus::Committed).await.unwrap();

        let fresh = queue.release_stale(Duration::from_secs(3600)).await.unwrap();
        assert!(fresh.is_empty());
        assert_eq!(queue.get("stuck").await.unwrap().status, ItemStatus::Claimed);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let released = queue.release_stale(Duration::from_millis(1)).await.unwrap();
        assert_eq!(released, vec!["stuck"]);
        assert_eq!(queue.get("stuck").await.unwrap().status, ItemStatus::Pending);
        assert_eq!(queue.get("done").await.unwrap().status, ItemStatus::Committed);
    }

    #[tokio::test]
    async fn test_update_status_unknown_id() {
        let (_tmp, queue) = test_queue().await;
        let err = queue
            .update_status("ghost", ItemStatus::Verified)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_priority_bounds_enforced() {
        let (_tmp, queue) = test_queue().await;
        assert!(matches!(
            queue.enqueue(&discovery("zero", 0)).await,
            Err(PipelineError::InvalidInput(_))
        ));
        assert!(matches!(
            queue.enqueue(&discovery("eleven", 11)).await,
            Err(PipelineError::InvalidInput(_))
        ));
        queue.enqueue(&discovery("ten", 10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_stats_group_by_status_and_kind() {
        let (_tmp, queue) = test_queue().await;
        queue.enqueue(&discovery("f1", 4)).await.unwrap();
        queue.enqueue(&discovery("f2", 6)).await.unwrap();
        queue
            .enqueue(
                &Discovery::new("brand-1", WorkKind::Entity, "https://maker.example")
                    .with_source_kind(SourceKind::Primary),
            )
            .await
            .unwrap();
        queue.update_status("f2", ItemStatus::Error).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.count(ItemStatus::Pending), 2);
        assert_eq!(stats.count(ItemStatus::Error), 1);
        assert_eq!(stats.count(ItemStatus::Committed), 0);
        assert_eq!(stats.total(), 3);

        let kinds: Vec<(WorkKind, i64)> = stats.pending_by_kind.clone();
        assert!(kinds.contains(&(WorkKind::Fact, 1)));
        assert!(kinds.contains(&(WorkKind::Entity, 1)));

        let pending = stats
            .by_status
            .iter()
            .find(|s| s.status == ItemStatus::Pending)
            .unwrap();
        assert!((pending.avg_priority - 4.5).abs() < 1e-9);
    }
}
