//! Source Registry: idempotent bookkeeping of which sources have already
//! been mined.
//!
//! Producers call [`SourceRegistry::check`] before an expensive scan and
//! [`SourceRegistry::register`] after it. The registry does not enforce that
//! ordering; it only guarantees that repeated registration accumulates
//! (`scan_count` and `items_yielded` never decrease) and that a source's
//! kind, once known, is never overwritten.

use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{PipelineError, Result};
use crate::models::{from_millis, to_millis, SourceKind, SourceVisit};

const VISIT_COLUMNS: &str = "url, kind, scan_count, items_yielded, first_seen_at, last_seen_at";

/// Totals returned by [`SourceRegistry::stats`].
#[derive(Debug, Clone, Serialize, Default)]
pub struct RegistryStats {
    pub total_sources: i64,
    pub total_scans: i64,
    pub total_items: i64,
    /// `None` groups sources whose kind was never reported.
    pub by_kind: Vec<KindTotals>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KindTotals {
    pub kind: Option<SourceKind>,
    pub sources: i64,
    pub scans: i64,
    pub items: i64,
}

pub struct SourceRegistry {
    pool: SqlitePool,
}

impl SourceRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// `Some(visit)` if the URL is known, `None` otherwise.
    pub async fn check(&self, url: &str) -> Result<Option<SourceVisit>> {
        let sql = format!("SELECT {VISIT_COLUMNS} FROM source_registry WHERE url = ?");
        let row = sqlx::query(&sql)
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_visit).transpose()
    }

    /// Record one scan of `url` that yielded `items_found` discoveries.
    ///
    /// First registration creates the row with `scan_count = 1`; later ones
    /// increment it, add to `items_yielded` and backfill a missing kind.
    pub async fn register(
        &self,
        url: &str,
        kind: Option<SourceKind>,
        items_found: u32,
    ) -> Result<SourceVisit> {
        if url.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "source url must not be empty".to_string(),
            ));
        }

        let now = to_millis(Utc::now());
        let sql = format!(
            r#"
            INSERT INTO source_registry (url, kind, scan_count, items_yielded, first_seen_at, last_seen_at)
            VALUES (?, ?, 1, ?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET
                scan_count = source_registry.scan_count + 1,
                items_yielded = source_registry.items_yielded + excluded.items_yielded,
                last_seen_at = excluded.last_seen_at,
                kind = COALESCE(source_registry.kind, excluded.kind)
            RETURNING {VISIT_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(url)
            .bind(kind.map(|k| k.as_str()))
            .bind(items_found as i64)
            .bind(now)
            .bind(now)
            .fetch_one(&self.pool)
            .await?;

        let visit = row_to_visit(&row)?;
        tracing::debug!(
            url = %visit.url,
            scan_count = visit.scan_count,
            items_yielded = visit.items_yielded,
            "registered source scan"
        );
        Ok(visit)
    }

    /// Most recently seen sources first.
    pub async fn list(&self, limit: usize) -> Result<Vec<SourceVisit>> {
        let sql = format!(
            "SELECT {VISIT_COLUMNS} FROM source_registry ORDER BY last_seen_at DESC, url ASC LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_visit).collect()
    }

    pub async fn stats(&self) -> Result<RegistryStats> {
        let rows = sqlx::query(
            r#"
            SELECT kind,
                   COUNT(*) AS sources,
                   COALESCE(SUM(scan_count), 0) AS scans,
                   COALESCE(SUM(items_yielded), 0) AS items
            FROM source_registry
            GROUP BY kind
            ORDER BY sources DESC, kind
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = RegistryStats::default();
        for row in &rows {
            let kind: Option<String> = row.get("kind");
            let totals = KindTotals {
                kind: kind.as_deref().map(str::parse::<SourceKind>).transpose()?,
                sources: row.get("sources"),
                scans: row.get("scans"),
                items: row.get("items"),
            };
            stats.total_sources += totals.sources;
            stats.total_scans += totals.scans;
            stats.total_items += totals.items;
            stats.by_kind.push(totals);
        }
        Ok(stats)
    }
}

fn row_to_visit(row: &SqliteRow) -> Result<SourceVisit> {
    let kind: Option<String> = row.get("kind");
    Ok(SourceVisit {
        url: row.get("url"),
        kind: kind.as_deref().map(str::parse::<SourceKind>).transpose()?,
        scan_count: row.get("scan_count"),
        items_yielded: row.get("items_yielded"),
        first_seen_at: from_millis(row.get("first_seen_at")),
        last_seen_at: from_millis(row.get("last_seen_at")),
    })
}
