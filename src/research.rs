//! Research Log: append-only provenance for each verification pass over a
//! work item, plus the derived completeness / confidence score.
//!
//! A session is opened per research pass, collects one step per piece of
//! evidence while `in_progress`, and is frozen by [`ResearchLog::complete`].
//! The schema backs this up with triggers: steps can never be updated or
//! deleted, and a completed session row can never change.
//!
//! Scoring rules:
//!
//! - **completeness** is computed over the *union* of fields reported by
//!   every step, so a later, thinner source never erases what an earlier
//!   one supplied.
//! - **overall confidence** is the best tier seen in any step.

use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeSet;

use crate::error::{PipelineError, Result};
use crate::models::{
    from_millis, to_millis, Confidence, Evidence, ResearchSession, ResearchStep, SessionStatus,
};

/// Canonical fields a fully researched item carries.
pub const REQUIRED_FIELDS: [&str; 7] = [
    "name",
    "brand",
    "weight",
    "price",
    "product_url",
    "image_url",
    "type",
];

/// Completeness needed for a PASS under [`ResearchLog::validate`].
pub const MIN_COMPLETENESS: f64 = 0.85;

const SESSION_COLUMNS: &str =
    "research_id, item_id, status, completeness_score, overall_confidence, started_at, completed_at";

const STEP_COLUMNS: &str =
    "step_id, research_id, source_url, source_kind, fields_json, confidence, notes, logged_at";

/// Scores persisted when a session is completed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completion {
    pub research_id: String,
    pub completeness_score: f64,
    pub overall_confidence: Confidence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
}

/// Outcome of [`ResearchLog::validate`]. `issues` is empty iff the verdict is PASS.
#[derive(Debug, Clone, Serialize)]
pub struct Validation {
    pub research_id: String,
    pub verdict: Verdict,
    pub completeness_score: f64,
    pub overall_confidence: Confidence,
    pub threshold: f64,
    pub issues: Vec<String>,
}

impl Validation {
    pub fn passed(&self) -> bool {
        self.verdict == Verdict::Pass
    }
}

/// One session and all of its steps, for audit display.
#[derive(Debug, Clone, Serialize)]
pub struct SessionAudit {
    pub session: ResearchSession,
    pub steps: Vec<ResearchStep>,
}

/// A fresh research id for `item_id`: `"{item_id}:{uuid}"`.
pub fn new_research_id(item_id: &str) -> String {
    format!("{}:{}", item_id, uuid::Uuid::new_v4())
}

/// Normalize a reported field name: trimmed, `camelCase` folded to `snake_case`.
pub fn canonical_field(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.trim().chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 && !out.ends_with('_') {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else if ch == '-' || ch == ' ' {
            out.push('_');
        } else {
            out.push(ch);
        }
    }
    out
}

/// Fraction of [`REQUIRED_FIELDS`] present in `fields`.
pub fn completeness_of<'a>(fields: impl IntoIterator<Item = &'a str>) -> f64 {
    let present: BTreeSet<&str> = fields
        .into_iter()
        .filter(|f| REQUIRED_FIELDS.contains(f))
        .collect();
    present.len() as f64 / REQUIRED_FIELDS.len() as f64
}

pub struct ResearchLog {
    pool: SqlitePool,
}

impl ResearchLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the session on first reference; return it unchanged afterwards.
    pub async fn open_or_get_session(
        &self,
        research_id: &str,
        item_id: &str,
    ) -> Result<ResearchSession> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO research_sessions (research_id, item_id, status, started_at)
            VALUES (?, ?, 'in_progress', ?)
            "#,
        )
        .bind(research_id)
        .bind(item_id)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        self.session(research_id).await
    }

    pub async fn session(&self, research_id: &str) -> Result<ResearchSession> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM research_sessions WHERE research_id = ?");
        let row = sqlx::query(&sql)
            .bind(research_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("research session {}", research_id)))?;
        row_to_session(&row)
    }

    /// Append one piece of evidence to an in-progress session.
    pub async fn log_step(&self, research_id: &str, evidence: &Evidence) -> Result<ResearchStep> {
        let fields: BTreeSet<String> = evidence
            .fields_found
            .iter()
            .map(|f| canonical_field(f))
            .filter(|f| !f.is_empty())
            .collect();
        let fields_json = serde_json::to_string(&fields)?;
        let logged_at = to_millis(Utc::now());

        let step_id: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO research_steps (research_id, source_url, source_kind, fields_json,
                                        confidence, notes, logged_at)
            SELECT ?, ?, ?, ?, ?, ?, ?
            WHERE EXISTS (
                SELECT 1 FROM research_sessions
                WHERE research_id = ? AND status = 'in_progress'
            )
            RETURNING step_id
            "#,
        )
        .bind(research_id)
        .bind(&evidence.source_url)
        .bind(evidence.source_kind.as_str())
        .bind(&fields_json)
        .bind(evidence.confidence.as_str())
        .bind(&evidence.notes)
        .bind(logged_at)
        .bind(research_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(step_id) = step_id else {
            // Either the session is unknown or it is already frozen.
            self.session(research_id).await?;
            return Err(PipelineError::Session(research_id.to_string()));
        };

        tracing::debug!(
            research_id,
            source = %evidence.source_url,
            confidence = %evidence.confidence,
            fields = fields.len(),
            "logged research step"
        );

        Ok(ResearchStep {
            step_id,
            research_id: research_id.to_string(),
            source_url: evidence.source_url.clone(),
            source_kind: evidence.source_kind,
            fields_found: fields,
            confidence: evidence.confidence,
            notes: evidence.notes.clone(),
            logged_at: from_millis(logged_at),
        })
    }

    /// Score and freeze the session. Idempotent: a completed session
    /// returns its stored scores without recomputation.
    pub async fn complete(&self, research_id: &str) -> Result<Completion> {
        // Take the write lock up front so no step can slip in between
        // scoring and freezing. Dropping `tx` rolls back.
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        let completion = complete_locked(&mut *tx, research_id).await?;
        tx.commit().await?;

        tracing::info!(
            research_id,
            completeness = completion.completeness_score,
            confidence = %completion.overall_confidence,
            "research session completed"
        );
        Ok(completion)
    }

    /// PASS iff `completeness ≥ 0.85` and confidence is verified or corroborated.
    pub async fn validate(&self, research_id: &str) -> Result<Validation> {
        self.validate_against(research_id, MIN_COMPLETENESS).await
    }

    /// Same as [`validate`](Self::validate) with a caller-supplied completeness gate.
    pub async fn validate_against(&self, research_id: &str, threshold: f64) -> Result<Validation> {
        let session = self.session(research_id).await?;
        let (Some(score), Some(confidence)) =
            (session.completeness_score, session.overall_confidence)
        else {
            return Err(PipelineError::Incomplete(research_id.to_string()));
        };
        if session.status != SessionStatus::Completed {
            return Err(PipelineError::Incomplete(research_id.to_string()));
        }

        let mut issues = Vec::new();
        if score < threshold {
            issues.push(format!(
                "completeness {:.3} is below the required {:.2}",
                score, threshold
            ));
        }
        if !confidence.is_trusted() {
            issues.push(format!(
                "overall confidence '{}' is weaker than corroborated",
                confidence
            ));
        }

        Ok(Validation {
            research_id: research_id.to_string(),
            verdict: if issues.is_empty() {
                Verdict::Pass
            } else {
                Verdict::Fail
            },
            completeness_score: score,
            overall_confidence: confidence,
            threshold,
            issues,
        })
    }

    /// Every session for `item_id`, most recent first, each with its steps.
    pub async fn retrieve(&self, item_id: &str) -> Result<Vec<SessionAudit>> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM research_sessions WHERE item_id = ? \
             ORDER BY started_at DESC, rowid DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(item_id)
            .fetch_all(&self.pool)
            .await?;

        let step_sql =
            format!("SELECT {STEP_COLUMNS} FROM research_steps WHERE research_id = ? ORDER BY step_id");

        let mut audits = Vec::with_capacity(rows.len());
        for row in &rows {
            let session = row_to_session(row)?;
            let step_rows = sqlx::query(&step_sql)
                .bind(&session.research_id)
                .fetch_all(&self.pool)
                .await?;
            let steps = step_rows
                .iter()
                .map(row_to_step)
                .collect::<Result<Vec<_>>>()?;
            audits.push(SessionAudit { session, steps });
        }
        Ok(audits)
    }
}

async fn complete_locked(conn: &mut SqliteConnection, research_id: &str) -> Result<Completion> {
    let sql = format!("SELECT {SESSION_COLUMNS} FROM research_sessions WHERE research_id = ?");
    let row = sqlx::query(&sql)
        .bind(research_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("research session {}", research_id)))?;
    let session = row_to_session(&row)?;

    if session.status == SessionStatus::Completed {
        if let (Some(score), Some(confidence)) =
            (session.completeness_score, session.overall_confidence)
        {
            return Ok(Completion {
                research_id: research_id.to_string(),
                completeness_score: score,
                overall_confidence: confidence,
            });
        }
    }

    let rows = sqlx::query("SELECT fields_json, confidence FROM research_steps WHERE research_id = ?")
        .bind(research_id)
        .fetch_all(&mut *conn)
        .await?;
    if rows.is_empty() {
        return Err(PipelineError::NotFound(format!(
            "no research steps logged for {}",
            research_id
        )));
    }

    let mut fields = BTreeSet::new();
    let mut best = Confidence::Uncertain;
    for row in &rows {
        let fields_json: String = row.get("fields_json");
        let step_fields: Vec<String> = serde_json::from_str(&fields_json)?;
        fields.extend(step_fields);
        let confidence: String = row.get("confidence");
        best = best.max(confidence.parse()?);
    }
    let score = completeness_of(fields.iter().map(String::as_str));

    sqlx::query(
        r#"
        UPDATE research_sessions
        SET status = 'completed', completeness_score = ?, overall_confidence = ?, completed_at = ?
        WHERE research_id = ?
        "#,
    )
    .bind(score)
    .bind(best.as_str())
    .bind(to_millis(Utc::now()))
    .bind(research_id)
    .execute(&mut *conn)
    .await?;

    Ok(Completion {
        research_id: research_id.to_string(),
        completeness_score: score,
        overall_confidence: best,
    })
}

fn row_to_session(row: &SqliteRow) -> Result<ResearchSession> {
    let status: String = row.get("status");
    let confidence: Option<String> = row.get("overall_confidence");
    Ok(ResearchSession {
        research_id: row.get("research_id"),
        item_id: row.get("item_id"),
        status: status.parse()?,
        completeness_score: row.get("completeness_score"),
        overall_confidence: confidence
            .as_deref()
            .map(str::parse::<Confidence>)
            .transpose()?,
        started_at: from_millis(row.get("started_at")),
        completed_at: row.get::<Option<i64>, _>("completed_at").map(from_millis),
    })
}

fn row_to_step(row: &SqliteRow) -> Result<ResearchStep> {
    let source_kind: String = row.get("source_kind");
    let confidence: String = row.get("confidence");
    let fields_json: String = row.get("fields_json");
    Ok(ResearchStep {
        step_id: row.get("step_id"),
        research_id: row.get("research_id"),
        source_url: row.get("source_url"),
        source_kind: source_kind.parse()?,
        fields_found: serde_json::from_str(&fields_json)?,
        confidence: confidence.parse()?,
        notes: row.get("notes"),
        logged_at: from_millis(row.get("logged_at")),
    })
}
