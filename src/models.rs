//! Core data models used throughout gearflow.
//!
//! These types represent the discoveries, queued work items, visited
//! sources, and research evidence that flow through the discovery →
//! research → commit pipeline.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

/// Free-form partial data gathered for a work item.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Semantic category of a discovered item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    #[serde(alias = "brand")]
    Entity,
    #[serde(alias = "product")]
    Fact,
    Insight,
    Category,
}

impl WorkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkKind::Entity => "entity",
            WorkKind::Fact => "fact",
            WorkKind::Insight => "insight",
            WorkKind::Category => "category",
        }
    }
}

impl FromStr for WorkKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entity" | "brand" => Ok(WorkKind::Entity),
            "fact" | "product" => Ok(WorkKind::Fact),
            "insight" => Ok(WorkKind::Insight),
            "category" => Ok(WorkKind::Category),
            other => Err(PipelineError::InvalidInput(format!(
                "unknown work kind '{}'",
                other
            ))),
        }
    }
}

/// Trust tier of an origin.
///
/// Scanner- and research-specific labels from upstream tools are accepted
/// as aliases (`manufacturer` → primary, `forum` → community, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    #[serde(alias = "manufacturer", alias = "official")]
    Primary,
    #[serde(alias = "retailer", alias = "review_site", alias = "website")]
    Secondary,
    #[serde(
        alias = "blog",
        alias = "forum",
        alias = "reddit",
        alias = "youtube"
    )]
    Community,
    Other,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Primary => "primary",
            SourceKind::Secondary => "secondary",
            SourceKind::Community => "community",
            SourceKind::Other => "other",
        }
    }
}

impl Default for SourceKind {
    fn default() -> Self {
        SourceKind::Other
    }
}

impl FromStr for SourceKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" | "manufacturer" | "official" => Ok(SourceKind::Primary),
            "secondary" | "retailer" | "review_site" | "website" => Ok(SourceKind::Secondary),
            "community" | "blog" | "forum" | "reddit" | "youtube" => Ok(SourceKind::Community),
            "other" | "unknown" => Ok(SourceKind::Other),
            other => Err(PipelineError::InvalidInput(format!(
                "unknown source kind '{}'",
                other
            ))),
        }
    }
}

/// Lifecycle status of a queued work item.
///
/// `pending → claimed → verified | error`, then `verified → committed`.
/// Rows are never removed; the queue doubles as a history log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Claimed,
    Verified,
    Committed,
    Error,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Claimed => "claimed",
            ItemStatus::Verified => "verified",
            ItemStatus::Committed => "committed",
            ItemStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Verified | ItemStatus::Committed | ItemStatus::Error
        )
    }
}

impl FromStr for ItemStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ItemStatus::Pending),
            "claimed" | "researching" => Ok(ItemStatus::Claimed),
            "verified" => Ok(ItemStatus::Verified),
            "committed" | "loaded" => Ok(ItemStatus::Committed),
            "error" => Ok(ItemStatus::Error),
            other => Err(PipelineError::InvalidInput(format!(
                "unknown item status '{}'",
                other
            ))),
        }
    }
}

/// Ordered trust tier of a piece of evidence.
///
/// Variant order is the total order used for "best wins":
/// `Uncertain < Reported < Corroborated < Verified`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Uncertain,
    Reported,
    Corroborated,
    Verified,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Uncertain => "uncertain",
            Confidence::Reported => "reported",
            Confidence::Corroborated => "corroborated",
            Confidence::Verified => "verified",
        }
    }

    /// Whether this tier is strong enough to pass validation on its own.
    pub fn is_trusted(&self) -> bool {
        matches!(self, Confidence::Verified | Confidence::Corroborated)
    }
}

impl FromStr for Confidence {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uncertain" => Ok(Confidence::Uncertain),
            "reported" => Ok(Confidence::Reported),
            "corroborated" => Ok(Confidence::Corroborated),
            "verified" => Ok(Confidence::Verified),
            other => Err(PipelineError::InvalidInput(format!(
                "unknown confidence level '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
        }
    }
}

impl FromStr for SessionStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(SessionStatus::InProgress),
            "completed" => Ok(SessionStatus::Completed),
            other => Err(PipelineError::InvalidInput(format!(
                "unknown session status '{}'",
                other
            ))),
        }
    }
}

macro_rules! impl_display_as_str {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(self.as_str())
                }
            }
        )*
    };
}

impl_display_as_str!(WorkKind, SourceKind, ItemStatus, Confidence, SessionStatus);

fn default_priority() -> u8 {
    5
}

/// A candidate item produced by a discovery producer, before it is queued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discovery {
    pub id: String,
    pub kind: WorkKind,
    #[serde(default)]
    pub payload: Payload,
    pub source_id: String,
    #[serde(default)]
    pub source_kind: SourceKind,
    #[serde(default = "default_priority")]
    pub priority: u8,
}

impl Discovery {
    pub fn new(id: impl Into<String>, kind: WorkKind, source_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            payload: Payload::new(),
            source_id: source_id.into(),
            source_kind: SourceKind::Other,
            priority: default_priority(),
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_source_kind(mut self, kind: SourceKind) -> Self {
        self.source_kind = kind;
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }
}

/// A discovery as stored in the Discovery Queue.
#[derive(Debug, Clone, Serialize)]
pub struct WorkItem {
    pub id: String,
    pub kind: WorkKind,
    pub payload: Payload,
    pub source_id: String,
    pub source_kind: SourceKind,
    pub priority: u8,
    pub status: ItemStatus,
    pub enqueued_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// One row of the Source Registry.
#[derive(Debug, Clone, Serialize)]
pub struct SourceVisit {
    pub url: String,
    pub kind: Option<SourceKind>,
    pub scan_count: i64,
    pub items_yielded: i64,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// One verification pass over a work item.
#[derive(Debug, Clone, Serialize)]
pub struct ResearchSession {
    pub research_id: String,
    pub item_id: String,
    pub status: SessionStatus,
    pub completeness_score: Option<f64>,
    pub overall_confidence: Option<Confidence>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A single piece of evidence reported by a research collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub source_url: String,
    #[serde(default)]
    pub source_kind: SourceKind,
    #[serde(default)]
    pub fields_found: Vec<String>,
    pub confidence: Confidence,
    #[serde(default)]
    pub notes: Option<String>,
}

/// An appended research step. Never updated once written.
#[derive(Debug, Clone, Serialize)]
pub struct ResearchStep {
    pub step_id: i64,
    pub research_id: String,
    pub source_url: String,
    pub source_kind: SourceKind,
    pub fields_found: BTreeSet<String>,
    pub confidence: Confidence,
    pub notes: Option<String>,
    pub logged_at: DateTime<Utc>,
}

/// Convert a timestamp to the millisecond integer stored in SQLite.
pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Convert a stored millisecond integer back to a timestamp.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}
