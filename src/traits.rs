//! Collaborator traits: the seams between the pipeline and the outside world.
//!
//! The controller never scans sources, reasons about evidence, or writes to
//! the knowledge graph itself. It drives three kinds of collaborators:
//!
//! ```text
//! ┌────────────────────┐   enqueue / register   ┌─────────────────────┐
//! │ Producer (×N)      │ ─────────────────────▶ │ DiscoverySink       │
//! │  scanners, crawlers│                        │  queue + registry   │
//! └────────────────────┘                        └─────────────────────┘
//! ┌────────────────────┐   outcomes + evidence  ┌─────────────────────┐
//! │ Researcher         │ ─────────────────────▶ │ Research Log        │
//! └────────────────────┘                        └─────────────────────┘
//! ┌────────────────────┐   {nodes, relationships}
//! │ Committer          │ ◀──── verified payloads
//! └────────────────────┘
//! ```
//!
//! Implementations may live in-process (tests, embedding applications) or
//! run as child processes (see [`crate::command`]). Trait methods return
//! [`anyhow::Result`]; the resilience layer converts failures into
//! [`PipelineError::Collaborator`](crate::error::PipelineError::Collaborator).

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::Config;
use crate::error::PipelineError;
use crate::models::{Confidence, Discovery, Evidence, Payload, SourceKind, SourceVisit, WorkItem, WorkKind};
use crate::queue::DiscoveryQueue;
use crate::registry::SourceRegistry;

// ═══════════════════════════════════════════════════════════════════════
// Directive + sink
// ═══════════════════════════════════════════════════════════════════════

/// Source-selection directive handed to every producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Directive {
    pub search_terms: Vec<String>,
    pub sources: Vec<String>,
    pub days_back: u32,
    pub max_discoveries: usize,
}

impl Directive {
    pub fn from_config(config: &Config) -> Self {
        let d = &config.directive;
        Self {
            search_terms: d.search_terms.clone(),
            sources: d.sources.clone(),
            days_back: d.days_back,
            max_discoveries: d
                .max_discoveries
                .unwrap_or(config.pipeline.max_parallel_scans * 25),
        }
    }
}

/// Result of [`DiscoverySink::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    Duplicate,
    /// The run's `max_discoveries` budget is spent; nothing was written.
    LimitReached,
}

/// Totals observed by a sink across all producers of one cycle.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SinkTotals {
    pub enqueued: usize,
    pub duplicates: usize,
    pub sources_registered: usize,
}

/// Producers' only door into the durable stores.
///
/// Shared by every producer of a discovery stage. Duplicate discoveries are
/// expected when several scanners cover overlapping sources, so they are
/// counted rather than raised.
pub struct DiscoverySink {
    queue: Arc<DiscoveryQueue>,
    registry: Arc<SourceRegistry>,
    limit: usize,
    enqueued: AtomicUsize,
    duplicates: AtomicUsize,
    sources: AtomicUsize,
}

impl DiscoverySink {
    pub fn new(queue: Arc<DiscoveryQueue>, registry: Arc<SourceRegistry>, limit: usize) -> Self {
        Self {
            queue,
            registry,
            limit,
            enqueued: AtomicUsize::new(0),
            duplicates: AtomicUsize::new(0),
            sources: AtomicUsize::new(0),
        }
    }

    pub async fn check_source(&self, url: &str) -> crate::error::Result<Option<SourceVisit>> {
        self.registry.check(url).await
    }

    pub async fn register_source(
        &self,
        url: &str,
        kind: Option<SourceKind>,
        items_found: u32,
    ) -> crate::error::Result<SourceVisit> {
        let visit = self.registry.register(url, kind, items_found).await?;
        self.sources.fetch_add(1, Ordering::Relaxed);
        Ok(visit)
    }

    pub async fn enqueue(&self, discovery: &Discovery) -> crate::error::Result<Enqueued> {
        // Reserve a slot before writing so concurrent producers cannot overshoot.
        let reserved = self
            .enqueued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .is_ok();
        if !reserved {
            return Ok(Enqueued::LimitReached);
        }

        match self.queue.enqueue(discovery).await {
            Ok(_) => Ok(Enqueued::Queued),
            Err(PipelineError::Duplicate { .. }) => {
                self.enqueued.fetch_sub(1, Ordering::SeqCst);
                self.duplicates.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(id = %discovery.id, "duplicate discovery skipped");
                Ok(Enqueued::Duplicate)
            }
            Err(e) => {
                self.enqueued.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    pub fn totals(&self) -> SinkTotals {
        SinkTotals {
            enqueued: self.enqueued.load(Ordering::SeqCst),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            sources_registered: self.sources.load(Ordering::Relaxed),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Producer Trait
// ═══════════════════════════════════════════════════════════════════════

/// What a producer reports about its own scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProducerReport {
    #[serde(default)]
    pub items_enqueued: usize,
    #[serde(default)]
    pub duplicates: usize,
    #[serde(default)]
    pub sources_scanned: Vec<String>,
}

/// A discovery producer (scanner, crawler, feed reader).
///
/// Producers are expected to [`check_source`](DiscoverySink::check_source)
/// before expensive scanning and
/// [`register_source`](DiscoverySink::register_source) afterwards, and to
/// push every candidate through [`enqueue`](DiscoverySink::enqueue).
#[async_trait]
pub trait Producer: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn discover(&self, directive: &Directive, sink: &DiscoverySink) -> Result<ProducerReport>;
}

// ═══════════════════════════════════════════════════════════════════════
// Researcher Trait
// ═══════════════════════════════════════════════════════════════════════

/// Research result for one work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchOutcome {
    pub item_id: String,
    /// Updated payload; replaces the queued one when the item passes.
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
}

/// Verifies work items and reports the evidence it relied on.
///
/// Called once per working set on the normal route, once per chunk on the
/// batch route. Items missing from the returned list are treated as
/// needing more research.
#[async_trait]
pub trait Researcher: Send + Sync {
    fn name(&self) -> &str;

    async fn research(&self, items: &[WorkItem]) -> Result<Vec<ResearchOutcome>>;
}

// ═══════════════════════════════════════════════════════════════════════
// Committer Trait
// ═══════════════════════════════════════════════════════════════════════

/// A payload that passed validation, ready to be committed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedPayload {
    pub item_id: String,
    pub kind: WorkKind,
    pub research_id: String,
    pub completeness_score: f64,
    pub confidence: Confidence,
    pub payload: Payload,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitSummary {
    #[serde(default)]
    pub nodes_created: u64,
    #[serde(default)]
    pub relationships_created: u64,
}

/// Writes verified payloads into the persistent store.
///
/// Must be idempotent: submitting the same payloads twice (as a retry
/// does) must not double-count nodes.
#[async_trait]
pub trait Committer: Send + Sync {
    fn name(&self) -> &str;

    async fn commit(&self, payloads: &[VerifiedPayload]) -> Result<CommitSummary>;
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// The full set of collaborators a controller drives.
pub struct Collaborators {
    producers: Vec<Arc<dyn Producer>>,
    researcher: Arc<dyn Researcher>,
    committer: Arc<dyn Committer>,
}

impl Collaborators {
    pub fn new(researcher: Arc<dyn Researcher>, committer: Arc<dyn Committer>) -> Self {
        Self {
            producers: Vec::new(),
            researcher,
            committer,
        }
    }

    /// Build command-backed collaborators from `[producers.*]`, `[research]`
    /// and `[commit]`.
    pub fn from_config(config: &Config) -> Result<Self> {
        use crate::command::{CommandCommitter, CommandProducer, CommandResearcher};

        let Some(research) = &config.research else {
            anyhow::bail!("no [research] command configured");
        };
        let Some(commit) = &config.commit else {
            anyhow::bail!("no [commit] command configured");
        };

        let mut collaborators = Self::new(
            Arc::new(CommandResearcher::new(research.clone())),
            Arc::new(CommandCommitter::new(commit.clone())),
        );
        for (name, cfg) in &config.producers {
            collaborators.register(Arc::new(CommandProducer::new(name.clone(), cfg.clone())));
        }
        Ok(collaborators)
    }

    pub fn register(&mut self, producer: Arc<dyn Producer>) {
        self.producers.push(producer);
    }

    pub fn with_producer(mut self, producer: Arc<dyn Producer>) -> Self {
        self.register(producer);
        self
    }

    pub fn producers(&self) -> &[Arc<dyn Producer>] {
        &self.producers
    }

    pub fn find_producer(&self, name: &str) -> Option<&dyn Producer> {
        self.producers
            .iter()
            .find(|p| p.name() == name)
            .map(|p| p.as_ref())
    }

    pub fn researcher(&self) -> &dyn Researcher {
        self.researcher.as_ref()
    }

    pub fn committer(&self) -> &dyn Committer {
        self.committer.as_ref()
    }
}
