//! Flow State and the controller's finite-state machine.
//!
//! One pass through the pipeline visits these stages:
//!
//! ```text
//! discover → filter ─┬─(N > 50)──────▶ batch_curate ─┐
//!                    ├─(0 < N ≤ 50)──▶ curate ───────┼─▶ commit ─▶ report
//!                    └─(N = 0)───────▶ idle ─────────┼────────────▶ report
//! report → discover   (next cycle)
//! ```
//!
//! The routing decision is the pure function [`route`]. Every legal edge is
//! listed in [`TRANSITIONS`]; [`FlowState::advance`] refuses anything else.
//! The one exception is [`FlowState::abort`], which jumps from any stage to
//! `report` when a cycle is cancelled or fails.

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::models::WorkItem;

/// Working sets larger than this take the batch route.
pub const BATCH_ROUTE_THRESHOLD: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discover,
    Filter,
    Curate,
    BatchCurate,
    Idle,
    Commit,
    Report,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Discover => "discover",
            Stage::Filter => "filter",
            Stage::Curate => "curate",
            Stage::BatchCurate => "batch_curate",
            Stage::Idle => "idle",
            Stage::Commit => "commit",
            Stage::Report => "report",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    BatchProcess,
    NormalProcess,
    Idle,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::BatchProcess => "batch_process",
            Route::NormalProcess => "normal_process",
            Route::Idle => "idle",
        }
    }

    /// Stage entered after `filter` on this route.
    pub fn stage(&self) -> Stage {
        match self {
            Route::BatchProcess => Stage::BatchCurate,
            Route::NormalProcess => Stage::Curate,
            Route::Idle => Stage::Idle,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Route a working set of size `n`.
pub fn route(n: usize) -> Route {
    if n > BATCH_ROUTE_THRESHOLD {
        Route::BatchProcess
    } else if n > 0 {
        Route::NormalProcess
    } else {
        Route::Idle
    }
}

/// Every legal `(from, to)` edge.
pub const TRANSITIONS: &[(Stage, Stage)] = &[
    (Stage::Discover, Stage::Filter),
    (Stage::Filter, Stage::Curate),
    (Stage::Filter, Stage::BatchCurate),
    (Stage::Filter, Stage::Idle),
    (Stage::Curate, Stage::Commit),
    (Stage::BatchCurate, Stage::Commit),
    (Stage::Idle, Stage::Report),
    (Stage::Commit, Stage::Report),
    (Stage::Report, Stage::Discover),
];

pub fn can_transition(from: Stage, to: Stage) -> bool {
    TRANSITIONS.iter().any(|&(f, t)| f == from && t == to)
}

/// Split `items` into order-preserving chunks of at most `size`.
pub fn chunk<T>(items: &[T], size: usize) -> Vec<&[T]> {
    items.chunks(size.max(1)).collect()
}

/// In-memory summary of one controller's progress.
///
/// Owned exclusively by the controller; producers never touch it. Safe to
/// lose: everything here can be recomputed from the durable stores.
#[derive(Debug, Clone)]
pub struct FlowState {
    stage: Stage,
    pub visited_sources: BTreeSet<String>,
    pub pending_ids: Vec<String>,
    pub nodes_committed: u64,
    pub relationships_committed: u64,
    pub cycles_completed: u64,
    pub quality_threshold: f64,
    pub max_parallel_scans: usize,
    pub max_batch_size: usize,
    pub chunk_size: usize,
}

impl FlowState {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            stage: Stage::Report,
            visited_sources: BTreeSet::new(),
            pending_ids: Vec::new(),
            nodes_committed: 0,
            relationships_committed: 0,
            cycles_completed: 0,
            quality_threshold: config.quality_threshold,
            max_parallel_scans: config.max_parallel_scans,
            max_batch_size: config.max_batch_size,
            chunk_size: config.chunk_size,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Move to `to`, or fail if the edge is not in [`TRANSITIONS`].
    pub fn advance(&mut self, to: Stage) -> Result<()> {
        if !can_transition(self.stage, to) {
            return Err(PipelineError::InvalidTransition {
                from: self.stage.to_string(),
                to: to.to_string(),
            });
        }
        tracing::debug!(from = %self.stage, to = %to, "stage transition");
        self.stage = to;
        Ok(())
    }

    /// Jump straight to `report`, skipping the remaining stages.
    pub fn abort(&mut self) {
        if self.stage != Stage::Report {
            tracing::debug!(from = %self.stage, "stage aborted to report");
            self.stage = Stage::Report;
        }
    }

    /// Narrow the pending items to this cycle's working set.
    ///
    /// Items whose source was already visited by an earlier cycle are
    /// dropped; the sources of the kept items are then marked visited.
    /// Several items from one new source all stay in the set.
    pub fn select_working_set(&mut self, pending: Vec<WorkItem>) -> Vec<WorkItem> {
        let working: Vec<WorkItem> = pending
            .into_iter()
            .filter(|item| !self.visited_sources.contains(&item.source_id))
            .take(self.max_batch_size)
            .collect();

        for item in &working {
            self.visited_sources.insert(item.source_id.clone());
        }
        self.pending_ids = working.iter().map(|i| i.id.clone()).collect();
        working
    }

    /// Drop committed ids from `pending_ids` and add the committed counts.
    pub fn record_commit(&mut self, ids: &[String], nodes: u64, relationships: u64) {
        self.pending_ids.retain(|id| !ids.contains(id));
        self.nodes_committed += nodes;
        self.relationships_committed += relationships;
    }

    pub fn discoveries_pending(&self) -> usize {
        self.pending_ids.len()
    }
}
