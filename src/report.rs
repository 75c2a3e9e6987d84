//! The run report: the single result object a pipeline cycle returns.
//!
//! A report is always produced, even when stages failed or the run was
//! cancelled; `errors` lists what was degraded or skipped.

use serde::Serialize;

use crate::error::PipelineError;
use crate::flow::{Route, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Work was processed and nothing failed.
    Complete,
    /// The working set was empty.
    Idle,
    /// The cycle finished but recorded errors.
    Partial,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Complete => "complete",
            RunStatus::Idle => "idle",
            RunStatus::Partial => "partial",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub elapsed_ms: u64,
}

/// One degraded or skipped unit of work.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collaborator: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub item_ids: Vec<String>,
    pub message: String,
    /// Whether a later run can pick the affected items up again.
    pub retryable: bool,
}

impl ErrorEntry {
    pub fn new(stage: Stage, collaborator: Option<&str>, item_ids: Vec<String>, err: &PipelineError) -> Self {
        Self {
            stage,
            collaborator: collaborator.map(str::to_string),
            item_ids,
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub cycle: u64,
    pub route: Option<Route>,
    pub working_set: usize,
    pub chunks_processed: usize,
    pub sources_visited: usize,
    pub discoveries_enqueued: usize,
    pub duplicates_skipped: usize,
    pub discoveries_pending: usize,
    pub items_verified: usize,
    pub items_committed: usize,
    pub nodes_created_total: u64,
    pub relationships_created_total: u64,
    pub quality_threshold: f64,
    pub needs_research: Vec<String>,
    pub stages: Vec<StageRecord>,
    pub errors: Vec<ErrorEntry>,
    pub elapsed_ms: u64,
}

impl RunReport {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Print a report for humans on stdout.
pub fn print_report(report: &RunReport) {
    println!("gearflow run report (cycle {})", report.cycle);
    println!("=================================");
    println!();
    println!("  Status:              {}", report.status.as_str());
    println!(
        "  Route:               {}",
        report.route.map(|r| r.as_str()).unwrap_or("-")
    );
    println!("  Working set:         {}", report.working_set);
    println!("  Chunks processed:    {}", report.chunks_processed);
    println!();
    println!("  Sources visited:     {}", report.sources_visited);
    println!(
        "  Discoveries:         {} new, {} duplicate",
        report.discoveries_enqueued, report.duplicates_skipped
    );
    println!("  Pending:             {}", report.discoveries_pending);
    println!("  Verified:            {}", report.items_verified);
    println!("  Committed:           {}", report.items_committed);
    println!(
        "  Nodes created:       {} (relationships: {})",
        report.nodes_created_total, report.relationships_created_total
    );
    println!("  Quality threshold:   {:.2}", report.quality_threshold);
    println!("  Elapsed:             {} ms", report.elapsed_ms);

    if !report.stages.is_empty() {
        println!();
        println!("  {:<14} {:>10}", "STAGE", "MS");
        println!("  {}", "-".repeat(25));
        for s in &report.stages {
            println!("  {:<14} {:>10}", s.stage.as_str(), s.elapsed_ms);
        }
    }

    if !report.needs_research.is_empty() {
        println!();
        println!("  Needs more research ({}):", report.needs_research.len());
        for id in &report.needs_research {
            println!("    {}", id);
        }
    }

    if !report.errors.is_empty() {
        println!();
        println!("  Errors ({}):", report.errors.len());
        for e in &report.errors {
            let who = e.collaborator.as_deref().unwrap_or("-");
            println!("    [{}] {}: {}", e.stage.as_str(), who, e.message);
            if !e.item_ids.is_empty() {
                println!("        items: {}", e.item_ids.join(", "));
            }
        }
    }
    println!();
}
