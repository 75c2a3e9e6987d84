//! Pipeline Controller: drives one cycle through the flow state machine.
//!
//! ```text
//! discover   producers run concurrently (max_parallel_scans) against a DiscoverySink
//! filter     release stale claims, page pending items past visited sources → working set
//! route      batch_process | normal_process | idle
//! curate     claim → research → log evidence → complete → validate (per chunk on batch route)
//! commit     approval gate → committer, in groups of chunk_size
//! report     RunReport
//! ```
//!
//! Every collaborator call runs under retry, a per-collaborator circuit
//! breaker, a per-call timeout bounded by the run deadline, and the
//! caller's [`CancellationToken`]; a commit already in flight is allowed to
//! finish. A failed unit of work is reverted to
//! `pending` and listed in the report; it never aborts the cycle. Store
//! errors and illegal stage transitions do.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use sqlx::SqlitePool;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::approval::{ApprovalGate, ApprovalRequest, Decision};
use crate::config::{Config, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::flow::{chunk, route, FlowState, Route, Stage};
use crate::models::{ItemStatus, WorkItem};
use crate::queue::DiscoveryQueue;
use crate::registry::SourceRegistry;
use crate::report::{ErrorEntry, RunReport, RunStatus, StageRecord};
use crate::research::{new_research_id, ResearchLog};
use crate::resilience::{retry, BreakerConfig, CircuitBreaker, RetryPolicy};
use crate::traits::{
    Collaborators, Directive, DiscoverySink, ResearchOutcome, SinkTotals, VerifiedPayload,
};

/// Per-cycle limits applied to every collaborator call.
struct CallGuard<'a> {
    retry: &'a RetryPolicy,
    call_timeout: Duration,
    deadline: Instant,
    cancel: &'a CancellationToken,
}

impl CallGuard<'_> {
    /// Run `op` under retry, breaker and timeout, abandoning it on cancel.
    async fn call<T, F, Fut>(&self, stage: Stage, breaker: &CircuitBreaker, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PipelineError::Cancelled(stage.to_string())),
            outcome = self.attempts(breaker, op) => outcome,
        }
    }

    /// Like [`CallGuard::call`], but an in-flight call is never dropped on
    /// cancel. Used where the collaborator may already have applied the work.
    async fn call_to_completion<T, F, Fut>(&self, breaker: &CircuitBreaker, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.attempts(breaker, op).await
    }

    async fn attempts<T, F, Fut>(&self, breaker: &CircuitBreaker, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        retry(breaker.name(), self.retry, |_| {
            let fut = op();
            let limit = self
                .call_timeout
                .min(self.deadline.saturating_duration_since(Instant::now()));
            breaker.call(move || async move {
                match tokio::time::timeout(limit, fut).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(anyhow::anyhow!("timed out after {} ms", limit.as_millis())),
                }
            })
        })
        .await
    }
}

/// Scratch state of one cycle, folded into the report at the end.
#[derive(Default)]
struct CycleLog {
    stages: Vec<StageRecord>,
    errors: Vec<ErrorEntry>,
    needs_research: Vec<String>,
    verified: Vec<VerifiedPayload>,
    /// Working-set ids another claimant took first.
    taken_elsewhere: Vec<String>,
    route: Option<Route>,
    working_set: usize,
    chunks_processed: usize,
    items_verified: usize,
    items_committed: usize,
    sink: SinkTotals,
    cancelled: bool,
}

impl CycleLog {
    fn stage_done(&mut self, stage: Stage, started: Instant) {
        self.stages.push(StageRecord {
            stage,
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
    }

    fn fail(&mut self, stage: Stage, collaborator: &str, item_ids: Vec<String>, err: &PipelineError) {
        if matches!(err, PipelineError::Cancelled(_)) {
            self.cancelled = true;
            return;
        }
        tracing::error!(stage = %stage, collaborator, items = item_ids.len(), error = %err, "stage unit failed");
        self.errors
            .push(ErrorEntry::new(stage, Some(collaborator), item_ids, err));
    }
}

/// Stores, collaborators and resilience state shared by every cycle.
struct Pipeline {
    config: PipelineConfig,
    directive: Directive,
    queue: Arc<DiscoveryQueue>,
    registry: Arc<SourceRegistry>,
    research: ResearchLog,
    collaborators: Collaborators,
    retry: RetryPolicy,
    breakers: HashMap<String, CircuitBreaker>,
    approval: ApprovalGate,
}

pub struct Controller {
    pipeline: Pipeline,
    state: FlowState,
}

fn producer_breaker(name: &str) -> String {
    format!("producer:{}", name)
}

const RESEARCH_BREAKER: &str = "research";
const COMMIT_BREAKER: &str = "commit";

impl Controller {
    pub fn new(pool: SqlitePool, config: &Config, collaborators: Collaborators) -> Self {
        let breaker_config = BreakerConfig::from_config(&config.resilience);
        let mut breakers = HashMap::new();
        let names = collaborators
            .producers()
            .iter()
            .map(|p| producer_breaker(p.name()))
            .chain([RESEARCH_BREAKER.to_string(), COMMIT_BREAKER.to_string()]);
        for name in names {
            breakers.insert(name.clone(), CircuitBreaker::new(name, breaker_config.clone()));
        }

        let pipeline = Pipeline {
            config: config.pipeline.clone(),
            directive: Directive::from_config(config),
            queue: Arc::new(DiscoveryQueue::new(pool.clone())),
            registry: Arc::new(SourceRegistry::new(pool.clone())),
            research: ResearchLog::new(pool),
            collaborators,
            retry: RetryPolicy::from_config(&config.resilience),
            breakers,
            approval: ApprovalGate::new(config.pipeline.approval_mode),
        };

        Self {
            state: FlowState::new(&config.pipeline),
            pipeline,
        }
    }

    pub fn state(&self) -> &FlowState {
        &self.state
    }

    pub fn breaker(&self, name: &str) -> Option<&CircuitBreaker> {
        self.pipeline.breakers.get(name)
    }

    pub fn queue(&self) -> &DiscoveryQueue {
        &self.pipeline.queue
    }

    /// Run one full cycle and return its report.
    ///
    /// Fails only on store errors or an illegal stage transition; every
    /// collaborator failure ends up in the report instead.
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> Result<RunReport> {
        let Self { pipeline, state } = self;

        if state.stage() != Stage::Report {
            tracing::warn!(stage = %state.stage(), "previous cycle did not finish, restarting");
            state.abort();
        }

        let started = Instant::now();
        let calls = CallGuard {
            retry: &pipeline.retry,
            call_timeout: pipeline.config.call_timeout(),
            deadline: started + pipeline.config.run_timeout(),
            cancel,
        };
        let mut log = CycleLog::default();
        let cycle = state.cycles_completed + 1;
        tracing::info!(cycle, "pipeline cycle started");

        let outcome = pipeline.run_stages(&calls, state, &mut log).await;
        if outcome.is_err() || log.cancelled {
            // Verified work that never reached the committer goes back to the queue.
            let stranded: Vec<String> = log.verified.drain(..).map(|v| v.item_id).collect();
            if !stranded.is_empty() {
                pipeline
                    .queue
                    .transition(&stranded, ItemStatus::Verified, ItemStatus::Pending)
                    .await?;
            }
            state.abort();
        }
        outcome?;

        state.cycles_completed += 1;
        let status = if log.cancelled {
            RunStatus::Cancelled
        } else if !log.errors.is_empty() {
            RunStatus::Partial
        } else if log.route == Some(Route::Idle) {
            RunStatus::Idle
        } else {
            RunStatus::Complete
        };

        let report = RunReport {
            status,
            cycle,
            route: log.route,
            working_set: log.working_set,
            chunks_processed: log.chunks_processed,
            sources_visited: state.visited_sources.len(),
            discoveries_enqueued: log.sink.enqueued,
            duplicates_skipped: log.sink.duplicates,
            discoveries_pending: state.discoveries_pending(),
            items_verified: log.items_verified,
            items_committed: log.items_committed,
            nodes_created_total: state.nodes_committed,
            relationships_created_total: state.relationships_committed,
            quality_threshold: state.quality_threshold,
            needs_research: log.needs_research,
            stages: log.stages,
            errors: log.errors,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        tracing::info!(
            cycle,
            status = report.status.as_str(),
            pending = report.discoveries_pending,
            nodes = report.nodes_created_total,
            errors = report.errors.len(),
            "pipeline cycle finished"
        );
        Ok(report)
    }
}

impl Pipeline {
    async fn run_stages(
        &self,
        calls: &CallGuard<'_>,
        state: &mut FlowState,
        log: &mut CycleLog,
    ) -> Result<()> {
        // discover
        state.advance(Stage::Discover)?;
        let t = Instant::now();
        self.discover(calls, log).await;
        log.stage_done(Stage::Discover, t);
        if calls.cancel.is_cancelled() {
            log.cancelled = true;
        }
        if log.cancelled {
            return Ok(());
        }

        // filter
        state.advance(Stage::Filter)?;
        let t = Instant::now();
        self.queue.release_stale(self.config.run_timeout()).await?;
        let pending = self.pending_window(state).await?;
        let working = state.select_working_set(pending);
        log.working_set = working.len();
        log.stage_done(Stage::Filter, t);

        // route
        let route = route(working.len());
        log.route = Some(route);
        tracing::info!(working_set = working.len(), route = %route, "working set routed");
        state.advance(route.stage())?;
        if calls.cancel.is_cancelled() {
            log.cancelled = true;
            return Ok(());
        }

        if route == Route::Idle {
            log.stage_done(Stage::Idle, Instant::now());
            state.advance(Stage::Report)?;
            return Ok(());
        }

        // curate / batch_curate
        let stage = route.stage();
        let t = Instant::now();
        let chunk_size = match route {
            Route::BatchProcess => state.chunk_size,
            _ => working.len(),
        };
        for (index, items) in chunk(&working, chunk_size).into_iter().enumerate() {
            if calls.cancel.is_cancelled() {
                log.cancelled = true;
                break;
            }
            tracing::debug!(chunk = index + 1, items = items.len(), "researching chunk");
            self.curate_chunk(calls, stage, items, state.quality_threshold, log)
                .await?;
            log.chunks_processed += 1;
        }
        if !log.taken_elsewhere.is_empty() {
            let taken = std::mem::take(&mut log.taken_elsewhere);
            state.pending_ids.retain(|id| !taken.contains(id));
        }
        log.stage_done(stage, t);
        if log.cancelled {
            return Ok(());
        }

        // commit
        state.advance(Stage::Commit)?;
        let t = Instant::now();
        self.commit(calls, state, log).await?;
        log.stage_done(Stage::Commit, t);
        if log.cancelled {
            return Ok(());
        }

        state.advance(Stage::Report)?;
        Ok(())
    }

    async fn discover(&self, calls: &CallGuard<'_>, log: &mut CycleLog) {
        let producers = self.collaborators.producers();
        if producers.is_empty() {
            tracing::debug!("no producers configured");
            return;
        }

        let sink = DiscoverySink::new(
            self.queue.clone(),
            self.registry.clone(),
            self.directive.max_discoveries,
        );
        let sink = &sink;
        let directive = &self.directive;

        let results: Vec<_> = futures::stream::iter(producers.iter())
            .map(|producer| async move {
                let name = producer_breaker(producer.name());
                let outcome = match self.breakers.get(&name) {
                    Some(breaker) => {
                        calls
                            .call(Stage::Discover, breaker, || producer.discover(directive, sink))
                            .await
                    }
                    None => Err(PipelineError::NotFound(format!("breaker {}", name))),
                };
                (name, outcome)
            })
            .buffer_unordered(self.config.max_parallel_scans.max(1))
            .collect()
            .await;

        for (name, outcome) in results {
            match outcome {
                Ok(report) => tracing::info!(
                    producer = %name,
                    enqueued = report.items_enqueued,
                    duplicates = report.duplicates,
                    sources = report.sources_scanned.len(),
                    "producer finished"
                ),
                Err(e) => log.fail(Stage::Discover, &name, Vec::new(), &e),
            }
        }
        log.sink = sink.totals();
    }

    /// Pending items in serving order from sources not yet visited, up to
    /// `max_batch_size`. Pages past visited sources so they cannot fill the
    /// window on their own.
    async fn pending_window(&self, state: &FlowState) -> Result<Vec<WorkItem>> {
        let window = state.max_batch_size;
        let mut candidates = Vec::new();
        let mut offset = 0;
        loop {
            let page = self.queue.peek_page(window, offset).await?;
            let fetched = page.len();
            offset += fetched;
            candidates.extend(
                page.into_iter()
                    .filter(|item| !state.visited_sources.contains(&item.source_id)),
            );
            if candidates.len() >= window || fetched < window {
                break;
            }
        }
        Ok(candidates)
    }

    /// Claim one chunk, research it, log its evidence, and validate every item.
    ///
    /// On a store error the chunk's still-claimed items are handed back to
    /// the queue before the error propagates.
    async fn curate_chunk(
        &self,
        calls: &CallGuard<'_>,
        stage: Stage,
        items: &[WorkItem],
        threshold: f64,
        log: &mut CycleLog,
    ) -> Result<()> {
        let ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
        let claimed = self.queue.claim(&ids).await?;
        if claimed.len() < ids.len() {
            log.taken_elsewhere
                .extend(ids.into_iter().filter(|id| !claimed.contains(id)));
        }
        if claimed.is_empty() {
            return Ok(());
        }
        let items: Vec<WorkItem> = items
            .iter()
            .filter(|item| claimed.contains(&item.id))
            .cloned()
            .collect();

        let outcome = self
            .research_claimed(calls, stage, &items, &claimed, threshold, log)
            .await;
        if let Err(e) = &outcome {
            if let Err(revert) = self
                .queue
                .transition(&claimed, ItemStatus::Claimed, ItemStatus::Pending)
                .await
            {
                tracing::error!(error = %revert, cause = %e, "could not release claimed chunk");
            }
        }
        outcome
    }

    async fn research_claimed(
        &self,
        calls: &CallGuard<'_>,
        stage: Stage,
        items: &[WorkItem],
        ids: &[String],
        threshold: f64,
        log: &mut CycleLog,
    ) -> Result<()> {
        let researcher = self.collaborators.researcher();
        let outcome = match self.breakers.get(RESEARCH_BREAKER) {
            Some(breaker) => {
                calls
                    .call(stage, breaker, || researcher.research(items))
                    .await
            }
            None => Err(PipelineError::NotFound(format!("breaker {}", RESEARCH_BREAKER))),
        };

        let outcomes = match outcome {
            Ok(outcomes) => outcomes,
            Err(e) => {
                self.queue
                    .transition(ids, ItemStatus::Claimed, ItemStatus::Pending)
                    .await?;
                log.fail(stage, researcher.name(), ids.to_vec(), &e);
                return Ok(());
            }
        };

        let mut by_id: HashMap<String, ResearchOutcome> = outcomes
            .into_iter()
            .map(|o| (o.item_id.clone(), o))
            .collect();

        for item in items {
            match by_id.remove(&item.id) {
                Some(outcome) if !outcome.evidence.is_empty() => {
                    self.verify(item, outcome, threshold, log).await?;
                }
                _ => {
                    tracing::debug!(id = %item.id, "no evidence returned");
                    self.queue
                        .transition(&[item.id.clone()], ItemStatus::Claimed, ItemStatus::Pending)
                        .await?;
                    log.needs_research.push(item.id.clone());
                }
            }
        }
        Ok(())
    }

    async fn verify(
        &self,
        item: &WorkItem,
        outcome: ResearchOutcome,
        threshold: f64,
        log: &mut CycleLog,
    ) -> Result<()> {
        let research_id = new_research_id(&item.id);
        self.research
            .open_or_get_session(&research_id, &item.id)
            .await?;
        for evidence in &outcome.evidence {
            self.research.log_step(&research_id, evidence).await?;
        }
        self.research.complete(&research_id).await?;
        let validation = self
            .research
            .validate_against(&research_id, threshold)
            .await?;

        if !validation.passed() {
            tracing::info!(
                id = %item.id,
                research_id = %research_id,
                issues = ?validation.issues,
                "item needs more research"
            );
            self.queue
                .transition(&[item.id.clone()], ItemStatus::Claimed, ItemStatus::Pending)
                .await?;
            log.needs_research.push(item.id.clone());
            return Ok(());
        }

        let moved = self
            .queue
            .transition(&[item.id.clone()], ItemStatus::Claimed, ItemStatus::Verified)
            .await?;
        if moved.is_empty() {
            tracing::warn!(id = %item.id, "claim lost before verification, skipping");
            return Ok(());
        }
        let mut payload = item.payload.clone();
        payload.extend(outcome.payload);
        log.items_verified += 1;
        log.verified.push(VerifiedPayload {
            item_id: item.id.clone(),
            kind: item.kind,
            research_id,
            completeness_score: validation.completeness_score,
            confidence: validation.overall_confidence,
            payload,
        });
        Ok(())
    }

    async fn commit(
        &self,
        calls: &CallGuard<'_>,
        state: &mut FlowState,
        log: &mut CycleLog,
    ) -> Result<()> {
        if log.verified.is_empty() {
            return Ok(());
        }
        // `log.verified` keeps the groups not yet settled, so a store error
        // leaves them for `run_cycle` to revert.
        let verified = log.verified.clone();

        let committer = self.collaborators.committer();
        let groups = chunk(&verified, state.chunk_size);
        for (index, group) in groups.iter().enumerate() {
            let ids: Vec<String> = group.iter().map(|v| v.item_id.clone()).collect();

            if calls.cancel.is_cancelled() {
                log.cancelled = true;
                let rest: Vec<String> = groups[index..]
                    .iter()
                    .flat_map(|g| g.iter().map(|v| v.item_id.clone()))
                    .collect();
                self.queue
                    .transition(&rest, ItemStatus::Verified, ItemStatus::Pending)
                    .await?;
                log.verified.clear();
                break;
            }

            let request = ApprovalRequest {
                stage: Stage::Commit,
                summary: format!("commit {} verified item(s) via '{}'", group.len(), committer.name()),
                item_ids: ids.clone(),
            };
            let decision = match self.approval.decide(&request).await {
                Ok(decision) => decision,
                Err(e) => {
                    tracing::warn!(error = %e, "approval prompt failed, treating as rejected");
                    Decision::Rejected
                }
            };
            if decision == Decision::Rejected {
                self.queue
                    .transition(&ids, ItemStatus::Verified, ItemStatus::Pending)
                    .await?;
                log.errors.push(ErrorEntry {
                    stage: Stage::Commit,
                    collaborator: Some("approval".to_string()),
                    item_ids: ids,
                    message: "commit rejected by approval gate".to_string(),
                    retryable: true,
                });
                log.verified.drain(..group.len());
                continue;
            }

            // A started commit runs to completion; cancel is honoured between groups.
            let outcome = match self.breakers.get(COMMIT_BREAKER) {
                Some(breaker) => calls.call_to_completion(breaker, || committer.commit(group)).await,
                None => Err(PipelineError::NotFound(format!("breaker {}", COMMIT_BREAKER))),
            };
            match outcome {
                Ok(summary) => {
                    self.queue
                        .transition(&ids, ItemStatus::Verified, ItemStatus::Committed)
                        .await?;
                    state.record_commit(&ids, summary.nodes_created, summary.relationships_created);
                    log.items_committed += ids.len();
                    tracing::info!(
                        items = ids.len(),
                        nodes = summary.nodes_created,
                        relationships = summary.relationships_created,
                        "group committed"
                    );
                }
                Err(e) => {
                    self.queue
                        .transition(&ids, ItemStatus::Verified, ItemStatus::Pending)
                        .await?;
                    log.fail(Stage::Commit, committer.name(), ids, &e);
                }
            }
            log.verified.drain(..group.len());
        }
        Ok(())
    }
}
