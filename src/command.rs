//! Collaborators backed by external commands.
//!
//! Each call spawns the configured command, writes one JSON document to its
//! stdin, and reads one JSON document from its stdout. A non-zero exit is a
//! failure; stderr is carried into the error message. Children are killed
//! if the call is dropped (timeout or cancellation).
//!
//! | Role       | stdin                        | stdout                                         |
//! |------------|------------------------------|------------------------------------------------|
//! | producer   | `{"directive": {...}}`       | `{"discoveries": [...], "sources": [...]}`     |
//! | researcher | `{"items": [...]}`           | `{"outcomes": [...]}`                          |
//! | committer  | `{"payloads": [...]}`        | `{"nodes_created": n, "relationships_created": m}` |

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::CommandConfig;
use crate::models::{Discovery, SourceKind, WorkItem};
use crate::traits::{
    CommitSummary, Committer, Directive, DiscoverySink, Enqueued, Producer, ProducerReport,
    ResearchOutcome, Researcher, VerifiedPayload,
};

async fn run_json<I, O>(label: &str, cfg: &CommandConfig, input: &I) -> Result<O>
where
    I: Serialize + ?Sized,
    O: DeserializeOwned,
{
    let body = serde_json::to_vec(input)?;

    let mut child = Command::new(&cfg.command)
        .args(&cfg.args)
        .envs(&cfg.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("{}: failed to spawn '{}'", label, cfg.command))?;

    let mut stdin = child
        .stdin
        .take()
        .with_context(|| format!("{}: stdin not captured", label))?;

    // Feed stdin while draining stdout so large documents cannot deadlock.
    let write = async move {
        let res = stdin.write_all(&body).await;
        drop(stdin);
        res
    };
    let (written, output) = tokio::join!(write, child.wait_with_output());
    let output = output.with_context(|| format!("{}: failed to wait for '{}'", label, cfg.command))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{} exited with {}: {}", label, output.status, stderr.trim());
    }
    // A child that exits successfully without reading stdin is fine.
    if let Err(e) = written {
        tracing::debug!(collaborator = label, error = %e, "stdin closed early");
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(stdout.trim())
        .with_context(|| format!("{}: invalid JSON on stdout", label))
}

// ═══════════════════════════════════════════════════════════════════════
// Producer
// ═══════════════════════════════════════════════════════════════════════

#[derive(Serialize)]
struct ProducerRequest<'a> {
    directive: &'a Directive,
}

#[derive(Deserialize)]
struct ProducerResponse {
    #[serde(default)]
    discoveries: Vec<Discovery>,
    #[serde(default)]
    sources: Vec<ScannedSource>,
}

#[derive(Deserialize)]
struct ScannedSource {
    url: String,
    #[serde(default)]
    kind: Option<SourceKind>,
    #[serde(default)]
    items_found: u32,
}

pub struct CommandProducer {
    name: String,
    config: CommandConfig,
}

impl CommandProducer {
    pub fn new(name: String, config: CommandConfig) -> Self {
        Self { name, config }
    }
}

#[async_trait]
impl Producer for CommandProducer {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.config.command
    }

    async fn discover(&self, directive: &Directive, sink: &DiscoverySink) -> Result<ProducerReport> {
        let label = format!("producer:{}", self.name);
        let response: ProducerResponse =
            run_json(&label, &self.config, &ProducerRequest { directive }).await?;

        let mut report = ProducerReport::default();
        for mut discovery in response.discoveries {
            if discovery.source_kind == SourceKind::Other {
                if let Some(kind) = self.config.source_kind {
                    discovery.source_kind = kind;
                }
            }
            match sink.enqueue(&discovery).await? {
                Enqueued::Queued => report.items_enqueued += 1,
                Enqueued::Duplicate => report.duplicates += 1,
                Enqueued::LimitReached => {
                    tracing::info!(producer = %self.name, "discovery budget spent");
                    break;
                }
            }
        }

        for source in response.sources {
            let kind = source.kind.or(self.config.source_kind);
            sink.register_source(&source.url, kind, source.items_found)
                .await?;
            report.sources_scanned.push(source.url);
        }

        Ok(report)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Researcher
// ═══════════════════════════════════════════════════════════════════════

#[derive(Serialize)]
struct ResearchRequest<'a> {
    items: &'a [WorkItem],
}

#[derive(Deserialize)]
struct ResearchResponse {
    #[serde(default)]
    outcomes: Vec<ResearchOutcome>,
}

pub struct CommandResearcher {
    config: CommandConfig,
}

impl CommandResearcher {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Researcher for CommandResearcher {
    fn name(&self) -> &str {
        "research"
    }

    async fn research(&self, items: &[WorkItem]) -> Result<Vec<ResearchOutcome>> {
        let response: ResearchResponse =
            run_json("research", &self.config, &ResearchRequest { items }).await?;
        Ok(response.outcomes)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Committer
// ═══════════════════════════════════════════════════════════════════════

#[derive(Serialize)]
struct CommitRequest<'a> {
    payloads: &'a [VerifiedPayload],
}

pub struct CommandCommitter {
    config: CommandConfig,
}

impl CommandCommitter {
    pub fn new(config: CommandConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Committer for CommandCommitter {
    fn name(&self) -> &str {
        "commit"
    }

    async fn commit(&self, payloads: &[VerifiedPayload]) -> Result<CommitSummary> {
        run_json("commit", &self.config, &CommitRequest { payloads }).await
    }
}
