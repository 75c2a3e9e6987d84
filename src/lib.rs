//! # gearflow
//!
//! Durable coordination for a three-stage fact-collection pipeline:
//! discovery of candidate facts, research of those facts, and commitment
//! of verified facts into a persistent store.
//!
//! The heavy lifting (scanning sources, reasoning over evidence, writing
//! graph nodes) is done by external collaborators. gearflow owns what sits
//! between them: a deduplicated priority queue, a visited-source registry,
//! an append-only research log with quality scoring, a staged controller,
//! and the retry / circuit-breaker discipline around every external call.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  enqueue   ┌───────────────────┐  peek    ┌────────────┐
//! │ Producers  │──────────▶│  Discovery Queue   │────────▶│ Controller │
//! │ (scanners) │  register  │  Source Registry   │          │  (FSM)     │
//! └────────────┘──────────▶└───────────────────┘          └─────┬──────┘
//!                                                               │
//!                      ┌──────────────┐   evidence   ┌──────────┴──┐
//!                      │ Research Log │◀─────────────│ Researcher  │
//!                      └──────┬───────┘              └─────────────┘
//!                             │ PASS                 ┌─────────────┐
//!                             └─────────────────────▶│ Committer   │
//!                                                    └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! gflow init                         # create database
//! gflow enqueue discoveries.json     # seed the queue
//! gflow queue stats
//! gflow run                          # one pipeline cycle
//! gflow research show <item-id>      # audit trail
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types |
//! | [`queue`] | Discovery Queue |
//! | [`registry`] | Source Registry |
//! | [`research`] | Research Log and scoring |
//! | [`resilience`] | Retry and circuit breaker |
//! | [`traits`] | Collaborator traits |
//! | [`command`] | Collaborators run as child processes |
//! | [`approval`] | Approval gate before commit |
//! | [`flow`] | Flow State, stages and routing |
//! | [`controller`] | Pipeline Controller |
//! | [`report`] | Run report |
//! | [`stats`] | Terminal renderers |

pub mod approval;
pub mod command;
pub mod config;
pub mod controller;
pub mod db;
pub mod error;
pub mod flow;
pub mod migrate;
pub mod models;
pub mod queue;
pub mod registry;
pub mod report;
pub mod research;
pub mod resilience;
pub mod stats;
pub mod traits;
