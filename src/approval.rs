//! Approval gate consulted before each commit call.
//!
//! The mode is fixed when the gate is built and never re-read from the
//! environment mid-run. `Interactive` asks on the terminal; without a
//! terminal on stdin it declines, so an unattended run never blocks.

use anyhow::Result;
use dialoguer::Confirm;
use serde::Serialize;

use crate::config::ApprovalMode;
use crate::flow::Stage;

/// What the controller is about to do, shown to whoever approves it.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub stage: Stage,
    pub summary: String,
    pub item_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy)]
pub struct ApprovalGate {
    mode: ApprovalMode,
}

impl ApprovalGate {
    pub fn new(mode: ApprovalMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> ApprovalMode {
        self.mode
    }

    pub async fn decide(&self, request: &ApprovalRequest) -> Result<Decision> {
        let decision = match self.mode {
            ApprovalMode::AutoApprove => Decision::Approved,
            ApprovalMode::AutoReject => Decision::Rejected,
            ApprovalMode::Interactive => {
                if !atty::is(atty::Stream::Stdin) {
                    tracing::warn!(
                        stage = %request.stage,
                        "interactive approval requested without a terminal, rejecting"
                    );
                    Decision::Rejected
                } else {
                    let prompt = format!(
                        "[{}] {} ({} item(s)). Proceed?",
                        request.stage,
                        request.summary,
                        request.item_ids.len()
                    );
                    let approved = tokio::task::spawn_blocking(move || {
                        Confirm::new().with_prompt(prompt).default(false).interact()
                    })
                    .await??;
                    if approved {
                        Decision::Approved
                    } else {
                        Decision::Rejected
                    }
                }
            }
        };

        tracing::info!(
            stage = %request.stage,
            items = request.item_ids.len(),
            decision = ?decision,
            "approval decided"
        );
        Ok(decision)
    }
}
