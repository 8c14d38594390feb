//! Crate-level error taxonomy for the ingest path.
//!
//! Most failures never surface as errors at all: tool failures are captured
//! in their `ResultRecord`, lock contention is a handled `suppressed`
//! outcome, and an off-script adjudicator is recovered by substitution.
//! What remains is what a webhook response can actually act on.

use thiserror::Error;

use crate::cluster::ClusterError;
use crate::llm::LlmError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AgentError {
    /// The alert is missing a label its runbook cannot run without.
    #[error("invalid alert: missing label `{0}`")]
    InvalidAlert(String),
    /// No runbook matches the alert.
    #[error("no runbook for alert `{0}`")]
    UnknownRunbook(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    Llm(#[from] LlmError),
}
