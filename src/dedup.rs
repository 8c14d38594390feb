//! The dedup controller: the seam between the webhook and the engine.
//!
//! For each inbound alert: upsert the incident keyed by fingerprint, record
//! the `webhook_received` event, then try the fingerprint's advisory lock.
//! Busy means another replica is already working this incident — record a
//! `suppressed` event and stop. Held means run the workflow, flush the
//! `final` and `analysis` events, and release on the same session. At most
//! one workflow per fingerprint runs at a time across every agent replica.

use std::sync::Arc;

use serde_json::json;
use tracing::{error, info, warn};

use crate::alerts::Alert;
use crate::analysis::{self, AnalysisInputs};
use crate::cluster::ClusterClient;
use crate::config::Config;
use crate::engine::{self, ExecutionState};
use crate::error::AgentError;
use crate::llm::Adjudicator;
use crate::router::{self, RunbookId};
use crate::runbook::RunbookTable;
use crate::store::{EventType, Incident, NewIncident, Store};

/// Per-alert processing outcome, reported back to the webhook response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertOutcome {
    /// Workflow ran (or was skipped for a recorded reason); `final` written.
    Handled { runbook_id: RunbookId },
    /// Lock busy; `suppressed` written.
    Suppressed,
}

/// Long-lived processor shared by all webhook tasks.
#[derive(Clone)]
pub struct IncidentProcessor {
    pub store: Store,
    pub cluster: Arc<dyn ClusterClient>,
    pub llm: Arc<dyn Adjudicator>,
    pub runbooks: Arc<RunbookTable>,
    pub config: Arc<Config>,
}

impl IncidentProcessor {
    /// Process one normalized alert end to end.
    pub async fn process_alert(&self, alert: Alert) -> Result<AlertOutcome, AgentError> {
        let incident = self
            .store
            .upsert_incident(&NewIncident {
                fingerprint: &alert.fingerprint,
                alertname: non_empty(alert.alertname()),
                namespace: non_empty(alert.namespace()),
                pod: non_empty(alert.pod()),
                severity: non_empty(alert.severity()),
                agent_mode: self.config.agent_mode.as_str(),
            })
            .await?;

        self.store
            .append_event(
                incident.id,
                EventType::WebhookReceived,
                &json!({
                    "cluster": self.config.cluster_name,
                    "alert_status": alert.status,
                    "labels": alert.labels,
                    "annotations": alert.annotations,
                    "startsAt": alert.starts_at,
                    "fingerprint": alert.fingerprint,
                }),
            )
            .await?;

        let Some(lock) = self.store.try_advisory_lock(&alert.fingerprint).await? else {
            info!(
                fingerprint = %alert.fingerprint,
                incident_id = incident.id,
                "lock busy, suppressing"
            );
            self.store
                .append_event(
                    incident.id,
                    EventType::Suppressed,
                    &json!({"reason": "lock_busy", "fingerprint": alert.fingerprint}),
                )
                .await?;
            return Ok(AlertOutcome::Suppressed);
        };

        // The lock guard's session is closed on any early exit, so Postgres
        // releases the lock even if event flushing fails below.
        let result = self.run_locked(&incident, &alert).await;
        lock.release().await;
        result
    }

    /// Workflow + event flushing, with the advisory lock held.
    async fn run_locked(
        &self,
        incident: &Incident,
        alert: &Alert,
    ) -> Result<AlertOutcome, AgentError> {
        let runbook_id = router::route(alert);

        let state = match self.check_runnable(runbook_id, alert) {
            Ok(Some(runbook)) => {
                engine::run_workflow(
                    runbook,
                    alert,
                    self.config.agent_mode,
                    self.cluster.as_ref(),
                    self.runbooks.as_ref(),
                    self.llm.as_ref(),
                )
                .await
            }
            Ok(None) => {
                warn!(alertname = alert.alertname(), "no runbook matched");
                ExecutionState::skipped(format!("unknown_runbook:{}", alert.alertname()))
            }
            Err(AgentError::InvalidAlert(label)) => {
                warn!(fingerprint = %alert.fingerprint, %label, "alert missing required label");
                ExecutionState::skipped(format!("invalid_alert:missing_label:{label}"))
            }
            Err(e) => return Err(e),
        };

        self.store
            .update_incident_runbook(incident.id, runbook_id.as_str())
            .await?;
        self.store
            .append_event(
                incident.id,
                EventType::Final,
                &json!({"runbook_id": runbook_id.as_str(), "state": state}),
            )
            .await?;

        // Analysis is best-effort: a prose failure must not turn a handled
        // incident into a webhook error.
        let analysis = analysis::compose_and_store(
            &self.store,
            self.llm.as_ref(),
            AnalysisInputs {
                incident,
                runbook_id: runbook_id.as_str(),
                cluster_name: &self.config.cluster_name,
                alert_labels: serde_json::to_value(&alert.labels).unwrap_or_default(),
                alert_annotations: serde_json::to_value(&alert.annotations).unwrap_or_default(),
                final_state: serde_json::to_value(&state).unwrap_or_default(),
                regenerated: false,
            },
        )
        .await;
        if let Err(e) = analysis {
            warn!(incident_id = incident.id, error = %e, "analysis generation failed");
        }

        Ok(AlertOutcome::Handled { runbook_id })
    }

    /// Decide whether the routed runbook can run: `Ok(Some)` to execute,
    /// `Ok(None)` for an unknown runbook, `Err(InvalidAlert)` when a
    /// required label is missing.
    fn check_runnable(
        &self,
        runbook_id: RunbookId,
        alert: &Alert,
    ) -> Result<Option<&crate::runbook::Runbook>, AgentError> {
        if runbook_id == RunbookId::Unknown {
            return Ok(None);
        }
        if runbook_id.targets_node() {
            if alert.node().is_empty() {
                return Err(AgentError::InvalidAlert("node".to_string()));
            }
        } else {
            if alert.namespace().is_empty() {
                return Err(AgentError::InvalidAlert("namespace".to_string()));
            }
            if alert.pod().is_empty() {
                return Err(AgentError::InvalidAlert("pod".to_string()));
            }
        }
        Ok(self.runbooks.get(runbook_id))
    }

    /// Process a batch: each alert runs as its own spawned task so a dropped
    /// webhook connection never abandons an in-flight workflow mid-mutation.
    pub async fn process_batch(&self, alerts: Vec<Alert>) -> Result<usize, AgentError> {
        let mut handles = Vec::with_capacity(alerts.len());
        for alert in alerts {
            let processor = self.clone();
            handles.push(tokio::spawn(async move {
                let fingerprint = alert.fingerprint.clone();
                let outcome = processor.process_alert(alert).await;
                if let Err(e) = &outcome {
                    error!(%fingerprint, error = %e, "alert processing failed");
                }
                outcome
            }));
        }

        let mut processed = 0usize;
        let mut first_error = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(_)) => processed += 1,
                Ok(Err(e)) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                Err(join_error) => {
                    error!(error = %join_error, "alert task panicked");
                }
            }
        }

        match first_error {
            Some(e) if processed == 0 => Err(e),
            _ => Ok(processed),
        }
    }
}

/// Sanity check at startup: every alias the loaded gates reference must be a
/// real tool alias, so a typo'd runbook fails the boot instead of silently
/// gating everything out.
pub fn lint_gate_aliases(runbooks: &RunbookTable) -> Result<(), String> {
    let known: Vec<&str> = crate::tools::ALL_TOOLS.iter().map(|t| t.alias()).collect();
    for id in [
        RunbookId::ImagePull,
        RunbookId::Oom,
        RunbookId::ContainerCreating,
        RunbookId::CrashLoop,
        RunbookId::NodeUnschedulable,
        RunbookId::NodeNotReady,
    ] {
        let Some(runbook) = runbooks.get(id) else {
            continue;
        };
        for step in &runbook.workflow {
            let gates = step.when.iter().chain(step.when_all.iter());
            for gate in gates {
                if !known.contains(&gate.alias.as_str()) {
                    return Err(format!(
                        "{id}: step `{}` gates on unknown alias `{}`",
                        step.action_id, gate.alias
                    ));
                }
            }
        }
    }
    Ok(())
}

fn non_empty(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}
