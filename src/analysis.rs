//! Post-incident analysis: query related history, ask the LLM for a
//! structured narrative, persist it as an `analysis` event.
//!
//! Analyses are append-only like every other event; regeneration adds a new
//! event with `regenerated: true` and leaves the old one untouched.

use serde_json::{json, Value};
use tracing::info;

use crate::error::AgentError;
use crate::llm::{Adjudicator, AnalysisRequest};
use crate::store::{EventType, Incident, Store};

/// Inputs reconstructed from the live run (or from stored events, for
/// regeneration).
pub struct AnalysisInputs<'a> {
    pub incident: &'a Incident,
    pub runbook_id: &'a str,
    pub cluster_name: &'a str,
    pub alert_labels: Value,
    pub alert_annotations: Value,
    pub final_state: Value,
    pub regenerated: bool,
}

/// Compose the history-aware analysis and append it to the incident's log.
/// Returns the new event id and the markdown.
pub async fn compose_and_store(
    store: &Store,
    llm: &dyn Adjudicator,
    inputs: AnalysisInputs<'_>,
) -> Result<(i64, String), AgentError> {
    let node = inputs
        .alert_labels
        .get("node")
        .and_then(Value::as_str)
        .map(ToString::to_string);

    let past = store
        .query_similar(
            inputs.incident.id,
            inputs.incident.alertname.as_deref(),
            inputs.incident.namespace.as_deref(),
            inputs.incident.pod.as_deref(),
            node.as_deref(),
        )
        .await?;
    let past_count = past.len();

    let markdown = llm
        .generate_analysis(AnalysisRequest {
            runbook_id: inputs.runbook_id,
            cluster: inputs.cluster_name,
            alert_labels: inputs.alert_labels,
            alert_annotations: inputs.alert_annotations,
            final_state: inputs.final_state,
            past_incidents: if past.is_empty() {
                None
            } else {
                Some(serde_json::to_value(&past).unwrap_or(Value::Null))
            },
        })
        .await?;

    let event_id = store
        .append_event(
            inputs.incident.id,
            EventType::Analysis,
            &json!({
                "analysis_markdown": markdown,
                "runbook_id": inputs.runbook_id,
                "regenerated": inputs.regenerated,
            }),
        )
        .await?;

    info!(
        incident_id = inputs.incident.id,
        event_id,
        past_incidents = past_count,
        regenerated = inputs.regenerated,
        "analysis stored"
    );
    Ok((event_id, markdown))
}
