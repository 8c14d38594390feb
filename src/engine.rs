//! The runbook workflow engine.
//!
//! Drives a runbook's ordered steps over a per-incident execution state:
//! evaluate the step's gates against prior tool results, ask the adjudicator
//! for the tool call, enforce tool identity, execute through the registry,
//! and fold the result into the state. There are no loops, no retries, and
//! no branching beyond gates; a step failure never aborts the workflow,
//! because later diagnostics may still be worth recording and dependent
//! mutations are gated out naturally.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::alerts::Alert;
use crate::cluster::ClusterClient;
use crate::config::AgentMode;
use crate::llm::{Adjudicator, ToolCallRequest};
use crate::runbook::{GateExpr, Runbook, RunbookTable, Step};
use crate::tools::{self, ResultRecord, ToolCtx, ToolName};

/// Trace of one workflow step.
#[derive(Debug, Clone, Serialize)]
pub struct StepTrace {
    pub action_id: String,
    pub tool_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultRecord>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub gated_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// What happened when the adjudicator was consulted for a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmOutcome {
    /// Model returned the expected tool.
    Ok,
    /// Model returned a different tool; the engine substituted the expected one.
    LlmOverride,
    /// Model call failed; the engine fell back to default arguments.
    LlmError,
}

/// Trace of one adjudicator consultation.
#[derive(Debug, Clone, Serialize)]
pub struct LlmCall {
    pub step_action_id: String,
    pub expected_tool: String,
    pub outcome: LlmOutcome,
    /// Tool the model actually named.
    pub tool: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-incident execution state, discarded after the `final` event is
/// written.
#[derive(Debug, Default, Serialize)]
pub struct ExecutionState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_taken: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_recommended: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_error: Option<String>,
    pub rb_steps: Vec<StepTrace>,
    pub llm_trace: Vec<LlmCall>,
    #[serde(skip)]
    pub tool_results: HashMap<String, ResultRecord>,
}

impl ExecutionState {
    /// State representing a workflow that never ran (unknown runbook,
    /// invalid alert).
    #[must_use]
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            action_error: Some(reason.into()),
            ..Self::default()
        }
    }
}

fn gate_passes(gate: &GateExpr, results: &HashMap<String, ResultRecord>) -> bool {
    results
        .get(&gate.alias)
        .is_some_and(|record| record.truthy(&gate.field))
}

/// Evaluate a step's gates; `Some(reason)` means gated out.
fn gate_reason(step: &Step, results: &HashMap<String, ResultRecord>) -> Option<String> {
    if let Some(gate) = &step.when {
        if !gate_passes(gate, results) {
            return Some(format!("gate false: {gate}"));
        }
    }
    for gate in &step.when_all {
        if !gate_passes(gate, results) {
            return Some(format!("gate false: {gate}"));
        }
    }
    None
}

/// Arguments every tool can fall back to, derived from the alert labels (and
/// the runbook, for the image fix).
fn default_args(tool: ToolName, alert: &Alert, runbook: &Runbook) -> Value {
    match tool {
        ToolName::GetNodeReady
        | ToolName::GetNodeConditions
        | ToolName::CordonNode
        | ToolName::UncordonNode
        | ToolName::DrainNode => json!({"node": alert.node()}),
        ToolName::GetRunbook => json!({"runbook_id": runbook.id.as_str()}),
        ToolName::FixImagepullbackoff => json!({
            "namespace": alert.namespace(),
            "pod": alert.pod(),
            "container": alert.container(),
            "fallback_image": runbook.fallback_image.clone().unwrap_or_default(),
        }),
        ToolName::DeletePod => json!({
            "namespace": alert.namespace(),
            "pod": alert.pod(),
        }),
        _ => json!({
            "namespace": alert.namespace(),
            "pod": alert.pod(),
            "container": alert.container(),
        }),
    }
}

/// Overlay the model's arguments on the defaults. Nulls and empty strings
/// never displace a default; the model fills gaps, it does not blank fields.
fn merge_args(defaults: Value, overrides: &Value) -> Value {
    let Value::Object(mut merged) = defaults else {
        return defaults;
    };
    if let Value::Object(overrides) = overrides {
        for (key, value) in overrides {
            let blank = value.is_null() || value.as_str().is_some_and(str::is_empty);
            if !blank {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(merged)
}

/// Run one runbook workflow to completion and return the final state.
pub async fn run_workflow(
    runbook: &Runbook,
    alert: &Alert,
    mode: AgentMode,
    cluster: &dyn ClusterClient,
    runbooks: &RunbookTable,
    llm: &dyn Adjudicator,
) -> ExecutionState {
    let mut state = ExecutionState::default();
    let ctx = ToolCtx {
        cluster,
        runbooks,
        mode,
    };

    // Seed runbook-derived config so argument defaulting and gates can see it
    // without an extra round trip.
    if let Some(fallback) = &runbook.fallback_image {
        state.tool_results.insert(
            ToolName::GetRunbook.alias().to_string(),
            ResultRecord::success(json!({
                "runbook_id": runbook.id.as_str(),
                "fallback_image": fallback,
            })),
        );
    }

    info!(
        runbook_id = %runbook.id,
        steps = runbook.workflow.len(),
        mode = %mode,
        fingerprint = %alert.fingerprint,
        "workflow start"
    );

    for step in &runbook.workflow {
        if let Some(reason) = gate_reason(step, &state.tool_results) {
            info!(action_id = %step.action_id, %reason, "step gated out");
            state.rb_steps.push(StepTrace {
                action_id: step.action_id.clone(),
                tool_name: step.tool.as_str().to_string(),
                inputs: None,
                result: None,
                gated_out: true,
                reason: Some(reason),
            });
            continue;
        }

        let expected = step.tool;
        let defaults = default_args(expected, alert, runbook);

        let args = match llm
            .decide_tool_call(ToolCallRequest {
                runbook_id: runbook.id.as_str(),
                step_action_id: &step.action_id,
                expected_tool: expected,
                runbook_body: &runbook.body,
                alert_context: json!({
                    "namespace": alert.namespace(),
                    "pod": alert.pod(),
                    "container": alert.container(),
                    "node": alert.node(),
                    "mode": mode.as_str(),
                }),
                tool_results: results_snapshot(&state.tool_results),
            })
            .await
        {
            Ok(decision) if decision.tool == expected.as_str() => {
                state.llm_trace.push(LlmCall {
                    step_action_id: step.action_id.clone(),
                    expected_tool: expected.as_str().to_string(),
                    outcome: LlmOutcome::Ok,
                    tool: decision.tool,
                    reason: Some(decision.reason).filter(|r| !r.is_empty()),
                    error: None,
                });
                merge_args(defaults, &decision.arguments)
            }
            Ok(decision) => {
                // The runbook declared the plan; an off-script tool choice is
                // overridden, not obeyed.
                warn!(
                    action_id = %step.action_id,
                    expected = %expected,
                    got = %decision.tool,
                    "adjudicator returned wrong tool, substituting expected"
                );
                state.llm_trace.push(LlmCall {
                    step_action_id: step.action_id.clone(),
                    expected_tool: expected.as_str().to_string(),
                    outcome: LlmOutcome::LlmOverride,
                    tool: decision.tool,
                    reason: Some(decision.reason).filter(|r| !r.is_empty()),
                    error: None,
                });
                defaults
            }
            Err(e) => {
                warn!(action_id = %step.action_id, error = %e, "adjudicator failed, using defaults");
                state.llm_trace.push(LlmCall {
                    step_action_id: step.action_id.clone(),
                    expected_tool: expected.as_str().to_string(),
                    outcome: LlmOutcome::LlmError,
                    tool: String::new(),
                    reason: None,
                    error: Some(e.to_string()),
                });
                defaults
            }
        };

        let record = tools::execute(expected, &args, &ctx).await;

        // Aggregate before the record moves into the trace.
        if record.ok {
            if expected.is_mutating() {
                let message = record
                    .str_field("action")
                    .or_else(|| record.str_field("reason"))
                    .unwrap_or_default()
                    .to_string();
                if mode == AgentMode::Auto && !record.truthy("noop") {
                    state.action_taken = Some(message);
                } else {
                    state.action_recommended = Some(message);
                }
            }
        } else if let Some(error) = &record.error {
            state.action_error = Some(error.clone());
        }

        state.rb_steps.push(StepTrace {
            action_id: step.action_id.clone(),
            tool_name: expected.as_str().to_string(),
            inputs: Some(args),
            result: Some(record.clone()),
            gated_out: false,
            reason: None,
        });
        state
            .tool_results
            .insert(expected.alias().to_string(), record);
    }

    info!(
        runbook_id = %runbook.id,
        action_taken = state.action_taken.as_deref().unwrap_or(""),
        action_recommended = state.action_recommended.as_deref().unwrap_or(""),
        action_error = state.action_error.as_deref().unwrap_or(""),
        "workflow done"
    );
    state
}

/// JSON view of `tool_results` for prompts and persisted payloads.
#[must_use]
pub fn results_snapshot(results: &HashMap<String, ResultRecord>) -> Value {
    let mut map = Map::new();
    for (alias, record) in results {
        map.insert(
            alias.clone(),
            serde_json::to_value(record).unwrap_or(Value::Null),
        );
    }
    Value::Object(map)
}
