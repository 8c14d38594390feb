//! Read-only tools: safe to run in either agent mode.

use std::sync::OnceLock;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Event;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::{ResultRecord, ToolCtx};
use crate::router::RunbookId;

const DEFAULT_EVENT_LIMIT: usize = 25;
const MAX_MATCH_SAMPLES: usize = 5;

#[derive(Debug, Deserialize)]
struct PodEventsArgs {
    namespace: String,
    pod: String,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct PodArgs {
    namespace: String,
    pod: String,
    #[serde(default)]
    container: String,
}

#[derive(Debug, Deserialize)]
struct NodeArgs {
    node: String,
}

#[derive(Debug, Deserialize)]
struct RunbookArgs {
    runbook_id: String,
}

/// Kubelet and runtime messages spell the OOM kill several ways.
fn oom_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\boom[- ]?killed\b|oomkilled|out of memory|memory limit too low").unwrap()
    })
}

fn mentions_oom(text: &str) -> bool {
    oom_pattern().is_match(text)
}

fn mentions_sandbox_failure(text: &str) -> bool {
    (text.contains("failedcreatepodsandbox") || text.contains("pod sandbox"))
        && (text.contains("cannot start a stopped process")
            || text.contains("cannot start a container that has stopped"))
}

fn mentions_imagepull(text: &str) -> bool {
    text.contains("imagepullbackoff")
        || text.contains("errimagepull")
        || text.contains("failed to pull image")
}

fn event_text(event: &Event) -> String {
    format!(
        "{} {}",
        event.reason.as_deref().unwrap_or_default(),
        event.message.as_deref().unwrap_or_default()
    )
    .to_lowercase()
}

/// Best-available timestamp for ordering; clusters don't guarantee event order.
fn event_ts(event: &Event) -> String {
    if let Some(ts) = &event.last_timestamp {
        return ts.0.to_rfc3339();
    }
    if let Some(ts) = &event.event_time {
        return ts.0.to_rfc3339();
    }
    event
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|t| t.0.to_rfc3339())
        .unwrap_or_default()
}

/// Fetch recent events for a pod and classify OOM, sandbox, and image-pull
/// signals. Used to triage ambiguous states like `ContainerCreating`.
pub async fn get_pod_events(args: &Value, ctx: &ToolCtx<'_>) -> Result<ResultRecord> {
    let args: PodEventsArgs =
        serde_json::from_value(args.clone()).context("missing_required_params")?;
    let limit = args.limit.unwrap_or(DEFAULT_EVENT_LIMIT).max(1);

    let mut events = ctx.cluster.pod_events(&args.namespace, &args.pod).await?;
    events.sort_by(|a, b| event_ts(b).cmp(&event_ts(a)));
    events.truncate(limit);

    let mut records = Vec::with_capacity(events.len());
    let mut oom_matches = Vec::new();
    let mut sandbox_matches = Vec::new();
    let mut imagepull_hint = false;

    for event in &events {
        records.push(json!({
            "type": event.type_.as_deref().unwrap_or_default(),
            "reason": event.reason.as_deref().unwrap_or_default(),
            "message": event.message.as_deref().unwrap_or_default(),
            "count": event.count,
            "ts": event_ts(event),
        }));

        let text = event_text(event);
        let sample = || {
            format!(
                "{}: {}",
                event.reason.as_deref().unwrap_or_default(),
                event.message.as_deref().unwrap_or_default()
            )
        };
        if mentions_oom(&text) && oom_matches.len() < MAX_MATCH_SAMPLES {
            oom_matches.push(sample());
        }
        if mentions_sandbox_failure(&text) && sandbox_matches.len() < MAX_MATCH_SAMPLES {
            sandbox_matches.push(sample());
        }
        if mentions_imagepull(&text) {
            imagepull_hint = true;
        }
    }

    info!(
        namespace = %args.namespace,
        pod = %args.pod,
        events = records.len(),
        oom_detected = !oom_matches.is_empty(),
        sandbox_failure_detected = !sandbox_matches.is_empty(),
        "get_pod_events"
    );

    Ok(ResultRecord::success(json!({
        "namespace": args.namespace,
        "pod": args.pod,
        "events": records,
        "oom_detected": !oom_matches.is_empty(),
        "oom_matches": oom_matches,
        "sandbox_failure_detected": !sandbox_matches.is_empty(),
        "sandbox_failure_matches": sandbox_matches,
        "imagepull_hint": imagepull_hint,
    })))
}

/// Detect ImagePullBackOff/ErrImagePull via container waiting reasons and the
/// event stream.
pub async fn check_imagepullbackoff(args: &Value, ctx: &ToolCtx<'_>) -> Result<ResultRecord> {
    let args: PodArgs = serde_json::from_value(args.clone()).context("missing_required_params")?;
    let pod = ctx.cluster.get_pod(&args.namespace, &args.pod).await?;

    let mut detected = false;
    let mut detected_container = String::new();
    let mut reasons = Vec::new();

    let statuses = pod
        .status
        .and_then(|s| s.container_statuses)
        .unwrap_or_default();
    for cs in &statuses {
        if !args.container.is_empty() && cs.name != args.container {
            continue;
        }
        let waiting_reason = cs
            .state
            .as_ref()
            .and_then(|s| s.waiting.as_ref())
            .and_then(|w| w.reason.as_deref())
            .unwrap_or_default();
        if matches!(waiting_reason, "ImagePullBackOff" | "ErrImagePull") {
            detected = true;
            detected_container = cs.name.clone();
            reasons.push(format!("pod_status_waiting_reason:{waiting_reason}"));
        }
    }

    for event in ctx.cluster.pod_events(&args.namespace, &args.pod).await? {
        if mentions_imagepull(&event_text(&event)) {
            detected = true;
            reasons.push("event_mentions_imagepull".to_string());
        }
    }

    reasons.sort();
    reasons.dedup();

    let container = if detected_container.is_empty() {
        args.container.clone()
    } else {
        detected_container
    };
    info!(
        namespace = %args.namespace,
        pod = %args.pod,
        detected,
        "check_imagepullbackoff"
    );

    Ok(ResultRecord::success(json!({
        "namespace": args.namespace,
        "pod": args.pod,
        "imagepull_detected": detected,
        "container": container,
        "reasons": reasons,
    })))
}

/// Detect an OOM kill via terminated container state (reason or exit code)
/// and the event stream.
pub async fn check_oom(args: &Value, ctx: &ToolCtx<'_>) -> Result<ResultRecord> {
    let args: PodArgs = serde_json::from_value(args.clone()).context("missing_required_params")?;
    let pod = ctx.cluster.get_pod(&args.namespace, &args.pod).await?;

    let mut detected = false;
    let mut detected_container = String::new();
    let mut reasons = Vec::new();

    let statuses = pod
        .status
        .and_then(|s| s.container_statuses)
        .unwrap_or_default();
    for cs in &statuses {
        if !args.container.is_empty() && cs.name != args.container {
            continue;
        }
        let terminated_states = [
            cs.state.as_ref().and_then(|s| s.terminated.as_ref()),
            cs.last_state.as_ref().and_then(|s| s.terminated.as_ref()),
        ];
        for term in terminated_states.into_iter().flatten() {
            let oom_reason = term.reason.as_deref() == Some("OOMKilled");
            if oom_reason || term.exit_code == 137 {
                detected = true;
                detected_container = cs.name.clone();
                reasons.push(if oom_reason {
                    "pod_status_terminated_reason:OOMKilled".to_string()
                } else {
                    "pod_status_terminated_exit_code:137".to_string()
                });
            }
        }
    }

    for event in ctx.cluster.pod_events(&args.namespace, &args.pod).await? {
        if mentions_oom(&event_text(&event)) {
            detected = true;
            reasons.push("event_mentions_oom".to_string());
        }
    }

    reasons.sort();
    reasons.dedup();

    let container = if detected_container.is_empty() {
        args.container.clone()
    } else {
        detected_container
    };
    info!(namespace = %args.namespace, pod = %args.pod, detected, "check_oom");

    Ok(ResultRecord::success(json!({
        "namespace": args.namespace,
        "pod": args.pod,
        "oom_detected": detected,
        "container": container,
        "reasons": reasons,
    })))
}

/// Report a node's Ready condition and schedulability.
pub async fn get_node_ready(args: &Value, ctx: &ToolCtx<'_>) -> Result<ResultRecord> {
    let args: NodeArgs = serde_json::from_value(args.clone()).context("missing_required_params")?;
    let node = ctx.cluster.get_node(&args.node).await?;

    let conditions = node
        .status
        .and_then(|s| s.conditions)
        .unwrap_or_default();
    let ready_condition = conditions.iter().find(|c| c.type_ == "Ready");
    let ready = ready_condition.is_some_and(|c| c.status == "True");
    let ready_rec = ready_condition.map(|c| {
        json!({
            "type": "Ready",
            "status": c.status,
            "reason": c.reason.as_deref().unwrap_or_default(),
            "message": c.message.as_deref().unwrap_or_default(),
        })
    });

    let unschedulable = node
        .spec
        .and_then(|s| s.unschedulable)
        .unwrap_or(false);

    info!(node = %args.node, ready, unschedulable, "get_node_ready");

    Ok(ResultRecord::success(json!({
        "node": args.node,
        "ready": ready,
        "not_ready": !ready,
        "unschedulable": unschedulable,
        "ready_condition": ready_rec,
    })))
}

/// Inspect node conditions excluding the Ready gate. Healthy means every
/// non-Ready condition sits at its benign `False` value (node-problem-detector
/// style: `False` ⇒ not detected).
pub async fn get_node_conditions(args: &Value, ctx: &ToolCtx<'_>) -> Result<ResultRecord> {
    let args: NodeArgs = serde_json::from_value(args.clone()).context("missing_required_params")?;
    let node = ctx.cluster.get_node(&args.node).await?;

    let conditions = node
        .status
        .and_then(|s| s.conditions)
        .unwrap_or_default();

    let mut by_type = serde_json::Map::new();
    let mut problems = Vec::new();
    for c in &conditions {
        let rec = json!({
            "type": c.type_,
            "status": c.status,
            "reason": c.reason.as_deref().unwrap_or_default(),
            "message": c.message.as_deref().unwrap_or_default(),
        });
        if c.type_ != "Ready" && c.status != "False" {
            problems.push(rec.clone());
        }
        by_type.insert(c.type_.clone(), rec);
    }

    let healthy = problems.is_empty();
    info!(node = %args.node, healthy, problems = problems.len(), "get_node_conditions");

    Ok(ResultRecord::success(json!({
        "node": args.node,
        "healthy": healthy,
        "problems": problems,
        "conditions": by_type,
    })))
}

/// Read in-memory runbook metadata (fallback image and friends).
pub fn get_runbook(args: &Value, ctx: &ToolCtx<'_>) -> Result<ResultRecord> {
    let args: RunbookArgs =
        serde_json::from_value(args.clone()).context("missing_required_params")?;

    let Some(runbook) = RunbookId::parse(&args.runbook_id).and_then(|id| ctx.runbooks.get(id))
    else {
        return Ok(ResultRecord::fail(format!(
            "runbook_not_found:{}",
            args.runbook_id
        )));
    };

    Ok(ResultRecord::success(json!({
        "runbook_id": runbook.id.as_str(),
        "title": runbook.title,
        "alertname": runbook.alert_name,
        "fallback_image": runbook.fallback_image,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::config::AgentMode;
    use crate::runbook::RunbookTable;

    fn ctx<'a>(cluster: &'a FakeCluster, runbooks: &'a RunbookTable) -> ToolCtx<'a> {
        ToolCtx {
            cluster,
            runbooks,
            mode: AgentMode::Recommend,
        }
    }

    #[tokio::test]
    async fn pod_events_classifies_oom_and_sandbox() {
        let fake = FakeCluster::new();
        fake.add_event("demo", "app-x", "BackOff", "container was OOM-killed");
        fake.add_event(
            "demo",
            "app-x",
            "FailedCreatePodSandBox",
            "cannot start a stopped process: unknown",
        );
        fake.add_event("other", "app-x", "BackOff", "out of memory"); // wrong namespace

        let runbooks = RunbookTable::default();
        let rec = get_pod_events(
            &json!({"namespace": "demo", "pod": "app-x"}),
            &ctx(&fake, &runbooks),
        )
        .await
        .unwrap();

        assert!(rec.ok);
        assert!(rec.truthy("oom_detected"));
        assert!(rec.truthy("sandbox_failure_detected"));
        assert!(!rec.truthy("imagepull_hint"));
        assert_eq!(rec.field("events").unwrap().as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn imagepull_detected_from_waiting_reason() {
        let fake = FakeCluster::new();
        fake.add_owned_workload("demo", "app-x", "app-deployment", "app", "bad:tag", None);
        fake.set_waiting_reason("demo", "app-x", "app", "ImagePullBackOff");

        let runbooks = RunbookTable::default();
        let rec = check_imagepullbackoff(
            &json!({"namespace": "demo", "pod": "app-x"}),
            &ctx(&fake, &runbooks),
        )
        .await
        .unwrap();

        assert!(rec.truthy("imagepull_detected"));
        assert_eq!(rec.str_field("container"), Some("app"));
        let reasons = rec.field("reasons").unwrap().as_array().unwrap();
        assert!(reasons
            .iter()
            .any(|r| r.as_str() == Some("pod_status_waiting_reason:ImagePullBackOff")));
    }

    #[tokio::test]
    async fn imagepull_not_detected_on_healthy_pod() {
        let fake = FakeCluster::new();
        fake.add_owned_workload("demo", "app-x", "app-deployment", "app", "good:1.0", None);

        let runbooks = RunbookTable::default();
        let rec = check_imagepullbackoff(
            &json!({"namespace": "demo", "pod": "app-x"}),
            &ctx(&fake, &runbooks),
        )
        .await
        .unwrap();
        assert!(rec.ok);
        assert!(!rec.truthy("imagepull_detected"));
    }

    #[tokio::test]
    async fn oom_detected_from_last_terminated_state() {
        let fake = FakeCluster::new();
        fake.add_owned_workload("demo", "app-x", "app-deployment", "app", "app:1", None);
        fake.set_oom_killed("demo", "app-x", "app");

        let runbooks = RunbookTable::default();
        let rec = check_oom(
            &json!({"namespace": "demo", "pod": "app-x", "container": "app"}),
            &ctx(&fake, &runbooks),
        )
        .await
        .unwrap();

        assert!(rec.truthy("oom_detected"));
        assert_eq!(rec.str_field("container"), Some("app"));
    }

    #[tokio::test]
    async fn missing_pod_becomes_failed_record_not_error() {
        let fake = FakeCluster::new();
        let runbooks = RunbookTable::default();
        let rec = super::super::execute(
            super::super::ToolName::CheckOom,
            &json!({"namespace": "demo", "pod": "ghost"}),
            &ctx(&fake, &runbooks),
        )
        .await;
        assert!(!rec.ok);
        assert!(rec.error.as_deref().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn node_ready_reports_unschedulable_flag() {
        let fake = FakeCluster::new();
        fake.add_simple_node("node-a", true, true, &[("MemoryPressure", "False")]);

        let runbooks = RunbookTable::default();
        let rec = get_node_ready(&json!({"node": "node-a"}), &ctx(&fake, &runbooks))
            .await
            .unwrap();
        assert!(rec.truthy("ready"));
        assert!(!rec.truthy("not_ready"));
        assert!(rec.truthy("unschedulable"));
    }

    #[tokio::test]
    async fn node_conditions_flag_pressure() {
        let fake = FakeCluster::new();
        fake.add_simple_node(
            "node-a",
            true,
            false,
            &[("MemoryPressure", "True"), ("DiskPressure", "False")],
        );

        let runbooks = RunbookTable::default();
        let rec = get_node_conditions(&json!({"node": "node-a"}), &ctx(&fake, &runbooks))
            .await
            .unwrap();
        assert!(!rec.truthy("healthy"));
        assert_eq!(rec.field("problems").unwrap().as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn node_conditions_healthy_when_all_false() {
        let fake = FakeCluster::new();
        fake.add_simple_node(
            "node-a",
            true,
            false,
            &[("MemoryPressure", "False"), ("DiskPressure", "False")],
        );

        let runbooks = RunbookTable::default();
        let rec = get_node_conditions(&json!({"node": "node-a"}), &ctx(&fake, &runbooks))
            .await
            .unwrap();
        assert!(rec.truthy("healthy"));
    }
}
