//! Mutating tools. Each honors the agent mode: `auto` performs the change,
//! `recommend` computes the identical change string without touching the
//! cluster. Either way the record carries an `action` field the engine
//! aggregates into `action_taken` / `action_recommended`.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::owner::{resolve_owning_deployment, select_container, template_containers};
use super::{ResultRecord, ToolCtx};
use crate::config::AgentMode;
use crate::quantity::{bump_limit, format_bytes, parse_bytes, MAX_LIMIT_BYTES};

/// Static (mirror) pods carry this annotation and must never be evicted.
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

#[derive(Debug, Deserialize)]
struct FixImageArgs {
    namespace: String,
    pod: String,
    #[serde(default)]
    container: String,
    #[serde(default)]
    fallback_image: String,
}

#[derive(Debug, Deserialize)]
struct PodArgs {
    namespace: String,
    pod: String,
    #[serde(default)]
    container: String,
}

#[derive(Debug, Deserialize)]
struct DeletePodArgs {
    namespace: String,
    pod: String,
}

#[derive(Debug, Deserialize)]
struct NodeArgs {
    node: String,
}

/// Remediate ImagePullBackOff by patching the owning Deployment's container
/// image to the runbook fallback.
pub async fn fix_imagepullbackoff(args: &Value, ctx: &ToolCtx<'_>) -> Result<ResultRecord> {
    let args: FixImageArgs =
        serde_json::from_value(args.clone()).context("missing_required_params")?;
    if args.namespace.is_empty() || args.pod.is_empty() {
        return Ok(ResultRecord::fail("missing_required_params"));
    }
    if args.fallback_image.is_empty() {
        return Ok(ResultRecord::fail("missing_fallback_image"));
    }

    let (deployment_name, deployment) =
        resolve_owning_deployment(ctx.cluster, &args.namespace, &args.pod).await?;
    let container =
        select_container(template_containers(&deployment), &args.container, &args.pod)?
            .name
            .clone();

    let action = format!(
        "patch_image:{}/{}/{}:{}",
        args.namespace, deployment_name, container, args.fallback_image
    );

    if ctx.mode == AgentMode::Auto {
        let patch = json!({
            "spec": {"template": {"spec": {"containers": [
                {"name": container, "image": args.fallback_image}
            ]}}}
        });
        ctx.cluster
            .patch_deployment(&args.namespace, &deployment_name, &patch)
            .await?;
    }
    info!(
        namespace = %args.namespace,
        deployment = %deployment_name,
        mode = %ctx.mode,
        "fix_imagepullbackoff"
    );

    Ok(ResultRecord::success(json!({
        "action": action,
        "deployment": deployment_name,
        "container": container,
        "image": args.fallback_image,
        "mode": ctx.mode.as_str(),
    })))
}

/// Remediate OOMKilled by bumping the owning Deployment's container memory
/// limit: double it, with a 256Mi floor and a 4Gi ceiling. An unknown
/// current limit lands on the floor; at or above the ceiling is a no-op.
pub async fn increase_memory_limit(args: &Value, ctx: &ToolCtx<'_>) -> Result<ResultRecord> {
    let args: PodArgs = serde_json::from_value(args.clone()).context("missing_required_params")?;
    if args.namespace.is_empty() || args.pod.is_empty() {
        return Ok(ResultRecord::fail("missing_required_params"));
    }

    let (deployment_name, deployment) =
        resolve_owning_deployment(ctx.cluster, &args.namespace, &args.pod).await?;
    let container =
        select_container(template_containers(&deployment), &args.container, &args.pod)?;
    let container_name = container.name.clone();

    let current_text = container
        .resources
        .as_ref()
        .and_then(|r| r.limits.as_ref())
        .and_then(|l| l.get("memory"))
        .map(|q| q.0.clone());
    let current_bytes = match &current_text {
        Some(text) => Some(parse_bytes(text).map_err(anyhow::Error::msg)?),
        None => None,
    };

    if current_bytes.is_some_and(|cur| cur >= MAX_LIMIT_BYTES) {
        info!(
            namespace = %args.namespace,
            deployment = %deployment_name,
            "increase_memory_limit at ceiling, no-op"
        );
        return Ok(ResultRecord::success(json!({
            "noop": true,
            "reason": "current_limit_at_or_above_max",
            "deployment": deployment_name,
            "container": container_name,
            "old_limit": current_text,
            "new_limit": current_text,
            "mode": ctx.mode.as_str(),
        })));
    }

    let new_bytes = bump_limit(current_bytes);
    let new_limit = format_bytes(new_bytes);
    let old_limit = current_text.unwrap_or_else(|| "unset".to_string());
    let action = format!(
        "patch_memory_limit:{}/{}/{}:{}→{}",
        args.namespace, deployment_name, container_name, old_limit, new_limit
    );

    if ctx.mode == AgentMode::Auto {
        let patch = json!({
            "spec": {"template": {"spec": {"containers": [
                {"name": container_name, "resources": {"limits": {"memory": new_limit}}}
            ]}}}
        });
        ctx.cluster
            .patch_deployment(&args.namespace, &deployment_name, &patch)
            .await?;
    }
    info!(
        namespace = %args.namespace,
        deployment = %deployment_name,
        old_limit = %old_limit,
        new_limit = %new_limit,
        mode = %ctx.mode,
        "increase_memory_limit"
    );

    Ok(ResultRecord::success(json!({
        "action": action,
        "deployment": deployment_name,
        "container": container_name,
        "old_limit": old_limit,
        "new_limit": new_limit,
        "mode": ctx.mode.as_str(),
    })))
}

/// Delete a pod so its controller recreates it. Bare pods are refused; the
/// "restart" only makes sense when something will bring the pod back.
pub async fn delete_pod(args: &Value, ctx: &ToolCtx<'_>) -> Result<ResultRecord> {
    let args: DeletePodArgs =
        serde_json::from_value(args.clone()).context("missing_required_params")?;
    if args.namespace.is_empty() || args.pod.is_empty() {
        return Ok(ResultRecord::fail("missing_required_params"));
    }

    let pod = ctx.cluster.get_pod(&args.namespace, &args.pod).await?;
    let has_controller = pod
        .metadata
        .owner_references
        .unwrap_or_default()
        .iter()
        .any(|o| o.controller == Some(true));
    if !has_controller {
        return Ok(ResultRecord::fail("pod_has_no_controller_owner"));
    }

    let action = format!("delete_pod:{}/{}", args.namespace, args.pod);
    if ctx.mode == AgentMode::Auto {
        ctx.cluster.delete_pod(&args.namespace, &args.pod).await?;
    }
    info!(namespace = %args.namespace, pod = %args.pod, mode = %ctx.mode, "delete_pod");

    Ok(ResultRecord::success(json!({
        "action": action,
        "mode": ctx.mode.as_str(),
    })))
}

/// Cordon a node: `spec.unschedulable = true`.
pub async fn cordon_node(args: &Value, ctx: &ToolCtx<'_>) -> Result<ResultRecord> {
    let args: NodeArgs = serde_json::from_value(args.clone()).context("missing_required_params")?;
    if args.node.is_empty() {
        return Ok(ResultRecord::fail("missing_required_params"));
    }

    let action = format!("cordon_node:{}", args.node);
    if ctx.mode == AgentMode::Auto {
        ctx.cluster
            .patch_node(&args.node, &json!({"spec": {"unschedulable": true}}))
            .await?;
    }
    info!(node = %args.node, mode = %ctx.mode, "cordon_node");

    Ok(ResultRecord::success(json!({
        "action": action,
        "node": args.node,
        "cordoned": true,
        "mode": ctx.mode.as_str(),
    })))
}

/// Uncordon a node: clear `spec.unschedulable`.
pub async fn uncordon_node(args: &Value, ctx: &ToolCtx<'_>) -> Result<ResultRecord> {
    let args: NodeArgs = serde_json::from_value(args.clone()).context("missing_required_params")?;
    if args.node.is_empty() {
        return Ok(ResultRecord::fail("missing_required_params"));
    }

    let action = format!("uncordon_node:{}", args.node);
    if ctx.mode == AgentMode::Auto {
        ctx.cluster
            .patch_node(&args.node, &json!({"spec": {"unschedulable": false}}))
            .await?;
    }
    info!(node = %args.node, mode = %ctx.mode, "uncordon_node");

    Ok(ResultRecord::success(json!({
        "action": action,
        "node": args.node,
        "mode": ctx.mode.as_str(),
    })))
}

/// Best-effort drain via the eviction API. Mirror pods, DaemonSet-owned pods,
/// and kube-system are skipped; per-pod failures are collected, not fatal.
pub async fn drain_node(args: &Value, ctx: &ToolCtx<'_>) -> Result<ResultRecord> {
    let args: NodeArgs = serde_json::from_value(args.clone()).context("missing_required_params")?;
    if args.node.is_empty() {
        return Ok(ResultRecord::fail("missing_required_params"));
    }

    let pods = ctx.cluster.pods_on_node(&args.node).await?;

    let mut targets: Vec<(String, String)> = Vec::new();
    let mut skipped = Vec::new();
    for pod in &pods {
        let ns = pod.metadata.namespace.clone().unwrap_or_default();
        let name = pod.metadata.name.clone().unwrap_or_default();

        let is_mirror = pod
            .metadata
            .annotations
            .as_ref()
            .is_some_and(|a| a.contains_key(MIRROR_POD_ANNOTATION));
        if is_mirror {
            skipped.push(json!({"namespace": ns, "pod": name, "reason": "mirror_pod"}));
            continue;
        }
        let is_daemonset = pod
            .metadata
            .owner_references
            .as_ref()
            .is_some_and(|owners| owners.iter().any(|o| o.kind == "DaemonSet"));
        if is_daemonset {
            skipped.push(json!({"namespace": ns, "pod": name, "reason": "daemonset"}));
            continue;
        }
        if ns == "kube-system" {
            skipped.push(json!({"namespace": ns, "pod": name, "reason": "kube-system"}));
            continue;
        }
        targets.push((ns, name));
    }

    let attempted = targets.len();
    let action = format!("drain_node:{}:evict={attempted}", args.node);

    if ctx.mode != AgentMode::Auto {
        info!(node = %args.node, attempted, "drain_node (recommend)");
        return Ok(ResultRecord::success(json!({
            "action": action,
            "node": args.node,
            "attempted": attempted,
            "evicted": 0,
            "failed": 0,
            "skipped": skipped,
            "evict_targets": targets,
            "mode": ctx.mode.as_str(),
        })));
    }

    let mut evicted = 0usize;
    let mut errors = Vec::new();
    for (ns, name) in &targets {
        match ctx.cluster.evict_pod(ns, name).await {
            Ok(()) => evicted += 1,
            Err(e) => errors.push(format!("{ns}/{name}:{e}")),
        }
    }
    let failed = errors.len();
    info!(node = %args.node, attempted, evicted, failed, "drain_node");

    let mut record = ResultRecord::success(json!({
        "action": action,
        "node": args.node,
        "attempted": attempted,
        "evicted": evicted,
        "failed": failed,
        "skipped": skipped,
        "errors": errors,
        "mode": ctx.mode.as_str(),
    }));
    if failed > 0 {
        record.ok = false;
        record.error = Some(format!("drain_incomplete:{failed}_evictions_failed"));
    }
    Ok(record)
}
