//! The closed tool set and its dispatcher.
//!
//! Every capability the agent has against the cluster is one variant of
//! [`ToolName`]: a declared input shape, a read-only/mutating classification,
//! a stable result alias that runbook gates reference, and an execute arm.
//! Tools never propagate errors outward; failures are captured in the
//! returned [`ResultRecord`].

pub mod diagnostics;
pub mod owner;
pub mod remediation;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::cluster::ClusterClient;
use crate::config::AgentMode;
use crate::runbook::RunbookTable;

/// Shared context handed to every tool invocation.
pub struct ToolCtx<'a> {
    pub cluster: &'a dyn ClusterClient,
    pub runbooks: &'a RunbookTable,
    pub mode: AgentMode,
}

/// The closed set of tools the agent can dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    GetPodEvents,
    CheckImagepullbackoff,
    CheckOom,
    GetNodeReady,
    GetNodeConditions,
    GetRunbook,
    FixImagepullbackoff,
    IncreaseMemoryLimit,
    DeletePod,
    CordonNode,
    UncordonNode,
    DrainNode,
}

/// All tools, in registry order. Used to build the LLM tool specs.
pub const ALL_TOOLS: &[ToolName] = &[
    ToolName::GetPodEvents,
    ToolName::CheckImagepullbackoff,
    ToolName::CheckOom,
    ToolName::GetNodeReady,
    ToolName::GetNodeConditions,
    ToolName::GetRunbook,
    ToolName::FixImagepullbackoff,
    ToolName::IncreaseMemoryLimit,
    ToolName::DeletePod,
    ToolName::CordonNode,
    ToolName::UncordonNode,
    ToolName::DrainNode,
];

impl ToolName {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GetPodEvents => "get_pod_events",
            Self::CheckImagepullbackoff => "check_imagepullbackoff",
            Self::CheckOom => "check_oom",
            Self::GetNodeReady => "get_node_ready",
            Self::GetNodeConditions => "get_node_conditions",
            Self::GetRunbook => "get_runbook",
            Self::FixImagepullbackoff => "fix_imagepullbackoff",
            Self::IncreaseMemoryLimit => "increase_memory_limit",
            Self::DeletePod => "delete_pod",
            Self::CordonNode => "cordon_node",
            Self::UncordonNode => "uncordon_node",
            Self::DrainNode => "drain_node",
        }
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        ALL_TOOLS.iter().copied().find(|t| t.as_str() == name)
    }

    /// Stable short name under which this tool's result lands in
    /// `tool_results`. Gates reference results by this alias.
    #[must_use]
    pub fn alias(self) -> &'static str {
        match self {
            Self::GetPodEvents => "events",
            Self::CheckImagepullbackoff => "imagepull",
            Self::CheckOom => "oom",
            Self::GetNodeReady => "node_ready",
            Self::GetNodeConditions => "node_conditions",
            Self::GetRunbook => "runbook",
            Self::FixImagepullbackoff => "patch_image",
            Self::IncreaseMemoryLimit => "memory_limit",
            Self::DeletePod => "delete_pod",
            Self::CordonNode => "cordon",
            Self::UncordonNode => "uncordon",
            Self::DrainNode => "drain",
        }
    }

    /// Mutating tools honor the agent mode; diagnostics always run.
    #[must_use]
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            Self::FixImagepullbackoff
                | Self::IncreaseMemoryLimit
                | Self::DeletePod
                | Self::CordonNode
                | Self::UncordonNode
                | Self::DrainNode
        )
    }

    /// Resolve a runbook workflow `action_id` to the tool that executes it.
    /// Most ids name their tool directly; the remediation ids are indirected
    /// so runbooks read as operator actions.
    #[must_use]
    pub fn for_action(action_id: &str) -> Option<Self> {
        match action_id {
            "patch_image" => Some(Self::FixImagepullbackoff),
            "restart_pod" => Some(Self::DeletePod),
            other => Self::parse(other),
        }
    }

    /// OpenAI function-calling spec for this tool.
    #[must_use]
    pub fn openai_spec(self) -> Value {
        let (description, parameters) = match self {
            Self::GetPodEvents => (
                "Fetch recent Kubernetes events for a pod and classify OOM / sandbox / image-pull signals.",
                json!({
                    "type": "object",
                    "properties": {
                        "namespace": {"type": "string"},
                        "pod": {"type": "string"},
                        "limit": {"type": "integer"},
                        "reason": {"type": "string"}
                    },
                    "required": ["namespace", "pod"],
                    "additionalProperties": false
                }),
            ),
            Self::CheckImagepullbackoff => (
                "Detect ImagePullBackOff/ErrImagePull for a pod via status and events.",
                pod_target_schema(),
            ),
            Self::CheckOom => (
                "Detect OOMKilled for a pod/container via status and events.",
                pod_target_schema(),
            ),
            Self::GetNodeReady => (
                "Check whether a node is Ready and whether it is currently unschedulable.",
                node_target_schema(),
            ),
            Self::GetNodeConditions => (
                "Check node conditions (pressure/unavailable) excluding the Ready gate.",
                node_target_schema(),
            ),
            Self::GetRunbook => (
                "Fetch runbook metadata (fallback image and friends).",
                json!({
                    "type": "object",
                    "properties": {
                        "runbook_id": {"type": "string"},
                        "reason": {"type": "string"}
                    },
                    "required": ["runbook_id"],
                    "additionalProperties": false
                }),
            ),
            Self::FixImagepullbackoff => (
                "Patch the owning Deployment's container image to the fallback image (or recommend).",
                json!({
                    "type": "object",
                    "properties": {
                        "namespace": {"type": "string"},
                        "pod": {"type": "string"},
                        "container": {"type": "string"},
                        "fallback_image": {"type": "string"},
                        "reason": {"type": "string"}
                    },
                    "required": ["namespace", "pod", "container"],
                    "additionalProperties": false
                }),
            ),
            Self::IncreaseMemoryLimit => (
                "Double the owning Deployment's container memory limit (256Mi floor, 4Gi ceiling), or recommend.",
                pod_target_schema(),
            ),
            Self::DeletePod => (
                "Delete a controller-owned pod to force recreation (safe restart for Deployments).",
                json!({
                    "type": "object",
                    "properties": {
                        "namespace": {"type": "string"},
                        "pod": {"type": "string"},
                        "reason": {"type": "string"}
                    },
                    "required": ["namespace", "pod"],
                    "additionalProperties": false
                }),
            ),
            Self::CordonNode => (
                "Cordon a node (set spec.unschedulable=true).",
                node_target_schema(),
            ),
            Self::UncordonNode => (
                "Make a node schedulable again (clear spec.unschedulable).",
                node_target_schema(),
            ),
            Self::DrainNode => (
                "Best-effort drain: evict non-daemonset, non-mirror, non-system pods from a node.",
                json!({
                    "type": "object",
                    "properties": {
                        "node": {"type": "string"},
                        "reason": {"type": "string"}
                    },
                    "required": ["node"],
                    "additionalProperties": false
                }),
            ),
        };

        json!({
            "type": "function",
            "function": {
                "name": self.as_str(),
                "description": description,
                "parameters": parameters
            }
        })
    }
}

impl std::fmt::Display for ToolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn pod_target_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "namespace": {"type": "string"},
            "pod": {"type": "string"},
            "container": {"type": "string"},
            "reason": {"type": "string"}
        },
        "required": ["namespace", "pod"],
        "additionalProperties": false
    })
}

fn node_target_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "node": {"type": "string"},
            "reason": {"type": "string"}
        },
        "required": ["node"],
        "additionalProperties": false
    })
}

/// Structured outcome of one tool invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResultRecord {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResultRecord {
    /// Successful record from a JSON object of result fields.
    #[must_use]
    pub fn success(fields: Value) -> Self {
        let fields = match fields {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            ok: true,
            fields,
            error: None,
        }
    }

    /// Failed record carrying the error message.
    #[must_use]
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            fields: Map::new(),
            error: Some(error.into()),
        }
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    #[must_use]
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }

    /// Truthiness of a result field, used for gate evaluation. Missing
    /// fields, `null`, `false`, zero, and empty containers are falsy.
    #[must_use]
    pub fn truthy(&self, name: &str) -> bool {
        match self.field(name) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Array(a)) => !a.is_empty(),
            Some(Value::Object(o)) => !o.is_empty(),
        }
    }
}

/// Execute a tool through the registry. Any internal error is converted into
/// a failed [`ResultRecord`]; this function never fails.
pub async fn execute(tool: ToolName, args: &Value, ctx: &ToolCtx<'_>) -> ResultRecord {
    let outcome = match tool {
        ToolName::GetPodEvents => diagnostics::get_pod_events(args, ctx).await,
        ToolName::CheckImagepullbackoff => diagnostics::check_imagepullbackoff(args, ctx).await,
        ToolName::CheckOom => diagnostics::check_oom(args, ctx).await,
        ToolName::GetNodeReady => diagnostics::get_node_ready(args, ctx).await,
        ToolName::GetNodeConditions => diagnostics::get_node_conditions(args, ctx).await,
        ToolName::GetRunbook => diagnostics::get_runbook(args, ctx),
        ToolName::FixImagepullbackoff => remediation::fix_imagepullbackoff(args, ctx).await,
        ToolName::IncreaseMemoryLimit => remediation::increase_memory_limit(args, ctx).await,
        ToolName::DeletePod => remediation::delete_pod(args, ctx).await,
        ToolName::CordonNode => remediation::cordon_node(args, ctx).await,
        ToolName::UncordonNode => remediation::uncordon_node(args, ctx).await,
        ToolName::DrainNode => remediation::drain_node(args, ctx).await,
    };

    match outcome {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!(tool = %tool, error = %e, "tool failed");
            ResultRecord::fail(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_id_resolution() {
        assert_eq!(
            ToolName::for_action("patch_image"),
            Some(ToolName::FixImagepullbackoff)
        );
        assert_eq!(ToolName::for_action("restart_pod"), Some(ToolName::DeletePod));
        assert_eq!(
            ToolName::for_action("get_pod_events"),
            Some(ToolName::GetPodEvents)
        );
        assert_eq!(ToolName::for_action("rollback_deployment"), None);
    }

    #[test]
    fn aliases_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for tool in ALL_TOOLS {
            assert!(seen.insert(tool.alias()), "duplicate alias {}", tool.alias());
        }
    }

    #[test]
    fn mutating_classification() {
        assert!(!ToolName::GetPodEvents.is_mutating());
        assert!(!ToolName::GetNodeConditions.is_mutating());
        assert!(ToolName::FixImagepullbackoff.is_mutating());
        assert!(ToolName::DrainNode.is_mutating());
    }

    #[test]
    fn truthiness() {
        let rec = ResultRecord::success(json!({
            "yes": true,
            "no": false,
            "empty": "",
            "name": "x",
            "zero": 0,
            "one": 1,
            "list": [1],
            "nothing": null
        }));
        assert!(rec.truthy("yes"));
        assert!(!rec.truthy("no"));
        assert!(!rec.truthy("empty"));
        assert!(rec.truthy("name"));
        assert!(!rec.truthy("zero"));
        assert!(rec.truthy("one"));
        assert!(rec.truthy("list"));
        assert!(!rec.truthy("nothing"));
        assert!(!rec.truthy("absent"));
    }

    #[test]
    fn every_tool_has_a_spec() {
        for tool in ALL_TOOLS {
            let spec = tool.openai_spec();
            assert_eq!(spec["function"]["name"], tool.as_str());
            assert!(spec["function"]["parameters"]["type"] == "object");
        }
    }
}
