//! Maps an alert to the runbook that handles it.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::alerts::Alert;

/// Fixed alertname → runbook table. A `runbook_id` label on the alert takes
/// precedence over this mapping.
const ALERTNAME_TABLE: &[(&str, RunbookId)] = &[
    ("KubePodImagePullBackOff", RunbookId::ImagePull),
    ("KubePodOOMKilled", RunbookId::Oom),
    ("KubePodMemoryNearLimit", RunbookId::Oom),
    ("KubePodContainerCreatingStuck", RunbookId::ContainerCreating),
    ("KubePodCrashLoopBackOff", RunbookId::CrashLoop),
    ("KubeNodeUnschedulable", RunbookId::NodeUnschedulable),
    ("KubeNodeNotReady", RunbookId::NodeNotReady),
];

/// Identifier of a loaded runbook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunbookId {
    #[serde(rename = "RB_IMAGEPULL")]
    ImagePull,
    #[serde(rename = "RB_OOM")]
    Oom,
    #[serde(rename = "RB_CONTAINERCREATING")]
    ContainerCreating,
    #[serde(rename = "RB_CRASHLOOP")]
    CrashLoop,
    #[serde(rename = "RB_NODE_UNSCHEDULABLE")]
    NodeUnschedulable,
    #[serde(rename = "RB_NODE_NOTREADY")]
    NodeNotReady,
    #[serde(rename = "RB_UNKNOWN")]
    Unknown,
}

impl RunbookId {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ImagePull => "RB_IMAGEPULL",
            Self::Oom => "RB_OOM",
            Self::ContainerCreating => "RB_CONTAINERCREATING",
            Self::CrashLoop => "RB_CRASHLOOP",
            Self::NodeUnschedulable => "RB_NODE_UNSCHEDULABLE",
            Self::NodeNotReady => "RB_NODE_NOTREADY",
            Self::Unknown => "RB_UNKNOWN",
        }
    }

    /// Parse a runbook id. `Unknown` is never produced from input; an
    /// unrecognized string is `None`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "RB_IMAGEPULL" => Some(Self::ImagePull),
            "RB_OOM" => Some(Self::Oom),
            "RB_CONTAINERCREATING" => Some(Self::ContainerCreating),
            "RB_CRASHLOOP" => Some(Self::CrashLoop),
            "RB_NODE_UNSCHEDULABLE" => Some(Self::NodeUnschedulable),
            "RB_NODE_NOTREADY" => Some(Self::NodeNotReady),
            _ => None,
        }
    }

    /// Whether the runbook targets a pod (needs `namespace` + `pod` labels)
    /// or a node (needs `node`).
    #[must_use]
    pub fn targets_node(self) -> bool {
        matches!(self, Self::NodeUnschedulable | Self::NodeNotReady)
    }
}

impl std::fmt::Display for RunbookId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolve the runbook for an alert: explicit `runbook_id` label first, then
/// the fixed alertname table, else `Unknown`.
#[must_use]
pub fn route(alert: &Alert) -> RunbookId {
    if let Some(rb) = RunbookId::parse(alert.label("runbook_id").trim()) {
        info!(runbook_id = %rb, alertname = alert.alertname(), "routed via runbook_id label");
        return rb;
    }

    let rb = ALERTNAME_TABLE
        .iter()
        .find(|(name, _)| *name == alert.alertname())
        .map_or(RunbookId::Unknown, |(_, rb)| *rb);
    info!(runbook_id = %rb, alertname = alert.alertname(), "routed via alertname");
    rb
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn alert(pairs: &[(&str, &str)]) -> Alert {
        Alert {
            status: "firing".into(),
            labels: pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            annotations: HashMap::new(),
            starts_at: None,
            fingerprint: "fp".into(),
        }
    }

    #[test]
    fn label_override_wins() {
        let a = alert(&[
            ("alertname", "SomethingElse"),
            ("runbook_id", "RB_IMAGEPULL"),
        ]);
        assert_eq!(route(&a), RunbookId::ImagePull);
    }

    #[test]
    fn unrecognized_label_falls_through_to_alertname() {
        let a = alert(&[
            ("alertname", "KubePodOOMKilled"),
            ("runbook_id", "RB_BOGUS"),
        ]);
        assert_eq!(route(&a), RunbookId::Oom);
    }

    #[test]
    fn alertname_table() {
        for (name, expected) in [
            ("KubePodImagePullBackOff", RunbookId::ImagePull),
            ("KubePodOOMKilled", RunbookId::Oom),
            ("KubePodMemoryNearLimit", RunbookId::Oom),
            ("KubePodContainerCreatingStuck", RunbookId::ContainerCreating),
            ("KubePodCrashLoopBackOff", RunbookId::CrashLoop),
            ("KubeNodeUnschedulable", RunbookId::NodeUnschedulable),
            ("KubeNodeNotReady", RunbookId::NodeNotReady),
        ] {
            assert_eq!(route(&alert(&[("alertname", name)])), expected);
        }
    }

    #[test]
    fn unknown_alertname() {
        assert_eq!(
            route(&alert(&[("alertname", "DiskAlmostFull")])),
            RunbookId::Unknown
        );
        assert_eq!(route(&alert(&[])), RunbookId::Unknown);
    }
}
