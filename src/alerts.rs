//! Alertmanager webhook payload types and alert normalization.
//!
//! Reference: <https://prometheus.io/docs/alerting/latest/configuration/#webhook_config>

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Group keys Alertmanager emits when no grouping is configured. These carry
/// no identity and must not be used as fingerprints.
const DEGENERATE_GROUP_KEYS: &[&str] = &["{}", "{}/{}"];

/// Alertmanager webhook payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerPayload {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub group_key: Option<String>,
    /// Status: "firing" or "resolved"
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub receiver: Option<String>,
    #[serde(default)]
    pub group_labels: HashMap<String, String>,
    /// Labels common to all alerts in this group.
    #[serde(default)]
    pub common_labels: HashMap<String, String>,
    #[serde(default)]
    pub common_annotations: HashMap<String, String>,
    #[serde(default)]
    pub external_url: Option<String>,
    #[serde(default)]
    pub alerts: Vec<AlertmanagerAlert>,
}

/// Individual alert within a webhook batch.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertmanagerAlert {
    /// Status: "firing" or "resolved"
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub generator_url: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

/// A normalized alert: per-alert labels merged over the batch's common
/// labels, with a stable fingerprint attached.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub status: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub starts_at: Option<DateTime<Utc>>,
    pub fingerprint: String,
}

impl Alert {
    #[must_use]
    pub fn label(&self, key: &str) -> &str {
        self.labels.get(key).map_or("", String::as_str)
    }

    #[must_use]
    pub fn alertname(&self) -> &str {
        self.label("alertname")
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        self.label("namespace")
    }

    #[must_use]
    pub fn pod(&self) -> &str {
        self.label("pod")
    }

    #[must_use]
    pub fn container(&self) -> &str {
        self.label("container")
    }

    #[must_use]
    pub fn node(&self) -> &str {
        self.label("node")
    }

    #[must_use]
    pub fn severity(&self) -> &str {
        self.label("severity")
    }
}

/// Compute the dedup fingerprint for one alert.
///
/// Upstream identity wins: the alert's own `fingerprint`, then the batch
/// `groupKey` (unless degenerate), then the composed
/// `{alertname}:{namespace}:{pod}:{container}` form with empty segments
/// preserved.
#[must_use]
pub fn fingerprint(
    group_key: Option<&str>,
    alert_fingerprint: Option<&str>,
    labels: &HashMap<String, String>,
) -> String {
    if let Some(fp) = alert_fingerprint {
        if !fp.is_empty() {
            return fp.to_string();
        }
    }
    if let Some(gk) = group_key {
        if !gk.is_empty() && !DEGENERATE_GROUP_KEYS.contains(&gk) {
            return gk.to_string();
        }
    }

    let get = |key: &str| labels.get(key).map_or("", String::as_str);
    format!(
        "{}:{}:{}:{}",
        labels.get("alertname").map_or("unknown", String::as_str),
        get("namespace"),
        get("pod"),
        get("container"),
    )
}

/// Flatten a webhook batch into normalized alerts.
#[must_use]
pub fn normalize(payload: &AlertmanagerPayload) -> Vec<Alert> {
    payload
        .alerts
        .iter()
        .map(|a| {
            let mut labels = payload.common_labels.clone();
            labels.extend(a.labels.clone());
            let fp = fingerprint(
                payload.group_key.as_deref(),
                a.fingerprint.as_deref(),
                &labels,
            );
            Alert {
                status: a.status.clone(),
                labels,
                annotations: a.annotations.clone(),
                starts_at: a.starts_at,
                fingerprint: fp,
            }
        })
        .collect()
}
