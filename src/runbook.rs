//! Runbook documents: YAML front matter describing an ordered, gated
//! workflow, followed by free-form markdown for humans (and the LLM prompt).
//!
//! Runbooks are loaded once at startup and read-only afterwards. Loading
//! fails fast on anything the engine could not execute later: a missing
//! `runbook_id`, an `action_id` outside the tool registry, or a gate
//! expression that does not parse.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::router::RunbookId;
use crate::tools::ToolName;

#[derive(Debug, Error)]
pub enum RunbookError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("{path}: missing front matter block")]
    MissingFrontMatter { path: String },
    #[error("{path}: invalid front matter: {source}")]
    InvalidFrontMatter {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("{path}: missing or unknown runbook_id")]
    MissingRunbookId { path: String },
    #[error("{runbook_id}: workflow references unknown action_id `{action_id}`")]
    UnknownAction {
        runbook_id: String,
        action_id: String,
    },
    #[error("{runbook_id}: unparsable gate `{gate}`")]
    InvalidGate { runbook_id: String, gate: String },
    #[error("duplicate runbook id {0}")]
    Duplicate(String),
}

/// A parsed gate: a dotted reference into `tool_results`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateExpr {
    pub alias: String,
    pub field: String,
}

impl GateExpr {
    /// Parse `<alias>.<field>` where both segments are identifier-like.
    pub fn parse(expr: &str) -> Result<Self, String> {
        let mut parts = expr.trim().splitn(2, '.');
        let alias = parts.next().unwrap_or_default();
        let field = parts.next().unwrap_or_default();
        if alias.is_empty() || field.is_empty() {
            return Err(format!("expected <alias>.<field>, got `{expr}`"));
        }
        let ident_ok = |s: &str| {
            s.chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        };
        if !ident_ok(alias) || !ident_ok(field) {
            return Err(format!("non-identifier segment in `{expr}`"));
        }
        Ok(Self {
            alias: alias.to_string(),
            field: field.to_string(),
        })
    }
}

impl std::fmt::Display for GateExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.alias, self.field)
    }
}

/// One workflow step: the action to run plus its gating conditions, with the
/// expected tool resolved at load time.
#[derive(Debug, Clone)]
pub struct Step {
    pub action_id: String,
    pub tool: ToolName,
    pub when: Option<GateExpr>,
    pub when_all: Vec<GateExpr>,
}

/// An in-memory runbook.
#[derive(Debug, Clone)]
pub struct Runbook {
    pub id: RunbookId,
    pub alert_name: String,
    pub title: String,
    pub description: String,
    pub workflow: Vec<Step>,
    /// Image remediation target for image-pull workflows.
    pub fallback_image: Option<String>,
    /// Markdown body, handed to the LLM as operator context.
    pub body: String,
}

#[derive(Debug, Deserialize)]
struct FrontMatter {
    runbook_id: Option<String>,
    #[serde(default)]
    alertname: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    fallback_image: Option<String>,
    #[serde(default)]
    workflow: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
struct RawStep {
    action_id: String,
    #[serde(default)]
    when: Option<String>,
    #[serde(default)]
    when_all: Vec<String>,
}

/// Runbooks indexed by id. Immutable after startup.
#[derive(Debug, Default)]
pub struct RunbookTable {
    by_id: HashMap<RunbookId, Runbook>,
}

impl RunbookTable {
    /// Load every `*.md` document in `dir`.
    pub fn load_dir(dir: &Path) -> Result<Self, RunbookError> {
        let mut table = Self::default();
        let entries = std::fs::read_dir(dir).map_err(|source| RunbookError::Io {
            path: dir.display().to_string(),
            source,
        })?;

        let mut paths: Vec<_> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "md"))
            .collect();
        paths.sort();

        for path in paths {
            let content = std::fs::read_to_string(&path).map_err(|source| RunbookError::Io {
                path: path.display().to_string(),
                source,
            })?;
            let runbook = parse_runbook(&path.display().to_string(), &content)?;
            info!(
                runbook_id = %runbook.id,
                steps = runbook.workflow.len(),
                "loaded runbook"
            );
            if table.by_id.insert(runbook.id, runbook).is_some() {
                return Err(RunbookError::Duplicate(
                    path.display().to_string(),
                ));
            }
        }

        Ok(table)
    }

    #[must_use]
    pub fn get(&self, id: RunbookId) -> Option<&Runbook> {
        self.by_id.get(&id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Build a table directly from parsed runbooks (tests).
    #[cfg(test)]
    pub fn from_runbooks(runbooks: Vec<Runbook>) -> Self {
        Self {
            by_id: runbooks.into_iter().map(|r| (r.id, r)).collect(),
        }
    }
}

/// Parse one runbook document.
pub fn parse_runbook(path: &str, content: &str) -> Result<Runbook, RunbookError> {
    let trimmed = content.trim_start();
    let Some(rest) = trimmed.strip_prefix("---") else {
        return Err(RunbookError::MissingFrontMatter {
            path: path.to_string(),
        });
    };
    let Some(end) = rest.find("\n---") else {
        return Err(RunbookError::MissingFrontMatter {
            path: path.to_string(),
        });
    };
    let yaml = &rest[..end];
    let body = rest[end + 4..].trim_start_matches('\n').to_string();

    let fm: FrontMatter =
        serde_yaml::from_str(yaml).map_err(|source| RunbookError::InvalidFrontMatter {
            path: path.to_string(),
            source,
        })?;

    let id = fm
        .runbook_id
        .as_deref()
        .and_then(RunbookId::parse)
        .ok_or_else(|| RunbookError::MissingRunbookId {
            path: path.to_string(),
        })?;

    let mut workflow = Vec::with_capacity(fm.workflow.len());
    for raw in fm.workflow {
        let tool =
            ToolName::for_action(&raw.action_id).ok_or_else(|| RunbookError::UnknownAction {
                runbook_id: id.as_str().to_string(),
                action_id: raw.action_id.clone(),
            })?;
        let when = raw
            .when
            .as_deref()
            .map(|expr| {
                GateExpr::parse(expr).map_err(|_| RunbookError::InvalidGate {
                    runbook_id: id.as_str().to_string(),
                    gate: expr.to_string(),
                })
            })
            .transpose()?;
        let when_all = raw
            .when_all
            .iter()
            .map(|expr| {
                GateExpr::parse(expr).map_err(|_| RunbookError::InvalidGate {
                    runbook_id: id.as_str().to_string(),
                    gate: expr.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        workflow.push(Step {
            action_id: raw.action_id,
            tool,
            when,
            when_all,
        });
    }

    Ok(Runbook {
        id,
        alert_name: fm.alertname,
        title: fm.title,
        description: fm.description,
        workflow,
        fallback_image: fm.fallback_image,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r"---
runbook_id: RB_IMAGEPULL
alertname: KubePodImagePullBackOff
title: ImagePullBackOff remediation
description: Patch the owning Deployment to a known-good image.
fallback_image: registry.example.com/hello:1.0
workflow:
  - action_id: get_pod_events
  - action_id: check_imagepullbackoff
  - action_id: patch_image
    when: imagepull.imagepull_detected
---
## Remediation

Patch the Deployment image to the fallback.
";

    #[test]
    fn parses_front_matter_and_body() {
        let rb = parse_runbook("RB_IMAGEPULL.md", SAMPLE).unwrap();
        assert_eq!(rb.id, RunbookId::ImagePull);
        assert_eq!(rb.alert_name, "KubePodImagePullBackOff");
        assert_eq!(rb.fallback_image.as_deref(), Some("registry.example.com/hello:1.0"));
        assert_eq!(rb.workflow.len(), 3);
        assert_eq!(rb.workflow[2].tool, ToolName::FixImagepullbackoff);
        assert_eq!(
            rb.workflow[2].when,
            Some(GateExpr {
                alias: "imagepull".into(),
                field: "imagepull_detected".into()
            })
        );
        assert!(rb.body.contains("Patch the Deployment image"));
    }

    #[test]
    fn missing_runbook_id_fails() {
        let doc = "---\ntitle: no id\nworkflow: []\n---\nbody\n";
        assert!(matches!(
            parse_runbook("x.md", doc),
            Err(RunbookError::MissingRunbookId { .. })
        ));
    }

    #[test]
    fn unknown_action_fails() {
        let doc = "---\nrunbook_id: RB_CRASHLOOP\nworkflow:\n  - action_id: rollback_deployment\n---\n";
        assert!(matches!(
            parse_runbook("x.md", doc),
            Err(RunbookError::UnknownAction { .. })
        ));
    }

    #[test]
    fn bad_gate_fails() {
        let doc = "---\nrunbook_id: RB_OOM\nworkflow:\n  - action_id: check_oom\n    when: nodots\n---\n";
        assert!(matches!(
            parse_runbook("x.md", doc),
            Err(RunbookError::InvalidGate { .. })
        ));
        let doc = "---\nrunbook_id: RB_OOM\nworkflow:\n  - action_id: check_oom\n    when: 'a.b c'\n---\n";
        assert!(matches!(
            parse_runbook("x.md", doc),
            Err(RunbookError::InvalidGate { .. })
        ));
    }

    #[test]
    fn gate_expr_parsing() {
        let g = GateExpr::parse("node_ready.unschedulable").unwrap();
        assert_eq!(g.alias, "node_ready");
        assert_eq!(g.field, "unschedulable");
        assert!(GateExpr::parse("").is_err());
        assert!(GateExpr::parse("alias.").is_err());
        assert!(GateExpr::parse(".field").is_err());
        // Only the first dot splits; the rest must still be identifier-like.
        assert!(GateExpr::parse("a.b.c").is_err());
    }

    #[test]
    fn missing_front_matter_fails() {
        assert!(matches!(
            parse_runbook("x.md", "just markdown"),
            Err(RunbookError::MissingFrontMatter { .. })
        ));
    }
}
