//! Agent configuration, sourced from the environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Deadline for checking out a database connection from the pool.
pub const DB_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
/// Per-call deadline for cluster control-plane requests.
pub const CLUSTER_API_TIMEOUT: Duration = Duration::from_secs(15);
/// Deadline for a single LLM round trip.
pub const LLM_TIMEOUT: Duration = Duration::from_secs(60);

/// Whether mutating tools actually mutate or only recommend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    /// Perform mutations and record them as `action_taken`.
    Auto,
    /// Skip mutations; record the identical change string as `action_recommended`.
    Recommend,
}

impl AgentMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Recommend => "recommend",
        }
    }

    /// Parse from the `AGENT_MODE` environment value. Anything that is not
    /// exactly `auto` falls back to the safe default.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("auto") {
            Self::Auto
        } else {
            Self::Recommend
        }
    }
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process configuration. Read once at startup and shared immutably.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres DSN.
    pub database_url: String,
    /// OpenAI credential.
    pub openai_api_key: String,
    /// LLM model identifier.
    pub openai_model: String,
    /// Mutation policy for the whole process.
    pub agent_mode: AgentMode,
    /// Cluster name embedded in incident analyses.
    pub cluster_name: String,
    /// Directory holding the runbook documents.
    pub runbook_dir: PathBuf,
    /// HTTP bind address.
    pub listen_addr: SocketAddr,
}

impl Config {
    /// Load configuration from the environment, failing fast on anything
    /// required or malformed.
    pub fn from_env() -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let openai_api_key =
            std::env::var("OPENAI_API_KEY").context("OPENAI_API_KEY must be set")?;
        let openai_model =
            std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());
        let agent_mode = AgentMode::parse(
            &std::env::var("AGENT_MODE").unwrap_or_else(|_| "recommend".to_string()),
        );
        let cluster_name =
            std::env::var("CLUSTER_NAME").unwrap_or_else(|_| "unknown".to_string());
        let runbook_dir = std::env::var("RUNBOOK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("runbooks"));
        let listen_addr = std::env::var("LISTEN_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .context("LISTEN_ADDR must be a socket address")?;

        Ok(Self {
            database_url,
            openai_api_key,
            openai_model,
            agent_mode,
            cluster_name,
            runbook_dir,
            listen_addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing_defaults_to_recommend() {
        assert_eq!(AgentMode::parse("auto"), AgentMode::Auto);
        assert_eq!(AgentMode::parse("AUTO"), AgentMode::Auto);
        assert_eq!(AgentMode::parse("recommend"), AgentMode::Recommend);
        assert_eq!(AgentMode::parse(""), AgentMode::Recommend);
        assert_eq!(AgentMode::parse("yolo"), AgentMode::Recommend);
    }
}
