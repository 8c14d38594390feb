//! LLM integration: the per-step tool-call adjudicator and the incident
//! analysis writer.
//!
//! The runbook owns control flow; the model only contributes tool arguments
//! (and prose, for analyses). Tool identity is validated by the engine, so a
//! misbehaving model can never widen the blast radius of a step.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;

use crate::config::LLM_TIMEOUT;
use crate::tools::{ToolName, ALL_TOOLS};

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("LLM API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("LLM protocol error: {0}")]
    Protocol(String),
}

/// Everything the adjudicator sees when deciding one workflow step.
pub struct ToolCallRequest<'a> {
    pub runbook_id: &'a str,
    pub step_action_id: &'a str,
    pub expected_tool: ToolName,
    pub runbook_body: &'a str,
    pub alert_context: Value,
    pub tool_results: Value,
}

/// A single tool call as returned by the model.
#[derive(Debug, Clone)]
pub struct ToolCallDecision {
    pub tool: String,
    pub arguments: Value,
    pub reason: String,
}

/// Inputs for the post-incident narrative.
pub struct AnalysisRequest<'a> {
    pub runbook_id: &'a str,
    pub cluster: &'a str,
    pub alert_labels: Value,
    pub alert_annotations: Value,
    pub final_state: Value,
    pub past_incidents: Option<Value>,
}

/// Pluggable language-model seam. The engine only depends on this trait, so
/// tests script decisions without a network.
#[async_trait]
pub trait Adjudicator: Send + Sync {
    async fn decide_tool_call(
        &self,
        req: ToolCallRequest<'_>,
    ) -> Result<ToolCallDecision, LlmError>;

    async fn generate_analysis(&self, req: AnalysisRequest<'_>) -> Result<String, LlmError>;
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    temperature: f32,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ResponseToolCall>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    function: ResponseFunctionCall,
}

#[derive(Debug, Deserialize)]
struct ResponseFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// OpenAI chat-completions client.
pub struct OpenAiClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiClient {
    #[must_use]
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(LLM_TIMEOUT)
                .build()
                .expect("reqwest client"),
            api_key: api_key.into(),
            model: model.into(),
            base_url: OPENAI_API_URL.to_string(),
        }
    }

    /// Point at a proxy or compatible endpoint.
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChoiceMessage, LlmError> {
        let response = self
            .client
            .post(&self.base_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let message = serde_json::from_str::<ApiErrorBody>(&body)
                .map_or(body.clone(), |e| e.error.message);
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| LlmError::Protocol(format!("unparseable response: {e}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| LlmError::Protocol("response had no choices".to_string()))
    }
}

/// Tool specs for the adjudicator: the full registry plus `noop`, which the
/// model may call only when required context is missing.
fn tool_specs() -> Vec<Value> {
    let mut specs: Vec<Value> = ALL_TOOLS.iter().map(|t| t.openai_spec()).collect();
    specs.push(json!({
        "type": "function",
        "function": {
            "name": "noop",
            "description": "Take no action (only when required context is missing).",
            "parameters": {
                "type": "object",
                "properties": {"reason": {"type": "string"}},
                "additionalProperties": false
            }
        }
    }));
    specs
}

#[async_trait]
impl Adjudicator for OpenAiClient {
    async fn decide_tool_call(
        &self,
        req: ToolCallRequest<'_>,
    ) -> Result<ToolCallDecision, LlmError> {
        let system = format!(
            "You are an SRE automation agent.\n\
             You MUST use tool-calls; do not output plain text.\n\
             You are executing one step of a deterministic runbook workflow.\n\
             Rules:\n\
             - runbook_id: {}\n\
             - step_action_id: {}\n\
             - You MUST call tool: {}\n\
             - You may only call noop if required context is missing.\n\
             - Do not invent values; use alert_context.",
            req.runbook_id,
            req.step_action_id,
            req.expected_tool.as_str(),
        );
        let user = json!({
            "runbook_id": req.runbook_id,
            "step_action_id": req.step_action_id,
            "allowed_tool": req.expected_tool.as_str(),
            "runbook": req.runbook_body,
            "alert_context": req.alert_context,
            "tool_results": req.tool_results,
        });

        let started = std::time::Instant::now();
        let message = self
            .chat(&ChatRequest {
                model: self.model.clone(),
                temperature: 0.0,
                messages: vec![
                    ChatMessage {
                        role: "system",
                        content: system,
                    },
                    ChatMessage {
                        role: "user",
                        content: user.to_string(),
                    },
                ],
                tools: Some(tool_specs()),
                tool_choice: Some("required"),
            })
            .await?;

        let call = message
            .tool_calls
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::Protocol("model returned no tool call".to_string()))?;
        let arguments: Value = serde_json::from_str(&call.function.arguments)
            .map_err(|e| LlmError::Protocol(format!("unparseable tool arguments: {e}")))?;
        let reason = arguments
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        info!(
            model = %self.model,
            latency_ms = started.elapsed().as_millis() as u64,
            step_action_id = req.step_action_id,
            tool = %call.function.name,
            "adjudicated tool call"
        );

        Ok(ToolCallDecision {
            tool: call.function.name,
            arguments,
            reason,
        })
    }

    async fn generate_analysis(&self, req: AnalysisRequest<'_>) -> Result<String, LlmError> {
        let history_instruction = if req.past_incidents.is_some() {
            "## Historical Pattern & SRE Recommendation\n\
             - Based on past_incidents, identify if this is a repeat occurrence.\n\
             - If the same action was taken before and the alert recurred, flag it as a short-term fix.\n\
             - Recommend a more permanent resolution for the SRE team (root cause investigation, \
             resource right-sizing, image pipeline fix, node replacement).\n"
        } else {
            "## Historical Pattern & SRE Recommendation\n\
             - No past incident history was available for this alert; say so.\n"
        };
        let system = format!(
            "You are an SRE incident analyst.\n\
             Write a clear, factual incident analysis based ONLY on the provided data.\n\
             Do not invent logs or metrics.\n\
             Output Markdown with these sections:\n\
             ## Summary\n\
             ## What Happened (evidence)\n\
             ## Root Cause Hypothesis\n\
             ## Action Taken / Recommended\n\
             ## Why That Action\n\
             {history_instruction}\
             ## Follow-ups\n"
        );

        let mut user = json!({
            "cluster": req.cluster,
            "runbook_id": req.runbook_id,
            "alert_labels": req.alert_labels,
            "alert_annotations": req.alert_annotations,
            "agent_state": req.final_state,
        });
        if let Some(past) = req.past_incidents {
            user["past_incidents"] = past;
        }

        let message = self
            .chat(&ChatRequest {
                model: self.model.clone(),
                temperature: 0.0,
                messages: vec![
                    ChatMessage {
                        role: "system",
                        content: system,
                    },
                    ChatMessage {
                        role: "user",
                        content: user.to_string(),
                    },
                ],
                tools: None,
                tool_choice: None,
            })
            .await?;

        message
            .content
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| LlmError::Protocol("analysis response was empty".to_string()))
    }
}
