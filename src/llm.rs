//! OpenRouter API client used by both triage passes.
//!
//! One client, two models: a cheap model for the batched quick triage and a
//! stronger one for per-edital deep analysis.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// OpenRouter client for chat completions.
#[derive(Clone)]
pub struct OpenRouterClient {
    client: Client,
    api_key: String,
    triage_model: String,
    analysis_model: String,
}

/// Which of the two configured models a call should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Triage,
    Analysis,
}

impl OpenRouterClient {
    pub fn new(
        client: Client,
        api_key: impl Into<String>,
        triage_model: impl Into<String>,
        analysis_model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            triage_model: triage_model.into(),
            analysis_model: analysis_model.into(),
        }
    }

    /// Send a chat completion request and return the raw text content.
    pub async fn chat(&self, kind: ModelKind, messages: Vec<Message>) -> Result<String> {
        let (model, max_tokens, temperature) = match kind {
            ModelKind::Triage => (self.triage_model.as_str(), 4096, 0.1),
            ModelKind::Analysis => (self.analysis_model.as_str(), 8192, 0.2),
        };

        let request = ChatCompletionRequest {
            model: model.to_string(),
            messages,
            max_tokens: Some(max_tokens),
            temperature: Some(temperature),
        };

        debug!("Sending request to OpenRouter: model={}", request.model);

        let response = self
            .client
            .post(OPENROUTER_API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .context("Failed to send request to OpenRouter")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenRouter API error ({}): {}", status, error_text);
        }

        let response: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse OpenRouter response")?;

        if let Some(usage) = &response.usage {
            info!(
                "OpenRouter response: {} tokens (prompt: {}, completion: {})",
                usage.total_tokens, usage.prompt_tokens, usage.completion_tokens
            );
        }

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        Ok(content)
    }
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Parse JSON from an LLM response, stripping markdown code fences if present.
pub fn parse_llm_json<T: serde::de::DeserializeOwned>(response: &str) -> Result<T> {
    let json_str = if response.contains("```json") {
        response
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .unwrap_or(response)
            .trim()
    } else if response.contains("```") {
        response.split("```").nth(1).unwrap_or(response).trim()
    } else {
        response.trim()
    };

    // First validate syntax
    let _: serde_json::Value = serde_json::from_str(json_str).context(format!(
        "Invalid JSON syntax: {}",
        &json_str.chars().take(200).collect::<String>()
    ))?;

    // Parse as expected type
    serde_json::from_str(json_str).context(format!(
        "JSON structure mismatch: {}",
        &json_str.chars().take(200).collect::<String>()
    ))
}

/// Truncate text at a char boundary so prompts stay inside the context window.
pub fn truncate_for_context(text: &str, max_chars: usize) -> &str {
    if text.len() <= max_chars {
        text
    } else {
        let mut end = max_chars;
        while !text.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        &text[..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Sample {
        aderencia: String,
    }

    #[test]
    fn parse_plain_json() {
        let s: Sample = parse_llm_json(r#"{"aderencia": "ALTA"}"#).unwrap();
        assert_eq!(s.aderencia, "ALTA");
    }

    #[test]
    fn parse_fenced_json() {
        let s: Sample =
            parse_llm_json("Here you go:\n```json\n{\"aderencia\": \"MEDIA\"}\n```").unwrap();
        assert_eq!(s.aderencia, "MEDIA");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_llm_json::<Sample>("not json at all").is_err());
    }

    #[test]
    fn truncate_respects_char_boundary() {
        let text = "ação de medição";
        let cut = truncate_for_context(text, 4);
        assert!(text.starts_with(cut));
        assert!(cut.len() <= 4);
    }
}
