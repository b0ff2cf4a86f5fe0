//! Completion clients for the answer-synthesis step.
//!
//! Two variants, selected per request:
//!
//! - **local generate**: `POST {model, system, prompt, stream:false}`
//!   against an Ollama-style endpoint. Some deployments ignore
//!   `stream:false` and answer with a concatenated NDJSON sequence of
//!   `{response}` fragments; [`collect_generate_response`] handles both
//!   shapes from the same body.
//! - **hosted chat**: role-tagged messages (`system` + `user`) with
//!   bearer authentication; the answer is the first content block of the
//!   reply message.
//!
//! The endpoint, model and system prompt come from the `config` table
//! row, so operators can repoint the LLM without redeploying.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::LlmConfig;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("llm unavailable: {0}")]
    Unavailable(String),
    #[error("malformed llm response: {0}")]
    MalformedResponse(String),
}

/// Client over both completion variants.
pub struct LlmClient {
    http: reqwest::Client,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    system: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Deserialize, Default)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    stream: bool,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatReplyMessage,
}

#[derive(Deserialize)]
struct ChatReplyMessage {
    content: Vec<ChatContentBlock>,
}

#[derive(Deserialize)]
struct ChatContentBlock {
    #[serde(default)]
    text: String,
}

impl LlmClient {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
        }
    }

    /// Ask the local generate endpoint for an answer.
    pub async fn generate_local(
        &self,
        cfg: &LlmConfig,
        context: &str,
        question: &str,
    ) -> Result<String, LlmError> {
        let prompt = user_prompt(context, question);
        let response = self
            .http
            .post(&cfg.llm_url)
            .json(&GenerateRequest {
                model: &cfg.llm_model,
                system: &cfg.prompt_str,
                prompt: &prompt,
                stream: false,
            })
            .send()
            .await
            .map_err(|e| LlmError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Unavailable(format!("status {status}: {body}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| LlmError::Unavailable(e.to_string()))?;
        collect_generate_response(&body)
    }

    /// Ask the hosted chat endpoint for an answer.
    pub async fn chat_hosted(
        &self,
        cfg: &LlmConfig,
        context: &str,
        question: &str,
    ) -> Result<String, LlmError> {
        let prompt = user_prompt(context, question);
        let mut request = self.http.post(&cfg.llm_url).json(&ChatRequest {
            model: &cfg.llm_model,
            stream: false,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &cfg.prompt_str,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| LlmError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Unavailable(format!("status {status}: {body}")));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::MalformedResponse(e.to_string()))?;
        Ok(body
            .message
            .content
            .first()
            .map(|block| block.text.clone())
            .unwrap_or_default())
    }
}

fn user_prompt(context: &str, question: &str) -> String {
    format!(
        "Контекст из нескольких документов:\nКонтекст:\n{context}\nВопрос:\n{question} \nОтвет:"
    )
}

/// Decode a generate-endpoint body that is either one `{response}`
/// object or a concatenated NDJSON sequence of `{response}` fragments.
pub(crate) fn collect_generate_response(body: &[u8]) -> Result<String, LlmError> {
    if let Ok(single) = serde_json::from_slice::<GenerateResponse>(body) {
        if !single.response.is_empty() {
            return Ok(single.response);
        }
    }

    let mut output = String::new();
    for fragment in serde_json::Deserializer::from_slice(body).into_iter::<GenerateResponse>() {
        let fragment = fragment.map_err(|e| LlmError::MalformedResponse(e.to_string()))?;
        output.push_str(&fragment.response);
    }
    Ok(output)
}
