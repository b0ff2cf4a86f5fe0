//! Vision-language extraction of embedded images.
//!
//! [`VisionModel`] is the seam the chunker depends on; [`LlavaExtractor`]
//! implements it against an Ollama-style generate endpoint. The service
//! may stream its reply as a sequence of `{response, done}` fragments;
//! the extractor concatenates every `response` until `done` is set or the
//! stream ends.
//!
//! Model output is filtered to the substring between the first `{` and
//! the last `}`. When no such window exists the extractor retries with a
//! repair prompt built around the previous invalid output, sleeping
//! `attempt × 300 ms` between attempts and honouring cancellation
//! immediately between them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Sampling parameters fixed for extraction quality.
const TEMPERATURE: f32 = 0.05;
const TOP_P: f32 = 0.9;
const TOP_K: u32 = 20;
const MAX_TOKENS: u32 = 2048;

/// Base back-off unit between attempts.
const BACKOFF_STEP: Duration = Duration::from_millis(300);

const EXTRACTION_PROMPT: &str = r#"You are a vision-language extraction model.

Your task is to extract all visible UI text from the provided image
and return it as a SINGLE valid JSON object.

IMPORTANT RULES (MANDATORY):

- Output MUST be valid JSON.
- Output MUST start with '{' and end with '}'.
- Do NOT include explanations, comments, or markdown.
- Do NOT include any text outside JSON.
- Do NOT invent or infer missing values.
- If something is unclear or unlabeled, use an empty string "".

JSON STRUCTURE (FIXED):

{
  "sections": [
    {
      "section_name": "",
      "fields": [
        {
          "label": "",
          "value": ""
        }
      ],
      "buttons": [],
      "other_text": []
    }
  ]
}

EXTRACTION RULES:

- Preserve exact wording, capitalization, punctuation, and numbers.
- Include all visible labels, field values, selected dropdown values,
  checkbox and radio states ("checked"/"unchecked"), buttons, menu items,
  numeric values, units, and symbols.
- If there are no buttons, use an empty array.
- If there is no other text, use an empty array.
- Every section MUST include all four keys:
  "section_name", "fields", "buttons", "other_text".

NOW analyze the image and return ONLY the JSON object.
"#;

/// Errors raised by the vision extractor.
#[derive(Debug, Error)]
pub enum VisionError {
    /// The caller's cancellation signal fired.
    #[error("vision extraction cancelled")]
    Cancelled,
    /// The service was unreachable or answered with a failure status.
    #[error("vision model unavailable: {0}")]
    Unavailable(String),
    /// Model output contained no JSON object window.
    #[error("no valid json found in vision output")]
    NoJson,
    /// Every attempt produced invalid output.
    #[error("vision extraction failed after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: String },
}

/// Interface implemented by vision backends.
#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Extract structured JSON from a base64-encoded image, retrying on
    /// invalid output up to `max_attempts` times.
    async fn extract(
        &self,
        image_base64: &str,
        max_attempts: usize,
        cancel: &watch::Receiver<bool>,
    ) -> Result<String, VisionError>;
}

/// Vision client for an Ollama-style generate endpoint.
pub struct LlavaExtractor {
    http: reqwest::Client,
    url: String,
    model: String,
}

#[derive(Serialize)]
struct VisionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    temperature: f32,
    top_p: f32,
    top_k: u32,
    max_tokens: u32,
    images: [&'a str; 1],
}

#[derive(Deserialize)]
struct VisionFragment {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
}

impl LlavaExtractor {
    pub fn new(url: String, model: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
            model,
        }
    }

    /// One round-trip to the vision service: send the prompt plus image,
    /// concatenate all streamed fragments.
    async fn describe(&self, prompt: &str, image_base64: &str) -> Result<String, VisionError> {
        let response = self
            .http
            .post(&self.url)
            .json(&VisionRequest {
                model: &self.model,
                prompt,
                temperature: TEMPERATURE,
                top_p: TOP_P,
                top_k: TOP_K,
                max_tokens: MAX_TOKENS,
                images: [image_base64],
            })
            .send()
            .await
            .map_err(|e| VisionError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VisionError::Unavailable(format!("status {status}: {body}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| VisionError::Unavailable(e.to_string()))?;

        let mut output = String::new();
        for fragment in serde_json::Deserializer::from_slice(&body).into_iter::<VisionFragment>() {
            let fragment = fragment.map_err(|e| VisionError::Unavailable(e.to_string()))?;
            output.push_str(&fragment.response);
            if fragment.done {
                break;
            }
        }
        Ok(output)
    }
}

#[async_trait]
impl VisionModel for LlavaExtractor {
    async fn extract(
        &self,
        image_base64: &str,
        max_attempts: usize,
        cancel: &watch::Receiver<bool>,
    ) -> Result<String, VisionError> {
        let mut cancel = cancel.clone();
        let mut last_output = String::new();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if *cancel.borrow() {
                return Err(VisionError::Cancelled);
            }

            tracing::debug!(attempt, "vision extraction attempt");
            let result = if attempt == 1 {
                self.describe(EXTRACTION_PROMPT, image_base64).await
            } else {
                let repair = build_repair_prompt(&last_output);
                self.describe(&repair, image_base64).await
            };

            match result {
                Ok(raw) => {
                    if let Some(json) = extract_json(&raw) {
                        return Ok(json);
                    }
                    last_output = raw;
                    last_error = VisionError::NoJson.to_string();
                }
                Err(VisionError::Cancelled) => return Err(VisionError::Cancelled),
                Err(e) => last_error = e.to_string(),
            }

            if attempt < max_attempts {
                let backoff = BACKOFF_STEP * attempt as u32;
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    cancelled = async { cancel.wait_for(|cancelled| *cancelled).await.map(|r| *r) } => {
                        if cancelled.is_ok() {
                            return Err(VisionError::Cancelled);
                        }
                        // Sender gone: cancellation can no longer fire.
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        Err(VisionError::Exhausted {
            attempts: max_attempts,
            last: last_error,
        })
    }
}

/// The substring from the first `{` to the last `}`, when such a window
/// exists.
fn extract_json(s: &str) -> Option<String> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(s[start..=end].to_string())
}

fn build_repair_prompt(bad_output: &str) -> String {
    format!(
        r#"You previously returned an invalid JSON.

Your task is to FIX the JSON.

RULES:
- Output ONLY valid JSON
- Do NOT add or remove information
- Do NOT add explanations
- Do NOT include markdown
- Do NOT include text outside JSON

INVALID OUTPUT:
<<<
{bad_output}
>>>

Return the corrected JSON only.
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::POST, MockServer};
    use serde_json::json;

    fn no_cancel() -> watch::Receiver<bool> {
        watch::channel(false).1
    }

    #[test]
    fn extract_json_takes_brace_window() {
        assert_eq!(
            extract_json("noise {\"a\": 1} trailer").as_deref(),
            Some("{\"a\": 1}")
        );
    }

    #[test]
    fn extract_json_rejects_missing_braces() {
        assert_eq!(extract_json("no braces here"), None);
        assert_eq!(extract_json("} reversed {"), None);
    }

    #[tokio::test]
    async fn describe_concatenates_streamed_fragments() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate");
                then.status(200).body(
                    "{\"response\":\"{\\\"sections\\\"\",\"done\":false}\n{\"response\":\":[]}\",\"done\":true}",
                );
            })
            .await;

        let extractor = LlavaExtractor::new(
            format!("{}/api/generate", server.base_url()),
            "llava".to_string(),
        );
        let out = extractor
            .extract("aW1n", 1, &no_cancel())
            .await
            .expect("extraction");
        assert_eq!(out, "{\"sections\":[]}");
    }

    #[tokio::test]
    async fn retry_repairs_invalid_output() {
        let server = MockServer::start_async().await;
        // First attempt: the extraction prompt yields prose with no JSON.
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/generate")
                    .body_contains("vision-language extraction model");
                then.status(200)
                    .json_body(json!({ "response": "sorry, no data", "done": true }));
            })
            .await;
        // Repair attempt: valid JSON.
        server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/api/generate")
                    .body_contains("You previously returned");
                then.status(200)
                    .json_body(json!({ "response": "{\"fixed\": true}", "done": true }));
            })
            .await;

        let extractor = LlavaExtractor::new(
            format!("{}/api/generate", server.base_url()),
            "llava".to_string(),
        );
        let out = extractor
            .extract("aW1n", 3, &no_cancel())
            .await
            .expect("repaired extraction");
        assert_eq!(out, "{\"fixed\": true}");
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/api/generate");
                then.status(200)
                    .json_body(json!({ "response": "still not json", "done": true }));
            })
            .await;

        let extractor = LlavaExtractor::new(
            format!("{}/api/generate", server.base_url()),
            "llava".to_string(),
        );
        let err = extractor
            .extract("aW1n", 2, &no_cancel())
            .await
            .expect_err("exhaustion");
        assert!(matches!(err, VisionError::Exhausted { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn cancellation_preempts_attempts() {
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let extractor = LlavaExtractor::new("http://localhost:1/x".to_string(), "llava".to_string());
        let err = extractor
            .extract("aW1n", 3, &rx)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, VisionError::Cancelled));
    }
}
