//! Gemini chat client (`generateContent` and SSE `streamGenerateContent`)

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::prompt::{context_preamble, gemini_role, system_instruction};
use super::{ChatRequest, LanguageModel, TextStream, error_body};
use crate::config::LlmConfig;
use crate::{Error, Result};

/// Gemini API client
pub struct GeminiClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl GeminiClient {
    /// Create a client from LLM configuration
    #[must_use]
    pub fn new(client: Client, config: &LlmConfig, api_key: String) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config
                .model
                .trim_start_matches("models/")
                .to_string(),
        }
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/models/{}:{method}", self.base_url, self.model)
    }

    async fn post(&self, url: &str, body: &GenerateRequest<'_>) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Llm(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = error_body(response).await;
            tracing::error!(status = %status, body = %body, "Gemini API error");
            return Err(Error::Llm(format!("Gemini API error {status}: {body}")));
        }
        Ok(response)
    }
}

#[async_trait]
impl LanguageModel for GeminiClient {
    async fn respond(&self, request: &ChatRequest) -> Result<String> {
        let system = system_instruction(&request.system_prompt);
        let body = GenerateRequest::build(&system, request);

        let response = self.post(&self.endpoint("generateContent"), &body).await?;
        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| Error::Llm(format!("failed to parse response: {e}")))?;

        Ok(parsed.text())
    }

    async fn stream(&self, request: &ChatRequest) -> Result<TextStream> {
        let system = system_instruction(&request.system_prompt);
        let body = GenerateRequest::build(&system, request);

        let url = format!("{}?alt=sse", self.endpoint("streamGenerateContent"));
        let response = self.post(&url, &body).await?;

        let (tx, rx) = mpsc::channel::<Result<String>>(32);
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut sse = SseBuffer::default();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(Err(Error::Llm(format!("stream interrupted: {e}")))).await;
                        return;
                    }
                };

                for payload in sse.push(&chunk) {
                    let text = match serde_json::from_str::<GenerateResponse>(&payload) {
                        Ok(parsed) => parsed.text(),
                        Err(e) => {
                            tracing::debug!(error = %e, "skipping unparsable SSE event");
                            continue;
                        }
                    };
                    if text.is_empty() {
                        continue;
                    }
                    if tx.send(Ok(text)).await.is_err() {
                        // Receiver dropped, run was cancelled
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Splits a server-sent-event byte stream into `data:` payloads
#[derive(Debug, Default)]
struct SseBuffer {
    pending: Vec<u8>,
    data: String,
}

impl SseBuffer {
    /// Feed bytes and return the payloads of every completed event
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(std::mem::take(&mut self.data));
                }
            } else if let Some(data) = line.strip_prefix("data:") {
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(data.trim_start());
            }
        }
        events
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    system_instruction: Content<'a>,
    contents: Vec<Content<'a>>,
}

impl<'a> GenerateRequest<'a> {
    fn build(system: &'a str, request: &'a ChatRequest) -> Self {
        let mut contents = Vec::with_capacity(request.history.len() + 2);

        if let Some(context) = request.context.as_deref().filter(|c| !c.trim().is_empty()) {
            contents.push(Content::owned("user", context_preamble(context)));
        }

        for turn in &request.history {
            contents.push(Content::text(Some(gemini_role(turn.role)), &turn.content));
        }

        contents.push(Content::text(Some("user"), &request.message));

        Self {
            system_instruction: Content::text(None, system),
            contents,
        }
    }
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part<'a>>,
}

impl<'a> Content<'a> {
    fn text(role: Option<&'static str>, text: &'a str) -> Self {
        Self {
            role,
            parts: vec![Part {
                text: std::borrow::Cow::Borrowed(text),
            }],
        }
    }

    fn owned(role: &'static str, text: String) -> Self {
        Self {
            role: Some(role),
            parts: vec![Part {
                text: std::borrow::Cow::Owned(text),
            }],
        }
    }
}

#[derive(Serialize)]
struct Part<'a> {
    text: std::borrow::Cow<'a, str>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

impl GenerateResponse {
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| c.parts.iter().map(|p| p.text.as_str()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ChatTurn;
    use crate::session::Role;

    #[test]
    fn sse_events_split_across_chunks() {
        let mut sse = SseBuffer::default();
        assert!(sse.push(b"data: {\"a\":").is_empty());
        let events = sse.push(b"1}\r\n\r\ndata: {\"b\":2}\n\n");
        assert_eq!(events, ["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn response_text_joins_parts() {
        let parsed: GenerateResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hi "},{"text":"there."}]}}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.text(), "Hi there.");

        let empty: GenerateResponse = serde_json::from_str(r#"{"candidates":[{}]}"#).unwrap();
        assert_eq!(empty.text(), "");
    }

    #[test]
    fn request_orders_context_history_message() {
        let request = ChatRequest {
            system_prompt: "persona".to_string(),
            history: vec![
                ChatTurn {
                    role: Role::User,
                    content: "hello".to_string(),
                },
                ChatTurn {
                    role: Role::Assistant,
                    content: "hi!".to_string(),
                },
            ],
            context: Some("facts".to_string()),
            message: "tell me more".to_string(),
        };
        let system = system_instruction(&request.system_prompt);
        let body = serde_json::to_value(GenerateRequest::build(&system, &request)).unwrap();

        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 4);
        assert!(contents[0]["parts"][0]["text"].as_str().unwrap().ends_with("facts"));
        assert_eq!(contents[2]["role"], "model");
        assert_eq!(contents[3]["parts"][0]["text"], "tell me more");
        assert!(body["systemInstruction"].get("role").is_none());
    }

    #[test]
    fn model_prefix_is_stripped() {
        let config = LlmConfig {
            api_key: None,
            base_url: "https://example.test/v1beta/".to_string(),
            model: "models/gemini-1.5-pro-latest".to_string(),
            system_prompt: String::new(),
            max_history: 4,
        };
        let client = GeminiClient::new(Client::new(), &config, "k".to_string());
        assert_eq!(
            client.endpoint("generateContent"),
            "https://example.test/v1beta/models/gemini-1.5-pro-latest:generateContent"
        );
    }
}
