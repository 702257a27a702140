//! Whisper-compatible speech-to-text

use async_trait::async_trait;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

use super::{Transcriber, error_body};
use crate::config::SttConfig;
use crate::{Error, Result};

/// Transcribes audio through an `OpenAI`-compatible `/audio/transcriptions` endpoint
pub struct WhisperTranscriber {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    language: Option<String>,
}

impl WhisperTranscriber {
    /// Create a transcriber from STT configuration
    #[must_use]
    pub fn new(client: Client, config: &SttConfig, api_key: String) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            language: config.language.clone(),
        }
    }
}

/// MIME type for an uploaded file, from its extension
pub(crate) fn mime_for_file(file_name: &str) -> &'static str {
    let ext = file_name.rsplit_once('.').map_or("", |(_, e)| e);
    match ext.to_ascii_lowercase().as_str() {
        "mp3" | "mpeg" => "audio/mpeg",
        "m4a" | "mp4" => "audio/mp4",
        "webm" => "audio/webm",
        "ogg" | "oga" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "audio/wav",
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio: Vec<u8>, file_name: &str) -> Result<String> {
        tracing::debug!(audio_bytes = audio.len(), file_name, "starting transcription");

        let part = Part::bytes(audio)
            .file_name(file_name.to_string())
            .mime_str(mime_for_file(file_name))
            .map_err(|e| Error::Stt(format!("invalid MIME type: {e}")))?;

        let mut form = Form::new()
            .text("model", self.model.clone())
            .part("file", part);

        if let Some(ref lang) = self.language {
            form = form.text("language", lang.clone());
        }

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Stt(format!("transcription request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = error_body(response).await;
            tracing::error!(status = %status, body = %body, "transcription API error");
            return Err(Error::Stt(format!("transcription API error {status}: {body}")));
        }

        let result: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| Error::Stt(format!("failed to parse transcription response: {e}")))?;

        let text = result.text.trim().to_string();
        if text.is_empty() {
            return Err(Error::EmptyTranscription);
        }

        tracing::debug!(chars = text.len(), "transcription complete");
        Ok(text)
    }
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_follows_extension() {
        assert_eq!(mime_for_file("input.webm"), "audio/webm");
        assert_eq!(mime_for_file("clip.MP3"), "audio/mpeg");
        assert_eq!(mime_for_file("recording.wav"), "audio/wav");
        assert_eq!(mime_for_file("noext"), "audio/wav");
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let config = SttConfig {
            api_key: None,
            base_url: "http://localhost:9000/v1/".to_string(),
            model: "whisper-1".to_string(),
            language: Some("en".to_string()),
        };
        let t = WhisperTranscriber::new(Client::new(), &config, "key".to_string());
        assert_eq!(t.base_url, "http://localhost:9000/v1");
        assert_eq!(t.language.as_deref(), Some("en"));
    }
}
