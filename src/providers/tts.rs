//! Text-to-speech backends

use async_trait::async_trait;
use reqwest::Client;

use super::{Speech, SpeechBackend, error_body};
use crate::audio::{pcm16_to_samples, wav_to_samples};
use crate::config::TtsConfig;
use crate::{Error, Result};

/// Sample rate of raw PCM from `/audio/speech` with `response_format = "pcm"`
const OPENAI_PCM_RATE: u32 = 24_000;

/// `OpenAI`-compatible `/audio/speech` backend
///
/// Also serves Kokoro-FastAPI, which implements the same endpoint.
pub struct OpenAiSpeech {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    voice: String,
}

impl OpenAiSpeech {
    /// Create a backend from TTS configuration
    #[must_use]
    pub fn new(client: Client, config: &TtsConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            voice: config.voice.clone(),
        }
    }
}

#[async_trait]
impl SpeechBackend for OpenAiSpeech {
    async fn generate(&self, text: &str) -> Result<Speech> {
        #[derive(serde::Serialize)]
        struct SpeechRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            response_format: &'static str,
        }

        let request = SpeechRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            response_format: "pcm",
        };

        let mut builder = self
            .client
            .post(format!("{}/audio/speech", self.base_url))
            .json(&request);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| Error::Tts(format!("speech request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = error_body(response).await;
            return Err(Error::Tts(format!("speech API error {status}: {body}")));
        }

        let bytes = response.bytes().await?;
        let samples = pcm16_to_samples(&bytes);
        if samples.is_empty() {
            return Err(Error::Tts("speech API returned no audio".to_string()));
        }

        Ok(Speech {
            samples,
            sample_rate: OPENAI_PCM_RATE,
        })
    }
}

/// Coqui TTS server backend (`GET /api/tts`)
pub struct CoquiSpeech {
    client: Client,
    base_url: String,
    speaker: Option<String>,
}

impl CoquiSpeech {
    /// Create a backend from TTS configuration
    #[must_use]
    pub fn new(client: Client, config: &TtsConfig) -> Self {
        let speaker = Some(config.voice.trim())
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            speaker,
        }
    }
}

#[async_trait]
impl SpeechBackend for CoquiSpeech {
    async fn generate(&self, text: &str) -> Result<Speech> {
        let mut query = vec![("text", text)];
        if let Some(ref speaker) = self.speaker {
            query.push(("speaker_id", speaker.as_str()));
        }

        let response = self
            .client
            .get(format!("{}/api/tts", self.base_url))
            .query(&query)
            .send()
            .await
            .map_err(|e| Error::Tts(format!("Coqui request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = error_body(response).await;
            return Err(Error::Tts(format!("Coqui TTS error {status}: {body}")));
        }

        let bytes = response.bytes().await?;
        let (samples, sample_rate) =
            wav_to_samples(&bytes).map_err(|e| Error::Tts(format!("invalid WAV from Coqui: {e}")))?;

        Ok(Speech {
            samples,
            sample_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TtsProviderKind;

    fn tts_config(provider: TtsProviderKind, voice: &str) -> TtsConfig {
        TtsConfig {
            provider,
            api_key: None,
            base_url: format!("{}/", provider.default_base_url()),
            model: provider.default_model().to_string(),
            voice: voice.to_string(),
        }
    }

    #[test]
    fn coqui_blank_voice_means_default_speaker() {
        let backend = CoquiSpeech::new(Client::new(), &tts_config(TtsProviderKind::Coqui, " "));
        assert!(backend.speaker.is_none());
        assert_eq!(backend.base_url, "http://localhost:5002");
    }

    #[test]
    fn kokoro_uses_openai_protocol() {
        let backend = OpenAiSpeech::new(Client::new(), &tts_config(TtsProviderKind::Kokoro, "af_heart"));
        assert_eq!(backend.base_url, "http://localhost:8880/v1");
        assert!(backend.api_key.is_none());
    }
}
