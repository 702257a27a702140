//! External model providers
//!
//! Each capability is a trait so the pipeline can run against any backend:
//! - [`Transcriber`]: speech-to-text (Whisper-compatible)
//! - [`LanguageModel`]: chat completion, whole or streamed (Gemini)
//! - [`Retriever`]: context passages for a query (flat vector index)
//! - [`SpeechBackend`]: text-to-speech (`OpenAI`, Kokoro, Coqui)
//!
//! A missing provider is reported as [`Error::Unavailable`] when first used.

mod gemini;
pub mod prompt;
pub mod rag;
mod tts;
mod whisper;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

pub use gemini::GeminiClient;
pub use rag::{Embedder, FlatIndex, FlatIndexRetriever, IndexEntry, format_context};
pub use tts::{CoquiSpeech, OpenAiSpeech};
pub use whisper::WhisperTranscriber;

use crate::config::{Config, TtsProviderKind};
use crate::session::Role;
use crate::{Error, Result};

/// Incremental LLM output: finite and not restartable
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Synthesized speech for one piece of text
#[derive(Debug, Clone, PartialEq)]
pub struct Speech {
    /// Mono samples in `[-1.0, 1.0]`
    pub samples: Vec<f32>,
    /// Native sample rate of the backend
    pub sample_rate: u32,
}

/// One prior turn of the conversation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

/// Everything an LLM needs to answer one user message
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Persona prompt
    pub system_prompt: String,
    /// Prior turns, oldest first
    pub history: Vec<ChatTurn>,
    /// Retrieved context to ground the answer, if any
    pub context: Option<String>,
    /// The new user message
    pub message: String,
}

/// Speech-to-text
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe an audio file; `file_name` carries the container format
    async fn transcribe(&self, audio: Vec<u8>, file_name: &str) -> Result<String>;
}

/// Chat language model
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Produce the complete response
    async fn respond(&self, request: &ChatRequest) -> Result<String>;

    /// Produce the response as a stream of text deltas
    async fn stream(&self, request: &ChatRequest) -> Result<TextStream>;
}

/// Context retrieval
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Return up to `top_k` passages relevant to `query`, best first
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<String>>;
}

/// Text-to-speech
#[async_trait]
pub trait SpeechBackend: Send + Sync {
    /// Synthesize `text` into mono samples
    async fn generate(&self, text: &str) -> Result<Speech>;
}

/// The set of configured providers
#[derive(Clone, Default)]
pub struct Providers {
    pub transcriber: Option<Arc<dyn Transcriber>>,
    pub llm: Option<Arc<dyn LanguageModel>>,
    pub retriever: Option<Arc<dyn Retriever>>,
    pub speech: Option<Arc<dyn SpeechBackend>>,
}

impl std::fmt::Debug for Providers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Providers")
            .field("transcriber", &self.transcriber.is_some())
            .field("llm", &self.llm.is_some())
            .field("retriever", &self.retriever.is_some())
            .field("speech", &self.speech.is_some())
            .finish()
    }
}

impl Providers {
    /// Build providers from configuration
    ///
    /// Providers whose credentials or index are missing are left out and
    /// logged; the corresponding endpoints answer `not_configured`.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let client = reqwest::Client::new();

        let transcriber = config.stt.api_key.clone().map(|key| {
            Arc::new(WhisperTranscriber::new(client.clone(), &config.stt, key)) as Arc<dyn Transcriber>
        });
        if transcriber.is_none() {
            tracing::warn!("OPENAI_API_KEY not set, speech-to-text disabled");
        }

        let llm = config.llm.api_key.clone().map(|key| {
            Arc::new(GeminiClient::new(client.clone(), &config.llm, key)) as Arc<dyn LanguageModel>
        });
        if llm.is_none() {
            tracing::warn!("GEMINI_API_KEY not set, chat disabled");
        }

        let speech: Option<Arc<dyn SpeechBackend>> = match config.tts.provider {
            TtsProviderKind::Coqui => Some(Arc::new(CoquiSpeech::new(client.clone(), &config.tts))),
            TtsProviderKind::Kokoro => Some(Arc::new(OpenAiSpeech::new(client.clone(), &config.tts))),
            TtsProviderKind::OpenAi => {
                if config.tts.api_key.is_some() {
                    Some(Arc::new(OpenAiSpeech::new(client.clone(), &config.tts)))
                } else {
                    tracing::warn!("OPENAI_API_KEY not set, speech synthesis disabled");
                    None
                }
            }
        };

        let retriever = Self::load_retriever(config, &client);

        Self {
            transcriber,
            llm,
            retriever,
            speech,
        }
    }

    fn load_retriever(config: &Config, client: &reqwest::Client) -> Option<Arc<dyn Retriever>> {
        if !config.rag.enabled {
            return None;
        }
        let path = config.rag.index_path.as_ref()?;

        let Some(api_key) = config.rag.api_key.clone() else {
            tracing::warn!("no embeddings API key, retrieval disabled");
            return None;
        };

        match FlatIndex::load(path) {
            Ok(index) => {
                tracing::info!(
                    path = %path.display(),
                    entries = index.len(),
                    "loaded retrieval index"
                );
                let embedder = Embedder::new(
                    client.clone(),
                    &config.rag.base_url,
                    api_key,
                    &config.rag.embedding_model,
                );
                Some(Arc::new(FlatIndexRetriever::new(index, embedder)))
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to load retrieval index");
                None
            }
        }
    }

    /// The transcriber, or `Unavailable`
    ///
    /// # Errors
    ///
    /// Returns `Error::Unavailable` when speech-to-text is not configured
    pub fn transcriber(&self) -> Result<&Arc<dyn Transcriber>> {
        self.transcriber
            .as_ref()
            .ok_or(Error::Unavailable("speech-to-text"))
    }

    /// The language model, or `Unavailable`
    ///
    /// # Errors
    ///
    /// Returns `Error::Unavailable` when the LLM is not configured
    pub fn llm(&self) -> Result<&Arc<dyn LanguageModel>> {
        self.llm.as_ref().ok_or(Error::Unavailable("language model"))
    }

    /// The speech backend, or `Unavailable`
    ///
    /// # Errors
    ///
    /// Returns `Error::Unavailable` when speech synthesis is not configured
    pub fn speech(&self) -> Result<&Arc<dyn SpeechBackend>> {
        self.speech
            .as_ref()
            .ok_or(Error::Unavailable("speech synthesis"))
    }
}

/// Read an error response body for diagnostics
pub(crate) async fn error_body(response: reqwest::Response) -> String {
    response.text().await.unwrap_or_default()
}
