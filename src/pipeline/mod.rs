//! Voice-chat pipeline
//!
//! caller text/audio → transcription → retrieval → LLM stream → sentence
//! segmentation → synthesis → session queue → delivery.

mod run;
pub mod segmenter;
pub mod synthesizer;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

pub use run::{Producer, RunSummary};
pub use segmenter::{Segmenter, SentenceUnit, split_sentences};
pub use synthesizer::Synthesizer;

use crate::config::Config;
use crate::providers::prompt::recent_turns;
use crate::providers::{ChatRequest, Providers, format_context};
use crate::session::{Message, Role, RunId, Session, SessionManager};
use crate::Result;

/// Tunables for turns
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub system_prompt: String,
    pub max_history: usize,
    pub rag_top_k: usize,
    pub max_context_tokens: usize,
    pub sample_rate: u32,
    pub speed: f32,
    pub chunk_pacing: Duration,
}

impl PipelineConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            system_prompt: config.llm.system_prompt.clone(),
            max_history: config.llm.max_history,
            rag_top_k: config.rag.top_k,
            max_context_tokens: config.rag.max_context_tokens,
            sample_rate: config.audio.sample_rate,
            speed: config.audio.speed,
            chunk_pacing: config.audio.chunk_pacing,
        }
    }
}

/// Result of a non-streaming chat turn
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub response: String,
    pub context_used: bool,
}

/// A run started in the background
#[derive(Debug)]
pub struct RunHandle {
    pub run: RunId,
    pub task: JoinHandle<RunSummary>,
}

/// Wires providers and sessions together for each turn
#[derive(Debug, Clone)]
pub struct Pipeline {
    providers: Providers,
    sessions: SessionManager,
    config: PipelineConfig,
}

impl Pipeline {
    #[must_use]
    pub const fn new(providers: Providers, sessions: SessionManager, config: PipelineConfig) -> Self {
        Self {
            providers,
            sessions,
            config,
        }
    }

    /// Configured providers
    #[must_use]
    pub const fn providers(&self) -> &Providers {
        &self.providers
    }

    /// Session manager
    #[must_use]
    pub const fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Turn tunables
    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// A synthesizer over the configured speech backend
    ///
    /// # Errors
    ///
    /// Returns `Error::Unavailable` when speech synthesis is not configured
    pub fn synthesizer(&self) -> Result<Synthesizer> {
        let backend = self.providers.speech()?.clone();
        Ok(Synthesizer::new(backend, self.config.sample_rate, self.config.speed))
    }

    /// Transcribe uploaded audio
    ///
    /// # Errors
    ///
    /// Returns `Unavailable`, `Stt` or `EmptyTranscription`
    pub async fn transcribe(&self, audio: Vec<u8>, file_name: &str) -> Result<String> {
        if audio.is_empty() {
            return Err(crate::Error::EmptyTranscription);
        }
        let text = self.providers.transcriber()?.transcribe(audio, file_name).await?;
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(crate::Error::EmptyTranscription);
        }
        Ok(text)
    }

    /// Retrieve and format context for `query`
    ///
    /// Retrieval failures are logged and treated as no context.
    pub async fn context_for(&self, query: &str, use_rag: bool) -> Option<String> {
        if !use_rag {
            return None;
        }
        let retriever = self.providers.retriever.as_ref()?;

        match retriever.retrieve(query, self.config.rag_top_k).await {
            Ok(chunks) => format_context(&chunks, self.config.max_context_tokens),
            Err(e) => {
                tracing::warn!(error = %e, "context retrieval failed, continuing without");
                None
            }
        }
    }

    fn request(&self, history: &[Message], message: &str, context: Option<String>) -> ChatRequest {
        ChatRequest {
            system_prompt: self.config.system_prompt.clone(),
            history: recent_turns(history, self.config.max_history),
            context,
            message: message.to_string(),
        }
    }

    /// Answer `text` in one piece and record both turns
    ///
    /// An LLM failure becomes the response text.
    ///
    /// # Errors
    ///
    /// Returns `Error::Unavailable` when no LLM is configured
    pub async fn respond(
        &self,
        session: &Session,
        text: &str,
        use_rag: bool,
        audio_path: Option<PathBuf>,
    ) -> Result<ChatReply> {
        let llm = self.providers.llm()?.clone();

        let history = session.history();
        session.push_message(Message::new(Role::User, text, audio_path));

        let context = self.context_for(text, use_rag).await;
        let context_used = context.is_some();
        let request = self.request(&history, text, context);

        let response = match llm.respond(&request).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(session_id = %session.key(), error = %e, "LLM request failed");
                format!("Error getting LLM response: {e}")
            }
        };

        session.push_message(Message::new(Role::Assistant, response.clone(), None));
        Ok(ChatReply {
            response,
            context_used,
        })
    }

    /// Start a streamed turn for `text` in the background
    ///
    /// Records the user message, then spawns the producer. Returns once the
    /// run has begun.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` when the LLM or speech backend is missing, or
    /// `RunInProgress` if the session is busy
    pub fn start_stream(
        &self,
        session: Arc<Session>,
        text: &str,
        use_rag: bool,
        audio_path: Option<PathBuf>,
    ) -> Result<RunHandle> {
        let llm = self.providers.llm()?.clone();
        let synthesizer = self.synthesizer()?;

        let run = session.begin_run()?;
        let history = session.history();
        session.push_message(Message::new(Role::User, text, audio_path));

        tracing::info!(session_id = %session.key(), run, use_rag, "starting streamed turn");

        let pipeline = self.clone();
        let text = text.to_string();
        let producer = Producer::new(
            session,
            run,
            synthesizer,
            self.sessions.artifacts().clone(),
            self.config.chunk_pacing,
        );

        let task = tokio::spawn(async move {
            let context = pipeline.context_for(&text, use_rag).await;
            let request = pipeline.request(&history, &text, context);
            let stream = match llm.stream(&request).await {
                Ok(s) => s,
                Err(e) => run::failed_stream(e),
            };
            producer.run(stream).await
        });

        Ok(RunHandle { run, task })
    }
}
