//! Shared test utilities

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use empath_gateway::providers::{
    ChatRequest, LanguageModel, Retriever, Speech, SpeechBackend, TextStream, Transcriber,
};
use empath_gateway::{Error, Pipeline, PipelineConfig, Providers, Result, SessionManager};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

pub const SAMPLE_RATE: u32 = 16_000;

/// Text containing this marker fails to synthesize
pub const FAIL_MARKER: &str = "FAIL";

/// Speech backend producing a short sine tone per unit
#[derive(Debug, Default)]
pub struct ToneSpeech;

#[async_trait]
impl SpeechBackend for ToneSpeech {
    async fn generate(&self, text: &str) -> Result<Speech> {
        if text.contains(FAIL_MARKER) {
            return Err(Error::Tts(format!("refused: {text}")));
        }
        #[allow(clippy::cast_precision_loss)]
        let samples = (0..1_600)
            .map(|i| (i as f32 * 0.05).sin() * 0.3)
            .collect();
        Ok(Speech {
            samples,
            sample_rate: SAMPLE_RATE,
        })
    }
}

/// LLM answering from a fixed list of deltas, or from a channel the test
/// feeds when gated
#[derive(Debug)]
pub struct ScriptedLlm {
    deltas: Vec<String>,
    gate: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedLlm {
    pub fn new(deltas: &[&str]) -> Self {
        Self {
            deltas: deltas.iter().map(|d| (*d).to_string()).collect(),
            gate: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// An LLM whose single stream yields what is sent on the returned sender
    pub fn gated() -> (Self, mpsc::UnboundedSender<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let llm = Self {
            deltas: Vec::new(),
            gate: Mutex::new(Some(rx)),
            requests: Mutex::new(Vec::new()),
        };
        (llm, tx)
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    async fn respond(&self, request: &ChatRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(self.deltas.concat())
    }

    async fn stream(&self, request: &ChatRequest) -> Result<TextStream> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(rx) = self.gate.lock().unwrap().take() {
            return Ok(UnboundedReceiverStream::new(rx).map(Ok).boxed());
        }
        let deltas: Vec<Result<String>> = self.deltas.iter().cloned().map(Ok).collect();
        Ok(futures::stream::iter(deltas).boxed())
    }
}

/// Transcriber returning a fixed transcript
#[derive(Debug)]
pub struct FixedTranscriber(pub String);

#[async_trait]
impl Transcriber for FixedTranscriber {
    async fn transcribe(&self, _audio: Vec<u8>, _file_name: &str) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Retriever returning fixed passages
#[derive(Debug)]
pub struct FixedRetriever(pub Vec<String>);

#[async_trait]
impl Retriever for FixedRetriever {
    async fn retrieve(&self, _query: &str, top_k: usize) -> Result<Vec<String>> {
        Ok(self.0.iter().take(top_k).cloned().collect())
    }
}

pub fn pipeline_config() -> PipelineConfig {
    PipelineConfig {
        system_prompt: "You are a test assistant.".to_string(),
        max_history: 10,
        rag_top_k: 3,
        max_context_tokens: 512,
        sample_rate: SAMPLE_RATE,
        speed: 1.0,
        chunk_pacing: Duration::ZERO,
    }
}

/// Fully configured providers over the fakes
pub fn providers(llm: Arc<ScriptedLlm>) -> Providers {
    Providers {
        transcriber: Some(Arc::new(FixedTranscriber("How are you?".to_string()))),
        llm: Some(llm),
        retriever: Some(Arc::new(FixedRetriever(vec![
            "Breathing slowly helps.".to_string(),
        ]))),
        speech: Some(Arc::new(ToneSpeech)),
    }
}

/// A pipeline over `providers` with sessions in `dir`
pub fn pipeline(providers: Providers, dir: &std::path::Path, expiry: Duration) -> Pipeline {
    let sessions = SessionManager::in_memory(dir, expiry).expect("failed to create sessions");
    Pipeline::new(providers, sessions, pipeline_config())
}

/// Build a test API router over `pipeline`
pub fn build_test_router(pipeline: Pipeline) -> axum::Router {
    let state = Arc::new(empath_gateway::api::ApiState::new(pipeline));
    empath_gateway::api::build_router(state, 1024 * 1024)
}
