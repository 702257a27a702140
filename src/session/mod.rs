//! Streaming session state
//!
//! A [`Session`] holds one conversation: its history and the state of the
//! current run (accumulated response text, pending audio chunks, the running
//! waveform). A single producer per run fills the queue; any number of
//! readers take it with [`Session::drain`].

mod artifacts;
mod store;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub use artifacts::ArtifactDir;
pub use store::{MemorySessionStore, SessionStore};

use crate::{Error, Result};

/// Identifier of one run within a session
pub type RunId = u64;

/// Author of a history message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One history entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Input recording or exported response audio
    pub audio_path: Option<PathBuf>,
}

impl Message {
    /// Create a message stamped now
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>, audio_path: Option<PathBuf>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            audio_path,
        }
    }
}

/// Synthesized speech for one sentence unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    /// Zero-based position within the run
    pub index: usize,
    /// Speakable text of the unit
    pub text: String,
    /// Standalone mono 16-bit WAV
    pub wav: Vec<u8>,
    /// Set on the final chunk of a run
    pub end: bool,
}

/// Lifecycle of the current run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Processing,
    Completed,
    Cancelled,
}

/// Result of taking the pending queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Drain {
    pub chunks: Vec<AudioChunk>,
    pub is_processing: bool,
    pub response_so_far: String,
    /// Per-unit synthesis failures since the last drain
    pub errors: Vec<String>,
}

#[derive(Debug)]
struct SessionState {
    last_activity: Instant,
    phase: RunPhase,
    run_id: RunId,
    export_id: String,
    response: String,
    pending: VecDeque<AudioChunk>,
    errors: Vec<String>,
    waveform: Vec<f32>,
    history: Vec<Message>,
}

/// One conversation
#[derive(Debug)]
pub struct Session {
    key: String,
    created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    changed: watch::Sender<u64>,
}

impl Session {
    /// Create an idle session
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            key: key.into(),
            created_at: Utc::now(),
            state: Mutex::new(SessionState {
                last_activity: Instant::now(),
                phase: RunPhase::Idle,
                run_id: 0,
                export_id: new_export_id(),
                response: String::new(),
                pending: VecDeque::new(),
                errors: Vec::new(),
                waveform: Vec::new(),
                history: Vec::new(),
            }),
            changed,
        }
    }

    /// Session key
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Creation time
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        // State stays consistent across a panicking holder; keep serving
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn notify(&self) {
        self.changed.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Subscribe to state changes (new chunk, new text, phase change)
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    /// Record activity now
    pub fn touch(&self) {
        self.lock().last_activity = Instant::now();
    }

    /// Whether the session has been idle longer than `expiry`
    ///
    /// A session with a run in progress never expires.
    #[must_use]
    pub fn is_expired(&self, now: Instant, expiry: Duration) -> bool {
        let state = self.lock();
        state.phase != RunPhase::Processing && now.duration_since(state.last_activity) > expiry
    }

    /// Current run phase
    #[must_use]
    pub fn phase(&self) -> RunPhase {
        self.lock().phase
    }

    /// Start a new run, clearing the previous run's text, queue and waveform
    ///
    /// # Errors
    ///
    /// Returns `Error::RunInProgress` if a run is still processing
    pub fn begin_run(&self) -> Result<RunId> {
        let run = {
            let mut state = self.lock();
            if state.phase == RunPhase::Processing {
                return Err(Error::RunInProgress(self.key.clone()));
            }
            state.run_id += 1;
            state.phase = RunPhase::Processing;
            state.export_id = new_export_id();
            state.response.clear();
            state.pending.clear();
            state.errors.clear();
            state.waveform.clear();
            state.last_activity = Instant::now();
            state.run_id
        };

        tracing::debug!(session_id = %self.key, run, "run started");
        self.notify();
        Ok(run)
    }

    /// Whether `run` is current and still processing
    #[must_use]
    pub fn is_processing(&self, run: RunId) -> bool {
        let state = self.lock();
        state.run_id == run && state.phase == RunPhase::Processing
    }

    /// Append LLM text to the run's response
    pub fn append_text(&self, run: RunId, delta: &str) {
        {
            let mut state = self.lock();
            if state.run_id != run || state.phase != RunPhase::Processing {
                return;
            }
            state.response.push_str(delta);
            state.last_activity = Instant::now();
        }
        self.notify();
    }

    /// Append samples to the run's full waveform
    pub fn append_waveform(&self, run: RunId, samples: &[f32]) {
        let mut state = self.lock();
        if state.run_id == run {
            state.waveform.extend_from_slice(samples);
        }
    }

    /// Enqueue a chunk for delivery
    ///
    /// Accepted for the current run even after a cancel, so a chunk whose
    /// synthesis was already in flight is still delivered. Returns whether
    /// the chunk was enqueued.
    pub fn push_chunk(&self, run: RunId, chunk: AudioChunk) -> bool {
        {
            let mut state = self.lock();
            if state.run_id != run {
                return false;
            }
            state.pending.push_back(chunk);
            state.last_activity = Instant::now();
        }
        self.notify();
        true
    }

    /// Set the end marker on the last chunk of `run` still in the queue
    ///
    /// Returns false when the queue was already drained; `is_processing`
    /// going false is then the only end signal readers get.
    pub fn mark_final(&self, run: RunId) -> bool {
        let marked = {
            let mut state = self.lock();
            if state.run_id != run {
                return false;
            }
            match state.pending.back_mut() {
                Some(chunk) => {
                    chunk.end = true;
                    true
                }
                None => false,
            }
        };
        if marked {
            self.notify();
        }
        marked
    }

    /// Record a per-unit failure for the next drain
    pub fn record_error(&self, run: RunId, message: impl Into<String>) {
        {
            let mut state = self.lock();
            if state.run_id != run {
                return;
            }
            state.errors.push(message.into());
        }
        self.notify();
    }

    /// Take every pending chunk and snapshot the run
    pub fn drain(&self) -> Drain {
        let mut state = self.lock();
        state.last_activity = Instant::now();
        Drain {
            chunks: state.pending.drain(..).collect(),
            is_processing: state.phase == RunPhase::Processing,
            response_so_far: state.response.clone(),
            errors: std::mem::take(&mut state.errors),
        }
    }

    /// Stop the current run after the chunk in flight
    ///
    /// Returns whether a run was processing.
    pub fn cancel(&self) -> bool {
        let cancelled = {
            let mut state = self.lock();
            if state.phase == RunPhase::Processing {
                state.phase = RunPhase::Cancelled;
                true
            } else {
                false
            }
        };
        if cancelled {
            tracing::info!(session_id = %self.key, "run cancelled");
            self.notify();
        }
        cancelled
    }

    /// Cancel any run and return to idle with empty text, queue and waveform
    pub fn reset(&self) {
        {
            let mut state = self.lock();
            // A new run id orphans whatever the old producer still emits
            state.run_id += 1;
            state.phase = RunPhase::Idle;
            state.export_id = new_export_id();
            state.response.clear();
            state.pending.clear();
            state.errors.clear();
            state.waveform.clear();
            state.last_activity = Instant::now();
        }
        self.notify();
    }

    /// Finish `run`: export its waveform and record the assistant message
    ///
    /// The waveform is written to `artifacts` as
    /// `<key>_<export_id>_complete.wav` when non-empty; its path is returned.
    /// A run that was reset in the meantime is ignored.
    ///
    /// # Errors
    ///
    /// Returns error if the waveform cannot be written
    pub fn complete_run(
        &self,
        run: RunId,
        artifacts: &ArtifactDir,
        sample_rate: u32,
    ) -> Result<Option<PathBuf>> {
        let (waveform, export_id, response) = {
            let mut state = self.lock();
            if state.run_id != run {
                return Ok(None);
            }
            (
                std::mem::take(&mut state.waveform),
                state.export_id.clone(),
                state.response.clone(),
            )
        };

        let path = if waveform.is_empty() {
            None
        } else {
            let path = artifacts.complete_path(&self.key, &export_id);
            crate::audio::write_wav(&path, &waveform, sample_rate)?;
            Some(path)
        };

        {
            let mut state = self.lock();
            if state.run_id == run {
                if state.phase == RunPhase::Processing {
                    state.phase = RunPhase::Completed;
                }
                if !response.trim().is_empty() {
                    state
                        .history
                        .push(Message::new(Role::Assistant, response, path.clone()));
                }
                state.last_activity = Instant::now();
            }
        }

        tracing::debug!(session_id = %self.key, run, exported = path.is_some(), "run complete");
        self.notify();
        Ok(path)
    }

    /// Append a message to the history
    pub fn push_message(&self, message: Message) {
        let mut state = self.lock();
        state.history.push(message);
        state.last_activity = Instant::now();
    }

    /// Copy of the history
    #[must_use]
    pub fn history(&self) -> Vec<Message> {
        self.lock().history.clone()
    }

    /// Remove all history messages
    pub fn clear_history(&self) {
        self.lock().history.clear();
    }

    /// Response text accumulated by the current run
    #[must_use]
    pub fn response_text(&self) -> String {
        self.lock().response.clone()
    }
}

fn new_export_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// Owns the session store and artifact directory and applies expiry
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    artifacts: ArtifactDir,
    expiry: Duration,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.store.len())
            .field("artifacts", &self.artifacts)
            .field("expiry", &self.expiry)
            .finish()
    }
}

impl SessionManager {
    #[must_use]
    pub fn new(store: Arc<dyn SessionStore>, artifacts: ArtifactDir, expiry: Duration) -> Self {
        Self {
            store,
            artifacts,
            expiry,
        }
    }

    /// In-memory manager rooted at `temp_dir`
    ///
    /// # Errors
    ///
    /// Returns error if the artifact directory cannot be created
    pub fn in_memory(temp_dir: &Path, expiry: Duration) -> Result<Self> {
        Ok(Self::new(
            Arc::new(MemorySessionStore::new()),
            ArtifactDir::new(temp_dir)?,
            expiry,
        ))
    }

    /// Artifact directory
    #[must_use]
    pub const fn artifacts(&self) -> &ArtifactDir {
        &self.artifacts
    }

    /// Look up a live session
    ///
    /// An expired session is evicted here and reported as not found.
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionNotFound` for unknown or expired keys
    pub fn get(&self, key: &str) -> Result<Arc<Session>> {
        let session = self
            .store
            .get(key)
            .ok_or_else(|| Error::SessionNotFound(key.to_string()))?;

        if session.is_expired(Instant::now(), self.expiry) {
            self.evict(key);
            return Err(Error::SessionNotFound(key.to_string()));
        }
        Ok(session)
    }

    /// Look up a session, creating it if unknown or expired
    pub fn get_or_create(&self, key: &str) -> Arc<Session> {
        if let Some(session) = self.store.get(key) {
            if !session.is_expired(Instant::now(), self.expiry) {
                return session;
            }
            self.evict(key);
        }
        let session = self.store.get_or_create(key);
        tracing::debug!(session_id = %key, "session ready");
        session
    }

    /// Get or create the session for an optional client-supplied key
    ///
    /// A fresh UUID is used when no key is given.
    pub fn resolve(&self, key: Option<&str>) -> Arc<Session> {
        match key.map(str::trim).filter(|k| !k.is_empty()) {
            Some(k) => self.get_or_create(k),
            None => self.get_or_create(&uuid::Uuid::new_v4().to_string()),
        }
    }

    /// Cancel the session's run; unknown keys are accepted
    pub fn stop(&self, key: &str) {
        if let Some(session) = self.store.get(key) {
            session.cancel();
        }
    }

    /// Cancel, clear history, delete artifacts and reset
    ///
    /// # Errors
    ///
    /// Returns `Error::SessionNotFound` for unknown keys
    pub fn clear(&self, key: &str) -> Result<()> {
        let session = self.get(key)?;
        session.cancel();
        session.clear_history();
        self.artifacts.remove_for(key);
        session.reset();
        tracing::info!(session_id = %key, "session cleared");
        Ok(())
    }

    /// Delete sessions idle beyond the expiry window, with their artifacts
    ///
    /// Returns the number of sessions removed.
    pub fn sweep_expired(&self) -> usize {
        let expired = self.store.sweep_expired(Instant::now(), self.expiry);
        for session in &expired {
            session.cancel();
            self.artifacts.remove_for(session.key());
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "expired idle sessions");
        }
        expired.len()
    }

    /// Sweep expired sessions every `interval` in the background
    #[must_use]
    pub fn spawn_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Skip the first immediate tick
            ticker.tick().await;

            loop {
                ticker.tick().await;
                manager.sweep_expired();
            }
        })
    }

    /// Number of stored sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Whether no sessions are stored
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    fn evict(&self, key: &str) {
        if let Some(session) = self.store.delete(key) {
            session.cancel();
        }
        self.artifacts.remove_for(key);
        tracing::debug!(session_id = %key, "evicted expired session");
    }
}
