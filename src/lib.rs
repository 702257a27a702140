//! Empath Gateway - streaming voice-chat gateway
//!
//! Accepts text or recorded speech, answers with an LLM (optionally grounded
//! by retrieved context) and speaks the answer back sentence by sentence
//! while the model is still generating.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Interfaces                        │
//! │      REST (poll)   │   WebSocket (push)   │   CLI    │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                   Pipeline                           │
//! │  STT → retrieval → LLM stream → sentences → TTS     │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                   Sessions                           │
//! │   history  │  chunk queue  │  artifacts  │  expiry  │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod audio;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod providers;
pub mod session;

pub use config::Config;
pub use error::{Error, Result, SynthesisError};
pub use pipeline::{Pipeline, PipelineConfig};
pub use providers::Providers;
pub use session::{Session, SessionManager};
