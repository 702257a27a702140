//! Error types for the Empath gateway

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the gateway
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A capability was requested that no provider is configured for.
    ///
    /// Distinct from the attempted-and-failed variants below so callers can
    /// pick a fallback without inspecting messages.
    #[error("{0} is not configured")]
    Unavailable(&'static str),

    /// Speech-to-text request failed
    #[error("STT error: {0}")]
    Stt(String),

    /// Transcription succeeded at the transport level but produced no text
    #[error("transcription produced no text")]
    EmptyTranscription,

    /// Text-to-speech request failed
    #[error("TTS error: {0}")]
    Tts(String),

    /// A single sentence unit could not be synthesized
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),

    /// LLM request failed
    #[error("LLM error: {0}")]
    Llm(String),

    /// Retrieval (embedding or index lookup) failed
    #[error("retrieval error: {0}")]
    Retrieval(String),

    /// Audio decoding, encoding or resampling error
    #[error("audio error: {0}")]
    Audio(String),

    /// Unknown session key on a lookup or mutation
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// A run is already processing for this session
    #[error("session {0} already has a run in progress")]
    RunInProgress(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WAV container error
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
}

impl Error {
    /// Whether this error means "not configured" rather than "tried and failed"
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Failure to synthesize one sentence unit
///
/// Carries the offending unit so the caller can report it and move on to
/// the next one.
#[derive(Debug, Clone, Error)]
#[error("failed to synthesize \"{unit}\": {reason}")]
pub struct SynthesisError {
    /// Speakable text of the unit that failed
    pub unit: String,
    /// Backend diagnostic
    pub reason: String,
}

impl SynthesisError {
    /// Build a synthesis error for `unit` from any displayable backend error
    pub fn new(unit: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self {
            unit: unit.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_is_distinct_from_failure() {
        assert!(Error::Unavailable("speech synthesis").is_unavailable());
        assert!(!Error::Tts("boom".to_string()).is_unavailable());
    }

    #[test]
    fn synthesis_error_names_the_unit() {
        let err = Error::from(SynthesisError::new("Hello there.", "backend timed out"));
        let msg = err.to_string();
        assert!(msg.contains("Hello there."));
        assert!(msg.contains("backend timed out"));
    }
}
