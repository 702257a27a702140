//! Configuration management for the Empath gateway
//!
//! Values are layered env > TOML file > defaults.

pub mod file;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};
use file::EmpathConfigFile;

/// Default persona prompt for the assistant
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are EmpathAI, an empathetic and helpful voice assistant.
Keep your responses natural and conversational, attentive to the user's
needs and emotions, clear and concise enough to be spoken aloud, and
genuinely informative.

Be honest about what you do and do not know. Break complex topics down into
simpler terms, and keep a friendly, supportive tone throughout the
conversation.";

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,

    /// Session lifecycle configuration
    pub session: SessionConfig,

    /// Output audio configuration
    pub audio: AudioConfig,

    /// LLM configuration
    pub llm: LlmConfig,

    /// Speech-to-text configuration
    pub stt: SttConfig,

    /// Text-to-speech configuration
    pub tts: TtsConfig,

    /// Retrieval configuration
    pub rag: RagConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

/// Session lifecycle configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Inactivity window after which a session and its artifacts are deleted
    pub expiry: Duration,

    /// Interval of the background expiry sweep
    pub sweep_interval: Duration,

    /// Maximum request body size for audio uploads
    pub max_audio_bytes: usize,

    /// Directory for uploaded input audio and exported run waveforms
    pub temp_dir: PathBuf,
}

/// Output audio configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Sample rate of every emitted chunk and exported waveform
    pub sample_rate: u32,

    /// Time-stretch factor (0.5 to 2.0, 1.0 = unchanged)
    pub speed: f32,

    /// Delay after each emitted chunk to pace client playback
    pub chunk_pacing: Duration,
}

/// LLM configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Gemini API key (`GEMINI_API_KEY`)
    pub api_key: Option<String>,

    /// API base URL
    pub base_url: String,

    /// Model identifier
    pub model: String,

    /// Persona prompt
    pub system_prompt: String,

    /// Maximum number of history messages sent with each prompt
    pub max_history: usize,
}

/// Speech-to-text configuration
#[derive(Debug, Clone)]
pub struct SttConfig {
    /// API key for the OpenAI-compatible transcription endpoint
    pub api_key: Option<String>,

    /// API base URL (`…/v1`)
    pub base_url: String,

    /// Model identifier (e.g. "whisper-1")
    pub model: String,

    /// Optional ISO language hint
    pub language: Option<String>,
}

/// Text-to-speech backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsProviderKind {
    /// `OpenAI` `/audio/speech`
    OpenAi,
    /// Kokoro-FastAPI, which speaks the `OpenAI` speech protocol
    Kokoro,
    /// Coqui TTS server (`/api/tts`)
    Coqui,
}

impl TtsProviderKind {
    /// Default base URL for this backend
    #[must_use]
    pub const fn default_base_url(self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Kokoro => "http://localhost:8880/v1",
            Self::Coqui => "http://localhost:5002",
        }
    }

    /// Default model identifier for this backend
    #[must_use]
    pub const fn default_model(self) -> &'static str {
        match self {
            Self::OpenAi => "tts-1",
            Self::Kokoro => "kokoro",
            Self::Coqui => "tts_models/en/vctk/vits",
        }
    }

    /// Default voice for this backend
    #[must_use]
    pub const fn default_voice(self) -> &'static str {
        match self {
            Self::OpenAi => "alloy",
            Self::Kokoro => "af_heart",
            Self::Coqui => "",
        }
    }
}

impl FromStr for TtsProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "kokoro" => Ok(Self::Kokoro),
            "coqui" => Ok(Self::Coqui),
            other => Err(Error::Config(format!("unknown TTS provider: {other}"))),
        }
    }
}

/// Text-to-speech configuration
#[derive(Debug, Clone)]
pub struct TtsConfig {
    /// Selected backend
    pub provider: TtsProviderKind,

    /// API key, when the backend requires one
    pub api_key: Option<String>,

    /// API base URL
    pub base_url: String,

    /// Model identifier
    pub model: String,

    /// Voice or speaker identifier (empty for single-speaker models)
    pub voice: String,
}

/// Retrieval configuration
#[derive(Debug, Clone)]
pub struct RagConfig {
    /// Whether retrieval is attempted at all
    pub enabled: bool,

    /// Path to the JSON index; retrieval is unavailable without one
    pub index_path: Option<PathBuf>,

    /// Number of context passages per query
    pub top_k: usize,

    /// Token budget for the injected context
    pub max_context_tokens: usize,

    /// Embedding model used both for the index and for queries
    pub embedding_model: String,

    /// Embeddings API base URL
    pub base_url: String,

    /// Embeddings API key
    pub api_key: Option<String>,
}

/// Return the default directory for temporary audio artifacts
///
/// Uses `~/.cache/empath/recordings` on Linux
pub fn default_temp_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from("temp_recordings"),
        |d| d.cache_dir().join("empath").join("recordings"),
    )
}

impl Config {
    /// Load configuration from the environment and the config file
    ///
    /// An explicit `path` must exist and parse; the default path is optional.
    ///
    /// # Errors
    ///
    /// Returns error if an explicit config file cannot be loaded or a value
    /// is invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = match path {
            Some(p) => file::read_config_file(p)?,
            None => file::load_config_file(),
        };
        let config = Self::from_sources(fc, |key| std::env::var(key).ok())?;

        if let Err(e) = std::fs::create_dir_all(&config.session.temp_dir) {
            tracing::warn!(
                path = %config.session.temp_dir.display(),
                error = %e,
                "failed to create temp directory"
            );
        }

        Ok(config)
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value is out of range or unparsable
    pub fn from_sources<F>(fc: EmpathConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parsed = |key: &str| env(key).and_then(|v| v.trim().parse::<u64>().ok());

        // Server (env > toml > default)
        let server = ServerConfig {
            host: env("EMPATH_HOST")
                .or(fc.server.host)
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            port: env("EMPATH_PORT")
                .or_else(|| env("PORT"))
                .and_then(|s| s.parse().ok())
                .or(fc.server.port)
                .unwrap_or(8000),
        };

        // Session lifecycle
        let expiry_secs = parsed("EMPATH_SESSION_EXPIRY_SECS")
            .or(fc.session.expiry_secs)
            .unwrap_or(60 * 60);
        let session = SessionConfig {
            expiry: Duration::from_secs(expiry_secs),
            sweep_interval: Duration::from_secs(fc.session.sweep_interval_secs.unwrap_or(60).max(1)),
            max_audio_bytes: fc.session.max_audio_bytes.unwrap_or(20 * 1024 * 1024),
            temp_dir: env("EMPATH_TEMP_DIR")
                .or(fc.session.temp_dir)
                .map_or_else(default_temp_dir, PathBuf::from),
        };

        // Output audio
        let speed = env("EMPATH_TTS_SPEED")
            .and_then(|s| s.trim().parse::<f32>().ok())
            .or(fc.audio.speed)
            .unwrap_or(1.0);
        if !(0.5..=2.0).contains(&speed) {
            return Err(Error::Config(format!(
                "audio speed must be between 0.5 and 2.0, got {speed}"
            )));
        }
        let sample_rate = fc.audio.sample_rate.unwrap_or(24_000);
        if sample_rate == 0 {
            return Err(Error::Config("audio sample rate must be positive".to_string()));
        }
        let audio = AudioConfig {
            sample_rate,
            speed,
            chunk_pacing: Duration::from_millis(fc.audio.chunk_pacing_ms.unwrap_or(200)),
        };

        // LLM
        let llm = LlmConfig {
            api_key: env("GEMINI_API_KEY").or(fc.llm.api_key),
            base_url: fc
                .llm
                .base_url
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            model: env("EMPATH_LLM_MODEL")
                .or(fc.llm.model)
                .unwrap_or_else(|| "gemini-1.5-pro-latest".to_string()),
            system_prompt: fc
                .llm
                .system_prompt
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            max_history: fc.llm.max_history.unwrap_or(20),
        };

        let openai_key = env("OPENAI_API_KEY");

        // Speech-to-text
        let stt = SttConfig {
            api_key: fc.stt.api_key.or_else(|| openai_key.clone()),
            base_url: env("EMPATH_STT_URL")
                .or(fc.stt.base_url)
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model: env("EMPATH_STT_MODEL")
                .or(fc.stt.model)
                .unwrap_or_else(|| "whisper-1".to_string()),
            language: fc.stt.language,
        };

        // Text-to-speech
        let provider = env("EMPATH_TTS_PROVIDER")
            .or(fc.tts.provider)
            .map(|s| s.parse::<TtsProviderKind>())
            .transpose()?
            .unwrap_or(TtsProviderKind::OpenAi);
        let tts = TtsConfig {
            provider,
            api_key: fc.tts.api_key.or_else(|| openai_key.clone()),
            base_url: env("EMPATH_TTS_URL")
                .or(fc.tts.base_url)
                .unwrap_or_else(|| provider.default_base_url().to_string()),
            model: fc
                .tts
                .model
                .unwrap_or_else(|| provider.default_model().to_string()),
            voice: env("EMPATH_TTS_VOICE")
                .or(fc.tts.voice)
                .unwrap_or_else(|| provider.default_voice().to_string()),
        };

        // Retrieval
        let rag = RagConfig {
            enabled: fc.rag.enabled.unwrap_or(true),
            index_path: env("EMPATH_RAG_INDEX")
                .or(fc.rag.index_path)
                .map(PathBuf::from),
            top_k: fc.rag.top_k.unwrap_or(2).max(1),
            max_context_tokens: fc.rag.max_context_tokens.unwrap_or(3000),
            embedding_model: fc
                .rag
                .embedding_model
                .unwrap_or_else(|| "text-embedding-3-small".to_string()),
            base_url: fc
                .rag
                .base_url
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key: fc.rag.api_key.or(openai_key),
        };

        Ok(Self {
            server,
            session,
            audio,
            llm,
            stt,
            tts,
            rag,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_file_or_env() {
        let config = Config::from_sources(EmpathConfigFile::default(), env_of(&[])).unwrap();

        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.session.expiry, Duration::from_secs(3600));
        assert_eq!(config.session.max_audio_bytes, 20 * 1024 * 1024);
        assert_eq!(config.audio.sample_rate, 24_000);
        assert!((config.audio.speed - 1.0).abs() < f32::EPSILON);
        assert_eq!(config.llm.model, "gemini-1.5-pro-latest");
        assert!(config.llm.api_key.is_none());
        assert_eq!(config.stt.model, "whisper-1");
        assert_eq!(config.tts.provider, TtsProviderKind::OpenAi);
        assert_eq!(config.tts.voice, "alloy");
        assert_eq!(config.rag.top_k, 2);
        assert!(config.rag.index_path.is_none());
    }

    #[test]
    fn env_overrides_file() {
        let fc: EmpathConfigFile = toml::from_str("[server]\nport = 9000\n").unwrap();
        let config = Config::from_sources(fc, env_of(&[("EMPATH_PORT", "9100")])).unwrap();
        assert_eq!(config.server.port, 9100);
    }

    #[test]
    fn file_overrides_default() {
        let fc: EmpathConfigFile =
            toml::from_str("[session]\nexpiry_secs = 120\n[audio]\nchunk_pacing_ms = 0\n").unwrap();
        let config = Config::from_sources(fc, env_of(&[])).unwrap();
        assert_eq!(config.session.expiry, Duration::from_secs(120));
        assert_eq!(config.audio.chunk_pacing, Duration::ZERO);
    }

    #[test]
    fn tts_provider_selects_defaults() {
        let config = Config::from_sources(
            EmpathConfigFile::default(),
            env_of(&[("EMPATH_TTS_PROVIDER", "Kokoro")]),
        )
        .unwrap();

        assert_eq!(config.tts.provider, TtsProviderKind::Kokoro);
        assert_eq!(config.tts.base_url, "http://localhost:8880/v1");
        assert_eq!(config.tts.voice, "af_heart");
    }

    #[test]
    fn unknown_tts_provider_is_rejected() {
        let result = Config::from_sources(
            EmpathConfigFile::default(),
            env_of(&[("EMPATH_TTS_PROVIDER", "espeak")]),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn speed_out_of_range_is_rejected() {
        let result = Config::from_sources(
            EmpathConfigFile::default(),
            env_of(&[("EMPATH_TTS_SPEED", "3.5")]),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn openai_key_feeds_stt_tts_and_embeddings() {
        let config = Config::from_sources(
            EmpathConfigFile::default(),
            env_of(&[("OPENAI_API_KEY", "sk-test"), ("GEMINI_API_KEY", "g-test")]),
        )
        .unwrap();

        assert_eq!(config.stt.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.tts.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.rag.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.llm.api_key.as_deref(), Some("g-test"));
    }
}
