//! TOML configuration file loading
//!
//! Supports `~/.config/empath/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct EmpathConfigFile {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Session lifecycle configuration
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Output audio configuration
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// LLM configuration
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// Speech-to-text configuration
    #[serde(default)]
    pub stt: SttFileConfig,

    /// Text-to-speech configuration
    #[serde(default)]
    pub tts: TtsFileConfig,

    /// Retrieval configuration
    #[serde(default)]
    pub rag: RagFileConfig,
}

/// Server/runtime configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Session lifecycle configuration
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    /// Inactivity window before a session is deleted
    pub expiry_secs: Option<u64>,
    /// How often the background sweeper runs
    pub sweep_interval_secs: Option<u64>,
    /// Maximum accepted upload size
    pub max_audio_bytes: Option<usize>,
    /// Directory for temporary audio artifacts
    pub temp_dir: Option<String>,
}

/// Output audio configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    pub sample_rate: Option<u32>,
    /// Time-stretch factor applied to every chunk (1.0 = unchanged)
    pub speed: Option<f32>,
    /// Delay after each emitted chunk
    pub chunk_pacing_ms: Option<u64>,
}

/// LLM-related configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    /// Model identifier (e.g. "gemini-1.5-pro-latest")
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub system_prompt: Option<String>,
    pub max_history: Option<usize>,
}

/// Speech-to-text configuration
#[derive(Debug, Default, Deserialize)]
pub struct SttFileConfig {
    /// STT model (e.g. "whisper-1")
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub language: Option<String>,
}

/// Text-to-speech configuration
#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    /// Backend: "openai", "kokoro" or "coqui"
    pub provider: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
}

/// Retrieval configuration
#[derive(Debug, Default, Deserialize)]
pub struct RagFileConfig {
    pub enabled: Option<bool>,
    /// Path to a JSON index built with `empath build-index`
    pub index_path: Option<String>,
    pub top_k: Option<usize>,
    pub max_context_tokens: Option<usize>,
    pub embedding_model: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `EmpathConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> EmpathConfigFile {
    let Some(path) = config_file_path() else {
        return EmpathConfigFile::default();
    };

    if !path.exists() {
        return EmpathConfigFile::default();
    }

    match read_config_file(&path) {
        Ok(config) => {
            tracing::info!(path = %path.display(), "loaded config file");
            config
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            EmpathConfigFile::default()
        }
    }
}

/// Read and parse a config file at an explicit path
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid TOML
pub fn read_config_file(path: &Path) -> Result<EmpathConfigFile> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Return the config file path: `~/.config/empath/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("empath").join("config.toml"))
}
