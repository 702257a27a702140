//! Temporary audio files belonging to sessions
//!
//! Every artifact name starts with `<session_key>_`, so a session's files can
//! be found and removed without a separate registry.

use std::path::{Path, PathBuf};

use crate::Result;

/// Directory holding uploaded input audio and exported run waveforms
#[derive(Debug, Clone)]
pub struct ArtifactDir {
    root: PathBuf,
}

impl ArtifactDir {
    /// Use `root`, creating it if necessary
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Directory root
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path for an uploaded input file: `<key>_<timestamp>_input.<ext>`
    #[must_use]
    pub fn input_path(&self, key: &str, ext: &str) -> PathBuf {
        let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S%3f");
        let ext = sanitize_ext(ext);
        self.root.join(format!("{}_{stamp}_input.{ext}", file_key(key)))
    }

    /// Path for a run's exported waveform: `<key>_<export_id>_complete.wav`
    #[must_use]
    pub fn complete_path(&self, key: &str, export_id: &str) -> PathBuf {
        self.root
            .join(format!("{}_{export_id}_complete.wav", file_key(key)))
    }

    /// Store uploaded input audio and return its path
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub async fn save_input(&self, key: &str, ext: &str, data: &[u8]) -> Result<PathBuf> {
        let path = self.input_path(key, ext);
        tokio::fs::write(&path, data).await?;
        Ok(path)
    }

    /// Delete every artifact of session `key`, returning how many were removed
    pub fn remove_for(&self, key: &str) -> usize {
        let prefix = format!("{}_", file_key(key));
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(path = %self.root.display(), error = %e, "failed to list artifacts");
                return 0;
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(&prefix) {
                continue;
            }
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "failed to remove artifact");
                }
            }
        }

        if removed > 0 {
            tracing::debug!(session_id = %key, removed, "removed session artifacts");
        }
        removed
    }
}

/// Session key percent-encoded for use in a file name
///
/// `_` is escaped too, so the `<key>_` prefix of one session never matches
/// another session's files.
fn file_key(key: &str) -> String {
    urlencoding::encode(key).replace('_', "%5F")
}

fn sanitize_ext(ext: &str) -> String {
    let ext: String = ext
        .trim_start_matches('.')
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(8)
        .collect::<String>()
        .to_ascii_lowercase();
    if ext.is_empty() { "wav".to_string() } else { ext }
}
