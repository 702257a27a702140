//! Per-unit speech synthesis

use std::sync::Arc;

use super::segmenter::{SentenceUnit, split_sentences};
use crate::audio;
use crate::error::SynthesisError;
use crate::providers::SpeechBackend;
use crate::session::{AudioChunk, RunId, Session};
use crate::{Error, Result};

/// Turns sentence units into WAV chunks at a fixed output rate and speed
#[derive(Clone)]
pub struct Synthesizer {
    backend: Arc<dyn SpeechBackend>,
    sample_rate: u32,
    speed: f32,
}

impl std::fmt::Debug for Synthesizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Synthesizer")
            .field("sample_rate", &self.sample_rate)
            .field("speed", &self.speed)
            .finish_non_exhaustive()
    }
}

impl Synthesizer {
    #[must_use]
    pub fn new(backend: Arc<dyn SpeechBackend>, sample_rate: u32, speed: f32) -> Self {
        Self {
            backend,
            sample_rate,
            speed,
        }
    }

    /// Output sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Synthesize `text` to samples at the output rate, with speed applied
    ///
    /// # Errors
    ///
    /// Returns a `SynthesisError` naming `text` if the backend or the
    /// post-processing fails
    pub async fn render(&self, text: &str) -> std::result::Result<Vec<f32>, SynthesisError> {
        let speech = self
            .backend
            .generate(text)
            .await
            .map_err(|e| SynthesisError::new(text, e))?;

        let target = self.sample_rate;
        let speed = self.speed;
        let samples = tokio::task::spawn_blocking(move || -> Result<Vec<f32>> {
            let resampled = audio::resample(&speech.samples, speech.sample_rate, target)?;
            audio::time_stretch(&resampled, speed)
        })
        .await
        .map_err(|e| SynthesisError::new(text, e))?
        .map_err(|e| SynthesisError::new(text, e))?;

        Ok(samples)
    }

    /// Synthesize one unit of a run into a chunk
    ///
    /// The samples are appended to the session's running waveform. The
    /// returned chunk has `end` unset; the producer decides finality.
    ///
    /// # Errors
    ///
    /// Returns a `SynthesisError` for this unit; the run may continue
    pub async fn synthesize(
        &self,
        session: &Session,
        run: RunId,
        unit: &SentenceUnit,
        index: usize,
    ) -> std::result::Result<AudioChunk, SynthesisError> {
        let samples = self.render(&unit.text).await?;
        let wav = audio::samples_to_wav(&samples, self.sample_rate)
            .map_err(|e| SynthesisError::new(&unit.text, e))?;

        session.append_waveform(run, &samples);

        tracing::debug!(
            session_id = %session.key(),
            run,
            index,
            secs = audio::duration_secs(samples.len(), self.sample_rate),
            "synthesized unit"
        );

        Ok(AudioChunk {
            index,
            text: unit.text.clone(),
            wav,
            end: false,
        })
    }

    /// Synthesize a complete text into a single WAV
    ///
    /// Units are synthesized in order and concatenated; failed units are
    /// skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns error if the text is blank or no unit could be synthesized
    pub async fn synthesize_text(&self, text: &str) -> Result<Vec<u8>> {
        let units = split_sentences(text);
        if units.is_empty() {
            return Err(Error::Tts("nothing to synthesize".to_string()));
        }

        let mut samples = Vec::new();
        let mut last_error = None;
        for unit in &units {
            match self.render(&unit.text).await {
                Ok(s) => samples.extend_from_slice(&s),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unit");
                    last_error = Some(e);
                }
            }
        }

        if samples.is_empty() {
            return Err(last_error.map_or_else(
                || Error::Tts("backend returned no audio".to_string()),
                Error::from,
            ));
        }

        audio::samples_to_wav(&samples, self.sample_rate)
    }
}
