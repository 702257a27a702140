//! The per-run producer task

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream, StreamExt};

use super::segmenter::{Segmenter, SentenceUnit};
use super::synthesizer::Synthesizer;
use crate::error::SynthesisError;
use crate::providers::TextStream;
use crate::session::{ArtifactDir, AudioChunk, RunId, Session};

type Deltas = Pin<Box<dyn Stream<Item = String> + Send>>;

/// What a finished run produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Chunks enqueued for delivery
    pub chunks: usize,
    /// Units that failed to synthesize
    pub failures: usize,
    /// Exported full waveform, if any audio was produced
    pub artifact: Option<PathBuf>,
}

/// Consumes one LLM stream for one run of a session
///
/// Text is appended to the session as it arrives, cut into sentence units,
/// and each unit is synthesized and enqueued in order.
pub struct Producer {
    session: Arc<Session>,
    run: RunId,
    synthesizer: Synthesizer,
    artifacts: ArtifactDir,
    pacing: Duration,
}

impl Producer {
    #[must_use]
    pub fn new(
        session: Arc<Session>,
        run: RunId,
        synthesizer: Synthesizer,
        artifacts: ArtifactDir,
        pacing: Duration,
    ) -> Self {
        Self {
            session,
            run,
            synthesizer,
            artifacts,
            pacing,
        }
    }

    /// Run to completion or cancellation, then finish the run
    ///
    /// Every chunk is enqueued as soon as it is synthesized. The end marker
    /// goes on the remainder flushed at stream end, or else on the last chunk
    /// still waiting in the queue.
    pub async fn run(self, stream: TextStream) -> RunSummary {
        let mut deltas = surface_errors(stream);
        let mut segmenter = Segmenter::new();
        let mut summary = RunSummary::default();

        'stream: while let Some(delta) = deltas.next().await {
            if !self.session.is_processing(self.run) {
                break;
            }
            self.session.append_text(self.run, &delta);

            for unit in segmenter.feed(&delta) {
                if !self.session.is_processing(self.run) {
                    break 'stream;
                }
                let result = self.synthesize(&unit, summary.chunks).await;
                self.deliver(result, false, &mut summary).await;
            }
        }

        if self.session.is_processing(self.run) {
            let flushed = match segmenter.finish() {
                Some(unit) => {
                    let result = self.synthesize(&unit, summary.chunks).await;
                    self.deliver(result, true, &mut summary).await
                }
                None => false,
            };
            if !flushed {
                self.session.mark_final(self.run);
            }
        }

        match self
            .session
            .complete_run(self.run, &self.artifacts, self.synthesizer.sample_rate())
        {
            Ok(path) => summary.artifact = path,
            Err(e) => {
                tracing::warn!(session_id = %self.session.key(), error = %e, "failed to export run audio");
            }
        }

        tracing::info!(
            session_id = %self.session.key(),
            run = self.run,
            chunks = summary.chunks,
            failures = summary.failures,
            "run finished"
        );
        summary
    }

    async fn synthesize(
        &self,
        unit: &SentenceUnit,
        index: usize,
    ) -> Result<AudioChunk, SynthesisError> {
        self.synthesizer
            .synthesize(&self.session, self.run, unit, index)
            .await
    }

    /// Enqueue a synthesized chunk or report its failure
    ///
    /// Returns whether a chunk was enqueued.
    async fn deliver(
        &self,
        result: Result<AudioChunk, SynthesisError>,
        end: bool,
        summary: &mut RunSummary,
    ) -> bool {
        match result {
            Ok(mut chunk) => {
                chunk.end = end;
                if !self.session.push_chunk(self.run, chunk) {
                    return false;
                }
                summary.chunks += 1;
                if !self.pacing.is_zero() {
                    tokio::time::sleep(self.pacing).await;
                }
                true
            }
            Err(e) => {
                tracing::warn!(session_id = %self.session.key(), error = %e, "unit synthesis failed");
                self.session.record_error(self.run, e.to_string());
                summary.failures += 1;
                false
            }
        }
    }
}

/// Turn stream errors into response text and end the stream after them
fn surface_errors(stream: TextStream) -> Deltas {
    Box::pin(stream::unfold(Some(stream), |state| async move {
        let mut stream = state?;
        match stream.next().await {
            Some(Ok(text)) => Some((text, Some(stream))),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "LLM stream failed");
                Some((format!("Error streaming LLM response: {e}"), None))
            }
            None => None,
        }
    }))
}

/// A stream that fails immediately with `error`, surfaced as response text
pub(crate) fn failed_stream(error: crate::Error) -> TextStream {
    Box::pin(stream::once(async move { Err(error) }))
}
