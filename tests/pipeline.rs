//! Streaming pipeline integration tests

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use empath_gateway::providers::{ChatRequest, LanguageModel, TextStream};
use empath_gateway::session::{RunPhase, Session};
use empath_gateway::{Error, Pipeline, Result};
use futures::StreamExt;

mod common;
use common::{SAMPLE_RATE, ScriptedLlm, pipeline, providers};

const EXPIRY: Duration = Duration::from_secs(600);

fn scripted(deltas: &[&str], dir: &std::path::Path) -> (Pipeline, Arc<ScriptedLlm>) {
    let llm = Arc::new(ScriptedLlm::new(deltas));
    (pipeline(providers(Arc::clone(&llm)), dir, EXPIRY), llm)
}

/// Wait until the session has at least one pending chunk
async fn first_chunks(session: &Session) -> Vec<empath_gateway::session::AudioChunk> {
    for _ in 0..500 {
        let drain = session.drain();
        if !drain.chunks.is_empty() {
            return drain.chunks;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no chunk was produced");
}

#[tokio::test]
async fn chunks_match_synthesized_units() {
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, _) = scripted(&["Hello there. How are you? I'm fine!"], dir.path());

    let session = pipeline.sessions().get_or_create("units");
    let handle = pipeline
        .start_stream(Arc::clone(&session), "Hi", false, None)
        .unwrap();
    let summary = handle.task.await.unwrap();

    let drain = session.drain();
    assert_eq!(summary.chunks, 3);
    assert_eq!(summary.failures, 0);
    assert_eq!(drain.chunks.len(), summary.chunks);
    assert!(!drain.is_processing);
    assert_eq!(session.phase(), RunPhase::Completed);

    let indices: Vec<usize> = drain.chunks.iter().map(|c| c.index).collect();
    assert_eq!(indices, [0, 1, 2]);
}

#[tokio::test]
async fn failed_units_are_skipped_and_reported() {
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, _) = scripted(&["Fine. ", "FAIL here. ", "Also fine."], dir.path());

    let session = pipeline.sessions().get_or_create("failures");
    let handle = pipeline
        .start_stream(Arc::clone(&session), "Hi", false, None)
        .unwrap();
    let summary = handle.task.await.unwrap();

    let drain = session.drain();
    assert_eq!(summary.chunks, 2);
    assert_eq!(summary.failures, 1);
    assert_eq!(drain.chunks.len(), 2);
    assert_eq!(drain.errors.len(), 1);
    assert!(drain.errors[0].contains("FAIL here."));
    assert_eq!(drain.chunks[1].index, 1);
    assert!(drain.chunks[1].end);
}

#[tokio::test]
async fn only_the_last_chunk_is_marked_end() {
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, _) = scripted(&["A. B. ", "C."], dir.path());

    let session = pipeline.sessions().get_or_create("end-marker");
    let handle = pipeline
        .start_stream(Arc::clone(&session), "Hi", false, None)
        .unwrap();
    handle.task.await.unwrap();

    let ends: Vec<bool> = session.drain().chunks.iter().map(|c| c.end).collect();
    assert_eq!(ends, [false, false, true]);
}

#[tokio::test]
async fn end_marker_falls_back_when_remainder_fails() {
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, _) = scripted(&["Fine. ", "FAIL tail"], dir.path());

    let session = pipeline.sessions().get_or_create("failed-tail");
    let handle = pipeline
        .start_stream(Arc::clone(&session), "Hi", false, None)
        .unwrap();
    let summary = handle.task.await.unwrap();
    assert_eq!(summary.failures, 1);

    let drain = session.drain();
    assert_eq!(drain.chunks.len(), 1);
    assert!(drain.chunks[0].end);
    assert_eq!(drain.errors.len(), 1);
}

#[tokio::test]
async fn trailing_text_is_spoken_last() {
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, _) = scripted(&["Hello. And then"], dir.path());

    let session = pipeline.sessions().get_or_create("trailing");
    let handle = pipeline
        .start_stream(Arc::clone(&session), "Hi", false, None)
        .unwrap();
    handle.task.await.unwrap();

    let chunks = session.drain().chunks;
    let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(texts, ["Hello.", "And then"]);
    assert!(!chunks[0].end);
    assert!(chunks[1].end);
}

#[tokio::test]
async fn second_drain_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, _) = scripted(&["One. Two."], dir.path());

    let session = pipeline.sessions().get_or_create("drains");
    let handle = pipeline
        .start_stream(Arc::clone(&session), "Hi", false, None)
        .unwrap();
    handle.task.await.unwrap();

    let first = session.drain();
    let second = session.drain();
    assert_eq!(first.chunks.len(), 2);
    assert!(second.chunks.is_empty());
    assert!(second.errors.is_empty());
    assert_eq!(second.response_so_far, "One. Two.");
}

#[tokio::test]
async fn run_records_history_and_exports_audio() {
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, llm) = scripted(&["Take a breath. ", "You're safe."], dir.path());

    let session = pipeline.sessions().get_or_create("history");
    let handle = pipeline
        .start_stream(Arc::clone(&session), "I'm anxious", true, None)
        .unwrap();
    let summary = handle.task.await.unwrap();

    let history = session.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].content, "I'm anxious");
    assert_eq!(history[1].content, "Take a breath. You're safe.");

    let artifact = summary.artifact.expect("waveform exported");
    assert_eq!(history[1].audio_path.as_deref(), Some(artifact.as_path()));
    let name = artifact.file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("history_") && name.ends_with("_complete.wav"));

    let (samples, rate) =
        empath_gateway::audio::wav_to_samples(&std::fs::read(&artifact).unwrap()).unwrap();
    assert_eq!(rate, SAMPLE_RATE);
    assert_eq!(samples.len(), 2 * 1_600);

    // Retrieved context travels with the request
    let request = &llm.requests()[0];
    assert_eq!(request.message, "I'm anxious");
    assert!(request.context.as_deref().unwrap().contains("Breathing"));
}

#[tokio::test]
async fn cancel_stops_after_in_flight_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let (llm, feed) = ScriptedLlm::gated();
    let pipeline = pipeline(providers(Arc::new(llm)), dir.path(), EXPIRY);

    let session = pipeline.sessions().get_or_create("cancel");
    let handle = pipeline
        .start_stream(Arc::clone(&session), "Hi", false, None)
        .unwrap();

    feed.send("First. Sec".to_string()).unwrap();
    let delivered = first_chunks(&session).await;
    assert_eq!(delivered.len(), 1);

    assert!(session.cancel());
    let _ = feed.send("ond. Third.".to_string());
    drop(feed);

    let summary = handle.task.await.unwrap();
    assert_eq!(summary.chunks, 1);
    assert!(session.drain().chunks.is_empty());
    assert_eq!(session.phase(), RunPhase::Cancelled);

    // The export holds exactly what was synthesized before the stop
    let artifact = summary.artifact.expect("partial waveform exported");
    let (samples, _) =
        empath_gateway::audio::wav_to_samples(&std::fs::read(&artifact).unwrap()).unwrap();
    assert_eq!(samples.len(), 1_600);
}

#[tokio::test]
async fn finished_sentence_is_delivered_while_stream_is_open() {
    let dir = tempfile::tempdir().unwrap();
    let (llm, feed) = ScriptedLlm::gated();
    let pipeline = pipeline(providers(Arc::new(llm)), dir.path(), EXPIRY);

    let session = pipeline.sessions().get_or_create("open-stream");
    let handle = pipeline
        .start_stream(Arc::clone(&session), "Hi", false, None)
        .unwrap();

    // The sentence is complete but the LLM has not said anything more
    feed.send("Hello there. ".to_string()).unwrap();
    let delivered = first_chunks(&session).await;
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].text, "Hello there.");
    assert!(!delivered[0].end);
    assert!(session.drain().is_processing);

    feed.send("Goodbye.".to_string()).unwrap();
    drop(feed);
    let summary = handle.task.await.unwrap();
    assert_eq!(summary.chunks, 2);

    let rest = session.drain().chunks;
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].index, 1);
    assert!(rest[0].end);
}

#[tokio::test]
async fn a_busy_session_rejects_a_second_run() {
    let dir = tempfile::tempdir().unwrap();
    let (llm, feed) = ScriptedLlm::gated();
    let pipeline = pipeline(providers(Arc::new(llm)), dir.path(), EXPIRY);

    let session = pipeline.sessions().get_or_create("busy");
    let handle = pipeline
        .start_stream(Arc::clone(&session), "Hi", false, None)
        .unwrap();

    let second = pipeline.start_stream(Arc::clone(&session), "Again", false, None);
    assert!(matches!(second, Err(Error::RunInProgress(_))));

    drop(feed);
    handle.task.await.unwrap();
    assert_eq!(session.phase(), RunPhase::Completed);
}

/// LLM whose stream fails after its first delta
struct BrokenLlm;

#[async_trait]
impl LanguageModel for BrokenLlm {
    async fn respond(&self, _request: &ChatRequest) -> Result<String> {
        Err(Error::Llm("quota exceeded".to_string()))
    }

    async fn stream(&self, _request: &ChatRequest) -> Result<TextStream> {
        let items = vec![
            Ok("Let me think. ".to_string()),
            Err(Error::Llm("quota exceeded".to_string())),
        ];
        Ok(futures::stream::iter(items).boxed())
    }
}

#[tokio::test]
async fn llm_errors_become_response_text() {
    let dir = tempfile::tempdir().unwrap();
    let mut providers = providers(Arc::new(ScriptedLlm::new(&[])));
    providers.llm = Some(Arc::new(BrokenLlm));
    let pipeline = pipeline(providers, dir.path(), EXPIRY);

    let session = pipeline.sessions().get_or_create("broken");
    let handle = pipeline
        .start_stream(Arc::clone(&session), "Hi", false, None)
        .unwrap();
    handle.task.await.unwrap();

    let drain = session.drain();
    assert!(drain.response_so_far.starts_with("Let me think. "));
    assert!(drain.response_so_far.contains("Error streaming LLM response:"));
    assert!(drain.chunks.last().unwrap().end);

    let reply = pipeline.respond(&session, "Hello?", false, None).await.unwrap();
    assert!(reply.response.starts_with("Error getting LLM response:"));
}

#[tokio::test]
async fn empty_transcription_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut providers = providers(Arc::new(ScriptedLlm::new(&[])));
    providers.transcriber = Some(Arc::new(common::FixedTranscriber("   ".to_string())));
    let pipeline = pipeline(providers, dir.path(), EXPIRY);

    let result = pipeline.transcribe(b"RIFF".to_vec(), "clip.wav").await;
    assert!(matches!(result, Err(Error::EmptyTranscription)));
}

#[tokio::test(start_paused = true)]
async fn idle_sessions_expire_with_their_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, _) = scripted(&[], dir.path());
    let sessions = pipeline.sessions();

    let session = sessions.get_or_create("idle");
    let input = sessions.artifacts().input_path(session.key(), "wav");
    std::fs::write(&input, b"RIFF").unwrap();
    let keep = sessions.get_or_create("active");

    tokio::time::advance(EXPIRY / 2).await;
    keep.touch();
    tokio::time::advance(EXPIRY / 2 + Duration::from_secs(1)).await;

    assert_eq!(sessions.sweep_expired(), 1);
    assert!(matches!(sessions.get("idle"), Err(Error::SessionNotFound(_))));
    assert!(!input.exists());
    assert!(sessions.get("active").is_ok());
}

#[tokio::test(start_paused = true)]
async fn expired_session_is_absent_on_lookup() {
    let dir = tempfile::tempdir().unwrap();
    let (pipeline, _) = scripted(&[], dir.path());
    let sessions = pipeline.sessions();

    sessions.get_or_create("lazy");
    tokio::time::advance(EXPIRY + Duration::from_secs(1)).await;

    assert!(sessions.get("lazy").is_err());
    assert!(sessions.is_empty());
}
