//! Voice-chat REST endpoints

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Multipart, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ApiState;
use crate::session::{AudioChunk, Message, Role};

/// Build voice router (nested under `/api`)
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/voice/capabilities", get(capabilities))
        .route("/transcribe", post(transcribe))
        .route("/chat", post(chat))
        .route("/audio_response", post(audio_response))
        .route("/voice_chat", post(voice_chat))
        .route("/stream_voice_chat", post(stream_voice_chat))
        .route("/stream_chat", post(stream_chat))
        .route("/get_audio_chunks", get(get_audio_chunks))
        .route("/stop_session", post(stop_session))
        .route("/session_history", get(session_history))
        .route("/clear_session", delete(clear_session))
        .route("/export_session", get(export_session))
        .with_state(state)
}

const fn default_use_rag() -> bool {
    true
}

/// Query parameters shared by the session endpoints
#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub session_id: Option<String>,
    #[serde(default = "default_use_rag")]
    pub use_rag: bool,
}

impl SessionQuery {
    fn require_session(&self) -> Result<&str, ApiError> {
        self.session_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ApiError::BadRequest("session_id is required".to_string()))
    }
}

/// Text chat request
#[derive(Debug, Deserialize)]
pub struct ChatBody {
    pub text: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default = "default_use_rag")]
    pub use_rag: bool,
}

/// Synthesis request, as a JSON body or query string
#[derive(Debug, Default, Deserialize)]
pub struct SynthesizeRequest {
    #[serde(default)]
    pub text: Option<String>,
}

/// Voice capabilities response
#[derive(Debug, Serialize)]
pub struct VoiceCapabilities {
    pub stt_available: bool,
    pub tts_available: bool,
    pub llm_available: bool,
    pub rag_available: bool,
    pub sample_rate: u32,
}

/// Get voice capabilities
async fn capabilities(State(state): State<Arc<ApiState>>) -> Json<VoiceCapabilities> {
    let providers = state.pipeline.providers();
    Json(VoiceCapabilities {
        stt_available: providers.transcriber.is_some(),
        tts_available: providers.speech.is_some(),
        llm_available: providers.llm.is_some(),
        rag_available: providers.retriever.is_some(),
        sample_rate: state.pipeline.config().sample_rate,
    })
}

/// An uploaded audio file
struct Upload {
    data: Vec<u8>,
    file_name: String,
}

impl Upload {
    fn extension(&self) -> &str {
        self.file_name.rsplit_once('.').map_or("wav", |(_, ext)| ext)
    }
}

/// Read the `audio` field of a multipart form
async fn read_audio(mut multipart: Multipart) -> Result<Upload, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {e}")))?
    {
        if field.name() != Some("audio") {
            continue;
        }

        let file_name = field
            .file_name()
            .map(str::to_string)
            .or_else(|| field.content_type().map(extension_for_mime).map(|e| format!("audio.{e}")))
            .unwrap_or_else(|| "audio.wav".to_string());

        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("failed to read audio: {e}")))?;

        if data.is_empty() {
            return Err(ApiError::BadRequest("empty audio data".to_string()));
        }

        return Ok(Upload {
            data: data.to_vec(),
            file_name,
        });
    }

    Err(ApiError::BadRequest("missing `audio` field".to_string()))
}

fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/mp4" | "audio/m4a" => "m4a",
        "audio/webm" => "webm",
        "audio/ogg" => "ogg",
        "audio/flac" => "flac",
        _ => "wav",
    }
}

/// Transcription response
#[derive(Debug, Serialize)]
pub struct TranscribeResponse {
    pub transcription: String,
    pub processing_time: f64,
}

/// Transcribe uploaded audio
async fn transcribe(
    State(state): State<Arc<ApiState>>,
    multipart: Multipart,
) -> Result<Json<TranscribeResponse>, ApiError> {
    let started = Instant::now();
    let upload = read_audio(multipart).await?;

    let transcription = state
        .pipeline
        .transcribe(upload.data, &upload.file_name)
        .await?;

    Ok(Json(TranscribeResponse {
        transcription,
        processing_time: started.elapsed().as_secs_f64(),
    }))
}

/// Chat response
#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub response: String,
    pub processing_time: f64,
    pub context_used: bool,
}

/// Answer a text message in one piece
async fn chat(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<ChatBody>,
) -> Result<Json<ChatResponse>, ApiError> {
    let started = Instant::now();
    let text = non_empty(&body.text)?;

    let session = state.sessions().resolve(body.session_id.as_deref());
    let reply = state
        .pipeline
        .respond(&session, text, body.use_rag, None)
        .await?;

    Ok(Json(ChatResponse {
        session_id: session.key().to_string(),
        response: reply.response,
        processing_time: started.elapsed().as_secs_f64(),
        context_used: reply.context_used,
    }))
}

/// Synthesize text to a single WAV
///
/// `text` is read from the query string first, then from a JSON body.
async fn audio_response(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<SynthesizeRequest>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let text = match query.text {
        Some(text) => text,
        None if body.is_empty() => String::new(),
        None => serde_json::from_slice::<SynthesizeRequest>(&body)
            .map_err(|e| ApiError::BadRequest(format!("invalid request body: {e}")))?
            .text
            .unwrap_or_default(),
    };
    let text = non_empty(&text)?;
    let wav = state.pipeline.synthesizer()?.synthesize_text(text).await?;

    Ok(wav_response(wav, HeaderMap::new()))
}

/// Transcribe, answer and speak the whole reply as one WAV
async fn voice_chat(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<SessionQuery>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let started = Instant::now();
    let upload = read_audio(multipart).await?;
    let synthesizer = state.pipeline.synthesizer()?;

    let session = state.sessions().resolve(query.session_id.as_deref());
    let input_path = state
        .sessions()
        .artifacts()
        .save_input(session.key(), upload.extension(), &upload.data)
        .await?;

    let transcription = state
        .pipeline
        .transcribe(upload.data, &upload.file_name)
        .await?;

    let reply = state
        .pipeline
        .respond(&session, &transcription, query.use_rag, Some(input_path))
        .await?;

    let wav = synthesizer.synthesize_text(&reply.response).await?;

    tracing::info!(
        session_id = %session.key(),
        elapsed_ms = started.elapsed().as_millis(),
        "voice chat complete"
    );

    let mut headers = HeaderMap::new();
    insert_encoded(&mut headers, "x-transcription", &transcription);
    insert_encoded(&mut headers, "x-response-text", &reply.response);
    insert_encoded(&mut headers, "x-session-id", session.key());

    Ok(wav_response(wav, headers))
}

fn wav_response(wav: Vec<u8>, mut headers: HeaderMap) -> Response {
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("audio/wav"));
    (StatusCode::OK, headers, wav).into_response()
}

/// Percent-encode `value` into a header so non-ASCII text survives
fn insert_encoded(headers: &mut HeaderMap, name: &'static str, value: &str) {
    let encoded = urlencoding::encode(value);
    if let Ok(value) = HeaderValue::from_str(&encoded) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// Response for a turn started in the background
#[derive(Debug, Serialize)]
pub struct StreamStarted {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcription: Option<String>,
    pub status: &'static str,
    pub message: &'static str,
}

/// Transcribe and start a streamed turn
async fn stream_voice_chat(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<SessionQuery>,
    multipart: Multipart,
) -> Result<Json<StreamStarted>, ApiError> {
    let upload = read_audio(multipart).await?;

    let session = state.sessions().resolve(query.session_id.as_deref());
    let input_path = state
        .sessions()
        .artifacts()
        .save_input(session.key(), upload.extension(), &upload.data)
        .await?;

    let transcription = state
        .pipeline
        .transcribe(upload.data, &upload.file_name)
        .await?;

    state.pipeline.start_stream(
        Arc::clone(&session),
        &transcription,
        query.use_rag,
        Some(input_path),
    )?;

    Ok(Json(StreamStarted {
        session_id: session.key().to_string(),
        transcription: Some(transcription),
        status: "processing",
        message: "Poll /api/get_audio_chunks for audio",
    }))
}

/// Start a streamed turn from text
async fn stream_chat(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<ChatBody>,
) -> Result<Json<StreamStarted>, ApiError> {
    let text = non_empty(&body.text)?;

    let session = state.sessions().resolve(body.session_id.as_deref());
    state
        .pipeline
        .start_stream(Arc::clone(&session), text, body.use_rag, None)?;

    Ok(Json(StreamStarted {
        session_id: session.key().to_string(),
        transcription: None,
        status: "processing",
        message: "Poll /api/get_audio_chunks for audio",
    }))
}

/// A delivered chunk on the wire
#[derive(Debug, Serialize)]
pub struct ChunkPayload {
    pub index: usize,
    pub text: String,
    /// Base64 WAV
    pub audio: String,
    pub format: &'static str,
    pub end: bool,
}

impl From<AudioChunk> for ChunkPayload {
    fn from(chunk: AudioChunk) -> Self {
        Self {
            index: chunk.index,
            text: chunk.text,
            audio: BASE64.encode(&chunk.wav),
            format: "wav",
            end: chunk.end,
        }
    }
}

/// Poll response
#[derive(Debug, Serialize)]
pub struct ChunksResponse {
    pub session_id: String,
    pub chunk_count: usize,
    pub chunks: Vec<ChunkPayload>,
    pub is_processing: bool,
    pub response_so_far: String,
    pub errors: Vec<String>,
}

/// Take every pending chunk of a session
async fn get_audio_chunks(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<ChunksResponse>, ApiError> {
    let key = query.require_session()?;
    let drain = state.sessions().get(key)?.drain();

    let chunks: Vec<ChunkPayload> = drain.chunks.into_iter().map(ChunkPayload::from).collect();
    Ok(Json(ChunksResponse {
        session_id: key.to_string(),
        chunk_count: chunks.len(),
        chunks,
        is_processing: drain.is_processing,
        response_so_far: drain.response_so_far,
        errors: drain.errors,
    }))
}

/// Session status response
#[derive(Debug, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub status: &'static str,
}

/// Stop a session's run; unknown sessions are accepted
async fn stop_session(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<SessionStatus>, ApiError> {
    let key = query.require_session()?;
    state.sessions().stop(key);

    Ok(Json(SessionStatus {
        session_id: key.to_string(),
        status: "stopped",
    }))
}

/// A history message on the wire (audio paths stay private)
#[derive(Debug, Serialize)]
pub struct MessagePayload {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl From<Message> for MessagePayload {
    fn from(message: Message) -> Self {
        Self {
            role: message.role,
            content: message.content,
            timestamp: message.timestamp,
        }
    }
}

/// History response
#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub session_id: String,
    pub messages: Vec<MessagePayload>,
}

/// Return a session's message history
async fn session_history(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let key = query.require_session()?;
    let session = state.sessions().get(key)?;

    Ok(Json(HistoryResponse {
        session_id: key.to_string(),
        messages: session.history().into_iter().map(MessagePayload::from).collect(),
    }))
}

/// Cancel, forget history and delete artifacts
async fn clear_session(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<SessionStatus>, ApiError> {
    let key = query.require_session()?;
    state.sessions().clear(key)?;

    Ok(Json(SessionStatus {
        session_id: key.to_string(),
        status: "cleared",
    }))
}

/// Export response
#[derive(Debug, Serialize)]
pub struct ExportResponse {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<MessagePayload>,
}

/// Export a session
async fn export_session(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<SessionQuery>,
) -> Result<Json<ExportResponse>, ApiError> {
    let key = query.require_session()?;
    let session = state.sessions().get(key)?;

    Ok(Json(ExportResponse {
        session_id: key.to_string(),
        created_at: session.created_at(),
        messages: session.history().into_iter().map(MessagePayload::from).collect(),
    }))
}

fn non_empty(text: &str) -> Result<&str, ApiError> {
    let text = text.trim();
    if text.is_empty() {
        Err(ApiError::BadRequest("text must not be empty".to_string()))
    } else {
        Ok(text)
    }
}

/// API errors
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Gateway(crate::Error),
}

impl From<crate::Error> for ApiError {
    fn from(e: crate::Error) -> Self {
        Self::Gateway(e)
    }
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str) {
        use crate::Error;

        match self {
            Self::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            Self::Gateway(e) => match e {
                Error::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "not_configured"),
                Error::RunInProgress(_) => (StatusCode::CONFLICT, "run_in_progress"),
                Error::SessionNotFound(_) => (StatusCode::NOT_FOUND, "session_not_found"),
                Error::EmptyTranscription => (StatusCode::BAD_REQUEST, "empty_transcription"),
                Error::Stt(_) => (StatusCode::INTERNAL_SERVER_ERROR, "transcription_failed"),
                Error::Tts(_) | Error::Synthesis(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "synthesis_failed")
                }
                Error::Llm(_) => (StatusCode::INTERNAL_SERVER_ERROR, "llm_failed"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: ErrorBody,
        }

        #[derive(Serialize)]
        struct ErrorBody {
            code: &'static str,
            message: String,
        }

        let (status, code) = self.parts();
        let message = match self {
            Self::BadRequest(msg) => msg,
            Self::Gateway(e) => e.to_string(),
        };

        if status.is_server_error() {
            tracing::error!(code, message = %message, "request failed");
        }

        (status, Json(ErrorResponse { error: ErrorBody { code, message } })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn error_status_mapping() {
        let cases = [
            (ApiError::from(Error::Unavailable("speech synthesis")), StatusCode::SERVICE_UNAVAILABLE),
            (ApiError::from(Error::RunInProgress("s".to_string())), StatusCode::CONFLICT),
            (ApiError::from(Error::SessionNotFound("s".to_string())), StatusCode::NOT_FOUND),
            (ApiError::from(Error::EmptyTranscription), StatusCode::BAD_REQUEST),
            (ApiError::BadRequest("x".to_string()), StatusCode::BAD_REQUEST),
            (ApiError::from(Error::Llm("x".to_string())), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }

    #[test]
    fn chunk_payload_is_base64_wav() {
        let payload = ChunkPayload::from(AudioChunk {
            index: 3,
            text: "Hi.".to_string(),
            wav: b"RIFF".to_vec(),
            end: true,
        });
        assert_eq!(payload.audio, "UklGRg==");
        assert_eq!(payload.format, "wav");
        assert!(payload.end);
    }

    #[test]
    fn headers_are_percent_encoded() {
        let mut headers = HeaderMap::new();
        insert_encoded(&mut headers, "x-transcription", "héllo world");
        assert_eq!(headers["x-transcription"], "h%C3%A9llo%20world");
    }
}
