use base64::Engine as _;
use shared_protocol::{
    ClientMessage, DEFAULT_MODEL, FrameDecoder, ServerMessage, TaskStatus,
    write_frame,
};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ServiceError;
use crate::models;
use crate::queue::{AudioInput, TranscriptionTask};
use crate::results::TaskResult;
use crate::state::AppState;
use crate::worker;

const READ_BUF_SIZE: usize = 64 * 1024;
const STAGED_FILE_NAME: &str = "audio.bin";

/// Serves one client until it disconnects. Requests are answered one at a
/// time in the order they arrive; a shutdown closes the connection between
/// requests, never in the middle of one.
pub async fn handle_connection(
    mut stream: TcpStream,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let mut decoder = FrameDecoder::with_max_len(state.max_frame_len);
    let mut buf = vec![0u8; READ_BUF_SIZE];

    loop {
        let n = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("closing connection for shutdown");
                return Ok(());
            }
            read = stream.read(&mut buf) => read?,
        };
        if n == 0 {
            if decoder.buffered() > 0 {
                warn!(
                    "peer closed with {} bytes of an unfinished frame",
                    decoder.buffered()
                );
            }
            return Ok(());
        }

        for payload in decoder.feed(&buf[..n]) {
            let response = dispatch(&state, &payload).await;
            send(&mut stream, &response).await?;
        }
        if let Some(e) = decoder.error().cloned() {
            // framing is lost, nothing after this can be trusted
            send(&mut stream, &ServerMessage::error(e.to_string())).await?;
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, e));
        }
    }
}

async fn send<W>(writer: &mut W, message: &ServerMessage) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(message)?;
    write_frame(writer, &payload).await
}

/// Turns one request payload into its response. Never fails: every problem
/// becomes an `{"error": ...}` reply.
pub async fn dispatch(state: &Arc<AppState>, payload: &[u8]) -> ServerMessage {
    let message = match ClientMessage::parse(payload) {
        Ok(message) => message,
        Err(e) => {
            warn!("rejected request: {}", e);
            return ServerMessage::error(ServiceError::from(e).to_string());
        }
    };
    let command = message.command();
    info!(command, "request received");

    match handle_message(state, message).await {
        Ok(response) => response,
        Err(e) => {
            warn!(command, "request failed: {}", e);
            ServerMessage::error(e.to_string())
        }
    }
}

async fn handle_message(
    state: &Arc<AppState>,
    message: ClientMessage,
) -> Result<ServerMessage, ServiceError> {
    match message {
        ClientMessage::Transcribe {
            audio_data,
            audio_path,
            model,
            language,
            task,
            is_async,
        } => {
            let audio = resolve_audio(audio_data, audio_path).await?;
            let model = model
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| DEFAULT_MODEL.to_string());
            let language = language.filter(|l| !l.is_empty() && l != "auto");
            let task = TranscriptionTask::new(audio, model, language, task);
            if is_async {
                enqueue(state, task)
            } else {
                transcribe_inline(state, task).await
            }
        }
        ClientMessage::GetResult { task_id } => {
            let result = state.results.take_if_done(&task_id);
            if result.is_terminal() {
                info!(task_id = %task_id, "result delivered");
            }
            Ok(ServerMessage::Status(result.into()))
        }
        ClientMessage::ListModels => Ok(ServerMessage::Models {
            available_models: models::catalog(),
            loaded_models: state.models.loaded(),
        }),
        ClientMessage::QueueStatus => Ok(ServerMessage::QueueStatus {
            queue_size: state.queue.len(),
            stored_results: state.results.len(),
        }),
    }
}

fn enqueue(
    state: &Arc<AppState>,
    task: TranscriptionTask,
) -> Result<ServerMessage, ServiceError> {
    let task_id = task.task_id.clone();
    // marked before the push so a fast worker's result is never overwritten
    state.results.mark_pending(&task_id);
    if let Err(task) = state.queue.enqueue(task) {
        task.audio.cleanup();
        state
            .results
            .put(&task_id, TaskResult::Failed("task queue is closed".into()));
        return Err(ServiceError::Engine("task queue is closed".into()));
    }
    info!(task_id = %task_id, queue_size = state.queue.len(), "task queued");
    Ok(ServerMessage::Status(TaskStatus::Accepted { task_id }))
}

async fn transcribe_inline(
    state: &Arc<AppState>,
    task: TranscriptionTask,
) -> Result<ServerMessage, ServiceError> {
    let state = state.clone();
    let transcript = tokio::task::spawn_blocking(move || {
        worker::transcribe_now(&state.models, task)
    })
    .await
    .map_err(|e| ServiceError::Engine(format!("transcription aborted: {e}")))??;
    Ok(ServerMessage::Transcription(transcript))
}

/// Inline base64 data wins over a path, as long as it is non-empty.
async fn resolve_audio(
    audio_data: Option<String>,
    audio_path: Option<String>,
) -> Result<AudioInput, ServiceError> {
    if let Some(data) = audio_data.filter(|d| !d.is_empty()) {
        return tokio::task::spawn_blocking(move || stage_audio(&data))
            .await
            .map_err(ServiceError::audio_data)?;
    }

    let path = audio_path
        .filter(|p| !p.is_empty())
        .ok_or_else(ServiceError::path_not_specified)?;
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => Ok(AudioInput::existing(path)),
        _ => Err(ServiceError::file_not_found(&path)),
    }
}

fn stage_audio(data: &str) -> Result<AudioInput, ServiceError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(ServiceError::audio_data)?;
    let dir = tempfile::Builder::new()
        .prefix("whisper-")
        .tempdir()
        .map_err(ServiceError::audio_data)?;
    let path = dir.path().join(STAGED_FILE_NAME);
    // on failure `dir` is dropped here, which removes it
    std::fs::write(&path, &bytes).map_err(ServiceError::audio_data)?;
    debug!("staged {} bytes of audio at {}", bytes.len(), path.display());
    Ok(AudioInput::staged(path, dir))
}
