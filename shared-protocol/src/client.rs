use base64::Engine;
use thiserror::Error;
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::frame::{DEFAULT_MAX_FRAME_LEN, read_frame, write_frame};
use crate::{ClientMessage, ServerMessage, TaskMode, TaskStatus};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("connection closed by server")]
    Closed,
    #[error("server error: {0}")]
    Server(String),
    #[error("unexpected response: {0:?}")]
    Unexpected(ServerMessage),
}

#[derive(Debug, Clone, Default)]
pub struct TranscribeOptions {
    pub model: Option<String>,
    pub language: Option<String>,
    pub task: TaskMode,
    pub is_async: bool,
}

/// One persistent connection; requests are answered strictly in order.
pub struct Client {
    stream: TcpStream,
    max_frame_len: u64,
}

impl Client {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            stream,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        })
    }

    pub async fn send_raw(&mut self, payload: &[u8]) -> Result<ServerMessage, ClientError> {
        write_frame(&mut self.stream, payload).await?;
        let response = read_frame(&mut self.stream, self.max_frame_len)
            .await?
            .ok_or(ClientError::Closed)?;
        Ok(serde_json::from_slice(&response)?)
    }

    pub async fn request(
        &mut self,
        message: &ClientMessage,
    ) -> Result<ServerMessage, ClientError> {
        let payload = serde_json::to_vec(message)?;
        self.send_raw(&payload).await
    }

    // helpers below turn `{error}` replies into Err
    async fn checked(
        &mut self,
        message: ClientMessage,
    ) -> Result<ServerMessage, ClientError> {
        match self.request(&message).await? {
            ServerMessage::Error { error } => Err(ClientError::Server(error)),
            other => Ok(other),
        }
    }

    pub async fn transcribe_path(
        &mut self,
        path: &str,
        options: TranscribeOptions,
    ) -> Result<ServerMessage, ClientError> {
        let language = options.language.filter(|l| !l.is_empty());
        self.checked(ClientMessage::Transcribe {
            audio_data: None,
            audio_path: Some(path.to_string()),
            model: options.model,
            language,
            task: options.task,
            is_async: options.is_async,
        })
        .await
    }

    pub async fn transcribe_data(
        &mut self,
        audio: &[u8],
        options: TranscribeOptions,
    ) -> Result<ServerMessage, ClientError> {
        let language = options.language.filter(|l| !l.is_empty());
        let encoded = base64::engine::general_purpose::STANDARD.encode(audio);
        self.checked(ClientMessage::Transcribe {
            audio_data: Some(encoded),
            audio_path: None,
            model: options.model,
            language,
            task: options.task,
            is_async: options.is_async,
        })
        .await
    }

    pub async fn get_result(&mut self, task_id: &str) -> Result<TaskStatus, ClientError> {
        let message = ClientMessage::GetResult {
            task_id: task_id.to_string(),
        };
        match self.checked(message).await? {
            ServerMessage::Status(status) => Ok(status),
            other => Err(ClientError::Unexpected(other)),
        }
    }

    pub async fn list_models(&mut self) -> Result<ServerMessage, ClientError> {
        self.checked(ClientMessage::ListModels).await
    }

    pub async fn queue_status(&mut self) -> Result<(usize, usize), ClientError> {
        match self.checked(ClientMessage::QueueStatus).await? {
            ServerMessage::QueueStatus {
                queue_size,
                stored_results,
            } => Ok((queue_size, stored_results)),
            other => Err(ClientError::Unexpected(other)),
        }
    }
}
