use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

mod client;
mod frame;

pub use client::{Client, ClientError, TranscribeOptions};
pub use frame::{
    DEFAULT_MAX_FRAME_LEN, FrameDecoder, FrameError, HEADER_LEN, encode_frame,
    read_frame, write_frame,
};

pub const DEFAULT_MODEL: &str = "base";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskMode {
    #[default]
    Transcribe,
    Translate, // any source language to English
}

impl TaskMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskMode::Transcribe => "transcribe",
            TaskMode::Translate => "translate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ClientMessage {
    Transcribe {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_data: Option<String>, // base64 encoded file contents
        #[serde(default, skip_serializing_if = "Option::is_none")]
        audio_path: Option<String>, // file already on the server's disk
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>, // defaults to DEFAULT_MODEL
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>, // None = auto-detect
        #[serde(default)]
        task: TaskMode,
        #[serde(default, rename = "async")]
        is_async: bool, // enqueue and answer with a task id
    },
    GetResult {
        task_id: String,
    },
    ListModels,
    QueueStatus,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("missing command")]
    MissingCommand,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl ClientMessage {
    pub const COMMANDS: [&'static str; 4] =
        ["transcribe", "get_result", "list_models", "queue_status"];

    pub fn command(&self) -> &'static str {
        match self {
            ClientMessage::Transcribe { .. } => "transcribe",
            ClientMessage::GetResult { .. } => "get_result",
            ClientMessage::ListModels => "list_models",
            ClientMessage::QueueStatus => "queue_status",
        }
    }

    /// Parses a frame payload. The `command` field is looked at first so an
    /// unknown command is reported by name rather than as a schema error.
    pub fn parse(payload: &[u8]) -> Result<Self, RequestError> {
        let value: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| RequestError::InvalidJson(e.to_string()))?;
        let command = match value.get("command") {
            Some(serde_json::Value::String(c)) => c.clone(),
            _ => return Err(RequestError::MissingCommand),
        };
        if !Self::COMMANDS.contains(&command.as_str()) {
            return Err(RequestError::UnknownCommand(command));
        }
        serde_json::from_value(value)
            .map_err(|e| RequestError::Invalid(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub id: usize,
    pub start: f64, // seconds
    pub end: f64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    pub language: String,
    pub segments: Vec<Segment>,
    pub processing_time: f64, // seconds spent in the engine
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum TaskStatus {
    Accepted { task_id: String },
    Pending, // also returned for ids the server has never issued
    Completed { result: Transcript },
    Failed { error: String },
}

// untagged: field presence selects the variant, Status must stay first
// since Failed also carries an `error` field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Status(TaskStatus),
    Error {
        error: String,
    },
    Transcription(Transcript),
    Models {
        available_models: BTreeMap<String, String>,
        loaded_models: Vec<String>,
    },
    QueueStatus {
        queue_size: usize,
        stored_results: usize,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: message.into(),
        }
    }
}
