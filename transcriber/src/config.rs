use anyhow::Result;
use clap::Parser;
use shared_protocol::DEFAULT_MAX_FRAME_LEN;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "transcriber")]
#[command(about = "TCP transcription service backed by whisper", long_about = None)]
pub struct Config {
    #[arg(long, env = "WHISPER_HOST", default_value = "127.0.0.1", help = "address to listen on")]
    pub host: String,

    #[arg(short, long, env = "WHISPER_PORT", default_value_t = 9000, help = "port to listen on")]
    pub port: u16,

    #[arg(
        short,
        long,
        env = "WHISPER_WORKERS",
        help = "async transcription workers (default: CPUs - 1)"
    )]
    pub workers: Option<usize>,

    #[arg(
        short,
        long,
        env = "WHISPER_MODELS_DIR",
        default_value = "models",
        help = "directory holding ggml-<name>.bin model files"
    )]
    pub models_dir: PathBuf,

    #[arg(long, env = "WHISPER_THREADS", help = "inference threads per transcription")]
    pub threads: Option<i32>,

    #[arg(
        long,
        env = "WHISPER_MAX_FRAME_BYTES",
        default_value_t = DEFAULT_MAX_FRAME_LEN,
        help = "largest accepted request frame"
    )]
    pub max_frame_bytes: u64,

    #[arg(long, env = "WHISPER_MAX_CONNECTIONS", help = "cap on concurrent connections")]
    pub max_connections: Option<usize>,

    #[arg(
        long,
        env = "WHISPER_SHUTDOWN_GRACE_SECS",
        default_value_t = 5,
        help = "how long to wait for open connections on shutdown"
    )]
    pub shutdown_grace_secs: u64,
}

fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Config {
    pub fn validate(&self) -> Result<(), String> {
        if self.workers == Some(0) {
            return Err("workers must be at least 1".to_string());
        }
        if matches!(self.threads, Some(t) if t < 1) {
            return Err("threads must be at least 1".to_string());
        }
        if self.max_frame_bytes == 0 {
            return Err("max_frame_bytes must be greater than 0".to_string());
        }
        if self.max_connections == Some(0) {
            return Err("max_connections must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }

    pub fn worker_count(&self) -> usize {
        self.workers
            .unwrap_or_else(|| available_cpus().saturating_sub(1).max(1))
    }

    /// Splits the CPUs between workers, at most 8 per transcription.
    pub fn inference_threads(&self) -> i32 {
        self.threads.unwrap_or_else(|| {
            (available_cpus() / self.worker_count()).clamp(1, 8) as i32
        })
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}
