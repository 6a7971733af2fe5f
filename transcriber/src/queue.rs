use shared_protocol::TaskMode;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tempfile::TempDir;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

/// Audio resolved to a file on disk. When the server wrote the file itself
/// it also owns the temporary directory holding it.
#[derive(Debug)]
pub struct AudioInput {
    path: PathBuf,
    temp_dir: Option<TempDir>,
}

impl AudioInput {
    pub fn existing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            temp_dir: None,
        }
    }

    pub fn staged(path: PathBuf, temp_dir: TempDir) -> Self {
        Self {
            path,
            temp_dir: Some(temp_dir),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn delete_after(&self) -> bool {
        self.temp_dir.is_some()
    }

    /// Removes the staged file and its directory. Failures are only logged.
    pub fn cleanup(self) {
        if let Some(dir) = self.temp_dir {
            let dir_path = dir.path().to_path_buf();
            match dir.close() {
                Ok(()) => debug!("removed {}", dir_path.display()),
                Err(e) => warn!("failed to remove {}: {}", dir_path.display(), e),
            }
        }
    }
}

#[derive(Debug)]
pub struct TranscriptionTask {
    pub task_id: String,
    pub audio: AudioInput,
    pub model: String,
    pub language: Option<String>,
    pub mode: TaskMode,
    pub created_at: Instant,
}

static TASK_SEQ: AtomicU64 = AtomicU64::new(0);

/// `<unix nanos, hex>-<process-wide sequence>`; the counter alone keeps ids
/// distinct when the clock does not move between two calls.
pub fn next_task_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let seq = TASK_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{nanos:x}-{seq}")
}

impl TranscriptionTask {
    pub fn new(
        audio: AudioInput,
        model: String,
        language: Option<String>,
        mode: TaskMode,
    ) -> Self {
        Self {
            task_id: next_task_id(),
            audio,
            model,
            language,
            mode,
            created_at: Instant::now(),
        }
    }

    pub fn queue_latency(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

/// Unbounded FIFO shared by all workers.
///
/// The receiver sits behind an async mutex: whichever worker holds it waits
/// for the next task, the others wait for the lock, so each task goes to
/// exactly one worker in enqueue order.
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<TranscriptionTask>,
    rx: Mutex<mpsc::UnboundedReceiver<TranscriptionTask>>,
    depth: AtomicUsize,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
            depth: AtomicUsize::new(0),
        }
    }

    /// Never blocks. Hands the task back if the queue has been closed.
    pub fn enqueue(&self, task: TranscriptionTask) -> Result<(), TranscriptionTask> {
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.tx.send(task).map_err(|e| {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            e.0
        })
    }

    /// Waits until a task is available.
    pub async fn dequeue(&self) -> Option<TranscriptionTask> {
        let mut rx = self.rx.lock().await;
        let task = rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::SeqCst);
        Some(task)
    }

    /// Stops the queue: later enqueues fail, waiting consumers get `None`,
    /// and tasks nobody picked up are handed back.
    pub async fn close(&self) -> Vec<TranscriptionTask> {
        let mut rx = self.rx.lock().await;
        rx.close();
        let mut left = Vec::new();
        while let Ok(task) = rx.try_recv() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            left.push(task);
        }
        left
    }

    pub fn len(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
