use shared_protocol::Transcript;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::error::ServiceError;
use crate::models::ModelCache;
use crate::queue::TranscriptionTask;
use crate::results::TaskResult;
use crate::state::AppState;

/// Runs one task to completion on the calling thread and removes any staged
/// audio afterwards. Blocking; shared by the sync path and the workers.
pub fn transcribe_now(
    models: &ModelCache,
    task: TranscriptionTask,
) -> Result<Transcript, ServiceError> {
    let start = Instant::now();
    let outcome = models.get(&task.model).and_then(|engine| {
        engine.transcribe(task.audio.path(), task.language.as_deref(), task.mode)
    });
    if task.audio.delete_after() {
        task.audio.cleanup();
    }
    match &outcome {
        Ok(_) => info!(
            task_id = %task.task_id,
            model = %task.model,
            "transcription finished in {:.2}s",
            start.elapsed().as_secs_f64()
        ),
        Err(e) => warn!(task_id = %task.task_id, "transcription failed: {}", e),
    }
    outcome
}

pub fn spawn_workers(
    count: usize,
    state: &Arc<AppState>,
    shutdown: &CancellationToken,
    tracker: &TaskTracker,
) {
    info!("Starting {} transcription worker(s)", count);
    for worker_id in 0..count {
        tracker.spawn(worker_loop(worker_id, state.clone(), shutdown.clone()));
    }
}

async fn worker_loop(
    worker_id: usize,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) {
    loop {
        let task = tokio::select! {
            _ = shutdown.cancelled() => break,
            task = state.queue.dequeue() => match task {
                Some(task) => task,
                None => break, // queue closed
            },
        };

        let task_id = task.task_id.clone();
        info!(
            worker_id,
            task_id = %task_id,
            queue_latency_ms = task.queue_latency().as_millis() as u64,
            "processing task"
        );

        // a panicking engine surfaces here as a JoinError, the loop goes on
        let blocking_state = state.clone();
        let joined = tokio::task::spawn_blocking(move || {
            transcribe_now(&blocking_state.models, task)
        })
        .await;
        let result = match joined {
            Ok(Ok(transcript)) => TaskResult::Completed(transcript),
            Ok(Err(e)) => TaskResult::Failed(e.to_string()),
            Err(e) => {
                error!(worker_id, task_id = %task_id, "transcription aborted: {}", e);
                TaskResult::Failed(format!("transcription aborted: {e}"))
            }
        };
        state.results.put(&task_id, result);
    }
    info!(worker_id, "worker stopped");
}
