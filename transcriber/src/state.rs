use std::sync::Arc;

use crate::engine::EngineLoader;
use crate::models::ModelCache;
use crate::queue::TaskQueue;
use crate::results::ResultStore;

/// Everything connections and workers share. Built once at startup.
pub struct AppState {
    pub models: ModelCache,
    pub queue: TaskQueue,
    pub results: ResultStore,
    pub max_frame_len: u64,
}

impl AppState {
    pub fn new(loader: Arc<dyn EngineLoader>, max_frame_len: u64) -> Arc<Self> {
        Arc::new(Self {
            models: ModelCache::new(loader),
            queue: TaskQueue::new(),
            results: ResultStore::new(),
            max_frame_len,
        })
    }
}
