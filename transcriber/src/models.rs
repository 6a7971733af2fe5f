use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tracing::{info, warn};

use crate::engine::{Engine, EngineLoader};
use crate::error::ServiceError;

pub const CATALOG: [(&str, &str); 5] = [
    ("tiny", "fastest model (~1 GB)"),
    ("base", "good balance of speed and accuracy (~1 GB)"),
    ("small", "more accurate model (~2 GB)"),
    ("medium", "even more accurate model (~5 GB)"),
    ("large", "most accurate model (~10 GB)"),
];

pub fn catalog() -> BTreeMap<String, String> {
    CATALOG
        .iter()
        .map(|(name, desc)| (name.to_string(), desc.to_string()))
        .collect()
}

type Slot = Arc<Mutex<Option<Arc<dyn Engine>>>>;

/// Loaded engines by model name, kept for the life of the process.
///
/// Each name has its own slot lock, so a slow load only blocks callers that
/// want the same model and happens exactly once. A failed load leaves the
/// slot empty for a waiting caller to retry, or drops it when nobody waits.
pub struct ModelCache {
    loader: Arc<dyn EngineLoader>,
    slots: Mutex<HashMap<String, Slot>>,
    loaded: Mutex<BTreeSet<String>>,
}

impl ModelCache {
    pub fn new(loader: Arc<dyn EngineLoader>) -> Self {
        Self {
            loader,
            slots: Mutex::new(HashMap::new()),
            loaded: Mutex::new(BTreeSet::new()),
        }
    }

    /// Blocking: may load the model.
    pub fn get(&self, model_name: &str) -> Result<Arc<dyn Engine>, ServiceError> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(model_name.to_string()).or_default().clone()
        };

        let mut cached = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(engine) = cached.as_ref() {
            return Ok(engine.clone());
        }

        let start = Instant::now();
        match self.loader.load(model_name) {
            Ok(loaded) => {
                info!(
                    model = model_name,
                    "model cached after {:.2}s",
                    start.elapsed().as_secs_f64()
                );
                *cached = Some(loaded.clone());
                self.loaded
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(model_name.to_string());
                Ok(loaded)
            }
            Err(e) => {
                warn!(model = model_name, "model load failed: {}", e);
                drop(cached);
                self.forget_if_unused(model_name, &slot);
                Err(e)
            }
        }
    }

    // Cloning a slot needs the map lock, so with it held a count of two
    // (map + caller) means no one else is waiting on this slot.
    fn forget_if_unused(&self, model_name: &str, slot: &Slot) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let unused = slots
            .get(model_name)
            .is_some_and(|s| Arc::ptr_eq(s, slot) && Arc::strong_count(s) == 2);
        if unused {
            slots.remove(model_name);
        }
    }

    /// Names whose load has completed, sorted.
    pub fn loaded(&self) -> Vec<String> {
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
