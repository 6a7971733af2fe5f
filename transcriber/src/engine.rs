use shared_protocol::{Segment, TaskMode, Transcript};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use whisper_rs::{
    FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters,
};

use crate::audio;
use crate::error::ServiceError;

/// A loaded recognition model. Calls are blocking and may take a long time;
/// run them off the async executor.
pub trait Engine: Send + Sync {
    fn transcribe(
        &self,
        audio_path: &Path,
        language: Option<&str>, // None = auto-detect
        mode: TaskMode,
    ) -> Result<Transcript, ServiceError>;
}

/// Produces engines by model name; used by the model cache on first use.
pub trait EngineLoader: Send + Sync {
    fn load(&self, model_name: &str) -> Result<Arc<dyn Engine>, ServiceError>;
}

pub struct WhisperLoader {
    models_dir: PathBuf,
    threads: i32,
}

impl WhisperLoader {
    pub fn new(models_dir: impl Into<PathBuf>, threads: i32) -> Self {
        Self {
            models_dir: models_dir.into(),
            threads,
        }
    }

    /// `<models_dir>/ggml-<name>.bin`
    pub fn model_path(&self, model_name: &str) -> Result<PathBuf, ServiceError> {
        let valid = !model_name.is_empty()
            && !model_name.starts_with('.')
            && model_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
        if !valid {
            return Err(ServiceError::Validation(format!(
                "invalid model name: {model_name:?}"
            )));
        }
        Ok(self.models_dir.join(format!("ggml-{model_name}.bin")))
    }
}

impl EngineLoader for WhisperLoader {
    fn load(&self, model_name: &str) -> Result<Arc<dyn Engine>, ServiceError> {
        let path = self.model_path(model_name)?;
        if !path.exists() {
            return Err(ServiceError::Engine(format!(
                "model '{}' not found at {}",
                model_name,
                path.display()
            )));
        }
        let path_str = path.to_str().ok_or_else(|| {
            ServiceError::Engine(format!("non UTF-8 model path {}", path.display()))
        })?;

        info!("Loading whisper model: {}", path.display());
        let start = Instant::now();
        let mut params = WhisperContextParameters::default();
        params.flash_attn(true);
        #[cfg(not(feature = "vulkan"))]
        info!("Running on CPU");
        #[cfg(feature = "vulkan")]
        {
            info!("Running with GPU acceleration (Vulkan)");
            params.use_gpu(true);
        }
        let ctx = WhisperContext::new_with_params(path_str, params).map_err(|e| {
            ServiceError::Engine(format!("failed to load model '{model_name}': {e}"))
        })?;
        info!(
            model = model_name,
            "model loaded in {:.2}s",
            start.elapsed().as_secs_f64()
        );

        Ok(Arc::new(WhisperEngine {
            ctx,
            threads: self.threads,
        }))
    }
}

pub struct WhisperEngine {
    ctx: WhisperContext, // read-only after load, a fresh state per call
    threads: i32,
}

fn engine_err(context: &str, e: impl std::fmt::Display) -> ServiceError {
    ServiceError::Engine(format!("{context}: {e}"))
}

impl Engine for WhisperEngine {
    fn transcribe(
        &self,
        audio_path: &Path,
        language: Option<&str>,
        mode: TaskMode,
    ) -> Result<Transcript, ServiceError> {
        let samples = audio::load_pcm_16k(audio_path)?;
        let mut state = self
            .ctx
            .create_state()
            .map_err(|e| engine_err("failed to create whisper state", e))?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_language(language);
        params.set_translate(mode == TaskMode::Translate);
        params.set_n_threads(self.threads);
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);

        let start = Instant::now();
        state
            .full(params, &samples)
            .map_err(|e| engine_err("transcription failed", e))?;
        let duration = start.elapsed().as_secs_f64();

        let audio_duration = samples.len() as f64 / audio::SAMPLE_RATE as f64;
        info!(
            "transcribing {:.2}s of audio took {:.2}s at {:.2}x",
            audio_duration,
            duration,
            audio_duration / duration
        );

        let mut segments = Vec::new();
        for i in 0..state.full_n_segments() {
            let Some(segment) = state.get_segment(i) else {
                continue;
            };
            let text = segment
                .to_str()
                .map_err(|e| engine_err("bad segment text", e))?;
            segments.push(Segment {
                id: segments.len(),
                start: segment.start_timestamp() as f64 / 100.,
                end: segment.end_timestamp() as f64 / 100.,
                text: text.to_string(),
            });
        }
        let text = segments
            .iter()
            .map(|s| s.text.as_str())
            .collect::<String>()
            .trim()
            .to_string();

        let language = match language {
            Some(lang) => lang.to_string(),
            None => Some(state.full_lang_id_from_state())
                .and_then(whisper_rs::get_lang_str)
                .unwrap_or("unknown")
                .to_string(),
        };

        Ok(Transcript {
            text,
            language,
            segments,
            processing_time: duration,
        })
    }
}
