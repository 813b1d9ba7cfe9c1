//! The local LLM session: one shared, lock-guarded inference engine.

pub mod openai;

use image::DynamicImage;
use std::{
    ops::ControlFlow,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::{DecodeParams, ModelDescriptor};

pub use self::openai::OpenAiCompatibleBackend;

pub struct GenerateRequest<'a> {
    pub prompt: &'a str,
    pub images: &'a [DynamicImage],
    pub decode: &'a DecodeParams,
}

/// A loaded inference engine. Implementations keep conversational context
/// between calls until [`LlmEngine::reset`].
pub trait LlmEngine: Send {
    /// Streams the reply through `on_chunk`; returning `Break` stops
    /// generation early.
    fn generate(
        &mut self,
        request: &GenerateRequest<'_>,
        on_chunk: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<()>;

    fn reset(&mut self) -> Result<()>;
}

/// Turns downloaded weights into an engine.
pub trait LlmBackend: Send + Sync {
    fn load(&self, model: &ModelDescriptor, weights: &Path) -> Result<Box<dyn LlmEngine>>;
}

struct Loaded {
    model: ModelDescriptor,
    engine: Box<dyn LlmEngine>,
}

/// Every initialize, reset and generate goes through one mutex, so only one
/// of them runs at a time. All methods block; call them from a blocking
/// context such as `tokio::task::spawn_blocking`.
pub struct LlmSession {
    backend: Arc<dyn LlmBackend>,
    state: Mutex<Option<Loaded>>,
    ready: AtomicBool,
    accepts_images: AtomicBool,
    stop_requested: AtomicBool,
}

impl LlmSession {
    pub fn new(backend: Arc<dyn LlmBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(None),
            ready: AtomicBool::new(false),
            accepts_images: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
        }
    }

    fn state(&self) -> MutexGuard<'_, Option<Loaded>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Non-blocking: does not wait for an in-flight generation.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Non-blocking: whether the loaded model takes image input.
    pub fn accepts_images(&self) -> bool {
        self.is_ready() && self.accepts_images.load(Ordering::Acquire)
    }

    pub fn loaded_model(&self) -> Option<ModelDescriptor> {
        self.state().as_ref().map(|loaded| loaded.model.clone())
    }

    /// Loads `model`. A no-op when that model is already loaded.
    pub fn initialize(&self, model: &ModelDescriptor, weights: &Path) -> Result<()> {
        let mut state = self.state();
        if let Some(loaded) = state.as_ref() {
            if loaded.model.name == model.name {
                return Ok(());
            }
        }

        *state = None;
        self.ready.store(false, Ordering::Release);
        self.accepts_images.store(false, Ordering::Release);

        info!("loading LLM {} from {}", model.name, weights.display());
        let engine = self.backend.load(model, weights)?;
        *state = Some(Loaded {
            model: model.clone(),
            engine,
        });
        self.accepts_images.store(model.multimodal, Ordering::Release);
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    pub fn unload(&self) {
        let mut state = self.state();
        *state = None;
        self.ready.store(false, Ordering::Release);
        self.accepts_images.store(false, Ordering::Release);
    }

    /// Drops the conversational context. Any generation in flight is told to
    /// stop and its output is discarded.
    pub fn reset(&self) -> Result<()> {
        self.stop_requested.store(true, Ordering::Release);
        let mut state = self.state();
        self.stop_requested.store(false, Ordering::Release);
        match state.as_mut() {
            Some(loaded) => loaded.engine.reset(),
            None => Ok(()),
        }
    }

    /// Continues the current conversation.
    pub fn generate(&self, prompt: &str, images: &[DynamicImage]) -> Result<String> {
        let mut state = self.state();
        let loaded = state
            .as_mut()
            .ok_or_else(|| Error::CapabilityUnavailable("local LLM".to_string()))?;
        self.run(loaded, prompt, images)
    }

    /// Resets and generates under a single lock acquisition, so no other
    /// caller's context can leak into the reply.
    pub fn generate_fresh(&self, prompt: &str, images: &[DynamicImage]) -> Result<String> {
        let mut state = self.state();
        let loaded = state
            .as_mut()
            .ok_or_else(|| Error::CapabilityUnavailable("local LLM".to_string()))?;
        loaded.engine.reset()?;
        self.run(loaded, prompt, images)
    }

    fn run(&self, loaded: &mut Loaded, prompt: &str, images: &[DynamicImage]) -> Result<String> {
        if !images.is_empty() && !loaded.model.multimodal {
            return Err(Error::CapabilityUnavailable(format!(
                "image input for {}",
                loaded.model.name
            )));
        }

        let request = GenerateRequest {
            prompt,
            images,
            decode: &loaded.model.decode,
        };

        let mut reply = String::new();
        let mut stopped = false;
        loaded.engine.generate(&request, &mut |chunk| {
            if self.stop_requested.load(Ordering::Acquire) {
                stopped = true;
                return ControlFlow::Break(());
            }
            reply.push_str(chunk);
            ControlFlow::Continue(())
        })?;

        if stopped {
            debug!("generation stopped by reset");
            return Err(Error::Cancelled);
        }
        Ok(reply)
    }
}
