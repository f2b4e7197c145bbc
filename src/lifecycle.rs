//! Model lifecycle state machine
//!
//! Owns the loaded engine and serializes every operation that touches it.
//! One mutex spans load, context initialization, release, and a full
//! generation session, so none of them can interleave destructively; state
//! snapshots are mirrored into an atomic for lock-free observation.

use crate::engine::{DeviceParams, EngineLoader, NativeEngine, check_model_file};
use crate::error::{EngineError, Result};
use crate::generation::{self, StreamEvent};
use crate::sampling::SamplingParams;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Observable lifecycle states.
///
/// `Released` is transient: a release settles back in `Unloaded`, from which
/// a fresh load may begin. Loading a new model while one is resident
/// releases the old one implicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelState {
    Unloaded,
    Loading,
    Loaded,
    ContextReady,
    Generating,
    Released,
}

impl ModelState {
    fn as_u8(self) -> u8 {
        match self {
            ModelState::Unloaded => 0,
            ModelState::Loading => 1,
            ModelState::Loaded => 2,
            ModelState::ContextReady => 3,
            ModelState::Generating => 4,
            ModelState::Released => 5,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ModelState::Loading,
            2 => ModelState::Loaded,
            3 => ModelState::ContextReady,
            4 => ModelState::Generating,
            5 => ModelState::Released,
            _ => ModelState::Unloaded,
        }
    }
}

impl std::fmt::Display for ModelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelState::Unloaded => "unloaded",
            ModelState::Loading => "loading",
            ModelState::Loaded => "loaded",
            ModelState::ContextReady => "context_ready",
            ModelState::Generating => "generating",
            ModelState::Released => "released",
        };
        write!(f, "{}", name)
    }
}

/// Metadata captured at load time so accessors never contend with an
/// in-flight generation for the engine lock.
#[derive(Debug, Clone)]
pub struct ModelMeta {
    pub path: PathBuf,
    pub vocab_size: usize,
    pub context_window: usize,
    pub last_prefill_ms: u64,
    pub last_decode_ms: u64,
}

struct Slot {
    engine: Option<Box<dyn NativeEngine>>,
    state: ModelState,
}

impl Slot {
    fn set_state(&mut self, state: ModelState, mirror: &AtomicU8) {
        self.state = state;
        mirror.store(state.as_u8(), Ordering::Release);
    }
}

/// Serialized owner of the native engine.
pub struct LifecycleManager {
    loader: Arc<dyn EngineLoader>,
    slot: Mutex<Slot>,
    state_mirror: AtomicU8,
    meta: Mutex<Option<ModelMeta>>,
}

impl LifecycleManager {
    pub fn new(loader: Arc<dyn EngineLoader>) -> Self {
        Self {
            loader,
            slot: Mutex::new(Slot {
                engine: None,
                state: ModelState::Unloaded,
            }),
            state_mirror: AtomicU8::new(ModelState::Unloaded.as_u8()),
            meta: Mutex::new(None),
        }
    }

    /// Current state without taking the engine lock.
    pub fn state(&self) -> ModelState {
        ModelState::from_u8(self.state_mirror.load(Ordering::Acquire))
    }

    /// A model counts as loaded from `Loaded` onward.
    pub fn is_loaded(&self) -> bool {
        matches!(
            self.state(),
            ModelState::Loaded | ModelState::ContextReady | ModelState::Generating
        )
    }

    /// Metadata of the resident model, if any.
    pub fn meta(&self) -> Option<ModelMeta> {
        self.meta.lock().clone()
    }

    /// Load a model from `path` and initialize its execution context.
    ///
    /// Blocks until any in-flight generation finishes. A model already
    /// resident is released first; on failure the manager lands back in
    /// `Unloaded` with nothing resident.
    pub fn load(&self, path: &Path, context_size: usize, device: &DeviceParams) -> Result<()> {
        let started = Instant::now();
        let mut slot = self.slot.lock();

        if slot.engine.take().is_some() {
            debug!("Releasing resident model before load");
            slot.set_state(ModelState::Released, &self.state_mirror);
            *self.meta.lock() = None;
        }
        slot.set_state(ModelState::Loading, &self.state_mirror);

        let outcome = check_model_file(path)
            .and_then(|_| self.loader.load(path, context_size, device));
        let mut engine = match outcome {
            Ok(engine) => engine,
            Err(e) => {
                slot.set_state(ModelState::Unloaded, &self.state_mirror);
                warn!("Model load failed for {}: {}", path.display(), e);
                return Err(e);
            }
        };
        slot.set_state(ModelState::Loaded, &self.state_mirror);
        info!(
            "Model loaded from {} in {:?} on cores {:?}",
            path.display(),
            started.elapsed(),
            device.cpu_cores
        );

        if let Err(e) = engine.init_context(context_size) {
            // Weights without a usable context are worthless; drop them.
            slot.set_state(ModelState::Unloaded, &self.state_mirror);
            warn!("Context initialization failed: {}", e);
            return Err(e);
        }

        *self.meta.lock() = Some(ModelMeta {
            path: path.to_path_buf(),
            vocab_size: engine.vocab_size(),
            context_window: engine.context_window(),
            last_prefill_ms: 0,
            last_decode_ms: 0,
        });
        slot.engine = Some(engine);
        slot.set_state(ModelState::ContextReady, &self.state_mirror);
        Ok(())
    }

    /// Re-initialize the execution context of the resident model, discarding
    /// any previous KV state.
    pub fn init_context(&self, context_size: usize) -> Result<()> {
        let mut slot = self.slot.lock();
        let engine = slot.engine.as_mut().ok_or_else(|| {
            EngineError::context_init("No model loaded")
        })?;
        engine.init_context(context_size)?;
        let window = engine.context_window();
        if let Some(meta) = self.meta.lock().as_mut() {
            meta.context_window = window;
        }
        slot.set_state(ModelState::ContextReady, &self.state_mirror);
        Ok(())
    }

    /// Release the resident model. Safe to call in any state, any number of
    /// times; waits for an in-flight generation before tearing down.
    pub fn release(&self) {
        let mut slot = self.slot.lock();
        if slot.engine.take().is_some() {
            slot.set_state(ModelState::Released, &self.state_mirror);
            info!("Model released");
        }
        *self.meta.lock() = None;
        slot.set_state(ModelState::Unloaded, &self.state_mirror);
    }

    /// Run one generation session, holding the engine for its whole
    /// duration. Blocking; the facade runs this on a worker thread.
    pub(crate) fn run_generation(
        &self,
        prompt: &str,
        params: &SamplingParams,
        max_prompt_tokens: usize,
        tx: &mpsc::Sender<StreamEvent>,
        setup: oneshot::Sender<Result<()>>,
        cancel: &AtomicBool,
    ) {
        let mut slot = self.slot.lock();
        let mut engine = match slot.engine.take() {
            Some(engine) if slot.state == ModelState::ContextReady => engine,
            resident => {
                let state = slot.state;
                slot.engine = resident;
                let _ = setup.send(Err(EngineError::invalid_request(format!(
                    "Cannot generate in state {}",
                    state
                ))));
                return;
            }
        };

        slot.set_state(ModelState::Generating, &self.state_mirror);

        // Tokenization failures are reported synchronously, before any
        // session state exists.
        let prompt_tokens = match engine.tokenize(prompt, max_prompt_tokens) {
            Ok(tokens) => tokens,
            Err(e) => {
                slot.engine = Some(engine);
                slot.set_state(ModelState::ContextReady, &self.state_mirror);
                drop(slot);
                let _ = setup.send(Err(e));
                return;
            }
        };
        let _ = setup.send(Ok(()));

        let terminal = generation::run_session(engine.as_mut(), &prompt_tokens, params, tx, cancel);

        if let Some(meta) = self.meta.lock().as_mut() {
            meta.last_prefill_ms = engine.last_prefill_ms();
            meta.last_decode_ms = engine.last_decode_ms();
        }
        // The context stays valid after any outcome, including failures.
        // State is restored before the terminal event goes out, so a
        // consumer that saw the verdict can immediately issue the next call.
        slot.engine = Some(engine);
        slot.set_state(ModelState::ContextReady, &self.state_mirror);
        drop(slot);
        if let Some(event) = terminal {
            let _ = tx.blocking_send(event);
        }
    }
}
