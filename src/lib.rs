//! edge-infer: on-device LLM orchestration
//!
//! Sits between application code and a native inference engine: owns the
//! model lifecycle state machine, drives the autoregressive generation loop
//! on a blocking worker, exposes results as an observable token stream, and
//! decides which compute device each workload runs on under a shared memory
//! budget.
//!
//! ```no_run
//! use edge_infer::{Config, MockLoader, Orchestrator, SamplingParams};
//! use std::sync::Arc;
//!
//! # async fn demo() -> edge_infer::Result<()> {
//! let orchestrator = Orchestrator::new(Config::default(), Arc::new(MockLoader::new()))?;
//! orchestrator.load_model("models/mistral-7b-int8.gguf", 2048).await?;
//!
//! let mut stream = orchestrator
//!     .generate_stream("What is 2+2?", SamplingParams::default())
//!     .await?;
//! while let Some(chunk) = stream.next_chunk().await {
//!     print!("{}", chunk?.text);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod generation;
pub mod lifecycle;
pub mod sampling;
pub mod stream;
pub mod utils;

pub use config::{Config, DeviceConfig, LoggingConfig, ModelConfig};
pub use device::{
    AllocationDecision, DeviceAllocator, DeviceDescriptor, DeviceKind, PlatformProbe, SysfsProbe,
    WorkloadKind,
};
pub use engine::{DeviceParams, EngineLoader, MockEngine, MockLoader, NativeEngine, TokenId};
pub use error::{EngineError, Result};
pub use generation::FinishReason;
pub use lifecycle::{LifecycleManager, ModelMeta, ModelState};
pub use sampling::SamplingParams;
pub use stream::{StreamState, TokenChunk, TokenStream};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Channel depth between the generation worker and a stream consumer.
/// Depth 1 means the worker holds at most the current token: it parks on
/// the full channel until the consumer takes the fragment, so decoding
/// never runs ahead of observation.
const STREAM_CHANNEL_DEPTH: usize = 1;

/// Application-facing entry point tying the lifecycle manager and the
/// device allocator together.
pub struct Orchestrator {
    config: Config,
    lifecycle: Arc<LifecycleManager>,
    allocator: Arc<DeviceAllocator>,
}

impl Orchestrator {
    /// Build an orchestrator with devices detected from the local platform.
    pub fn new(config: Config, loader: Arc<dyn EngineLoader>) -> Result<Self> {
        let allocator = Arc::new(DeviceAllocator::detect(&SysfsProbe, &config.device));
        Self::with_allocator(config, loader, allocator)
    }

    /// Build against a pre-populated device catalog.
    pub fn with_allocator(
        config: Config,
        loader: Arc<dyn EngineLoader>,
        allocator: Arc<DeviceAllocator>,
    ) -> Result<Self> {
        config.validate()?;
        info!("Orchestrator v{} starting", VERSION);
        Ok(Self {
            config,
            lifecycle: Arc::new(LifecycleManager::new(loader)),
            allocator,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn allocator(&self) -> &DeviceAllocator {
        &self.allocator
    }

    /// Load a model and initialize its execution context. Any resident
    /// model is released first; an in-flight generation completes before
    /// the load proceeds.
    pub async fn load_model(&self, path: impl AsRef<Path>, context_size: usize) -> Result<()> {
        let decision = self.allocator.allocate(WorkloadKind::LlmDecode);
        let device = DeviceParams::from(&decision);
        let lifecycle = self.lifecycle.clone();
        let path: PathBuf = path.as_ref().to_path_buf();

        tokio::task::spawn_blocking(move || lifecycle.load(&path, context_size, &device))
            .await
            .map_err(|e| EngineError::load(format!("Load worker failed: {}", e)))?
    }

    /// Load the model named in the configuration.
    pub async fn load_configured_model(&self) -> Result<()> {
        let path = self.config.model.path.clone();
        self.load_model(path, self.config.model.context_size).await
    }

    /// Reset the execution context of the resident model.
    pub async fn init_context(&self, context_size: usize) -> Result<()> {
        let lifecycle = self.lifecycle.clone();
        tokio::task::spawn_blocking(move || lifecycle.init_context(context_size))
            .await
            .map_err(|e| EngineError::context_init(format!("Worker failed: {}", e)))?
    }

    /// Start a generation session and return its token stream.
    ///
    /// Returns an error before any session starts when the parameters are
    /// invalid, no model context is ready, or the prompt does not fit the
    /// tokenizer buffer. After that point failures travel through the
    /// stream.
    pub async fn generate_stream(
        &self,
        prompt: impl Into<String>,
        params: SamplingParams,
    ) -> Result<TokenStream> {
        params.validate()?;
        let prompt: String = prompt.into();
        let max_prompt_tokens = self.config.model.max_prompt_tokens;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_DEPTH);
        let (setup_tx, setup_rx) = oneshot::channel();
        let cancel = Arc::new(AtomicBool::new(false));

        let lifecycle = self.lifecycle.clone();
        let worker_cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            lifecycle.run_generation(
                &prompt,
                &params,
                max_prompt_tokens,
                &tx,
                setup_tx,
                &worker_cancel,
            );
        });

        match setup_rx.await {
            Ok(Ok(())) => Ok(TokenStream::new(rx, cancel)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(EngineError::worker_lost()),
        }
    }

    /// Generate to completion and return the full text.
    pub async fn generate(
        &self,
        prompt: impl Into<String>,
        params: SamplingParams,
    ) -> Result<String> {
        let stream = self.generate_stream(prompt, params).await?;
        stream.collect_text().await
    }

    pub fn state(&self) -> ModelState {
        self.lifecycle.state()
    }

    pub fn is_loaded(&self) -> bool {
        self.lifecycle.is_loaded()
    }

    /// Vocabulary size of the resident model.
    pub fn vocab_size(&self) -> Option<usize> {
        self.lifecycle.meta().map(|m| m.vocab_size)
    }

    /// Context window of the resident model.
    pub fn context_window(&self) -> Option<usize> {
        self.lifecycle.meta().map(|m| m.context_window)
    }

    /// Release the resident model. Idempotent; waits for an in-flight
    /// generation.
    pub async fn release(&self) -> Result<()> {
        let lifecycle = self.lifecycle.clone();
        tokio::task::spawn_blocking(move || lifecycle.release())
            .await
            .map_err(|e| EngineError::generation(format!("Release worker failed: {}", e)))
    }

    /// Detected device catalog.
    pub fn devices(&self) -> &[DeviceDescriptor] {
        self.allocator.devices()
    }

    /// Placement decision for one workload.
    pub fn allocate(&self, workload: WorkloadKind) -> AllocationDecision {
        self.allocator.allocate(workload)
    }

    /// Whether all configured workloads fit the shared memory budget when
    /// resident concurrently.
    pub fn check_concurrent_memory_budget(&self) -> bool {
        self.allocator.check_concurrent_memory_budget()
    }

    /// Gate for enabling concurrent workloads; failure means they must run
    /// serialized.
    pub fn ensure_concurrent_budget(&self) -> Result<()> {
        self.allocator.ensure_concurrent_budget()
    }

    /// Human-readable allocation report.
    pub fn allocation_summary(&self) -> String {
        self.allocator.allocation_summary()
    }
}
