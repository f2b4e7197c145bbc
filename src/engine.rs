//! The native inference boundary
//!
//! The transformer engine itself (weights, kernels, tokenizer internals) is
//! an external black box. This module pins down the narrow call contract the
//! orchestrator depends on: tokenize, one prefill pass, one blocking decode
//! step per token, detokenize, and an end-of-sequence predicate. Every call
//! may fail and every failure is reported, never propagated as a panic.

use crate::device::AllocationDecision;
use crate::error::{EngineError, Result};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::time::Instant;

/// Integer token identifier, matching the native engine's vocabulary
pub type TokenId = u32;

/// Core affinity and buffer options handed to the engine at load time.
///
/// Produced once per model load from the allocator's decision for the LLM
/// workload; the engine is free to ignore options it does not support.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceParams {
    /// CPU core indices the engine's thread pool should pin to
    pub cpu_cores: Vec<usize>,
    /// Request fused-kernel execution where the backend offers it
    pub use_fused_kernels: bool,
    /// Request preallocated scratch buffers instead of per-call allocation
    pub use_preallocated_buffers: bool,
}

impl From<&AllocationDecision> for DeviceParams {
    fn from(decision: &AllocationDecision) -> Self {
        Self {
            cpu_cores: decision.cpu_cores.clone(),
            use_fused_kernels: decision.use_fused_kernels,
            use_preallocated_buffers: decision.use_preallocated_buffers,
        }
    }
}

/// Blocking call contract of a loaded native model.
///
/// All methods are synchronous; the caller is responsible for keeping them
/// off latency-sensitive threads. One decode step produces the logits for
/// exactly one new position.
pub trait NativeEngine: Send {
    /// Create (or replace) the execution context with the given window size.
    fn init_context(&mut self, context_size: usize) -> Result<()>;

    /// Tokenize `text` into at most `max_tokens` tokens. Exceeding the
    /// buffer capacity is a reported error, not a truncation.
    fn tokenize(&self, text: &str, max_tokens: usize) -> Result<Vec<TokenId>>;

    /// Run the forward pass over the full prompt, populating the KV cache.
    fn prefill(&mut self, tokens: &[TokenId]) -> Result<()>;

    /// One incremental forward pass: feed the previous token, return the
    /// logits for the next position.
    fn decode_step(&mut self, token: TokenId) -> Result<Vec<f32>>;

    /// Decode a single token to its text fragment.
    fn detokenize(&self, token: TokenId) -> Result<String>;

    /// End-of-sequence predicate.
    fn is_eos(&self, token: TokenId) -> bool;

    /// Vocabulary size of the loaded model.
    fn vocab_size(&self) -> usize;

    /// Context window the current execution context was created with.
    fn context_window(&self) -> usize;

    /// Duration of the most recent prefill pass, for diagnostics.
    fn last_prefill_ms(&self) -> u64 {
        0
    }

    /// Duration of the most recent decode step, for diagnostics.
    fn last_decode_ms(&self) -> u64 {
        0
    }
}

/// Produces engines from verified model artifacts.
///
/// The loader performs no checksum verification of its own; the path it
/// receives is already verified by the download layer. An absent, unreadable,
/// or format-rejected file is a load failure.
pub trait EngineLoader: Send + Sync {
    fn load(
        &self,
        path: &Path,
        context_size: usize,
        device: &DeviceParams,
    ) -> Result<Box<dyn NativeEngine>>;
}

/// Verify the model artifact exists and is readable before handing it to a
/// native loader.
pub fn check_model_file(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(EngineError::load(format!(
            "Model file does not exist: {}",
            path.display()
        )));
    }
    if !path.is_file() {
        return Err(EngineError::load(format!(
            "Model path is not a file: {}",
            path.display()
        )));
    }
    std::fs::File::open(path).map_err(|e| {
        EngineError::load(format!("Cannot read model file {}: {}", path.display(), e))
    })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Deterministic mock engine
// ---------------------------------------------------------------------------

/// End-of-sequence token id used by the mock vocabulary.
pub const MOCK_EOS: TokenId = 2;

const MOCK_VOCAB_SIZE: usize = 32000;
/// Script tokens occupy ids starting here; prompt tokens hash above 4096.
const SCRIPT_BASE: TokenId = 16;
const PROMPT_HASH_BASE: u64 = 4096;

/// Deterministic in-process engine used by the test suite.
///
/// It "continues" every prompt with a fixed script of text fragments: the
/// logits returned by [`NativeEngine::decode_step`] always rank the next
/// scripted token highest, followed by EOS once the script is exhausted.
/// Greedy decoding therefore reproduces the script exactly, and seeded
/// nucleus sampling is reproducible because the logit table is a pure
/// function of the decode position.
pub struct MockEngine {
    script: Vec<String>,
    position: usize,
    context_size: usize,
    device: DeviceParams,
    fail_decode_after: Option<usize>,
    decode_calls: usize,
    last_prefill_ms: u64,
    last_decode_ms: u64,
}

impl MockEngine {
    /// Default continuation script: `"The answer is 4."`
    pub fn new(context_size: usize, device: DeviceParams) -> Self {
        Self::with_script(
            vec!["The", " answer", " is", " 4", "."],
            context_size,
            device,
        )
    }

    /// Build a mock that emits the given fragments, then EOS.
    pub fn with_script(
        script: Vec<impl Into<String>>,
        context_size: usize,
        device: DeviceParams,
    ) -> Self {
        Self {
            script: script.into_iter().map(Into::into).collect(),
            position: 0,
            context_size,
            device,
            fail_decode_after: None,
            decode_calls: 0,
            last_prefill_ms: 0,
            last_decode_ms: 0,
        }
    }

    /// Make `decode_step` fail once `calls` steps have succeeded.
    pub fn fail_decode_after(mut self, calls: usize) -> Self {
        self.fail_decode_after = Some(calls);
        self
    }

    /// Device parameters this engine was loaded with.
    pub fn device_params(&self) -> &DeviceParams {
        &self.device
    }

    fn script_token(&self, index: usize) -> TokenId {
        SCRIPT_BASE + index as TokenId
    }

    fn hash_word(word: &str) -> TokenId {
        let mut hasher = DefaultHasher::new();
        word.hash(&mut hasher);
        let span = MOCK_VOCAB_SIZE as u64 - PROMPT_HASH_BASE;
        (PROMPT_HASH_BASE + hasher.finish() % span) as TokenId
    }
}

impl NativeEngine for MockEngine {
    fn init_context(&mut self, context_size: usize) -> Result<()> {
        if context_size == 0 {
            return Err(EngineError::context_init("Context size must be non-zero"));
        }
        // Mirrors a real engine running out of KV-cache memory for oversized
        // windows.
        if context_size > 32768 {
            return Err(EngineError::context_init(format!(
                "Cannot allocate a {} token context",
                context_size
            )));
        }
        self.context_size = context_size;
        self.position = 0;
        self.decode_calls = 0;
        Ok(())
    }

    fn tokenize(&self, text: &str, max_tokens: usize) -> Result<Vec<TokenId>> {
        let words: Vec<&str> = text.split_whitespace().collect();
        let count = words.len().max(1);
        if count > max_tokens {
            return Err(EngineError::tokenization(format!(
                "Prompt tokenizes to {} tokens, buffer capacity is {}",
                count, max_tokens
            )));
        }
        if words.is_empty() {
            // Even an empty prompt occupies one BOS position.
            return Ok(vec![1]);
        }
        Ok(words.iter().map(|w| Self::hash_word(w)).collect())
    }

    fn prefill(&mut self, tokens: &[TokenId]) -> Result<()> {
        let start = Instant::now();
        if tokens.is_empty() {
            return Err(EngineError::generation("Prefill over an empty sequence"));
        }
        if tokens.len() > self.context_size {
            return Err(EngineError::generation(format!(
                "Prompt of {} tokens exceeds context window of {}",
                tokens.len(),
                self.context_size
            )));
        }
        self.position = 0;
        self.decode_calls = 0;
        self.last_prefill_ms = start.elapsed().as_millis() as u64;
        Ok(())
    }

    fn decode_step(&mut self, _token: TokenId) -> Result<Vec<f32>> {
        let start = Instant::now();
        if let Some(limit) = self.fail_decode_after {
            if self.decode_calls >= limit {
                return Err(EngineError::generation(
                    "Native decode step failed (injected)",
                ));
            }
        }
        self.decode_calls += 1;

        let preferred = if self.position < self.script.len() {
            self.script_token(self.position)
        } else {
            MOCK_EOS
        };
        self.position += 1;

        // Pure function of position: a flat low-probability floor with the
        // scripted token on top and EOS as runner-up.
        let mut logits = vec![0.0f32; MOCK_VOCAB_SIZE];
        for (i, logit) in logits.iter_mut().enumerate() {
            *logit = -4.0 + ((i * 7) % 13) as f32 * 0.05;
        }
        logits[MOCK_EOS as usize] = 6.0;
        logits[preferred as usize] = 10.0;
        self.last_decode_ms = start.elapsed().as_millis() as u64;
        Ok(logits)
    }

    fn detokenize(&self, token: TokenId) -> Result<String> {
        if token == MOCK_EOS {
            return Ok(String::new());
        }
        let index = token.checked_sub(SCRIPT_BASE).map(|i| i as usize);
        match index.and_then(|i| self.script.get(i)) {
            Some(fragment) => Ok(fragment.clone()),
            None => Ok(format!(" <tok:{}>", token)),
        }
    }

    fn is_eos(&self, token: TokenId) -> bool {
        token == MOCK_EOS
    }

    fn vocab_size(&self) -> usize {
        MOCK_VOCAB_SIZE
    }

    fn context_window(&self) -> usize {
        self.context_size
    }

    fn last_prefill_ms(&self) -> u64 {
        self.last_prefill_ms
    }

    fn last_decode_ms(&self) -> u64 {
        self.last_decode_ms
    }
}

/// Loader for [`MockEngine`]. Rejects absent or unreadable paths and any
/// file that is not a `.gguf` artifact, mimicking a format check.
pub struct MockLoader {
    script: Vec<String>,
    fail_decode_after: Option<usize>,
}

impl MockLoader {
    pub fn new() -> Self {
        Self {
            script: vec![
                "The".to_string(),
                " answer".to_string(),
                " is".to_string(),
                " 4".to_string(),
                ".".to_string(),
            ],
            fail_decode_after: None,
        }
    }

    /// Loader whose engines emit the given fragments, then EOS.
    pub fn with_script(script: Vec<impl Into<String>>) -> Self {
        Self {
            script: script.into_iter().map(Into::into).collect(),
            fail_decode_after: None,
        }
    }

    /// Loader whose engines fail decoding after `calls` successful steps.
    pub fn failing_after(mut self, calls: usize) -> Self {
        self.fail_decode_after = Some(calls);
        self
    }
}

impl Default for MockLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineLoader for MockLoader {
    fn load(
        &self,
        path: &Path,
        context_size: usize,
        device: &DeviceParams,
    ) -> Result<Box<dyn NativeEngine>> {
        check_model_file(path)?;
        if path.extension().and_then(|e| e.to_str()) != Some("gguf") {
            return Err(EngineError::load(format!(
                "Engine rejected model format: {}",
                path.display()
            )));
        }
        let mut engine = MockEngine::with_script(self.script.clone(), context_size, device.clone());
        if let Some(limit) = self.fail_decode_after {
            engine = engine.fail_decode_after(limit);
        }
        Ok(Box::new(engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> DeviceParams {
        DeviceParams {
            cpu_cores: vec![4, 5, 6, 7],
            use_fused_kernels: false,
            use_preallocated_buffers: true,
        }
    }

    #[test]
    fn test_tokenize_respects_buffer_capacity() {
        let engine = MockEngine::new(128, params());
        let tokens = engine.tokenize("2+2=", 16).unwrap();
        assert_eq!(tokens.len(), 1);

        let long_prompt = "word ".repeat(32);
        let err = engine.tokenize(&long_prompt, 16).unwrap_err();
        assert!(matches!(
            err,
            EngineError::TokenizationFailure { .. }
        ));
    }

    #[test]
    fn test_tokenize_is_deterministic() {
        let engine = MockEngine::new(128, params());
        let a = engine.tokenize("the quick brown fox", 64).unwrap();
        let b = engine.tokenize("the quick brown fox", 64).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 4);
    }

    #[test]
    fn test_greedy_script_playback() {
        let mut engine = MockEngine::new(128, params());
        let prompt = engine.tokenize("2+2=", 16).unwrap();
        engine.prefill(&prompt).unwrap();

        let mut text = String::new();
        let mut current = *prompt.last().unwrap();
        loop {
            let logits = engine.decode_step(current).unwrap();
            let token = logits
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
                .map(|(i, _)| i as TokenId)
                .unwrap();
            if engine.is_eos(token) {
                break;
            }
            text.push_str(&engine.detokenize(token).unwrap());
            current = token;
        }
        assert_eq!(text, "The answer is 4.");
    }

    #[test]
    fn test_prefill_rejects_overlong_prompt() {
        let mut engine = MockEngine::new(2, params());
        let err = engine.prefill(&[10, 11, 12]).unwrap_err();
        assert!(matches!(err, EngineError::GenerationFailure { .. }));
    }

    #[test]
    fn test_context_init_bounds() {
        let mut engine = MockEngine::new(128, params());
        assert!(engine.init_context(0).is_err());
        assert!(engine.init_context(65536).is_err());
        assert!(engine.init_context(4096).is_ok());
        assert_eq!(engine.context_window(), 4096);
    }

    #[test]
    fn test_injected_decode_failure() {
        let mut engine = MockEngine::new(128, params()).fail_decode_after(2);
        engine.prefill(&[100]).unwrap();
        assert!(engine.decode_step(100).is_ok());
        assert!(engine.decode_step(100).is_ok());
        assert!(engine.decode_step(100).is_err());
    }

    #[test]
    fn test_loader_rejects_missing_and_bad_format() {
        let loader = MockLoader::new();
        let missing = loader.load(Path::new("/nonexistent/model.gguf"), 128, &params());
        assert!(matches!(missing, Err(EngineError::LoadFailure { .. })));

        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("weights.bin");
        std::fs::write(&bad, b"not a model").unwrap();
        let rejected = loader.load(&bad, 128, &params());
        assert!(matches!(rejected, Err(EngineError::LoadFailure { .. })));

        let good = dir.path().join("weights.gguf");
        std::fs::write(&good, b"mock gguf").unwrap();
        assert!(loader.load(&good, 128, &params()).is_ok());
    }
}
