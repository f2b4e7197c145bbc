//! The autoregressive generation loop
//!
//! Drives one generation session over an already-tokenized prompt: one
//! prefill pass, then one decode step per emitted token. The loop is
//! blocking by design (each decode step is a blocking native call) and runs
//! on a dedicated worker under the lifecycle lock.
//!
//! Stop conditions, in the order they are checked: cancellation and the
//! token-count / context-window ceilings before each decode step; EOS
//! (authoritative, cheapest) immediately after sampling; stop strings after
//! the fragment is appended. A fragment is emitted whole or not at all, and
//! nothing is emitted past a fired stop condition.
//!
//! Fragments stream through the channel as they are produced; the terminal
//! verdict is returned to the caller, which forwards it after restoring
//! lifecycle state. A consumer that observes the terminal event can rely on
//! the model being ready for the next call.

use crate::engine::{NativeEngine, TokenId};
use crate::error::EngineError;
use crate::sampling::{SamplingParams, TokenSampler};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Why a generation session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    /// Engine reported the end-of-sequence token
    Eos,
    /// A configured stop string appeared in the output
    StopSequence,
    /// The configured maximum token count was reached
    MaxTokens,
    /// The token sequence would exceed the context window
    ContextOverflow,
    /// The consumer cancelled between token boundaries
    Cancelled,
}

/// Events flowing from the generation loop to the stream handler
#[derive(Debug)]
pub(crate) enum StreamEvent {
    /// One decoded text fragment (exactly one per emitted token)
    Fragment(String),
    /// Session finished normally
    Done(FinishReason),
    /// Session aborted; the execution context remains valid for retry
    Failed(String),
}

/// Ephemeral per-call state. Created after a successful prefill, destroyed
/// when the session completes, errors, or is cancelled.
struct GenerationSession {
    output: String,
    emitted: usize,
    sequence_len: usize,
    current: TokenId,
    started: Instant,
}

/// Earliest occurrence of any stop sequence that involves the newly appended
/// fragment. Returns the byte offset where the stop string starts.
fn find_stop(output: &str, fragment_start: usize, stops: &[String]) -> Option<usize> {
    let max_stop = stops.iter().map(|s| s.len()).max()?;
    if max_stop == 0 {
        return None;
    }
    // A new occurrence must overlap the fragment; back up far enough to
    // catch a stop string straddling the boundary, staying on a char edge.
    let mut from = fragment_start.saturating_sub(max_stop - 1);
    while from > 0 && !output.is_char_boundary(from) {
        from -= 1;
    }
    stops
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| output[from..].find(s.as_str()).map(|i| from + i))
        .min()
}

/// Run one generation session, pushing fragments into `tx` and returning
/// the terminal event. `None` means the receiver went away mid-session and
/// there is nobody left to tell.
pub(crate) fn run_session(
    engine: &mut dyn NativeEngine,
    prompt_tokens: &[TokenId],
    params: &SamplingParams,
    tx: &mpsc::Sender<StreamEvent>,
    cancel: &AtomicBool,
) -> Option<StreamEvent> {
    debug!(
        "Session start: {} prompt tokens, max {} new, temperature {}",
        prompt_tokens.len(),
        params.max_tokens,
        params.temperature
    );

    if let Err(e) = engine.prefill(prompt_tokens) {
        warn!("Prefill failed: {}", e);
        return Some(StreamEvent::Failed(e.to_string()));
    }

    let mut sampler = TokenSampler::new(params);
    let mut session = GenerationSession {
        output: String::new(),
        emitted: 0,
        sequence_len: prompt_tokens.len(),
        current: *prompt_tokens.last().unwrap_or(&0),
        started: Instant::now(),
    };
    let window = engine.context_window();

    let reason = loop {
        if cancel.load(Ordering::Relaxed) {
            break FinishReason::Cancelled;
        }
        if session.emitted >= params.max_tokens {
            break FinishReason::MaxTokens;
        }
        if session.sequence_len + 1 > window {
            break FinishReason::ContextOverflow;
        }

        let mut logits = match engine.decode_step(session.current) {
            Ok(logits) => logits,
            Err(e) => {
                warn!("Decode step failed after {} tokens: {}", session.emitted, e);
                return Some(StreamEvent::Failed(e.to_string()));
            }
        };
        let token = sampler.sample(&mut logits);

        // EOS first: cheapest check and authoritative.
        if engine.is_eos(token) {
            break FinishReason::Eos;
        }

        let fragment = match engine.detokenize(token) {
            Ok(fragment) => fragment,
            Err(e) => return Some(StreamEvent::Failed(e.to_string())),
        };

        let fragment_start = session.output.len();
        session.output.push_str(&fragment);
        if find_stop(&session.output, fragment_start, &params.stop_sequences).is_some() {
            // The fragment completing a stop string is withheld whole;
            // fragments are never split for emission.
            break FinishReason::StopSequence;
        }

        trace!("Token {} -> {:?}", token, fragment);
        if tx.blocking_send(StreamEvent::Fragment(fragment)).is_err() {
            // Receiver dropped: the consumer stopped observing.
            return None;
        }
        session.emitted += 1;
        session.sequence_len += 1;
        session.current = token;
    };

    debug!(
        "Session finished: {:?}, {} tokens in {:?}",
        reason,
        session.emitted,
        session.started.elapsed()
    );
    Some(StreamEvent::Done(reason))
}

impl EngineError {
    /// Failure message used when a generation worker ends without a verdict.
    pub(crate) fn worker_lost() -> Self {
        EngineError::generation("Generation worker ended unexpectedly")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DeviceParams, MockEngine};

    fn device() -> DeviceParams {
        DeviceParams {
            cpu_cores: vec![4, 5],
            use_fused_kernels: false,
            use_preallocated_buffers: true,
        }
    }

    /// Drive a session synchronously and collect fragments plus the verdict.
    fn run(
        engine: &mut MockEngine,
        prompt: &str,
        params: &SamplingParams,
    ) -> (String, Option<StreamEvent>) {
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = AtomicBool::new(false);
        let tokens = engine.tokenize(prompt, 1024).unwrap();
        let terminal = run_session(engine, &tokens, params, &tx, &cancel);
        drop(tx);

        let mut text = String::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                StreamEvent::Fragment(fragment) => text.push_str(&fragment),
                other => panic!("unexpected mid-stream event {:?}", other),
            }
        }
        (text, terminal)
    }

    fn finish(terminal: &Option<StreamEvent>) -> Option<FinishReason> {
        match terminal {
            Some(StreamEvent::Done(reason)) => Some(*reason),
            _ => None,
        }
    }

    #[test]
    fn test_greedy_runs_to_eos() {
        let mut engine = MockEngine::new(128, device());
        let (text, terminal) = run(&mut engine, "2+2=", &SamplingParams::greedy());
        assert_eq!(text, "The answer is 4.");
        assert_eq!(finish(&terminal), Some(FinishReason::Eos));
    }

    #[test]
    fn test_max_tokens_ceiling() {
        let mut engine = MockEngine::new(128, device());
        let params = SamplingParams {
            max_tokens: 2,
            ..SamplingParams::greedy()
        };
        let (text, terminal) = run(&mut engine, "2+2=", &params);
        assert_eq!(text, "The answer");
        assert_eq!(finish(&terminal), Some(FinishReason::MaxTokens));
    }

    #[test]
    fn test_stop_string_withholds_completing_fragment() {
        let mut engine = MockEngine::new(128, device());
        let params = SamplingParams {
            stop_sequences: vec!["is".to_string()],
            ..SamplingParams::greedy()
        };
        // " is" completes the stop string, so that fragment and everything
        // after it never reach the consumer.
        let (text, terminal) = run(&mut engine, "2+2=", &params);
        assert_eq!(text, "The answer");
        assert_eq!(finish(&terminal), Some(FinishReason::StopSequence));
    }

    #[test]
    fn test_stop_string_across_fragments() {
        let mut engine = MockEngine::with_script(vec!["ab", "cd", "ef"], 128, device());
        let params = SamplingParams {
            stop_sequences: vec!["bcd".to_string()],
            ..SamplingParams::greedy()
        };
        // "bcd" straddles the second fragment. "ab" was already emitted and
        // stands; "cd" is withheld.
        let (text, terminal) = run(&mut engine, "x", &params);
        assert_eq!(text, "ab");
        assert_eq!(finish(&terminal), Some(FinishReason::StopSequence));
    }

    #[test]
    fn test_context_window_is_terminal_not_error() {
        // Window of 3: the prompt occupies 1 slot, so after two decode steps
        // the next token would not fit.
        let mut engine = MockEngine::with_script(vec!["a", "b", "c", "d", "e"], 3, device());
        let (text, terminal) = run(&mut engine, "x", &SamplingParams::greedy());
        assert_eq!(text, "ab");
        assert_eq!(finish(&terminal), Some(FinishReason::ContextOverflow));
    }

    #[test]
    fn test_decode_failure_returns_failed_verdict() {
        let mut engine = MockEngine::new(128, device()).fail_decode_after(2);
        let (text, terminal) = run(&mut engine, "2+2=", &SamplingParams::greedy());
        assert_eq!(text, "The answer");
        assert!(matches!(terminal, Some(StreamEvent::Failed(_))));
    }

    #[test]
    fn test_cancellation_before_first_token() {
        let mut engine = MockEngine::new(128, device());
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = AtomicBool::new(true);
        let tokens = engine.tokenize("2+2=", 1024).unwrap();
        let terminal = run_session(
            &mut engine,
            &tokens,
            &SamplingParams::greedy(),
            &tx,
            &cancel,
        );
        drop(tx);

        assert_eq!(finish(&terminal), Some(FinishReason::Cancelled));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_receiver_ends_session_quietly() {
        let mut engine = MockEngine::new(128, device());
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let cancel = AtomicBool::new(false);
        let tokens = engine.tokenize("2+2=", 1024).unwrap();
        let terminal = run_session(
            &mut engine,
            &tokens,
            &SamplingParams::greedy(),
            &tx,
            &cancel,
        );
        assert!(terminal.is_none());
    }

    #[test]
    fn test_find_stop_earliest_match() {
        let stops = vec!["xy".to_string(), "cd".to_string()];
        let output = "abcdxy";
        // Fragment is the whole string; the earliest stop wins.
        assert_eq!(find_stop(output, 0, &stops), Some(2));
        // Only matches overlapping the straddle window count.
        assert_eq!(find_stop(output, 4, &stops), Some(4));
    }
}
