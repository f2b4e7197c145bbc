//! Observable token stream
//!
//! Wraps the generation loop's event channel into a single-consumer stream
//! with explicit states and a live throughput figure. Dropping the stream
//! cancels the underlying session at the next token boundary.

use crate::error::{EngineError, Result};
use crate::generation::{FinishReason, StreamEvent};
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::debug;

/// Observable state of one stream instance.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamState {
    /// No fragment observed yet
    Idle,
    /// At least one fragment observed, session still running
    Streaming { partial_text: String, token_count: usize },
    /// Session finished; carries the full text as observed by this consumer
    Complete {
        full_text: String,
        token_count: usize,
        duration_ms: u64,
    },
    /// Session aborted
    Error { message: String },
}

/// One emitted fragment plus the stream-level counters at emission time.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenChunk {
    pub text: String,
    /// Zero-based index of this token within the session
    pub token_index: usize,
    /// Live throughput, `token_count * 1000 / elapsed_ms`
    pub tokens_per_second: f64,
}

/// Single-consumer handle over one generation session.
///
/// Non-restartable: once `Complete` or `Error` is reached the stream only
/// yields `None`.
pub struct TokenStream {
    rx: mpsc::Receiver<StreamEvent>,
    cancel: Arc<AtomicBool>,
    state: StreamState,
    started: Instant,
    text: String,
    token_count: usize,
    finish: Option<FinishReason>,
    terminated: bool,
}

impl TokenStream {
    pub(crate) fn new(rx: mpsc::Receiver<StreamEvent>, cancel: Arc<AtomicBool>) -> Self {
        Self {
            rx,
            cancel,
            state: StreamState::Idle,
            started: Instant::now(),
            text: String::new(),
            token_count: 0,
            finish: None,
            terminated: false,
        }
    }

    /// Request cancellation. The session stops at the next token boundary
    /// and the stream completes with [`FinishReason::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    /// Set once the stream has completed normally.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish
    }

    /// Throughput over the stream so far.
    pub fn tokens_per_second(&self) -> f64 {
        throughput(self.token_count, self.started.elapsed().as_millis() as u64)
    }

    /// Next fragment, or `None` once the session is over.
    pub async fn next_chunk(&mut self) -> Option<Result<TokenChunk>> {
        futures::StreamExt::next(self).await
    }

    /// Drain the stream and return the full text, or the first error.
    pub async fn collect_text(mut self) -> Result<String> {
        while let Some(chunk) = self.next_chunk().await {
            chunk?;
        }
        match std::mem::replace(&mut self.state, StreamState::Idle) {
            StreamState::Complete { full_text, .. } => Ok(full_text),
            StreamState::Error { message } => Err(EngineError::generation(message)),
            // Unreachable after drain, but the type does not know that.
            _ => Err(EngineError::worker_lost()),
        }
    }

    fn absorb(&mut self, event: StreamEvent) -> Option<Result<TokenChunk>> {
        match event {
            StreamEvent::Fragment(fragment) => {
                self.text.push_str(&fragment);
                self.token_count += 1;
                self.state = StreamState::Streaming {
                    partial_text: self.text.clone(),
                    token_count: self.token_count,
                };
                Some(Ok(TokenChunk {
                    text: fragment,
                    token_index: self.token_count - 1,
                    tokens_per_second: self.tokens_per_second(),
                }))
            }
            StreamEvent::Done(reason) => {
                let duration_ms = self.started.elapsed().as_millis() as u64;
                debug!(
                    "Stream complete: {:?}, {} tokens, {} ms",
                    reason, self.token_count, duration_ms
                );
                self.finish = Some(reason);
                self.terminated = true;
                self.state = StreamState::Complete {
                    full_text: std::mem::take(&mut self.text),
                    token_count: self.token_count,
                    duration_ms,
                };
                None
            }
            StreamEvent::Failed(message) => {
                self.terminated = true;
                self.state = StreamState::Error {
                    message: message.clone(),
                };
                Some(Err(EngineError::generation(message)))
            }
        }
    }
}

impl std::fmt::Debug for TokenStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStream")
            .field("state", &self.state)
            .field("token_count", &self.token_count)
            .field("finish", &self.finish)
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}

impl Stream for TokenStream {
    type Item = Result<TokenChunk>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.terminated {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => match this.absorb(event) {
                Some(item) => Poll::Ready(Some(item)),
                // Done event: terminal state recorded, stream ends.
                None => Poll::Ready(None),
            },
            Poll::Ready(None) => {
                // Producer vanished without a verdict.
                this.terminated = true;
                this.state = StreamState::Error {
                    message: EngineError::worker_lost().to_string(),
                };
                Poll::Ready(Some(Err(EngineError::worker_lost())))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TokenStream {
    fn drop(&mut self) {
        // A consumer that stops observing cancels the session.
        self.cancel.store(true, Ordering::Relaxed);
    }
}

fn throughput(token_count: usize, elapsed_ms: u64) -> f64 {
    token_count as f64 * 1000.0 / elapsed_ms.max(1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_with_events(events: Vec<StreamEvent>) -> TokenStream {
        let (tx, rx) = mpsc::channel(64);
        for event in events {
            tx.try_send(event).unwrap();
        }
        // Sender dropped here; the buffered events stay readable.
        TokenStream::new(rx, Arc::new(AtomicBool::new(false)))
    }

    #[tokio::test]
    async fn test_states_progress_idle_streaming_complete() {
        let mut stream = stream_with_events(vec![
            StreamEvent::Fragment("Hello".to_string()),
            StreamEvent::Fragment(" world".to_string()),
            StreamEvent::Done(FinishReason::Eos),
        ]);
        assert_eq!(*stream.state(), StreamState::Idle);

        let first = stream.next_chunk().await.unwrap().unwrap();
        assert_eq!(first.text, "Hello");
        assert_eq!(first.token_index, 0);
        assert!(first.tokens_per_second > 0.0);
        assert!(matches!(
            stream.state(),
            StreamState::Streaming { token_count: 1, .. }
        ));

        let second = stream.next_chunk().await.unwrap().unwrap();
        assert_eq!(second.token_index, 1);

        assert!(stream.next_chunk().await.is_none());
        match stream.state() {
            StreamState::Complete {
                full_text,
                token_count,
                ..
            } => {
                assert_eq!(full_text, "Hello world");
                assert_eq!(*token_count, 2);
            }
            other => panic!("unexpected state {:?}", other),
        }
        assert_eq!(stream.finish_reason(), Some(FinishReason::Eos));
    }

    #[tokio::test]
    async fn test_error_event_surfaces_once() {
        let mut stream = stream_with_events(vec![
            StreamEvent::Fragment("partial".to_string()),
            StreamEvent::Failed("native decode failed".to_string()),
        ]);

        assert!(stream.next_chunk().await.unwrap().is_ok());
        let err = stream.next_chunk().await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::GenerationFailure { .. }));
        assert!(matches!(stream.state(), StreamState::Error { .. }));
        assert!(stream.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn test_collect_text() {
        let stream = stream_with_events(vec![
            StreamEvent::Fragment("a".to_string()),
            StreamEvent::Fragment("b".to_string()),
            StreamEvent::Done(FinishReason::MaxTokens),
        ]);
        assert_eq!(stream.collect_text().await.unwrap(), "ab");
    }

    #[tokio::test]
    async fn test_collect_text_propagates_failure() {
        let stream = stream_with_events(vec![
            StreamEvent::Fragment("a".to_string()),
            StreamEvent::Failed("boom".to_string()),
        ]);
        assert!(stream.collect_text().await.is_err());
    }

    #[tokio::test]
    async fn test_closed_channel_without_verdict_is_error() {
        let mut stream = stream_with_events(vec![StreamEvent::Fragment("a".to_string())]);
        assert!(stream.next_chunk().await.unwrap().is_ok());
        assert!(stream.next_chunk().await.unwrap().is_err());
        assert!(stream.next_chunk().await.is_none());
    }

    #[test]
    fn test_stream_is_debuggable() {
        // `Result<TokenStream>` must support unwrap_err in callers.
        let stream = stream_with_events(vec![]);
        let rendered = format!("{:?}", stream);
        assert!(rendered.contains("TokenStream"));
        assert!(rendered.contains("Idle"));
    }

    #[test]
    fn test_drop_sets_cancel_flag() {
        let (_tx, rx) = mpsc::channel(1);
        let cancel = Arc::new(AtomicBool::new(false));
        let stream = TokenStream::new(rx, cancel.clone());
        drop(stream);
        assert!(cancel.load(Ordering::Relaxed));
    }

    #[test]
    fn test_throughput_formula() {
        assert_eq!(throughput(10, 500), 20.0);
        assert_eq!(throughput(3, 1000), 3.0);
        // Sub-millisecond elapsed clamps to one millisecond.
        assert_eq!(throughput(5, 0), 5000.0);
    }
}
