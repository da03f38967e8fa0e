use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use progress_core::model::CompletionEvent;

/// Failure reported by an achievement collaborator.
#[derive(Debug, Error)]
#[error("achievement sink rejected event: {0}")]
pub struct PublishError(pub String);

/// The external achievement/XP collaborator.
///
/// Consumes completion facts; owns its own rules. Delivery is advisory.
#[async_trait]
pub trait AchievementSink: Send + Sync {
    /// Publish one completion fact.
    ///
    /// # Errors
    ///
    /// Returns `PublishError` when the collaborator rejects the event;
    /// the emitter logs and drops it.
    async fn publish(&self, event: CompletionEvent) -> Result<(), PublishError>;
}

/// Fire-and-forget emitter for completion facts.
///
/// Events go through a bounded channel drained by a background task, so
/// a slow or failing collaborator can add neither latency nor failure
/// modes to the progress write path. A full channel drops the event
/// with a warning; progress writes never wait.
#[derive(Clone)]
pub struct CompletionEventEmitter {
    tx: mpsc::Sender<CompletionEvent>,
}

impl CompletionEventEmitter {
    /// Start the forwarding task over the given sink.
    ///
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn spawn(sink: Arc<dyn AchievementSink>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<CompletionEvent>(capacity);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = sink.publish(event).await {
                    tracing::warn!(error = %e, "completion event publish failed, dropping");
                }
            }
        });
        Self { tx }
    }

    /// Enqueue a completion fact without waiting.
    pub fn emit(&self, event: CompletionEvent) {
        if let Err(e) = self.tx.try_send(event) {
            tracing::warn!(error = %e, "completion event dropped");
        }
    }
}

/// Sink that remembers every event it receives; for tests.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<CompletionEvent>>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events received so far, in arrival order.
    #[must_use]
    pub fn events(&self) -> Vec<CompletionEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AchievementSink for RecordingSink {
    async fn publish(&self, event: CompletionEvent) -> Result<(), PublishError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
        Ok(())
    }
}
