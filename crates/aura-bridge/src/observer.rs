//! Observer channel: fire-and-forget `{emotion, score}` events for dashboards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

/// A confident classification, as seen by listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionEvent {
    pub emotion: String,
    pub score: f64,
}

/// Most recent event and when it happened (for status reporting).
#[derive(Debug, Clone, Serialize)]
pub struct LastDetection {
    #[serde(flatten)]
    pub event: EmotionEvent,
    pub detected_at: DateTime<Utc>,
}

/// Broadcast fan-out to zero or more listeners. Slow listeners lag; the emitter never waits.
#[derive(Clone)]
pub struct EmotionObservers {
    tx: broadcast::Sender<EmotionEvent>,
    last: Arc<Mutex<Option<LastDetection>>>,
}

impl EmotionObservers {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            last: Arc::new(Mutex::new(None)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EmotionEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; returns how many listeners received it.
    pub fn emit(&self, event: EmotionEvent) -> usize {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(LastDetection {
            event: event.clone(),
            detected_at: Utc::now(),
        });
        // No listeners is fine.
        self.tx.send(event).unwrap_or(0)
    }

    pub fn last(&self) -> Option<LastDetection> {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EmotionObservers {
    fn default() -> Self {
        Self::new(64)
    }
}
