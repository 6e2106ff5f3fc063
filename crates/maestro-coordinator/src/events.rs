use maestro_core::Event;
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

struct Subscriber {
    name: String,
    tx: mpsc::Sender<Event>,
}

/// Typed fan-out bus for internal events. Each subscriber owns a bounded
/// channel; emission never blocks — a subscriber that cannot keep up loses
/// events with a warning rather than stalling the emitter.
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Register a named subscriber and return its receiving end.
    pub async fn subscribe(&self, name: impl Into<String>, capacity: usize) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(capacity);
        self.subscribers.write().await.push(Subscriber {
            name: name.into(),
            tx,
        });
        rx
    }

    /// Deliver an event to every live subscriber. Closed subscribers are
    /// pruned on the way through.
    pub async fn emit(&self, event: Event) {
        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    subscriber = %sub.name,
                    event_type = %event.event_type,
                    "Event channel full, dropping event"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
