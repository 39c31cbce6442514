//! # Live Event Hub
//!
//! `EventHub` is the pipeline's `EventSink` inside the server. Every
//! committed event is fanned out to the currently registered subscribers;
//! `GET /events` registers one per connection and streams it as
//! Server-Sent Events. A subscription unregisters itself when dropped,
//! which happens when the client disconnects.

use super::AppState;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use crucible_core::{CrucibleError, EventSink, PipelineEvent};
use futures::Stream;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};

/// Events buffered per subscriber before the slowest one starts lagging.
pub const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

#[derive(Debug)]
struct HubInner {
    sender: broadcast::Sender<PipelineEvent>,
    subscribers: Mutex<BTreeSet<u64>>,
    next_id: AtomicU64,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(EVENT_BUFFER)
    }
}

impl EventHub {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(HubInner {
                sender,
                subscribers: Mutex::new(BTreeSet::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a new subscriber. It sees every event published from now on.
    pub fn register(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let receiver = self.inner.sender.subscribe();
        let count = {
            let mut subscribers = self
                .inner
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            subscribers.insert(id);
            subscribers.len()
        };
        tracing::info!(subscriber = id, subscribers = count, "event subscriber registered");
        Subscription {
            id,
            receiver,
            hub: self.clone(),
        }
    }

    /// Forget a subscriber. Unknown ids are ignored.
    pub fn unregister(&self, id: u64) {
        let (removed, count) = {
            let mut subscribers = self
                .inner
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            (subscribers.remove(&id), subscribers.len())
        };
        if removed {
            tracing::info!(subscriber = id, subscribers = count, "event subscriber unregistered");
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl EventSink for EventHub {
    fn publish(&self, event: &PipelineEvent) -> Result<(), CrucibleError> {
        // With nobody listening there is nothing to deliver.
        match self.inner.sender.send(*event) {
            Ok(receivers) => {
                tracing::debug!(event = %event.event, flask = event.flask_id.0, receivers, "event broadcast");
            }
            Err(_) => {
                tracing::debug!(event = %event.event, flask = event.flask_id.0, "no event subscribers");
            }
        }
        Ok(())
    }
}

/// A registered subscriber's receiving end.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    receiver: broadcast::Receiver<PipelineEvent>,
    hub: EventHub,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` if the channel closed. Skips over lag.
    pub async fn recv(&mut self) -> Option<PipelineEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(subscriber = self.id, missed, "event subscriber lagging");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unregister(self.id);
    }
}

// =============================================================================
// SSE HANDLER
// =============================================================================

/// `GET /events`: one SSE message per pipeline event, named after its kind.
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let subscription = state.events.register();
    let stream = futures::stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        let message = Event::default().event(event.event.as_str()).json_data(event);
        Some((message, subscription))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
