use tokio::sync::broadcast;
use tracing::trace;

use crate::{settings::Settings, status::StatusSnapshot};

const DEFAULT_CAPACITY: usize = 64;

/// Notifications the core publishes. Subscribers decide what to redraw; the core doesn't know
/// who is listening.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    RecordsChanged,
    SettingsChanged(Settings),
    IconChanged(StatusSnapshot),
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: CoreEvent) {
        trace!("Publishing {event:?}");
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
