use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Ms;

const CHANNEL_CAPACITY: usize = 256;

/// Outbound notice emitted once an appointment has been durably admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingCreated {
    pub provider_id: Ulid,
    pub appointment_id: Ulid,
    pub client_name: String,
    pub start: Ms,
}

/// Broadcast hub for booking notices, one channel per provider.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<BookingCreated>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to booking notices for a provider. Creates the channel if needed.
    pub fn subscribe(&self, provider_id: Ulid) -> broadcast::Receiver<BookingCreated> {
        let sender = self
            .channels
            .entry(provider_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notice. No-op if nobody is listening.
    pub fn send(&self, notice: BookingCreated) {
        if let Some(sender) = self.channels.get(&notice.provider_id) {
            let _ = sender.send(notice);
        }
    }

    /// Remove a channel (e.g. when the provider is deleted).
    pub fn remove(&self, provider_id: &Ulid) {
        self.channels.remove(provider_id);
    }
}
