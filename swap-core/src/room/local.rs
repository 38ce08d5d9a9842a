use super::{Room, RoomEvent, RoomSubscription};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 64;

/// One end of an in-process room. Messages sent on one end are delivered to
/// subscribers of the other.
pub struct LocalRoom {
    inbox: broadcast::Sender<RoomEvent>,
    outbox: broadcast::Sender<RoomEvent>,
    connected: Arc<AtomicBool>,
}

impl LocalRoom {
    pub fn pair() -> (LocalRoom, LocalRoom) {
        let (a_inbox, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (b_inbox, _) = broadcast::channel(CHANNEL_CAPACITY);
        let connected = Arc::new(AtomicBool::new(true));

        let a = LocalRoom {
            inbox: a_inbox.clone(),
            outbox: b_inbox.clone(),
            connected: connected.clone(),
        };
        let b = LocalRoom {
            inbox: b_inbox,
            outbox: a_inbox,
            connected,
        };
        (a, b)
    }

    /// While disconnected, messages from both ends are silently dropped.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl Room for LocalRoom {
    async fn send(&self, event: RoomEvent) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            tracing::debug!("Room disconnected, dropping '{}'", event.kind());
            return Ok(());
        }

        tracing::debug!("Room send '{}'", event.kind());
        // no subscribers on the other end is the same as a lost message
        if self.outbox.send(event).is_err() {
            tracing::debug!("Nobody listening on the other end");
        }
        Ok(())
    }

    fn subscribe(&self) -> RoomSubscription {
        RoomSubscription::new(self.inbox.subscribe())
    }
}
