use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::content::{ContentKey, ContentType, VerificationStatus};

/// Published once processing (moderation and fact-checking) of an upload has
/// finished. Delivery is at-least-once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentReady {
    pub content_id: i64,
    pub content_type: ContentType,
    pub verification_status: VerificationStatus,
}

impl ContentReady {
    pub fn new(key: ContentKey, verification_status: VerificationStatus) -> Self {
        Self {
            content_id: key.id,
            content_type: key.kind,
            verification_status,
        }
    }

    pub fn key(&self) -> ContentKey {
        ContentKey::new(self.content_type, self.content_id)
    }
}

#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<ContentReady>>>>,
}

pub struct Subscription {
    rx: Receiver<ContentReady>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        Subscription { rx }
    }

    /// Returns how many live subscribers received the event.
    pub fn publish(&self, event: ContentReady) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Subscription {
    pub fn try_next(&self) -> Option<ContentReady> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}
