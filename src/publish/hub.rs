use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Mutex, PoisonError};

use super::{LiveMessage, Publisher};
use crate::SourceId;

const DEFAULT_QUEUE_DEPTH: usize = 32;

struct Subscriber {
    filter: Option<SourceId>,
    tx: SyncSender<LiveMessage>,
}

/// In-process fan-out to any number of subscribers.
///
/// Every subscriber gets a bounded queue. A full queue drops the message for
/// that subscriber only; a dropped receiver unsubscribes.
pub struct BroadcastHub {
    subscribers: Mutex<Vec<Subscriber>>,
    queue_depth: usize,
    dropped: AtomicU64,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}

impl BroadcastHub {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            queue_depth: queue_depth.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Receive messages for one source, or every source when `filter` is `None`.
    pub fn subscribe(&self, filter: Option<SourceId>) -> Receiver<LiveMessage> {
        let (tx, rx) = mpsc::sync_channel(self.queue_depth);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber { filter, tx });
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Messages dropped because a subscriber queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Publisher for BroadcastHub {
    fn publish(&self, message: LiveMessage) {
        let source_id = message.source_id();
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|subscriber| {
            if subscriber.filter.is_some_and(|id| id != source_id) {
                return true;
            }
            match subscriber.tx.try_send(message.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            }
        });
    }
}
