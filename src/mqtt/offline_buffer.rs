use std::collections::VecDeque;

use rumqttc::QoS;
use tokio::sync::oneshot;
use tracing::warn;

/// An outbound publish together with its completion, if anyone waits for it.
#[derive(Debug)]
pub struct Outbound {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub done: Option<oneshot::Sender<bool>>,
}

/// Bounded FIFO of outbound publishes. When full, the oldest entry is
/// evicted; the caller resolves its completion as failed.
#[derive(Debug)]
pub struct OfflineBuffer {
    queue: VecDeque<Outbound>,
    capacity: usize,
}

impl OfflineBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Queues `pending`. Returns the entry that had to give way: the oldest
    /// one when full, or `pending` itself when buffering is disabled.
    pub fn push(&mut self, pending: Outbound) -> Option<Outbound> {
        if self.capacity == 0 {
            warn!("Offline buffer disabled, dropping publish to {}", pending.topic);
            return Some(pending);
        }
        let evicted = if self.queue.len() >= self.capacity {
            self.queue.pop_front()
        } else {
            None
        };
        if let Some(oldest) = &evicted {
            warn!("Offline buffer full, dropping oldest publish to {}", oldest.topic);
        }
        self.queue.push_back(pending);
        evicted
    }

    /// Removes everything in insertion order.
    pub fn drain(&mut self) -> Vec<Outbound> {
        self.queue.drain(..).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
