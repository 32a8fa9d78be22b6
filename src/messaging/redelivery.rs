use std::collections::{HashMap, VecDeque};

/// Upper bound on message ids remembered by one consume loop.
pub const DEFAULT_TRACKED_MESSAGES: usize = 10_000;

/// Counts the requeues a consume loop has issued per message id.
///
/// Classic queues report only the `redelivered` flag, so without this a
/// message requeued forever looks like its second delivery every time. The
/// count is local to one consumer. Oldest ids are forgotten first once
/// `capacity` is reached.
#[derive(Debug)]
pub struct RedeliveryTracker {
    counts: HashMap<String, u32>,
    order: VecDeque<String>,
    capacity: usize,
}

impl RedeliveryTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            counts: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Requeues issued so far for `message_id`.
    pub fn requeues(&self, message_id: &str) -> u32 {
        self.counts.get(message_id).copied().unwrap_or(0)
    }

    pub fn record_requeue(&mut self, message_id: &str) {
        if let Some(count) = self.counts.get_mut(message_id) {
            *count = count.saturating_add(1);
            return;
        }
        if self.capacity == 0 {
            return;
        }

        while self.counts.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.counts.remove(&oldest);
                }
                None => break,
            }
        }
        self.counts.insert(message_id.to_owned(), 1);
        self.order.push_back(message_id.to_owned());
    }

    /// Drops `message_id` once it has left the queue for good.
    pub fn forget(&mut self, message_id: &str) {
        if self.counts.remove(message_id).is_some() {
            self.order.retain(|id| id != message_id);
        }
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

impl Default for RedeliveryTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TRACKED_MESSAGES)
    }
}
