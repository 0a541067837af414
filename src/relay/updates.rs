use std::collections::BTreeMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentUpdate {
    pub text: String,
    pub at: Instant,
}

#[derive(Debug)]
struct ChatQueue {
    updates: Vec<AgentUpdate>,
    last_flush: Instant,
}

/// Per-chat progress queues awaiting an interim delivery.
#[derive(Debug)]
pub struct UpdateAggregator {
    queues: BTreeMap<String, ChatQueue>,
    capacity: usize,
    flush_after: Duration,
}

impl UpdateAggregator {
    pub fn new(capacity: usize, flush_after: Duration) -> Self {
        Self {
            queues: BTreeMap::new(),
            capacity,
            flush_after,
        }
    }

    /// Queues `text` unless it is blank, repeats the previous entry, or the
    /// queue is full. Returns whether it was kept.
    pub fn collect(&mut self, chat_id: &str, text: &str, now: Instant) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        let queue = self
            .queues
            .entry(chat_id.to_string())
            .or_insert_with(|| ChatQueue {
                updates: Vec::new(),
                last_flush: now,
            });

        if queue.updates.last().is_some_and(|prev| prev.text == text) {
            return false;
        }
        if queue.updates.len() >= self.capacity {
            return false;
        }
        queue.updates.push(AgentUpdate {
            text: text.to_string(),
            at: now,
        });
        true
    }

    pub fn flush_due(&self, chat_id: &str, now: Instant) -> bool {
        self.queues.get(chat_id).is_some_and(|q| {
            !q.updates.is_empty() && now.saturating_duration_since(q.last_flush) >= self.flush_after
        })
    }

    /// Empties the queue and restarts its timer.
    pub fn take(&mut self, chat_id: &str, now: Instant) -> Vec<AgentUpdate> {
        match self.queues.get_mut(chat_id) {
            Some(queue) => {
                queue.last_flush = now;
                std::mem::take(&mut queue.updates)
            }
            None => Vec::new(),
        }
    }

    pub fn clear(&mut self, chat_id: &str) {
        self.queues.remove(chat_id);
    }

    pub fn chat_ids(&self) -> Vec<String> {
        self.queues.keys().cloned().collect()
    }

    pub fn pending(&self, chat_id: &str) -> usize {
        self.queues.get(chat_id).map_or(0, |q| q.updates.len())
    }
}
