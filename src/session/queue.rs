//! Bounded per-session FIFO message queue.

use std::collections::VecDeque;

use uuid::Uuid;

use crate::session::{PromptOptions, QueuedMessage};

/// Default queue capacity per session.
pub const DEFAULT_QUEUE_CAP: usize = 10;

/// Result of an enqueue attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueResult {
    /// Message accepted at the back of the queue.
    Enqueued(QueuedMessage),
    /// Queue at capacity; the message was not stored.
    Rejected(QueuedMessage),
}

impl EnqueueResult {
    /// The queue entry, whether accepted or rejected.
    #[must_use]
    pub fn message(&self) -> &QueuedMessage {
        match self {
            Self::Enqueued(m) | Self::Rejected(m) => m,
        }
    }

    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

/// Strict-FIFO bounded queue of pending messages for one session.
///
/// Entries are never processed while the owning session is busy or
/// waiting for user input; the orchestrator drains one entry each time
/// the session returns to idle.
#[derive(Debug, Clone)]
pub struct MessageQueue {
    entries: VecDeque<QueuedMessage>,
    cap: usize,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAP)
    }
}

impl MessageQueue {
    /// Create a queue with the given capacity.
    #[must_use]
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(cap),
            cap,
        }
    }

    /// Change the capacity. Entries already queued beyond a smaller
    /// capacity stay; only new pushes are affected.
    pub fn set_cap(&mut self, cap: usize) {
        self.cap = cap;
    }

    /// Attempt to enqueue. Over-capacity returns a rejected entry and
    /// leaves the queue unchanged; nothing is ever silently dropped.
    pub fn push(&mut self, content: impl Into<String>, options: PromptOptions) -> EnqueueResult {
        self.push_entry(QueuedMessage::new(content, options))
    }

    /// Enqueue a pre-built entry, keeping any attached context.
    pub fn push_entry(&mut self, entry: QueuedMessage) -> EnqueueResult {
        if self.entries.len() >= self.cap {
            tracing::warn!(cap = self.cap, "message queue at capacity, rejecting");
            return EnqueueResult::Rejected(entry);
        }
        self.entries.push_back(entry.clone());
        EnqueueResult::Enqueued(entry)
    }

    /// Pop the next entry in FIFO order.
    pub fn pop(&mut self) -> Option<QueuedMessage> {
        self.entries.pop_front()
    }

    /// Remove the entry with the given id.
    pub fn remove(&mut self, id: Uuid) -> Option<QueuedMessage> {
        let idx = self.entries.iter().position(|e| e.id == id)?;
        self.entries.remove(idx)
    }

    /// Move the entry at `from` to position `to`. Returns false when either
    /// index is out of range.
    pub fn reorder(&mut self, from: usize, to: usize) -> bool {
        if from >= self.entries.len() || to >= self.entries.len() {
            return false;
        }
        if let Some(entry) = self.entries.remove(from) {
            self.entries.insert(to, entry);
            true
        } else {
            false
        }
    }

    /// Replace the content of the entry with the given id.
    pub fn update(&mut self, id: Uuid, content: impl Into<String>) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.content = content.into();
            true
        } else {
            false
        }
    }

    /// Pending entries in FIFO order.
    #[must_use]
    pub fn entries(&self) -> impl Iterator<Item = &QueuedMessage> {
        self.entries.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(q: &mut MessageQueue, text: &str) -> QueuedMessage {
        match q.push(text, PromptOptions::default()) {
            EnqueueResult::Enqueued(m) => m,
            EnqueueResult::Rejected(_) => panic!("unexpected rejection"),
        }
    }

    #[test]
    fn fifo_ordering() {
        let mut q = MessageQueue::default();
        push(&mut q, "one");
        push(&mut q, "two");
        push(&mut q, "three");
        assert_eq!(q.pop().unwrap().content, "one");
        assert_eq!(q.pop().unwrap().content, "two");
        assert_eq!(q.pop().unwrap().content, "three");
        assert!(q.pop().is_none());
    }

    #[test]
    fn capacity_rejects_without_mutating() {
        let mut q = MessageQueue::with_capacity(2);
        push(&mut q, "a");
        push(&mut q, "b");
        let result = q.push("c", PromptOptions::default());
        assert!(result.is_rejected());
        assert_eq!(result.message().content, "c");
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().unwrap().content, "a");
    }

    #[test]
    fn remove_by_id() {
        let mut q = MessageQueue::default();
        push(&mut q, "a");
        let b = push(&mut q, "b");
        push(&mut q, "c");
        let removed = q.remove(b.id).unwrap();
        assert_eq!(removed.content, "b");
        assert_eq!(q.len(), 2);
        assert!(q.remove(b.id).is_none());
    }

    #[test]
    fn reorder_moves_entry() {
        let mut q = MessageQueue::default();
        push(&mut q, "a");
        push(&mut q, "b");
        push(&mut q, "c");
        assert!(q.reorder(2, 0));
        let order: Vec<_> = q.entries().map(|e| e.content.clone()).collect();
        assert_eq!(order, ["c", "a", "b"]);
        assert!(!q.reorder(5, 0));
    }

    #[test]
    fn update_rewrites_content() {
        let mut q = MessageQueue::default();
        let a = push(&mut q, "a");
        assert!(q.update(a.id, "edited"));
        assert_eq!(q.pop().unwrap().content, "edited");
        assert!(!q.update(a.id, "gone"));
    }
}
