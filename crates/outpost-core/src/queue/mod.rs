//! Bounded, thread-safe message queues.
//!
//! The inbox and outbox are instances of [`MessageQueue`]: bounded by both
//! message count and cumulative payload bytes, with one carve-out. An
//! empty queue always accepts one message, whatever its size, so a single
//! oversized payload can never wedge the pipeline.
//!
//! Lock poisoning is treated as fatal: a poisoned queue means another
//! thread panicked mid-operation and the process is already lost.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use crate::wire::{Message, Priority};

/// A bounded FIFO of [`Message`]s with priority insertion.
pub struct MessageQueue {
    max_count: usize,
    max_args_bytes: usize,
    inner: Mutex<Inner>,
    /// Signalled when messages are added.
    grew: Condvar,
    /// Signalled when messages are removed.
    shrunk: Condvar,
}

struct Inner {
    messages: VecDeque<Message>,
    args_bytes: usize,
    closed: bool,
}

impl MessageQueue {
    /// Creates a queue bounded by `max_count` messages and
    /// `max_args_bytes` of cumulative payload.
    #[must_use]
    pub fn new(max_count: usize, max_args_bytes: usize) -> Self {
        Self {
            max_count,
            max_args_bytes,
            inner: Mutex::new(Inner {
                messages: VecDeque::new(),
                args_bytes: 0,
                closed: false,
            }),
            grew: Condvar::new(),
            shrunk: Condvar::new(),
        }
    }

    /// Appends a message, blocking while the queue is full.
    ///
    /// An empty queue accepts the message unconditionally. A closed queue
    /// drops the message.
    pub fn enqueue(&self, message: Message) {
        let size = message.args_size();
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.closed {
                return;
            }
            let empty = inner.messages.is_empty();
            let fits = inner.messages.len() < self.max_count
                && inner.args_bytes + size <= self.max_args_bytes;
            if empty || fits {
                break;
            }
            inner = self.shrunk.wait(inner).unwrap();
        }

        inner.args_bytes += size;
        inner.messages.push_back(message);
        self.grew.notify_all();
    }

    /// Appends a message only if it fits right now.
    ///
    /// Returns whether the message was accepted. This is the safe way to
    /// enqueue from the thread that also drains the queue, where blocking
    /// would deadlock.
    #[must_use]
    pub fn try_enqueue(&self, message: Message) -> bool {
        let size = message.args_size();
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return false;
        }
        let empty = inner.messages.is_empty();
        let fits = inner.messages.len() < self.max_count
            && inner.args_bytes + size <= self.max_args_bytes;
        if !(empty || fits) {
            return false;
        }
        inner.args_bytes += size;
        inner.messages.push_back(message);
        self.grew.notify_all();
        true
    }

    /// Inserts a message at the head without waiting and without checking
    /// bounds; the queue may temporarily exceed both limits.
    ///
    /// The message is stamped with the priority tag and lands behind any
    /// priority messages already queued, so priority traffic stays FIFO
    /// among itself.
    pub fn enqueue_priority(&self, mut message: Message) {
        message.priority = Priority::Priority as i32;
        let size = message.args_size();

        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return;
        }
        let position = inner
            .messages
            .iter()
            .take_while(|queued| queued.priority == Priority::Priority as i32)
            .count();
        inner.args_bytes += size;
        inner.messages.insert(position, message);
        self.grew.notify_all();
    }

    /// Takes a batch from the head, bounded by `max_count` messages and
    /// `max_args_bytes` of payload, with the always-one exception.
    ///
    /// An empty queue blocks when `blocking` is set (until a message
    /// arrives or the queue closes) and returns an empty batch otherwise.
    #[must_use]
    pub fn dequeue(&self, max_count: usize, max_args_bytes: usize, blocking: bool) -> Vec<Message> {
        let mut inner = self.inner.lock().unwrap();
        if blocking {
            while inner.messages.is_empty() && !inner.closed {
                inner = self.grew.wait(inner).unwrap();
            }
        }

        let mut batch = Vec::new();
        let mut batch_bytes = 0usize;
        while let Some(front) = inner.messages.front() {
            let size = front.args_size();
            let fits = batch.len() < max_count && batch_bytes + size <= max_args_bytes;
            if !batch.is_empty() && !fits {
                break;
            }
            let message = inner
                .messages
                .pop_front()
                .expect("front() observed a message");
            inner.args_bytes -= size;
            batch_bytes += size;
            batch.push(message);
        }

        if !batch.is_empty() {
            self.shrunk.notify_all();
        }
        batch
    }

    /// Number of queued messages.
    #[must_use]
    pub fn current_count(&self) -> usize {
        self.inner.lock().unwrap().messages.len()
    }

    /// Cumulative payload bytes of queued messages.
    #[must_use]
    pub fn current_args_size(&self) -> usize {
        self.inner.lock().unwrap().args_bytes
    }

    /// Publishes the shutdown flag and wakes every blocked reader and
    /// writer. Queued messages remain drainable.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.grew.notify_all();
        self.shrunk.notify_all();
    }

    /// Whether the shutdown flag is set.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn message(name: &str, args_len: usize) -> Message {
        Message {
            name: name.to_string(),
            session_id: "aff4:/flows/W:1".to_string(),
            args: vec![0u8; args_len],
            ..Default::default()
        }
    }

    #[test]
    fn test_fifo_order() {
        let queue = MessageQueue::new(100, 10_000);
        for i in 0..10 {
            queue.enqueue(message(&format!("m{i}"), 10));
        }

        let batch = queue.dequeue(100, 10_000, false);
        let names: Vec<_> = batch.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(
            names,
            ["m0", "m1", "m2", "m3", "m4", "m5", "m6", "m7", "m8", "m9"]
        );
    }

    #[test]
    fn test_priority_message_dequeued_first() {
        let queue = MessageQueue::new(100, 10_000);
        queue.enqueue(message("normal", 10));
        queue.enqueue_priority(message("urgent", 10));

        let batch = queue.dequeue(1, 10_000, false);
        assert_eq!(batch[0].name, "urgent");
        assert_eq!(batch[0].priority, Priority::Priority as i32);
    }

    #[test]
    fn test_priority_fifo_among_priority() {
        let queue = MessageQueue::new(100, 10_000);
        queue.enqueue(message("normal", 10));
        queue.enqueue_priority(message("urgent1", 10));
        queue.enqueue_priority(message("urgent2", 10));

        let batch = queue.dequeue(3, 10_000, false);
        let names: Vec<_> = batch.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["urgent1", "urgent2", "normal"]);
    }

    #[test]
    fn test_priority_ignores_bounds() {
        let queue = MessageQueue::new(1, 10);
        queue.enqueue(message("big", 10));
        // Full on both limits; a priority enqueue must not block.
        queue.enqueue_priority(message("urgent", 1_000));
        assert_eq!(queue.current_count(), 2);
        assert_eq!(queue.current_args_size(), 1_010);
    }

    #[test]
    fn test_empty_queue_accepts_oversized_message() {
        let queue = MessageQueue::new(10, 100);
        // Payload exceeds max_args_bytes but the queue is empty.
        queue.enqueue(message("oversized", 1_000));
        assert_eq!(queue.current_count(), 1);

        let batch = queue.dequeue(10, 100, false);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].name, "oversized");
    }

    #[test]
    fn test_within_limits_never_blocks() {
        let queue = MessageQueue::new(10, 1_000);
        for i in 0..10 {
            queue.enqueue(message(&format!("m{i}"), 100));
        }
        assert_eq!(queue.current_count(), 10);
        assert_eq!(queue.current_args_size(), 1_000);
    }

    #[test]
    fn test_dequeue_respects_batch_limits() {
        let queue = MessageQueue::new(100, 10_000);
        for i in 0..10 {
            queue.enqueue(message(&format!("m{i}"), 100));
        }

        let batch = queue.dequeue(3, 10_000, false);
        assert_eq!(batch.len(), 3);

        let batch = queue.dequeue(100, 250, false);
        // 100 + 100 fits, a third message would exceed 250.
        assert_eq!(batch.len(), 2);

        assert_eq!(queue.current_count(), 5);
    }

    #[test]
    fn test_dequeue_nonblocking_on_empty() {
        let queue = MessageQueue::new(10, 100);
        assert!(queue.dequeue(10, 100, false).is_empty());
    }

    #[test]
    fn test_blocked_enqueue_resumes_after_dequeue() {
        let queue = Arc::new(MessageQueue::new(1, 1_000));
        queue.enqueue(message("first", 10));

        let writer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                // Blocks until the reader drains.
                queue.enqueue(message("second", 10));
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        let batch = queue.dequeue(10, 1_000, false);
        assert_eq!(batch.len(), 1);

        writer.join().unwrap();
        let batch = queue.dequeue(10, 1_000, true);
        assert_eq!(batch[0].name, "second");
    }

    #[test]
    fn test_blocking_dequeue_woken_by_enqueue() {
        let queue = Arc::new(MessageQueue::new(10, 1_000));
        let reader = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.dequeue(10, 1_000, true))
        };

        std::thread::sleep(Duration::from_millis(50));
        queue.enqueue(message("wakeup", 10));

        let batch = reader.join().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].name, "wakeup");
    }

    #[test]
    fn test_close_unsticks_blocked_reader() {
        let queue = Arc::new(MessageQueue::new(10, 1_000));
        let reader = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.dequeue(10, 1_000, true))
        };

        std::thread::sleep(Duration::from_millis(50));
        queue.close();
        assert!(reader.join().unwrap().is_empty());
    }

    #[test]
    fn test_close_drops_enqueues_but_keeps_drainable() {
        let queue = MessageQueue::new(10, 1_000);
        queue.enqueue(message("kept", 10));
        queue.close();
        queue.enqueue(message("dropped", 10));

        let batch = queue.dequeue(10, 1_000, false);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].name, "kept");
    }

    #[test]
    fn test_try_enqueue_refuses_when_full() {
        let queue = MessageQueue::new(1, 1_000);
        assert!(queue.try_enqueue(message("first", 10)));
        assert!(!queue.try_enqueue(message("second", 10)));

        let _ = queue.dequeue(1, 1_000, false);
        assert!(queue.try_enqueue(message("second", 10)));
    }

    #[test]
    fn test_try_enqueue_empty_accepts_oversized() {
        let queue = MessageQueue::new(10, 100);
        assert!(queue.try_enqueue(message("oversized", 1_000)));
    }

    #[test]
    fn test_accounting_tracks_dequeues() {
        let queue = MessageQueue::new(10, 1_000);
        queue.enqueue(message("a", 100));
        queue.enqueue(message("b", 200));
        assert_eq!(queue.current_args_size(), 300);

        let _ = queue.dequeue(1, 1_000, false);
        assert_eq!(queue.current_args_size(), 200);
        assert_eq!(queue.current_count(), 1);
    }
}
