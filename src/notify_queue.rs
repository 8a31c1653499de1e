//! Bounded FIFO of decoded, unsolicited item notifications (C3).
//!
//! Adapted from `kimberlite-server/src/bounded_queue.rs`'s `BoundedQueue`:
//! that queue signals backpressure by handing the rejected item back to
//! the producer. I3 requires the opposite policy — when full, the
//! *oldest* entry is dropped so the queue never blocks the event loop and
//! never discards the notification that just arrived. A lock-free
//! `ArrayQueue` cannot examine-and-evict its head atomically, so this
//! queue is a plain `Mutex<VecDeque<_>>` instead.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::model::Response;

/// Fixed id the request table uses for whoever is parked in
/// `receive_notification` (spec §4.3).
pub const NOTIFICATIONS_WAITER_ID: &str = "notifications";

pub struct NotifyQueue {
    inner: Mutex<VecDeque<Response>>,
    capacity: usize,
}

impl NotifyQueue {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "notify queue capacity must be positive");
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Appends `response`, dropping the oldest entry first if the queue
    /// is already at capacity (I3). Returns `true` if an entry was
    /// dropped to make room.
    pub fn enqueue(&self, response: Response) -> bool {
        let mut queue = self.inner.lock().unwrap();
        let dropped = if queue.len() >= self.capacity {
            queue.pop_front();
            true
        } else {
            false
        };
        queue.push_back(response);
        dropped
    }

    pub fn dequeue(&self) -> Option<Response> {
        self.inner.lock().unwrap().pop_front()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PacketVariant;

    fn notification(id: &str) -> Response {
        Response {
            id: id.to_string(),
            namespace: None,
            element_name: None,
            type_attr: None,
            payload: PacketVariant::Data {
                event: Some(id.to_string()),
                transducers: Vec::new(),
            },
            stanza: None,
        }
    }

    #[test]
    fn fifo_order_preserved() {
        let queue = NotifyQueue::new(10);
        queue.enqueue(notification("n1"));
        queue.enqueue(notification("n2"));
        assert_eq!(queue.dequeue().unwrap().id, "n1");
        assert_eq!(queue.dequeue().unwrap().id, "n2");
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn overflow_drops_oldest_not_newest() {
        // Spec scenario 4: MAX=3, deliver n1..n5, next three dequeues
        // yield n3, n4, n5.
        let queue = NotifyQueue::new(3);
        for i in 1..=5 {
            queue.enqueue(notification(&format!("n{i}")));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dequeue().unwrap().id, "n3");
        assert_eq!(queue.dequeue().unwrap().id, "n4");
        assert_eq!(queue.dequeue().unwrap().id, "n5");
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn length_never_exceeds_capacity() {
        let queue = NotifyQueue::new(5);
        for i in 0..50 {
            queue.enqueue(notification(&format!("n{i}")));
            assert!(queue.len() <= 5);
        }
    }

    #[test]
    fn clear_drains_without_delivering() {
        let queue = NotifyQueue::new(5);
        queue.enqueue(notification("n1"));
        queue.enqueue(notification("n2"));
        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.dequeue().is_none());
    }

    #[test]
    #[should_panic(expected = "notify queue capacity must be positive")]
    fn zero_capacity_panics() {
        let _queue = NotifyQueue::new(0);
    }
}
