//! Typed publish/subscribe for state changes and channel messages
//!
//! Each subscriber owns an unbounded queue, so events are delivered in emit
//! order and a slow subscriber never blocks the engine. Dropping a
//! `Subscription` removes it from the emitter.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

struct EmitterInner<T> {
    subscribers: Mutex<Vec<(u64, UnboundedSender<T>)>>,
    next_id: AtomicU64,
}

/// Fan-out point owned by the engine
pub struct EventEmitter<T: Clone + Send + 'static> {
    inner: Arc<EmitterInner<T>>,
}

impl<T: Clone + Send + 'static> Clone for EventEmitter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for EventEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> EventEmitter<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EmitterInner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().push((id, tx));
        Subscription {
            id,
            receiver: rx,
            emitter: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver to every live subscriber; closed ones are pruned
    pub fn emit(&self, event: T) {
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

/// Receiving end of an `EventEmitter`
pub struct Subscription<T: Send + 'static> {
    id: u64,
    receiver: UnboundedReceiver<T>,
    emitter: Weak<EmitterInner<T>>,
}

impl<T: Send + 'static> Subscription<T> {
    /// Wait for the next event; `None` once the emitter is gone
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<T> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Drain everything queued so far
    pub fn drain(&mut self) -> Vec<T> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }

    /// Block the current (non-async) thread for the next event
    pub fn blocking_recv(&mut self) -> Option<T> {
        self.receiver.blocking_recv()
    }
}

impl<T: Send + 'static> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.emitter.upgrade() {
            inner.subscribers.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_arrive_in_emit_order() {
        let emitter = EventEmitter::new();
        let mut sub = emitter.subscribe();
        for i in 0..5 {
            emitter.emit(i);
        }
        assert_eq!(sub.drain(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let emitter: EventEmitter<u32> = EventEmitter::new();
        let first = emitter.subscribe();
        let mut second = emitter.subscribe();
        assert_eq!(emitter.subscriber_count(), 2);

        drop(first);
        assert_eq!(emitter.subscriber_count(), 1);

        emitter.emit(7);
        assert_eq!(second.try_recv(), Some(7));
    }

    #[tokio::test]
    async fn test_recv_ends_when_emitter_dropped() {
        let emitter: EventEmitter<u32> = EventEmitter::new();
        let mut sub = emitter.subscribe();
        emitter.emit(1);
        drop(emitter);
        assert_eq!(sub.recv().await, Some(1));
        assert_eq!(sub.recv().await, None);
    }
}
