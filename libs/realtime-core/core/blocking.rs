//! Synchronous wrappers over the async handles
//!
//! Each call spawns the async operation on a runtime handle and waits on a
//! crossbeam rendezvous with a timeout. Must not be called from a thread that
//! drives the same runtime (e.g. inside a current-thread runtime's task).

use crate::core::channel::{Channel, ChannelState};
use crate::core::connection::{Connection, Metrics};
use crate::core::connection_state::{ConnectionState, ConnectionStateChange};
use crate::core::events::Subscription;
use crate::error::{RealtimeError, Result};
use crate::protocol::{Message, PresenceMessage};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::debug;

fn run_blocking<T, F>(runtime: &Handle, timeout: Duration, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = bounded(1);
    let task = runtime.spawn(async move {
        let _ = tx.send(operation.await);
    });
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            task.abort();
            Err(RealtimeError::Timeout(format!("no result within {:?}", timeout)))
        }
        Err(RecvTimeoutError::Disconnected) => Err(RealtimeError::ChannelSend(
            "operation dropped by the runtime".into(),
        )),
    }
}

/// Blocking view of the connection
#[derive(Clone)]
pub struct BlockingConnection {
    inner: Connection,
    runtime: Handle,
    timeout: Duration,
}

impl BlockingConnection {
    pub fn new(connection: Connection, runtime: Handle, timeout: Duration) -> Self {
        Self {
            inner: connection,
            runtime,
            timeout,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn connect(&self) -> Result<()> {
        self.inner.connect()
    }

    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    pub fn wait_for(&self, target: ConnectionState) -> Result<ConnectionStateChange> {
        let connection = self.inner.clone();
        run_blocking(&self.runtime, self.timeout, async move {
            connection.when_state(target).await
        })
    }

    pub fn ping(&self) -> Result<Duration> {
        let connection = self.inner.clone();
        run_blocking(&self.runtime, self.timeout, async move { connection.ping().await })
    }

    pub fn authorize(&self) -> Result<()> {
        let connection = self.inner.clone();
        run_blocking(&self.runtime, self.timeout, async move {
            connection.authorize().await
        })
    }

    pub fn metrics(&self) -> Result<Metrics> {
        let connection = self.inner.clone();
        run_blocking(&self.runtime, self.timeout, async move {
            Ok(connection.metrics().await)
        })
    }
}

/// Blocking view of a channel
#[derive(Clone)]
pub struct BlockingChannel {
    inner: Channel,
    runtime: Handle,
    timeout: Duration,
}

impl BlockingChannel {
    pub fn new(channel: Channel, runtime: Handle, timeout: Duration) -> Self {
        Self {
            inner: channel,
            runtime,
            timeout,
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    pub fn attach(&self) -> Result<()> {
        let channel = self.inner.clone();
        run_blocking(&self.runtime, self.timeout, async move { channel.attach().await })
    }

    pub fn detach(&self) -> Result<()> {
        let channel = self.inner.clone();
        run_blocking(&self.runtime, self.timeout, async move { channel.detach().await })
    }

    /// Publish and wait for the ACK
    pub fn publish(&self, name: impl Into<String>, data: impl Into<Value>) -> Result<()> {
        let channel = self.inner.clone();
        let message = Message::new(name, data);
        run_blocking(&self.runtime, self.timeout, async move {
            channel.publish_messages(vec![message]).await
        })
    }

    pub fn subscribe(&self) -> BlockingSubscription<Message> {
        BlockingSubscription::forward(&self.runtime, self.inner.subscribe())
    }

    pub fn subscribe_presence(&self) -> BlockingSubscription<PresenceMessage> {
        BlockingSubscription::forward(&self.runtime, self.inner.subscribe_presence())
    }
}

/// Events forwarded from an async subscription onto a crossbeam channel
pub struct BlockingSubscription<T> {
    receiver: Receiver<T>,
}

impl<T: Send + 'static> BlockingSubscription<T> {
    fn forward(runtime: &Handle, mut subscription: Subscription<T>) -> Self {
        let (tx, rx) = unbounded();
        runtime.spawn(async move {
            while let Some(event) = subscription.recv().await {
                if tx.send(event).is_err() {
                    debug!("Blocking subscriber gone, stopping forwarder");
                    break;
                }
            }
        });
        Self { receiver: rx }
    }

    /// Next event, or `None` after `timeout` or once the source is gone
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        self.receiver.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_run_blocking_returns_result() {
        let rt = runtime();
        let value = run_blocking(rt.handle(), Duration::from_secs(1), async { Ok(7) }).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_run_blocking_times_out() {
        let rt = runtime();
        let result: Result<()> = run_blocking(rt.handle(), Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });
        assert!(matches!(result, Err(RealtimeError::Timeout(_))));
    }

    #[test]
    fn test_subscription_forwarding() {
        let rt = runtime();
        let emitter = crate::core::events::EventEmitter::<u32>::new();
        let subscription = BlockingSubscription::forward(rt.handle(), emitter.subscribe());
        emitter.emit(1);
        emitter.emit(2);
        assert_eq!(subscription.recv_timeout(Duration::from_secs(1)), Some(1));
        assert_eq!(subscription.recv_timeout(Duration::from_secs(1)), Some(2));
        assert_eq!(subscription.recv_timeout(Duration::from_millis(20)), None);
    }
}
