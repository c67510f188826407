//! Message dispatcher
//!
//! Routes decoded frames to subscribers by message ID. Every subscriber owns
//! an unbounded queue, so publishing never blocks the link reader and a slow
//! consumer never holds up another one.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio_stream::Stream;

use crate::error::{Error, Result};
use crate::protocols::apl::MessageId;

pub type SubscriberId = u64;

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::UnboundedSender<Bytes>,
}

#[derive(Default)]
pub struct Dispatcher {
    subscribers: Mutex<HashMap<u16, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn table(&self) -> MutexGuard<'_, HashMap<u16, Vec<Subscriber>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new consumer for `msg_id`.
    ///
    /// The consumer receives every frame of that type, in arrival order, until
    /// it is unsubscribed or the [`Subscription`] is dropped.
    pub fn subscribe(self: &Arc<Self>, msg_id: impl Into<u16>) -> Subscription {
        let msg_id = msg_id.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        self.table()
            .entry(msg_id)
            .or_default()
            .push(Subscriber { id, tx });

        debug!("Subscriber {} registered for {:#06x}", id, msg_id);

        Subscription {
            id,
            msg_id,
            rx,
            dispatcher: Arc::downgrade(self),
            registered: true,
        }
    }

    pub fn unsubscribe(&self, consumer: SubscriberId, msg_id: u16) -> Result<()> {
        let mut table = self.table();

        let queues = table
            .get_mut(&msg_id)
            .ok_or(Error::NotSubscribed { consumer, msg_id })?;
        let pos = queues
            .iter()
            .position(|s| s.id == consumer)
            .ok_or(Error::NotSubscribed { consumer, msg_id })?;

        queues.remove(pos);
        if queues.is_empty() {
            table.remove(&msg_id);
        }

        debug!("Subscriber {} removed from {:#06x}", consumer, msg_id);
        Ok(())
    }

    /// Delivers `frame` to every subscriber of its message ID.
    ///
    /// Returns the number of queues the frame was delivered to. A frame nobody
    /// listens for is reported as [`Error::UnroutableMessage`].
    pub fn publish(&self, frame: Bytes) -> Result<usize> {
        let msg_id = MessageId::peek(&frame)
            .ok_or_else(|| Error::InvalidMessage("frame shorter than a message ID".into()))?;

        let mut table = self.table();
        let Some(queues) = table.get_mut(&msg_id) else {
            warn!("Unhandled message ID {:#06x}", msg_id);
            return Err(Error::UnroutableMessage(msg_id));
        };

        // receivers that went away without unsubscribing are pruned here
        queues.retain(|s| s.tx.send(frame.clone()).is_ok());
        let delivered = queues.len();

        if delivered == 0 {
            table.remove(&msg_id);
            warn!("Unhandled message ID {:#06x}", msg_id);
            return Err(Error::UnroutableMessage(msg_id));
        }

        Ok(delivered)
    }

    pub fn subscriber_count(&self, msg_id: impl Into<u16>) -> usize {
        self.table().get(&msg_id.into()).map_or(0, Vec::len)
    }
}

/// Receiving end of one registration in the [`Dispatcher`].
///
/// Dropping it deregisters the consumer.
pub struct Subscription {
    id: SubscriberId,
    msg_id: u16,
    rx: mpsc::UnboundedReceiver<Bytes>,
    dispatcher: Weak<Dispatcher>,
    registered: bool,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn msg_id(&self) -> u16 {
        self.msg_id
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Waits for the next frame for at most `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Bytes> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(Error::Connection("dispatcher closed".into())),
            Err(_) => Err(Error::Timeout),
        }
    }

    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }

    pub fn unsubscribe(mut self) -> Result<()> {
        self.registered = false;
        match self.dispatcher.upgrade() {
            Some(dispatcher) => dispatcher.unsubscribe(self.id, self.msg_id),
            None => Ok(()),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.registered {
            return;
        }
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            if let Err(e) = dispatcher.unsubscribe(self.id, self.msg_id) {
                debug!("Dropping subscription: {}", e);
            }
        }
    }
}

impl Stream for Subscription {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u16, tail: &[u8]) -> Bytes {
        let mut data = id.to_le_bytes().to_vec();
        data.extend_from_slice(tail);
        Bytes::from(data)
    }

    #[tokio::test]
    async fn test_fan_out_in_order() {
        let dispatcher = Dispatcher::new();
        let mut fast = dispatcher.subscribe(MessageId::BootResponse);
        let mut slow = dispatcher.subscribe(MessageId::BootResponse);

        for i in 0..5u8 {
            assert_eq!(dispatcher.publish(frame(0xB001, &[i])).unwrap(), 2);
        }

        for i in 0..5u8 {
            assert_eq!(fast.recv().await.unwrap()[2], i);
        }
        for i in 0..5u8 {
            assert_eq!(slow.recv().await.unwrap()[2], i);
        }
    }

    #[tokio::test]
    async fn test_routes_by_id() {
        let dispatcher = Dispatcher::new();
        let mut boot = dispatcher.subscribe(MessageId::BootResponse);
        let mut shell = dispatcher.subscribe(MessageId::ShellToPc);

        dispatcher.publish(frame(0xC000, b"hi")).unwrap();
        dispatcher.publish(frame(0xB001, &[1])).unwrap();

        assert_eq!(boot.recv().await.unwrap().as_ref(), &[0x01, 0xB0, 1]);
        assert_eq!(shell.recv().await.unwrap().as_ref(), b"\x00\xC0hi");
        assert!(boot.try_recv().is_none());
    }

    #[test]
    fn test_unroutable() {
        let dispatcher = Dispatcher::new();
        assert!(matches!(
            dispatcher.publish(frame(0xB001, &[])),
            Err(Error::UnroutableMessage(0xB001))
        ));
        assert!(matches!(
            dispatcher.publish(Bytes::from_static(&[0x01])),
            Err(Error::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_unsubscribe_unknown_consumer_fails() {
        let dispatcher = Dispatcher::new();
        let sub = dispatcher.subscribe(MessageId::BootResponse);

        assert!(matches!(
            dispatcher.unsubscribe(sub.id() + 100, 0xB001),
            Err(Error::NotSubscribed { .. })
        ));
        assert!(matches!(
            dispatcher.unsubscribe(sub.id(), 0xC000),
            Err(Error::NotSubscribed { .. })
        ));

        let id = sub.id();
        sub.unsubscribe().unwrap();
        assert!(matches!(
            dispatcher.unsubscribe(id, 0xB001),
            Err(Error::NotSubscribed { .. })
        ));
    }

    #[test]
    fn test_drop_deregisters() {
        let dispatcher = Dispatcher::new();
        {
            let _a = dispatcher.subscribe(MessageId::BootResponse);
            let _b = dispatcher.subscribe(MessageId::BootResponse);
            assert_eq!(dispatcher.subscriber_count(MessageId::BootResponse), 2);
        }
        assert_eq!(dispatcher.subscriber_count(MessageId::BootResponse), 0);
    }

    #[tokio::test]
    async fn test_recv_timeout() {
        let dispatcher = Dispatcher::new();
        let mut sub = dispatcher.subscribe(MessageId::BootResponse);
        assert!(matches!(
            sub.recv_timeout(Duration::from_millis(10)).await,
            Err(Error::Timeout)
        ));
    }
}
