//! In-process transport for tests and demos.
//!
//! Every [`MockTransport`] created on the same [`MockChannel`] sees the
//! patches broadcast by the others. Delivery is synchronous: by the time
//! `broadcast_patches` returns, every peer has applied the patch. The sender
//! never receives its own broadcast.
//!
//! A patch published while another is being delivered (a peer committing
//! from inside its patch handler) is queued and delivered afterwards, so all
//! peers see patches in the same order.

use crate::transport::{
    DisconnectHandler, InitStateHandler, PatchHandler, Transport, UserHandler, UserIdHandler,
};
use crate::{error::Result, Error, Patch, User};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Subscriber = (u64, Arc<PatchHandler>);

#[derive(Default)]
struct Outbox {
    pending: VecDeque<(u64, Patch)>,
    delivering: bool,
}

#[derive(Default)]
struct ChannelInner {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
    outbox: Mutex<Outbox>,
}

/// A shared fan-out channel. Clones refer to the same channel.
#[derive(Clone, Default)]
pub struct MockChannel {
    inner: Arc<ChannelInner>,
}

impl MockChannel {
    /// Create an isolated channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transports currently subscribed to patches.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers().len()
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn outbox(&self) -> MutexGuard<'_, Outbox> {
        self.inner
            .outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn subscribe(&self, id: u64, handler: Arc<PatchHandler>) {
        let mut subscribers = self.subscribers();
        subscribers.retain(|(existing, _)| *existing != id);
        subscribers.push((id, handler));
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers().retain(|(existing, _)| *existing != id);
    }

    /// Deliver `patch` to every subscriber except `sender`. Returns the number
    /// of peers it is addressed to.
    fn publish(&self, sender: u64, patch: Patch) -> usize {
        let reached = self
            .subscribers()
            .iter()
            .filter(|(id, _)| *id != sender)
            .count();

        {
            let mut outbox = self.outbox();
            outbox.pending.push_back((sender, patch));
            if outbox.delivering {
                return reached;
            }
            outbox.delivering = true;
        }

        loop {
            let next = {
                let mut outbox = self.outbox();
                let next = outbox.pending.pop_front();
                if next.is_none() {
                    outbox.delivering = false;
                }
                next
            };
            let Some((sender, patch)) = next else {
                break;
            };
            self.deliver(sender, &patch);
        }

        reached
    }

    fn deliver(&self, sender: u64, patch: &Patch) {
        let recipients: Vec<Arc<PatchHandler>> = self
            .subscribers()
            .iter()
            .filter(|(id, _)| *id != sender)
            .map(|(_, handler)| handler.clone())
            .collect();

        for handler in &recipients {
            if let Err(e) = handler(patch.clone()) {
                tracing::warn!(sender, error = %e, "Peer failed to apply patch");
            }
        }
    }
}

/// Same-process transport backed by a [`MockChannel`].
pub struct MockTransport {
    id: u64,
    channel: MockChannel,
    snapshot: Map<String, Value>,
    broadcasts: AtomicUsize,
}

impl MockTransport {
    /// Create a transport that hands out `snapshot` as the initial state.
    pub fn new(channel: &MockChannel, snapshot: Map<String, Value>) -> Self {
        Self {
            id: channel.allocate_id(),
            channel: channel.clone(),
            snapshot,
            broadcasts: AtomicUsize::new(0),
        }
    }

    /// Like [`MockTransport::new`], taking the snapshot as a JSON object value.
    pub fn from_value(channel: &MockChannel, snapshot: Value) -> Result<Self> {
        match snapshot {
            Value::Object(snapshot) => Ok(Self::new(channel, snapshot)),
            other => Err(Error::InvalidSnapshot(format!(
                "expected an object, got {}",
                other
            ))),
        }
    }

    /// How many patches this transport has broadcast.
    pub fn broadcast_count(&self) -> usize {
        self.broadcasts.load(Ordering::SeqCst)
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.channel.unsubscribe(self.id);
    }
}

impl Transport for MockTransport {
    fn connect(&self, _user: &User) -> Result<()> {
        Ok(())
    }

    fn broadcast_patches(&self, patch: Patch) -> Result<()> {
        self.broadcasts.fetch_add(1, Ordering::SeqCst);
        let ops = patch.len();
        let reached = self.channel.publish(self.id, patch);
        tracing::debug!(sender = self.id, reached, ops, "Mock broadcast");
        Ok(())
    }

    fn update_self(&self, _user: &User) {}

    fn on_patches(&self, handler: Box<PatchHandler>) {
        self.channel.subscribe(self.id, Arc::from(handler));
    }

    fn on_init_state(&self, handler: Box<InitStateHandler>) {
        if let Err(e) = handler(self.snapshot.clone()) {
            tracing::warn!(transport = self.id, error = %e, "Initial state rejected");
        }
    }

    fn on_disconnect(&self, _handler: Box<DisconnectHandler>) {}

    fn on_user_join(&self, _handler: Box<UserHandler>) {}

    fn on_user_update(&self, _handler: Box<UserHandler>) {}

    fn on_user_disconnect(&self, _handler: Box<UserIdHandler>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PatchOperation;
    use serde_json::json;
    use std::sync::Mutex;

    fn sample_patch() -> Patch {
        vec![PatchOperation::Replace {
            path: "/count".into(),
            value: json!(1),
        }]
        .into()
    }

    fn recorder(log: &Arc<Mutex<Vec<Patch>>>) -> Box<PatchHandler> {
        let log = log.clone();
        Box::new(move |patch| {
            log.lock().unwrap().push(patch);
            Ok(())
        })
    }

    #[test]
    fn broadcast_skips_sender() {
        let channel = MockChannel::new();
        let a = MockTransport::new(&channel, Map::new());
        let b = MockTransport::new(&channel, Map::new());

        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));
        a.on_patches(recorder(&seen_a));
        b.on_patches(recorder(&seen_b));

        a.broadcast_patches(sample_patch()).unwrap();

        assert!(seen_a.lock().unwrap().is_empty());
        assert_eq!(*seen_b.lock().unwrap(), vec![sample_patch()]);
        assert_eq!(a.broadcast_count(), 1);
        assert_eq!(b.broadcast_count(), 0);
    }

    #[test]
    fn patches_published_during_delivery_arrive_in_order() {
        let channel = MockChannel::new();
        let a = MockTransport::new(&channel, Map::new());
        let b = Arc::new(MockTransport::new(&channel, Map::new()));
        let c = MockTransport::new(&channel, Map::new());

        let follow_up: Patch = vec![PatchOperation::Replace {
            path: "/count".into(),
            value: json!(2),
        }]
        .into();

        let relay = b.clone();
        let reply = follow_up.clone();
        b.on_patches(Box::new(move |patch| {
            if patch == sample_patch() {
                relay.broadcast_patches(reply.clone())?;
            }
            Ok(())
        }));
        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_c = Arc::new(Mutex::new(Vec::new()));
        a.on_patches(recorder(&seen_a));
        c.on_patches(recorder(&seen_c));

        a.broadcast_patches(sample_patch()).unwrap();

        assert_eq!(*seen_c.lock().unwrap(), vec![sample_patch(), follow_up.clone()]);
        assert_eq!(*seen_a.lock().unwrap(), vec![follow_up]);
    }

    #[test]
    fn channels_are_isolated() {
        let first = MockChannel::new();
        let second = MockChannel::new();
        let a = MockTransport::new(&first, Map::new());
        let b = MockTransport::new(&second, Map::new());

        let seen_b = Arc::new(Mutex::new(Vec::new()));
        b.on_patches(recorder(&seen_b));
        a.broadcast_patches(sample_patch()).unwrap();

        assert!(seen_b.lock().unwrap().is_empty());
    }

    #[test]
    fn on_patches_replaces_previous_subscription() {
        let channel = MockChannel::new();
        let a = MockTransport::new(&channel, Map::new());
        let b = MockTransport::new(&channel, Map::new());

        let old = Arc::new(Mutex::new(Vec::new()));
        let new = Arc::new(Mutex::new(Vec::new()));
        b.on_patches(recorder(&old));
        b.on_patches(recorder(&new));
        assert_eq!(channel.subscriber_count(), 1);

        a.broadcast_patches(sample_patch()).unwrap();
        assert!(old.lock().unwrap().is_empty());
        assert_eq!(new.lock().unwrap().len(), 1);
    }

    #[test]
    fn init_state_is_delivered_immediately() {
        let channel = MockChannel::new();
        let transport = MockTransport::from_value(&channel, json!({"count": 5})).unwrap();

        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();
        transport.on_init_state(Box::new(move |snapshot| {
            *slot.lock().unwrap() = Some(snapshot);
            Ok(())
        }));

        let snapshot = seen.lock().unwrap().clone().unwrap();
        assert_eq!(snapshot["count"], json!(5));
    }

    #[test]
    fn snapshot_must_be_object() {
        let channel = MockChannel::new();
        assert!(matches!(
            MockTransport::from_value(&channel, json!([1, 2])),
            Err(Error::InvalidSnapshot(_))
        ));
    }

    #[test]
    fn dropped_transport_unsubscribes() {
        let channel = MockChannel::new();
        let a = MockTransport::new(&channel, Map::new());
        a.on_patches(Box::new(|_| Ok(())));
        assert_eq!(channel.subscriber_count(), 1);
        drop(a);
        assert_eq!(channel.subscriber_count(), 0);
    }
}
