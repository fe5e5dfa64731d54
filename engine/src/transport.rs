//! The contract between the sync store and whatever moves bytes between peers.
//!
//! A transport is wired once by [`SyncStore::new`](crate::SyncStore::new):
//! every `on_*` method installs exactly one handler, replacing any earlier one.
//! A transport must deliver at most one initial snapshot per connection; after
//! that, inbound data goes to the patch and presence handlers only.

use crate::{error::Result, Patch, User};
use serde_json::{Map, Value};
use std::sync::{Arc, PoisonError, RwLock};

/// Receives patches from peers.
pub type PatchHandler = dyn Fn(Patch) -> Result<()> + Send + Sync;
/// Receives the initial snapshot.
pub type InitStateHandler = dyn Fn(Map<String, Value>) -> Result<()> + Send + Sync;
/// Called when the connection closes.
pub type DisconnectHandler = dyn Fn() + Send + Sync;
/// Receives a joining or updated participant.
pub type UserHandler = dyn Fn(User) + Send + Sync;
/// Receives the id of a departed participant.
pub type UserIdHandler = dyn Fn(String) + Send + Sync;

/// A bidirectional channel to the other participants.
pub trait Transport: Send + Sync {
    /// Open the connection, announcing `user` as the local participant.
    fn connect(&self, user: &User) -> Result<()>;

    /// Queue a patch for delivery to every peer.
    ///
    /// Must not block: delivery completes on the transport's own schedule and
    /// is not retried by the caller.
    fn broadcast_patches(&self, patch: Patch) -> Result<()>;

    /// Announce a changed local participant record.
    fn update_self(&self, user: &User);

    fn on_patches(&self, handler: Box<PatchHandler>);
    fn on_init_state(&self, handler: Box<InitStateHandler>);
    fn on_disconnect(&self, handler: Box<DisconnectHandler>);
    fn on_user_join(&self, handler: Box<UserHandler>);
    fn on_user_update(&self, handler: Box<UserHandler>);
    fn on_user_disconnect(&self, handler: Box<UserIdHandler>);
}

/// A single-slot handler registration. Setting a handler replaces the previous one.
pub struct Handler<F: ?Sized> {
    slot: RwLock<Option<Arc<F>>>,
}

impl<F: ?Sized> Default for Handler<F> {
    fn default() -> Self {
        Self {
            slot: RwLock::new(None),
        }
    }
}

impl<F: ?Sized> Handler<F> {
    /// Install `handler`, dropping any earlier one.
    pub fn set(&self, handler: Box<F>) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::from(handler));
    }

    /// Clone out the current handler so it can be invoked without holding the lock.
    pub fn get(&self) -> Option<Arc<F>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remove the current handler.
    pub fn clear(&self) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Whether a handler is installed.
    pub fn is_set(&self) -> bool {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// The full set of handler slots a transport needs.
#[derive(Default)]
pub struct Handlers {
    pub patches: Handler<PatchHandler>,
    pub init_state: Handler<InitStateHandler>,
    pub disconnect: Handler<DisconnectHandler>,
    pub user_join: Handler<UserHandler>,
    pub user_update: Handler<UserHandler>,
    pub user_disconnect: Handler<UserIdHandler>,
}

impl Handlers {
    /// Deliver a patch. Without a handler the patch is dropped.
    pub fn patches(&self, patch: Patch) -> Result<()> {
        match self.patches.get() {
            Some(handler) => handler(patch),
            None => Ok(()),
        }
    }

    /// Deliver the initial snapshot.
    pub fn init_state(&self, snapshot: Map<String, Value>) -> Result<()> {
        match self.init_state.get() {
            Some(handler) => handler(snapshot),
            None => Ok(()),
        }
    }

    /// Signal a closed connection.
    pub fn disconnect(&self) {
        if let Some(handler) = self.disconnect.get() {
            handler();
        }
    }

    /// Deliver a presence event to the matching handler.
    pub fn presence(&self, message: crate::PresenceMessage) {
        use crate::PresenceMessage;

        match message {
            PresenceMessage::UserJoin(user) => {
                if let Some(handler) = self.user_join.get() {
                    handler(user);
                }
            }
            PresenceMessage::UserUpdate(user) => {
                if let Some(handler) = self.user_update.get() {
                    handler(user);
                }
            }
            PresenceMessage::UserDisconnect(id) => {
                if let Some(handler) = self.user_disconnect.get() {
                    handler(id);
                }
            }
        }
    }
}
