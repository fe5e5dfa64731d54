//! SyncStore - the replicated state container.
//!
//! A [`SyncStore`] owns one application state value `T` plus the sync
//! envelope (readiness, remote roster, local participant). Every local
//! mutation goes through the commit path, which diffs the filtered state
//! before and after and hands non-empty patches to the transport once the
//! store is ready. Patches and presence events from the transport are applied
//! to the same container.
//!
//! Concurrent edits to the same path are not merged: whichever patch is
//! applied last wins.

use crate::transport::Transport;
use crate::{error::Result, patch, Error, Patch, Roster, StateFilter, User};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

/// Construction-time settings for a [`SyncStore`].
pub struct SyncOptions {
    /// The channel to the other participants
    pub transport: Arc<dyn Transport>,
    /// Which parts of the state are synchronized
    pub filter: StateFilter,
    /// The local participant
    pub user: User,
}

impl SyncOptions {
    /// Options synchronizing the whole state.
    pub fn new(transport: Arc<dyn Transport>, user: User) -> Self {
        Self {
            transport,
            filter: StateFilter::All,
            user,
        }
    }

    /// Restrict synchronization to the parts selected by `filter`.
    pub fn with_filter(mut self, filter: StateFilter) -> Self {
        self.filter = filter;
        self
    }
}

/// Fields the store maintains alongside the application state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// True once the initial snapshot has been merged, false after a disconnect
    pub is_ready: bool,
    /// Remote participants in join order
    pub users: Vec<User>,
    /// The local participant
    #[serde(rename = "self")]
    pub self_user: User,
}

/// A point-in-time view of the application state and its envelope.
///
/// Serializes flat: the state's fields next to `isReady`, `users` and `self`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Synced<T> {
    #[serde(flatten)]
    pub state: T,
    #[serde(flatten)]
    pub envelope: Envelope,
}

impl<T> std::ops::Deref for Synced<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.state
    }
}

/// Handle returned by [`SyncStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener<T> = dyn Fn(&Synced<T>) + Send + Sync;

struct Container<T> {
    state: T,
    is_ready: bool,
    roster: Roster,
    self_user: User,
}

impl<T: Clone> Container<T> {
    fn snapshot(&self) -> Synced<T> {
        Synced {
            state: self.state.clone(),
            envelope: Envelope {
                is_ready: self.is_ready,
                users: self.roster.users().to_vec(),
                self_user: self.self_user.clone(),
            },
        }
    }
}

struct Shared<T> {
    container: Mutex<Container<T>>,
    transport: Arc<dyn Transport>,
    filter: StateFilter,
    listeners: Mutex<Vec<(SubscriptionId, Arc<Listener<T>>)>>,
    next_listener: AtomicU64,
}

/// The replicated state container.
///
/// Cloning yields another handle to the same store.
pub struct SyncStore<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for SyncStore<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> SyncStore<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    /// Create a store around `initial` and wire it to the transport.
    ///
    /// Handlers are installed before the transport is asked to connect, so a
    /// transport that delivers its snapshot immediately leaves the store ready
    /// on return.
    pub fn new(initial: T, options: SyncOptions) -> Result<Self> {
        let SyncOptions {
            transport,
            filter,
            user,
        } = options;

        let store = Self {
            shared: Arc::new(Shared {
                container: Mutex::new(Container {
                    state: initial,
                    is_ready: false,
                    roster: Roster::new(user.id.clone()),
                    self_user: user.clone(),
                }),
                transport: transport.clone(),
                filter,
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
            }),
        };

        store.wire(transport.as_ref());
        transport.connect(&user)?;

        tracing::debug!(user_id = %user.id, "Sync store created");
        Ok(store)
    }

    fn wire(&self, transport: &dyn Transport) {
        let weak = Arc::downgrade(&self.shared);
        transport.on_patches(Box::new(move |patch| match upgrade(&weak) {
            Some(store) => store.receive_patches(patch),
            None => Ok(()),
        }));

        let weak = Arc::downgrade(&self.shared);
        transport.on_init_state(Box::new(move |snapshot| match upgrade(&weak) {
            Some(store) => store.receive_init_state(snapshot),
            None => Ok(()),
        }));

        let weak = Arc::downgrade(&self.shared);
        transport.on_disconnect(Box::new(move || {
            if let Some(store) = upgrade(&weak) {
                store.receive_disconnect();
            }
        }));

        let weak = Arc::downgrade(&self.shared);
        transport.on_user_join(Box::new(move |user| {
            if let Some(store) = upgrade(&weak) {
                store.mutate(|c| c.roster.join(user));
            }
        }));

        let weak = Arc::downgrade(&self.shared);
        transport.on_user_update(Box::new(move |user| {
            if let Some(store) = upgrade(&weak) {
                store.mutate(|c| c.roster.update(user));
            }
        }));

        let weak = Arc::downgrade(&self.shared);
        transport.on_user_disconnect(Box::new(move |id| {
            if let Some(store) = upgrade(&weak) {
                store.mutate(|c| c.roster.leave(&id));
            }
        }));
    }

    // ========================================================================
    // Local mutation
    // ========================================================================

    /// Mutate the application state and replicate the change.
    ///
    /// The closure runs with the store locked; it must not call back into the
    /// store. React to changes from a subscription instead.
    pub fn commit<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut T),
    {
        self.commit_draft(|state, _| {
            f(state);
            Ok(())
        })
    }

    /// Shallow-merge a partial state object: each top-level field of
    /// `partial` overwrites the field of the same name.
    pub fn merge(&self, partial: Value) -> Result<()> {
        let Value::Object(fields) = partial else {
            return Err(Error::InvalidPartial(
                "partial state must be a JSON object".to_string(),
            ));
        };
        self.commit_draft(move |state, _| {
            let mut doc = serde_json::to_value(&*state)?;
            merge_fields(&mut doc, fields)?;
            *state = serde_json::from_value(doc)?;
            Ok(())
        })
    }

    /// Change the local participant record. Peers are told about it through
    /// the transport, whether or not the store is ready.
    pub fn update_self<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut User),
    {
        self.commit_draft(|_, user| {
            f(user);
            Ok(())
        })
    }

    fn commit_draft<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut T, &mut User) -> Result<()>,
    {
        let filter = &self.shared.filter;

        // Subscribers are notified only after the patch is handed to the
        // transport, so a commit made from a listener is sent after this one.
        let (outcome, snapshot) = self.mutate_quiet(|c| -> Result<_> {
            let before = serde_json::to_value(&c.state)?;
            let self_before = c.self_user.clone();

            f(&mut c.state, &mut c.self_user)?;

            let after = serde_json::to_value(&c.state)?;
            let patch = patch::generate(&filter.apply(&before), &filter.apply(&after));

            let changed_self = if c.self_user != self_before {
                let id = c.self_user.id.clone();
                c.roster.set_local_id(id);
                Some(c.self_user.clone())
            } else {
                None
            };

            Ok((patch, changed_self, c.is_ready))
        });

        let (patch, changed_self, ready) = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                self.notify_opt(snapshot);
                return Err(e);
            }
        };

        if !patch.is_empty() {
            if ready {
                tracing::debug!(ops = patch.len(), "Broadcasting local patch");
                if let Err(e) = self.shared.transport.broadcast_patches(patch) {
                    tracing::warn!(error = %e, "Failed to broadcast patch");
                }
            } else {
                tracing::debug!(ops = patch.len(), "Store not ready, patch kept local");
            }
        }

        if let Some(user) = changed_self {
            self.shared.transport.update_self(&user);
        }

        self.notify_opt(snapshot);
        Ok(())
    }

    // ========================================================================
    // Transport events
    // ========================================================================

    /// Apply a patch received from a peer.
    ///
    /// A patch that fails half-way leaves its earlier operations applied and
    /// returns the error.
    fn receive_patches(&self, patch: Patch) -> Result<()> {
        tracing::debug!(ops = patch.len(), "Applying remote patch");
        self.mutate(|c| -> Result<()> {
            let (doc, applied) = patch::apply_to(serde_json::to_value(&c.state)?, &patch);
            c.state = serde_json::from_value(doc)?;
            applied
        })
    }

    fn receive_init_state(&self, snapshot: Map<String, Value>) -> Result<()> {
        self.mutate(|c| -> Result<()> {
            let mut doc = serde_json::to_value(&c.state)?;
            merge_fields(&mut doc, snapshot)?;
            c.state =
                serde_json::from_value(doc).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;
            c.is_ready = true;
            Ok(())
        })?;
        tracing::info!("Initial state received, store ready");
        Ok(())
    }

    fn receive_disconnect(&self) {
        self.mutate(|c| c.is_ready = false);
        tracing::info!("Transport disconnected, store not ready");
    }

    /// Run `f` with the container locked, then notify subscribers.
    fn mutate<R>(&self, f: impl FnOnce(&mut Container<T>) -> R) -> R {
        let (result, snapshot) = self.mutate_quiet(f);
        self.notify_opt(snapshot);
        result
    }

    /// Run `f` with the container locked. Returns the snapshot subscribers
    /// should see, if there are any.
    fn mutate_quiet<R>(&self, f: impl FnOnce(&mut Container<T>) -> R) -> (R, Option<Synced<T>>) {
        let mut container = self.container();
        let result = f(&mut container);
        let snapshot = if self.has_listeners() {
            Some(container.snapshot())
        } else {
            None
        };
        (result, snapshot)
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Clone the current state and envelope.
    pub fn snapshot(&self) -> Synced<T> {
        self.container().snapshot()
    }

    /// Clone the current application state.
    pub fn state(&self) -> T {
        self.container().state.clone()
    }

    /// Read the current state without cloning it.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.container().state)
    }

    /// Whether the initial snapshot has been received on the current connection.
    pub fn is_ready(&self) -> bool {
        self.container().is_ready
    }

    /// Remote participants in join order.
    pub fn users(&self) -> Vec<User> {
        self.container().roster.users().to_vec()
    }

    /// The local participant.
    pub fn self_user(&self) -> User {
        self.container().self_user.clone()
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Call `listener` after every change, local or remote.
    ///
    /// Listeners run without the store locked and may commit.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&Synced<T>) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.shared.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners().push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    fn has_listeners(&self) -> bool {
        !self.listeners().is_empty()
    }

    fn notify_opt(&self, snapshot: Option<Synced<T>>) {
        if let Some(snapshot) = snapshot {
            self.notify(&snapshot);
        }
    }

    fn notify(&self, snapshot: &Synced<T>) {
        let listeners: Vec<Arc<Listener<T>>> = self
            .listeners()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            listener(snapshot);
        }
    }

    fn container(&self) -> MutexGuard<'_, Container<T>> {
        self.shared
            .container
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<(SubscriptionId, Arc<Listener<T>>)>> {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn upgrade<T>(weak: &Weak<Shared<T>>) -> Option<SyncStore<T>> {
    weak.upgrade().map(|shared| SyncStore { shared })
}

/// Overwrite top-level fields of an object document.
fn merge_fields(doc: &mut Value, fields: Map<String, Value>) -> Result<()> {
    match doc {
        Value::Object(object) => {
            object.extend(fields);
            Ok(())
        }
        _ => Err(Error::InvalidSnapshot(
            "state does not serialize to a JSON object".to_string(),
        )),
    }
}
