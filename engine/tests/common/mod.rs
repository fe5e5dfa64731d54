//! Shared test helpers.

#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex};
use tandem_engine::transport::{
    DisconnectHandler, Handlers, InitStateHandler, PatchHandler, UserHandler, UserIdHandler,
};
use tandem_engine::error::Result;
use tandem_engine::{Patch, PresenceMessage, SyncOptions, SyncStore, Transport, User};

/// The counter state used across scenarios.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    pub count: i64,
    #[serde(default)]
    pub secret: String,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            count: 0,
            secret: String::new(),
        }
    }
}

pub fn increment(store: &SyncStore<Counter>) {
    store.commit(|state| state.count += 1).unwrap();
}

pub fn decrement(store: &SyncStore<Counter>) {
    store.commit(|state| state.count -= 1).unwrap();
}

pub fn reset(store: &SyncStore<Counter>) {
    store.merge(serde_json::json!({"count": 0})).unwrap();
}

/// A transport driven by the test: it records what the store sends and lets
/// the test fire inbound events by hand.
#[derive(Default)]
pub struct ManualTransport {
    handlers: Handlers,
    pub connected_as: Mutex<Option<User>>,
    pub broadcasts: Mutex<Vec<Patch>>,
    pub self_updates: Mutex<Vec<User>>,
}

impl ManualTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deliver_init(&self, snapshot: Value) -> Result<()> {
        let snapshot: Map<String, Value> = serde_json::from_value(snapshot)?;
        self.handlers.init_state(snapshot)
    }

    pub fn deliver_patch(&self, patch: Value) -> Result<()> {
        self.handlers.patches(serde_json::from_value(patch)?)
    }

    pub fn emit(&self, message: PresenceMessage) {
        self.handlers.presence(message);
    }

    pub fn drop_connection(&self) {
        self.handlers.disconnect();
    }

    pub fn broadcast_count(&self) -> usize {
        self.broadcasts.lock().unwrap().len()
    }

    pub fn sent(&self) -> Vec<Patch> {
        self.broadcasts.lock().unwrap().clone()
    }
}

impl Transport for ManualTransport {
    fn connect(&self, user: &User) -> Result<()> {
        *self.connected_as.lock().unwrap() = Some(user.clone());
        Ok(())
    }

    fn broadcast_patches(&self, patch: Patch) -> Result<()> {
        self.broadcasts.lock().unwrap().push(patch);
        Ok(())
    }

    fn update_self(&self, user: &User) {
        self.self_updates.lock().unwrap().push(user.clone());
    }

    fn on_patches(&self, handler: Box<PatchHandler>) {
        self.handlers.patches.set(handler);
    }

    fn on_init_state(&self, handler: Box<InitStateHandler>) {
        self.handlers.init_state.set(handler);
    }

    fn on_disconnect(&self, handler: Box<DisconnectHandler>) {
        self.handlers.disconnect.set(handler);
    }

    fn on_user_join(&self, handler: Box<UserHandler>) {
        self.handlers.user_join.set(handler);
    }

    fn on_user_update(&self, handler: Box<UserHandler>) {
        self.handlers.user_update.set(handler);
    }

    fn on_user_disconnect(&self, handler: Box<UserIdHandler>) {
        self.handlers.user_disconnect.set(handler);
    }
}

/// A counter store on a manual transport.
pub fn manual_store(id: &str) -> (SyncStore<Counter>, Arc<ManualTransport>) {
    let transport = ManualTransport::new();
    let store = SyncStore::new(
        Counter::new(),
        SyncOptions::new(transport.clone(), User::new(id)),
    )
    .unwrap();
    (store, transport)
}
