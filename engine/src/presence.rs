//! Participants and the roster of connected peers.

use crate::UserId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A participant. Only `id` is required; everything else rides along in `fields`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Stable identity, unique among connected participants
    pub id: UserId,
    /// Additional profile data (name, color, cursor, ...)
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl User {
    /// Create a user with no extra fields.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Get an extra field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Set an extra field.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }
}

/// Remote participants currently known to be connected, in join order.
///
/// Never holds two entries with the same id and never holds the local user.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Roster {
    local_id: UserId,
    users: Vec<User>,
}

impl Roster {
    /// Create an empty roster for the local participant `local_id`.
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            users: Vec::new(),
        }
    }

    /// Id of the local participant, which is never admitted.
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Change the local participant's id, evicting any remote entry with it.
    pub fn set_local_id(&mut self, id: impl Into<String>) {
        self.local_id = id.into();
        let local_id = &self.local_id;
        self.users.retain(|user| &user.id != local_id);
    }

    /// Add a joining user. Returns false if the id is already present or is the local id.
    pub fn join(&mut self, user: User) -> bool {
        if user.id == self.local_id || self.contains(&user.id) {
            return false;
        }
        self.users.push(user);
        true
    }

    /// Replace the entry with the same id in place. Unknown ids are ignored.
    pub fn update(&mut self, user: User) -> bool {
        match self.users.iter_mut().find(|existing| existing.id == user.id) {
            Some(existing) => {
                *existing = user;
                true
            }
            None => false,
        }
    }

    /// Remove every entry with `id`. Returns how many were removed.
    pub fn leave(&mut self, id: &str) -> usize {
        let before = self.users.len();
        self.users.retain(|user| user.id != id);
        before - self.users.len()
    }

    /// Look up a user by id.
    pub fn get(&self, id: &str) -> Option<&User> {
        self.users.iter().find(|user| user.id == id)
    }

    /// Whether a user with `id` is present.
    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Number of remote users.
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Whether no remote users are connected.
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    /// Users in join order.
    pub fn users(&self) -> &[User] {
        &self.users
    }

    /// Iterate in join order.
    pub fn iter(&self) -> std::slice::Iter<'_, User> {
        self.users.iter()
    }
}
