//! # Tandem Engine
//!
//! Keeps an application state value consistent across processes that each
//! hold a local copy.
//!
//! Local code mutates state through a [`SyncStore`]. The store turns every
//! mutation into a JSON patch, ships it through a [`Transport`], and applies
//! patches arriving from peers to the same container. Business logic stays
//! plain Rust: a counter is still `state.count += 1`.
//!
//! ## Design Principles
//!
//! - **No IO**: The engine never touches the network; transports do
//! - **Last applied wins**: No ordering protocol or merge semantics; overlapping
//!   concurrent edits resolve to whichever patch is applied last
//! - **Deterministic diffs**: The same pair of states always yields the same patch
//!
//! ## Core Concepts
//!
//! ### Patches
//!
//! [`patch::generate`] diffs two JSON values into an RFC 6902 [`Patch`];
//! [`patch::apply`] applies one in order, without rollback on failure.
//!
//! ### State Filters
//!
//! A [`StateFilter`] selects the parts of the state that are synchronized.
//! Anything outside it stays local.
//!
//! ### Presence
//!
//! Each store knows its own [`User`] and keeps a [`Roster`] of remote users,
//! fed by the transport's join/update/disconnect events.
//!
//! ### Readiness
//!
//! A store is ready once the transport has delivered the initial snapshot.
//! Local changes made before that are not broadcast.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use serde::{Deserialize, Serialize};
//! use serde_json::json;
//! use tandem_engine::{MockChannel, MockTransport, SyncOptions, SyncStore, User};
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct Counter {
//!     count: i64,
//! }
//!
//! // 1. Two peers on the same in-process channel
//! let channel = MockChannel::new();
//! let open = |id: &str| {
//!     let transport = Arc::new(MockTransport::from_value(&channel, json!({})).unwrap());
//!     SyncStore::new(Counter { count: 0 }, SyncOptions::new(transport, User::new(id))).unwrap()
//! };
//! let alice = open("alice");
//! let bob = open("bob");
//!
//! // 2. Mutate one of them
//! alice.commit(|state| state.count += 1).unwrap();
//!
//! // 3. Both see the change
//! assert_eq!(bob.state().count, 1);
//! assert!(bob.is_ready());
//! ```

pub mod error;
pub mod filter;
pub mod mock;
pub mod patch;
pub mod presence;
pub mod protocol;
pub mod store;
pub mod transport;

// Re-export main types at crate root
pub use error::Error;
pub use filter::StateFilter;
pub use mock::{MockChannel, MockTransport};
pub use patch::{Patch, PatchOperation};
pub use presence::{Roster, User};
pub use protocol::{InboundFrame, PresenceMessage};
pub use store::{Envelope, SubscriptionId, SyncOptions, SyncStore, Synced};
pub use transport::{Handler, Handlers, Transport};

/// Type aliases for clarity
pub type UserId = String;
pub type ProjectId = String;
