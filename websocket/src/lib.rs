//! # Tandem WebSocket
//!
//! A [`Transport`](tandem_engine::Transport) that connects a
//! [`SyncStore`](tandem_engine::SyncStore) to a Tandem relay over WebSocket.
//!
//! Each store gets one connection to `<base_url>/<project_id>?user=<json>`.
//! The first frame the relay sends is the current document; after that the
//! relay forwards patches and presence events from the other participants.
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde::{Deserialize, Serialize};
//! use tandem_engine::{SyncOptions, SyncStore, User};
//! use tandem_websocket::{WebSocketConfig, WebSocketTransport};
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct Board {
//!     title: String,
//! }
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = WebSocketConfig::new("board-1").with_base_url("ws://localhost:8080/ws");
//! let transport = Arc::new(WebSocketTransport::new(config)?);
//! let store = SyncStore::new(
//!     Board { title: String::new() },
//!     SyncOptions::new(transport, User::new("alice")),
//! )?;
//! store.commit(|board| board.title = "Roadmap".into())?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod transport;

pub use config::{WebSocketConfig, DEFAULT_BASE_URL};
pub use error::{Error, Result};
pub use transport::{ConnectionState, WebSocketTransport};
