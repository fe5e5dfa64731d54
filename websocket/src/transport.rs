//! The WebSocket transport.
//!
//! One background task per connection attempt owns the socket. Outbound
//! frames reach it through an unbounded queue, so `broadcast_patches` and
//! `update_self` never block the caller; frames queued while the socket is
//! still opening are flushed once it is up.

use crate::config::{connect_url, WebSocketConfig};
use crate::error::{Error, Result};
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tandem_engine::protocol::{self, InboundFrame, PresenceMessage};
use tandem_engine::transport::{
    DisconnectHandler, Handlers, InitStateHandler, PatchHandler, UserHandler, UserIdHandler,
};
use tandem_engine::{Patch, Transport, User};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection lifecycle as seen by the local participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

struct Status {
    state: ConnectionState,
    /// Bumped by every `connect` and `close`; a task only acts while its generation is current.
    generation: u64,
    self_user: Option<User>,
    outgoing: Option<mpsc::UnboundedSender<String>>,
}

struct Shared {
    config: WebSocketConfig,
    endpoint: Url,
    handlers: Handlers,
    status: Mutex<Status>,
}

impl Shared {
    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` only if `generation` still owns the connection.
    fn with_current<R>(&self, generation: u64, f: impl FnOnce(&mut Status) -> R) -> Option<R> {
        let mut status = self.status();
        (status.generation == generation).then(|| f(&mut status))
    }

    fn enqueue(&self, frame: String) -> tandem_engine::error::Result<()> {
        match &self.status().outgoing {
            Some(outgoing) => outgoing
                .send(frame)
                .map_err(|_| tandem_engine::Error::NotConnected),
            None => Err(tandem_engine::Error::NotConnected),
        }
    }

    /// Route one inbound text frame. Returns false when the connection must be closed.
    fn receive(&self, text: &str, received_init: &mut bool) -> bool {
        if !*received_init {
            *received_init = true;
            return match protocol::decode_snapshot(text) {
                Ok(snapshot) => {
                    if let Err(e) = self.handlers.init_state(snapshot) {
                        tracing::warn!(error = %e, "Initial state rejected");
                    }
                    true
                }
                Err(e) => {
                    tracing::error!(error = %e, "Malformed initial state, closing connection");
                    false
                }
            };
        }

        match InboundFrame::decode(text) {
            Ok(InboundFrame::Presence(message)) => self.handlers.presence(message),
            Ok(InboundFrame::Patch(patch)) => {
                if let Err(e) = self.handlers.patches(patch) {
                    tracing::warn!(error = %e, "Failed to apply remote patch");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Dropping malformed frame"),
        }
        true
    }
}

/// A [`Transport`] speaking the relay's WebSocket protocol.
///
/// Must be connected from within a tokio runtime.
pub struct WebSocketTransport {
    shared: Arc<Shared>,
}

impl WebSocketTransport {
    /// Validate the configuration. No connection is made until [`Transport::connect`].
    pub fn new(config: WebSocketConfig) -> Result<Self> {
        let endpoint = config.endpoint()?;
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                endpoint,
                handlers: Handlers::default(),
                status: Mutex::new(Status {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    self_user: None,
                    outgoing: None,
                }),
            }),
        })
    }

    /// The project endpoint, without the user query.
    pub fn endpoint(&self) -> &Url {
        &self.shared.endpoint
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.status().state
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Close the connection and stop reconnecting.
    ///
    /// The disconnect handler fires if a connection was open or opening.
    pub fn close(&self) {
        if self.shutdown() {
            tracing::info!(project_id = %self.shared.config.project_id, "WebSocket closed");
            self.shared.handlers.disconnect();
        }
    }

    /// Reset to `Disconnected`, releasing the running task. Returns whether anything was running.
    fn shutdown(&self) -> bool {
        let mut status = self.shared.status();
        let was_running = status.state != ConnectionState::Disconnected;
        status.generation += 1;
        status.state = ConnectionState::Disconnected;
        status.outgoing = None;
        was_running
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Transport for WebSocketTransport {
    fn connect(&self, user: &User) -> tandem_engine::error::Result<()> {
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let mut status = self.shared.status();
        status.self_user = Some(user.clone());
        if status.state != ConnectionState::Disconnected {
            tracing::debug!("Connect requested while already connected");
            return Ok(());
        }

        let (outgoing, queue) = mpsc::unbounded_channel();
        status.generation += 1;
        status.state = ConnectionState::Connecting;
        status.outgoing = Some(outgoing);
        let generation = status.generation;
        drop(status);

        runtime.spawn(run(self.shared.clone(), generation, queue));
        Ok(())
    }

    fn broadcast_patches(&self, patch: Patch) -> tandem_engine::error::Result<()> {
        let frame = patch.to_json()?;
        self.shared.enqueue(frame)
    }

    fn update_self(&self, user: &User) {
        self.shared.status().self_user = Some(user.clone());

        let frame = match PresenceMessage::UserUpdate(user.clone()).encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to encode self update");
                return;
            }
        };
        if self.shared.enqueue(frame).is_err() {
            tracing::debug!(user_id = %user.id, "Not connected, self update kept for next connect");
        }
    }

    fn on_patches(&self, handler: Box<PatchHandler>) {
        self.shared.handlers.patches.set(handler);
    }

    fn on_init_state(&self, handler: Box<InitStateHandler>) {
        self.shared.handlers.init_state.set(handler);
    }

    fn on_disconnect(&self, handler: Box<DisconnectHandler>) {
        self.shared.handlers.disconnect.set(handler);
    }

    fn on_user_join(&self, handler: Box<UserHandler>) {
        self.shared.handlers.user_join.set(handler);
    }

    fn on_user_update(&self, handler: Box<UserHandler>) {
        self.shared.handlers.user_update.set(handler);
    }

    fn on_user_disconnect(&self, handler: Box<UserIdHandler>) {
        self.shared.handlers.user_disconnect.set(handler);
    }
}

/// Connection task: dial, run the session, and redial while reconnecting is enabled.
async fn run(shared: Arc<Shared>, generation: u64, mut queue: mpsc::UnboundedReceiver<String>) {
    let project_id = shared.config.project_id.clone();

    loop {
        if let Some(socket) = open(&shared, generation).await {
            tracing::info!(%project_id, "WebSocket connected");
            session(&shared, socket, &mut queue).await;

            let current = shared
                .with_current(generation, |status| status.state = ConnectionState::Connecting)
                .is_some();
            if !current {
                return;
            }
            tracing::info!(%project_id, "WebSocket disconnected");
            shared.handlers.disconnect();
        }

        match shared.config.reconnect_interval {
            Some(interval) if shared.with_current(generation, |_| ()).is_some() => {
                tracing::debug!(%project_id, ?interval, "Reconnecting");
                tokio::time::sleep(interval).await;
            }
            _ => {
                shared.with_current(generation, |status| {
                    status.state = ConnectionState::Disconnected;
                    status.outgoing = None;
                });
                return;
            }
        }
    }
}

async fn open(shared: &Shared, generation: u64) -> Option<Socket> {
    let user = shared.with_current(generation, |status| status.self_user.clone())?;
    let url = match connect_url(&shared.endpoint, user.as_ref()) {
        Ok(url) => url,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build connect URL");
            return None;
        }
    };

    match connect_async(url.as_str()).await {
        Ok((socket, _)) => shared
            .with_current(generation, |status| status.state = ConnectionState::Connected)
            .map(|_| socket),
        Err(e) => {
            tracing::warn!(endpoint = %shared.endpoint, error = %e, "WebSocket connect failed");
            None
        }
    }
}

/// Pump frames both ways until either side closes.
async fn session(shared: &Shared, socket: Socket, queue: &mut mpsc::UnboundedReceiver<String>) {
    let (mut sink, mut source) = socket.split();
    let mut received_init = false;

    loop {
        tokio::select! {
            frame = queue.recv() => match frame {
                Some(text) => {
                    if let Err(e) = sink.send(Message::text(text)).await {
                        tracing::warn!(error = %e, "WebSocket send failed");
                        return;
                    }
                }
                // Every sender is gone: the transport was closed or dropped.
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
            },
            message = source.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if !shared.receive(text.as_str(), &mut received_init) {
                        let _ = sink.send(Message::Close(None)).await;
                        return;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::debug!(?frame, "Peer closed WebSocket");
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "WebSocket read failed");
                    return;
                }
                None => return,
            },
        }
    }
}
