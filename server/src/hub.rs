//! Per-project relay hubs.
//!
//! A [`ProjectHub`] holds one project's document and its live connections.
//! Every frame a hub sends goes through the connection's unbounded queue, so
//! hub methods never await and may be called with the document locked. That
//! lock orders snapshot delivery against patch fan-out: a newcomer receives
//! either the document before a patch plus the patch, or the document after it.

use crate::error::AppError;
use crate::storage::{Document, SnapshotStorage, StorageError};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tandem_engine::{patch, Patch, PatchOperation, PresenceMessage, ProjectId, User};
use tokio::sync::mpsc;

/// Sender for outbound text frames.
pub type FrameSender = mpsc::UnboundedSender<String>;

/// A single WebSocket connection.
#[derive(Debug)]
struct Connection {
    user: User,
    sender: FrameSender,
}

/// One project's document and the connections editing it.
#[derive(Debug)]
pub struct ProjectHub {
    project_id: ProjectId,
    document: Mutex<Document>,
    connections: DashMap<String, Connection>,
}

impl ProjectHub {
    pub fn new(project_id: impl Into<ProjectId>, document: Document) -> Self {
        Self {
            project_id: project_id.into(),
            document: Mutex::new(document),
            connections: DashMap::new(),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    fn lock(&self) -> MutexGuard<'_, Document> {
        self.document.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current document.
    pub fn document(&self) -> Document {
        self.lock().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Users currently connected, in no particular order.
    pub fn users(&self) -> Vec<User> {
        self.connections
            .iter()
            .map(|entry| entry.value().user.clone())
            .collect()
    }

    /// Register a connection.
    ///
    /// The newcomer first gets the document, then one `USER_JOIN` per user
    /// already present; everyone else gets a `USER_JOIN` for the newcomer.
    /// Returns the connection id.
    pub fn join(&self, user: User, sender: FrameSender) -> crate::error::Result<String> {
        let conn_id = uuid::Uuid::new_v4().to_string();
        let announce = PresenceMessage::UserJoin(user.clone()).encode()?;

        let document = self.lock();
        let snapshot = serde_json::to_string(&*document).map_err(tandem_engine::Error::from)?;
        let _ = sender.send(snapshot);

        for entry in self.connections.iter() {
            let existing = PresenceMessage::UserJoin(entry.value().user.clone()).encode()?;
            let _ = sender.send(existing);
        }

        self.broadcast_except(&conn_id, &announce);
        self.connections
            .insert(conn_id.clone(), Connection { user, sender });
        drop(document);

        tracing::info!(
            project_id = %self.project_id,
            conn_id = %conn_id,
            connections = self.connection_count(),
            "Client joined project"
        );
        Ok(conn_id)
    }

    /// Replace a connection's user record and tell the others.
    pub fn update_user(&self, conn_id: &str, user: User) -> crate::error::Result<usize> {
        let frame = PresenceMessage::UserUpdate(user.clone()).encode()?;
        match self.connections.get_mut(conn_id) {
            Some(mut connection) => connection.user = user,
            None => return Ok(0),
        }
        Ok(self.broadcast_except(conn_id, &frame))
    }

    /// Forward a patch frame from `conn_id` to the others and apply it to the
    /// hub document.
    ///
    /// The frame is always forwarded. The document is updated all-or-nothing:
    /// if any operation fails it is left untouched. The document of a new
    /// project is `{}`, so a `replace` of a missing object member is stored
    /// as an `add`.
    pub fn apply_patch(&self, conn_id: &str, frame: &str, patch: &Patch) -> PatchOutcome {
        let mut document = self.lock();
        let applied = apply_upserting(&document, patch).map(|updated| *document = updated);
        let sent = self.broadcast_except(conn_id, frame);
        PatchOutcome { sent, applied }
    }

    /// Remove a connection and announce its departure. Returns the departed user.
    pub fn leave(&self, conn_id: &str) -> Option<User> {
        let (_, connection) = self.connections.remove(conn_id)?;
        match PresenceMessage::UserDisconnect(connection.user.id.clone()).encode() {
            Ok(frame) => {
                self.broadcast_except(conn_id, &frame);
            }
            Err(e) => tracing::error!(error = %e, "Failed to encode disconnect"),
        }

        tracing::info!(
            project_id = %self.project_id,
            conn_id = %conn_id,
            user_id = %connection.user.id,
            connections = self.connection_count(),
            "Client left project"
        );
        Some(connection.user)
    }

    /// Queue `frame` for every connection except `sender_conn_id`.
    ///
    /// Returns the number of connections that received the frame.
    pub fn broadcast_except(&self, sender_conn_id: &str, frame: &str) -> usize {
        let mut sent_count = 0;

        for entry in self.connections.iter() {
            if entry.key() != sender_conn_id && entry.value().sender.send(frame.to_string()).is_ok() {
                sent_count += 1;
            }
        }

        tracing::debug!(
            project_id = %self.project_id,
            sender = %sender_conn_id,
            recipients = sent_count,
            "Broadcast frame"
        );

        sent_count
    }
}

/// What happened to a relayed patch.
#[derive(Debug)]
pub struct PatchOutcome {
    /// Connections the frame was queued for
    pub sent: usize,
    /// Whether the hub document took the patch
    pub applied: crate::error::Result<()>,
}

fn apply_upserting(document: &Document, patch: &Patch) -> crate::error::Result<Document> {
    let mut scratch = Value::Object(document.clone());
    let mut effective = Patch::new();
    for op in patch {
        let op = upsert(op, &scratch);
        // Later operations must see the effect of earlier ones.
        let _ = patch::apply(&mut scratch, &Patch::from(vec![op.clone()]));
        effective.push(op);
    }

    let mut updated = Value::Object(document.clone());
    patch::apply(&mut updated, &effective)?;
    match updated {
        Value::Object(object) => Ok(object),
        _ => Err(AppError::BadRequest(
            "patch must leave the document an object".to_string(),
        )),
    }
}

/// Turn a `replace` whose parent object lacks the member into an `add`.
fn upsert(op: &PatchOperation, doc: &Value) -> PatchOperation {
    if let PatchOperation::Replace { path, value } = op {
        let parent = path.rfind('/').map(|split| &path[..split]);
        let key = patch::parse_pointer(path).ok().and_then(|tokens| tokens.last().cloned());
        if let (Some(parent), Some(key)) = (parent, key) {
            if let Some(Value::Object(object)) = doc.pointer(parent) {
                if !object.contains_key(&key) {
                    return PatchOperation::Add {
                        path: path.clone(),
                        value: value.clone(),
                    };
                }
            }
        }
    }
    op.clone()
}

/// All hubs, keyed by project id. Hubs live for the lifetime of the process.
pub struct HubRegistry {
    hubs: DashMap<ProjectId, Arc<ProjectHub>>,
    storage: Arc<dyn SnapshotStorage>,
}

impl HubRegistry {
    pub fn new(storage: Arc<dyn SnapshotStorage>) -> Self {
        Self {
            hubs: DashMap::new(),
            storage,
        }
    }

    pub fn new_shared(storage: Arc<dyn SnapshotStorage>) -> Arc<Self> {
        Arc::new(Self::new(storage))
    }

    /// Get the hub for `project_id`, loading its document on first use.
    ///
    /// A project with no stored document, or one that fails to load, starts from `{}`.
    pub async fn open(&self, project_id: &str) -> Result<Arc<ProjectHub>, StorageError> {
        crate::storage::validate_project_id(project_id)?;

        if let Some(hub) = self.hubs.get(project_id) {
            return Ok(hub.clone());
        }

        let document = match self.storage.load(project_id).await {
            Ok(Some(document)) => {
                tracing::info!(%project_id, "Loaded stored document");
                document
            }
            Ok(None) => {
                tracing::info!(%project_id, "No stored document, starting fresh");
                Document::new()
            }
            Err(e) => {
                tracing::warn!(%project_id, error = %e, "Failed to load document, starting fresh");
                Document::new()
            }
        };

        // Another connection may have created the hub while we were loading.
        let hub = self
            .hubs
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(ProjectHub::new(project_id, document)))
            .clone();
        Ok(hub)
    }

    pub fn get(&self, project_id: &str) -> Option<Arc<ProjectHub>> {
        self.hubs.get(project_id).map(|hub| hub.clone())
    }

    pub fn hub_count(&self) -> usize {
        self.hubs.len()
    }

    /// Write a hub's document to storage.
    pub async fn persist(&self, hub: &ProjectHub) -> Result<(), StorageError> {
        let document = hub.document();
        self.storage.save(hub.project_id(), &document).await?;
        tracing::debug!(project_id = %hub.project_id(), "Document persisted");
        Ok(())
    }

    /// Write every hub's document to storage. Returns how many failed.
    pub async fn persist_all(&self) -> usize {
        let hubs: Vec<Arc<ProjectHub>> = self.hubs.iter().map(|e| e.value().clone()).collect();
        let mut failed = 0;
        for hub in hubs {
            if let Err(e) = self.persist(&hub).await {
                tracing::error!(project_id = %hub.project_id(), error = %e, "Failed to persist document");
                failed += 1;
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn connect(hub: &ProjectHub, id: &str) -> (String, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = hub.join(User::new(id), tx).unwrap();
        (conn_id, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    fn patch(value: Value) -> Patch {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn join_sends_document_then_presence() {
        let hub = ProjectHub::new("p", Document::new());
        let (_a, mut rx_a) = connect(&hub, "a");
        assert_eq!(drain(&mut rx_a), vec![json!({})]);

        let (_b, mut rx_b) = connect(&hub, "b");
        assert_eq!(
            drain(&mut rx_b),
            vec![
                json!({}),
                json!({"type": "USER_JOIN", "payload": {"id": "a"}})
            ]
        );
        assert_eq!(
            drain(&mut rx_a),
            vec![json!({"type": "USER_JOIN", "payload": {"id": "b"}})]
        );
        assert_eq!(hub.connection_count(), 2);
    }

    #[test]
    fn patches_are_applied_and_forwarded_verbatim() {
        let hub = ProjectHub::new("p", Document::new());
        let (a, mut rx_a) = connect(&hub, "a");
        let (_b, mut rx_b) = connect(&hub, "b");
        drain(&mut rx_a);
        drain(&mut rx_b);

        let frame = r#"[{"op":"add","path":"/count","value":1}]"#;
        let outcome = hub.apply_patch(&a, frame, &patch(json!([{"op": "add", "path": "/count", "value": 1}])));

        assert_eq!(outcome.sent, 1);
        assert!(outcome.applied.is_ok());
        assert_eq!(hub.document()["count"], json!(1));
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), frame);
    }

    #[test]
    fn replace_on_fresh_document_is_stored() {
        let hub = ProjectHub::new("p", Document::new());
        let (a, _rx_a) = connect(&hub, "a");
        let (_b, mut rx_b) = connect(&hub, "b");
        drain(&mut rx_b);

        let frame = r#"[{"op":"replace","path":"/count","value":1}]"#;
        let outcome = hub.apply_patch(
            &a,
            frame,
            &patch(json!([
                {"op": "replace", "path": "/count", "value": 1},
                {"op": "replace", "path": "/count", "value": 2},
                {"op": "replace", "path": "/meta", "value": {"tags": []}},
                {"op": "replace", "path": "/meta/title", "value": "t"}
            ])),
        );

        assert!(outcome.applied.is_ok());
        assert_eq!(outcome.sent, 1);
        assert_eq!(rx_b.try_recv().unwrap(), frame);
        assert_eq!(
            Value::Object(hub.document()),
            json!({"count": 2, "meta": {"tags": [], "title": "t"}})
        );
    }

    #[test]
    fn invalid_patch_is_forwarded_but_not_stored() {
        let hub = ProjectHub::new("p", Document::new());
        let (a, _rx_a) = connect(&hub, "a");
        let (_b, mut rx_b) = connect(&hub, "b");
        drain(&mut rx_b);

        let bad = patch(json!([
            {"op": "add", "path": "/x", "value": 1},
            {"op": "remove", "path": "/missing"}
        ]));
        let outcome = hub.apply_patch(&a, "[]", &bad);
        assert!(matches!(
            outcome.applied,
            Err(AppError::Engine(tandem_engine::Error::PathNotFound { index: 1, .. }))
        ));
        assert!(hub.document().is_empty());
        assert_eq!(outcome.sent, 1);
        assert_eq!(rx_b.try_recv().unwrap(), "[]");

        let root = patch(json!([{"op": "replace", "path": "", "value": [1]}]));
        assert!(hub.apply_patch(&a, "[]", &root).applied.is_err());
        assert!(hub.document().is_empty());

        let deep = patch(json!([{"op": "replace", "path": "/a/b", "value": 1}]));
        assert!(hub.apply_patch(&a, "[]", &deep).applied.is_err());
        assert!(hub.document().is_empty());
    }

    #[test]
    fn update_and_leave_are_announced() {
        let hub = ProjectHub::new("p", Document::new());
        let (_a, mut rx_a) = connect(&hub, "a");
        let (b, mut rx_b) = connect(&hub, "b");
        drain(&mut rx_a);
        drain(&mut rx_b);

        hub.update_user(&b, User::new("b").with_field("name", "Bo"))
            .unwrap();
        assert_eq!(
            drain(&mut rx_a),
            vec![json!({"type": "USER_UPDATE", "payload": {"id": "b", "name": "Bo"}})]
        );

        assert_eq!(hub.leave(&b).map(|u| u.id), Some("b".to_string()));
        assert_eq!(hub.leave(&b), None);
        assert_eq!(
            drain(&mut rx_a),
            vec![json!({"type": "USER_DISCONNECT", "payload": "b"})]
        );
        assert_eq!(hub.users(), vec![User::new("a")]);
        assert_eq!(hub.update_user("gone", User::new("x")).unwrap(), 0);
    }

    #[tokio::test]
    async fn registry_loads_and_persists() {
        let storage = Arc::new(MemoryStorage::new());
        let stored = json!({"count": 7}).as_object().cloned().unwrap();
        storage.save("p", &stored).await.unwrap();

        let registry = HubRegistry::new(storage.clone());
        let hub = registry.open("p").await.unwrap();
        assert_eq!(hub.document(), stored);
        assert!(Arc::ptr_eq(&hub, &registry.open("p").await.unwrap()));

        let fresh = registry.open("q").await.unwrap();
        assert!(fresh.document().is_empty());
        assert_eq!(registry.hub_count(), 2);

        let (a, _rx) = connect(&fresh, "a");
        assert!(fresh
            .apply_patch(&a, "", &patch(json!([{"op": "add", "path": "/n", "value": 1}])))
            .applied
            .is_ok());
        assert_eq!(registry.persist_all().await, 0);
        assert_eq!(storage.load("q").await.unwrap().unwrap()["n"], json!(1));
    }

    #[tokio::test]
    async fn registry_rejects_bad_ids() {
        let registry = HubRegistry::new(Arc::new(MemoryStorage::new()));
        assert!(matches!(
            registry.open("../x").await,
            Err(StorageError::InvalidProjectId(_))
        ));
        assert_eq!(registry.hub_count(), 0);
    }
}
