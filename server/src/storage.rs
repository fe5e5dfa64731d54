//! Project document persistence.
//!
//! The relay keeps each project's document in memory and writes it out when a
//! participant leaves. Only the latest document is stored; patch history is not.

use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Project document as stored: always a JSON object.
pub type Document = Map<String, Value>;

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid project id: {0:?}")]
    InvalidProjectId(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Where project documents live between sessions.
pub trait SnapshotStorage: Send + Sync {
    /// Load a project's document. `Ok(None)` means the project is new.
    fn load<'a>(&'a self, project_id: &'a str) -> BoxFuture<'a, Result<Option<Document>>>;

    /// Replace a project's stored document.
    fn save<'a>(&'a self, project_id: &'a str, document: &'a Document) -> BoxFuture<'a, Result<()>>;

    /// Forget a project. Deleting an unknown project is not an error.
    fn delete<'a>(&'a self, project_id: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// Project ids become file names, so only plain names are accepted.
pub fn validate_project_id(project_id: &str) -> Result<()> {
    let valid = !project_id.is_empty()
        && project_id.len() <= 128
        && project_id != "."
        && project_id != ".."
        && project_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidProjectId(project_id.to_string()))
    }
}

// ============================================================================
// File system
// ============================================================================

/// One `<dir>/<project>.json` file per project.
#[derive(Debug, Clone)]
pub struct FileSystemStorage {
    dir: PathBuf,
}

impl FileSystemStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, project_id: &str) -> Result<PathBuf> {
        validate_project_id(project_id)?;
        Ok(self.dir.join(format!("{}.json", project_id)))
    }
}

impl SnapshotStorage for FileSystemStorage {
    fn load<'a>(&'a self, project_id: &'a str) -> BoxFuture<'a, Result<Option<Document>>> {
        Box::pin(async move {
            let path = self.path(project_id)?;
            match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    fn save<'a>(&'a self, project_id: &'a str, document: &'a Document) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let path = self.path(project_id)?;
            let bytes = serde_json::to_vec(document)?;

            tokio::fs::create_dir_all(&self.dir).await?;
            // Write then rename so readers never see a half-written file.
            let tmp = path.with_extension("json.tmp");
            tokio::fs::write(&tmp, bytes).await?;
            tokio::fs::rename(&tmp, &path).await?;
            Ok(())
        })
    }

    fn delete<'a>(&'a self, project_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let path = self.path(project_id)?;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        })
    }
}

// ============================================================================
// In memory
// ============================================================================

/// Keeps documents in process memory. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    documents: DashMap<String, Document>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

impl SnapshotStorage for MemoryStorage {
    fn load<'a>(&'a self, project_id: &'a str) -> BoxFuture<'a, Result<Option<Document>>> {
        Box::pin(async move {
            validate_project_id(project_id)?;
            Ok(self.documents.get(project_id).map(|doc| doc.clone()))
        })
    }

    fn save<'a>(&'a self, project_id: &'a str, document: &'a Document) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            validate_project_id(project_id)?;
            self.documents
                .insert(project_id.to_string(), document.clone());
            Ok(())
        })
    }

    fn delete<'a>(&'a self, project_id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.documents.remove(project_id);
            Ok(())
        })
    }
}
