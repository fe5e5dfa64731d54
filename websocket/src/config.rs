//! Connection settings.

use crate::error::{Error, Result};
use std::time::Duration;
use tandem_engine::{ProjectId, User};
use url::Url;

/// Default relay address, matching the server's default bind.
pub const DEFAULT_BASE_URL: &str = "ws://localhost:8080/ws";

/// Settings for a [`WebSocketTransport`](crate::WebSocketTransport).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketConfig {
    /// Channel shared by every participant of the same document
    pub project_id: ProjectId,
    /// Relay address; the project id is appended as a path segment
    pub base_url: String,
    /// Wait between reconnect attempts. `None` disables reconnecting.
    pub reconnect_interval: Option<Duration>,
}

impl WebSocketConfig {
    pub fn new(project_id: impl Into<ProjectId>) -> Self {
        Self {
            project_id: project_id.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            reconnect_interval: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_reconnect(mut self, interval: Duration) -> Self {
        self.reconnect_interval = Some(interval);
        self
    }

    /// The project endpoint: base address, trailing slash trimmed, project id appended.
    pub fn endpoint(&self) -> Result<Url> {
        if self.project_id.is_empty() {
            return Err(Error::EmptyProjectId);
        }

        let mut url = Url::parse(&self.base_url)?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => return Err(Error::UnsupportedScheme(other.to_string())),
        }

        url.path_segments_mut()
            .map_err(|_| Error::CannotBeABase(self.base_url.clone()))?
            .pop_if_empty()
            .push(&self.project_id);
        url.set_query(None);
        Ok(url)
    }
}

/// The address to dial: `endpoint` with the local participant as the `user` query parameter.
pub fn connect_url(endpoint: &Url, user: Option<&User>) -> Result<Url> {
    let mut url = endpoint.clone();
    if let Some(user) = user {
        let encoded = serde_json::to_string(user)?;
        url.query_pairs_mut().clear().append_pair("user", &encoded);
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_project_id() {
        let url = WebSocketConfig::new("board-1").endpoint().unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8080/ws/board-1");
    }

    #[test]
    fn trims_trailing_slash() {
        let url = WebSocketConfig::new("p")
            .with_base_url("wss://relay.example.com/sync/")
            .endpoint()
            .unwrap();
        assert_eq!(url.as_str(), "wss://relay.example.com/sync/p");
    }

    #[test]
    fn escapes_project_id() {
        let url = WebSocketConfig::new("a b/c").endpoint().unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8080/ws/a%20b%2Fc");
    }

    #[test]
    fn rejects_bad_input() {
        assert!(matches!(
            WebSocketConfig::new("").endpoint(),
            Err(Error::EmptyProjectId)
        ));
        assert!(matches!(
            WebSocketConfig::new("p").with_base_url("http://localhost").endpoint(),
            Err(Error::UnsupportedScheme(_))
        ));
        assert!(matches!(
            WebSocketConfig::new("p").with_base_url("not a url").endpoint(),
            Err(Error::InvalidUrl(_))
        ));
    }

    #[test]
    fn user_goes_into_query() {
        let endpoint = WebSocketConfig::new("p").endpoint().unwrap();
        let user = User::new("u1").with_field("name", "Ann Lee");
        let url = connect_url(&endpoint, Some(&user)).unwrap();

        let (key, value) = url.query_pairs().next().unwrap();
        assert_eq!(key, "user");
        let decoded: User = serde_json::from_str(&value).unwrap();
        assert_eq!(decoded, user);

        let again = connect_url(&url, Some(&User::new("u2"))).unwrap();
        assert_eq!(again.query_pairs().count(), 1);
    }

    #[test]
    fn reconnect_is_opt_in() {
        let config = WebSocketConfig::new("p");
        assert_eq!(config.reconnect_interval, None);
        let config = config.with_reconnect(Duration::from_millis(250));
        assert_eq!(config.reconnect_interval, Some(Duration::from_millis(250)));
    }
}
