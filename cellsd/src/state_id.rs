use std::fmt;

use thiserror::Error;
use url::form_urlencoded;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateIdError {
    #[error("malformed state id: {0}")]
    Malformed(String),
}

/// Address of a remote resource: an account (`username@server-url`), optionally
/// narrowed to a path whose first segment is the workspace slug.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateId {
    username: String,
    server_url: String,
    path: Option<String>,
}

impl StateId {
    pub fn new(username: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            path: None,
        }
    }

    pub fn with_path(&self, path: &str) -> Self {
        let normalized = normalize_path(path);
        Self {
            username: self.username.clone(),
            server_url: self.server_url.clone(),
            path: normalized,
        }
    }

    pub fn child(&self, name: &str) -> Self {
        let base = self.path.as_deref().unwrap_or("");
        self.with_path(&format!("{base}/{name}"))
    }

    pub fn from_id(encoded: &str) -> Result<Self, StateIdError> {
        let (account, path) = match encoded.split_once(':') {
            Some((account, path)) => (account, Some(path)),
            None => (encoded, None),
        };
        let (username, server_url) = account
            .split_once('@')
            .ok_or_else(|| StateIdError::Malformed(encoded.to_string()))?;
        let username = decode(username);
        let server_url = decode(server_url);
        if username.is_empty() || server_url.is_empty() {
            return Err(StateIdError::Malformed(encoded.to_string()));
        }
        let id = Self::new(username, server_url);
        Ok(match path {
            Some(path) => id.with_path(&decode(path)),
            None => id,
        })
    }

    /// Stable encoded form, used as the join key across tables.
    pub fn id(&self) -> String {
        let mut out = format!("{}@{}", encode(&self.username), encode(&self.server_url));
        if let Some(path) = &self.path {
            out.push(':');
            out.push_str(&encode(path));
        }
        out
    }

    pub fn account(&self) -> StateId {
        Self::new(self.username.clone(), self.server_url.clone())
    }

    pub fn account_id(&self) -> String {
        self.account().id()
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Full remote path, workspace slug included (`/ws/folder/file.txt`).
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn workspace(&self) -> Option<&str> {
        self.path
            .as_deref()
            .and_then(|path| path.trim_start_matches('/').split('/').next())
            .filter(|slug| !slug.is_empty())
    }

    /// Path inside the workspace, `/` for the workspace root.
    pub fn file(&self) -> Option<String> {
        let path = self.path.as_deref()?;
        let rest = path.trim_start_matches('/');
        Some(match rest.split_once('/') {
            Some((_, inner)) => format!("/{inner}"),
            None => "/".to_string(),
        })
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path
            .as_deref()
            .and_then(|path| path.rsplit('/').next())
            .filter(|name| !name.is_empty())
    }

    pub fn parent(&self) -> StateId {
        match self.path.as_deref().and_then(|path| path.rsplit_once('/')) {
            Some((parent, _)) if !parent.is_empty() => self.with_path(parent),
            _ => self.account(),
        }
    }

    pub fn is_account_root(&self) -> bool {
        self.path.is_none()
    }

    pub fn is_workspace_root(&self) -> bool {
        self.workspace().is_some() && self.file().as_deref() == Some("/")
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.username, self.server_url)?;
        if let Some(path) = &self.path {
            f.write_str(path)?;
        }
        Ok(())
    }
}

fn normalize_path(path: &str) -> Option<String> {
    let segments: Vec<&str> = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();
    if segments.is_empty() {
        None
    } else {
        Some(format!("/{}", segments.join("/")))
    }
}

fn encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn decode(value: &str) -> String {
    form_urlencoded::parse(value.as_bytes())
        .next()
        .map(|(key, _)| key.into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> StateId {
        StateId::new("alice", "https://cells.example.com/")
    }

    #[test]
    fn encoded_id_round_trips_with_path() {
        let id = account().with_path("/common-files/Docs/Q1 report.pdf");
        let encoded = id.id();
        assert!(!encoded.contains('/'));
        assert_eq!(StateId::from_id(&encoded).unwrap(), id);
        assert_eq!(StateId::from_id(&account().id()).unwrap(), account());
    }

    #[test]
    fn splits_workspace_and_file() {
        let id = account().with_path("/ws/folder/a.txt");
        assert_eq!(id.workspace(), Some("ws"));
        assert_eq!(id.file().as_deref(), Some("/folder/a.txt"));
        assert_eq!(id.file_name(), Some("a.txt"));
        assert_eq!(id.parent().path(), Some("/ws/folder"));

        let root = account().with_path("ws/");
        assert!(root.is_workspace_root());
        assert!(root.parent().is_account_root());
        assert_eq!(root.child("b").path(), Some("/ws/b"));
    }

    #[test]
    fn rejects_ids_without_account_separator() {
        assert!(matches!(
            StateId::from_id("no-separator"),
            Err(StateIdError::Malformed(_))
        ));
    }

    #[test]
    fn display_is_human_readable() {
        let id = account().with_path("/ws/a.txt");
        assert_eq!(id.to_string(), "alice@https://cells.example.com/ws/a.txt");
    }
}
