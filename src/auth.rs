//! Token authorization: membership in the on-disk `authorized_tokens`
//! list is the sole check. The file is re-read on every decision so a
//! SIGHUP-triggered edit takes effect without restarting peers.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::errors::{AgentError, Result};

#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// One token per line; blank lines and `#` comments are skipped.
    pub fn read_tokens(&self) -> Result<Vec<String>> {
        let raw = fs::read_to_string(&self.path).map_err(|err| {
            AgentError::Auth(format!("read {}: {err}", self.path.display()))
        })?;
        Ok(raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect())
    }

    /// Read errors are logged and treated as "not authorized".
    pub fn is_authorized(&self, token: &str) -> bool {
        match self.read_tokens() {
            Ok(tokens) => tokens.iter().any(|candidate| candidate == token),
            Err(err) => {
                warn!(error = %err, "token list unreadable, denying");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn store_with(contents: &str) -> (tempfile::TempDir, TokenStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_tokens");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        (dir, TokenStore::new(path))
    }

    #[test]
    fn membership_is_exact() {
        let (_dir, store) = store_with("THEoneANDonlyTOKEN\n# a comment\n\nsecond\n");
        assert!(store.is_authorized("THEoneANDonlyTOKEN"));
        assert!(store.is_authorized("second"));
        assert!(!store.is_authorized("THEoneANDonly"));
        assert!(!store.is_authorized("# a comment"));
    }

    #[test]
    fn missing_file_denies() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("nope"));
        assert!(!store.is_authorized("anything"));
        assert!(store.read_tokens().is_err());
    }

    #[test]
    fn edits_are_visible_without_reload() {
        let (dir, store) = store_with("old\n");
        assert!(store.is_authorized("old"));
        fs::write(dir.path().join("authorized_tokens"), "new\n").unwrap();
        assert!(!store.is_authorized("old"));
        assert!(store.is_authorized("new"));
    }
}
