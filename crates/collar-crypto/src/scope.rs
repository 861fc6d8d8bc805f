//! Where each remote server's key store lives on disk.

use std::path::{Path, PathBuf};

use crate::error::StoreError;

/// Maps a remote server identifier to an isolated storage directory.
pub trait ScopeResolver {
    fn resolve(&self, server: &str) -> Result<PathBuf, StoreError>;
}

/// Per-server directories under one home: `<root>/<server>/signal`.
#[derive(Debug, Clone)]
pub struct HomeDirectory {
    root: PathBuf,
}

impl HomeDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `<data dir>/collar`, if the platform has a data directory.
    pub fn default_root() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join("collar"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ScopeResolver for HomeDirectory {
    fn resolve(&self, server: &str) -> Result<PathBuf, StoreError> {
        if server.is_empty() {
            return Err(StoreError::InvalidScope(server.to_string()));
        }
        Ok(self.root.join(escape_component(server)).join("signal"))
    }
}

/// Escape a server id into one path component.
///
/// Keeps `[A-Za-z0-9._-]` readable and percent-encodes every other byte
/// (including `%` and a leading `.`), so distinct ids map to distinct names.
fn escape_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for (i, byte) in raw.bytes().enumerate() {
        let keep = byte.is_ascii_alphanumeric()
            || byte == b'-'
            || byte == b'_'
            || (byte == b'.' && i > 0);
        if keep {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_hostnames_stay_readable() {
        let home = HomeDirectory::new("/home/u/.collar");
        assert_eq!(
            home.resolve("api.collarmc.com").unwrap(),
            PathBuf::from("/home/u/.collar/api.collarmc.com/signal")
        );
    }

    #[test]
    fn separators_and_traversal_are_escaped() {
        assert_eq!(escape_component("localhost:3000"), "localhost%3A3000");
        assert_eq!(escape_component("../etc"), "%2E.%2Fetc");
        assert_eq!(escape_component("a/b"), "a%2Fb");
    }

    #[test]
    fn escaping_is_injective_for_lookalikes() {
        assert_ne!(escape_component("a:b"), escape_component("a%3Ab"));
        assert_ne!(escape_component("a_b"), escape_component("a:b"));
    }

    #[test]
    fn empty_server_is_rejected() {
        let home = HomeDirectory::new("/tmp");
        assert!(matches!(home.resolve(""), Err(StoreError::InvalidScope(_))));
    }
}
