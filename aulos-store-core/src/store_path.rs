use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A validated store path: an absolute filesystem path of the form
/// `<store-dir>/<hash>-<name>`.
///
/// The full path is kept as raw bytes; store paths are not required to be
/// UTF-8 on the wire, only the store-dir prefix is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorePath {
    path: Vec<u8>,
}

impl StorePath {
    /// Wrap raw bytes without validating them against a store directory.
    ///
    /// Use [`StoreDir::parse_path`] for anything that came off the wire.
    pub fn new_unchecked(path: Vec<u8>) -> Self {
        Self { path }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.path
    }

    /// The final path component, `<hash>-<name>`.
    pub fn base_name(&self) -> &[u8] {
        match self.path.iter().rposition(|&b| b == b'/') {
            Some(i) => &self.path[i + 1..],
            None => &self.path,
        }
    }

    /// The base32 hash part of the base name (everything before the first
    /// dash).
    pub fn hash_part(&self) -> &[u8] {
        let base = self.base_name();
        match base.iter().position(|&b| b == b'-') {
            Some(i) => &base[..i],
            None => base,
        }
    }

    /// The human-readable part of the base name (everything after the first
    /// dash).
    pub fn name(&self) -> &[u8] {
        let base = self.base_name();
        match base.iter().position(|&b| b == b'-') {
            Some(i) => &base[i + 1..],
            None => b"",
        }
    }

    pub fn is_derivation(&self) -> bool {
        self.path.ends_with(b".drv")
    }

    /// The path as an `std::path::Path` for filesystem access.
    pub fn as_fs_path(&self) -> &Path {
        use std::os::unix::ffi::OsStrExt;
        Path::new(std::ffi::OsStr::from_bytes(&self.path))
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.path))
    }
}

impl From<StorePath> for Vec<u8> {
    fn from(path: StorePath) -> Self {
        path.path
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseStorePathError {
    #[error("path '{path}' is not in the store directory '{store_dir}'")]
    NotInStore { path: String, store_dir: String },

    #[error("path '{0}' is not a valid store path")]
    InvalidForm(String),
}

/// The store directory prefix, e.g. `/nix/store`.
///
/// All parsing and printing of store paths goes through this type so that a
/// path accepted off the wire is guaranteed to live under the configured
/// store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDir {
    dir: String,
}

pub const DEFAULT_STORE_DIR: &str = "/nix/store";

impl Default for StoreDir {
    fn default() -> Self {
        Self {
            dir: DEFAULT_STORE_DIR.to_string(),
        }
    }
}

impl StoreDir {
    pub fn new(dir: impl Into<String>) -> Self {
        let mut dir = dir.into();
        while dir.len() > 1 && dir.ends_with('/') {
            dir.pop();
        }
        Self { dir }
    }

    pub fn as_str(&self) -> &str {
        &self.dir
    }

    /// Parse and validate a full store path.
    pub fn parse_path(&self, bytes: &[u8]) -> Result<StorePath, ParseStorePathError> {
        let lossy = || String::from_utf8_lossy(bytes).into_owned();

        let rest = bytes
            .strip_prefix(self.dir.as_bytes())
            .and_then(|r| r.strip_prefix(b"/"))
            .ok_or_else(|| ParseStorePathError::NotInStore {
                path: lossy(),
                store_dir: self.dir.clone(),
            })?;

        // The base name must be a single non-empty component.
        if rest.is_empty() || rest.contains(&b'/') || rest.contains(&0) {
            return Err(ParseStorePathError::InvalidForm(lossy()));
        }

        Ok(StorePath {
            path: bytes.to_vec(),
        })
    }

    /// Build a store path from a base name (`<hash>-<name>`).
    pub fn make_path(&self, base_name: &str) -> StorePath {
        let mut path = Vec::with_capacity(self.dir.len() + 1 + base_name.len());
        path.extend_from_slice(self.dir.as_bytes());
        path.push(b'/');
        path.extend_from_slice(base_name.as_bytes());
        StorePath { path }
    }

    /// Render a store path for the wire. Store paths carry their full path,
    /// so this is a straight borrow; it exists so call sites read as
    /// "print through the store dir" like parsing does.
    pub fn print_path<'a>(&self, path: &'a StorePath) -> &'a [u8] {
        path.as_bytes()
    }
}

impl fmt::Display for StoreDir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dir)
    }
}

impl From<StoreDir> for PathBuf {
    fn from(dir: StoreDir) -> Self {
        PathBuf::from(dir.dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_path() {
        let dir = StoreDir::default();
        let p = dir
            .parse_path(b"/nix/store/7rjj86a2vvgyb7mpgx2zsqml5v5bqmcm-hello-2.12.1")
            .unwrap();
        assert_eq!(p.hash_part(), b"7rjj86a2vvgyb7mpgx2zsqml5v5bqmcm");
        assert_eq!(p.name(), b"hello-2.12.1");
        assert!(!p.is_derivation());
    }

    #[test]
    fn rejects_foreign_prefix() {
        let dir = StoreDir::default();
        assert!(matches!(
            dir.parse_path(b"/gnu/store/abc-foo"),
            Err(ParseStorePathError::NotInStore { .. })
        ));
    }

    #[test]
    fn rejects_nested_and_empty_base_names() {
        let dir = StoreDir::default();
        assert!(dir.parse_path(b"/nix/store/").is_err());
        assert!(dir.parse_path(b"/nix/store/abc-foo/bin").is_err());
    }

    #[test]
    fn custom_store_dir_strips_trailing_slash() {
        let dir = StoreDir::new("/tmp/store/");
        assert_eq!(dir.as_str(), "/tmp/store");
        assert!(dir.parse_path(b"/tmp/store/abc-foo").is_ok());
    }
}
