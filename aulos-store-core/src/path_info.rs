use crate::content_address::ContentAddress;
use crate::hash::Hash;
use crate::store_path::StorePath;
use std::collections::BTreeSet;

/// Metadata the daemon keeps about a valid store path.
///
/// The NAR hash is always present. `ultimate`, `sigs` and `ca` only travel
/// on protocol minor ≥ 16 and default to absent on older daemons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidPathInfo {
    pub path: StorePath,
    pub deriver: Option<StorePath>,
    /// SHA-256 over the path's NAR serialization.
    pub nar_hash: Hash,
    pub references: BTreeSet<StorePath>,
    /// Unix timestamp of registration in the store database.
    pub registration_time: u64,
    pub nar_size: u64,
    /// Whether this path is "ultimately trusted", i.e. built locally.
    pub ultimate: bool,
    pub sigs: BTreeSet<String>,
    pub ca: Option<ContentAddress>,
}

impl ValidPathInfo {
    pub fn new(path: StorePath, nar_hash: Hash) -> Self {
        Self {
            path,
            deriver: None,
            nar_hash,
            references: BTreeSet::new(),
            registration_time: 0,
            nar_size: 0,
            ultimate: false,
            sigs: BTreeSet::new(),
            ca: None,
        }
    }
}
