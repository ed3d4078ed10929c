use crate::store_path::StorePath;
use std::collections::{BTreeMap, BTreeSet};

/// What a substituter could provide for one store path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubstitutablePathInfo {
    pub deriver: Option<StorePath>,
    pub references: BTreeSet<StorePath>,
    /// Compressed download size in bytes.
    pub download_size: u64,
    /// Size of the uncompressed NAR.
    pub nar_size: u64,
}

pub type SubstitutablePathInfos = BTreeMap<StorePath, SubstitutablePathInfo>;
