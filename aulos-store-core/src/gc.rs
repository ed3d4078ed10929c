use crate::store_path::StorePath;
use std::collections::{BTreeMap, BTreeSet};

/// What the garbage collector should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u64)]
pub enum GcAction {
    /// Report the set of paths reachable from roots.
    ReturnLive = 0,
    /// Report the set of paths not reachable from roots.
    ReturnDead = 1,
    /// Delete everything not reachable from roots.
    #[default]
    DeleteDead = 2,
    /// Delete exactly the requested paths.
    DeleteSpecific = 3,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GcOptions {
    pub action: GcAction,
    /// Delete unreachability checks be damned. Dangerous.
    pub ignore_liveness: bool,
    /// Only meaningful with [`GcAction::DeleteSpecific`].
    pub paths_to_delete: BTreeSet<StorePath>,
    /// Stop after freeing this many bytes; 0 means no limit.
    pub max_freed: u64,
}

impl GcOptions {
    pub fn delete_dead(max_freed: u64) -> Self {
        Self {
            action: GcAction::DeleteDead,
            max_freed,
            ..Self::default()
        }
    }

    pub fn delete_specific(paths: BTreeSet<StorePath>) -> Self {
        Self {
            action: GcAction::DeleteSpecific,
            paths_to_delete: paths,
            ..Self::default()
        }
    }
}

/// What the garbage collector did (or would do).
///
/// The paths are reported as raw strings: for the `Return*` actions the
/// daemon reports store paths, but deletion can also report trash that no
/// longer parses as one.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GcResults {
    pub paths: BTreeSet<String>,
    pub bytes_freed: u64,
}

/// GC roots: target store path to the set of links keeping it alive.
pub type Roots = BTreeMap<StorePath, BTreeSet<String>>;
