use aulos_store_core::StoreDir;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SOCKET_PATH: &str = "/nix/var/nix/daemon-socket/socket";

/// Log levels, numbered the way `set_options` transmits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u64)]
pub enum Verbosity {
    #[default]
    Error = 0,
    Warn = 1,
    Notice = 2,
    Info = 3,
    Talkative = 4,
    Chatty = 5,
    Debug = 6,
    Vomit = 7,
}

/// A read-only snapshot of everything the client consumes from its host's
/// configuration. Passed to the store constructor instead of being read
/// from a global, so tests can inject a frozen copy.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub store_dir: StoreDir,
    /// Socket the `daemon` URI connects to.
    pub socket_path: PathBuf,
    /// Pool capacity; clamped to at least 1.
    pub max_connections: usize,
    /// Idle connections older than this are not reused.
    pub max_connection_age: Duration,

    pub verbosity: Verbosity,
    pub keep_failed: bool,
    pub keep_going: bool,
    pub try_fallback: bool,
    pub max_build_jobs: u64,
    pub max_silent_time: u64,
    pub build_cores: u64,
    pub use_substitutes: bool,
    /// When false, build output is forwarded at the most verbose level so
    /// the local logger can filter it.
    pub verbose_build: bool,
    /// Ask the daemon to pin the build to the client's current CPU.
    pub lock_cpu: bool,

    /// Settings overridden from their defaults, forwarded verbatim to
    /// daemons that accept a config map (protocol minor >= 12).
    pub overrides: BTreeMap<String, String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            store_dir: StoreDir::default(),
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            max_connections: 1,
            max_connection_age: Duration::from_secs(u32::MAX as u64),
            verbosity: Verbosity::Error,
            keep_failed: false,
            keep_going: false,
            try_fallback: false,
            max_build_jobs: 1,
            max_silent_time: 0,
            build_cores: 0,
            use_substitutes: true,
            verbose_build: true,
            lock_cpu: false,
            overrides: BTreeMap::new(),
        }
    }
}

/// Setting names already carried by the legacy scalar block of
/// `set_options`, plus `show-trace` which the daemon has no use for. These
/// are stripped from the override map before it is sent.
const LEGACY_SETTING_NAMES: &[&str] = &[
    "keep-failed",
    "keep-going",
    "fallback",
    "max-jobs",
    "max-silent-time",
    "cores",
    "substitute",
    "show-trace",
];

impl ClientSettings {
    /// The override pairs that actually go on the wire.
    pub(crate) fn wire_overrides(&self) -> impl Iterator<Item = (&str, &str)> {
        self.overrides
            .iter()
            .filter(|(name, _)| !LEGACY_SETTING_NAMES.contains(&name.as_str()))
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// The log level build output is forwarded at.
    pub(crate) fn build_output_verbosity(&self) -> Verbosity {
        if self.verbose_build {
            Verbosity::Error
        } else {
            Verbosity::Vomit
        }
    }
}
