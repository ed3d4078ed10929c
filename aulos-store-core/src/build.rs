/// Build modes accepted by the build operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u64)]
pub enum BuildMode {
    #[default]
    Normal = 0,
    Repair = 1,
    Check = 2,
}

/// Status codes reported for a derivation build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum BuildStatus {
    Built = 0,
    Substituted = 1,
    AlreadyValid = 2,
    PermanentFailure = 3,
    InputRejected = 4,
    OutputRejected = 5,
    TransientFailure = 6,
    TimedOut = 7,
    MiscFailure = 8,
    DependencyFailed = 9,
    LogLimitExceeded = 10,
    NotDeterministic = 11,
    ResolvesToAlreadyValid = 12,
    NoSubstituters = 13,
}

impl BuildStatus {
    pub fn from_u64(value: u64) -> Option<Self> {
        Some(match value {
            0 => Self::Built,
            1 => Self::Substituted,
            2 => Self::AlreadyValid,
            3 => Self::PermanentFailure,
            4 => Self::InputRejected,
            5 => Self::OutputRejected,
            6 => Self::TransientFailure,
            7 => Self::TimedOut,
            8 => Self::MiscFailure,
            9 => Self::DependencyFailed,
            10 => Self::LogLimitExceeded,
            11 => Self::NotDeterministic,
            12 => Self::ResolvesToAlreadyValid,
            13 => Self::NoSubstituters,
            _ => return None,
        })
    }
}

/// Outcome of `build_derivation`: a status code plus the daemon's error
/// message (empty on success).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildResult {
    pub status: BuildStatus,
    pub error_msg: String,
}

impl BuildResult {
    pub fn success(&self) -> bool {
        matches!(
            self.status,
            BuildStatus::Built | BuildStatus::Substituted | BuildStatus::AlreadyValid
        )
    }
}
