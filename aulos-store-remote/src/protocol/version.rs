use std::fmt;

/// A worker-protocol version: the daemon and client must agree on the
/// major; the minor gates features forward-compatibly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProtocolVersion {
    pub major: u8,
    pub minor: u8,
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl From<u64> for ProtocolVersion {
    fn from(x: u64) -> Self {
        Self {
            major: ((x >> 8) & 0xff) as u8,
            minor: (x & 0xff) as u8,
        }
    }
}

impl From<ProtocolVersion> for u64 {
    fn from(version: ProtocolVersion) -> Self {
        ((version.major as u64) << 8) | version.minor as u64
    }
}

/// The newest protocol this client speaks.
pub const PROTOCOL_VERSION: ProtocolVersion = ProtocolVersion {
    major: 1,
    minor: 25,
};

/// Daemons older than this cannot be spoken to at all.
pub const MIN_DAEMON_MINOR: u8 = 10;

/// Minor that introduced `QueryDerivationOutputMap`. The upstream source
/// spells this gate `0x16`; it is the same number.
pub const QUERY_OUTPUT_MAP_MINOR: u8 = 22;
