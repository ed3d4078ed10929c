pub mod messages;
pub mod opcodes;
pub mod version;

pub use messages::Msg;
pub use opcodes::OpCode;
pub use version::{ProtocolVersion, PROTOCOL_VERSION};

/// Client-to-daemon greeting magic.
pub const WORKER_MAGIC_1: u64 = 0x6e697863;
/// Daemon-to-client greeting magic.
pub const WORKER_MAGIC_2: u64 = 0x6478696f;

/// Header of the legacy (`ImportPaths`) export envelope.
pub const EXPORT_MAGIC: u64 = 0x4558494e;

pub const MAX_STRING_SIZE: u64 = 0x1000000; // 16M
pub const MAX_STRING_LIST_SIZE: u64 = 0x10000; // 64K
