use crate::error::ProtocolError;

/// Message tags of the stderr sub-protocol: everything the daemon may send
/// between a request and its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Msg {
    Write = 0x64617416,
    Read = 0x64617461,
    Error = 0x63787470,
    Next = 0x6f6c6d67,
    StartActivity = 0x53545254,
    StopActivity = 0x53544f50,
    Result = 0x52534c54,
    Last = 0x616c7473,
}

impl TryFrom<u64> for Msg {
    type Error = ProtocolError;

    fn try_from(value: u64) -> Result<Self, ProtocolError> {
        match value {
            0x64617416 => Ok(Self::Write),
            0x64617461 => Ok(Self::Read),
            0x63787470 => Ok(Self::Error),
            0x6f6c6d67 => Ok(Self::Next),
            0x53545254 => Ok(Self::StartActivity),
            0x53544f50 => Ok(Self::StopActivity),
            0x52534c54 => Ok(Self::Result),
            0x616c7473 => Ok(Self::Last),
            other => Err(ProtocolError::InvalidMsgCode(other)),
        }
    }
}
