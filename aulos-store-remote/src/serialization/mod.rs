//! Wire encodings.
//!
//! [`primitives`] holds the framing primitives (padded integers, byte
//! strings); [`store_types`] implements the two traits below for the domain
//! types. The store directory travels with the codec so that every path
//! coming off the wire is validated against the store it belongs to.

pub mod primitives;
pub mod store_types;

use crate::error::ProtocolError;
use crate::protocol::ProtocolVersion;
use aulos_store_core::StoreDir;
use tokio::io::{AsyncRead, AsyncWrite};

#[allow(async_fn_in_trait)]
pub trait Serialize {
    async fn serialize<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<(), ProtocolError>;
}

#[allow(async_fn_in_trait)]
pub trait Deserialize: Sized {
    async fn deserialize<R: AsyncRead + Unpin>(
        reader: &mut R,
        version: ProtocolVersion,
        store_dir: &StoreDir,
    ) -> Result<Self, ProtocolError>;
}
