//! Framing primitives: the integer and byte-string encodings everything
//! else is built from.
//!
//! Integers are 8-byte little-endian; booleans are integers 0/1; byte
//! strings are length-prefixed and zero-padded to the next multiple of
//! eight. The reader consumes and discards the pad.

use crate::error::{IoErrorContext, ProtocolError};
use crate::protocol::MAX_STRING_SIZE;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub(crate) const ZEROS: [u8; 8] = [0u8; 8];

pub(crate) const fn padding(len: u64) -> usize {
    ((len.wrapping_add(7) & !7) - len) as usize
}

pub async fn write_u64<W>(writer: &mut W, value: u64) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer
        .write_all(&value.to_le_bytes())
        .await
        .io_context("writing integer")
}

pub async fn read_u64<R>(reader: &mut R) -> Result<u64, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = [0u8; 8];
    reader
        .read_exact(&mut buf)
        .await
        .io_context("reading integer")?;
    Ok(u64::from_le_bytes(buf))
}

pub async fn write_bool<W>(writer: &mut W, value: bool) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_u64(writer, value as u64).await
}

pub async fn read_bool<R>(reader: &mut R) -> Result<bool, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    Ok(read_u64(reader).await? != 0)
}

pub async fn write_bytes<W>(writer: &mut W, data: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = data.len() as u64;
    write_u64(writer, len).await?;
    writer
        .write_all(data)
        .await
        .io_context("writing string data")?;
    let pad = padding(len);
    if pad > 0 {
        writer
            .write_all(&ZEROS[..pad])
            .await
            .io_context("writing string padding")?;
    }
    Ok(())
}

pub async fn read_bytes<R>(reader: &mut R) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let len = read_u64(reader).await.io_context("reading string length")?;
    if len > MAX_STRING_SIZE {
        return Err(ProtocolError::StringTooLong {
            length: len,
            max: MAX_STRING_SIZE,
        });
    }

    let padded = len as usize + padding(len);
    let mut buf = vec![0u8; padded];
    reader
        .read_exact(&mut buf)
        .await
        .io_context("reading string data")?;
    buf.truncate(len as usize);
    Ok(buf)
}

pub async fn write_string<W>(writer: &mut W, s: &str) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_bytes(writer, s.as_bytes()).await
}

pub async fn read_string<R>(reader: &mut R) -> Result<String, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    String::from_utf8(read_bytes(reader).await?)
        .map_err(|e| ProtocolError::Decode(format!("string is not UTF-8: {e}")))
}
