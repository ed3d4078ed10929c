//! Length-framed bulk upload.
//!
//! On protocol minor >= 23 bulk payloads travel as `(length, chunk)` frames
//! with a zero-length frame marking the end. Framing lets the daemon know
//! the payload boundary without parsing it, which in turn lets the client
//! drain the stderr stream concurrently from the other half of the socket.

use crate::error::{IoErrorContext, ProtocolError};
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub const DEFAULT_FRAME_SIZE: usize = 64 * 1024;

/// A write adapter that chunks whatever is written into it.
pub struct FramedSink<'a, W: ?Sized> {
    writer: &'a mut W,
    buffer: Vec<u8>,
    capacity: usize,
}

impl<'a, W: AsyncWrite + Unpin + ?Sized> FramedSink<'a, W> {
    pub fn new(writer: &'a mut W, capacity: usize) -> Self {
        Self {
            writer,
            buffer: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub async fn write(&mut self, mut data: &[u8]) -> Result<(), ProtocolError> {
        while !data.is_empty() {
            let take = data.len().min(self.capacity - self.buffer.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.buffer.len() == self.capacity {
                self.flush_frame().await?;
            }
        }
        Ok(())
    }

    async fn flush_frame(&mut self) -> Result<(), ProtocolError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.writer
            .write_all(&(self.buffer.len() as u64).to_le_bytes())
            .await
            .io_context("writing frame length")?;
        self.writer
            .write_all(&self.buffer)
            .await
            .io_context("writing frame data")?;
        self.buffer.clear();
        Ok(())
    }

    /// Flush the tail frame and write the zero-length terminator.
    pub async fn finish(mut self) -> Result<(), ProtocolError> {
        self.flush_frame().await?;
        self.writer
            .write_all(&0u64.to_le_bytes())
            .await
            .io_context("writing frame terminator")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chunks_and_terminates() {
        let mut out = Vec::new();
        let mut sink = FramedSink::new(&mut out, 8);
        sink.write(b"0123456789ab").await.unwrap();
        sink.finish().await.unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&8u64.to_le_bytes());
        expected.extend_from_slice(b"01234567");
        expected.extend_from_slice(&4u64.to_le_bytes());
        expected.extend_from_slice(b"89ab");
        expected.extend_from_slice(&0u64.to_le_bytes());
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn empty_payload_is_just_the_terminator() {
        let mut out = Vec::new();
        let sink = FramedSink::new(&mut out, 8);
        sink.finish().await.unwrap();
        assert_eq!(out, 0u64.to_le_bytes());
    }
}
