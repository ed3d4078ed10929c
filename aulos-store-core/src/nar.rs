//! Copying NAR streams.
//!
//! A NAR arrives on the daemon socket unframed, so the copier must parse
//! the archive grammar to know where it ends; every byte is forwarded
//! verbatim. The grammar is a token stream of padded strings:
//!
//! ```text
//! archive = "nix-archive-1" node
//! node    = "(" "type" ("regular" ["executable" ""] "contents" STR
//!                      | "symlink" "target" STR
//!                      | "directory" entry* ) ")"
//! entry   = "entry" "(" "name" STR "node" node ")"
//! ```

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const NAR_VERSION_MAGIC: &[u8] = b"nix-archive-1";

/// Structural tokens and names stay small; file contents stream separately.
const MAX_TOKEN_LEN: u64 = 0x10000;

#[derive(Debug, Error)]
pub enum NarCopyError {
    #[error("I/O error while copying NAR: {0}")]
    Io(#[from] std::io::Error),

    #[error("input is not a NAR archive")]
    BadVersionMagic,

    #[error("expected NAR token '{expected}', got '{got}'")]
    UnexpectedToken { expected: String, got: String },

    #[error("unknown NAR node type '{0}'")]
    UnknownNodeType(String),

    #[error("NAR token of {0} bytes exceeds the structural limit")]
    TokenTooLong(u64),
}

fn unexpected(expected: &str, got: &[u8]) -> NarCopyError {
    NarCopyError::UnexpectedToken {
        expected: expected.to_string(),
        got: String::from_utf8_lossy(got).into_owned(),
    }
}

const fn padding(len: u64) -> usize {
    ((len.wrapping_add(7) & !7) - len) as usize
}

async fn write_token<W>(writer: &mut W, data: &[u8]) -> Result<(), std::io::Error>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(&(data.len() as u64).to_le_bytes()).await?;
    writer.write_all(data).await?;
    let pad = padding(data.len() as u64);
    if pad > 0 {
        writer.write_all(&[0u8; 8][..pad]).await?;
    }
    Ok(())
}

/// Read one padded string, echo it to `writer`, and return its payload.
async fn copy_token<R, W>(reader: &mut R, writer: &mut W) -> Result<Vec<u8>, NarCopyError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 8];
    reader.read_exact(&mut len_buf).await?;
    let len = u64::from_le_bytes(len_buf);
    if len > MAX_TOKEN_LEN {
        return Err(NarCopyError::TokenTooLong(len));
    }

    let mut data = vec![0u8; len as usize + padding(len)];
    reader.read_exact(&mut data).await?;

    writer.write_all(&len_buf).await?;
    writer.write_all(&data).await?;

    data.truncate(len as usize);
    Ok(data)
}

async fn expect_token<R, W>(
    reader: &mut R,
    writer: &mut W,
    expected: &[u8],
) -> Result<(), NarCopyError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let tok = copy_token(reader, writer).await?;
    if tok == expected {
        Ok(())
    } else {
        Err(unexpected(&String::from_utf8_lossy(expected), &tok))
    }
}

/// Stream one padded string of arbitrary length (file contents).
async fn copy_payload<R, W>(reader: &mut R, writer: &mut W) -> Result<(), NarCopyError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 8];
    reader.read_exact(&mut len_buf).await?;
    writer.write_all(&len_buf).await?;

    let len = u64::from_le_bytes(len_buf);
    let mut remaining = len + padding(len) as u64;
    let mut buf = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(NarCopyError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "NAR truncated inside file contents",
            )));
        }
        writer.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Copy exactly one NAR from `reader` to `writer`, leaving any bytes after
/// the archive unread.
pub async fn copy_nar<R, W>(reader: &mut R, writer: &mut W) -> Result<(), NarCopyError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let magic = copy_token(reader, writer).await?;
    if magic != NAR_VERSION_MAGIC {
        return Err(NarCopyError::BadVersionMagic);
    }

    // Nodes are walked iteratively; `open_entries` counts directory entries
    // whose closing parenthesis is still owed.
    let mut open_entries = 0usize;

    'node: loop {
        expect_token(reader, writer, b"(").await?;
        expect_token(reader, writer, b"type").await?;
        let node_type = copy_token(reader, writer).await?;

        match node_type.as_slice() {
            b"regular" => {
                let mut tok = copy_token(reader, writer).await?;
                if tok == b"executable" {
                    expect_token(reader, writer, b"").await?;
                    tok = copy_token(reader, writer).await?;
                }
                if tok != b"contents" {
                    return Err(unexpected("contents", &tok));
                }
                copy_payload(reader, writer).await?;
                expect_token(reader, writer, b")").await?;
            }
            b"symlink" => {
                expect_token(reader, writer, b"target").await?;
                copy_token(reader, writer).await?;
                expect_token(reader, writer, b")").await?;
            }
            b"directory" => loop {
                let tok = copy_token(reader, writer).await?;
                match tok.as_slice() {
                    b")" => break,
                    b"entry" => {
                        expect_token(reader, writer, b"(").await?;
                        expect_token(reader, writer, b"name").await?;
                        copy_token(reader, writer).await?;
                        expect_token(reader, writer, b"node").await?;
                        open_entries += 1;
                        continue 'node;
                    }
                    other => return Err(unexpected("entry or )", other)),
                }
            },
            other => {
                return Err(NarCopyError::UnknownNodeType(
                    String::from_utf8_lossy(other).into_owned(),
                ))
            }
        }

        // A node just completed: close the entries it was nested in, and
        // resume each enclosing directory where it left off.
        loop {
            if open_entries == 0 {
                break 'node;
            }
            open_entries -= 1;
            expect_token(reader, writer, b")").await?;

            let tok = copy_token(reader, writer).await?;
            match tok.as_slice() {
                b")" => continue,
                b"entry" => {
                    expect_token(reader, writer, b"(").await?;
                    expect_token(reader, writer, b"name").await?;
                    copy_token(reader, writer).await?;
                    expect_token(reader, writer, b"node").await?;
                    open_entries += 1;
                    continue 'node;
                }
                other => return Err(unexpected("entry or )", other)),
            }
        }
    }

    Ok(())
}

/// Serialize a byte string as the NAR of a single non-executable regular
/// file. This is the envelope flat-ingestion uploads use on old daemons.
pub async fn dump_string<W>(contents: &[u8], writer: &mut W) -> Result<(), std::io::Error>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    write_token(writer, NAR_VERSION_MAGIC).await?;
    write_token(writer, b"(").await?;
    write_token(writer, b"type").await?;
    write_token(writer, b"regular").await?;
    write_token(writer, b"contents").await?;
    write_token(writer, contents).await?;
    write_token(writer, b")").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn tok(buf: &mut Vec<u8>, data: &[u8]) {
        write_token(buf, data).await.unwrap();
    }

    async fn sample_directory_nar() -> Vec<u8> {
        let mut nar = Vec::new();
        tok(&mut nar, b"nix-archive-1").await;
        tok(&mut nar, b"(").await;
        tok(&mut nar, b"type").await;
        tok(&mut nar, b"directory").await;

        tok(&mut nar, b"entry").await;
        tok(&mut nar, b"(").await;
        tok(&mut nar, b"name").await;
        tok(&mut nar, b"bin").await;
        tok(&mut nar, b"node").await;
        tok(&mut nar, b"(").await;
        tok(&mut nar, b"type").await;
        tok(&mut nar, b"directory").await;
        tok(&mut nar, b"entry").await;
        tok(&mut nar, b"(").await;
        tok(&mut nar, b"name").await;
        tok(&mut nar, b"hello").await;
        tok(&mut nar, b"node").await;
        tok(&mut nar, b"(").await;
        tok(&mut nar, b"type").await;
        tok(&mut nar, b"regular").await;
        tok(&mut nar, b"executable").await;
        tok(&mut nar, b"").await;
        tok(&mut nar, b"contents").await;
        tok(&mut nar, b"#!/bin/sh\necho hello\n").await;
        tok(&mut nar, b")").await;
        tok(&mut nar, b")").await;
        tok(&mut nar, b")").await;
        tok(&mut nar, b")").await;

        tok(&mut nar, b"entry").await;
        tok(&mut nar, b"(").await;
        tok(&mut nar, b"name").await;
        tok(&mut nar, b"link").await;
        tok(&mut nar, b"node").await;
        tok(&mut nar, b"(").await;
        tok(&mut nar, b"type").await;
        tok(&mut nar, b"symlink").await;
        tok(&mut nar, b"target").await;
        tok(&mut nar, b"bin/hello").await;
        tok(&mut nar, b")").await;
        tok(&mut nar, b")").await;

        tok(&mut nar, b")").await;
        nar
    }

    #[tokio::test]
    async fn copies_nested_directories_byte_for_byte() {
        let nar = sample_directory_nar().await;
        let mut reader = Cursor::new(nar.clone());
        let mut out = Vec::new();
        copy_nar(&mut reader, &mut out).await.unwrap();
        assert_eq!(out, nar);
    }

    #[tokio::test]
    async fn stops_exactly_at_archive_end() {
        let mut bytes = sample_directory_nar().await;
        let nar_len = bytes.len() as u64;
        bytes.extend_from_slice(&0xdeadbeefu64.to_le_bytes());

        let mut reader = Cursor::new(bytes);
        let mut out = Vec::new();
        copy_nar(&mut reader, &mut out).await.unwrap();
        assert_eq!(reader.position(), nar_len);
    }

    #[tokio::test]
    async fn dump_string_produces_a_copyable_nar() {
        let mut nar = Vec::new();
        dump_string(b"hello world", &mut nar).await.unwrap();

        let mut reader = Cursor::new(nar.clone());
        let mut out = Vec::new();
        copy_nar(&mut reader, &mut out).await.unwrap();
        assert_eq!(out, nar);
    }

    #[tokio::test]
    async fn rejects_non_archives() {
        let mut bytes = Vec::new();
        tok(&mut bytes, b"not-an-archive").await;
        let mut reader = Cursor::new(bytes);
        let mut out = Vec::new();
        assert!(matches!(
            copy_nar(&mut reader, &mut out).await,
            Err(NarCopyError::BadVersionMagic)
        ));
    }

    #[tokio::test]
    async fn rejects_truncated_contents() {
        let mut nar = Vec::new();
        tok(&mut nar, b"nix-archive-1").await;
        tok(&mut nar, b"(").await;
        tok(&mut nar, b"type").await;
        tok(&mut nar, b"regular").await;
        tok(&mut nar, b"contents").await;
        nar.extend_from_slice(&100u64.to_le_bytes());
        nar.extend_from_slice(b"only a few bytes");

        let mut reader = Cursor::new(nar);
        let mut out = Vec::new();
        assert!(copy_nar(&mut reader, &mut out).await.is_err());
    }
}
