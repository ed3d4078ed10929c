use crate::error::{IoErrorContext, ProtocolError};
use crate::framed::{FramedSink, DEFAULT_FRAME_SIZE};
use crate::logger::{ActivityLogger, LoggerField};
use crate::protocol::version::MIN_DAEMON_MINOR;
use crate::protocol::{
    Msg, OpCode, ProtocolVersion, MAX_STRING_LIST_SIZE, PROTOCOL_VERSION, WORKER_MAGIC_1,
    WORKER_MAGIC_2,
};
use crate::serialization::primitives::{
    read_bytes, read_string, read_u64, write_bool, write_bytes, write_string, write_u64,
};
use crate::settings::ClientSettings;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

pub(crate) type ConnReader = BufReader<OwnedReadHalf>;
pub(crate) type ConnWriter = BufWriter<OwnedWriteHalf>;

/// Largest chunk sent back for one daemon `READ` request.
const READ_CHUNK: u64 = 64 * 1024;

/// One greeted daemon connection: the two halves of the socket, the
/// negotiated version, and its birth time for age-based eviction.
///
/// A connection is either fresh (greeting done, no operation in flight) or
/// exclusively leased through the pool; it never returns to the pool in the
/// middle of an operation.
pub(crate) struct Connection {
    pub(crate) reader: ConnReader,
    pub(crate) writer: ConnWriter,
    daemon_version: ProtocolVersion,
    start_time: Instant,
    good: bool,
    logger: Arc<dyn ActivityLogger>,
}

impl Connection {
    /// Connect, greet, and send `set_options`; returns a fresh connection.
    pub(crate) async fn open(
        settings: &ClientSettings,
        socket_path: &Path,
        logger: Arc<dyn ActivityLogger>,
    ) -> Result<Self, ProtocolError> {
        check_socket_path(socket_path)?;

        let stream = UnixStream::connect(socket_path)
            .await
            .io_context(format!("connecting to '{}'", socket_path.display()))?;
        let (read_half, write_half) = stream.into_split();

        let mut conn = Connection {
            reader: BufReader::new(read_half),
            writer: BufWriter::new(write_half),
            daemon_version: PROTOCOL_VERSION,
            start_time: Instant::now(),
            good: true,
            logger,
        };
        conn.handshake(settings).await?;
        conn.set_options(settings).await?;
        Ok(conn)
    }

    async fn handshake(&mut self, settings: &ClientSettings) -> Result<(), ProtocolError> {
        write_u64(&mut self.writer, WORKER_MAGIC_1).await?;
        self.writer.flush().await.io_context("flushing greeting")?;

        let magic = read_u64(&mut self.reader).await?;
        if magic != WORKER_MAGIC_2 {
            return Err(ProtocolError::InvalidMagic {
                expected: WORKER_MAGIC_2,
                actual: magic,
            });
        }

        let daemon_version = ProtocolVersion::from(read_u64(&mut self.reader).await?);
        if daemon_version.major != PROTOCOL_VERSION.major {
            return Err(ProtocolError::IncompatibleVersion {
                daemon: daemon_version,
                client: PROTOCOL_VERSION,
            });
        }
        if daemon_version.minor < MIN_DAEMON_MINOR {
            return Err(ProtocolError::DaemonTooOld {
                daemon: daemon_version,
            });
        }
        self.daemon_version = daemon_version;

        write_u64(&mut self.writer, u64::from(PROTOCOL_VERSION)).await?;

        if daemon_version.minor >= 14 {
            // CPU affinity hint; the daemon is on this machine by
            // definition of the transport.
            match settings.lock_cpu.then(current_cpu).flatten() {
                Some(cpu) => {
                    write_u64(&mut self.writer, 1).await?;
                    write_u64(&mut self.writer, cpu).await?;
                }
                None => write_u64(&mut self.writer, 0).await?,
            }
        }

        if daemon_version.minor >= 11 {
            // Reserved flag.
            write_bool(&mut self.writer, false).await?;
        }

        self.process_stderr().await
    }

    /// Push the client's build settings to the daemon: the fixed legacy
    /// scalar block, then (minor >= 12) the override map.
    async fn set_options(&mut self, settings: &ClientSettings) -> Result<(), ProtocolError> {
        let w = &mut self.writer;
        write_u64(w, OpCode::SetOptions as u64).await?;
        write_bool(w, settings.keep_failed).await?;
        write_bool(w, settings.keep_going).await?;
        write_bool(w, settings.try_fallback).await?;
        write_u64(w, settings.verbosity as u64).await?;
        write_u64(w, settings.max_build_jobs).await?;
        write_u64(w, settings.max_silent_time).await?;
        write_bool(w, true).await?; // obsolete: use build hook
        write_u64(w, settings.build_output_verbosity() as u64).await?;
        write_u64(w, 0).await?; // obsolete: log type
        write_u64(w, 0).await?; // obsolete: print build trace
        write_u64(w, settings.build_cores).await?;
        write_bool(w, settings.use_substitutes).await?;

        if self.daemon_version.minor >= 12 {
            let overrides: Vec<_> = settings.wire_overrides().collect();
            write_u64(&mut self.writer, overrides.len() as u64).await?;
            for (name, value) in overrides {
                write_string(&mut self.writer, name).await?;
                write_string(&mut self.writer, value).await?;
            }
        }

        self.process_stderr().await
    }

    pub(crate) fn version(&self) -> ProtocolVersion {
        self.daemon_version
    }

    pub(crate) fn is_healthy(&self, max_age: Duration) -> bool {
        self.good && self.start_time.elapsed() <= max_age
    }

    pub(crate) fn mark_bad(&mut self) {
        self.good = false;
    }

    pub(crate) async fn send_opcode(&mut self, opcode: OpCode) -> Result<(), ProtocolError> {
        write_u64(&mut self.writer, opcode as u64).await
    }

    /// Best-effort flush before the socket closes; the peer may already be
    /// gone, so errors are swallowed.
    pub(crate) async fn shutdown(mut self) {
        let _ = self.writer.flush().await;
    }

    /// Flush the request and consume interleaved daemon messages up to and
    /// including one `LAST` or one `ERROR` tag, never more.
    ///
    /// A daemon-reported error comes back as `Err(Daemon { .. })`; the
    /// stream is aligned after it and the connection remains usable. Any
    /// other error means the connection must be discarded.
    pub(crate) async fn process_stderr(&mut self) -> Result<(), ProtocolError> {
        self.process_stderr_with(None::<&mut tokio::io::Sink>, None::<&mut tokio::io::Empty>)
            .await
    }

    /// [`Connection::process_stderr`] with an optional sink for `WRITE`
    /// payloads and an optional source for `READ` requests.
    pub(crate) async fn process_stderr_with<S, Src>(
        &mut self,
        sink: Option<&mut S>,
        source: Option<&mut Src>,
    ) -> Result<(), ProtocolError>
    where
        S: AsyncWrite + Unpin + ?Sized,
        Src: AsyncRead + Unpin + ?Sized,
    {
        self.writer.flush().await.io_context("flushing request")?;
        let Connection {
            reader,
            writer,
            logger,
            ..
        } = self;
        stderr_loop(reader, Some(writer), logger.as_ref(), sink, source).await
    }

    /// Stream `source` to the daemon as length-prefixed frames while
    /// draining stderr from the read half of the socket.
    ///
    /// The two directions of the duplex stream are independent, so the
    /// upload and the drain run concurrently; by the time this returns no
    /// stderr byte is left unread. If both sides fail, the upload error
    /// wins and the drain error is logged and suppressed.
    pub(crate) async fn with_framed_source<R>(
        &mut self,
        source: &mut R,
    ) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.writer.flush().await.io_context("flushing request")?;
        let Connection {
            reader,
            writer,
            logger,
            ..
        } = self;

        let send = async {
            let mut sink = FramedSink::new(&mut *writer, DEFAULT_FRAME_SIZE);
            let mut buf = vec![0u8; DEFAULT_FRAME_SIZE];
            loop {
                let n = source
                    .read(&mut buf)
                    .await
                    .io_context("reading upload payload")?;
                if n == 0 {
                    break;
                }
                sink.write(&buf[..n]).await?;
            }
            sink.finish().await?;
            writer.flush().await.io_context("flushing upload")?;
            Ok::<_, ProtocolError>(())
        };

        let drain = stderr_loop::<tokio::io::Sink, tokio::io::Empty>(
            reader,
            None,
            logger.as_ref(),
            None,
            None,
        );

        let (sent, drained) = tokio::join!(send, drain);
        match sent {
            Ok(()) => drained,
            Err(send_err) => {
                if let Err(drain_err) = drained {
                    tracing::debug!("suppressed stderr error during failed upload: {drain_err}");
                }
                Err(send_err)
            }
        }
    }
}

/// Reject socket paths that cannot fit `sockaddr_un.sun_path` with its NUL
/// terminator.
fn check_socket_path(path: &Path) -> Result<(), ProtocolError> {
    use std::os::unix::ffi::OsStrExt;

    let addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    let max = addr.sun_path.len();
    let len = path.as_os_str().as_bytes().len();
    if len + 1 > max {
        return Err(ProtocolError::SocketPathTooLong {
            path: path.display().to_string(),
            len,
            max,
        });
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn current_cpu() -> Option<u64> {
    let cpu = unsafe { libc::sched_getcpu() };
    (cpu >= 0).then_some(cpu as u64)
}

#[cfg(not(target_os = "linux"))]
fn current_cpu() -> Option<u64> {
    None
}

/// The stderr tag loop shared by [`Connection::process_stderr_with`] and
/// the framed-upload drain (which runs without the write half).
async fn stderr_loop<S, Src>(
    reader: &mut ConnReader,
    mut writer: Option<&mut ConnWriter>,
    logger: &dyn ActivityLogger,
    mut sink: Option<&mut S>,
    mut source: Option<&mut Src>,
) -> Result<(), ProtocolError>
where
    S: AsyncWrite + Unpin + ?Sized,
    Src: AsyncRead + Unpin + ?Sized,
{
    loop {
        let tag = read_u64(reader).await.io_context("reading stderr tag")?;
        match Msg::try_from(tag)? {
            Msg::Write => {
                let data = read_bytes(reader).await?;
                let sink = sink.as_deref_mut().ok_or(ProtocolError::MissingSink)?;
                sink.write_all(&data)
                    .await
                    .io_context("forwarding daemon payload")?;
            }

            Msg::Read => {
                let source = source.as_deref_mut().ok_or(ProtocolError::MissingSource)?;
                let writer = writer.as_deref_mut().ok_or(ProtocolError::MissingSource)?;

                let len = read_u64(reader).await?;
                let want = len.min(READ_CHUNK) as usize;
                let mut buf = vec![0u8; want];
                let n = if want == 0 {
                    0
                } else {
                    source
                        .read(&mut buf)
                        .await
                        .io_context("reading upload source")?
                };
                // An empty string tells the daemon the source is drained.
                write_bytes(writer, &buf[..n]).await?;
                writer.flush().await.io_context("flushing upload chunk")?;
            }

            Msg::Error => {
                let message = read_string(reader).await?;
                let status = read_u64(reader).await?;
                return Err(ProtocolError::Daemon { status, message });
            }

            Msg::Next => {
                let text = read_bytes(reader).await?;
                let text = String::from_utf8_lossy(&text);
                logger.message(text.trim_end_matches('\n'));
            }

            Msg::StartActivity => {
                let id = read_u64(reader).await?;
                let level = read_u64(reader).await?;
                let activity_type = read_u64(reader).await?;
                let text = read_bytes(reader).await?;
                let fields = read_fields(reader).await?;
                let parent = read_u64(reader).await?;
                logger.start_activity(
                    id,
                    level,
                    activity_type,
                    &String::from_utf8_lossy(&text),
                    &fields,
                    parent,
                );
            }

            Msg::StopActivity => {
                let id = read_u64(reader).await?;
                logger.stop_activity(id);
            }

            Msg::Result => {
                let id = read_u64(reader).await?;
                let result_type = read_u64(reader).await?;
                let fields = read_fields(reader).await?;
                logger.result(id, result_type, &fields);
            }

            Msg::Last => return Ok(()),
        }
    }
}

async fn read_fields(reader: &mut ConnReader) -> Result<Vec<LoggerField>, ProtocolError> {
    let count = read_u64(reader).await?;
    if count > MAX_STRING_LIST_SIZE {
        return Err(ProtocolError::StringListTooLong {
            length: count,
            max: MAX_STRING_LIST_SIZE,
        });
    }

    let mut fields = Vec::with_capacity(count.min(64) as usize);
    for _ in 0..count {
        let tag = read_u64(reader).await?;
        fields.push(match tag {
            0 => LoggerField::Int(read_u64(reader).await?),
            1 => LoggerField::String(
                String::from_utf8_lossy(&read_bytes(reader).await?).into_owned(),
            ),
            other => return Err(ProtocolError::InvalidMsgCode(other)),
        });
    }
    Ok(fields)
}
