//! Line framing over a byte stream.
//!
//! [`LineTransport`] turns any `AsyncRead + AsyncWrite` stream into a pair of
//! line operations: [`LineTransport::read_line`] waits for the next
//! CRLF-terminated line (a bare LF is accepted as well) and
//! [`LineTransport::write_line`] appends CRLF and flushes immediately so every
//! protocol line reaches the peer without batching.
//!
//! A pending read or write can be abandoned from any task through a
//! [`CloseHandle`]; it then resolves with [`TransportError::Closed`] instead of
//! waiting for the peer.

use std::{future::Future, io, time::Duration};

use futures_util::StreamExt;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    net::TcpStream,
    select,
    time::timeout,
};
use tokio_util::{
    codec::{FramedRead, LinesCodec, LinesCodecError},
    sync::CancellationToken,
};
use tracing::{debug, warn};

/// Longest accepted line in bytes, not counting the delimiter.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8 * 1024;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const LINE_DELIMITER: &[u8] = b"\r\n";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {addr}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("timed out connecting to {addr} after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("peer closed the connection")]
    EndOfStream,
    #[error("connection was closed locally")]
    Closed,
    #[error("transport i/o failed")]
    Io(#[from] io::Error),
}

/// Opens the byte streams a [`LineTransport`] runs over.
pub trait Connector {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Plain TCP, no TLS.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    pub max_line_length: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

/// Cloneable, idempotent close signal shared between a transport and the
/// tasks that may want to tear it down.
#[derive(Debug, Clone, Default)]
pub struct CloseHandle {
    token: CancellationToken,
}

impl CloseHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the transport closed. Returns `true` only for the first call.
    pub fn close(&self) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.token.cancel();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once [`CloseHandle::close`] has been called on any clone.
    pub async fn closed(&self) {
        self.token.cancelled().await;
    }
}

/// Opens a stream through `connector` and wraps it in a [`LineTransport`].
pub async fn connect<C>(
    connector: &C,
    host: &str,
    port: u16,
    options: TransportOptions,
    close: &CloseHandle,
) -> Result<LineTransport<C::Stream>, TransportError>
where
    C: Connector,
{
    let addr = format!("{host}:{port}");
    let stream = match timeout(options.connect_timeout, connector.connect(host, port)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => return Err(TransportError::Connect { addr, source }),
        Err(_) => {
            return Err(TransportError::ConnectTimeout {
                addr,
                timeout: options.connect_timeout,
            });
        }
    };

    debug!(%addr, "transport connected");
    Ok(LineTransport::new(stream, options.max_line_length, close))
}

pub struct LineTransport<S> {
    reader: FramedRead<ReadHalf<S>, LinesCodec>,
    writer: WriteHalf<S>,
    max_line_length: usize,
    close: CloseHandle,
}

impl<S> LineTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, max_line_length: usize, close: &CloseHandle) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        // One spare byte for the `\r` of a CRLF delimiter; the exact bound is
        // checked in `read_line` once the delimiter is stripped.
        let codec = LinesCodec::new_with_max_length(max_line_length.saturating_add(1));

        Self {
            reader: FramedRead::new(reader, codec),
            writer,
            max_line_length,
            close: close.clone(),
        }
    }

    pub fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }

    /// Waits for the next line and returns it without its delimiter.
    ///
    /// An empty string is a valid line. Fails with
    /// [`TransportError::EndOfStream`] when the peer hangs up and with
    /// [`TransportError::Closed`] when the transport is closed locally, even if
    /// the read was already pending.
    pub async fn read_line(&mut self) -> Result<String, TransportError> {
        if self.close.is_closed() {
            return Err(TransportError::Closed);
        }

        let next = select! {
            biased;
            () = self.close.closed() => return Err(TransportError::Closed),
            next = self.reader.next() => next,
        };

        match next {
            Some(Ok(line)) if line.len() > self.max_line_length => {
                Err(TransportError::ProtocolViolation(format!(
                    "line of {} bytes exceeds the {} byte limit",
                    line.len(),
                    self.max_line_length
                )))
            }
            Some(Ok(line)) => Ok(line),
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                Err(TransportError::ProtocolViolation(format!(
                    "line exceeds the {} byte limit",
                    self.max_line_length
                )))
            }
            Some(Err(LinesCodecError::Io(err))) if err.kind() == io::ErrorKind::InvalidData => Err(
                TransportError::ProtocolViolation("line is not valid UTF-8".to_string()),
            ),
            Some(Err(LinesCodecError::Io(err))) => Err(TransportError::Io(err)),
            None => Err(TransportError::EndOfStream),
        }
    }

    /// Writes `line` followed by CRLF and flushes.
    pub async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        if self.close.is_closed() {
            return Err(TransportError::Closed);
        }
        if line.contains(['\r', '\n']) {
            return Err(TransportError::ProtocolViolation(
                "outgoing line contains a line break".to_string(),
            ));
        }

        let mut encoded = Vec::with_capacity(line.len() + LINE_DELIMITER.len());
        encoded.extend_from_slice(line.as_bytes());
        encoded.extend_from_slice(LINE_DELIMITER);

        // A peer that stops reading must not keep a close from taking effect.
        let writer = &mut self.writer;
        select! {
            biased;
            () = self.close.closed() => Err(TransportError::Closed),
            written = async {
                writer.write_all(&encoded).await?;
                writer.flush().await
            } => written.map_err(TransportError::Io),
        }
    }

    /// Closes the transport and shuts down the write half.
    pub async fn shutdown(mut self) {
        self.close.close();
        if let Err(error) = self.writer.shutdown().await {
            warn!(?error, "failed to shut down transport writer cleanly");
        }
    }
}
