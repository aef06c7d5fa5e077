use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use anyhow::anyhow;
use thiserror::Error;
use tokio::{
    select,
    sync::{mpsc, watch},
};
use tracing::{debug, info, warn};

use crate::{
    message::{ChatMessage, Credentials, Inbound, MessagePattern},
    transport::{self, CloseHandle, Connector, LineTransport, TransportError, TransportOptions},
};

/// Relay address used when none is configured.
pub const DEFAULT_HOST: &str = "199.9.249.252";
pub const DEFAULT_PORT: u16 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Joined,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    HandshakeWrite,
    ProtocolViolation,
    Io,
    InvalidPattern,
}

/// Terminal session failures. Sink faults are never reported here; see
/// [`SessionEvent::SinkFailed`].
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("could not connect to the chat relay")]
    Connection(#[source] TransportError),
    #[error("failed to send {command} during the handshake")]
    HandshakeWrite {
        command: &'static str,
        #[source]
        source: TransportError,
    },
    #[error("relay violated the line protocol")]
    ProtocolViolation(#[source] TransportError),
    #[error("relay connection failed")]
    Io(#[source] TransportError),
    #[error("could not build the message pattern for #{channel}")]
    InvalidPattern {
        channel: String,
        #[source]
        source: regex::Error,
    },
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Connection(_) => ErrorKind::Connection,
            SessionError::HandshakeWrite { .. } => ErrorKind::HandshakeWrite,
            SessionError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            SessionError::Io(_) => ErrorKind::Io,
            SessionError::InvalidPattern { .. } => ErrorKind::InvalidPattern,
        }
    }

    fn from_stream(err: TransportError) -> Self {
        match err {
            TransportError::ProtocolViolation(_) => SessionError::ProtocolViolation(err),
            other => SessionError::Io(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("sink failed to handle message from {author}: {reason}")]
pub struct SinkError {
    pub author: String,
    pub reason: String,
}

/// Diagnostics emitted while a session runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Joined { channel: String },
    Pinged { reply: String },
    Unclassified { line: String },
    SinkFailed(SinkError),
    Ended { status: SessionStatus },
}

/// Receives chat messages, one at a time, from the session task.
pub trait MessageSink: Send {
    fn deliver(&mut self, message: ChatMessage) -> anyhow::Result<()>;
}

impl<F> MessageSink for F
where
    F: FnMut(ChatMessage) -> anyhow::Result<()> + Send,
{
    fn deliver(&mut self, message: ChatMessage) -> anyhow::Result<()> {
        self(message)
    }
}

/// Forwards messages into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink(pub mpsc::UnboundedSender<ChatMessage>);

impl MessageSink for ChannelSink {
    fn deliver(&mut self, message: ChatMessage) -> anyhow::Result<()> {
        self.0
            .send(message)
            .map_err(|_| anyhow!("message receiver was dropped"))
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub transport: TransportOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            transport: TransportOptions::default(),
        }
    }
}

/// Lets other tasks observe a session and stop it.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    close: CloseHandle,
    status: Arc<watch::Sender<SessionStatus>>,
}

impl SessionHandle {
    fn new() -> Self {
        let (status, _) = watch::channel(SessionStatus::Disconnected);
        Self {
            close: CloseHandle::new(),
            status: Arc::new(status),
        }
    }

    /// Closes the transport, which ends the receive loop. Safe to call any
    /// number of times, before the session starts or after it has ended.
    pub fn stop(&self) {
        if self.close.close() {
            debug!("session stop requested");
        }
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Waits until the status satisfies `predicate` and returns it.
    pub async fn wait_until<F>(&self, mut predicate: F) -> SessionStatus
    where
        F: FnMut(SessionStatus) -> bool,
    {
        let mut rx = self.status.subscribe();
        let reached = rx
            .wait_for(|status| predicate(*status))
            .await
            .map(|status| *status);
        reached.unwrap_or_else(|_| self.status())
    }

    /// Failed is terminal; everything else moves freely.
    fn transition(&self, next: SessionStatus) -> bool {
        self.status.send_if_modified(|current| {
            if *current == SessionStatus::Failed || *current == next {
                return false;
            }
            *current = next;
            true
        })
    }
}

/// One connect-to-disconnect lifetime against a single channel.
pub struct ChatSession {
    config: SessionConfig,
    credentials: Credentials,
    pattern: MessagePattern,
    handle: SessionHandle,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl ChatSession {
    pub fn new(config: SessionConfig, credentials: Credentials) -> Result<Self, SessionError> {
        let pattern = MessagePattern::for_channel(credentials.channel()).map_err(|source| {
            SessionError::InvalidPattern {
                channel: credentials.channel().to_string(),
                source,
            }
        })?;

        Ok(Self {
            config,
            credentials,
            pattern,
            handle: SessionHandle::new(),
            events: None,
        })
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn channel(&self) -> &str {
        self.credentials.channel()
    }

    /// Connects, joins the channel and processes lines until the session is
    /// stopped (`Ok`) or the connection fails (`Err`).
    ///
    /// Every chat message is handed to `sink` in arrival order. Failures inside
    /// the sink are reported as [`SessionEvent::SinkFailed`] and do not end
    /// the session.
    pub async fn run<C, S>(self, connector: C, mut sink: S) -> Result<(), SessionError>
    where
        C: Connector + Sync,
        S: MessageSink,
    {
        let result = self.drive(&connector, &mut sink).await;

        match &result {
            Ok(()) => {
                self.handle.transition(SessionStatus::Disconnected);
                info!(channel = %self.channel(), "session stopped");
            }
            Err(err) => {
                self.handle.transition(SessionStatus::Failed);
                warn!(channel = %self.channel(), error = ?err, "session failed");
            }
        }
        self.emit(SessionEvent::Ended {
            status: self.handle.status(),
        });

        result
    }

    async fn drive<C, S>(&self, connector: &C, sink: &mut S) -> Result<(), SessionError>
    where
        C: Connector + Sync,
        S: MessageSink,
    {
        if self.handle.close.is_closed() {
            debug!("session stopped before it started");
            return Ok(());
        }

        self.handle.transition(SessionStatus::Connecting);
        let Some(mut transport) = self.open(connector).await? else {
            return Ok(());
        };

        if !self.handshake(&mut transport).await? {
            return Ok(());
        }

        self.handle.transition(SessionStatus::Joined);
        info!(channel = %self.channel(), login = %self.credentials.login(), "joined channel");
        self.emit(SessionEvent::Joined {
            channel: self.channel().to_string(),
        });

        self.receive_loop(&mut transport, sink).await?;
        transport.shutdown().await;
        Ok(())
    }

    /// `None` when the session was stopped while connecting.
    async fn open<C>(&self, connector: &C) -> Result<Option<LineTransport<C::Stream>>, SessionError>
    where
        C: Connector + Sync,
    {
        let close = &self.handle.close;
        let connecting = transport::connect(
            connector,
            &self.config.host,
            self.config.port,
            self.config.transport,
            close,
        );

        select! {
            biased;
            () = close.closed() => Ok(None),
            result = connecting => result.map(Some).map_err(SessionError::Connection),
        }
    }

    /// Returns `false` when the session was stopped mid-handshake.
    async fn handshake<T>(&self, transport: &mut LineTransport<T>) -> Result<bool, SessionError>
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        for (command, line) in self.credentials.handshake_lines() {
            match transport.write_line(&line).await {
                Ok(()) => debug!(command, "sent handshake line"),
                Err(TransportError::Closed) => return Ok(false),
                Err(source) => return Err(SessionError::HandshakeWrite { command, source }),
            }
        }
        Ok(true)
    }

    async fn receive_loop<T, S>(
        &self,
        transport: &mut LineTransport<T>,
        sink: &mut S,
    ) -> Result<(), SessionError>
    where
        T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
        S: MessageSink,
    {
        loop {
            let line = match transport.read_line().await {
                Ok(line) => line,
                Err(TransportError::Closed) => return Ok(()),
                Err(err) => return Err(SessionError::from_stream(err)),
            };

            match self.pattern.classify(&line) {
                Inbound::Blank => {}
                Inbound::Ping { reply } => {
                    match transport.write_line(&reply).await {
                        Ok(()) => {}
                        Err(TransportError::Closed) => return Ok(()),
                        Err(err) => return Err(SessionError::from_stream(err)),
                    }
                    debug!(%reply, "answered keep-alive ping");
                    self.emit(SessionEvent::Pinged { reply });
                }
                Inbound::Chat(message) => self.dispatch(sink, message),
                Inbound::Unclassified(line) => {
                    info!(line, "unclassified line");
                    self.emit(SessionEvent::Unclassified {
                        line: line.to_string(),
                    });
                }
            }
        }
    }

    fn dispatch<S>(&self, sink: &mut S, message: ChatMessage)
    where
        S: MessageSink,
    {
        let author = message.author.clone();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| sink.deliver(message)));

        let reason = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(err)) => format!("{err:#}"),
            Err(payload) => panic_reason(payload.as_ref()),
        };

        warn!(%author, %reason, "sink failed, continuing");
        self.emit(SessionEvent::SinkFailed(SinkError { author, reason }));
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                debug!("session event receiver dropped");
            }
        }
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned());

    match detail {
        Some(detail) => format!("sink panicked: {detail}"),
        None => "sink panicked".to_string(),
    }
}
