//! Line-protocol client for a Twitch chat relay.
//!
//! A session connects over plain TCP, authenticates with `PASS`/`NICK`, joins
//! one channel and then reads server lines until it is stopped or the
//! connection fails. Each module covers one concern:
//!
//! - [`transport`] frames a byte stream into CRLF lines, enforces a maximum
//!   line length and lets another task abandon a pending read.
//! - [`message`] holds credentials, the [`message::ChatMessage`] value and the
//!   per-channel classifier that tells chat lines, keep-alive pings and
//!   everything else apart.
//! - [`client`] drives a session: handshake, receive loop, `PONG` replies,
//!   delivery to a [`client::MessageSink`] and diagnostics.
//! - [`cli`] parses the command-line interface of the bundled binary.
//!
//! Unit tests run sessions against in-memory duplex streams; the integration
//! tests in `tests/` use a fake relay on a real TCP socket.

pub mod cli;
pub mod client;
pub mod message;
pub mod transport;
