use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::{
    client::{DEFAULT_HOST, DEFAULT_PORT, SessionConfig},
    message::{Credentials, CredentialsError},
    transport::{DEFAULT_MAX_LINE_LENGTH, TransportOptions},
};

#[derive(Parser)]
#[command(author, version, about = "Follow a Twitch channel's chat from the terminal", long_about = None)]
pub struct Cli {
    /// Account name sent with NICK.
    #[arg(long)]
    pub login: String,

    /// OAuth token sent with PASS, e.g. `oauth:abc123`.
    #[arg(long, env = "TWITCH_SECRET", hide_env_values = true)]
    pub secret: String,

    /// Channel to join, with or without the leading `#`.
    #[arg(long)]
    pub channel: String,

    /// Chat relay host.
    #[arg(long, default_value = DEFAULT_HOST)]
    pub host: String,

    /// Chat relay port.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Seconds to wait for the TCP connection before giving up.
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// Longest inbound line, in bytes, before the session is aborted.
    #[arg(long, default_value_t = DEFAULT_MAX_LINE_LENGTH)]
    pub max_line_length: usize,

    /// How chat messages are written to stdout.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// `author: body`
    Text,
    /// One JSON object per line.
    Json,
}

impl Cli {
    pub fn credentials(&self) -> Result<Credentials, CredentialsError> {
        Credentials::new(&self.login, &self.secret, &self.channel)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            host: self.host.clone(),
            port: self.port,
            transport: TransportOptions {
                connect_timeout: Duration::from_secs(self.connect_timeout_secs),
                max_line_length: self.max_line_length,
            },
        }
    }
}
