use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const PING: &str = "PING";
const PONG: &str = "PONG";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CredentialsError {
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },
    #[error("{field} cannot contain whitespace or line breaks")]
    InvalidCharacter { field: &'static str },
}

/// Login, secret and channel for one session. The secret never shows up in
/// `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    login: String,
    secret: String,
    channel: String,
}

impl Credentials {
    /// Validates the three fields. A leading `#` on the channel is dropped.
    pub fn new(
        login: impl Into<String>,
        secret: impl Into<String>,
        channel: impl Into<String>,
    ) -> Result<Self, CredentialsError> {
        let channel = channel.into();
        let channel = channel.strip_prefix('#').unwrap_or(&channel).to_string();

        Ok(Self {
            login: validate_field("login", login.into())?,
            secret: validate_field("secret", secret.into())?,
            channel: validate_field("channel", channel)?,
        })
    }

    pub fn login(&self) -> &str {
        &self.login
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// The `PASS`, `NICK` and `JOIN` lines, in the order they must be sent,
    /// each paired with its command name for logging.
    pub fn handshake_lines(&self) -> [(&'static str, String); 3] {
        [
            ("PASS", format!("PASS {}", self.secret)),
            ("NICK", format!("NICK {}", self.login)),
            ("JOIN", format!("JOIN #{}", self.channel)),
        ]
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("secret", &"<redacted>")
            .field("channel", &self.channel)
            .finish()
    }
}

fn validate_field(field: &'static str, value: String) -> Result<String, CredentialsError> {
    if value.is_empty() {
        return Err(CredentialsError::Empty { field });
    }
    if value.chars().any(char::is_whitespace) {
        return Err(CredentialsError::InvalidCharacter { field });
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub author: String,
    pub body: String,
}

impl fmt::Display for ChatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.author, self.body)
    }
}

/// What a single inbound line turned out to be.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound<'a> {
    Blank,
    /// Keep-alive ping, carrying the line to send back.
    Ping { reply: String },
    Chat(ChatMessage),
    Unclassified(&'a str),
}

/// Recognises `PRIVMSG` lines addressed to one channel.
///
/// The channel name is baked into the compiled pattern, so each session owns
/// its own instance.
#[derive(Debug, Clone)]
pub struct MessagePattern {
    regex: Regex,
}

impl MessagePattern {
    pub fn for_channel(channel: &str) -> Result<Self, regex::Error> {
        let pattern = format!(
            r"^:([A-Za-z0-9_]+)!.*PRIVMSG #{} :(.*)$",
            regex::escape(channel)
        );
        Ok(Self {
            regex: Regex::new(&pattern)?,
        })
    }

    /// Classifies `line`. Keep-alive pings win over everything else so they
    /// are answered before any content is inspected.
    pub fn classify<'a>(&self, line: &'a str) -> Inbound<'a> {
        if line.is_empty() {
            return Inbound::Blank;
        }

        if let Some(rest) = line.strip_prefix(PING) {
            return Inbound::Ping {
                reply: format!("{PONG}{rest}"),
            };
        }

        let Some(captures) = self.regex.captures(line) else {
            return Inbound::Unclassified(line);
        };
        match (captures.get(1), captures.get(2)) {
            (Some(author), Some(body)) => Inbound::Chat(ChatMessage {
                author: author.as_str().to_string(),
                body: body.as_str().to_string(),
            }),
            _ => Inbound::Unclassified(line),
        }
    }
}
