//! Control protocol spoken over the raw control socket.
//!
//! Messages are plain ASCII with no delimiter and no length prefix. Each side
//! writes one message per logical event with a single write and expects the
//! peer to receive it with a single read.

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TunnelError;

/// Largest message accepted by a single protocol read.
pub const MAX_MESSAGE_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// client -> relay: request a public forward for a port
    Tunnel(u16),
    /// relay -> client: request accepted
    Ok(String),
    /// relay -> client: request rejected, the relay closes the connection
    Error(String),
    /// relay -> client: a public connection arrived on the port
    Conn(u16),
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tunnel(port) => write!(f, "TUNNEL {port}"),
            Self::Ok(text) => write!(f, "OK {text}"),
            Self::Error(text) => write!(f, "ERROR {text}"),
            Self::Conn(port) => write!(f, "CONN {port}"),
        }
    }
}

/// What the client made of the relay's answer to its `TUNNEL` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Accepted(String),
    Rejected(String),
    Unexpected(String),
}

/// Parses a `TUNNEL <port>` request.
///
/// The port is any signed integer; range checks belong to the relay so that
/// a bad port still gets an `ERROR` reply. Anything after the integer is
/// ignored.
#[must_use]
pub fn parse_request(raw: &str) -> Option<i64> {
    let rest = raw.strip_prefix("TUNNEL ")?.trim_start();
    let sign_len = usize::from(rest.starts_with(['+', '-']));
    let digits = rest[sign_len..]
        .find(|c: char| !c.is_ascii_digit())
        .map_or(rest.len(), |end| sign_len + end);
    rest[..digits].parse().ok()
}

/// Classifies the relay's reply. Only the literal `OK` and `ERROR` prefixes
/// carry meaning; the rest of the line is an opaque diagnostic.
#[must_use]
pub fn parse_reply(raw: &str) -> Reply {
    if let Some(rest) = raw.strip_prefix("ERROR") {
        Reply::Rejected(rest.trim_start().to_string())
    } else if let Some(rest) = raw.strip_prefix("OK") {
        Reply::Accepted(rest.trim_start().to_string())
    } else {
        Reply::Unexpected(raw.to_string())
    }
}

/// Parses a `CONN <port>` signal: the `CONN` keyword and exactly one integer
/// token separated by a single space.
#[must_use]
pub fn parse_signal(raw: &str) -> Option<u16> {
    let mut parts = raw.split(' ');
    if parts.next()? != "CONN" {
        return None;
    }
    let port = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(port)
}

/// Writes one message with a single write call.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<(), TunnelError> {
    writer.write_all(message.to_string().as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one message with a single read call.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, TunnelError> {
    let mut buffer = [0u8; MAX_MESSAGE_LEN];
    let n = reader.read(&mut buffer).await?;
    if n == 0 {
        return Err(TunnelError::ConnectionLost("closed by peer".into()));
    }
    Ok(String::from_utf8_lossy(&buffer[..n]).into_owned())
}
