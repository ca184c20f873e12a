//! Line-oriented transport to Tor's control port.
//!
//! The control protocol is plain text: every command is one CRLF-terminated
//! line and every reply is a sequence of lines. This module only moves
//! lines; framing and reply/event separation live in [`crate::session`].
//!
//! # Connection Methods
//!
//! | Method | Constructor | Typical address |
//! |--------|-------------|-----------------|
//! | TCP | [`ControlConnection::from_port`] | `127.0.0.1:9051` |
//! | Unix socket | [`ControlConnection::from_socket_file`] | `/run/tor/control` |
//!
//! # Credentials
//!
//! [`authentication_command`] builds the `AUTHENTICATE` line from whatever the
//! operator passed on the command line:
//!
//! | Credential | Sent as |
//! |------------|---------|
//! | none | `AUTHENTICATE` |
//! | `"secret"` (already quoted) | verbatim |
//! | hex string | verbatim (cookie contents) |
//! | path to a file | file bytes, hex-encoded (cookie file) |
//! | anything else | quoted and escaped password |

use std::path::Path;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::{TcpStream, UnixStream};
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// A bidirectional line channel to the control service.
///
/// Lines are passed without their CRLF terminator in both directions.
/// `read_line` must be cancellation safe: if its future is dropped before it
/// completes, no line may be lost.
#[async_trait]
pub trait Transport: Send {
    /// Sends one command line.
    async fn send_line(&mut self, line: &str) -> Result<()>;

    /// Reads the next line.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] once the peer has hung up.
    async fn read_line(&mut self) -> Result<String>;
}

type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// A control-port connection over TCP or a Unix domain socket.
pub struct ControlConnection {
    lines: Lines<BufReader<BoxedReader>>,
    writer: BoxedWriter,
    peer: String,
}

impl ControlConnection {
    /// Connects to a control port. `host` may be an address or a hostname.
    pub async fn from_port(host: &str, port: u16) -> Result<Self> {
        let stream = TcpStream::connect((host, port)).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self::from_halves(
            Box::new(reader),
            Box::new(writer),
            format!("{}:{}", host, port),
        ))
    }

    /// Connects to a control socket file.
    pub async fn from_socket_file(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self::from_halves(
            Box::new(reader),
            Box::new(writer),
            path.display().to_string(),
        ))
    }

    fn from_halves(reader: BoxedReader, writer: BoxedWriter, peer: String) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
            peer,
        }
    }

    /// Human-readable description of the remote end.
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

#[async_trait]
impl Transport for ControlConnection {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await.map_err(io_error)?;
        self.writer.write_all(b"\r\n").await.map_err(io_error)?;
        self.writer.flush().await.map_err(io_error)
    }

    async fn read_line(&mut self) -> Result<String> {
        // `Lines::next_line` is cancellation safe and strips "\n" / "\r\n".
        match self.lines.next_line().await {
            Ok(Some(line)) => Ok(line),
            Ok(None) => Err(Error::ConnectionClosed),
            Err(e) => Err(io_error(e)),
        }
    }
}

fn io_error(e: std::io::Error) -> Error {
    let err = Error::Io(e);
    if err.is_disconnect() {
        Error::ConnectionClosed
    } else {
        err
    }
}

/// A wrapper for sensitive credential data that clears itself on drop.
///
/// Debug output never shows the contents.
///
/// ```rust
/// use fasttor_rs::SecurePassword;
///
/// let password = SecurePassword::new("hunter2".to_string());
/// assert_eq!(password.as_str(), "hunter2");
/// assert!(!format!("{:?}", password).contains("hunter2"));
/// ```
#[derive(Clone)]
pub struct SecurePassword(String);

impl SecurePassword {
    /// Wraps a credential.
    pub fn new(password: String) -> Self {
        Self(password)
    }

    /// Returns the credential.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Drop for SecurePassword {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SecurePassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecurePassword([REDACTED])")
    }
}

/// Builds the `AUTHENTICATE` command line for a credential.
///
/// The caller owns the returned line and should zeroize it once sent.
///
/// # Errors
///
/// Returns [`Error::Io`] if the credential names a cookie file that cannot
/// be read.
pub async fn authentication_command(credential: Option<&SecurePassword>) -> Result<String> {
    let Some(credential) = credential else {
        return Ok("AUTHENTICATE".to_string());
    };
    let value = credential.as_str();

    if value.starts_with('"') || (!value.is_empty() && value.chars().all(|c| c.is_ascii_hexdigit()))
    {
        return Ok(format!("AUTHENTICATE {}", value));
    }

    let is_file = tokio::fs::metadata(value)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false);
    if is_file {
        return cookie_authentication_command(Path::new(value)).await;
    }

    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    Ok(format!("AUTHENTICATE \"{}\"", escaped))
}

/// Builds `AUTHENTICATE <hex>` from the contents of a cookie file.
pub async fn cookie_authentication_command(path: &Path) -> Result<String> {
    let mut cookie = tokio::fs::read(path).await?;
    let line = format!("AUTHENTICATE {}", hex::encode_upper(&cookie));
    cookie.zeroize();
    Ok(line)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;

    use super::*;

    /// Script line that makes one `read_line` wait forever. The read after
    /// a cancelled wait continues with the next line.
    pub(crate) const STALL: &str = "<stall>";

    /// In-memory transport replaying a fixed script of incoming lines and
    /// recording everything sent. An exhausted script reads as a hang-up.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedTransport {
        incoming: VecDeque<String>,
        pub(crate) sent: Vec<String>,
    }

    impl ScriptedTransport {
        pub(crate) fn new(lines: &[&str]) -> Self {
            Self {
                incoming: lines.iter().map(|l| l.to_string()).collect(),
                sent: Vec::new(),
            }
        }

        pub(crate) fn push(&mut self, lines: &[&str]) {
            self.incoming.extend(lines.iter().map(|l| l.to_string()));
        }

        pub(crate) fn remaining(&self) -> usize {
            self.incoming.len()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send_line(&mut self, line: &str) -> Result<()> {
            self.sent.push(line.to_string());
            Ok(())
        }

        async fn read_line(&mut self) -> Result<String> {
            match self.incoming.pop_front() {
                Some(line) if line == STALL => std::future::pending().await,
                Some(line) => Ok(line),
                None => Err(Error::ConnectionClosed),
            }
        }
    }
}
