//! Error types for fasttor-rs.
//!
//! This module defines the [`enum@Error`] enum covering every failure the
//! controller can run into, from a malformed control-port line to an exit
//! that refuses to carry a stream.
//!
//! # Error Categories
//!
//! ```text
//!   Error
//!   ├── Io                 ◄── Socket and file I/O failures
//!   ├── ConnectionClosed   ◄── Tor hung up (clean end of the main loop)
//!   ├── Config             ◄── Invalid configuration or CLI input
//!   ├── Authentication     ◄── AUTHENTICATE was refused
//!   ├── ProtocolParse      ◄── Malformed reply framing (channel untrusted)
//!   ├── Desync             ◄── A reply arrived with no command outstanding
//!   ├── Command            ◄── A command that must succeed did not
//!   ├── RouterParse        ◄── Malformed router status entry
//!   ├── PortSpecParse      ◄── Malformed accept/reject policy text
//!   ├── NoSuitableCircuit  ◄── No guard or no exit survived filtering
//!   ├── RouterNotFound     ◄── An explicitly named router is not a candidate
//!   ├── CircuitExtension   ◄── EXTENDCIRCUIT acknowledgement not understood
//!   └── AttachStream       ◄── ATTACHSTREAM failed in a non-benign way
//! ```
//!
//! # Recovery Guide
//!
//! | Error | Recoverable | Action taken by the event loop |
//! |-------|-------------|--------------------------------|
//! | [`ConnectionClosed`](Error::ConnectionClosed) | n/a | Exit cleanly |
//! | [`ProtocolParse`](Error::ProtocolParse) | No | Shut down |
//! | [`Desync`](Error::Desync) | No | Shut down |
//! | [`RouterParse`](Error::RouterParse) | No | Abort startup |
//! | [`PortSpecParse`](Error::PortSpecParse) | No | Abort startup |
//! | [`NoSuitableCircuit`](Error::NoSuitableCircuit) | No | Shut down |
//! | [`CircuitExtension`](Error::CircuitExtension) | No | Shut down |
//! | [`AttachStream`](Error::AttachStream) | No | Shut down |
//!
//! Benign attach outcomes (unknown stream, generic failure, lost circuit)
//! never surface as errors; see [`crate::circuit::CircuitController::attach_stream`].
//!
//! # Example
//!
//! ```rust
//! use fasttor_rs::{Error, PortRangeSet};
//!
//! match PortRangeSet::parse_policy("permit 80") {
//!     Err(Error::PortSpecParse(msg)) => println!("bad policy: {}", msg),
//!     other => panic!("unexpected: {:?}", other),
//! }
//! ```

use thiserror::Error;

/// Errors that can occur while controlling Tor.
///
/// # Example
///
/// ```rust
/// use fasttor_rs::Error;
///
/// fn describe(err: &Error) -> &'static str {
///     if err.is_disconnect() {
///         "tor went away"
///     } else {
///         "fatal"
///     }
/// }
///
/// assert_eq!(describe(&Error::ConnectionClosed), "tor went away");
/// ```
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the control connection or a local file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The control connection reached end-of-stream or was aborted.
    #[error("control connection closed")]
    ConnectionClosed,

    /// Configuration error.
    ///
    /// Fix the configuration file or command-line arguments.
    #[error("configuration error: {0}")]
    Config(String),

    /// Tor refused our credentials.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// A control-port line did not follow the reply framing rules.
    ///
    /// Once raised the connection can no longer be trusted.
    #[error("malformed control reply: {0}")]
    ProtocolParse(String),

    /// A synchronous reply arrived while no command was outstanding.
    #[error("reply out of sequence: {0}")]
    Desync(String),

    /// A command that has to succeed returned a non-250 reply.
    #[error("command '{command}' failed: {code} {message}")]
    Command {
        /// Command verb and arguments, with secrets removed.
        command: String,
        /// Three-digit status code from Tor.
        code: String,
        /// First payload line of the reply.
        message: String,
    },

    /// A router status entry could not be parsed.
    #[error("router status parse error: {0}")]
    RouterParse(String),

    /// A port policy could not be parsed.
    #[error("port policy parse error: {0}")]
    PortSpecParse(String),

    /// No usable guard or exit remains after filtering.
    #[error("no suitable circuit: {guards} guards, {exits} exits")]
    NoSuitableCircuit {
        /// Number of guard candidates found.
        guards: usize,
        /// Number of exit candidates found.
        exits: usize,
    },

    /// A router requested by nickname is not among the candidates.
    #[error("router not found among candidates: {0}")]
    RouterNotFound(String),

    /// The EXTENDCIRCUIT acknowledgement did not name a circuit.
    #[error("failed to extend circuit: {0}")]
    CircuitExtension(String),

    /// ATTACHSTREAM failed with an outcome we cannot work around.
    #[error("failed to attach stream {stream_id} to circuit {circuit_id}: {code} {message}")]
    AttachStream {
        /// Stream that could not be attached.
        stream_id: String,
        /// Circuit the stream was being attached to.
        circuit_id: String,
        /// Three-digit status code from Tor.
        code: String,
        /// First payload line of the reply.
        message: String,
    },
}

impl Error {
    /// Returns true if this error means Tor closed the control connection.
    ///
    /// The event loop treats these as a normal end of operation rather than
    /// a failure.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::ConnectionClosed => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Result type alias for fasttor-rs operations.
pub type Result<T> = std::result::Result<T, Error>;
