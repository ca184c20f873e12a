//! Typed asynchronous events.
//!
//! Every queued [`Event`] is parsed once, at the boundary, into a
//! [`ControlEvent`]. Only the shapes the event loop acts on get their own
//! variant; everything else is kept as [`ControlEvent::Unknown`].
//!
//! | Wire form | Variant |
//! |-----------|---------|
//! | `STREAM <id> NEW <circ> <target> ... PURPOSE=<p>` | [`StreamNew`](ControlEvent::StreamNew) |
//! | `STREAM <id> DETACHED <circ> <target> REASON=<r> [REMOTE_REASON=<rr>]` | [`StreamDetached`](ControlEvent::StreamDetached) |
//! | `CIRC <id> BUILT ...` | [`CircuitBuilt`](ControlEvent::CircuitBuilt) |
//! | `CIRC <id> CLOSED\|FAILED ...` | [`CircuitClosedOrFailed`](ControlEvent::CircuitClosedOrFailed) |

use std::fmt;

use crate::session::Event;

/// Why a stream was opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamPurpose {
    /// An application connection.
    User,
    /// A name lookup (RESOLVE).
    DnsRequest,
    /// Any other purpose, or none given.
    Other(String),
}

impl StreamPurpose {
    fn from_wire(value: Option<&str>) -> Self {
        match value {
            Some("USER") => StreamPurpose::User,
            Some("DNS_REQUEST") => StreamPurpose::DnsRequest,
            Some(other) => StreamPurpose::Other(other.to_string()),
            None => StreamPurpose::Other(String::new()),
        }
    }
}

/// Why a stream was detached from its circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetachReason {
    /// `REASON=TIMEOUT`
    Timeout,
    /// `REASON=END REMOTE_REASON=EXITPOLICY`
    ExitPolicy,
    /// `REASON=END REMOTE_REASON=NOROUTE`
    NoRoute,
    /// Anything else, as `REASON[/REMOTE_REASON]`.
    Other(String),
}

impl DetachReason {
    fn from_wire(reason: Option<&str>, remote: Option<&str>) -> Self {
        match (reason, remote) {
            (Some("TIMEOUT"), _) => DetachReason::Timeout,
            (Some("END"), Some("EXITPOLICY")) => DetachReason::ExitPolicy,
            (Some("END"), Some("NOROUTE")) => DetachReason::NoRoute,
            (reason, Some(remote)) => {
                DetachReason::Other(format!("{}/{}", reason.unwrap_or(""), remote))
            }
            (reason, None) => DetachReason::Other(reason.unwrap_or("").to_string()),
        }
    }

    /// Returns true if Tor should be given the stream to route itself.
    pub fn is_reroutable(&self) -> bool {
        !matches!(self, DetachReason::Other(_))
    }
}

/// Terminal status of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitEnd {
    Closed,
    Failed,
}

impl fmt::Display for CircuitEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitEnd::Closed => write!(f, "CLOSED"),
            CircuitEnd::Failed => write!(f, "FAILED"),
        }
    }
}

/// An asynchronous notification, parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    StreamNew {
        stream_id: String,
        circuit_id: String,
        target: String,
        purpose: StreamPurpose,
    },
    StreamDetached {
        stream_id: String,
        target: String,
        reason: DetachReason,
    },
    CircuitBuilt {
        circuit_id: String,
    },
    CircuitClosedOrFailed {
        circuit_id: String,
        status: CircuitEnd,
    },
    /// Any other event, first line verbatim.
    Unknown(String),
}

impl ControlEvent {
    /// Parses the first line of an event.
    ///
    /// ```rust
    /// use fasttor_rs::events::{ControlEvent, StreamPurpose};
    ///
    /// let event = ControlEvent::parse("STREAM 42 NEW 0 example.com:443 SOURCE_ADDR=127.0.0.1:4000 PURPOSE=USER");
    /// assert_eq!(
    ///     event,
    ///     ControlEvent::StreamNew {
    ///         stream_id: "42".to_string(),
    ///         circuit_id: "0".to_string(),
    ///         target: "example.com:443".to_string(),
    ///         purpose: StreamPurpose::User,
    ///     }
    /// );
    /// ```
    pub fn parse(line: &str) -> Self {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let unknown = || ControlEvent::Unknown(line.to_string());

        match tokens.as_slice() {
            ["STREAM", stream_id, "NEW", circuit_id, target, rest @ ..] => ControlEvent::StreamNew {
                stream_id: stream_id.to_string(),
                circuit_id: circuit_id.to_string(),
                target: target.to_string(),
                purpose: StreamPurpose::from_wire(keyword(rest, "PURPOSE")),
            },
            ["STREAM", stream_id, "DETACHED", _circuit_id, target, rest @ ..] => {
                ControlEvent::StreamDetached {
                    stream_id: stream_id.to_string(),
                    target: target.to_string(),
                    reason: DetachReason::from_wire(
                        keyword(rest, "REASON"),
                        keyword(rest, "REMOTE_REASON"),
                    ),
                }
            }
            ["CIRC", circuit_id, "BUILT", ..] => ControlEvent::CircuitBuilt {
                circuit_id: circuit_id.to_string(),
            },
            ["CIRC", circuit_id, status @ ("CLOSED" | "FAILED"), ..] => {
                ControlEvent::CircuitClosedOrFailed {
                    circuit_id: circuit_id.to_string(),
                    status: if *status == "CLOSED" {
                        CircuitEnd::Closed
                    } else {
                        CircuitEnd::Failed
                    },
                }
            }
            _ => unknown(),
        }
    }
}

impl From<&Event> for ControlEvent {
    fn from(event: &Event) -> Self {
        ControlEvent::parse(event.lines.first().map(String::as_str).unwrap_or(""))
    }
}

fn keyword<'a>(tokens: &[&'a str], key: &str) -> Option<&'a str> {
    tokens
        .iter()
        .filter_map(|t| t.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_new_dns() {
        let event = ControlEvent::parse(
            "STREAM 7 NEW 0 torproject.org:0 SOURCE_ADDR=127.0.0.1:5353 PURPOSE=DNS_REQUEST",
        );
        assert!(matches!(
            event,
            ControlEvent::StreamNew { purpose: StreamPurpose::DnsRequest, .. }
        ));
    }

    #[test]
    fn test_stream_new_without_purpose() {
        match ControlEvent::parse("STREAM 7 NEW 12 [2001:db8::1]:80") {
            ControlEvent::StreamNew {
                circuit_id,
                target,
                purpose,
                ..
            } => {
                assert_eq!(circuit_id, "12");
                assert_eq!(target, "[2001:db8::1]:80");
                assert_eq!(purpose, StreamPurpose::Other(String::new()));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_stream_detached_reasons() {
        let cases = [
            ("REASON=TIMEOUT", DetachReason::Timeout),
            ("REASON=END REMOTE_REASON=EXITPOLICY", DetachReason::ExitPolicy),
            ("REASON=END REMOTE_REASON=NOROUTE", DetachReason::NoRoute),
            ("REASON=END REMOTE_REASON=DONE", DetachReason::Other("END/DONE".to_string())),
            ("REASON=MISC", DetachReason::Other("MISC".to_string())),
        ];
        for (suffix, expected) in cases {
            let line = format!("STREAM 3 DETACHED 5 example.com:80 {}", suffix);
            match ControlEvent::parse(&line) {
                ControlEvent::StreamDetached {
                    stream_id,
                    target,
                    reason,
                } => {
                    assert_eq!(stream_id, "3");
                    assert_eq!(target, "example.com:80");
                    assert_eq!(reason, expected);
                }
                other => panic!("unexpected: {:?}", other),
            }
        }
        assert!(DetachReason::Timeout.is_reroutable());
        assert!(!DetachReason::Other("MISC".to_string()).is_reroutable());
    }

    #[test]
    fn test_circuit_events() {
        assert_eq!(
            ControlEvent::parse("CIRC 5 BUILT $AAAA~a,$BBBB~b PURPOSE=GENERAL"),
            ControlEvent::CircuitBuilt {
                circuit_id: "5".to_string()
            }
        );
        assert_eq!(
            ControlEvent::parse("CIRC 5 FAILED $AAAA~a REASON=TIMEOUT"),
            ControlEvent::CircuitClosedOrFailed {
                circuit_id: "5".to_string(),
                status: CircuitEnd::Failed
            }
        );
        assert_eq!(
            ControlEvent::parse("CIRC 6 CLOSED"),
            ControlEvent::CircuitClosedOrFailed {
                circuit_id: "6".to_string(),
                status: CircuitEnd::Closed
            }
        );
    }

    #[test]
    fn test_other_events_are_unknown() {
        for line in ["CIRC 5 LAUNCHED", "STREAM 1 SUCCEEDED 5 a:80", "STREAM 1", ""] {
            assert_eq!(ControlEvent::parse(line), ControlEvent::Unknown(line.to_string()));
        }
    }

    #[test]
    fn test_from_event_uses_first_line() {
        let event = Event {
            lines: vec!["CIRC 9 BUILT".to_string(), "ignored".to_string()],
        };
        assert_eq!(
            ControlEvent::from(&event),
            ControlEvent::CircuitBuilt {
                circuit_id: "9".to_string()
            }
        );
    }
}
