//! Control protocol session: reply/event demultiplexing.
//!
//! Tor answers commands and pushes asynchronous notifications over the same
//! connection. Every line starts with a three-digit status code followed by a
//! separator character that tells how the line relates to the next one:
//!
//! ```text
//!   250-version=0.4.8.9        ◄── '-' continuation
//!   250+ns/all=                ◄── '+' data block follows
//!   r moria1 lpXfw1/+...        ◄── raw payload
//!   ..dot-stuffed              ◄── leading ".." unstuffed to "."
//!   .                          ◄── end of data block
//!   250 OK                     ◄── ' ' terminal line of the group
//!
//!   650 CIRC 12 BUILT ...      ◄── code 650: asynchronous event
//! ```
//!
//! [`ProtocolSession::update`] reads lines until one group is complete. Event
//! groups are queued in arrival order; any other group is a [`Reply`] and is
//! handed back to the caller. The group being accumulated lives in the
//! session, so a cancelled `update` resumes where it stopped.
//!
//! Only one command is ever outstanding: [`ProtocolSession::exec_command`]
//! sends a line and then pumps `update` until the matching reply arrives.
//! If that wait is cancelled, the late reply is read and dropped before the
//! next command goes out.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use async_trait::async_trait;
use zeroize::Zeroize;

use crate::config::LogLevel;
use crate::error::{Error, Result};
use crate::logger::plog;
use crate::selection::CountryLookup;
use crate::transport::{
    authentication_command, cookie_authentication_command, SecurePassword, Transport,
};

/// Status code carried by every asynchronous event line.
pub const ASYNC_EVENT_CODE: &str = "650";

/// Status code of a successful reply.
pub const OK_CODE: &str = "250";

/// The complete reply to one synchronous command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Three-character status code of the terminal line.
    pub code: String,
    /// Payload lines, prefix removed, in wire order.
    pub lines: Vec<String>,
}

impl Reply {
    /// Returns true for a `250` reply.
    pub fn is_ok(&self) -> bool {
        self.code == OK_CODE
    }

    /// First payload line, or an empty string.
    pub fn first_line(&self) -> &str {
        self.lines.first().map(String::as_str).unwrap_or("")
    }
}

/// One asynchronous notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Payload lines, prefix removed, in wire order.
    pub lines: Vec<String>,
}

/// Authentication details from `PROTOCOLINFO 1`.
///
/// ```text
///   250-PROTOCOLINFO 1
///   250-AUTH METHODS=COOKIE,SAFECOOKIE COOKIEFILE="/run/tor/control.authcookie"
///   250-VERSION Tor="0.4.8.9"
///   250 OK
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProtocolInfo {
    /// Methods listed after `METHODS=`, e.g. `NULL`, `COOKIE`, `HASHEDPASSWORD`.
    pub auth_methods: Vec<String>,
    /// Cookie path from `COOKIEFILE=`, unescaped.
    pub cookie_file: Option<PathBuf>,
}

impl ProtocolInfo {
    fn from_lines(lines: &[String]) -> Self {
        let mut info = Self::default();
        for auth in lines.iter().filter_map(|l| l.strip_prefix("AUTH ")) {
            if let Some(methods) = auth
                .split_whitespace()
                .find_map(|t| t.strip_prefix("METHODS="))
            {
                info.auth_methods = methods.split(',').map(str::to_string).collect();
            }
            if let Some((_, rest)) = auth.split_once("COOKIEFILE=\"") {
                info.cookie_file = unquote(rest).map(PathBuf::from);
            }
        }
        info
    }

    /// Returns true if Tor lists `method`.
    pub fn accepts(&self, method: &str) -> bool {
        self.auth_methods.iter().any(|m| m == method)
    }
}

/// Reads a quoted string up to its closing quote, undoing backslash escapes.
fn unquote(rest: &str) -> Option<String> {
    let mut out = String::new();
    let mut chars = rest.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => out.push(chars.next()?),
            '"' => return Some(out),
            c => out.push(c),
        }
    }
    None
}

/// A control session over some [`Transport`].
///
/// The session owns the event queue. Events that arrive while a command is
/// outstanding wait there until the caller drains them.
pub struct ProtocolSession<T: Transport> {
    transport: T,
    events: VecDeque<Event>,
    pending: Vec<String>,
    in_data_block: bool,
    /// Commands sent whose reply has not been read yet.
    outstanding: usize,
}

impl<T: Transport> ProtocolSession<T> {
    /// Wraps an already connected transport.
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            events: VecDeque::new(),
            pending: Vec::new(),
            in_data_block: false,
            outstanding: 0,
        }
    }

    /// Reads lines until one group is complete.
    ///
    /// Returns `Some(reply)` for a synchronous reply and `None` when the
    /// group was an event, which is appended to the queue.
    ///
    /// # Errors
    ///
    /// - [`Error::ProtocolParse`] if a line breaks the framing rules
    /// - [`Error::ConnectionClosed`] if Tor hung up
    pub async fn update(&mut self) -> Result<Option<Reply>> {
        loop {
            let line = self.transport.read_line().await?;

            if self.in_data_block {
                if line == "." {
                    self.in_data_block = false;
                } else if let Some(unstuffed) = line.strip_prefix("..") {
                    self.pending.push(format!(".{}", unstuffed));
                } else {
                    self.pending.push(line);
                }
                continue;
            }

            if line.len() < 4 || !line.is_char_boundary(3) || !line.is_char_boundary(4) {
                return Err(Error::ProtocolParse(format!("line too short: {:?}", line)));
            }
            let code = &line[..3];
            let payload = line[4..].to_string();

            match line.as_bytes()[3] {
                b' ' => {
                    self.pending.push(payload);
                    let lines = std::mem::take(&mut self.pending);
                    if code == ASYNC_EVENT_CODE {
                        self.events.push_back(Event { lines });
                        return Ok(None);
                    }
                    return Ok(Some(Reply {
                        code: code.to_string(),
                        lines,
                    }));
                }
                b'-' => self.pending.push(payload),
                b'+' => {
                    self.pending.push(payload);
                    self.in_data_block = true;
                }
                _ => {
                    return Err(Error::ProtocolParse(format!(
                        "unknown separator in line: {:?}",
                        line
                    )))
                }
            }
        }
    }

    /// Sends a command and waits for its reply.
    ///
    /// Events that arrive first are queued. The reply is returned whatever
    /// its status code; use the typed helpers for commands that must succeed.
    pub async fn exec_command(&mut self, verb: &str, args: &[&str]) -> Result<Reply> {
        let mut line = verb.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        self.exec_line(&line).await
    }

    async fn exec_line(&mut self, line: &str) -> Result<Reply> {
        self.discard_abandoned_replies().await?;

        plog(LogLevel::Debug, &format!("-> {}", redact(line)));
        self.transport.send_line(line).await?;
        self.outstanding += 1;
        loop {
            if let Some(reply) = self.update().await? {
                self.outstanding -= 1;
                plog(
                    LogLevel::Debug,
                    &format!("<- {} {}", reply.code, reply.first_line()),
                );
                return Ok(reply);
            }
        }
    }

    /// Reads the replies of commands whose caller stopped waiting.
    async fn discard_abandoned_replies(&mut self) -> Result<()> {
        while self.outstanding > 0 {
            if let Some(reply) = self.update().await? {
                self.outstanding -= 1;
                plog(
                    LogLevel::Debug,
                    &format!("<- {} {} (abandoned)", reply.code, reply.first_line()),
                );
            }
        }
        Ok(())
    }

    async fn exec_checked(&mut self, line: &str) -> Result<Reply> {
        let reply = self.exec_line(line).await?;
        if reply.is_ok() {
            Ok(reply)
        } else {
            let message = reply.first_line().to_string();
            Err(Error::Command {
                command: redact(line),
                code: reply.code,
                message,
            })
        }
    }

    /// Authenticates with an optional credential.
    ///
    /// Without a credential the method is discovered with `PROTOCOLINFO`:
    /// the cookie file is used when Tor offers `COOKIE` and not `NULL`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Authentication`] if Tor answers anything but `250`.
    pub async fn authenticate(&mut self, credential: Option<&SecurePassword>) -> Result<()> {
        let mut line = match credential {
            Some(_) => authentication_command(credential).await?,
            None => self.discovered_authentication().await?,
        };
        let result = self.exec_line(&line).await;
        line.zeroize();

        let reply = result?;
        if reply.is_ok() {
            Ok(())
        } else {
            Err(Error::Authentication(format!(
                "{} {}",
                reply.code,
                reply.first_line()
            )))
        }
    }

    /// Issues `PROTOCOLINFO 1`.
    pub async fn protocol_info(&mut self) -> Result<ProtocolInfo> {
        let reply = self.exec_checked("PROTOCOLINFO 1").await?;
        Ok(ProtocolInfo::from_lines(&reply.lines))
    }

    async fn discovered_authentication(&mut self) -> Result<String> {
        let info = self.protocol_info().await?;
        plog(
            LogLevel::Debug,
            &format!(
                "auth methods: {}, cookie file: {:?}",
                info.auth_methods.join(","),
                info.cookie_file
            ),
        );

        match info.cookie_file.as_deref() {
            Some(path) if info.accepts("COOKIE") && !info.accepts("NULL") => {
                cookie_authentication_command(path).await.map_err(|e| {
                    Error::Authentication(format!(
                        "cannot read cookie file {}: {}",
                        path.display(),
                        e
                    ))
                })
            }
            _ => authentication_command(None).await,
        }
    }

    /// Issues `GETINFO <key>` and returns the payload lines.
    pub async fn get_info(&mut self, key: &str) -> Result<Vec<String>> {
        let reply = self.exec_checked(&format!("GETINFO {}", key)).await?;
        Ok(reply.lines)
    }

    /// Issues `GETINFO <key>` and returns the single value after `key=`.
    pub async fn get_info_value(&mut self, key: &str) -> Result<String> {
        let lines = self.get_info(key).await?;
        let first = lines.first().map(String::as_str).unwrap_or("");
        let value = first
            .strip_prefix(key)
            .and_then(|rest| rest.strip_prefix('='))
            .unwrap_or_else(|| first.split_once('=').map(|(_, v)| v).unwrap_or(""));
        Ok(value.to_string())
    }

    /// Tor's version string.
    pub async fn version(&mut self) -> Result<String> {
        self.get_info_value("version").await
    }

    /// `SETCONF key=value`.
    pub async fn set_conf(&mut self, key: &str, value: &str) -> Result<()> {
        self.exec_checked(&format!("SETCONF {}={}", key, value))
            .await
            .map(|_| ())
    }

    /// `RESETCONF key`.
    pub async fn reset_conf(&mut self, key: &str) -> Result<()> {
        self.exec_checked(&format!("RESETCONF {}", key))
            .await
            .map(|_| ())
    }

    /// `SETEVENTS` with the given event names.
    pub async fn set_events(&mut self, events: &[&str]) -> Result<()> {
        self.exec_checked(&format!("SETEVENTS {}", events.join(" ")))
            .await
            .map(|_| ())
    }

    /// `CLOSECIRCUIT <id>`.
    pub async fn close_circuit(&mut self, circuit_id: &str) -> Result<()> {
        self.exec_checked(&format!("CLOSECIRCUIT {}", circuit_id))
            .await
            .map(|_| ())
    }

    /// Says goodbye. A connection that closes before the reply is fine.
    pub async fn quit(&mut self) -> Result<()> {
        match self.exec_line("QUIT").await {
            Ok(_) => Ok(()),
            Err(e) if e.is_disconnect() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Removes and returns the oldest queued event.
    pub fn pop_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Removes every queued event, oldest first.
    pub fn drain_events(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    /// Number of queued events.
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    #[cfg(test)]
    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }

    #[cfg(test)]
    pub(crate) fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}

#[async_trait]
impl<T: Transport> CountryLookup for ProtocolSession<T> {
    async fn country_of(&mut self, address: Ipv4Addr) -> Result<String> {
        let value = self
            .get_info_value(&format!("ip-to-country/{}", address))
            .await?;
        Ok(value.to_ascii_lowercase())
    }
}

fn redact(line: &str) -> String {
    if line.starts_with("AUTHENTICATE ") {
        "AUTHENTICATE [REDACTED]".to_string()
    } else {
        line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{ScriptedTransport, STALL};

    fn session(lines: &[&str]) -> ProtocolSession<ScriptedTransport> {
        ProtocolSession::new(ScriptedTransport::new(lines))
    }

    #[tokio::test]
    async fn test_events_before_reply_are_queued_in_order() {
        let mut s = session(&[
            "650 STREAM 14 NEW 0 example.com:443 SOURCE_ADDR=127.0.0.1:5000 PURPOSE=USER",
            "650 CIRC 5 BUILT $AAAA~guard,$BBBB~exit",
            "250 OK",
        ]);

        let reply = s.exec_command("SETEVENTS", &["STREAM", "CIRC"]).await.unwrap();
        assert_eq!(reply.code, "250");
        assert_eq!(reply.lines, vec!["OK"]);
        assert_eq!(s.transport().sent, vec!["SETEVENTS STREAM CIRC"]);

        let events = s.drain_events();
        assert_eq!(events.len(), 2);
        assert!(events[0].lines[0].starts_with("STREAM 14 NEW"));
        assert!(events[1].lines[0].starts_with("CIRC 5 BUILT"));
        assert_eq!(s.pending_events(), 0);
    }

    #[tokio::test]
    async fn test_multiline_event_is_one_group() {
        let mut s = session(&["650-CIRC 1 EXTENDED", "650 more", "250 OK"]);
        s.exec_command("SIGNAL", &["NEWNYM"]).await.unwrap();
        assert_eq!(
            s.pop_event(),
            Some(Event {
                lines: vec!["CIRC 1 EXTENDED".to_string(), "more".to_string()]
            })
        );
        assert_eq!(s.pop_event(), None);
    }

    #[tokio::test]
    async fn test_update_yields_nothing_for_event() {
        let mut s = session(&["650 CIRC 9 FAILED REASON=TIMEOUT"]);
        assert_eq!(s.update().await.unwrap(), None);
        assert_eq!(s.pending_events(), 1);
    }

    #[tokio::test]
    async fn test_data_block_is_unstuffed() {
        let mut s = session(&[
            "250+ns/all=",
            "r test AAAA BBBB 2024-01-01 00:00:00 1.2.3.4 9001 0",
            "..hidden",
            ".",
            "250 OK",
        ]);
        let lines = s.get_info("ns/all").await.unwrap();
        assert_eq!(
            lines,
            vec![
                "ns/all=",
                "r test AAAA BBBB 2024-01-01 00:00:00 1.2.3.4 9001 0",
                ".hidden",
                "OK"
            ]
        );
    }

    #[tokio::test]
    async fn test_short_line_is_protocol_error() {
        let mut s = session(&["250"]);
        assert!(matches!(s.update().await, Err(Error::ProtocolParse(_))));
    }

    #[tokio::test]
    async fn test_bad_separator_is_protocol_error() {
        let mut s = session(&["250*OK"]);
        assert!(matches!(s.update().await, Err(Error::ProtocolParse(_))));
    }

    #[tokio::test]
    async fn test_interrupted_group_resumes() {
        let mut s = session(&["250-version=0.4.8.9"]);
        assert!(matches!(s.update().await, Err(Error::ConnectionClosed)));

        s.transport_mut().push(&["250 OK"]);
        let reply = s.update().await.unwrap().unwrap();
        assert_eq!(reply.lines, vec!["version=0.4.8.9", "OK"]);
    }

    #[tokio::test]
    async fn test_version_value() {
        let mut s = session(&["250-version=0.4.8.9", "250 OK"]);
        assert_eq!(s.version().await.unwrap(), "0.4.8.9");
        assert_eq!(s.transport().sent, vec!["GETINFO version"]);
    }

    #[tokio::test]
    async fn test_failed_command_is_error() {
        let mut s = session(&["552 Unrecognized option: Unknown option 'Bogus'"]);
        match s.set_conf("Bogus", "1").await {
            Err(Error::Command { command, code, .. }) => {
                assert_eq!(command, "SETCONF Bogus=1");
                assert_eq!(code, "552");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_authentication_rejected() {
        let mut s = session(&["515 Authentication failed: Password did not match"]);
        let password = SecurePassword::new("wrong".to_string());
        let result = s.authenticate(Some(&password)).await;
        assert!(matches!(result, Err(Error::Authentication(_))));
        assert_eq!(s.transport().sent, vec!["AUTHENTICATE \"wrong\""]);
    }

    #[test]
    fn test_protocol_info_lines() {
        let lines: Vec<String> = [
            "PROTOCOLINFO 1",
            r#"AUTH METHODS=COOKIE,SAFECOOKIE,HASHEDPASSWORD COOKIEFILE="/var/lib/tor/my \"tor\"/control_auth_cookie""#,
            r#"VERSION Tor="0.4.8.9""#,
            "OK",
        ]
        .iter()
        .map(|l| l.to_string())
        .collect();

        let info = ProtocolInfo::from_lines(&lines);
        assert_eq!(info.auth_methods, vec!["COOKIE", "SAFECOOKIE", "HASHEDPASSWORD"]);
        assert!(info.accepts("COOKIE"));
        assert!(!info.accepts("NULL"));
        assert_eq!(
            info.cookie_file,
            Some(PathBuf::from("/var/lib/tor/my \"tor\"/control_auth_cookie"))
        );

        let lines = vec!["AUTH METHODS=NULL".to_string()];
        let info = ProtocolInfo::from_lines(&lines);
        assert!(info.accepts("NULL"));
        assert_eq!(info.cookie_file, None);
    }

    #[tokio::test]
    async fn test_authentication_discovers_cookie_file() {
        let dir = tempfile::tempdir().unwrap();
        let cookie = dir.path().join("control_auth_cookie");
        std::fs::write(&cookie, [0xAB, 0x01]).unwrap();
        let auth = format!(
            "250-AUTH METHODS=COOKIE,SAFECOOKIE COOKIEFILE=\"{}\"",
            cookie.display()
        );
        let mut s = session(&[
            "250-PROTOCOLINFO 1",
            auth.as_str(),
            "250-VERSION Tor=\"0.4.8.9\"",
            "250 OK",
            "250 OK",
        ]);

        s.authenticate(None).await.unwrap();
        assert_eq!(s.transport().sent, vec!["PROTOCOLINFO 1", "AUTHENTICATE AB01"]);
    }

    #[tokio::test]
    async fn test_authentication_prefers_null_method() {
        let mut s = session(&[
            "250-PROTOCOLINFO 1",
            "250-AUTH METHODS=NULL",
            "250 OK",
            "250 OK",
        ]);

        s.authenticate(None).await.unwrap();
        assert_eq!(s.transport().sent, vec!["PROTOCOLINFO 1", "AUTHENTICATE"]);
    }

    #[tokio::test]
    async fn test_authentication_with_unreadable_cookie_file() {
        let mut s = session(&[
            "250-PROTOCOLINFO 1",
            "250-AUTH METHODS=COOKIE COOKIEFILE=\"/nonexistent/fasttor/cookie\"",
            "250 OK",
        ]);

        assert!(matches!(
            s.authenticate(None).await,
            Err(Error::Authentication(_))
        ));
        assert_eq!(s.transport().sent, vec!["PROTOCOLINFO 1"]);
    }

    #[tokio::test]
    async fn test_reply_to_abandoned_command_is_discarded() {
        let mut s = session(&[STALL]);
        let waited = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            s.exec_command("SETCONF", &["UseEntryGuards=0"]),
        )
        .await;
        assert!(waited.is_err());

        s.transport_mut().push(&[
            "650 CIRC 1 BUILT",
            "250 OK",
            "552 Unrecognized option",
        ]);
        let reply = s.exec_command("RESETCONF", &["UseEntryGuards"]).await.unwrap();

        assert_eq!(reply.code, "552");
        assert_eq!(s.pending_events(), 1);
        assert_eq!(
            s.transport().sent,
            vec!["SETCONF UseEntryGuards=0", "RESETCONF UseEntryGuards"]
        );
    }

    #[tokio::test]
    async fn test_quit_tolerates_hangup() {
        let mut s = session(&[]);
        assert!(s.quit().await.is_ok());
    }

    #[tokio::test]
    async fn test_country_lookup() {
        let mut s = session(&["250-ip-to-country/1.2.3.4=DE", "250 OK"]);
        let country = s.country_of(Ipv4Addr::new(1, 2, 3, 4)).await.unwrap();
        assert_eq!(country, "de");
        assert_eq!(s.transport().sent, vec!["GETINFO ip-to-country/1.2.3.4"]);
    }

    #[test]
    fn test_redact_hides_credentials() {
        assert_eq!(redact("AUTHENTICATE \"pw\""), "AUTHENTICATE [REDACTED]");
        assert_eq!(redact("GETINFO version"), "GETINFO version");
    }
}
