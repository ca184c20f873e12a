//! Lifecycle of the one circuit all user streams are pinned to.
//!
//! # State Machine
//!
//! ```text
//!            acquire_circuit
//!   None ──────────────────────┬──────────────────────▶ Built
//!     │                        │ (already in Tor)         ▲
//!     │ EXTENDCIRCUIT          │                          │ CIRC <ours> BUILT
//!     ▼                        │                          │
//!   Extended ─────────────────────────────────────────────┘
//!
//!   Built ── ATTACHSTREAM: 552 Unknown circuit ──▶ Gone
//!
//!   any ──── CIRC <ours> CLOSED|FAILED ──▶ ClosedOrFailed ──▶ acquire_circuit
//! ```
//!
//! The controller only remembers nicknames and fingerprints of its hops;
//! the descriptors themselves stay in the candidate sets.

use crate::config::LogLevel;
use crate::consensus::RouterDescriptor;
use crate::error::{Error, Result};
use crate::logger::plog;
use crate::selection::CandidateSets;
use crate::session::ProtocolSession;
use crate::transport::Transport;

/// Circuit id meaning "let Tor pick a circuit".
pub const LET_TOR_ROUTE: &str = "0";

/// Where our circuit stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitState {
    /// No circuit requested yet.
    #[default]
    None,
    /// EXTENDCIRCUIT accepted, waiting for BUILT.
    Extended,
    /// Ready to carry streams.
    Built,
    /// Tor no longer knows the circuit.
    Gone,
    /// Tor reported CLOSED or FAILED.
    ClosedOrFailed,
}

/// Identity of one hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopRef {
    pub nickname: String,
    pub fingerprint: String,
}

impl From<&RouterDescriptor> for HopRef {
    fn from(router: &RouterDescriptor) -> Self {
        Self {
            nickname: router.nickname.clone(),
            fingerprint: router.fingerprint.clone(),
        }
    }
}

/// The circuit we route user streams through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitRecord {
    /// Id assigned by Tor; `None` before the first extension.
    pub id: Option<String>,
    pub guard: Option<HopRef>,
    pub exit: Option<HopRef>,
    pub state: CircuitState,
}

/// Result of a stream attachment that did not need to stop the program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachOutcome {
    /// Attached to the requested circuit.
    Attached,
    /// Handed back to Tor (circuit `0`).
    TorRouted,
    /// The stream closed before we got to it.
    StreamGone,
    /// Tor refused the attachment (551).
    Refused,
}

/// Owns the circuit state and the candidate relays used to rebuild it.
#[derive(Debug)]
pub struct CircuitController {
    candidates: CandidateSets,
    explicit: Option<(String, String)>,
    record: CircuitRecord,
}

impl CircuitController {
    pub fn new(candidates: CandidateSets, explicit: Option<(String, String)>) -> Self {
        Self {
            candidates,
            explicit,
            record: CircuitRecord::default(),
        }
    }

    pub fn record(&self) -> &CircuitRecord {
        &self.record
    }

    pub fn state(&self) -> CircuitState {
        self.record.state
    }

    /// Returns true if `circuit_id` is the circuit we manage.
    pub fn is_ours(&self, circuit_id: &str) -> bool {
        self.record.id.as_deref() == Some(circuit_id)
    }

    /// Picks a guard/exit pair and gets a circuit through it.
    pub async fn establish<T: Transport>(&mut self, session: &mut ProtocolSession<T>) -> Result<()> {
        let (guard, exit) = self.candidates.choose_pair(self.explicit.as_ref())?;
        let (guard, exit) = (HopRef::from(guard), HopRef::from(exit));
        self.acquire_circuit(session, guard, exit).await
    }

    /// Adopts a built circuit over exactly `guard,exit` or extends a new one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CircuitExtension`] if Tor does not answer
    /// EXTENDCIRCUIT with `EXTENDED <id>`.
    pub async fn acquire_circuit<T: Transport>(
        &mut self,
        session: &mut ProtocolSession<T>,
        guard: HopRef,
        exit: HopRef,
    ) -> Result<()> {
        let path = format!("{},{}", guard.nickname, exit.nickname);

        let wanted = [guard.fingerprint.as_str(), exit.fingerprint.as_str()];
        if let Some(id) = find_circuit(session, &wanted).await? {
            plog(
                LogLevel::Notice,
                &format!("attached to existing circuit {} {}", id, path),
            );
            self.record = CircuitRecord {
                id: Some(id),
                guard: Some(guard),
                exit: Some(exit),
                state: CircuitState::Built,
            };
            return Ok(());
        }

        let hops = format!("${},${}", guard.fingerprint, exit.fingerprint);
        let reply = session.exec_command("EXTENDCIRCUIT", &["0", hops.as_str()]).await?;
        let id = reply
            .first_line()
            .strip_prefix("EXTENDED ")
            .and_then(|rest| rest.split_whitespace().next())
            .filter(|_| reply.is_ok())
            .ok_or_else(|| {
                Error::CircuitExtension(format!(
                    "'{}': {} {}",
                    path,
                    reply.code,
                    reply.first_line()
                ))
            })?
            .to_string();

        plog(LogLevel::Notice, &format!("launched circuit {} {}", id, path));
        self.record = CircuitRecord {
            id: Some(id),
            guard: Some(guard),
            exit: Some(exit),
            state: CircuitState::Extended,
        };
        Ok(())
    }

    /// Marks our circuit built. Returns false for someone else's circuit.
    pub fn on_built(&mut self, circuit_id: &str) -> bool {
        if !self.is_ours(circuit_id) {
            return false;
        }
        self.record.state = CircuitState::Built;
        plog(
            LogLevel::Notice,
            &format!("built circuit {}. All Systems Go!", circuit_id),
        );
        true
    }

    /// Our circuit died: record it and make exactly one attempt at a new one.
    pub async fn on_closed_or_failed<T: Transport>(
        &mut self,
        session: &mut ProtocolSession<T>,
    ) -> Result<()> {
        self.record.state = CircuitState::ClosedOrFailed;
        plog(
            LogLevel::Notice,
            &format!(
                "our circuit {} is dead, building new",
                self.record.id.as_deref().unwrap_or("?")
            ),
        );
        self.establish(session).await
    }

    /// Attaches a stream, falling back to Tor's own routing once if our
    /// circuit has disappeared.
    ///
    /// | Reply | Result |
    /// |-------|--------|
    /// | `250` | `Attached` or `TorRouted` |
    /// | `552 Unknown stream` | `StreamGone` |
    /// | `551` | `Refused` |
    /// | `552 Unknown circuit`, circuit not `0` | state `Gone`, retry with `0` |
    /// | anything else | [`Error::AttachStream`] |
    pub async fn attach_stream<T: Transport>(
        &mut self,
        session: &mut ProtocolSession<T>,
        stream_id: &str,
        circuit_id: &str,
    ) -> Result<AttachOutcome> {
        let mut target = circuit_id.to_string();
        loop {
            let reply = session
                .exec_command("ATTACHSTREAM", &[stream_id, target.as_str()])
                .await?;
            let message = reply.first_line();

            match reply.code.as_str() {
                "250" if target == LET_TOR_ROUTE => return Ok(AttachOutcome::TorRouted),
                "250" => return Ok(AttachOutcome::Attached),
                "552" if message.contains("Unknown stream") => return Ok(AttachOutcome::StreamGone),
                "551" => return Ok(AttachOutcome::Refused),
                "552" if message.contains("Unknown circuit") && target != LET_TOR_ROUTE => {
                    self.record.state = CircuitState::Gone;
                    plog(
                        LogLevel::Notice,
                        &format!("our circuit {} is gone, now where is it?", target),
                    );
                    target = LET_TOR_ROUTE.to_string();
                }
                _ => {
                    return Err(Error::AttachStream {
                        stream_id: stream_id.to_string(),
                        circuit_id: target,
                        code: reply.code.clone(),
                        message: message.to_string(),
                    })
                }
            }
        }
    }
}

/// Finds a BUILT circuit whose path is exactly `hops`, in order.
///
/// Fingerprints compare case-insensitively.
pub async fn find_circuit<T: Transport>(
    session: &mut ProtocolSession<T>,
    hops: &[&str],
) -> Result<Option<String>> {
    let lines = session.get_info("circuit-status").await?;
    let found = circuit_status_entries(&lines)
        .find(|entry| entry.status == "BUILT" && entry.has_path(hops))
        .map(|entry| entry.id.to_string());
    Ok(found)
}

/// Closes every BUILT circuit. Returns how many were closed.
///
/// A circuit that vanishes before we close it is only logged.
pub async fn close_all_circuits<T: Transport>(session: &mut ProtocolSession<T>) -> Result<usize> {
    let lines = session.get_info("circuit-status").await?;
    let built: Vec<String> = circuit_status_entries(&lines)
        .filter(|entry| entry.status == "BUILT")
        .map(|entry| entry.id.to_string())
        .collect();

    let mut closed = 0;
    for id in built {
        match session.close_circuit(&id).await {
            Ok(()) => closed += 1,
            Err(Error::Command { code, message, .. }) => plog(
                LogLevel::Warn,
                &format!("could not close circuit {}: {} {}", id, code, message),
            ),
            Err(e) => return Err(e),
        }
    }
    plog(LogLevel::Notice, &format!("closed {} circuits", closed));
    Ok(closed)
}

struct CircuitStatusEntry<'a> {
    id: &'a str,
    status: &'a str,
    path: Option<&'a str>,
}

impl CircuitStatusEntry<'_> {
    fn has_path(&self, hops: &[&str]) -> bool {
        let Some(path) = self.path else {
            return false;
        };
        let fingerprints: Vec<&str> = path.split(',').map(hop_fingerprint).collect();
        fingerprints.len() == hops.len()
            && fingerprints
                .iter()
                .zip(hops)
                .all(|(seen, wanted)| seen.eq_ignore_ascii_case(wanted))
    }
}

fn hop_fingerprint(hop: &str) -> &str {
    let hop = hop.strip_prefix('$').unwrap_or(hop);
    hop.split(['~', '=']).next().unwrap_or(hop)
}

/// Iterates over `GETINFO circuit-status` entries.
///
/// The first payload line is `circuit-status=` followed by the first entry
/// when Tor sends the single-line form.
fn circuit_status_entries(lines: &[String]) -> impl Iterator<Item = CircuitStatusEntry<'_>> {
    lines.iter().enumerate().filter_map(|(index, line)| {
        let line = line.as_str();
        let line = if index == 0 {
            line.strip_prefix("circuit-status=").unwrap_or(line)
        } else {
            line
        };
        let mut tokens = line.split_whitespace();
        let id = tokens.next()?;
        let status = tokens.next()?;
        if id == "OK" {
            return None;
        }
        Some(CircuitStatusEntry {
            id,
            status,
            path: tokens.next().filter(|p| p.starts_with('$')),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::testing::router;
    use crate::transport::testing::ScriptedTransport;

    const GUARD_FP: &str = "9695DFC35FFEB861329B9F1AB04C46397020CE31";
    const EXIT_FP: &str = "847B1F850344D7876491A54892F904934E4EB85D";

    fn controller() -> CircuitController {
        let candidates = CandidateSets {
            guards: vec![router("guard", GUARD_FP, &["Guard"], 1, "reject 1-65535")],
            exits: vec![router("exit", EXIT_FP, &["Exit"], 1, "accept 1-65535")],
        };
        CircuitController::new(candidates, None)
    }

    fn session(lines: &[&str]) -> ProtocolSession<ScriptedTransport> {
        ProtocolSession::new(ScriptedTransport::new(lines))
    }

    fn built_line(id: &str, first: &str, second: &str) -> String {
        format!(
            "{} BUILT ${}~guard,${}~exit BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL",
            id, first, second
        )
    }

    #[tokio::test]
    async fn test_adopts_existing_circuit() {
        let entry = built_line("3", &GUARD_FP.to_lowercase(), EXIT_FP);
        let mut s = session(&["250+circuit-status=", entry.as_str(), ".", "250 OK"]);
        let mut c = controller();

        c.establish(&mut s).await.unwrap();
        assert_eq!(c.state(), CircuitState::Built);
        assert!(c.is_ours("3"));
        assert_eq!(c.record().guard.as_ref().map(|h| h.nickname.as_str()), Some("guard"));
        assert_eq!(s.transport().sent, vec!["GETINFO circuit-status"]);
    }

    #[tokio::test]
    async fn test_adopts_single_line_status() {
        let entry = format!("250-circuit-status={}", built_line("4", GUARD_FP, EXIT_FP));
        let mut s = session(&[entry.as_str(), "250 OK"]);
        let mut c = controller();

        c.establish(&mut s).await.unwrap();
        assert!(c.is_ours("4"));
        assert_eq!(c.state(), CircuitState::Built);
    }

    #[tokio::test]
    async fn test_extends_when_no_exact_match() {
        let reversed = built_line("3", EXIT_FP, GUARD_FP);
        let longer = format!("8 BUILT ${},${},$AAAA~x PURPOSE=GENERAL", GUARD_FP, EXIT_FP);
        let extended = format!("9 EXTENDED ${}~guard,${}~exit", GUARD_FP, EXIT_FP);
        let mut s = session(&[
            "250+circuit-status=",
            reversed.as_str(),
            longer.as_str(),
            extended.as_str(),
            ".",
            "250 OK",
            "250 EXTENDED 7",
        ]);
        let mut c = controller();

        c.establish(&mut s).await.unwrap();
        assert_eq!(c.state(), CircuitState::Extended);
        assert!(c.is_ours("7"));
        assert_eq!(
            s.transport().sent[1],
            format!("EXTENDCIRCUIT 0 ${},${}", GUARD_FP, EXIT_FP)
        );
    }

    #[tokio::test]
    async fn test_extension_failure() {
        let mut s = session(&["250-circuit-status=", "250 OK", "552 No such router \"x\""]);
        let mut c = controller();

        assert!(matches!(
            c.establish(&mut s).await,
            Err(Error::CircuitExtension(_))
        ));
        assert_eq!(c.state(), CircuitState::None);
    }

    #[tokio::test]
    async fn test_attach_outcomes() {
        let mut c = controller();
        let mut s = session(&[
            "250 OK",
            "250 OK",
            "552 Unknown stream \"12\"",
            "551 Can't attach stream to non-open origin circuit",
        ]);

        assert_eq!(c.attach_stream(&mut s, "10", "5").await.unwrap(), AttachOutcome::Attached);
        assert_eq!(c.attach_stream(&mut s, "11", "0").await.unwrap(), AttachOutcome::TorRouted);
        assert_eq!(c.attach_stream(&mut s, "12", "5").await.unwrap(), AttachOutcome::StreamGone);
        assert_eq!(c.attach_stream(&mut s, "13", "5").await.unwrap(), AttachOutcome::Refused);
        assert_eq!(s.transport().sent.len(), 4);
    }

    #[tokio::test]
    async fn test_unknown_circuit_retries_once_with_tor_routing() {
        let mut c = controller();
        let mut s = session(&["552 Unknown circuit \"5\"", "250 OK"]);

        let outcome = c.attach_stream(&mut s, "14", "5").await.unwrap();
        assert_eq!(outcome, AttachOutcome::TorRouted);
        assert_eq!(c.state(), CircuitState::Gone);
        assert_eq!(
            s.transport().sent,
            vec!["ATTACHSTREAM 14 5", "ATTACHSTREAM 14 0"]
        );
    }

    #[tokio::test]
    async fn test_failed_retry_escalates() {
        let mut c = controller();
        let mut s = session(&["552 Unknown circuit \"5\"", "552 Unknown circuit \"0\""]);

        match c.attach_stream(&mut s, "14", "5").await {
            Err(Error::AttachStream {
                circuit_id, code, ..
            }) => {
                assert_eq!(circuit_id, "0");
                assert_eq!(code, "552");
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(s.transport().sent.len(), 2);
    }

    #[tokio::test]
    async fn test_other_attach_failure_escalates() {
        let mut c = controller();
        let mut s = session(&["555 Connection refused"]);
        assert!(matches!(
            c.attach_stream(&mut s, "14", "5").await,
            Err(Error::AttachStream { .. })
        ));
        assert_eq!(s.transport().sent.len(), 1);
    }

    #[tokio::test]
    async fn test_self_heal_builds_exactly_one_circuit() {
        let mut c = controller();
        let mut s = session(&["250-circuit-status=", "250 OK", "250 EXTENDED 5"]);
        c.establish(&mut s).await.unwrap();
        assert!(c.on_built("5"));

        s.transport_mut().push(&["250-circuit-status=", "250 OK", "250 EXTENDED 6"]);
        c.on_closed_or_failed(&mut s).await.unwrap();

        let extends = s
            .transport()
            .sent
            .iter()
            .filter(|l| l.starts_with("EXTENDCIRCUIT"))
            .count();
        assert_eq!(extends, 2);
        assert!(c.is_ours("6"));
        assert_eq!(c.state(), CircuitState::Extended);
        assert_eq!(s.transport().remaining(), 0);
    }

    #[test]
    fn test_on_built_ignores_other_circuits() {
        let mut c = controller();
        assert!(!c.on_built("5"));
        assert_eq!(c.state(), CircuitState::None);
    }

    #[tokio::test]
    async fn test_close_all_circuits() {
        let mut s = session(&[
            "250+circuit-status=",
            built_line("1", GUARD_FP, EXIT_FP).as_str(),
            "2 LAUNCHED BUILD_FLAGS=NEED_CAPACITY",
            built_line("3", GUARD_FP, EXIT_FP).as_str(),
            ".",
            "250 OK",
            "250 OK",
            "552 Unknown circuit \"3\"",
        ]);

        assert_eq!(close_all_circuits(&mut s).await.unwrap(), 1);
        assert_eq!(
            s.transport().sent,
            vec!["GETINFO circuit-status", "CLOSECIRCUIT 1", "CLOSECIRCUIT 3"]
        );
    }

    #[test]
    fn test_hop_fingerprint_forms() {
        assert_eq!(hop_fingerprint("$ABCD~name"), "ABCD");
        assert_eq!(hop_fingerprint("$ABCD=name"), "ABCD");
        assert_eq!(hop_fingerprint("$ABCD"), "ABCD");
    }
}
