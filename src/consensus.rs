//! Router status list retrieval and parsing.
//!
//! `GETINFO ns/all` returns one status entry per relay. Each entry starts
//! with an `r` line and is followed by optional field lines:
//!
//! | Tag | Content | Kept as |
//! |-----|---------|---------|
//! | `r` | nickname, identity, digest, date, time, IP, ORPort, DirPort | descriptor fields |
//! | `a` | additional OR address | [`RouterDescriptor::or_addresses`] |
//! | `s` | flags | [`RouterDescriptor::flags`] |
//! | `v` | version | ignored |
//! | `pr` | subprotocol versions | ignored |
//! | `w` | `Bandwidth=N [Measured=M]` | [`RouterDescriptor::bandwidth`] |
//! | `p` | exit port policy | [`RouterDescriptor::policy`] |
//!
//! Only what router selection needs is extracted. One malformed line fails
//! the whole fetch.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, Utc};

use crate::error::{Error, Result};
use crate::ports::PortRangeSet;
use crate::session::ProtocolSession;
use crate::transport::Transport;

/// Policy assumed for a router that publishes no `p` line.
pub const DEFAULT_POLICY: &str = "reject 1-65535";

/// A relay as listed in the router status document.
///
/// # Example
///
/// ```rust
/// use fasttor_rs::consensus::parse_router_statuses;
///
/// let lines = [
///     "r moria1 lpXfw1/+uGEym58asExGOXAgzjE 4ljtFoQOY1Ox1ULiSH2bAMlG8sA 2024-05-01 12:00:00 128.31.0.34 9101 9131",
///     "s Authority Fast Running Stable V2Dir Valid",
///     "w Bandwidth=20",
///     "p reject 1-65535",
/// ];
/// let routers = parse_router_statuses(&lines).unwrap();
/// assert_eq!(routers[0].fingerprint, "9695DFC35FFEB861329B9F1AB04C46397020CE31");
/// assert!(routers[0].has_flag("Fast"));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RouterDescriptor {
    pub nickname: String,
    /// Identity fingerprint, 40 uppercase hex characters.
    pub fingerprint: String,
    pub address: Ipv4Addr,
    pub or_port: u16,
    pub dir_port: u16,
    /// When the relay's descriptor was published.
    pub published: DateTime<Utc>,
    pub flags: BTreeSet<String>,
    /// Value of the `Bandwidth=` key of the `w` line, 0 when absent.
    pub bandwidth: u64,
    /// Extra `a` addresses, as published.
    pub or_addresses: Vec<String>,
    /// Raw exit policy text.
    pub policy: String,
    /// Parsed form of [`policy`](Self::policy), filled by
    /// [`normalize_ports`](Self::normalize_ports).
    pub accepted_ports: Option<PortRangeSet>,
}

impl RouterDescriptor {
    /// Returns true if the relay carries `flag`.
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }

    /// Parses the raw policy into accepted port ranges, once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PortSpecParse`] if the policy text is malformed.
    pub fn normalize_ports(&mut self) -> Result<&PortRangeSet> {
        let set = match self.accepted_ports.take() {
            Some(set) => set,
            None => PortRangeSet::parse_policy(&self.policy)?,
        };
        Ok(self.accepted_ports.insert(set))
    }

    fn from_r_line(fields: &[&str], line: &str) -> Result<Self> {
        if fields.len() < 9 {
            return Err(Error::RouterParse(format!("short r line: {}", line)));
        }

        let fingerprint = decode_fingerprint(fields[2])?;
        let published =
            NaiveDateTime::parse_from_str(&format!("{} {}", fields[4], fields[5]), "%Y-%m-%d %H:%M:%S")
                .map_err(|e| Error::RouterParse(format!("bad timestamp in '{}': {}", line, e)))?
                .and_utc();
        let address = fields[6]
            .parse::<Ipv4Addr>()
            .map_err(|e| Error::RouterParse(format!("bad address in '{}': {}", line, e)))?;
        let or_port = parse_port(fields[7], line)?;
        let dir_port = parse_port(fields[8], line)?;

        Ok(Self {
            nickname: fields[1].to_string(),
            fingerprint,
            address,
            or_port,
            dir_port,
            published,
            flags: BTreeSet::new(),
            bandwidth: 0,
            or_addresses: Vec::new(),
            policy: DEFAULT_POLICY.to_string(),
            accepted_ports: None,
        })
    }
}

fn parse_port(text: &str, line: &str) -> Result<u16> {
    text.parse::<u16>()
        .map_err(|e| Error::RouterParse(format!("bad port '{}' in '{}': {}", text, line, e)))
}

/// Turns a base64 identity hash (padding optional) into an uppercase hex
/// fingerprint.
pub fn decode_fingerprint(identity: &str) -> Result<String> {
    let mut padded = identity.to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    let bytes = STANDARD
        .decode(padded.as_bytes())
        .map_err(|e| Error::RouterParse(format!("bad identity '{}': {}", identity, e)))?;
    if bytes.len() != 20 {
        return Err(Error::RouterParse(format!(
            "identity '{}' decodes to {} bytes",
            identity,
            bytes.len()
        )));
    }
    Ok(hex::encode_upper(bytes))
}

/// Parses router status entries.
///
/// `lines` is the payload after the `ns/all=` header. A trailing `OK` line
/// ends the document; blank lines are skipped.
///
/// # Errors
///
/// Returns [`Error::RouterParse`] for an unknown tag, a field line before
/// any `r` line, or a malformed `r`/`w` line.
pub fn parse_router_statuses<S: AsRef<str>>(lines: &[S]) -> Result<Vec<RouterDescriptor>> {
    let mut routers = Vec::new();
    let mut current: Option<RouterDescriptor> = None;

    for line in lines.iter().map(AsRef::as_ref) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(&tag) = fields.first() else {
            continue;
        };

        if tag == "OK" {
            break;
        }
        if tag == "r" {
            if let Some(router) = current.take() {
                routers.push(router);
            }
            current = Some(RouterDescriptor::from_r_line(&fields, line)?);
            continue;
        }

        let router = match current.as_mut() {
            Some(router) => router,
            None if is_field_tag(tag) => {
                return Err(Error::RouterParse(format!(
                    "'{}' line before any router: {}",
                    tag, line
                )))
            }
            None => return Err(Error::RouterParse(format!("unknown tag: {}", line))),
        };

        match tag {
            "s" => router.flags = fields[1..].iter().map(|f| f.to_string()).collect(),
            "w" => {
                for (key, value) in fields[1..].iter().filter_map(|kv| kv.split_once('=')) {
                    if key == "Bandwidth" {
                        router.bandwidth = value.parse().map_err(|e| {
                            Error::RouterParse(format!("bad bandwidth in '{}': {}", line, e))
                        })?;
                    }
                }
            }
            "p" => router.policy = fields[1..].join(" "),
            "a" => router.or_addresses.extend(fields[1..].iter().map(|a| a.to_string())),
            "v" | "pr" => {}
            _ => return Err(Error::RouterParse(format!("unknown tag: {}", line))),
        }
    }

    if let Some(router) = current {
        routers.push(router);
    }
    Ok(routers)
}

fn is_field_tag(tag: &str) -> bool {
    matches!(tag, "s" | "w" | "p" | "a" | "v" | "pr")
}

/// Fetches and parses the full router list from Tor.
pub async fn fetch_routers<T: Transport>(
    session: &mut ProtocolSession<T>,
) -> Result<Vec<RouterDescriptor>> {
    let lines = session.get_info("ns/all").await?;
    let payload = lines.get(1..).unwrap_or(&[]);
    parse_router_statuses(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortRange;
    use crate::transport::testing::ScriptedTransport;

    const MORIA: &str = "r moria1 lpXfw1/+uGEym58asExGOXAgzjE 4ljtFoQOY1Ox1ULiSH2bAMlG8sA 2024-05-01 12:00:00 128.31.0.34 9101 9131";
    const EXIT: &str = "r bigexit hHsfhQNE14dkkaVIkvkEk05OuF0 BBBBBBBBBBBBBBBBBBBBBBBBBBB 2024-05-01 13:30:00 10.0.0.2 443 0";

    #[test]
    fn test_decode_fingerprint() {
        assert_eq!(
            decode_fingerprint("lpXfw1/+uGEym58asExGOXAgzjE").unwrap(),
            "9695DFC35FFEB861329B9F1AB04C46397020CE31"
        );
        assert_eq!(
            decode_fingerprint("AAAAAAAAAAAAAAAAAAAAAAAAAAA").unwrap(),
            "0".repeat(40)
        );
        assert!(matches!(
            decode_fingerprint("not base64!"),
            Err(Error::RouterParse(_))
        ));
        assert!(matches!(decode_fingerprint("AAAA"), Err(Error::RouterParse(_))));
    }

    #[test]
    fn test_parse_router_statuses() {
        let lines = [
            MORIA,
            "s Authority Fast Guard Running Stable V2Dir Valid",
            "v Tor 0.4.8.9",
            "pr Cons=1-2 Desc=1-2",
            "w Bandwidth=1000 Measured=900",
            "p reject 1-65535",
            EXIT,
            "a [2001:db8::2]:443",
            "s Exit Fast Running Valid",
            "w Bandwidth=2000",
            "p accept 80,443",
            "OK",
        ];

        let routers = parse_router_statuses(&lines).unwrap();
        assert_eq!(routers.len(), 2);

        assert_eq!(routers[0].nickname, "moria1");
        assert_eq!(routers[0].address, Ipv4Addr::new(128, 31, 0, 34));
        assert_eq!(routers[0].or_port, 9101);
        assert_eq!(routers[0].dir_port, 9131);
        assert_eq!(
            routers[0].published.format("%Y-%m-%d %H:%M:%S").to_string(),
            "2024-05-01 12:00:00"
        );
        assert!(routers[0].has_flag("Guard"));
        assert!(!routers[0].has_flag("Exit"));
        assert_eq!(routers[0].bandwidth, 1000);

        assert_eq!(routers[1].nickname, "bigexit");
        assert_eq!(routers[1].fingerprint, "847B1F850344D7876491A54892F904934E4EB85D");
        assert_eq!(routers[1].or_addresses, vec!["[2001:db8::2]:443"]);
        assert_eq!(routers[1].bandwidth, 2000);
        assert_eq!(routers[1].policy, "accept 80,443");
    }

    #[test]
    fn test_missing_policy_rejects_everything() {
        let mut routers = parse_router_statuses(&[MORIA, "s Fast"]).unwrap();
        assert_eq!(routers[0].policy, DEFAULT_POLICY);
        assert_eq!(routers[0].bandwidth, 0);
        assert!(routers[0].normalize_ports().unwrap().is_empty());
    }

    #[test]
    fn test_normalize_ports() {
        let mut routers = parse_router_statuses(&[EXIT, "p accept 80,443"]).unwrap();
        let ports = routers[0].normalize_ports().unwrap();
        assert_eq!(
            ports.ranges(),
            &[
                PortRange::single(80).unwrap(),
                PortRange::single(443).unwrap()
            ]
        );
        assert!(routers[0].accepted_ports.is_some());
    }

    #[test]
    fn test_bad_policy_fails_normalization() {
        let mut routers = parse_router_statuses(&[EXIT, "p permit 80"]).unwrap();
        assert!(matches!(
            routers[0].normalize_ports(),
            Err(Error::PortSpecParse(_))
        ));
    }

    #[test]
    fn test_field_before_router_fails() {
        assert!(matches!(
            parse_router_statuses(&["s Fast Running", MORIA]),
            Err(Error::RouterParse(_))
        ));
    }

    #[test]
    fn test_unknown_tag_fails() {
        assert!(matches!(
            parse_router_statuses(&[MORIA, "x something"]),
            Err(Error::RouterParse(_))
        ));
        // Tags are whole words, so "sx" is not an "s" line.
        assert!(matches!(
            parse_router_statuses(&[MORIA, "sx Fast"]),
            Err(Error::RouterParse(_))
        ));
    }

    #[test]
    fn test_malformed_r_line_fails() {
        let short = "r moria1 lpXfw1/+uGEym58asExGOXAgzjE 2024-05-01";
        assert!(matches!(
            parse_router_statuses(&[short]),
            Err(Error::RouterParse(_))
        ));

        let bad_ip = MORIA.replace("128.31.0.34", "128.31.0");
        assert!(matches!(
            parse_router_statuses(&[bad_ip.as_str()]),
            Err(Error::RouterParse(_))
        ));

        let bad_port = MORIA.replace("9101", "99999");
        assert!(matches!(
            parse_router_statuses(&[bad_port.as_str()]),
            Err(Error::RouterParse(_))
        ));
    }

    #[test]
    fn test_bad_bandwidth_fails() {
        assert!(matches!(
            parse_router_statuses(&[MORIA, "w Bandwidth=lots"]),
            Err(Error::RouterParse(_))
        ));
    }

    #[test]
    fn test_empty_document() {
        let lines: [&str; 1] = ["OK"];
        assert!(parse_router_statuses(&lines).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_routers() {
        let transport = ScriptedTransport::new(&[
            "250+ns/all=",
            MORIA,
            "s Fast Guard Running Valid",
            "w Bandwidth=5000",
            ".",
            "250 OK",
        ]);
        let mut session = ProtocolSession::new(transport);

        let routers = fetch_routers(&mut session).await.unwrap();
        assert_eq!(routers.len(), 1);
        assert_eq!(routers[0].bandwidth, 5000);
        assert_eq!(session.transport().sent, vec!["GETINFO ns/all"]);
    }
}
