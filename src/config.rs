//! Configuration management for fasttor-rs.
//!
//! Configuration comes from three layers, later ones overriding earlier ones:
//!
//! ```text
//!     ┌─────────────────┐
//!     │ Config::default │ ◄── Built-in defaults
//!     └────────┬────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐     ┌─────────────────┐
//!     │ Config file     │ ◄───│ fasttor.conf    │  (TOML, optional)
//!     │ exists?         │     │ or --config     │
//!     └────────┬────────┘     └─────────────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐     ┌─────────────────┐
//!     │ Apply CLI args  │ ◄───│ -c de -b 5000   │
//!     │ (override)      │     │ -r guard,exit   │
//!     └────────┬────────┘     └─────────────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐
//!     │ Normalize and   │
//!     │ validate        │
//!     └─────────────────┘
//! ```
//!
//! # Example Configuration File
//!
//! ```toml
//! control_ip = "127.0.0.1"
//! control_port = 9051
//! # control_socket = "/run/tor/control"
//! # control_auth = "/run/tor/control.authcookie"
//!
//! loglevel = "notice"
//! # logfile = "/var/log/fasttor.log"
//!
//! # country = "de"
//! # min_bandwidth = 5000
//! flags = ["Fast", "Valid", "Running"]
//! ports = "accept 80,443,1024-65535"
//! # routers = ["myguard", "myexit"]
//! disconnect = false
//! ```

use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ports::PortRangeSet;
use crate::selection::is_valid_country_code;

/// Default Tor control port.
pub const DEFAULT_CONTROL_PORT: u16 = 9051;

/// Ports the exit must allow unless configured otherwise.
pub const DEFAULT_PORTS: &str = "accept 80,443,1024-65535";

/// Log level for fasttor-rs output.
///
/// From most to least verbose: [`Debug`](LogLevel::Debug) >
/// [`Info`](LogLevel::Info) > [`Notice`](LogLevel::Notice) >
/// [`Warn`](LogLevel::Warn) > [`Error`](LogLevel::Error).
///
/// ```rust
/// use fasttor_rs::LogLevel;
///
/// let level: LogLevel = "warning".parse().unwrap();
/// assert_eq!(level, LogLevel::Warn);
/// assert!(LogLevel::Notice < level);
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Protocol traffic and other low-level detail.
    Debug,
    /// Informational messages about normal operation.
    Info,
    /// Circuit and stream status changes.
    #[default]
    Notice,
    /// Something went wrong but we carry on.
    Warn,
    /// Failures that end the run.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Notice => write!(f, "NOTICE"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "NOTICE" => Ok(LogLevel::Notice),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" | "ERR" => Ok(LogLevel::Error),
            _ => Err(Error::Config(format!("invalid log level: {}", s))),
        }
    }
}

/// Main configuration.
///
/// # Fields
///
/// | Field | Default | Description |
/// |-------|---------|-------------|
/// | `control_ip` | `"127.0.0.1"` | Control port address or hostname |
/// | `control_port` | `9051` | Control port number |
/// | `control_socket` | none | Unix socket path, preferred over TCP |
/// | `control_auth` | none | Password, cookie hex, or cookie file path |
/// | `loglevel` | `notice` | Log verbosity |
/// | `logfile` | none | Log file; stdout when unset |
/// | `country` | none | Country code both hops must be in |
/// | `min_bandwidth` | none | Bandwidth floor for both hops |
/// | `flags` | Fast Valid Running | Flags both hops must carry |
/// | `ports` | `accept 80,443,1024-65535` | Ports the exit must allow |
/// | `routers` | none | Explicit `[guard, exit]` nicknames |
/// | `disconnect` | `false` | Close all built circuits at startup |
///
/// ```rust
/// use fasttor_rs::Config;
///
/// let mut config = Config::default();
/// config.country = Some("nl".to_string());
/// config.routers = Some(vec!["guard".to_string(), "exit".to_string()]);
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// IP address or hostname of the Tor control port.
    #[serde(default = "default_control_ip")]
    pub control_ip: String,
    /// Port number of the Tor control port.
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Path to the Tor control socket.
    #[serde(default)]
    pub control_socket: Option<PathBuf>,
    /// Authentication credential.
    #[serde(default)]
    pub control_auth: Option<String>,
    /// Log level for output.
    #[serde(default)]
    pub loglevel: LogLevel,
    /// Log file path. None for stdout.
    #[serde(default)]
    pub logfile: Option<String>,
    /// Two-letter country code, lowercase.
    #[serde(default)]
    pub country: Option<String>,
    /// Minimum `Bandwidth=` value.
    #[serde(default)]
    pub min_bandwidth: Option<u64>,
    /// Required relay flags.
    #[serde(default = "default_flags")]
    pub flags: Vec<String>,
    /// Port policy the exit must cover.
    #[serde(default = "default_ports")]
    pub ports: String,
    /// Guard and exit nicknames.
    #[serde(default)]
    pub routers: Option<Vec<String>>,
    /// Close every built circuit before starting.
    #[serde(default)]
    pub disconnect: bool,
}

fn default_control_ip() -> String {
    "127.0.0.1".to_string()
}
fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}
fn default_flags() -> Vec<String> {
    vec!["Fast".to_string(), "Valid".to_string(), "Running".to_string()]
}
fn default_ports() -> String {
    DEFAULT_PORTS.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_ip: default_control_ip(),
            control_port: default_control_port(),
            control_socket: None,
            control_auth: None,
            loglevel: LogLevel::default(),
            logfile: None,
            country: None,
            min_bandwidth: None,
            flags: default_flags(),
            ports: default_ports(),
            routers: None,
            disconnect: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read.
    /// Returns [`Error::Config`] if the TOML is invalid.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Serialize configuration to TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Lowercases the country code to match Tor's GeoIP answers.
    pub fn normalize(&mut self) {
        if let Some(country) = self.country.as_mut() {
            country.make_ascii_lowercase();
        }
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a bad country code, router pair or
    /// empty control address, and [`Error::PortSpecParse`] for a bad port
    /// policy.
    pub fn validate(&self) -> Result<()> {
        if self.control_socket.is_none() && self.control_ip.trim().is_empty() {
            return Err(Error::Config("control_ip must not be empty".to_string()));
        }
        if let Some(country) = &self.country {
            if !is_valid_country_code(country) {
                return Err(Error::Config(format!("invalid country code: {}", country)));
            }
        }
        if let Some(routers) = &self.routers {
            if routers.len() != 2 || routers.iter().any(|r| r.is_empty()) {
                return Err(Error::Config(format!(
                    "routers must be a guard and an exit nickname, got {:?}",
                    routers
                )));
            }
        }
        PortRangeSet::parse_policy(&self.ports)?;
        Ok(())
    }
}

/// A control port endpoint given as `IP:PORT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEndpoint {
    pub host: String,
    pub port: u16,
}

impl FromStr for ControlEndpoint {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected IP:PORT, got '{}'", s))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(format!("missing address in '{}'", s));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("invalid port in '{}': {}", s, e))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

/// Command-line arguments for fasttor-rs.
///
/// # Options
///
/// | Option | Description |
/// |--------|-------------|
/// | `-a, --authenticate <CRED>` | Password, cookie hex or cookie file |
/// | `-t, --tor-control <IP:PORT>` | Control port (default 127.0.0.1:9051) |
/// | `--control-socket <PATH>` | Control socket, preferred over TCP |
/// | `-c, --country <CC>` | Country both hops must be in |
/// | `-b, --bandwidth <N>` | Bandwidth floor |
/// | `-f, --flags <"A B C">` | Required flags |
/// | `-p, --ports <POLICY>` | Ports the exit must allow |
/// | `-r, --routers <GUARD,EXIT>` | Use these two routers |
/// | `-d, --disconnect` | Close all built circuits first |
/// | `--loglevel <LEVEL>` | DEBUG, INFO, NOTICE, WARN, ERROR |
/// | `--logfile <FILE>` | Log to file instead of stdout |
/// | `--config <FILE>` | Configuration file [env: FASTTOR_CONFIG] |
/// | `--generate_config <FILE>` | Write default config to file and exit |
///
/// ```bash
/// fasttor-rs -a /run/tor/control.authcookie -c de -b 5000
/// fasttor-rs -t 127.0.0.1:9151 -r myguard,myexit -d
/// ```
#[derive(Parser, Debug)]
#[command(name = "fasttor-rs")]
#[command(about = "Route Tor streams through a fast two-hop circuit")]
#[command(version)]
#[command(
    long_about = "fasttor-rs picks a guard and an exit matching your criteria, builds a \
    two-hop circuit through them and attaches every new stream to it. This trades \
    anonymity for latency."
)]
pub struct CliArgs {
    /// Control port credential: password, cookie hex, or cookie file path.
    #[arg(short = 'a', long = "authenticate")]
    pub authenticate: Option<String>,

    /// Tor control port as IP:PORT.
    #[arg(short = 't', long = "tor-control")]
    pub tor_control: Option<ControlEndpoint>,

    /// Path to Tor control socket.
    #[arg(long)]
    pub control_socket: Option<PathBuf>,

    /// Country code both hops must be in.
    #[arg(short = 'c', long)]
    pub country: Option<String>,

    /// Minimum advertised bandwidth.
    #[arg(short = 'b', long)]
    pub bandwidth: Option<u64>,

    /// Space-separated flags both hops must carry.
    #[arg(short = 'f', long)]
    pub flags: Option<String>,

    /// Ports the exit must allow, e.g. "accept 80,443".
    #[arg(short = 'p', long)]
    pub ports: Option<String>,

    /// Explicit guard and exit nicknames, comma separated.
    #[arg(short = 'r', long)]
    pub routers: Option<String>,

    /// Close all built circuits before starting.
    #[arg(short = 'd', long)]
    pub disconnect: bool,

    /// Log verbosity (DEBUG, INFO, NOTICE, WARN, ERROR).
    #[arg(long)]
    pub loglevel: Option<LogLevel>,

    /// Log to file instead of stdout.
    #[arg(long)]
    pub logfile: Option<String>,

    /// Path to configuration file.
    #[arg(long = "config", env = "FASTTOR_CONFIG", default_value = "fasttor.conf")]
    pub config_file: PathBuf,

    /// Write default config to file and exit.
    #[arg(long = "generate_config")]
    pub generate_config: Option<PathBuf>,
}

impl CliArgs {
    /// Apply CLI arguments to a configuration, overriding values.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(ref credential) = self.authenticate {
            config.control_auth = Some(credential.clone());
        }
        if let Some(ref endpoint) = self.tor_control {
            config.control_ip = endpoint.host.clone();
            config.control_port = endpoint.port;
        }
        if let Some(ref control_socket) = self.control_socket {
            config.control_socket = Some(control_socket.clone());
        }
        if let Some(ref country) = self.country {
            config.country = Some(country.clone());
        }
        if let Some(bandwidth) = self.bandwidth {
            config.min_bandwidth = Some(bandwidth);
        }
        if let Some(ref flags) = self.flags {
            config.flags = flags.split_whitespace().map(str::to_string).collect();
        }
        if let Some(ref ports) = self.ports {
            config.ports = ports.clone();
        }
        if let Some(ref routers) = self.routers {
            config.routers = Some(routers.split(',').map(|r| r.trim().to_string()).collect());
        }
        if self.disconnect {
            config.disconnect = true;
        }
        if let Some(loglevel) = self.loglevel {
            config.loglevel = loglevel;
        }
        if let Some(ref logfile) = self.logfile {
            config.logfile = Some(logfile.clone());
        }
    }
}

/// Load configuration from file and CLI arguments.
///
/// 1. Start with defaults
/// 2. Apply config file if it exists
/// 3. Apply CLI arguments (override)
/// 4. Normalize and validate
pub fn load_config(args: &CliArgs) -> Result<Config> {
    let mut config = Config::default();

    if args.config_file.exists() {
        config = Config::from_file(&args.config_file)?;
    }

    args.apply_to(&mut config);
    config.normalize();
    config.validate()?;

    Ok(config)
}
