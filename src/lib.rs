//! # fasttor-rs
//!
//! A Tor controller that pins user streams to one fast two-hop circuit.
//!
//! # Overview
//!
//! fasttor-rs talks to a running Tor over its control port. It picks a guard
//! and an exit from the consensus, builds a circuit through exactly those two
//! relays, and attaches every new user stream to it. Streams it cannot place
//! are handed back to Tor. When the circuit dies a new one is built.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`transport`] | Control connection over TCP or a Unix socket, credentials |
//! | [`session`] | Reply framing, command/reply pairing, event queue |
//! | [`consensus`] | Router status entries from `GETINFO ns/all` |
//! | [`ports`] | Accept/reject port ranges and coverage checks |
//! | [`selection`] | Guard and exit candidate filtering |
//! | [`events`] | Typed `STREAM` and `CIRC` events |
//! | [`circuit`] | Circuit lifecycle and stream attachment |
//! | [`control`] | Startup, event loop and shutdown |
//! | [`config`] | Configuration management (TOML, CLI, environment) |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`logger`] | Logging infrastructure using tracing |
//!
//! # What This Library Does NOT Do
//!
//! - **Longer circuits**: every circuit is exactly guard then exit
//! - **Load balancing**: all user streams share one circuit
//! - **Running Tor**: a Tor process with an open control port is required
//!
//! # Quick Start
//!
//! ## As a Library
//!
//! ```rust,no_run
//! use fasttor_rs::{control, Config};
//!
//! #[tokio::main]
//! async fn main() -> fasttor_rs::Result<()> {
//!     let mut config = Config::default();
//!     config.country = Some("de".to_string());
//!     control::run_main(config).await
//! }
//! ```
//!
//! ## As a CLI Application
//!
//! ```bash
//! # Default control port, any country
//! fasttor-rs
//!
//! # German relays with at least 1 MB/s, through a socket file
//! fasttor-rs --control-socket /run/tor/control -c de -b 1000000
//!
//! # Explicit guard and exit
//! fasttor-rs -r myguard,myexit
//! ```
//!
//! # Configuration
//!
//! ```text
//! ┌─────────────────┐
//! │   CLI Arguments │ ◄── Highest priority (overrides all)
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │   Config File   │ ◄── TOML file (default: fasttor.conf, env FASTTOR_CONFIG)
//! │     (TOML)      │
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │    Defaults     │
//! └─────────────────┘
//! ```
//!
//! See [`Config`] for all available options.
//!
//! # Security Considerations
//!
//! - Control passwords are zeroized after use
//! - Cookie file contents are zeroized once hex-encoded
//! - Debug logs never show `AUTHENTICATE` arguments
//! - Tor options changed at startup are reset on exit
//!
//! # See Also
//!
//! - [Tor Control Protocol Specification](https://spec.torproject.org/control-spec)

#![warn(rustdoc::broken_intra_doc_links)]

pub mod circuit;
pub mod config;
pub mod consensus;
pub mod control;
pub mod error;
pub mod events;
pub mod logger;
pub mod ports;
pub mod selection;
pub mod session;
pub mod transport;

pub use circuit::{AttachOutcome, CircuitController, CircuitRecord, CircuitState, HopRef};
pub use config::{load_config, CliArgs, Config, ControlEndpoint, LogLevel};
pub use consensus::{fetch_routers, parse_router_statuses, RouterDescriptor};
pub use error::{Error, Result};
pub use events::{CircuitEnd, ControlEvent, DetachReason, StreamPurpose};
pub use ports::{PortRange, PortRangeSet};
pub use selection::{
    is_valid_country_code, select, CandidateSets, CountryLookup, NodeRestriction,
    NodeRestrictionList, SelectionCriteria,
};
pub use session::{Event, ProtocolInfo, ProtocolSession, Reply};
pub use transport::{ControlConnection, SecurePassword, Transport};

pub use control::{run_main, run_session, ShutdownSignal, VERSION};
