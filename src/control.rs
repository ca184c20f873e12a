//! Startup, event loop and shutdown.
//!
//! # Lifecycle
//!
//! ```text
//!                    ┌─────────────────┐
//!                    │ Connect to Tor  │  socket file, else IP:PORT
//!                    └────────┬────────┘
//!                             ▼
//!                    ┌─────────────────┐
//!                    │  Authenticate   │
//!                    └────────┬────────┘
//!                             ▼
//!                    ┌─────────────────┐
//!                    │ SETCONF session │  MaxCircuitDirtiness, __LeaveStreamsUnattached,
//!                    │ overrides       │  EnforceDistinctSubnets, UseEntryGuards
//!                    └────────┬────────┘
//!                             ▼
//!                    ┌─────────────────┐
//!                    │ SETEVENTS       │
//!                    │ STREAM CIRC     │
//!                    └────────┬────────┘
//!                             ▼
//!                    ┌─────────────────┐
//!                    │ fetch, select,  │
//!                    │ build circuit   │
//!                    └────────┬────────┘
//!                             ▼
//!              ┌──────────────────────────────┐
//!              │         Event Loop           │
//!              │  update ─▶ drain queue ─▶    │
//!              │  dispatch to controller      │
//!              └──────────────┬───────────────┘
//!                             │
//!          ┌──────────────────┼───────────────────┐
//!          ▼                  ▼                   ▼
//!   [Tor hung up]       [Ctrl-C]            [fatal error]
//!     exit 0          RESETCONF, QUIT      RESETCONF, QUIT
//!                        exit 0               exit 1
//! ```
//!
//! # Event Dispatch
//!
//! | Event | Action |
//! |-------|--------|
//! | `STREAM NEW` on circuit 0, purpose USER | attach to our circuit if built, else to 0 |
//! | `STREAM NEW` on circuit 0, purpose DNS_REQUEST | attach to 0 |
//! | `STREAM DETACHED` timeout / exit policy / no route | attach to 0 |
//! | `CIRC BUILT` for our circuit | mark built |
//! | `CIRC CLOSED\|FAILED` for our circuit | build a replacement |

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::circuit::{close_all_circuits, CircuitController, CircuitState, LET_TOR_ROUTE};
use crate::config::{Config, LogLevel};
use crate::consensus::fetch_routers;
use crate::error::{Error, Result};
use crate::events::{ControlEvent, StreamPurpose};
use crate::logger::plog;
use crate::selection::{select, SelectionCriteria};
use crate::session::ProtocolSession;
use crate::transport::{ControlConnection, SecurePassword, Transport};

/// Crate version, logged at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Options set for the lifetime of the session and reset on shutdown.
pub const SESSION_OVERRIDES: &[(&str, &str)] = &[
    ("MaxCircuitDirtiness", "99999999"),
    ("__LeaveStreamsUnattached", "1"),
    ("EnforceDistinctSubnets", "0"),
    ("UseEntryGuards", "0"),
];

/// Events we subscribe to.
pub const EVENTS: &[&str] = &["STREAM", "CIRC"];

/// Shutdown requests shared between the signal handler and the controller.
///
/// The first request stops startup or the event loop and starts the
/// shutdown sequence; the next one abandons that sequence.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    requests: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a request and wakes anyone waiting.
    pub fn trigger(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.requests() > 0
    }

    /// Number of requests so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Resolves once [`trigger`](Self::trigger) has been called.
    pub async fn wait(&self) {
        self.wait_for(1).await
    }

    /// Resolves once at least `count` requests have been made.
    pub async fn wait_for(&self, count: usize) {
        loop {
            let notified = self.notify.notified();
            if self.requests() >= count {
                return;
            }
            notified.await;
        }
    }

    /// Spawns a task that triggers on every CTRL+C.
    pub fn watch_ctrl_c(&self) {
        let signal = self.clone();
        tokio::spawn(async move {
            loop {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        plog(LogLevel::Notice, "Got CTRL+C. Exiting.");
                        signal.trigger();
                    }
                    Err(e) => {
                        plog(
                            LogLevel::Warn,
                            &format!("cannot listen for CTRL+C: {}", e),
                        );
                        return;
                    }
                }
            }
        });
    }
}

/// Why the event loop stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Tor closed the control connection.
    Disconnected,
    /// The operator asked us to stop.
    Interrupted,
}

/// Opens the control connection, preferring the socket file.
pub async fn connect_to_tor(config: &Config) -> Result<ControlConnection> {
    match &config.control_socket {
        Some(path) => ControlConnection::from_socket_file(path).await,
        None => ControlConnection::from_port(&config.control_ip, config.control_port).await,
    }
}

/// Runs the controller until Tor hangs up, CTRL+C, or a fatal error.
///
/// ```rust,no_run
/// use fasttor_rs::{control::run_main, Config};
///
/// #[tokio::main]
/// async fn main() -> Result<(), fasttor_rs::Error> {
///     run_main(Config::default()).await
/// }
/// ```
pub async fn run_main(config: Config) -> Result<()> {
    let shutdown = ShutdownSignal::new();
    shutdown.watch_ctrl_c();

    let criteria = SelectionCriteria::from_config(&config)?;
    let mut session = tokio::select! {
        biased;
        _ = shutdown.wait() => {
            plog(LogLevel::Notice, "interrupted before authenticating");
            return Ok(());
        }
        session = open_session(&config) => session?,
    };

    run_session(&mut session, &criteria, config.disconnect, &shutdown).await
}

async fn open_session(config: &Config) -> Result<ProtocolSession<ControlConnection>> {
    let connection = connect_to_tor(config).await?;
    plog(
        LogLevel::Info,
        &format!("connected to control port at {}", connection.peer()),
    );

    let mut session = ProtocolSession::new(connection);
    let credential = config.control_auth.clone().map(SecurePassword::new);
    session.authenticate(credential.as_ref()).await?;
    Ok(session)
}

/// Drives an authenticated session through startup, the event loop and
/// shutdown.
///
/// A clean hang-up by Tor ends the run successfully. On CTRL+C, at any
/// point of startup or the event loop, or on a fatal error the session
/// overrides are reset before returning. A further CTRL+C abandons the
/// reset.
pub async fn run_session<T: Transport>(
    session: &mut ProtocolSession<T>,
    criteria: &SelectionCriteria,
    disconnect: bool,
    shutdown: &ShutdownSignal,
) -> Result<()> {
    let outcome = tokio::select! {
        biased;
        _ = shutdown.wait() => Ok(LoopExit::Interrupted),
        outcome = start_and_run(session, criteria, disconnect, shutdown) => outcome,
    };

    match outcome {
        Ok(LoopExit::Disconnected) => {
            plog(LogLevel::Notice, "main loop is done");
            Ok(())
        }
        Ok(LoopExit::Interrupted) => {
            interruptible_shutdown(session, shutdown).await;
            Ok(())
        }
        Err(e) if e.is_disconnect() => {
            plog(LogLevel::Notice, "main loop is done");
            Ok(())
        }
        Err(e) => {
            plog(LogLevel::Error, &format!("{}", e));
            interruptible_shutdown(session, shutdown).await;
            Err(e)
        }
    }
}

/// Runs [`shutdown_sequence`] until it completes or the next CTRL+C.
async fn interruptible_shutdown<T: Transport>(
    session: &mut ProtocolSession<T>,
    shutdown: &ShutdownSignal,
) {
    let seen = shutdown.requests();
    tokio::select! {
        biased;
        _ = shutdown.wait_for(seen + 1) => {
            plog(LogLevel::Warn, "interrupted again, config not restored");
        }
        _ = shutdown_sequence(session) => {}
    }
}

async fn start_and_run<T: Transport>(
    session: &mut ProtocolSession<T>,
    criteria: &SelectionCriteria,
    disconnect: bool,
    shutdown: &ShutdownSignal,
) -> Result<LoopExit> {
    let version = session.version().await?;
    plog(LogLevel::Notice, &format!("connected to tor {}", version));

    for (key, value) in SESSION_OVERRIDES {
        session.set_conf(key, value).await?;
    }
    session.set_events(EVENTS).await?;

    if disconnect {
        close_all_circuits(session).await?;
    }

    plog(LogLevel::Notice, "getting tor directory");
    let routers = fetch_routers(session).await?;
    plog(LogLevel::Info, &format!("{} routers listed", routers.len()));
    let candidates = select(routers, criteria, session).await?;

    let mut circuit = CircuitController::new(candidates, criteria.routers.clone());
    circuit.establish(session).await?;

    event_loop(session, &mut circuit, shutdown).await
}

/// Resets the session overrides and says goodbye.
///
/// Every key is attempted even if an earlier one fails.
pub async fn shutdown_sequence<T: Transport>(session: &mut ProtocolSession<T>) {
    plog(LogLevel::Notice, "shutting down");

    let mut restored = true;
    for (key, _) in SESSION_OVERRIDES {
        if let Err(e) = session.reset_conf(key).await {
            plog(LogLevel::Warn, &format!("failed to reset {}: {}", key, e));
            restored = false;
        }
    }
    if restored {
        plog(LogLevel::Notice, "config restored");
    }

    if let Err(e) = session.quit().await {
        plog(LogLevel::Warn, &format!("failed to quit: {}", e));
    }
}

/// Reads groups and dispatches events until Tor hangs up or we are told to
/// stop.
///
/// On its own the loop only stops while waiting for the next line. A caller
/// that cancels it mid-command leaves the reply for the session to discard.
///
/// # Errors
///
/// Returns [`Error::Desync`] if a reply arrives with no command outstanding,
/// and propagates every non-disconnect error.
pub async fn event_loop<T: Transport>(
    session: &mut ProtocolSession<T>,
    circuit: &mut CircuitController,
    shutdown: &ShutdownSignal,
) -> Result<LoopExit> {
    loop {
        process_events(session, circuit).await?;
        if shutdown.is_triggered() {
            return Ok(LoopExit::Interrupted);
        }

        let update = tokio::select! {
            biased;
            _ = shutdown.wait() => return Ok(LoopExit::Interrupted),
            update = session.update() => update,
        };

        match update {
            Ok(None) => {}
            Ok(Some(reply)) => {
                return Err(Error::Desync(format!(
                    "{} {}",
                    reply.code,
                    reply.first_line()
                )))
            }
            Err(e) if e.is_disconnect() => return Ok(LoopExit::Disconnected),
            Err(e) => return Err(e),
        }
    }
}

/// Dispatches every queued event, oldest first, including events that
/// arrive while earlier ones are being handled.
pub async fn process_events<T: Transport>(
    session: &mut ProtocolSession<T>,
    circuit: &mut CircuitController,
) -> Result<()> {
    while let Some(event) = session.pop_event() {
        dispatch_event(session, circuit, ControlEvent::from(&event)).await?;
    }
    Ok(())
}

/// Applies the routing policy to one event.
pub async fn dispatch_event<T: Transport>(
    session: &mut ProtocolSession<T>,
    circuit: &mut CircuitController,
    event: ControlEvent,
) -> Result<()> {
    match event {
        ControlEvent::StreamNew {
            stream_id,
            circuit_id,
            purpose,
            ..
        } if circuit_id == LET_TOR_ROUTE => match purpose {
            StreamPurpose::User => {
                let ours = match circuit.state() {
                    CircuitState::Built => circuit.record().id.clone(),
                    _ => None,
                };
                let target = match ours {
                    Some(id) => id,
                    None => {
                        plog(
                            LogLevel::Notice,
                            "our stream is not available, routing by tor",
                        );
                        LET_TOR_ROUTE.to_string()
                    }
                };
                let outcome = circuit.attach_stream(session, &stream_id, &target).await?;
                plog(
                    LogLevel::Debug,
                    &format!("stream {}: {:?}", stream_id, outcome),
                );
            }
            StreamPurpose::DnsRequest => {
                circuit
                    .attach_stream(session, &stream_id, LET_TOR_ROUTE)
                    .await?;
            }
            StreamPurpose::Other(_) => {}
        },
        ControlEvent::StreamDetached {
            stream_id,
            target,
            reason,
        } if reason.is_reroutable() => {
            circuit
                .attach_stream(session, &stream_id, LET_TOR_ROUTE)
                .await?;
            plog(LogLevel::Notice, &format!("letting tor route to {}", target));
        }
        ControlEvent::CircuitBuilt { circuit_id } => {
            circuit.on_built(&circuit_id);
        }
        ControlEvent::CircuitClosedOrFailed { circuit_id, .. } if circuit.is_ours(&circuit_id) => {
            circuit.on_closed_or_failed(session).await?;
        }
        _ => {}
    }
    Ok(())
}
