//! fasttor-rs CLI application entry point.
//!
//! # Startup Flow
//!
//! ```text
//!   ┌─────────────────┐
//!   │  Parse CLI Args │ ◄── clap parses command-line arguments
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌──────────────────┐      ┌─────────────────┐
//!   │ --generate_config│────▶ │ Write default   │────▶ Exit
//!   │    specified?    │      │ config & exit   │
//!   └────────┬─────────┘      └─────────────────┘
//!            │ No
//!            ▼
//!   ┌─────────────────┐
//!   │  Load Config    │ ◄── Defaults → File → CLI
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐
//!   │ Initialize      │ ◄── Set up tracing subscriber
//!   │   Logging       │
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐
//!   │ Run Main Loop   │ ◄── control::run_main()
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐
//!   │  Exit with      │
//!   │  status code    │
//!   └─────────────────┘
//! ```
//!
//! # Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Tor closed the connection, or CTRL+C |
//! | 1 | Error (see stderr for details) |
//!
//! # Environment Variables
//!
//! | Variable | Description |
//! |----------|-------------|
//! | `FASTTOR_CONFIG` | Path to config file (equivalent to `--config`) |
//! | `RUST_LOG` | Overrides the configured log level |

use clap::Parser;
use std::process::ExitCode;

use fasttor_rs::{config, control, logger, CliArgs, Config, LogLevel};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> fasttor_rs::Result<()> {
    let args = CliArgs::parse();

    if let Some(ref output_path) = args.generate_config {
        let toml = Config::default().to_toml()?;
        std::fs::write(output_path, toml)?;
        println!("Wrote default config to {}", output_path.display());
        return Ok(());
    }

    let config = config::load_config(&args)?;

    logger::init(config.loglevel, config.logfile.as_deref())?;

    logger::plog(
        LogLevel::Notice,
        &format!("fasttor-rs {} starting", control::VERSION),
    );
    match &config.control_socket {
        Some(path) => logger::plog(
            LogLevel::Debug,
            &format!("Control socket: {}", path.display()),
        ),
        None => logger::plog(
            LogLevel::Debug,
            &format!("Control port: {}:{}", config.control_ip, config.control_port),
        ),
    }
    logger::plog(
        LogLevel::Info,
        &format!(
            "Criteria: country {}, bandwidth >= {}, flags [{}], ports '{}'",
            config.country.as_deref().unwrap_or("any"),
            config.min_bandwidth.unwrap_or(0),
            config.flags.join(" "),
            config.ports
        ),
    );
    if let Some(routers) = &config.routers {
        logger::plog(
            LogLevel::Info,
            &format!("Using routers {}", routers.join(",")),
        );
    }
    if config.disconnect {
        logger::plog(LogLevel::Info, "Closing existing circuits first");
    }

    control::run_main(config).await
}
