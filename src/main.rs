//! vpnctl CLI application entry point.
//!
//! Runs a connection controller against the simulated backend and a local key
//! controller, and drives it from commands read on stdin.
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
//!   │ --generate_config│────▶ │ Write config    │────▶ Exit
//!   │    specified?    │      │ & exit          │
//!   └────────┬─────────┘      └─────────────────┘
//!            │ No
//!            ▼
//!   ┌─────────────────┐
//!   │  Load Config    │ ◄── Defaults → File → CLI → Env
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
//!   │ Spawn controller│ ◄── backend, keys, servers, notifications
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐
//!   │ Command loop    │ ◄── stdin until `quit`, EOF or Ctrl-C
//!   └─────────────────┘
//! ```
//!
//! # Commands
//!
//! | Command | Effect |
//! |---------|--------|
//! | `toggle` | Connect when idle, disconnect when live |
//! | `connect` | Start the connect flow |
//! | `disconnect` | Disconnect |
//! | `pause [SECS]` | Pause, for the configured default when SECS is omitted |
//! | `resume` | Cancel the pause and reconnect |
//! | `stop` | Force teardown |
//! | `reconnect` | Restart the connect flow |
//! | `regenerate` | Regenerate keys |
//! | `status` | Print the current state |
//! | `quit` | Shut down |
//!
//! Any other word is delivered as a named external action.
//!
//! # Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success |
//! | 1 | Error (see stderr for details) |

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use vpnctl::backend::SimulatedBackend;
use vpnctl::keys::LocalKeyController;
use vpnctl::notification::{format_countdown, LogNotificationSink};
use vpnctl::selection::{fastest_server_cache, StaticServerList};
use vpnctl::{
    config, logger, plog_fmt, CliArgs, Collaborators, Config, ConnectionController,
    ControllerHandle, ControllerSettings, LogLevel,
};

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

async fn run() -> vpnctl::Result<()> {
    let args = CliArgs::parse();

    if let Some(ref output_path) = args.generate_config {
        let mut config = Config::default();
        args.apply_to(&mut config);
        std::fs::write(output_path, config.to_toml()?)?;
        println!("Wrote config to {}", output_path.display());
        return Ok(());
    }

    let config = config::load_config(&args)?;
    logger::init(config.loglevel, config.logfile.as_deref())?;

    plog_fmt!(LogLevel::Notice, "vpnctl {} starting", vpnctl::VERSION);
    plog_fmt!(
        LogLevel::Debug,
        "{} servers, selection {:?}",
        config.servers.len(),
        config.selection
    );

    let (_publisher, fastest) = fastest_server_cache();
    let policy = StaticServerList::from_config(&config, fastest)?;
    let (actions, actions_rx) = tokio::sync::mpsc::unbounded_channel();

    let handle = ConnectionController::spawn(
        ControllerSettings::from_config(&config),
        Collaborators {
            backend: Arc::new(SimulatedBackend::from_config(&config.backend)),
            keys: Arc::new(LocalKeyController::new(&config.keys)),
            policy: Arc::new(policy),
            notifications: Arc::new(LogNotificationSink),
            actions: Some(actions_rx),
        },
    );

    let mut events = handle.add_state_listener();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            plog_fmt!(LogLevel::Debug, "Event: {:?}", event);
        }
    });

    if args.connect {
        handle.action_by_user();
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                plog_fmt!(LogLevel::Notice, "Interrupted");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !dispatch_command(&handle, &actions, line.trim()).await {
                    break;
                }
            }
        }
    }

    plog_fmt!(LogLevel::Notice, "Shutting down");
    handle.destroy();
    handle.closed().await;
    Ok(())
}

/// Runs one stdin command. Returns `false` on `quit`.
async fn dispatch_command(
    handle: &ControllerHandle,
    actions: &tokio::sync::mpsc::UnboundedSender<String>,
    line: &str,
) -> bool {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return true;
    };

    match command {
        "toggle" => handle.action_by_user(),
        "connect" => handle.start_connecting(false),
        "disconnect" => handle.disconnect(),
        "pause" => match words.next().map(str::parse::<u64>) {
            Some(Ok(secs)) => handle.pause(Duration::from_secs(secs)),
            Some(Err(_)) => println!("usage: pause [SECS]"),
            None => handle.deliver_action("pause"),
        },
        "resume" => handle.resume(),
        "stop" => handle.stop(),
        "reconnect" => handle.reconnect(),
        "regenerate" => handle.regenerate_keys(),
        "status" => match handle.snapshot().await {
            Some(snapshot) if snapshot.pause_remaining.is_zero() => {
                println!("{} via {}", snapshot.state, snapshot.selection)
            }
            Some(snapshot) => println!(
                "{} via {}, resuming in {}",
                snapshot.state,
                snapshot.selection,
                format_countdown(snapshot.pause_remaining)
            ),
            None => println!("controller stopped"),
        },
        "quit" | "exit" => return false,
        other => {
            if actions.send(other.to_string()).is_err() {
                plog_fmt!(LogLevel::Debug, "Action bus closed, dropping {}", other);
            }
        }
    }
    true
}
