//! Shufflebox client - binary entry point.
//!
//! Wires the transport, bridge, supervisor, and controller together and
//! runs until the session is cancelled (signal, or unexpected emulator
//! exit). See the `shufflebox` library for the components.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use shufflebox::{
    AssetStore, CommandController, Config, ControllerSettings, EmulatorBridge, GameCatalog,
    ProcessSupervisor, SaveStore, ServerTransport, SessionState,
};

/// mimalloc outperforms the system allocator under the many short-lived
/// tasks this client runs.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Queue between the transport reader and the controller dispatch loop.
const INTAKE_CAPACITY: usize = 64;

/// How long shutdown waits for the emulator to exit.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(4);

#[derive(Parser)]
#[command(name = "shufflebox", version, about = "Client for server-coordinated game shuffling")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the server and run the session (default).
    Run,
    /// Inspect or edit the client configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print one config value.
    Get {
        /// Config key.
        key: String,
    },
    /// Set one config value.
    Set {
        /// Config key.
        key: String,
        /// New value.
        value: String,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        None | Some(Commands::Run) => run_client(),
        Some(Commands::Config { action }) => run_config(action),
    }
}

fn run_config(action: ConfigAction) -> Result<()> {
    let mut config = Config::load()?;
    match action {
        ConfigAction::Get { key } => {
            match config.get(&key) {
                Some(value) => println!("{value}"),
                None => println!(),
            }
            Ok(())
        }
        ConfigAction::Set { key, value } => {
            config.set(key, value);
            config.save()
        }
    }
}

#[tokio::main]
async fn run_client() -> Result<()> {
    let config = Config::load()?;
    log::info!(
        "Starting shufflebox v{} as '{}' against {}",
        env!("CARGO_PKG_VERSION"),
        config.player_name(),
        config.server_url()
    );

    let cancel = CancellationToken::new();
    let http = reqwest::Client::new();

    let (bridge, bridge_events) = EmulatorBridge::bind(cancel.clone()).await?;
    let bridge = Arc::new(bridge);

    let transport = ServerTransport::start(config.server_url(), config.player_name(), cancel.clone());
    let (intake_tx, intake_rx) = mpsc::channel(INTAKE_CAPACITY);
    transport.register_handler(intake_tx);

    let supervisor = Arc::new(ProcessSupervisor::new(
        config.emulator_path(),
        config.emulator_dir(),
        config.port_file_path(),
    ));
    {
        // Unexpected emulator exit ends the session; a restart-mode exit is
        // just the peer going down until the relaunch says HELLO again
        let bridge = Arc::clone(&bridge);
        let cancel = cancel.clone();
        supervisor.on_exit(Arc::new(move |code, expected| {
            bridge.mark_peer_down();
            if !expected {
                log::error!("emulator exited unexpectedly (code {code:?}), ending session");
                cancel.cancel();
            }
        }));
    }

    let assets = Arc::new(AssetStore::new(
        http.clone(),
        config.server_url(),
        config.asset_dir(),
    ));
    let saves = Arc::new(SaveStore::new(
        http.clone(),
        config.server_url(),
        config.save_dir(),
    ));
    let session = Arc::new(SessionState::default());
    let catalog = Arc::new(GameCatalog::default());

    let settings = ControllerSettings {
        player: config.player_name(),
        server_url: config.server_url(),
        emulator_dir: config.emulator_dir(),
        emulator_config_path: config.emulator_config_path(),
        plugins_path: config.plugins_path(),
    };
    let controller = CommandController::new(
        Arc::clone(&bridge),
        Arc::clone(&supervisor),
        assets,
        saves,
        session,
        catalog,
        transport.sender(),
        settings,
        http,
        cancel.clone(),
    );
    let controller_task = tokio::spawn(controller.run(intake_rx, bridge_events));

    supervisor
        .launch(bridge.port())
        .context("emulator launch failed")?;

    wait_for_shutdown(&cancel).await;
    log::info!("Shutting down");
    cancel.cancel();

    // The shutdown termination is deliberate; keep its exit callback from
    // re-cancelling as an error
    supervisor.set_restart_mode(true);
    supervisor.terminate().await;
    if !supervisor.wait_exited(SHUTDOWN_WAIT).await {
        log::warn!("emulator still running after shutdown grace");
    }
    let _ = controller_task.await;

    Ok(())
}

/// Block until a termination signal arrives or the session cancels itself.
async fn wait_for_shutdown(cancel: &CancellationToken) {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("SIGTERM handler unavailable: {e}");
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    () = cancel.cancelled() => {}
                }
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => log::info!("SIGINT received"),
            _ = sigterm.recv() => log::info!("SIGTERM received"),
            () = cancel.cancelled() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => log::info!("interrupt received"),
            () = cancel.cancelled() => {}
        }
    }
}
