//! Shared test harness: a controller wired to real collaborators (loopback
//! bridge, temp directories, mock HTTP server) plus a scripted stand-in for
//! the emulator-side script.

#![allow(dead_code)]

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use shufflebox::{
    AssetStore, BridgeEvent, Command, CommandController, ControllerSettings, EmulatorBridge,
    GameCatalog, ProcessSupervisor, SaveStore, SessionState,
};

/// Controller plus everything a scenario needs to poke at.
pub struct Harness {
    pub controller: CommandController,
    pub bridge: Arc<EmulatorBridge>,
    pub events: mpsc::Receiver<BridgeEvent>,
    pub outbound_rx: mpsc::Receiver<Command>,
    pub session: Arc<SessionState>,
    pub catalog: Arc<GameCatalog>,
    pub saves: Arc<SaveStore>,
    pub assets: Arc<AssetStore>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub cancel: CancellationToken,
    pub dirs: TempDir,
    pub save_dir: PathBuf,
    pub asset_dir: PathBuf,
    pub emulator_dir: PathBuf,
}

/// Build a controller against `server_url` (usually a wiremock server).
pub async fn build_harness(server_url: &str) -> Harness {
    let cancel = CancellationToken::new();
    let dirs = TempDir::new().expect("tempdir");
    let asset_dir = dirs.path().join("roms");
    let save_dir = dirs.path().join("saves");
    let emulator_dir = dirs.path().join("emu");
    std::fs::create_dir_all(&asset_dir).unwrap();
    std::fs::create_dir_all(&save_dir).unwrap();
    std::fs::create_dir_all(&emulator_dir).unwrap();

    let http = reqwest::Client::new();
    let (bridge, events) = EmulatorBridge::bind(cancel.clone()).await.expect("bridge bind");
    let bridge = Arc::new(bridge);

    let (outbound_tx, outbound_rx) = mpsc::channel(32);
    let session = Arc::new(SessionState::default());
    let catalog = Arc::new(GameCatalog::default());
    let assets = Arc::new(AssetStore::new(http.clone(), server_url, asset_dir.clone()));
    let saves = Arc::new(SaveStore::new(http.clone(), server_url, save_dir.clone()));
    let supervisor = Arc::new(ProcessSupervisor::new(
        "sh",
        emulator_dir.clone(),
        dirs.path().join("port.txt"),
    ));

    let settings = ControllerSettings {
        player: "tester".to_string(),
        server_url: server_url.trim_end_matches('/').to_string(),
        emulator_dir: emulator_dir.clone(),
        emulator_config_path: emulator_dir.join("config.ini"),
        plugins_path: dirs.path().join("plugins.cfg"),
    };

    let controller = CommandController::new(
        Arc::clone(&bridge),
        Arc::clone(&supervisor),
        Arc::clone(&assets),
        Arc::clone(&saves),
        Arc::clone(&session),
        Arc::clone(&catalog),
        outbound_tx,
        settings,
        http,
        cancel.clone(),
    );

    Harness {
        controller,
        bridge,
        events,
        outbound_rx,
        session,
        catalog,
        saves,
        assets,
        supervisor,
        cancel,
        dirs,
        save_dir,
        asset_dir,
        emulator_dir,
    }
}

/// Behavior of the scripted peer.
pub struct PeerConfig {
    /// Send HELLO on connect (logical readiness).
    pub send_hello: bool,
    /// When set, a `save|<instance>` command writes a valid archive into
    /// this directory before the ack, like the real script does.
    pub save_dir: Option<PathBuf>,
}

/// Handle to the scripted peer.
pub struct Peer {
    seen: Arc<Mutex<Vec<String>>>,
    task: tokio::task::JoinHandle<()>,
}

impl Peer {
    /// Every command line the peer has read so far.
    pub fn lines(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    /// Just the verbs, in arrival order.
    pub fn verbs(&self) -> Vec<String> {
        self.lines()
            .iter()
            .map(|line| line.split('|').nth(2).unwrap_or("").to_string())
            .collect()
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

/// Dial the bridge and answer every command with an ack, mimicking the
/// embedded script. A peer without HELLO additionally announces itself with
/// a telemetry line so tests can wait for the connection to be installed.
pub async fn spawn_peer(port: u16, config: PeerConfig) -> Peer {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_writer = Arc::clone(&seen);

    let task = tokio::spawn(async move {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.expect("peer connect");
        let (read_half, mut write_half) = stream.into_split();

        if config.send_hello {
            write_half.write_all(b"HELLO\n").await.unwrap();
        } else {
            write_half.write_all(b"CMD|status|connected\n").await.unwrap();
        }

        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let mut parts = line.split('|');
            if parts.next() != Some("CMD") {
                continue;
            }
            let Some(id) = parts.next().map(str::to_string) else {
                continue;
            };
            let verb = parts.next().unwrap_or("").to_string();
            let first_arg = parts.next().unwrap_or("").to_string();
            seen_writer.lock().unwrap().push(line.clone());

            if verb == "save" {
                if let Some(dir) = &config.save_dir {
                    write_archive(&dir.join(format!("{first_arg}.state.gz")), b"snapshot");
                }
            }

            if write_half
                .write_all(format!("ACK|{id}\n").as_bytes())
                .await
                .is_err()
            {
                break;
            }
        }
    });

    Peer { seen, task }
}

/// Wait for the peer's HELLO to surface through the event stream.
pub async fn wait_ready(events: &mut mpsc::Receiver<BridgeEvent>) {
    loop {
        match tokio::time::timeout(std::time::Duration::from_secs(2), events.recv()).await {
            Ok(Some(BridgeEvent::Hello)) => return,
            Ok(Some(_)) => {}
            other => panic!("expected Hello event, got {other:?}"),
        }
    }
}

/// Wait for the non-HELLO peer's announcement line (connection installed,
/// readiness still false).
pub async fn wait_connected(events: &mut mpsc::Receiver<BridgeEvent>) {
    loop {
        match tokio::time::timeout(std::time::Duration::from_secs(2), events.recv()).await {
            Ok(Some(BridgeEvent::Line(line))) if line.contains("connected") => return,
            Ok(Some(_)) => {}
            other => panic!("expected peer announcement, got {other:?}"),
        }
    }
}

/// A minimal valid save archive.
pub fn write_archive(path: &std::path::Path, contents: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(contents).unwrap();
    std::fs::write(path, encoder.finish().unwrap()).unwrap();
}

/// Receive the next transport reply, bounded.
pub async fn next_reply(outbound_rx: &mut mpsc::Receiver<Command>) -> Command {
    tokio::time::timeout(std::time::Duration::from_secs(5), outbound_rx.recv())
        .await
        .expect("timed out waiting for a reply")
        .expect("transport queue closed")
}
