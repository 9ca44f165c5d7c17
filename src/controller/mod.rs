//! Protocol-level state machine.
//!
//! The controller consumes inbound server commands and unsolicited bridge
//! events, turns each into a sequence of bridge/file operations, and emits
//! exactly one ack or nack per request id back over the transport queue.
//!
//! The dispatch loop never blocks on a handler: every command runs as its
//! own task tied to the root cancellation token, so a slow swap cannot stall
//! a pause arriving behind it. Ordering between commands that must not
//! overlap is provided by the bridge's sequential delivery, not by the
//! dispatch loop.

mod resync;
mod swap;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::assets::AssetStore;
use crate::bridge::{BridgeEvent, EmulatorBridge, StyledMessage};
use crate::command::{Command, CommandKind};
use crate::config::KeyValueFile;
use crate::saves::SaveStore;
use crate::session::{GameCatalog, GameEntry, SessionState};
use crate::supervisor::ProcessSupervisor;

/// Upper bound on a catalog-wide or per-swap asset ensure.
const ASSET_ENSURE_TIMEOUT: Duration = Duration::from_secs(120);

/// Concurrent downloads during a catalog-wide prefetch.
const ASSET_FANOUT: usize = 4;

/// Bound on waiting for the old process to die during update-config.
const CONFIG_RESTART_WAIT: Duration = Duration::from_secs(5);

/// Paths and identity the controller needs beyond its collaborators.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Player display name.
    pub player: String,
    /// Server base URL (HTTP side, for the re-sync fetch).
    pub server_url: String,
    /// Emulator installation directory (battery saves live under it).
    pub emulator_dir: PathBuf,
    /// The emulator's own key/value config file.
    pub emulator_config_path: PathBuf,
    /// Plugin settings key/value file.
    pub plugins_path: PathBuf,
}

/// Turns server commands into bridge/file operations. Cheap to clone; all
/// state is shared behind the collaborators' own locks.
#[derive(Clone)]
pub struct CommandController {
    pub(crate) bridge: Arc<EmulatorBridge>,
    pub(crate) supervisor: Arc<ProcessSupervisor>,
    pub(crate) assets: Arc<AssetStore>,
    pub(crate) saves: Arc<SaveStore>,
    pub(crate) session: Arc<SessionState>,
    pub(crate) catalog: Arc<GameCatalog>,
    pub(crate) outbound: mpsc::Sender<Command>,
    pub(crate) settings: Arc<ControllerSettings>,
    pub(crate) http: reqwest::Client,
    pub(crate) cancel: CancellationToken,
}

impl CommandController {
    /// Wire up a controller from its collaborators.
    #[expect(clippy::too_many_arguments, reason = "explicit wiring at the composition root")]
    #[must_use]
    pub fn new(
        bridge: Arc<EmulatorBridge>,
        supervisor: Arc<ProcessSupervisor>,
        assets: Arc<AssetStore>,
        saves: Arc<SaveStore>,
        session: Arc<SessionState>,
        catalog: Arc<GameCatalog>,
        outbound: mpsc::Sender<Command>,
        settings: ControllerSettings,
        http: reqwest::Client,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            bridge,
            supervisor,
            assets,
            saves,
            session,
            catalog,
            outbound,
            settings: Arc::new(settings),
            http,
            cancel,
        }
    }

    /// Dispatch loop: spawns one task per inbound command or bridge event
    /// until cancellation.
    pub async fn run(
        self,
        mut intake: mpsc::Receiver<Command>,
        mut events: mpsc::Receiver<BridgeEvent>,
    ) {
        log::info!("[Controller] started");
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,

                cmd = intake.recv() => match cmd {
                    Some(cmd) => {
                        let controller = self.clone();
                        tokio::spawn(async move { controller.handle_command(cmd).await });
                    }
                    None => break,
                },

                event = events.recv() => match event {
                    Some(BridgeEvent::Hello) => {
                        let controller = self.clone();
                        tokio::spawn(controller.handle_hello());
                    }
                    Some(BridgeEvent::Line(raw)) => {
                        log::debug!("[Controller] peer event: {raw}");
                    }
                    None => break,
                },
            }
        }
        log::info!("[Controller] stopped");
    }

    /// Handle one inbound command. Every path emits exactly one ack or nack
    /// for the command's id (ack/nack themselves are terminal and only
    /// logged).
    pub async fn handle_command(self, cmd: Command) {
        log::debug!("[Controller] handling {:?} ({})", cmd.cmd, cmd.id);
        match cmd.cmd {
            CommandKind::Pause => self.handle_pause(&cmd).await,
            CommandKind::Resume => self.handle_resume(&cmd).await,
            CommandKind::Swap => self.handle_swap(&cmd).await,
            CommandKind::Start => self.handle_start(&cmd).await,
            CommandKind::ClearSaves => self.handle_clear_saves(&cmd).await,
            CommandKind::GamesUpdate => self.handle_games_update(&cmd).await,
            CommandKind::Message => self.handle_message(&cmd).await,
            CommandKind::RequestSave => self.handle_request_save(&cmd).await,
            CommandKind::CheckConfig => self.handle_check_config(&cmd).await,
            CommandKind::UpdateConfig => self.handle_update_config(&cmd).await,
            CommandKind::PluginSettings => self.handle_plugin_settings(&cmd).await,
            CommandKind::PluginReload => self.handle_plugin_reload(&cmd).await,
            CommandKind::Ack => log::debug!("[Controller] server acked {}", cmd.id),
            CommandKind::Nack => log::warn!(
                "[Controller] server nacked {}: {}",
                cmd.id,
                cmd.str_field("reason").unwrap_or("no reason")
            ),
            // Newer servers may send kinds we do not know; acknowledge so
            // they do not retry forever
            CommandKind::Hello | CommandKind::Unknown => self.ack(&cmd.id).await,
        }
    }

    pub(crate) async fn reply(&self, cmd: Command) {
        if self.outbound.send(cmd).await.is_err() {
            log::warn!("[Controller] transport queue closed, reply dropped");
        }
    }

    pub(crate) async fn ack(&self, request_id: &str) {
        self.reply(Command::ack(request_id)).await;
    }

    pub(crate) async fn ack_with(&self, request_id: &str, payload: Map<String, Value>) {
        self.reply(Command::ack_with(request_id, payload)).await;
    }

    pub(crate) async fn nack(&self, request_id: &str, reason: &str) {
        log::warn!("[Controller] nacking {request_id}: {reason}");
        self.reply(Command::nack(request_id, reason)).await;
    }

    pub(crate) async fn nack_with(
        &self,
        request_id: &str,
        reason: &str,
        extra: Map<String, Value>,
    ) {
        log::warn!("[Controller] nacking {request_id}: {reason}");
        self.reply(Command::nack_with(request_id, reason, extra)).await;
    }

    async fn handle_pause(&self, cmd: &Command) {
        match self.bridge.pause(&self.cancel).await {
            Ok(()) => {
                self.session.set_running(false);
                self.ack(&cmd.id).await;
            }
            Err(e) => self.nack(&cmd.id, &format!("pause failed: {e}")).await,
        }
    }

    async fn handle_resume(&self, cmd: &Command) {
        match self.bridge.resume(&self.cancel).await {
            Ok(()) => {
                self.session.set_running(true);
                self.ack(&cmd.id).await;
            }
            Err(e) => self.nack(&cmd.id, &format!("resume failed: {e}")).await,
        }
    }

    async fn handle_message(&self, cmd: &Command) {
        let Some(text) = cmd.str_field("text") else {
            return self.nack(&cmd.id, "invalid payload: text missing").await;
        };
        let message = StyledMessage {
            text: text.to_string(),
            position: cmd.str_field("position").map(str::to_string),
            duration_ms: cmd.u64_field("duration_ms"),
            foreground: cmd.str_field("fg").map(str::to_string),
            background: cmd.str_field("bg").map(str::to_string),
        };
        match self.bridge.show_message(&message, &self.cancel).await {
            Ok(()) => self.ack(&cmd.id).await,
            Err(e) => self.nack(&cmd.id, &format!("message failed: {e}")).await,
        }
    }

    async fn handle_request_save(&self, cmd: &Command) {
        if !self.bridge.is_ready() {
            return self.nack(&cmd.id, "not ready").await;
        }
        let instance = self.session.snapshot().instance_id;
        if instance.is_empty() {
            return self.nack(&cmd.id, "not ready: no active instance").await;
        }
        if let Err(e) = self.bridge.save(&instance, &self.cancel).await {
            return self.nack(&cmd.id, &format!("save failed: {e}")).await;
        }
        if let Err(e) = self.saves.upload_save(&instance).await {
            return self.nack(&cmd.id, &format!("upload failed: {e}")).await;
        }
        self.ack(&cmd.id).await;
    }

    async fn handle_clear_saves(&self, cmd: &Command) {
        match self.saves.clear_local_saves() {
            Ok(count) => log::info!("[Controller] cleared {count} save files"),
            Err(e) => log::warn!("[Controller] clearing saves: {e}"),
        }
        if let Err(e) = self.saves.clear_battery_dirs(&self.settings.emulator_dir) {
            log::warn!("[Controller] clearing battery saves: {e}");
        }

        if let Err(e) = self.bridge.restart(&self.cancel).await {
            return self.nack(&cmd.id, &format!("restart failed: {e}")).await;
        }
        let notice = StyledMessage::plain("Save data cleared");
        if let Err(e) = self.bridge.show_message(&notice, &self.cancel).await {
            return self.nack(&cmd.id, &format!("notify failed: {e}")).await;
        }
        self.ack(&cmd.id).await;
    }

    async fn handle_games_update(&self, cmd: &Command) {
        let games: Vec<GameEntry> = match cmd.payload.get("games") {
            Some(value) => match serde_json::from_value(value.clone()) {
                Ok(games) => games,
                Err(e) => return self.nack(&cmd.id, &format!("invalid payload: {e}")).await,
            },
            None => return self.nack(&cmd.id, "invalid payload: games missing").await,
        };

        self.catalog.replace(games);
        let required = self.catalog.required_assets();
        log::info!("[Controller] catalog replaced, {} assets required", required.len());

        let ensured = tokio::time::timeout(
            ASSET_ENSURE_TIMEOUT,
            self.assets.ensure_all(&required, ASSET_FANOUT),
        )
        .await;

        match ensured {
            Err(_elapsed) => self.nack(&cmd.id, "download failed: timed out").await,
            Ok(failures) if failures.is_empty() => {
                let mut payload = Map::new();
                payload.insert("present".to_string(), Value::from(required));
                self.ack_with(&cmd.id, payload).await;
            }
            Ok(failures) => {
                for (name, error) in &failures {
                    log::warn!("[Controller] asset {name}: {error:#}");
                }
                let missing: Vec<String> = failures.into_iter().map(|(name, _)| name).collect();
                let mut extra = Map::new();
                extra.insert("missing".to_string(), Value::from(missing.clone()));
                self.nack_with(
                    &cmd.id,
                    &format!("download failed: {}", missing.join(", ")),
                    extra,
                )
                .await;
            }
        }
    }

    async fn handle_check_config(&self, cmd: &Command) {
        let Some(key) = cmd.str_field("key") else {
            return self.nack(&cmd.id, "invalid payload: key missing").await;
        };
        match KeyValueFile::load(&self.settings.emulator_config_path) {
            Ok(file) => {
                let mut payload = Map::new();
                payload.insert("key".to_string(), Value::from(key));
                payload.insert(
                    "value".to_string(),
                    file.get(key).map(Value::from).unwrap_or(Value::Null),
                );
                self.ack_with(&cmd.id, payload).await;
            }
            Err(e) => self.nack(&cmd.id, &format!("config read failed: {e}")).await,
        }
    }

    async fn handle_update_config(&self, cmd: &Command) {
        let (Some(key), Some(value)) = (cmd.str_field("key"), cmd.str_field("value")) else {
            return self.nack(&cmd.id, "invalid payload: key/value missing").await;
        };

        // A running emulator must come down before its config file changes
        // under it; restart mode keeps the exit from ending the session
        let was_running = self.supervisor.is_running();
        if was_running {
            self.supervisor.set_restart_mode(true);
            self.supervisor.terminate().await;
            if !self.supervisor.wait_exited(CONFIG_RESTART_WAIT).await {
                log::warn!("[Controller] emulator slow to exit before config update");
            }
        }

        let apply = KeyValueFile::load(&self.settings.emulator_config_path).and_then(|mut file| {
            file.set(key, value);
            file.save()
        });
        match apply {
            Ok(()) => self.ack(&cmd.id).await,
            Err(e) => self.nack(&cmd.id, &format!("config write failed: {e}")).await,
        }

        if was_running {
            // Restart mode carries across this relaunch so the old
            // process's delayed exit callback stays suppressed
            if let Err(e) = self.supervisor.relaunch(self.bridge.port()) {
                log::error!("[Controller] relaunch after config update failed: {e:#}");
            }
        }
    }

    async fn handle_plugin_settings(&self, cmd: &Command) {
        let Some(Value::Object(settings)) = cmd.payload.get("settings") else {
            return self.nack(&cmd.id, "invalid payload: settings missing").await;
        };

        let persist = KeyValueFile::load(&self.settings.plugins_path).and_then(|mut file| {
            for (key, value) in settings {
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                file.set(key.clone(), value);
            }
            file.save()
        });
        if let Err(e) = persist {
            return self.nack(&cmd.id, &format!("settings write failed: {e}")).await;
        }

        match self.bridge.reload_plugins(&self.cancel).await {
            Ok(()) => self.ack(&cmd.id).await,
            Err(e) => self.nack(&cmd.id, &format!("reload failed: {e}")).await,
        }
    }

    async fn handle_plugin_reload(&self, cmd: &Command) {
        match self.bridge.reload_plugins(&self.cancel).await {
            Ok(()) => self.ack(&cmd.id).await,
            Err(e) => self.nack(&cmd.id, &format!("reload failed: {e}")).await,
        }
    }
}
