//! HELLO reaction: bring a freshly (re)started script back in sync.
//!
//! The script sends HELLO whenever it initializes from scratch -- first
//! launch, emulator crash, config-driven relaunch. If the controller already
//! knows what this player should be running, it replays pause/swap/resume
//! from local state without asking the server. Only a client with no local
//! session (fresh process start) fetches the player's assignment over HTTP.
//! Either way the server is told about the readiness transition.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::command::{Command, CommandKind};
use crate::session::SessionSnapshot;

use super::CommandController;

/// The server's view of this player's assignment.
#[derive(Debug, Deserialize)]
struct RemoteSession {
    #[serde(default)]
    running: bool,
    #[serde(default)]
    game: String,
    #[serde(default)]
    instance_id: String,
}

impl CommandController {
    /// React to the script's HELLO.
    pub async fn handle_hello(self) {
        log::info!("[Controller] script ready");

        let snapshot = self.session.snapshot();
        if snapshot.is_active() {
            self.replay_session(&snapshot).await;
        } else {
            match self.fetch_remote_session().await {
                Ok(Some(remote)) if !remote.instance_id.is_empty() => {
                    self.session.begin_swap(&remote.game, &remote.instance_id);
                    self.session.set_running(remote.running);
                    let snapshot = self.session.snapshot();
                    self.replay_session(&snapshot).await;
                }
                Ok(_) => log::debug!("[Controller] no active assignment for this player"),
                Err(e) => log::warn!("[Controller] session fetch failed: {e:#}"),
            }
        }

        let mut payload = Map::new();
        payload.insert("player".to_string(), Value::from(self.settings.player.clone()));
        payload.insert("ready".to_string(), Value::from(true));
        self.reply(Command::new(CommandKind::Hello, payload)).await;
    }

    /// Re-issue pause + swap (+ resume when the session was running) so the
    /// peer picks up where the session left off.
    async fn replay_session(&self, snapshot: &SessionSnapshot) {
        log::info!(
            "[Controller] replaying session: game='{}' instance='{}' running={}",
            snapshot.game,
            snapshot.instance_id,
            snapshot.running
        );

        if let Err(e) = self.bridge.pause(&self.cancel).await {
            log::warn!("[Controller] replay pause failed: {e}");
            return;
        }
        if let Err(e) = self
            .bridge
            .swap(&snapshot.game, &snapshot.instance_id, &self.cancel)
            .await
        {
            log::warn!("[Controller] replay swap failed: {e}");
            return;
        }
        if snapshot.running {
            if let Err(e) = self.bridge.resume(&self.cancel).await {
                log::warn!("[Controller] replay resume failed: {e}");
            }
        }
    }

    /// Ask the server what this player should currently be running.
    async fn fetch_remote_session(&self) -> Result<Option<RemoteSession>> {
        let url = format!(
            "{}/api/players/{}/session",
            self.settings.server_url.trim_end_matches('/'),
            self.settings.player
        );
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("requesting player session")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            bail!("session fetch: server returned {}", response.status());
        }
        Ok(Some(response.json().await.context("parsing player session")?))
    }
}
