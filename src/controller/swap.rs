//! Swap orchestration.
//!
//! The highest-complexity command path: record the assignment, quiesce
//! autosave, make the target game's files available, secure the previous
//! instance's state (save, verify, upload), pull the new instance's state,
//! and only then tell the script to swap. Each abortable step maps to its
//! own nack reason so the operator can tell a download problem from a save
//! problem from a bridge problem.

use std::sync::Arc;
use std::time::Duration;

use crate::command::Command;
use crate::saves::SaveDownload;

use super::CommandController;

/// Bound on making one game's primary + extras available.
const SWAP_ASSET_TIMEOUT: Duration = Duration::from_secs(60);

impl CommandController {
    /// `swap{game, instance_id}`: switch this player to another instance.
    pub(crate) async fn handle_swap(&self, cmd: &Command) {
        let game = cmd.str_field("game").unwrap_or("").to_string();
        let Some(instance_id) = cmd.str_field("instance_id").map(str::to_string) else {
            return self.nack(&cmd.id, "invalid payload: instance_id missing").await;
        };

        match self.perform_swap(&game, &instance_id).await {
            Ok(()) => self.ack(&cmd.id).await,
            Err(reason) => self.nack(&cmd.id, &reason).await,
        }
    }

    /// `start{game, instance_id}`: swap, then resume running.
    pub(crate) async fn handle_start(&self, cmd: &Command) {
        let game = cmd.str_field("game").unwrap_or("").to_string();
        let Some(instance_id) = cmd.str_field("instance_id").map(str::to_string) else {
            return self.nack(&cmd.id, "invalid payload: instance_id missing").await;
        };

        if let Err(reason) = self.perform_swap(&game, &instance_id).await {
            return self.nack(&cmd.id, &reason).await;
        }
        match self.bridge.resume(&self.cancel).await {
            Ok(()) => {
                self.session.set_running(true);
                self.ack(&cmd.id).await;
            }
            Err(e) => self.nack(&cmd.id, &format!("resume failed: {e}")).await,
        }
    }

    /// Run the swap steps with autosave quiesced. The re-enable is
    /// unconditional; it must not stay off because a middle step failed.
    pub(crate) async fn perform_swap(&self, game: &str, instance_id: &str) -> Result<(), String> {
        let previous = self.session.begin_swap(game, instance_id);
        log::info!(
            "[Controller] swap -> game='{game}' instance='{instance_id}' (previous '{previous}')"
        );

        // Best-effort: an autosave firing mid-swap would race the file moves
        // below, but a peer that cannot take the command is not fatal
        if let Err(e) = self.bridge.set_autosave(false, &self.cancel).await {
            log::warn!("[Controller] autosave disable failed (continuing): {e}");
        }

        let result = self.swap_steps(game, instance_id, &previous).await;

        if let Err(e) = self.bridge.set_autosave(true, &self.cancel).await {
            log::warn!("[Controller] autosave re-enable failed: {e}");
        }

        result
    }

    async fn swap_steps(
        &self,
        game: &str,
        instance_id: &str,
        previous: &str,
    ) -> Result<(), String> {
        // Target game's primary ROM and its catalog-declared extras
        if !game.is_empty() {
            self.session.set_pending_asset(Some(game.to_string()));
            let mut needed = vec![game.to_string()];
            needed.extend(self.catalog.extras_for(game));

            let ensured =
                tokio::time::timeout(SWAP_ASSET_TIMEOUT, self.assets.ensure_all(&needed, 4)).await;
            self.session.set_pending_asset(None);

            match ensured {
                Err(_elapsed) => return Err("download failed: timed out".to_string()),
                Ok(failures) if !failures.is_empty() => {
                    for (name, error) in &failures {
                        log::warn!("[Controller] asset {name}: {error:#}");
                    }
                    let names: Vec<&str> =
                        failures.iter().map(|(name, _)| name.as_str()).collect();
                    return Err(format!("download failed: {}", names.join(", ")));
                }
                Ok(_) => {}
            }
        }

        // Secure the outgoing state while the peer can still produce it
        if self.bridge.is_ready() && !previous.is_empty() {
            if let Err(e) = self.bridge.save(previous, &self.cancel).await {
                return Err(format!("save failed: {e}"));
            }
            if let Err(e) = self.saves.verify_save(previous).await {
                return Err(format!("save verify failed: {e:#}"));
            }
        }

        // The previous instance's save goes up in the background; the swap
        // never waits on it
        if !previous.is_empty() {
            let saves = Arc::clone(&self.saves);
            let prev = previous.to_string();
            tokio::spawn(async move {
                if let Err(e) = saves.upload_save(&prev).await {
                    log::warn!("[Controller] previous save upload failed (ignored): {e:#}");
                }
            });
        }

        // The incoming state must be local before the script loads it; a
        // save the server never saw means a fresh state, not a failure
        match self.saves.download_save(instance_id).await {
            Ok(SaveDownload::Fetched) => log::debug!("[Controller] save for {instance_id} fetched"),
            Ok(SaveDownload::NotFound) => {
                log::info!("[Controller] {instance_id} starts with a fresh state");
            }
            Err(e) => return Err(format!("save download failed: {e:#}")),
        }

        if let Err(e) = self.bridge.swap(game, instance_id, &self.cancel).await {
            return Err(format!("swap failed: {e}"));
        }
        Ok(())
    }
}
