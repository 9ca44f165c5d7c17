//! Save-state transfer and verification.
//!
//! Save states are gzip archives keyed by instance id, kept in a local save
//! directory and mirrored on the server. Upload/download use the same HTTP
//! endpoints the asset store uses; a missing remote save is a normal outcome
//! (the embedded script starts a fresh state), so [`SaveStore::download_save`]
//! reports it as [`SaveDownload::NotFound`] rather than an error.
//!
//! Verification runs after the script writes a save: the file must exist, be
//! non-empty, and decode as a complete gzip stream. The emulator may still
//! be flushing when we first look, so the check retries a few times before
//! giving up. A save that never verifies is set aside under a timestamped
//! name for later inspection instead of being silently overwritten.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;

/// Verification attempts before a save is declared corrupt.
const VERIFY_ATTEMPTS: u32 = 3;

/// Pause between verification attempts.
const VERIFY_BACKOFF: std::time::Duration = std::time::Duration::from_millis(250);

/// Outcome of a save download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveDownload {
    /// The archive was fetched and stored locally.
    Fetched,
    /// The server has no save for this instance; the peer starts fresh.
    NotFound,
}

/// Uploads, downloads, and verifies save-state archives.
#[derive(Debug, Clone)]
pub struct SaveStore {
    http: reqwest::Client,
    base_url: String,
    save_dir: PathBuf,
}

impl SaveStore {
    /// New store exchanging saves with `base_url`, keeping them in `save_dir`.
    #[must_use]
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, save_dir: PathBuf) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            save_dir,
        }
    }

    /// Local archive path for an instance.
    #[must_use]
    pub fn save_path(&self, instance_id: &str) -> PathBuf {
        self.save_dir.join(format!("{}.state.gz", flat_id(instance_id)))
    }

    /// Upload the local archive for `instance_id` to the server.
    pub async fn upload_save(&self, instance_id: &str) -> Result<()> {
        let path = self.save_path(instance_id);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("no local save for {instance_id} at {}", path.display()))?;

        let url = format!("{}/api/saves/{}", self.base_url, flat_id(instance_id));
        let response = self
            .http
            .post(&url)
            .body(bytes)
            .send()
            .await
            .with_context(|| format!("uploading save for {instance_id}"))?;
        if !response.status().is_success() {
            bail!("save upload for {instance_id}: server returned {}", response.status());
        }
        log::info!("[Saves] uploaded save for {instance_id}");
        Ok(())
    }

    /// Fetch the archive for `instance_id` from the server.
    pub async fn download_save(&self, instance_id: &str) -> Result<SaveDownload> {
        let url = format!("{}/api/saves/{}", self.base_url, flat_id(instance_id));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("requesting save for {instance_id}"))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            log::info!("[Saves] no remote save for {instance_id}");
            return Ok(SaveDownload::NotFound);
        }
        if !response.status().is_success() {
            bail!("save download for {instance_id}: server returned {}", response.status());
        }

        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("downloading save for {instance_id}"))?;

        tokio::fs::create_dir_all(&self.save_dir).await?;
        let path = self.save_path(instance_id);
        let partial = path.with_file_name(format!("{}.part", flat_id(instance_id)));
        tokio::fs::write(&partial, &bytes).await?;
        tokio::fs::rename(&partial, &path).await?;

        log::info!("[Saves] fetched save for {instance_id} ({} bytes)", bytes.len());
        Ok(SaveDownload::Fetched)
    }

    /// Verify the local archive for `instance_id`: present, non-empty, and a
    /// readable gzip stream. Retries briefly because the emulator may still
    /// be flushing the file.
    pub async fn verify_save(&self, instance_id: &str) -> Result<()> {
        let path = self.save_path(instance_id);
        let mut last_err = None;

        for attempt in 1..=VERIFY_ATTEMPTS {
            match check_archive(&path).await {
                Ok(()) => {
                    log::debug!("[Saves] save for {instance_id} verified (attempt {attempt})");
                    return Ok(());
                }
                Err(e) => {
                    log::debug!("[Saves] verify attempt {attempt} for {instance_id} failed: {e}");
                    last_err = Some(e);
                    if attempt < VERIFY_ATTEMPTS {
                        tokio::time::sleep(VERIFY_BACKOFF).await;
                    }
                }
            }
        }

        // Set the bad file aside for inspection; the next save must not land
        // on top of it
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let stamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
            let quarantine = path.with_file_name(format!(
                "{}.corrupt-{stamp}",
                flat_id(instance_id)
            ));
            if let Err(e) = tokio::fs::rename(&path, &quarantine).await {
                log::warn!("[Saves] could not quarantine bad save: {e}");
            } else {
                log::warn!("[Saves] bad save moved to {}", quarantine.display());
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("save verification failed")))
            .with_context(|| format!("save for {instance_id} failed verification"))
    }

    /// Delete all local save archives. Returns how many files went away.
    pub fn clear_local_saves(&self) -> Result<usize> {
        let mut removed = 0;
        if !self.save_dir.exists() {
            return Ok(0);
        }
        for entry in std::fs::read_dir(&self.save_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        log::info!("[Saves] cleared {removed} local save files");
        Ok(removed)
    }

    /// Wipe the per-core battery-backed save directories under the emulator
    /// installation.
    pub fn clear_battery_dirs(&self, emulator_dir: &Path) -> Result<()> {
        let root = emulator_dir.join("SaveRAM");
        if !root.exists() {
            return Ok(());
        }
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(entry.path())?;
            } else {
                std::fs::remove_file(entry.path())?;
            }
        }
        log::info!("[Saves] cleared battery saves under {}", root.display());
        Ok(())
    }
}

/// One verification pass over the archive.
async fn check_archive(path: &Path) -> Result<()> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("save file missing: {}", path.display()))?;
    if metadata.len() == 0 {
        bail!("save file is empty: {}", path.display());
    }

    let bytes = tokio::fs::read(path).await?;
    let mut decoder = GzDecoder::new(bytes.as_slice());
    let mut sink = Vec::new();
    // Reading to EOF checks the gzip header and the trailing CRC
    decoder
        .read_to_end(&mut sink)
        .with_context(|| format!("save file is not a valid archive: {}", path.display()))?;
    Ok(())
}

/// Strip any directory components from an instance id used in paths/URLs.
fn flat_id(instance_id: &str) -> &str {
    Path::new(instance_id)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(instance_id)
}
