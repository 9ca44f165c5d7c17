//! ROM and auxiliary asset availability.
//!
//! `ensure_file` is idempotent: a file already present in the asset root is
//! never re-fetched, so the catalog-wide fan-out can run on every
//! games-update without hammering the server. Downloads land in a `.part`
//! file and are renamed into place, so a crash mid-download never leaves a
//! torn asset behind.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use futures_util::stream::{self, StreamExt};

/// Fetches assets from the server into a local asset root.
#[derive(Debug, Clone)]
pub struct AssetStore {
    http: reqwest::Client,
    base_url: String,
    root: PathBuf,
}

impl AssetStore {
    /// New store downloading from `base_url` into `root`.
    #[must_use]
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, root: PathBuf) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            root,
        }
    }

    /// Local path an asset lives at. Any path components in `name` are
    /// stripped; assets are flat files in the root.
    #[must_use]
    pub fn asset_path(&self, name: &str) -> PathBuf {
        self.root.join(flat_name(name))
    }

    /// Make sure `name` exists locally, downloading it only if absent.
    pub async fn ensure_file(&self, name: &str) -> Result<()> {
        let path = self.asset_path(name);
        if tokio::fs::try_exists(&path).await? {
            log::debug!("[Assets] {name} already present");
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating {}", self.root.display()))?;

        let url = format!("{}/api/assets/{}", self.base_url, flat_name(name));
        log::info!("[Assets] fetching {name}");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("requesting {url}"))?;
        if !response.status().is_success() {
            bail!("asset {name}: server returned {}", response.status());
        }
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("downloading {name}"))?;

        let partial = path.with_file_name(format!("{}.part", flat_name(name)));
        tokio::fs::write(&partial, &bytes)
            .await
            .with_context(|| format!("writing {}", partial.display()))?;
        tokio::fs::rename(&partial, &path)
            .await
            .with_context(|| format!("moving {} into place", partial.display()))?;

        log::info!("[Assets] {name} fetched ({} bytes)", bytes.len());
        Ok(())
    }

    /// Ensure every named asset, at most `parallelism` downloads at once.
    ///
    /// One asset's failure does not stop the others; all failures are
    /// collected and returned.
    pub async fn ensure_all(
        &self,
        names: &[String],
        parallelism: usize,
    ) -> Vec<(String, anyhow::Error)> {
        stream::iter(names.iter().cloned())
            .map(|name| async move {
                let result = self.ensure_file(&name).await;
                (name, result)
            })
            .buffer_unordered(parallelism.max(1))
            .filter_map(|(name, result)| async move { result.err().map(|e| (name, e)) })
            .collect()
            .await
    }
}

/// Strip any directory components from an asset name.
fn flat_name(name: &str) -> &str {
    Path::new(name)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(name)
}
