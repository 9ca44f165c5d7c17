//! Configuration loading and persistence.
//!
//! The client configuration is a flat string-keyed map persisted as pretty
//! JSON in the platform config directory, with `SHUFFLEBOX_*` environment
//! variable overrides applied on load. Typed accessor methods provide
//! defaults so a fresh installation works without a config file.
//!
//! [`KeyValueFile`] is the second, simpler store in this module: `key=value`
//! lines on disk. It backs both the emulator's own configuration file (which
//! the update-config command edits directly) and the plugin settings file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::fs;

/// Well-known configuration keys.
pub mod keys {
    /// Base URL of the coordination server.
    pub const SERVER_URL: &str = "server_url";
    /// Display name identifying this player to the server.
    pub const PLAYER_NAME: &str = "player_name";
    /// Emulator executable: absolute, relative, or a bare name on `PATH`.
    pub const EMULATOR_PATH: &str = "emulator_path";
    /// Working directory the emulator is launched in.
    pub const EMULATOR_DIR: &str = "emulator_dir";
    /// Directory ROMs and extra asset files are downloaded into.
    pub const ASSET_DIR: &str = "asset_dir";
    /// Directory save-state archives are kept in.
    pub const SAVE_DIR: &str = "save_dir";
    /// The emulator's own key/value config file (edited by update-config).
    pub const EMULATOR_CONFIG: &str = "emulator_config";
    /// Plugin settings key/value file.
    pub const PLUGINS_FILE: &str = "plugins_file";
    /// Side-channel file the bridge port is advertised through.
    pub const PORT_FILE: &str = "port_file";
}

/// Default server address used when no config file or override exists.
const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8080";

/// Client configuration: a flat string map with typed accessors.
#[derive(Debug, Clone)]
pub struct Config {
    values: BTreeMap<String, String>,
    path: PathBuf,
}

impl Config {
    /// Returns the configuration directory, creating it if necessary.
    ///
    /// Priority: `SHUFFLEBOX_CONFIG_DIR` env override, then a throwaway
    /// temp dir in test mode, then the platform config dir.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("SHUFFLEBOX_CONFIG_DIR") {
            PathBuf::from(dir)
        } else if crate::env::is_test_mode() {
            std::env::temp_dir().join("shufflebox-test")
        } else {
            dirs::config_dir()
                .context("could not determine platform config directory")?
                .join("shufflebox")
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Loads configuration from the default location, applying env overrides.
    ///
    /// A missing file yields an empty map (defaults apply via accessors).
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(Self::config_dir()?.join("config.json"))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from an explicit path. No env overrides.
    pub fn load_from(path: PathBuf) -> Result<Self> {
        let values = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("reading config {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("parsing config {}", path.display()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self { values, path })
    }

    fn apply_env_overrides(&mut self) {
        const OVERRIDES: [(&str, &str); 3] = [
            ("SHUFFLEBOX_SERVER_URL", keys::SERVER_URL),
            ("SHUFFLEBOX_PLAYER_NAME", keys::PLAYER_NAME),
            ("SHUFFLEBOX_EMULATOR_PATH", keys::EMULATOR_PATH),
        ];
        for (var, key) in OVERRIDES {
            if let Ok(value) = std::env::var(var) {
                self.values.insert(key.to_string(), value);
            }
        }
    }

    /// Raw value for a key, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Set a key. Not persisted until [`Self::save`].
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Persists the map to its backing file.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&self.values)?)?;

        // Owner read/write only
        #[cfg(unix)]
        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Base URL of the coordination server.
    #[must_use]
    pub fn server_url(&self) -> String {
        self.get(keys::SERVER_URL)
            .unwrap_or(DEFAULT_SERVER_URL)
            .trim_end_matches('/')
            .to_string()
    }

    /// Player display name; falls back to the machine hostname.
    #[must_use]
    pub fn player_name(&self) -> String {
        if let Some(name) = self.get(keys::PLAYER_NAME) {
            return name.to_string();
        }
        hostname::get()
            .ok()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|| "player".to_string())
    }

    /// Emulator executable spec (resolved at launch time).
    #[must_use]
    pub fn emulator_path(&self) -> String {
        self.get(keys::EMULATOR_PATH).unwrap_or("emuhawk").to_string()
    }

    /// Working directory for the emulator process.
    #[must_use]
    pub fn emulator_dir(&self) -> PathBuf {
        if let Some(dir) = self.get(keys::EMULATOR_DIR) {
            return PathBuf::from(dir);
        }
        // Derive from the executable's location when it carries a path
        let exe = PathBuf::from(self.emulator_path());
        match exe.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Directory ROMs and extra assets are downloaded into.
    #[must_use]
    pub fn asset_dir(&self) -> PathBuf {
        self.dir_or_data_subdir(keys::ASSET_DIR, "roms")
    }

    /// Directory save-state archives live in.
    #[must_use]
    pub fn save_dir(&self) -> PathBuf {
        self.dir_or_data_subdir(keys::SAVE_DIR, "saves")
    }

    /// The emulator's own key/value config file.
    #[must_use]
    pub fn emulator_config_path(&self) -> PathBuf {
        self.get(keys::EMULATOR_CONFIG)
            .map(PathBuf::from)
            .unwrap_or_else(|| self.emulator_dir().join("config.ini"))
    }

    /// Plugin settings file, kept next to the client config.
    #[must_use]
    pub fn plugins_path(&self) -> PathBuf {
        self.get(keys::PLUGINS_FILE)
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                self.path
                    .parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("plugins.cfg")
            })
    }

    /// Side-channel file the embedded script reads the bridge port from.
    #[must_use]
    pub fn port_file_path(&self) -> PathBuf {
        self.get(keys::PORT_FILE)
            .map(PathBuf::from)
            .unwrap_or_else(|| self.emulator_dir().join("shufflebox-port.txt"))
    }

    fn dir_or_data_subdir(&self, key: &str, subdir: &str) -> PathBuf {
        if let Some(dir) = self.get(key) {
            return PathBuf::from(dir);
        }
        dirs::data_dir()
            .map(|d| d.join("shufflebox"))
            .unwrap_or_else(|| PathBuf::from("."))
            .join(subdir)
    }
}

/// A `key=value` per line file store.
///
/// Used for the emulator's own flat configuration file and for the plugin
/// settings file. Blank lines and `#` comments are tolerated on load and not
/// preserved on save.
#[derive(Debug, Clone)]
pub struct KeyValueFile {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl KeyValueFile {
    /// Loads the file; a missing file yields an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut values = BTreeMap::new();
        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    values.insert(key.trim().to_string(), value.trim().to_string());
                }
            }
        }
        Ok(Self { path, values })
    }

    /// Value for a key, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Set a key. Not persisted until [`Self::save`].
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Number of stored entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` when no entries are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Persists all entries as `key=value` lines.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = String::new();
        for (key, value) in &self.values {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        fs::write(&self.path, out).with_context(|| format!("writing {}", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load_from(dir.path().join("config.json")).unwrap();
        assert_eq!(config.server_url(), DEFAULT_SERVER_URL);
        assert!(!config.player_name().is_empty());
        assert_eq!(config.emulator_path(), "emuhawk");
    }

    #[test]
    fn test_save_and_reload_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = Config::load_from(path.clone()).unwrap();
        config.set(keys::SERVER_URL, "http://shuffle.example:9000");
        config.set(keys::PLAYER_NAME, "alice");
        config.save().unwrap();

        let reloaded = Config::load_from(path).unwrap();
        assert_eq!(reloaded.server_url(), "http://shuffle.example:9000");
        assert_eq!(reloaded.player_name(), "alice");
    }

    #[test]
    fn test_server_url_strips_trailing_slash() {
        let dir = tempdir().unwrap();
        let mut config = Config::load_from(dir.path().join("config.json")).unwrap();
        config.set(keys::SERVER_URL, "http://host:8080/");
        assert_eq!(config.server_url(), "http://host:8080");
    }

    #[test]
    fn test_emulator_dir_derived_from_path() {
        let dir = tempdir().unwrap();
        let mut config = Config::load_from(dir.path().join("config.json")).unwrap();
        config.set(keys::EMULATOR_PATH, "/opt/emu/emuhawk");
        assert_eq!(config.emulator_dir(), PathBuf::from("/opt/emu"));

        config.set(keys::EMULATOR_DIR, "/srv/emulator");
        assert_eq!(config.emulator_dir(), PathBuf::from("/srv/emulator"));
    }

    #[test]
    fn test_key_value_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("emu.ini");
        let mut file = KeyValueFile::load(&path).unwrap();
        assert!(file.is_empty());

        file.set("SoundVolume", "85");
        file.set("Fullscreen", "true");
        file.save().unwrap();

        let reloaded = KeyValueFile::load(&path).unwrap();
        assert_eq!(reloaded.get("SoundVolume"), Some("85"));
        assert_eq!(reloaded.get("Fullscreen"), Some("true"));
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn test_key_value_file_tolerates_comments_and_blanks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("emu.ini");
        fs::write(&path, "# generated\n\nSpeed = 100\nbad line without equals\n").unwrap();

        let file = KeyValueFile::load(&path).unwrap();
        assert_eq!(file.get("Speed"), Some("100"));
        assert_eq!(file.len(), 1);
    }
}
