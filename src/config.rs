//! Per-user configuration: OAuth client details, Colab host URLs, and the
//! on-disk layout under the user's config directory.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Error;

const APP_DIR_NAME: &str = "colabctl";

/// `config.json` — OAuth client id/secret and Colab/API host URLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Google OAuth client id used for the (externally handled) login flow.
    pub oauth_client_id: String,
    /// Google OAuth client secret.
    pub oauth_client_secret: String,
    /// Base URL of the Colab API host, e.g. `"https://colab.research.google.com"`.
    pub colab_api_base_url: String,
    /// A stable, client-chosen UUID used only as Colab's assignment cache
    /// key (`notebookHash`). Generated once on first run and persisted.
    pub notebook_hash: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            oauth_client_id: String::new(),
            oauth_client_secret: String::new(),
            colab_api_base_url: "https://colab.research.google.com".to_string(),
            notebook_hash: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl Config {
    /// Load `config.json` from `path`, or write and return the default
    /// configuration if it does not exist yet.
    pub fn load_or_init(path: &Path) -> Result<Self, Error> {
        match fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).map_err(|err| Error::json(path.display().to_string(), err)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let config = Config::default();
                config.save(path)?;
                Ok(config)
            }
            Err(err) => Err(Error::io(path.display().to_string(), err)),
        }
    }

    /// Persist this configuration to `path` with mode 0600.
    pub fn save(&self, path: &Path) -> Result<(), Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| Error::io(path.display().to_string(), err))?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|err| Error::json(path.display().to_string(), err))?;
        fs::write(path, json).map_err(|err| Error::io(path.display().to_string(), err))?;
        restrict_permissions(path)?;
        Ok(())
    }
}

/// The per-user config directory, e.g. `~/.config/colabctl` on Linux.
pub fn config_dir() -> Result<PathBuf, Error> {
    dirs::config_dir()
        .map(|base| base.join(APP_DIR_NAME))
        .ok_or_else(|| Error::Config("could not determine a config directory for this platform".into()))
}

/// `<config dir>/config.json`.
pub fn config_path(dir: &Path) -> PathBuf {
    dir.join("config.json")
}

/// `<config dir>/state/session.json`.
pub fn oauth_session_path(dir: &Path) -> PathBuf {
    dir.join("state").join("session.json")
}

/// `<config dir>/state/sessions.json`.
pub fn sessions_path(dir: &Path) -> PathBuf {
    dir.join("state").join("sessions.json")
}

/// `<config dir>/state/history.jsonl`.
pub fn history_path(dir: &Path) -> PathBuf {
    dir.join("state").join("history.jsonl")
}

/// `<config dir>/state/logs`.
pub fn logs_dir(dir: &Path) -> PathBuf {
    dir.join("state").join("logs")
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), Error> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)
        .map_err(|err| Error::io(path.display().to_string(), err))?
        .permissions();
    perms.set_mode(0o600);
    fs::set_permissions(path, perms).map_err(|err| Error::io(path.display().to_string(), err))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), Error> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn initializes_default_config_when_missing() {
        let dir = tempdir().unwrap();
        let path = config_path(dir.path());
        let config = Config::load_or_init(&path).unwrap();
        assert!(!config.notebook_hash.is_empty());
        assert!(path.exists());
    }

    #[test]
    fn round_trips_saved_config() {
        let dir = tempdir().unwrap();
        let path = config_path(dir.path());
        let mut config = Config::default();
        config.oauth_client_id = "client-123".into();
        config.save(&path).unwrap();

        let loaded = Config::load_or_init(&path).unwrap();
        assert_eq!(loaded.oauth_client_id, "client-123");
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restricted_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = config_path(dir.path());
        Config::default().save(&path).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }
}
