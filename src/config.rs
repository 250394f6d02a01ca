//! Configuration read from `config.toml` under the platform config dir.
//! A missing or empty file is replaced with the defaults; a present but
//! malformed file is an error, silently running with defaults over a
//! half-written config is worse.

use std::path::PathBuf;

use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};
use tokio::{
    fs::{create_dir_all, OpenOptions},
    io::{AsyncReadExt, AsyncWriteExt},
};

use crate::error::Error;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Where completed `piece_<index>` files land.
    pub download_dir: String,

    /// The port we report to trackers in announce requests.
    #[serde(default = "default_local_peer_port")]
    pub local_peer_port: u16,

    /// How many peer workers the swarm keeps alive at once.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// How long the supervisor waits on the worker channels before
    /// sweeping for dead workers.
    #[serde(default = "default_supervision_interval_ms")]
    pub supervision_interval_ms: u64,
}

fn default_local_peer_port() -> u16 {
    51413
}

fn default_max_workers() -> usize {
    5
}

fn default_supervision_interval_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: String::new(),
            local_peer_port: default_local_peer_port(),
            max_workers: default_max_workers(),
            supervision_interval_ms: default_supervision_interval_ms(),
        }
    }
}

impl Config {
    /// Load `config.toml`, creating it with the defaults if it does not
    /// exist. The default download dir is the user's, from the platform
    /// conventions.
    pub async fn load() -> Result<Self, Error> {
        let dirs =
            ProjectDirs::from("", "", "Remora").ok_or(Error::HomeInvalid)?;
        let config_dir = dirs.config_dir().to_path_buf();

        if !config_dir.exists() {
            create_dir_all(&config_dir).await.map_err(|_| {
                Error::FolderOpenError(
                    config_dir.to_string_lossy().into_owned(),
                )
            })?;
        }

        let mut config_path = config_dir;
        config_path.push("config.toml");

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&config_path)
            .await?;

        let mut config_str = String::new();
        file.read_to_string(&mut config_str).await?;

        if config_str.trim().is_empty() {
            let config = Self::with_default_download_dir()?;
            let s = toml::to_string(&config)
                .map_err(|_| Error::ConfigDeserializeError)?;
            file.write_all(s.as_bytes()).await?;
            return Ok(config);
        }

        toml::from_str::<Config>(&config_str)
            .map_err(|_| Error::ConfigDeserializeError)
    }

    fn with_default_download_dir() -> Result<Self, Error> {
        let user_dirs = UserDirs::new().ok_or(Error::HomeInvalid)?;
        let download_dir = user_dirs
            .download_dir()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| user_dirs.home_dir().to_path_buf());

        Ok(Self {
            download_dir: download_dir.to_string_lossy().into_owned(),
            ..Default::default()
        })
    }

    pub fn download_path(&self) -> PathBuf {
        PathBuf::from(&self.download_dir)
    }
}
