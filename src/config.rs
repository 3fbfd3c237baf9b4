// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Configuration loading: TOML file plus environment-variable overrides.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Listen address, e.g. 127.0.0.1:5000
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Directory that recording files are resolved against
    #[serde(default = "default_storage_root")]
    pub storage_root: String,

    /// Fail /Playback/stop when entries were never consumed
    #[serde(default)]
    pub strict_playback: bool,

    /// Terminate the process after a quiet period with no requests
    #[serde(default)]
    pub auto_shutdown: bool,

    /// Quiet period in seconds before auto-shutdown fires
    #[serde(default = "default_auto_shutdown_seconds")]
    pub auto_shutdown_seconds: u64,

    /// Asset store backend for push/restore/reset. Only "git" is built in.
    #[serde(default = "default_asset_store")]
    pub asset_store: String,
}

fn default_listen() -> String {
    "127.0.0.1:5000".to_string()
}

fn default_storage_root() -> String {
    ".".to_string()
}

fn default_auto_shutdown_seconds() -> u64 {
    300
}

fn default_asset_store() -> String {
    "git".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            storage_root: default_storage_root(),
            strict_playback: false,
            auto_shutdown: false,
            auto_shutdown_seconds: default_auto_shutdown_seconds(),
            asset_store: default_asset_store(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub async fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let s = tokio::fs::read_to_string(path.as_ref()).await?;
        let cfg: Self = toml::from_str(&s)?;
        Ok(cfg)
    }

    /// Apply `REPLAY_HTTP_*` environment overrides on top of file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| std::env::var(name).ok());
    }

    /// Override source is injectable so tests never mutate process env.
    pub fn apply_overrides_from(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = get("REPLAY_HTTP_LISTEN") {
            self.general.listen = listen;
        }
        if let Some(root) = get("REPLAY_HTTP_STORAGE_ROOT") {
            self.general.storage_root = root;
        }
        if let Some(value) = get("REPLAY_HTTP_AUTO_SHUTDOWN") {
            self.general.auto_shutdown = matches!(value.as_str(), "1" | "true" | "yes");
        }
        if let Some(value) = get("REPLAY_HTTP_AUTO_SHUTDOWN_SECONDS") {
            if let Ok(seconds) = value.parse() {
                self.general.auto_shutdown_seconds = seconds;
            }
        }
        if let Some(store) = get("REPLAY_HTTP_ASSET_STORE") {
            self.general.asset_store = store;
        }
    }

    /// There is exactly one built-in asset store backend; anything else in
    /// the selector is a configuration mistake worth failing loudly on.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.general.asset_store != "git" {
            anyhow::bail!(
                "unknown asset store backend {:?} (only \"git\" is supported)",
                self.general.asset_store
            );
        }
        Ok(())
    }
}
