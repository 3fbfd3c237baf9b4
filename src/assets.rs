// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! The `assets.json` descriptor: maps a local recordings folder to a pinned
//! commit in a separate git-backed assets repository.

use crate::errors::ProxyError;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetsDescriptor {
    /// `org/repo` slug or a full clone URL.
    #[serde(rename = "AssetsRepo")]
    pub assets_repo: String,

    /// Subpath inside the assets repository holding this folder's recordings.
    #[serde(rename = "AssetsRepoPrefixPath")]
    pub prefix_path: String,

    /// Pinned commit. Only `push` advances it.
    #[serde(rename = "Tag", default)]
    pub tag: String,
}

impl AssetsDescriptor {
    pub fn new(assets_repo: &str, prefix_path: &str) -> Self {
        Self {
            assets_repo: assets_repo.to_string(),
            prefix_path: prefix_path.to_string(),
            tag: String::new(),
        }
    }

    pub async fn load(path: &Path) -> Result<Self, ProxyError> {
        let display = path.display().to_string();
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProxyError::InvalidRequest(format!(
                    "assets descriptor not found: {display}"
                )));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw).map_err(|e| ProxyError::MalformedRecording {
            path: display,
            reason: e.to_string(),
        })
    }

    pub async fn save(&self, path: &Path) -> Result<(), ProxyError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(self).map_err(|e| ProxyError::MalformedRecording {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Clone URL for the assets repository.
    pub fn repo_url(&self) -> String {
        if self.assets_repo.contains("://") {
            self.assets_repo.clone()
        } else {
            format!("https://github.com/{}.git", self.assets_repo)
        }
    }
}
