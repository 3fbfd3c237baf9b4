// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Git-backed asset store: restore, push, and reset recording folders
//! against the assets repository named in `assets.json`.
//!
//! Everything is built on one primitive — run a git subprocess and inspect
//! its exit code and output. Commands against the same working tree are
//! serialized; git is not safe for concurrent mutation of one tree.
//! Transient network failures retry with backoff, conflicting pushes never
//! auto-merge.

use crate::assets::AssetsDescriptor;
use crate::errors::ProxyError;
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

const RETRY_ATTEMPTS: u32 = 3;
const GIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Directory (sibling to `assets.json`) holding the assets working tree.
const WORK_TREE_DIR: &str = ".assets";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GitCommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn ok() -> Self {
        Self {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    pub fn with_stdout(stdout: &str) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: &str) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }
}

#[async_trait]
pub trait GitRunner: Send + Sync {
    async fn run(&self, args: &[String], cwd: &Path) -> Result<GitCommandOutput, ProxyError>;
}

/// Runs the real git binary with a per-command timeout.
pub struct SystemGitRunner {
    timeout: Duration,
}

impl SystemGitRunner {
    pub fn new() -> Self {
        Self {
            timeout: GIT_TIMEOUT,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemGitRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GitRunner for SystemGitRunner {
    async fn run(&self, args: &[String], cwd: &Path) -> Result<GitCommandOutput, ProxyError> {
        let mut command = tokio::process::Command::new("git");
        command
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Err(_) => return Err(ProxyError::GitTimeout(args.join(" "))),
            Ok(result) => result?,
        };

        Ok(GitCommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Scripted runner for tests: pops queued responses and records every call.
#[derive(Default)]
pub struct ScriptedGitRunner {
    responses: Mutex<std::collections::VecDeque<Result<GitCommandOutput, ProxyError>>>,
    calls: Mutex<Vec<(Vec<String>, PathBuf)>>,
}

impl ScriptedGitRunner {
    pub fn push_response(&self, response: Result<GitCommandOutput, ProxyError>) {
        self.responses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(response);
    }

    pub fn calls(&self) -> Vec<(Vec<String>, PathBuf)> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

#[async_trait]
impl GitRunner for ScriptedGitRunner {
    async fn run(&self, args: &[String], cwd: &Path) -> Result<GitCommandOutput, ProxyError> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push((args.to_vec(), cwd.to_path_buf()));
        self.responses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .unwrap_or_else(|| Ok(GitCommandOutput::ok()))
    }
}

/// Non-zero exits caused by transient network conditions are worth a retry.
fn is_retriable(stderr: &str) -> bool {
    if stderr.is_empty() {
        return false;
    }
    if stderr.contains("The requested URL returned error: 429") {
        return true;
    }
    if stderr.contains("Connection timed out") || stderr.contains("Operation timed out") {
        return true;
    }
    Regex::new(r"Failed to connect to [^ ]+ port \d+ after \d+ ms: Couldn't connect to server")
        .map(|re| re.is_match(stderr))
        .unwrap_or(false)
}

pub struct GitStore {
    runner: Arc<dyn GitRunner>,
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl GitStore {
    pub fn new(runner: Arc<dyn GitRunner>) -> Self {
        Self {
            runner,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Working tree used for the folder that `assets.json` describes.
    pub fn work_tree_for(assets_json: &Path) -> PathBuf {
        assets_json
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(WORK_TREE_DIR)
    }

    fn dir_lock(&self, work_tree: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks
            .entry(work_tree.to_path_buf())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn run_checked(
        &self,
        args: &[&str],
        cwd: &Path,
    ) -> Result<GitCommandOutput, ProxyError> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let joined = args.join(" ");
        let mut attempt = 1;
        loop {
            match self.runner.run(&args, cwd).await {
                Ok(output) if output.success() => return Ok(output),
                Ok(output) => {
                    if attempt < RETRY_ATTEMPTS && is_retriable(&output.stderr) {
                        warn!(
                            command = %joined,
                            attempt,
                            stderr = %output.stderr.trim(),
                            "transient git failure, retrying"
                        );
                    } else {
                        return Err(ProxyError::GitProcess {
                            args: joined,
                            exit_code: output.exit_code,
                            stdout: output.stdout,
                            stderr: output.stderr,
                        });
                    }
                }
                Err(ProxyError::GitTimeout(command)) => {
                    if attempt >= RETRY_ATTEMPTS {
                        return Err(ProxyError::GitTimeout(command));
                    }
                    warn!(command = %joined, attempt, "git command timed out, retrying");
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(Duration::from_secs(u64::from(attempt) * 2)).await;
            attempt += 1;
        }
    }

    /// Materialize the pinned commit into the local working tree via a
    /// blobless clone and sparse checkout of the prefix path.
    pub async fn restore(&self, assets_json: &Path) -> Result<(), ProxyError> {
        let descriptor = AssetsDescriptor::load(assets_json).await?;
        let work_tree = Self::work_tree_for(assets_json);
        let lock = self.dir_lock(&work_tree);
        let _guard = lock.lock().await;

        if !work_tree.join(".git").exists() {
            let parent = work_tree
                .parent()
                .ok_or_else(|| ProxyError::InvalidRequest("invalid assets path".into()))?
                .to_path_buf();
            tokio::fs::create_dir_all(&parent).await?;
            self.run_checked(
                &[
                    "clone",
                    "--filter=blob:none",
                    "--no-checkout",
                    &descriptor.repo_url(),
                    WORK_TREE_DIR,
                ],
                &parent,
            )
            .await?;
        }

        self.run_checked(&["sparse-checkout", "init"], &work_tree)
            .await?;
        self.run_checked(
            &["sparse-checkout", "set", &descriptor.prefix_path],
            &work_tree,
        )
        .await?;
        if !descriptor.tag.is_empty() {
            self.run_checked(
                &[
                    "-c",
                    "advice.detachedHead=false",
                    "checkout",
                    &descriptor.tag,
                ],
                &work_tree,
            )
            .await?;
        }

        info!(
            repo = %descriptor.assets_repo,
            tag = %descriptor.tag,
            path = %work_tree.display(),
            "assets restored"
        );
        Ok(())
    }

    /// Stage, commit, and push local recording changes; on success the
    /// descriptor's pinned commit advances to the new SHA. With nothing to
    /// commit this is a clean no-op and the pin is untouched.
    pub async fn push(&self, assets_json: &Path) -> Result<Option<String>, ProxyError> {
        let mut descriptor = AssetsDescriptor::load(assets_json).await?;
        let work_tree = Self::work_tree_for(assets_json);
        let lock = self.dir_lock(&work_tree);
        let _guard = lock.lock().await;
        self.ensure_restored(&work_tree)?;

        let status = self
            .run_checked(&["status", "--porcelain", &descriptor.prefix_path], &work_tree)
            .await?;
        if status.stdout.trim().is_empty() {
            info!(path = %work_tree.display(), "no recording changes to push");
            return Ok(None);
        }

        self.run_checked(&["add", &descriptor.prefix_path], &work_tree)
            .await?;
        let message = format!(
            "Update recordings under {} ({})",
            descriptor.prefix_path,
            chrono::Utc::now().to_rfc3339()
        );
        self.run_checked(&["commit", "-m", &message], &work_tree)
            .await?;
        let sha = self
            .run_checked(&["rev-parse", "HEAD"], &work_tree)
            .await?
            .stdout
            .trim()
            .to_string();

        // HEAD is detached after a pinned restore, so push by explicit
        // refspec. A rejected push (non-fast-forward) aborts here; the
        // descriptor pin must not move.
        let branch = format!(
            "refs/heads/recordings/{}",
            descriptor.prefix_path.replace('/', "-")
        );
        let refspec = format!("HEAD:{branch}");
        self.run_checked(&["push", "origin", &refspec], &work_tree)
            .await?;

        descriptor.tag = sha.clone();
        descriptor.save(assets_json).await?;
        info!(sha = %sha, "assets pushed, descriptor pin advanced");
        Ok(Some(sha))
    }

    /// Discard local changes to the recordings folder and return to the
    /// pinned commit.
    pub async fn reset(&self, assets_json: &Path) -> Result<(), ProxyError> {
        let descriptor = AssetsDescriptor::load(assets_json).await?;
        let work_tree = Self::work_tree_for(assets_json);
        let lock = self.dir_lock(&work_tree);
        let _guard = lock.lock().await;
        self.ensure_restored(&work_tree)?;

        if descriptor.tag.is_empty() {
            self.run_checked(&["reset", "--hard"], &work_tree).await?;
        } else {
            self.run_checked(&["reset", "--hard", &descriptor.tag], &work_tree)
                .await?;
        }
        self.run_checked(&["clean", "-fd", &descriptor.prefix_path], &work_tree)
            .await?;
        info!(tag = %descriptor.tag, "assets reset to pinned commit");
        Ok(())
    }

    fn ensure_restored(&self, work_tree: &Path) -> Result<(), ProxyError> {
        if work_tree.join(".git").exists() {
            Ok(())
        } else {
            Err(ProxyError::InvalidRequest(format!(
                "no assets working tree at {}; run restore first",
                work_tree.display()
            )))
        }
    }
}
