// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

use replay_http::assets::AssetsDescriptor;
use replay_http::config::Config;
use replay_http::git_store::{GitStore, SystemGitRunner};
use replay_http::proxy;
use replay_http::session::SessionStore;
use replay_http::shutdown::IdleTimer;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "replay-http",
    about = "Record/playback HTTP test proxy with git-backed recording storage",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the proxy server
    Start {
        /// Listen address, e.g. 127.0.0.1:5000
        #[arg(long)]
        listen: Option<String>,

        /// Directory recording files are resolved against
        #[arg(long)]
        storage_root: Option<String>,

        /// Optional config TOML path
        #[arg(long)]
        config: Option<String>,

        /// Terminate after a quiet period with no requests
        #[arg(long)]
        auto_shutdown: bool,

        /// Quiet period in seconds before auto-shutdown fires
        #[arg(long)]
        auto_shutdown_seconds: Option<u64>,
    },

    /// Push local recording changes to the assets repository
    Push {
        /// Path to the assets.json descriptor
        #[arg(long, default_value = "assets.json")]
        assets: PathBuf,
    },

    /// Check out the pinned commit of the assets repository
    Restore {
        #[arg(long, default_value = "assets.json")]
        assets: PathBuf,
    },

    /// Discard local recording changes and return to the pinned commit
    Reset {
        #[arg(long, default_value = "assets.json")]
        assets: PathBuf,

        /// Confirm discarding local changes
        #[arg(long)]
        yes: bool,
    },

    /// Create or inspect an assets.json descriptor
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Write a fresh assets.json
    Create {
        #[arg(long, default_value = "assets.json")]
        assets: PathBuf,

        /// Assets repository slug (org/repo) or clone URL
        #[arg(long)]
        repo: String,

        /// Subpath inside the assets repository for this folder's recordings
        #[arg(long)]
        prefix: String,
    },

    /// Print an existing assets.json
    Show {
        #[arg(long, default_value = "assets.json")]
        assets: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    match args.command {
        Command::Start {
            listen,
            storage_root,
            config,
            auto_shutdown,
            auto_shutdown_seconds,
        } => {
            let mut cfg = if let Some(ref p) = config {
                Config::load_from_path(p).await.unwrap_or_else(|e| {
                    warn!(%p, %e, "failed to load config, using defaults");
                    Config::default()
                })
            } else {
                Config::default()
            };
            cfg.apply_env_overrides();
            if let Some(listen) = listen {
                cfg.general.listen = listen;
            }
            if let Some(root) = storage_root {
                cfg.general.storage_root = root;
            }
            if auto_shutdown {
                cfg.general.auto_shutdown = true;
            }
            if let Some(seconds) = auto_shutdown_seconds {
                cfg.general.auto_shutdown_seconds = seconds;
            }
            cfg.validate()?;

            serve(cfg).await
        }

        Command::Push { assets } => {
            let store = GitStore::new(Arc::new(SystemGitRunner::new()));
            match store.push(&assets).await? {
                Some(sha) => println!("pushed; assets.json pinned to {sha}"),
                None => println!("no recording changes to push"),
            }
            Ok(())
        }

        Command::Restore { assets } => {
            let store = GitStore::new(Arc::new(SystemGitRunner::new()));
            store.restore(&assets).await?;
            Ok(())
        }

        Command::Reset { assets, yes } => {
            if !yes {
                anyhow::bail!(
                    "reset discards local recording changes under {}; re-run with --yes to confirm",
                    GitStore::work_tree_for(&assets).display()
                );
            }
            let store = GitStore::new(Arc::new(SystemGitRunner::new()));
            store.reset(&assets).await?;
            Ok(())
        }

        Command::Config { action } => match action {
            ConfigAction::Create {
                assets,
                repo,
                prefix,
            } => {
                let descriptor = AssetsDescriptor::new(&repo, &prefix);
                descriptor.save(&assets).await?;
                println!("wrote {}", assets.display());
                Ok(())
            }
            ConfigAction::Show { assets } => {
                let descriptor = AssetsDescriptor::load(&assets).await?;
                println!("{}", serde_json::to_string_pretty(&descriptor)?);
                Ok(())
            }
        },
    }
}

async fn serve(cfg: Config) -> anyhow::Result<()> {
    let addr: SocketAddr = cfg.general.listen.parse()?;
    let store = SessionStore::new(&cfg.general.storage_root, cfg.general.strict_playback);

    let timer = if cfg.general.auto_shutdown {
        info!(
            seconds = cfg.general.auto_shutdown_seconds,
            "auto-shutdown enabled"
        );
        Arc::new(IdleTimer::new(Duration::from_secs(
            cfg.general.auto_shutdown_seconds,
        )))
    } else {
        Arc::new(IdleTimer::disabled())
    };

    let server = proxy::run_proxy(addr, store, timer.clone());

    tokio::select! {
        res = server => {
            if let Err(e) = res {
                error!(%e, "server error");
            }
        }
        _ = signal::ctrl_c() => {
            info!("shutting down");
        }
        _ = timer.expired() => {
            // The one intentionally fatal action: log, then let the
            // process exit.
            warn!("no requests within the idle window, shutting down");
        }
    }

    Ok(())
}
