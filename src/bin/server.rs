//! scene-live-server binary
//!
//! Runs the live-update broker for a project directory: watches override
//! files, accepts editor connections over TCP and writes debounced edits
//! back to disk.
//!
//! ## Configuration (TOML via `--config`, env via `config` crate, then flags)
//!
//! | Key / flag                                  | Default          | Description                 |
//! |---------------------------------------------|------------------|-----------------------------|
//! | `SCENE_LIVE_PROJECT_DIR` / `--project-dir`  | `.`              | Project root to watch       |
//! | `SCENE_LIVE_LISTEN_ADDR` / `--listen`       | `127.0.0.1:7878` | Editor transport address    |
//! | `SCENE_LIVE_BROKER__DEBOUNCE_MS` / `--debounce-ms` | `300`     | Write-back quiet period     |
//! | `SCENE_LIVE_BROKER__OVERRIDE_SUFFIX`        | `.editor.json`   | Override file suffix        |

use anyhow::{Context, Result};
use clap::Parser;
use scene_live::{
    broker::{BrokerInput, LiveUpdateBroker},
    settings::Settings,
    store::FsStore,
    transport::EditorListener,
    watch::OverrideWatcher,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "scene-live-server", about = "Scene live-sync broker", version)]
struct Args {
    /// Settings file (TOML)
    #[arg(long, env = "SCENE_LIVE_CONFIG")]
    config: Option<PathBuf>,

    /// Project root to watch for override files
    #[arg(long)]
    project_dir: Option<PathBuf>,

    /// Editor transport listen address
    #[arg(long)]
    listen: Option<String>,

    /// Debounce window for write-back (ms)
    #[arg(long)]
    debounce_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("scene_live=debug".parse()?),
        )
        .init();

    let args = Args::parse();
    let mut settings = Settings::load(args.config.as_deref())?;
    if let Some(dir) = args.project_dir {
        settings.project_dir = dir;
    }
    if let Some(listen) = args.listen {
        settings.listen_addr = listen;
    }
    if let Some(ms) = args.debounce_ms {
        settings.broker.debounce_ms = ms;
    }

    // Watcher events carry canonical paths; the broker must agree.
    let root = settings
        .project_dir
        .canonicalize()
        .with_context(|| format!("resolve project dir {}", settings.project_dir.display()))?;

    tracing::info!(
        "Starting scene-live-server (root='{}', listen='{}', debounce={}ms)",
        root.display(),
        settings.listen_addr,
        settings.broker.debounce_ms,
    );

    let (broker, mut scene_rx) =
        LiveUpdateBroker::new(settings.broker.clone(), root.clone(), Arc::new(FsStore));
    prime_overrides(&broker, &root).await;

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<BrokerInput>();
    let watcher =
        OverrideWatcher::spawn(&root, &settings.broker.override_suffix, inbound_tx.clone())?;
    let listener = EditorListener::bind(&settings.listen_addr, inbound_tx.clone()).await?;

    // No in-process scene: the running game is a transport client and
    // receives everything through broadcasts.
    let scene_log = tokio::spawn(async move {
        while let Some(update) = scene_rx.recv().await {
            log::debug!(
                "Scene-bound update: {:?} {:?}",
                update.kind,
                update.property
            );
        }
    });

    let broker_task = tokio::spawn(broker.clone().run(inbound_rx));
    let mut listener_task = tokio::spawn(listener.run());

    tokio::select! {
        _ = &mut listener_task => {
            log::error!("Editor listener exited unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            log::info!("scene-live-server shutting down (SIGINT)");
        }
    }

    drop(watcher);
    listener_task.abort();
    broker_task.abort();
    scene_log.abort();
    // Pending debounced edits still reach disk.
    broker.flush().await;
    drop(inbound_tx);
    Ok(())
}

/// Seed the broker cache with every override file already on disk.
async fn prime_overrides(broker: &LiveUpdateBroker, root: &Path) {
    let mut stack = vec![root.to_path_buf()];
    let mut primed = 0usize;
    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Cannot scan {}: {}", dir.display(), e);
                continue;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if broker.is_override_file(&path) {
                match broker.prime(&path).await {
                    Ok(()) => primed += 1,
                    Err(e) => log::warn!("Skipping baseline: {}", e),
                }
            }
        }
    }
    log::info!("Primed {} override files", primed);
}
