//! File watcher adapter: forwards override-file changes to the broker.

use crate::broker::BrokerInput;
use anyhow::{Context, Result};
use log::{debug, warn};
use notify::event::ModifyKind;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// Keeps the underlying watcher alive; dropping it stops delivery.
pub struct OverrideWatcher {
    _watcher: RecommendedWatcher,
    root: PathBuf,
}

impl OverrideWatcher {
    /// Watch `root` recursively. Create and modify events for files ending
    /// in `suffix` are sent as [`BrokerInput::FileChanged`].
    pub fn spawn(
        root: impl AsRef<Path>,
        suffix: &str,
        inbound: UnboundedSender<BrokerInput>,
    ) -> Result<Self> {
        let root = root.as_ref();
        if !root.exists() {
            anyhow::bail!("path '{}' does not exist", root.display());
        }
        let suffix = suffix.to_string();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => {
                    if !is_relevant(&event.kind) {
                        return;
                    }
                    for path in event.paths {
                        if !path.to_string_lossy().ends_with(&suffix) {
                            continue;
                        }
                        debug!("Override file changed: {}", path.display());
                        if inbound.send(BrokerInput::FileChanged(path)).is_err() {
                            return;
                        }
                    }
                }
                Err(err) => warn!("Override watcher error: {}", err),
            }
        })?;
        watcher
            .configure(
                NotifyConfig::default()
                    .with_compare_contents(false)
                    .with_poll_interval(Duration::from_millis(300)),
            )
            .context("configure override watcher")?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("watch {}", root.display()))?;
        Ok(Self {
            _watcher: watcher,
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Create(_)
    )
}
