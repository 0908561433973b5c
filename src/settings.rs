//! Layered server settings.
//!
//! Defaults, then an optional TOML file, then environment variables with
//! the `SCENE_LIVE` prefix (`SCENE_LIVE_BROKER__DEBOUNCE_MS=150`). Command
//! line flags are applied on top by the binary.

use crate::types::{BrokerConfig, ScriptConfig};
use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub project_dir: PathBuf,
    pub listen_addr: String,
    pub broker: BrokerConfig,
    pub script: ScriptConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            listen_addr: "127.0.0.1:7878".into(),
            broker: BrokerConfig::default(),
            script: ScriptConfig::default(),
        }
    }
}

impl Settings {
    pub fn load(file: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(file, "SCENE_LIVE")
    }

    pub fn load_with_prefix(file: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            Environment::with_prefix(env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );
        builder
            .build()
            .context("load settings")?
            .try_deserialize()
            .context("parse settings")
    }
}
