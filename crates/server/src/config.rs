use std::{path::Path, sync::Arc, time::Duration};

use anyhow::Context;
use chat_transport::{
    memory::{MemoryBehavior, MemoryTransport},
    ChatClientFactory, MissingChatClientFactory,
};
use serde::Deserialize;
use session_core::SessionConfig;

const SETTINGS_FILE: &str = "server.toml";
const ENV_PREFIX: &str = "APP";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// In-process network, for development.
    #[default]
    Memory,
    /// No backend; every session start fails with a transport error.
    Disabled,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server_bind: String,
    /// Used when `RUST_LOG` is unset.
    pub log_filter: String,
    pub max_body_bytes: usize,
    pub transport: TransportKind,
    /// Memory transport only: pair automatically this long after the code is
    /// issued.
    pub memory_auto_pair_ms: Option<u64>,
    pub session: SessionConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8080".into(),
            log_filter: "info".into(),
            max_body_bytes: 64 * 1024,
            transport: TransportKind::Memory,
            memory_auto_pair_ms: None,
            session: SessionConfig::default(),
        }
    }
}

/// Defaults, then `server.toml` if present, then `APP__*` variables
/// (`APP__SESSION__READINESS_ATTEMPTS=10`).
pub fn load_settings() -> anyhow::Result<Settings> {
    load_settings_from(Path::new(SETTINGS_FILE), ENV_PREFIX)
}

pub fn load_settings_from(file: &Path, env_prefix: &str) -> anyhow::Result<Settings> {
    config::Config::builder()
        .add_source(config::File::from(file).required(false))
        .add_source(
            config::Environment::with_prefix(env_prefix)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .and_then(|raw| raw.try_deserialize::<Settings>())
        .with_context(|| format!("failed to load settings from '{}'", file.display()))
}

pub fn chat_client_factory(settings: &Settings) -> Arc<dyn ChatClientFactory> {
    match settings.transport {
        TransportKind::Memory => Arc::new(MemoryTransport::new(MemoryBehavior {
            auto_pair_after: settings.memory_auto_pair_ms.map(Duration::from_millis),
            ..MemoryBehavior::default()
        })),
        TransportKind::Disabled => Arc::new(MissingChatClientFactory),
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
