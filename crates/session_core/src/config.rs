use std::{path::PathBuf, time::Duration};

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConversationOrder {
    /// Keep the transport's order, moving entries without a timestamp last.
    #[default]
    Native,
    /// Sort by last activity, most recent first.
    Recency,
}

/// Tunables for the session core. Durations are expressed in milliseconds so
/// the struct can be loaded from flat configuration sources.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub credentials_root: PathBuf,
    pub purge_credentials_on_auth_failure: bool,
    pub restore_wait_ms: u64,
    pub handshake_recheck_ms: u64,
    pub readiness_attempts: u32,
    pub readiness_interval_ms: u64,
    /// Contact resolution is unbounded unless set.
    pub contact_timeout_ms: Option<u64>,
    pub avatar_timeout_ms: u64,
    pub last_message_timeout_ms: u64,
    pub identity_timeout_ms: u64,
    pub history_timeout_ms: u64,
    pub destroy_timeout_ms: u64,
    pub history_limit: usize,
    pub thumbnail_max_bytes: usize,
    pub summary_concurrency: usize,
    pub conversation_order: ConversationOrder,
    pub verification: VerificationConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            credentials_root: PathBuf::from("./data/credentials"),
            purge_credentials_on_auth_failure: true,
            restore_wait_ms: 2_000,
            handshake_recheck_ms: 2_000,
            readiness_attempts: 20,
            readiness_interval_ms: 500,
            contact_timeout_ms: None,
            avatar_timeout_ms: 3_000,
            last_message_timeout_ms: 5_000,
            identity_timeout_ms: 3_000,
            history_timeout_ms: 15_000,
            destroy_timeout_ms: 5_000,
            history_limit: 100,
            thumbnail_max_bytes: 100 * 1024,
            summary_concurrency: 16,
            conversation_order: ConversationOrder::Native,
            verification: VerificationConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn restore_wait(&self) -> Duration {
        Duration::from_millis(self.restore_wait_ms)
    }

    pub fn handshake_recheck(&self) -> Duration {
        Duration::from_millis(self.handshake_recheck_ms)
    }

    pub fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms)
    }

    pub fn contact_timeout(&self) -> Option<Duration> {
        self.contact_timeout_ms.map(Duration::from_millis)
    }

    pub fn avatar_timeout(&self) -> Duration {
        Duration::from_millis(self.avatar_timeout_ms)
    }

    pub fn last_message_timeout(&self) -> Duration {
        Duration::from_millis(self.last_message_timeout_ms)
    }

    pub fn identity_timeout(&self) -> Duration {
        Duration::from_millis(self.identity_timeout_ms)
    }

    pub fn history_timeout(&self) -> Duration {
        Duration::from_millis(self.history_timeout_ms)
    }

    pub fn destroy_timeout(&self) -> Duration {
        Duration::from_millis(self.destroy_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub settle_ms: u64,
    pub lookback_messages: usize,
    pub text_match_window_secs: i64,
    pub recency_window_secs: i64,
    pub fetch_timeout_ms: u64,
    /// Report success with a local placeholder id when history shows no
    /// matching message. When disabled the send fails instead.
    pub assume_sent_when_unverified: bool,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            settle_ms: 2_000,
            lookback_messages: 10,
            text_match_window_secs: 15,
            recency_window_secs: 5,
            fetch_timeout_ms: 5_000,
            assume_sent_when_unverified: true,
        }
    }
}

impl VerificationConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}
