//! Per-user chat-network session management.
//!
//! [`SessionManager`] owns the session registry and wires the coordinators
//! and the conversation gateway around it. Transports plug in through
//! [`chat_transport::ChatClientFactory`].

use std::{sync::Arc, time::Duration};

use chat_transport::ChatClientFactory;
use shared::{
    domain::{ConversationId, SessionStatus, UserId},
    protocol::{ChatMessage, ClientInfo, ConversationSummary, SendReceipt},
};

pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod error;
pub mod gateway;
pub mod registry;
pub mod single_flight;
pub mod state;
pub mod summary;
pub mod timeouts;
pub mod verification;

pub use config::{ConversationOrder, SessionConfig, VerificationConfig};
pub use coordinator::{SessionCoordinator, SessionOutcome};
pub use error::SessionError;
pub use gateway::ConversationGateway;
pub use registry::{SessionRegistry, SessionView};

use crate::timeouts::with_fallback;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingSnapshot {
    pub status: SessionStatus,
    /// Present only while the session awaits a scan.
    pub artifact: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub status: SessionStatus,
    pub connected: bool,
    pub info: Option<ClientInfo>,
    pub last_error: Option<String>,
}

pub struct SessionManager {
    registry: Arc<SessionRegistry>,
    coordinator: Arc<SessionCoordinator>,
    gateway: ConversationGateway,
    config: Arc<SessionConfig>,
}

impl SessionManager {
    pub fn new(config: SessionConfig, factory: Arc<dyn ChatClientFactory>) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(SessionRegistry::new());
        Self {
            coordinator: SessionCoordinator::new(
                Arc::clone(&registry),
                factory,
                Arc::clone(&config),
            ),
            gateway: ConversationGateway::new(Arc::clone(&registry), Arc::clone(&config)),
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub async fn initialize(&self, user_id: &UserId) -> Result<SessionOutcome, SessionError> {
        self.coordinator.initialize(user_id).await
    }

    pub async fn restore(&self, user_id: &UserId) -> Result<SessionOutcome, SessionError> {
        self.coordinator.restore(user_id).await
    }

    pub async fn pairing_artifact(&self, user_id: &UserId) -> PairingSnapshot {
        match self.registry.get(user_id).await {
            Some(view) => PairingSnapshot {
                status: view.status,
                artifact: view.pairing_artifact,
            },
            None => PairingSnapshot {
                status: SessionStatus::NotInitialized,
                artifact: None,
            },
        }
    }

    pub async fn status(&self, user_id: &UserId) -> StatusReport {
        let view = self.registry.get(user_id).await;
        let status = view
            .as_ref()
            .map_or(SessionStatus::NotInitialized, |view| view.status);

        let mut info = None;
        if status.is_connected() {
            if let Some(client) = self.registry.client_handle(user_id).await {
                info = with_fallback(self.config.identity_timeout(), client.identity(), None).await;
            }
        }

        StatusReport {
            status,
            connected: status.is_connected(),
            info,
            last_error: view.and_then(|view| view.last_error),
        }
    }

    /// Waits up to `within` for `predicate` to hold for the user's status.
    pub async fn wait_for_status<P>(
        &self,
        user_id: &UserId,
        within: Duration,
        predicate: P,
    ) -> SessionStatus
    where
        P: Fn(SessionStatus) -> bool,
    {
        self.registry.wait_for(user_id, within, predicate).await
    }

    pub async fn disconnect(&self, user_id: &UserId) -> bool {
        self.coordinator.disconnect(user_id).await
    }

    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
    }

    pub async fn list_conversations(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<ConversationSummary>, SessionError> {
        self.gateway.list_conversations(user_id).await
    }

    pub async fn count_conversations(&self, user_id: &UserId) -> Result<usize, SessionError> {
        self.gateway.count_conversations(user_id).await
    }

    pub async fn get_messages(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
    ) -> Result<Vec<ChatMessage>, SessionError> {
        self.gateway.get_messages(user_id, conversation_id).await
    }

    pub async fn send_message(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
        text: &str,
    ) -> Result<SendReceipt, SessionError> {
        self.gateway
            .send_message(user_id, conversation_id, text)
            .await
    }
}

#[cfg(test)]
#[path = "tests/manager_tests.rs"]
mod tests;
