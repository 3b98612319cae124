use std::sync::Arc;

use chat_transport::{ChatClient, RawMessage};
use futures::{stream, StreamExt};
use shared::{
    domain::{ConversationId, DeliveryStatus, MessageId, MessageSender, UserId},
    protocol::{ChatMessage, ConversationSummary, SendReceipt},
};
use tracing::{debug, info, warn};

use crate::{
    config::SessionConfig,
    error::SessionError,
    registry::SessionRegistry,
    summary::{order_conversations, summarize},
    timeouts::{poll, with_fallback, with_timeout, PollError, PollPolicy},
    verification::confirm_send,
};

/// Conversation and message operations against a user's connected client.
pub struct ConversationGateway {
    registry: Arc<SessionRegistry>,
    config: Arc<SessionConfig>,
}

impl ConversationGateway {
    pub fn new(registry: Arc<SessionRegistry>, config: Arc<SessionConfig>) -> Self {
        Self { registry, config }
    }

    fn readiness_policy(&self) -> PollPolicy {
        PollPolicy {
            attempts: self.config.readiness_attempts.max(1),
            interval: self.config.readiness_interval(),
        }
    }

    /// Waits for the user's client to report ready. Missing and terminal
    /// sessions fail at once since no amount of waiting would help.
    pub async fn ready_client(&self, user_id: &UserId) -> Result<Arc<dyn ChatClient>, SessionError> {
        let policy = self.readiness_policy();
        let registry = &self.registry;
        let polled = poll(policy, move || async move {
            let Some(view) = registry.get(user_id).await else {
                return Err(SessionError::not_ready(
                    user_id,
                    "no session, initialize or restore first",
                ));
            };
            if view.status.is_terminal() {
                return Err(SessionError::not_ready(
                    user_id,
                    format!("session is {}", view.status),
                ));
            }
            let Some(client) = registry.client_handle(user_id).await else {
                return Ok(None);
            };
            // A hung readiness check counts as "not yet".
            let ready = with_fallback(policy.interval, client.is_ready(), false).await;
            Ok(ready.then_some(client))
        });

        let ceiling = policy.ceiling() + policy.interval;
        match with_timeout("readiness wait", ceiling, polled).await {
            Ok(Ok(client)) => Ok(client),
            Ok(Err(PollError::Aborted(err))) => Err(err),
            Ok(Err(PollError::Exhausted { attempts })) => {
                warn!(user_id = %user_id, attempts, "gateway: client never became ready");
                Err(SessionError::not_ready(
                    user_id,
                    format!("client not ready after {attempts} checks"),
                ))
            }
            Err(elapsed) => {
                warn!(user_id = %user_id, "gateway: readiness wait hit its ceiling");
                Err(SessionError::not_ready(
                    user_id,
                    format!("client not ready within {}ms", elapsed.after.as_millis()),
                ))
            }
        }
    }

    pub async fn list_conversations(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<ConversationSummary>, SessionError> {
        let client = self.ready_client(user_id).await?;
        let chats = client.chats().await.map_err(SessionError::transport)?;
        let config = self.config.as_ref();

        let mut summaries: Vec<ConversationSummary> = stream::iter(chats)
            .map(|chat| summarize(client.as_ref(), chat, config))
            .buffered(config.summary_concurrency.max(1))
            .collect()
            .await;
        order_conversations(&mut summaries, config.conversation_order);

        debug!(user_id = %user_id, count = summaries.len(), "gateway: conversations listed");
        Ok(summaries)
    }

    pub async fn count_conversations(&self, user_id: &UserId) -> Result<usize, SessionError> {
        let client = self.ready_client(user_id).await?;
        let chats = client.chats().await.map_err(SessionError::transport)?;
        Ok(chats.len())
    }

    pub async fn get_messages(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
    ) -> Result<Vec<ChatMessage>, SessionError> {
        let client = self.ready_client(user_id).await?;
        self.resolve_conversation(client.as_ref(), conversation_id)
            .await?;

        let messages = with_timeout(
            "message history fetch",
            self.config.history_timeout(),
            client.fetch_messages(conversation_id.as_str(), self.config.history_limit),
        )
        .await?
        .map_err(SessionError::transport)?;

        Ok(messages.into_iter().map(to_chat_message).collect())
    }

    pub async fn send_message(
        &self,
        user_id: &UserId,
        conversation_id: &ConversationId,
        text: &str,
    ) -> Result<SendReceipt, SessionError> {
        if text.trim().is_empty() {
            return Err(SessionError::Validation(
                "message text must not be empty".to_string(),
            ));
        }
        let client = self.ready_client(user_id).await?;
        self.resolve_conversation(client.as_ref(), conversation_id)
            .await?;

        let outcome = client.send_message(conversation_id.as_str(), text).await;
        let receipt = confirm_send(
            client.as_ref(),
            conversation_id.as_str(),
            text,
            outcome,
            &self.config.verification,
        )
        .await?;

        info!(
            user_id = %user_id,
            conversation_id = %conversation_id,
            message_id = %receipt.message_id,
            verified = receipt.verified,
            "gateway: message sent"
        );
        Ok(receipt)
    }

    async fn resolve_conversation(
        &self,
        client: &dyn ChatClient,
        conversation_id: &ConversationId,
    ) -> Result<(), SessionError> {
        match client.chat(conversation_id.as_str()).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(SessionError::ConversationNotFound(conversation_id.clone())),
            Err(err) => Err(SessionError::transport(err)),
        }
    }
}

fn to_chat_message(message: RawMessage) -> ChatMessage {
    let (sender, status) = if message.from_me {
        (MessageSender::Me, Some(DeliveryStatus::from_ack(message.ack)))
    } else {
        (MessageSender::Them, None)
    };
    let text = if message.body.is_empty() {
        message.caption.unwrap_or_default()
    } else {
        message.body
    };
    ChatMessage {
        id: MessageId(message.id),
        text,
        timestamp: message.timestamp,
        sender,
        status,
        kind: message.kind,
    }
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
