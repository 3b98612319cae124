use chat_transport::{ChatClient, RawMessage};
use chrono::Utc;
use shared::{domain::MessageId, protocol::SendReceipt};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::VerificationConfig,
    error::SessionError,
    timeouts::{settle, with_timeout},
};

const BENIGN_SEND_ERROR_PATTERNS: &[&str] = &[
    "markedunread",
    "cannot read properties of undefined",
    "cannot read properties of null",
    "cannot read property",
    "null is not an object",
    "undefined is not an object",
];

/// Errors some chat clients raise after the message was already handed to
/// the network.
pub fn is_benign_send_error(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    BENIGN_SEND_ERROR_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
}

/// Turns the raw outcome of a send into a receipt. Benign errors are checked
/// against recent history before giving up on the message.
pub async fn confirm_send(
    client: &dyn ChatClient,
    chat_id: &str,
    text: &str,
    outcome: anyhow::Result<RawMessage>,
    config: &VerificationConfig,
) -> Result<SendReceipt, SessionError> {
    let err = match outcome {
        Ok(message) => {
            return Ok(SendReceipt {
                message_id: MessageId(message.id),
                verified: true,
            })
        }
        Err(err) => err,
    };
    let reason = format!("{err:#}");
    if !is_benign_send_error(&reason) {
        return Err(SessionError::Transport(reason));
    }

    warn!(chat_id, "send: benign transport error, checking history: {reason}");
    settle(config.settle()).await;

    let recent = match with_timeout(
        "send verification fetch",
        config.fetch_timeout(),
        client.fetch_messages(chat_id, config.lookback_messages),
    )
    .await
    {
        Ok(Ok(messages)) => messages,
        Ok(Err(err)) => {
            warn!(chat_id, "send: history fetch failed during verification: {err:#}");
            Vec::new()
        }
        Err(elapsed) => {
            warn!(chat_id, "send: {elapsed}");
            Vec::new()
        }
    };

    if let Some(found) = find_sent_message(&recent, text, Utc::now().timestamp(), config) {
        info!(chat_id, message_id = %found.id, "send: message confirmed from history");
        return Ok(SendReceipt {
            message_id: MessageId(found.id.clone()),
            verified: true,
        });
    }

    if !config.assume_sent_when_unverified {
        return Err(SessionError::SendUnverified(reason));
    }
    let message_id = MessageId(format!("local-{}", Uuid::new_v4()));
    warn!(
        chat_id,
        message_id = %message_id,
        "send: message not found in history, reporting placeholder id"
    );
    Ok(SendReceipt {
        message_id,
        verified: false,
    })
}

/// Newest own message that looks like `text` within the text window, else
/// the newest own message within the recency window.
pub fn find_sent_message<'m>(
    messages: &'m [RawMessage],
    text: &str,
    now: i64,
    config: &VerificationConfig,
) -> Option<&'m RawMessage> {
    let own_within = |message: &RawMessage, window: i64| {
        message.from_me && now - message.timestamp < window
    };
    messages
        .iter()
        .rev()
        .find(|message| {
            own_within(message, config.text_match_window_secs) && text_matches(&message.body, text)
        })
        .or_else(|| {
            messages
                .iter()
                .rev()
                .find(|message| own_within(message, config.recency_window_secs))
        })
}

fn text_matches(body: &str, sent: &str) -> bool {
    let (body, sent) = (body.trim(), sent.trim());
    if body.is_empty() || sent.is_empty() {
        return false;
    }
    body == sent || body.contains(sent) || sent.contains(body)
}

#[cfg(test)]
#[path = "tests/verification_tests.rs"]
mod tests;
