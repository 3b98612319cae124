use std::sync::Arc;

use session_core::{SessionManager, SessionOutcome};
use shared::{
    domain::{ConversationId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        ConversationCountResponse, ConversationListResponse, DisconnectResponse,
        InitializeResponse, MessageListResponse, PairingArtifactResponse,
        RestoreSessionResponse, SendMessageRequest, SendMessageResponse, StatusResponse,
    },
};

#[derive(Clone)]
pub struct ApiContext {
    pub sessions: Arc<SessionManager>,
}

fn validation(err: impl ToString) -> ApiError {
    ApiError::new(ErrorCode::Validation, err.to_string())
}

fn parse_user(raw: &str) -> Result<UserId, ApiError> {
    UserId::parse(raw).map_err(validation)
}

fn parse_conversation(raw: &str) -> Result<ConversationId, ApiError> {
    ConversationId::parse(raw).map_err(validation)
}

pub async fn initialize(ctx: &ApiContext, user_id: &str) -> Result<InitializeResponse, ApiError> {
    let user_id = parse_user(user_id)?;
    let outcome = ctx.sessions.initialize(&user_id).await?;
    let message = if outcome.connected {
        "session already connected"
    } else if outcome.pending {
        "pairing started; fetch the code from the qr endpoint"
    } else {
        "no session started"
    };
    Ok(InitializeResponse {
        success: true,
        connected: outcome.connected,
        pending: outcome.pending,
        message: message.to_string(),
    })
}

pub async fn restore(ctx: &ApiContext, user_id: &str) -> Result<RestoreSessionResponse, ApiError> {
    let user_id = parse_user(user_id)?;
    let outcome = ctx.sessions.restore(&user_id).await?;
    Ok(RestoreSessionResponse {
        success: true,
        connected: outcome.connected,
        has_session: outcome.has_session,
        pending: outcome.pending,
        message: restore_message(&outcome).to_string(),
    })
}

fn restore_message(outcome: &SessionOutcome) -> &'static str {
    if outcome.connected {
        "session restored"
    } else if !outcome.has_session {
        "no stored session; initialize to pair"
    } else {
        "restoration in progress; poll status"
    }
}

pub async fn pairing_artifact(
    ctx: &ApiContext,
    user_id: &str,
) -> Result<PairingArtifactResponse, ApiError> {
    let user_id = parse_user(user_id)?;
    let snapshot = ctx.sessions.pairing_artifact(&user_id).await;
    Ok(PairingArtifactResponse {
        success: true,
        status: snapshot.status,
        qr: snapshot.artifact,
    })
}

pub async fn status(ctx: &ApiContext, user_id: &str) -> Result<StatusResponse, ApiError> {
    let user_id = parse_user(user_id)?;
    let report = ctx.sessions.status(&user_id).await;
    Ok(StatusResponse {
        success: true,
        status: report.status,
        connected: report.connected,
        info: report.info,
        last_error: report.last_error,
    })
}

pub async fn disconnect(ctx: &ApiContext, user_id: &str) -> Result<DisconnectResponse, ApiError> {
    let user_id = parse_user(user_id)?;
    let existed = ctx.sessions.disconnect(&user_id).await;
    Ok(DisconnectResponse {
        success: true,
        message: if existed {
            "session disconnected".to_string()
        } else {
            "no active session".to_string()
        },
    })
}

pub async fn list_conversations(
    ctx: &ApiContext,
    user_id: &str,
) -> Result<ConversationListResponse, ApiError> {
    let user_id = parse_user(user_id)?;
    let conversations = ctx.sessions.list_conversations(&user_id).await?;
    Ok(ConversationListResponse {
        success: true,
        conversations,
    })
}

pub async fn count_conversations(
    ctx: &ApiContext,
    user_id: &str,
) -> Result<ConversationCountResponse, ApiError> {
    let user_id = parse_user(user_id)?;
    let count = ctx.sessions.count_conversations(&user_id).await?;
    Ok(ConversationCountResponse {
        success: true,
        count,
    })
}

pub async fn list_messages(
    ctx: &ApiContext,
    user_id: &str,
    conversation_id: &str,
) -> Result<MessageListResponse, ApiError> {
    let user_id = parse_user(user_id)?;
    let conversation_id = parse_conversation(conversation_id)?;
    let messages = ctx
        .sessions
        .get_messages(&user_id, &conversation_id)
        .await?;
    Ok(MessageListResponse {
        success: true,
        messages,
    })
}

pub async fn send_message(
    ctx: &ApiContext,
    user_id: &str,
    conversation_id: &str,
    request: SendMessageRequest,
) -> Result<SendMessageResponse, ApiError> {
    let user_id = parse_user(user_id)?;
    let conversation_id = parse_conversation(conversation_id)?;
    let receipt = ctx
        .sessions
        .send_message(&user_id, &conversation_id, &request.text)
        .await?;
    Ok(SendMessageResponse {
        success: true,
        message_id: receipt.message_id,
        verified: receipt.verified,
    })
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
