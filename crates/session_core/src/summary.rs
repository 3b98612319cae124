//! Per-conversation summarization for the conversation list.
//!
//! Each sub-fetch is bounded on its own and degrades to an empty field, so a
//! slow avatar service or a broken contact record only thins out one entry.

use std::{cmp::Reverse, time::Duration};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chat_transport::{ChatClient, RawChat, RawContact, RawMessage};
use shared::{
    domain::{ConversationId, MessageKind},
    protocol::{ConversationSummary, MessagePreview},
};
use tracing::debug;

use crate::{
    config::{ConversationOrder, SessionConfig},
    timeouts::{with_fallback, with_optional_timeout},
};

pub async fn summarize(
    client: &dyn ChatClient,
    chat: RawChat,
    config: &SessionConfig,
) -> ConversationSummary {
    let (contact, avatar_url, last_message) = tokio::join!(
        resolve_contact(client, &chat, config.contact_timeout()),
        with_fallback(config.avatar_timeout(), avatar(client, &chat.id), None),
        with_fallback(
            config.last_message_timeout(),
            last_message_preview(client, &chat.id, config.thumbnail_max_bytes),
            None,
        ),
    );

    ConversationSummary {
        name: display_name(&chat, contact.as_ref()),
        phone: contact.and_then(|contact| contact.number),
        avatar_url,
        is_group: chat.is_group,
        unread_count: chat.unread_count,
        timestamp: chat.timestamp,
        last_message,
        id: ConversationId(chat.id),
    }
}

async fn resolve_contact(
    client: &dyn ChatClient,
    chat: &RawChat,
    limit: Option<Duration>,
) -> Option<RawContact> {
    if chat.is_group {
        return None;
    }
    let contact_id = chat.contact_id.as_deref()?;
    match with_optional_timeout("contact lookup", limit, client.contact(contact_id)).await {
        Ok(Ok(contact)) => Some(contact),
        Ok(Err(err)) => {
            debug!(chat_id = %chat.id, "conversations: contact lookup failed: {err:#}");
            None
        }
        Err(elapsed) => {
            debug!(chat_id = %chat.id, "conversations: {elapsed}");
            None
        }
    }
}

async fn avatar(client: &dyn ChatClient, chat_id: &str) -> Option<String> {
    match client.profile_picture_url(chat_id).await {
        Ok(url) => url,
        Err(err) => {
            debug!(chat_id, "conversations: avatar lookup failed: {err:#}");
            None
        }
    }
}

async fn last_message_preview(
    client: &dyn ChatClient,
    chat_id: &str,
    thumbnail_max_bytes: usize,
) -> Option<MessagePreview> {
    let message = match client.fetch_messages(chat_id, 1).await {
        Ok(mut messages) => messages.pop()?,
        Err(err) => {
            debug!(chat_id, "conversations: last message fetch failed: {err:#}");
            return None;
        }
    };

    let thumbnail = if message.kind == MessageKind::Image && message.has_media {
        image_thumbnail(client, &message.id, thumbnail_max_bytes).await
    } else {
        None
    };

    Some(MessagePreview {
        text: preview_text(&message),
        timestamp: message.timestamp,
        from_me: message.from_me,
        kind: message.kind,
        thumbnail,
    })
}

async fn image_thumbnail(
    client: &dyn ChatClient,
    message_id: &str,
    max_bytes: usize,
) -> Option<String> {
    let media = match client.download_media(message_id).await {
        Ok(media) => media?,
        Err(err) => {
            debug!(message_id, "conversations: media download failed: {err:#}");
            return None;
        }
    };
    if media.data.len() >= max_bytes {
        return None;
    }
    Some(format!(
        "data:{};base64,{}",
        media.mime_type,
        STANDARD.encode(&media.data)
    ))
}

pub fn preview_text(message: &RawMessage) -> String {
    let caption = message
        .caption
        .as_deref()
        .filter(|caption| !caption.trim().is_empty());
    let text = match message.kind {
        MessageKind::Image => caption.unwrap_or("Image"),
        MessageKind::Video => "Video",
        MessageKind::Audio => "Audio",
        MessageKind::Voice => "Voice message",
        MessageKind::Document => message.filename.as_deref().unwrap_or("Document"),
        MessageKind::Sticker => "Sticker",
        MessageKind::Location => "Location",
        MessageKind::Text | MessageKind::Other => message.body.as_str(),
    };
    text.to_string()
}

/// Contact name, then push name, then the chat's own name, then the number.
pub fn display_name(chat: &RawChat, contact: Option<&RawContact>) -> String {
    let non_empty =
        |value: Option<&String>| value.filter(|value| !value.trim().is_empty()).cloned();
    contact
        .and_then(|contact| {
            non_empty(contact.name.as_ref()).or_else(|| non_empty(contact.push_name.as_ref()))
        })
        .or_else(|| non_empty(chat.name.as_ref()))
        .or_else(|| contact.and_then(|contact| non_empty(contact.number.as_ref())))
        .unwrap_or_else(|| chat.id.clone())
}

pub fn order_conversations(summaries: &mut [ConversationSummary], order: ConversationOrder) {
    match order {
        ConversationOrder::Native => summaries.sort_by_key(|summary| summary.timestamp.is_none()),
        ConversationOrder::Recency => summaries.sort_by_key(|summary| Reverse(summary.timestamp)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chat_transport::memory::{direct_chat, group_chat, text_message};

    fn summary(id: &str, timestamp: Option<i64>) -> ConversationSummary {
        ConversationSummary {
            id: ConversationId::from(id),
            name: id.to_string(),
            phone: None,
            avatar_url: None,
            is_group: false,
            unread_count: 0,
            timestamp,
            last_message: None,
        }
    }

    fn ids(summaries: &[ConversationSummary]) -> Vec<&str> {
        summaries.iter().map(|summary| summary.id.as_str()).collect()
    }

    #[test]
    fn native_order_only_moves_undated_entries_last() {
        let mut list = vec![
            summary("a", Some(10)),
            summary("b", None),
            summary("c", Some(30)),
            summary("d", None),
            summary("e", Some(20)),
        ];
        order_conversations(&mut list, ConversationOrder::Native);
        assert_eq!(ids(&list), ["a", "c", "e", "b", "d"]);
    }

    #[test]
    fn recency_order_sorts_by_last_activity() {
        let mut list = vec![summary("a", Some(10)), summary("b", None), summary("c", Some(30))];
        order_conversations(&mut list, ConversationOrder::Recency);
        assert_eq!(ids(&list), ["c", "a", "b"]);
    }

    #[test]
    fn placeholders_follow_message_kind() {
        let mut message = text_message("c1", "m1", "raw body", false, 1);
        assert_eq!(preview_text(&message), "raw body");

        message.kind = MessageKind::Image;
        assert_eq!(preview_text(&message), "Image");
        message.caption = Some("sunset".into());
        assert_eq!(preview_text(&message), "sunset");

        message.kind = MessageKind::Voice;
        assert_eq!(preview_text(&message), "Voice message");
        message.kind = MessageKind::Document;
        assert_eq!(preview_text(&message), "Document");
        message.filename = Some("report.pdf".into());
        assert_eq!(preview_text(&message), "report.pdf");
        message.kind = MessageKind::Sticker;
        assert_eq!(preview_text(&message), "Sticker");
    }

    #[test]
    fn display_name_falls_back_in_order() {
        let chat = direct_chat("15550001@c.us", "Chat Name", None);
        let mut contact = RawContact {
            id: chat.id.clone(),
            name: Some("Saved Name".into()),
            push_name: Some("Push".into()),
            number: Some("15550001".into()),
        };
        assert_eq!(display_name(&chat, Some(&contact)), "Saved Name");
        contact.name = None;
        assert_eq!(display_name(&chat, Some(&contact)), "Push");
        contact.push_name = Some("  ".into());
        assert_eq!(display_name(&chat, Some(&contact)), "Chat Name");

        let mut unnamed = group_chat("g1@g.us", "", None);
        unnamed.name = None;
        assert_eq!(display_name(&unnamed, None), "g1@g.us");
    }
}
