use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_USER_ID_LEN: usize = 128;
const MAX_CONVERSATION_ID_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidId {
    #[error("{kind} must not be empty")]
    Empty { kind: &'static str },
    #[error("{kind} exceeds {max} bytes")]
    TooLong { kind: &'static str, max: usize },
    #[error("{kind} contains unsupported character {found:?}")]
    UnsupportedCharacter { kind: &'static str, found: char },
    #[error("{kind} must not be a relative path component")]
    PathComponent { kind: &'static str },
}

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(ConversationId);
id_newtype!(MessageId);

impl UserId {
    /// Validates an externally supplied user id.
    ///
    /// User ids name the per-user credential directory, so only a path-safe
    /// alphabet is accepted.
    pub fn parse(raw: &str) -> Result<Self, InvalidId> {
        const KIND: &str = "user id";
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(InvalidId::Empty { kind: KIND });
        }
        if raw.len() > MAX_USER_ID_LEN {
            return Err(InvalidId::TooLong {
                kind: KIND,
                max: MAX_USER_ID_LEN,
            });
        }
        if raw == "." || raw == ".." {
            return Err(InvalidId::PathComponent { kind: KIND });
        }
        if let Some(found) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@')))
        {
            return Err(InvalidId::UnsupportedCharacter { kind: KIND, found });
        }
        Ok(Self(raw.to_string()))
    }
}

impl ConversationId {
    pub fn parse(raw: &str) -> Result<Self, InvalidId> {
        const KIND: &str = "conversation id";
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(InvalidId::Empty { kind: KIND });
        }
        if raw.len() > MAX_CONVERSATION_ID_LEN {
            return Err(InvalidId::TooLong {
                kind: KIND,
                max: MAX_CONVERSATION_ID_LEN,
            });
        }
        if let Some(found) = raw.chars().find(|c| c.is_control() || c.is_whitespace()) {
            return Err(InvalidId::UnsupportedCharacter { kind: KIND, found });
        }
        Ok(Self(raw.to_string()))
    }
}

impl From<&str> for ConversationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for MessageId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    NotInitialized,
    Initializing,
    QrReady,
    Authenticated,
    Restoring,
    Connected,
    Disconnected,
    AuthFailure,
}

impl SessionStatus {
    /// A handshake is underway and a second one must not be started.
    pub fn is_handshaking(self) -> bool {
        matches!(
            self,
            Self::Initializing | Self::QrReady | Self::Authenticated | Self::Restoring
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::AuthFailure)
    }

    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotInitialized => "not_initialized",
            Self::Initializing => "initializing",
            Self::QrReady => "qr_ready",
            Self::Authenticated => "authenticated",
            Self::Restoring => "restoring",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::AuthFailure => "auth_failure",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    Voice,
    Document,
    Sticker,
    Location,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSender {
    Me,
    Them,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    /// Maps a transport acknowledgement ordinal (`1` server, `2` device,
    /// `3` read, `4` played) onto the coarse status shown to users.
    pub fn from_ack(ack: i8) -> Self {
        match ack {
            i8::MIN..=1 => Self::Sent,
            2 => Self::Delivered,
            _ => Self::Read,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_rejects_path_traversal_and_separators() {
        assert_eq!(
            UserId::parse(".."),
            Err(InvalidId::PathComponent { kind: "user id" })
        );
        assert!(matches!(
            UserId::parse("alice/../bob"),
            Err(InvalidId::UnsupportedCharacter { found: '/', .. })
        ));
        assert_eq!(
            UserId::parse("   "),
            Err(InvalidId::Empty { kind: "user id" })
        );
    }

    #[test]
    fn user_id_trims_and_accepts_email_like_ids() {
        let id = UserId::parse(" alice.smith@example.com ").expect("valid id");
        assert_eq!(id.as_str(), "alice.smith@example.com");
    }

    #[test]
    fn conversation_id_accepts_transport_suffixes() {
        let id = ConversationId::parse("15551234567@c.us").expect("valid id");
        assert_eq!(id.to_string(), "15551234567@c.us");
        assert!(ConversationId::parse("has space").is_err());
    }

    #[test]
    fn status_serializes_in_snake_case() {
        let json = serde_json::to_string(&SessionStatus::QrReady).expect("json");
        assert_eq!(json, "\"qr_ready\"");
        assert_eq!(SessionStatus::AuthFailure.to_string(), "auth_failure");
    }

    #[test]
    fn handshake_and_terminal_classification() {
        assert!(SessionStatus::Restoring.is_handshaking());
        assert!(SessionStatus::Authenticated.is_handshaking());
        assert!(!SessionStatus::Connected.is_handshaking());
        assert!(SessionStatus::Disconnected.is_terminal());
        assert!(!SessionStatus::NotInitialized.is_terminal());
    }

    #[test]
    fn ack_ordinals_map_to_delivery_status() {
        assert_eq!(DeliveryStatus::from_ack(-1), DeliveryStatus::Sent);
        assert_eq!(DeliveryStatus::from_ack(0), DeliveryStatus::Sent);
        assert_eq!(DeliveryStatus::from_ack(1), DeliveryStatus::Sent);
        assert_eq!(DeliveryStatus::from_ack(2), DeliveryStatus::Delivered);
        assert_eq!(DeliveryStatus::from_ack(3), DeliveryStatus::Read);
        assert_eq!(DeliveryStatus::from_ack(4), DeliveryStatus::Read);
    }
}
