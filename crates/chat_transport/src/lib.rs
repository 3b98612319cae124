use std::{path::PathBuf, sync::Arc};

use anyhow::anyhow;
use async_trait::async_trait;
use shared::{domain::MessageKind, protocol::ClientInfo};
use tokio::sync::broadcast;

pub mod memory;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    pub user_id: String,
    /// Directory the client library persists its credentials in.
    pub credential_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    PairingCode(String),
    Authenticated,
    Ready,
    AuthFailure(String),
    Disconnected(String),
}

impl TransportEvent {
    /// Events after which the client is no longer usable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AuthFailure(_) | Self::Disconnected(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChat {
    pub id: String,
    pub name: Option<String>,
    pub is_group: bool,
    pub unread_count: u32,
    /// Unix seconds of the last activity, when the transport knows it.
    pub timestamp: Option<i64>,
    /// Contact backing a one-to-one chat.
    pub contact_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub id: String,
    pub chat_id: String,
    pub body: String,
    pub caption: Option<String>,
    pub timestamp: i64,
    pub from_me: bool,
    pub ack: i8,
    pub kind: MessageKind,
    pub has_media: bool,
    pub filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawContact {
    pub id: String,
    pub name: Option<String>,
    pub push_name: Option<String>,
    pub number: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPayload {
    pub mime_type: String,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Starts the connection sequence and returns once it is underway.
    /// Progress is reported through [`ChatClient::subscribe_events`].
    async fn connect(&self) -> anyhow::Result<()>;
    async fn is_ready(&self) -> bool;
    async fn identity(&self) -> Option<ClientInfo>;
    async fn chats(&self) -> anyhow::Result<Vec<RawChat>>;
    async fn chat(&self, chat_id: &str) -> anyhow::Result<Option<RawChat>>;
    /// Most recent `limit` messages, oldest first.
    async fn fetch_messages(&self, chat_id: &str, limit: usize) -> anyhow::Result<Vec<RawMessage>>;
    async fn contact(&self, contact_id: &str) -> anyhow::Result<RawContact>;
    async fn profile_picture_url(&self, chat_id: &str) -> anyhow::Result<Option<String>>;
    async fn download_media(&self, message_id: &str) -> anyhow::Result<Option<MediaPayload>>;
    async fn send_message(&self, chat_id: &str, text: &str) -> anyhow::Result<RawMessage>;
    async fn destroy(&self) -> anyhow::Result<()>;
    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent>;
}

#[async_trait]
pub trait ChatClientFactory: Send + Sync {
    async fn create(&self, options: ClientOptions) -> anyhow::Result<Arc<dyn ChatClient>>;
}

pub struct MissingChatClientFactory;

#[async_trait]
impl ChatClientFactory for MissingChatClientFactory {
    async fn create(&self, options: ClientOptions) -> anyhow::Result<Arc<dyn ChatClient>> {
        Err(anyhow!(
            "chat transport backend is unavailable for user {}",
            options.user_id
        ))
    }
}
