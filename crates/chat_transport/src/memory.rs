//! In-process chat network used for local development and tests.
//!
//! A [`MemoryTransport`] hands out [`MemoryChatClient`]s that follow the same
//! lifecycle as a real network client: a pairing code on first connect, an
//! optional automatic pairing after a delay, and silent restoration when the
//! credential directory already exists. Conversations, contacts, media, send
//! failures and latencies are scripted through the client handle.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use shared::{domain::MessageKind, protocol::ClientInfo};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::{
    ChatClient, ChatClientFactory, ClientOptions, MediaPayload, RawChat, RawContact, RawMessage,
    TransportEvent,
};

#[derive(Debug, Clone)]
pub struct MemoryBehavior {
    /// Simulates the user scanning the pairing code after this delay.
    pub auto_pair_after: Option<Duration>,
    pub restore_delay: Duration,
    pub connect_failure: Option<String>,
}

impl Default for MemoryBehavior {
    fn default() -> Self {
        Self {
            auto_pair_after: None,
            restore_delay: Duration::from_millis(50),
            connect_failure: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryLatency {
    pub chats: Option<Duration>,
    pub contact: Option<Duration>,
    pub avatar: Option<Duration>,
    pub messages: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct SendFailure {
    pub message: String,
    /// Whether the message still lands in history despite the error.
    pub delivered: bool,
}

pub struct MemoryTransport {
    behavior: MemoryBehavior,
    clients: Mutex<HashMap<String, Arc<MemoryChatClient>>>,
    created: AtomicUsize,
}

impl MemoryTransport {
    pub fn new(behavior: MemoryBehavior) -> Self {
        Self {
            behavior,
            clients: Mutex::new(HashMap::new()),
            created: AtomicUsize::new(0),
        }
    }

    /// Most recently created client for `user_id`.
    pub async fn client(&self, user_id: &str) -> Option<Arc<MemoryChatClient>> {
        self.clients.lock().await.get(user_id).cloned()
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new(MemoryBehavior::default())
    }
}

#[async_trait]
impl ChatClientFactory for MemoryTransport {
    async fn create(&self, options: ClientOptions) -> Result<Arc<dyn ChatClient>> {
        tokio::task::yield_now().await;
        let user_id = options.user_id.clone();
        let client = Arc::new(MemoryChatClient::new(options, self.behavior.clone()));
        self.created.fetch_add(1, Ordering::SeqCst);
        self.clients
            .lock()
            .await
            .insert(user_id, Arc::clone(&client));
        Ok(client)
    }
}

#[derive(Default)]
struct MemoryState {
    ready: bool,
    destroyed: bool,
    connect_calls: u32,
    pairing_codes_issued: u32,
    chats: Vec<RawChat>,
    messages: HashMap<String, Vec<RawMessage>>,
    contacts: HashMap<String, RawContact>,
    avatars: HashMap<String, String>,
    media: HashMap<String, MediaPayload>,
    queued_message_ids: VecDeque<String>,
    next_message_seq: u64,
    send_failure: Option<SendFailure>,
    fail_contact_lookups: bool,
    latency: MemoryLatency,
}

pub struct MemoryChatClient {
    options: ClientOptions,
    behavior: MemoryBehavior,
    events: broadcast::Sender<TransportEvent>,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryChatClient {
    pub fn new(options: ClientOptions, behavior: MemoryBehavior) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            options,
            behavior,
            events,
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Delivers a lifecycle event as if the network had produced it.
    pub async fn emit(&self, event: TransportEvent) {
        emit(&self.state, &self.events, event).await;
    }

    pub async fn add_chat(&self, chat: RawChat) {
        let mut state = self.state.lock().await;
        state.messages.entry(chat.id.clone()).or_default();
        state.chats.push(chat);
    }

    pub async fn add_message(&self, message: RawMessage) {
        let mut state = self.state.lock().await;
        if let Some(chat) = state.chats.iter_mut().find(|chat| chat.id == message.chat_id) {
            chat.timestamp = Some(message.timestamp);
        }
        state
            .messages
            .entry(message.chat_id.clone())
            .or_default()
            .push(message);
    }

    pub async fn set_contact(&self, contact: RawContact) {
        self.state
            .lock()
            .await
            .contacts
            .insert(contact.id.clone(), contact);
    }

    pub async fn set_avatar(&self, chat_id: &str, url: &str) {
        self.state
            .lock()
            .await
            .avatars
            .insert(chat_id.to_string(), url.to_string());
    }

    pub async fn set_media(&self, message_id: &str, payload: MediaPayload) {
        self.state
            .lock()
            .await
            .media
            .insert(message_id.to_string(), payload);
    }

    /// Id to assign to the next sent message instead of a generated one.
    pub async fn queue_message_id(&self, id: &str) {
        self.state
            .lock()
            .await
            .queued_message_ids
            .push_back(id.to_string());
    }

    pub async fn fail_sends(&self, failure: Option<SendFailure>) {
        self.state.lock().await.send_failure = failure;
    }

    pub async fn fail_contact_lookups(&self, fail: bool) {
        self.state.lock().await.fail_contact_lookups = fail;
    }

    pub async fn set_latency(&self, latency: MemoryLatency) {
        self.state.lock().await.latency = latency;
    }

    pub async fn connect_calls(&self) -> u32 {
        self.state.lock().await.connect_calls
    }

    pub async fn is_destroyed(&self) -> bool {
        self.state.lock().await.destroyed
    }

    async fn latency(&self) -> MemoryLatency {
        self.state.lock().await.latency.clone()
    }

    async fn issue_pairing_code(&self) {
        let code = {
            let mut state = self.state.lock().await;
            state.pairing_codes_issued += 1;
            format!(
                "memory-pair:{}:{}",
                self.options.user_id, state.pairing_codes_issued
            )
        };
        self.emit(TransportEvent::PairingCode(code)).await;
    }
}

async fn emit(
    state: &Mutex<MemoryState>,
    events: &broadcast::Sender<TransportEvent>,
    event: TransportEvent,
) {
    {
        let mut state = state.lock().await;
        match &event {
            TransportEvent::Ready => state.ready = true,
            TransportEvent::AuthFailure(_) | TransportEvent::Disconnected(_) => state.ready = false,
            TransportEvent::PairingCode(_) | TransportEvent::Authenticated => {}
        }
    }
    if events.send(event).is_err() {
        debug!("memory transport: event dropped, no subscribers");
    }
}

async fn pause(delay: Option<Duration>) {
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
}

#[async_trait]
impl ChatClient for MemoryChatClient {
    async fn connect(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if state.destroyed {
                bail!("client for user {} has been destroyed", self.options.user_id);
            }
            if let Some(message) = &self.behavior.connect_failure {
                return Err(anyhow!(message.clone()));
            }
            state.connect_calls += 1;
        }

        let dir = &self.options.credential_dir;
        let has_credentials = match tokio::fs::try_exists(dir).await {
            Ok(exists) => exists,
            Err(err) => {
                warn!(path = %dir.display(), %err, "memory transport: credential check failed");
                false
            }
        };
        if has_credentials {
            let state = Arc::clone(&self.state);
            let events = self.events.clone();
            let delay = self.behavior.restore_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if state.lock().await.destroyed {
                    return;
                }
                emit(&state, &events, TransportEvent::Authenticated).await;
                emit(&state, &events, TransportEvent::Ready).await;
            });
            return Ok(());
        }

        self.issue_pairing_code().await;

        if let Some(delay) = self.behavior.auto_pair_after {
            let state = Arc::clone(&self.state);
            let events = self.events.clone();
            let credential_dir = self.options.credential_dir.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if state.lock().await.destroyed {
                    return;
                }
                if let Err(err) = tokio::fs::create_dir_all(&credential_dir).await {
                    warn!(
                        path = %credential_dir.display(),
                        %err,
                        "memory transport: failed to persist credentials"
                    );
                }
                emit(&state, &events, TransportEvent::Authenticated).await;
                emit(&state, &events, TransportEvent::Ready).await;
            });
        }

        Ok(())
    }

    async fn is_ready(&self) -> bool {
        let state = self.state.lock().await;
        state.ready && !state.destroyed
    }

    async fn identity(&self) -> Option<ClientInfo> {
        if !self.is_ready().await {
            return None;
        }
        Some(ClientInfo {
            id: format!("{}@memory", self.options.user_id),
            display_name: Some(self.options.user_id.clone()),
            platform: Some("memory".to_string()),
        })
    }

    async fn chats(&self) -> Result<Vec<RawChat>> {
        pause(self.latency().await.chats).await;
        Ok(self.state.lock().await.chats.clone())
    }

    async fn chat(&self, chat_id: &str) -> Result<Option<RawChat>> {
        Ok(self
            .state
            .lock()
            .await
            .chats
            .iter()
            .find(|chat| chat.id == chat_id)
            .cloned())
    }

    async fn fetch_messages(&self, chat_id: &str, limit: usize) -> Result<Vec<RawMessage>> {
        pause(self.latency().await.messages).await;
        let state = self.state.lock().await;
        let Some(messages) = state.messages.get(chat_id) else {
            bail!("chat {chat_id} not found");
        };
        let start = messages.len().saturating_sub(limit);
        Ok(messages[start..].to_vec())
    }

    async fn contact(&self, contact_id: &str) -> Result<RawContact> {
        pause(self.latency().await.contact).await;
        let state = self.state.lock().await;
        if state.fail_contact_lookups {
            bail!("contact lookup failed for {contact_id}");
        }
        state
            .contacts
            .get(contact_id)
            .cloned()
            .ok_or_else(|| anyhow!("contact {contact_id} not found"))
    }

    async fn profile_picture_url(&self, chat_id: &str) -> Result<Option<String>> {
        pause(self.latency().await.avatar).await;
        Ok(self.state.lock().await.avatars.get(chat_id).cloned())
    }

    async fn download_media(&self, message_id: &str) -> Result<Option<MediaPayload>> {
        Ok(self.state.lock().await.media.get(message_id).cloned())
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<RawMessage> {
        let mut state = self.state.lock().await;
        if !state.chats.iter().any(|chat| chat.id == chat_id) {
            bail!("chat {chat_id} not found");
        }

        let id = match state.queued_message_ids.pop_front() {
            Some(id) => id,
            None => {
                state.next_message_seq += 1;
                format!("mem-{}", state.next_message_seq)
            }
        };
        let message = text_message(chat_id, &id, text, true, Utc::now().timestamp());
        let failure = state.send_failure.clone();
        if failure.as_ref().map_or(true, |failure| failure.delivered) {
            if let Some(chat) = state.chats.iter_mut().find(|chat| chat.id == chat_id) {
                chat.timestamp = Some(message.timestamp);
            }
            state
                .messages
                .entry(chat_id.to_string())
                .or_default()
                .push(message.clone());
        }

        match failure {
            Some(failure) => Err(anyhow!(failure.message)),
            None => Ok(message),
        }
    }

    async fn destroy(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.destroyed = true;
        state.ready = false;
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

pub fn direct_chat(id: &str, name: &str, timestamp: Option<i64>) -> RawChat {
    RawChat {
        id: id.to_string(),
        name: Some(name.to_string()),
        is_group: false,
        unread_count: 0,
        timestamp,
        contact_id: Some(id.to_string()),
    }
}

pub fn group_chat(id: &str, name: &str, timestamp: Option<i64>) -> RawChat {
    RawChat {
        id: id.to_string(),
        name: Some(name.to_string()),
        is_group: true,
        unread_count: 0,
        timestamp,
        contact_id: None,
    }
}

pub fn text_message(chat_id: &str, id: &str, body: &str, from_me: bool, timestamp: i64) -> RawMessage {
    RawMessage {
        id: id.to_string(),
        chat_id: chat_id.to_string(),
        body: body.to_string(),
        caption: None,
        timestamp,
        from_me,
        ack: if from_me { 1 } else { 0 },
        kind: MessageKind::Text,
        has_media: false,
        filename: None,
    }
}

#[cfg(test)]
#[path = "tests/memory_tests.rs"]
mod tests;
