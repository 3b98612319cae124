use super::*;
use std::time::Duration;

use async_trait::async_trait;

use chat_transport::{
    memory::{
        direct_chat, group_chat, text_message, MemoryBehavior, MemoryChatClient, MemoryLatency,
    },
    ClientOptions, MediaPayload, RawContact, TransportEvent,
};
use shared::domain::MessageKind;

use crate::state::{StartKind, Transition};

struct Fixture {
    registry: Arc<SessionRegistry>,
    gateway: ConversationGateway,
    client: Arc<MemoryChatClient>,
    user_id: UserId,
    generation: u64,
}

async fn fixture(ready: bool) -> Fixture {
    let registry = Arc::new(SessionRegistry::new());
    let gateway = ConversationGateway::new(
        Arc::clone(&registry),
        Arc::new(SessionConfig::default()),
    );
    let user_id = UserId::parse("u1").expect("user id");
    let client = Arc::new(MemoryChatClient::new(
        ClientOptions {
            user_id: "u1".to_string(),
            credential_dir: std::env::temp_dir().join("gateway-tests-u1"),
        },
        MemoryBehavior::default(),
    ));

    let (generation, _) = registry
        .start(&user_id, StartKind::Pairing)
        .await
        .expect("start");
    let handle: Arc<dyn ChatClient> = client.clone();
    registry
        .attach_client(&user_id, generation, handle, tokio::spawn(async {}))
        .await
        .map_err(|_| "superseded")
        .expect("attach");

    if ready {
        client.emit(TransportEvent::Ready).await;
        registry
            .apply(&user_id, generation, Transition::Ready)
            .await
            .expect("ready");
    }

    Fixture {
        registry,
        gateway,
        client,
        user_id,
        generation,
    }
}

fn image_message(chat_id: &str, id: &str, timestamp: i64) -> RawMessage {
    RawMessage {
        kind: MessageKind::Image,
        has_media: true,
        body: String::new(),
        ..text_message(chat_id, id, "", false, timestamp)
    }
}

#[tokio::test(start_paused = true)]
async fn missing_session_fails_without_polling() {
    let registry = Arc::new(SessionRegistry::new());
    let gateway = ConversationGateway::new(registry, Arc::new(SessionConfig::default()));
    let user_id = UserId::parse("nobody").expect("user id");

    let started = tokio::time::Instant::now();
    let err = gateway
        .list_conversations(&user_id)
        .await
        .expect_err("not ready");
    assert!(matches!(err, SessionError::NotReady { .. }));
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn readiness_wait_gives_up_after_ceiling() {
    let fx = fixture(false).await;

    let started = tokio::time::Instant::now();
    let err = fx
        .gateway
        .count_conversations(&fx.user_id)
        .await
        .expect_err("not ready");
    let elapsed = started.elapsed();

    assert!(matches!(err, SessionError::NotReady { .. }));
    assert!(elapsed >= Duration::from_millis(9_500), "gave up after {elapsed:?}");
    assert!(elapsed <= Duration::from_secs(10), "gave up after {elapsed:?}");
}

/// Memory client whose readiness check hangs far longer than the poll
/// interval.
struct HungReadinessClient {
    inner: MemoryChatClient,
    delay: Duration,
}

#[async_trait]
impl ChatClient for HungReadinessClient {
    async fn connect(&self) -> anyhow::Result<()> {
        self.inner.connect().await
    }

    async fn is_ready(&self) -> bool {
        tokio::time::sleep(self.delay).await;
        false
    }

    async fn identity(&self) -> Option<shared::protocol::ClientInfo> {
        None
    }

    async fn chats(&self) -> anyhow::Result<Vec<chat_transport::RawChat>> {
        self.inner.chats().await
    }

    async fn chat(&self, chat_id: &str) -> anyhow::Result<Option<chat_transport::RawChat>> {
        self.inner.chat(chat_id).await
    }

    async fn fetch_messages(&self, chat_id: &str, limit: usize) -> anyhow::Result<Vec<RawMessage>> {
        self.inner.fetch_messages(chat_id, limit).await
    }

    async fn contact(&self, contact_id: &str) -> anyhow::Result<RawContact> {
        self.inner.contact(contact_id).await
    }

    async fn profile_picture_url(&self, chat_id: &str) -> anyhow::Result<Option<String>> {
        self.inner.profile_picture_url(chat_id).await
    }

    async fn download_media(&self, message_id: &str) -> anyhow::Result<Option<MediaPayload>> {
        self.inner.download_media(message_id).await
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> anyhow::Result<RawMessage> {
        self.inner.send_message(chat_id, text).await
    }

    async fn destroy(&self) -> anyhow::Result<()> {
        self.inner.destroy().await
    }

    fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<TransportEvent> {
        self.inner.subscribe_events()
    }
}

#[tokio::test(start_paused = true)]
async fn hung_readiness_check_stays_within_ceiling() {
    let registry = Arc::new(SessionRegistry::new());
    let gateway = ConversationGateway::new(
        Arc::clone(&registry),
        Arc::new(SessionConfig::default()),
    );
    let user_id = UserId::parse("u1").expect("user id");
    let client: Arc<dyn ChatClient> = Arc::new(HungReadinessClient {
        inner: MemoryChatClient::new(
            ClientOptions {
                user_id: "u1".to_string(),
                credential_dir: std::env::temp_dir().join("gateway-tests-hung-u1"),
            },
            MemoryBehavior::default(),
        ),
        delay: Duration::from_secs(5),
    });
    let (generation, _) = registry
        .start(&user_id, StartKind::Pairing)
        .await
        .expect("start");
    registry
        .attach_client(&user_id, generation, client, tokio::spawn(async {}))
        .await
        .map_err(|_| "superseded")
        .expect("attach");

    let started = tokio::time::Instant::now();
    let err = gateway
        .count_conversations(&user_id)
        .await
        .expect_err("not ready");
    let elapsed = started.elapsed();

    assert!(matches!(err, SessionError::NotReady { .. }));
    assert!(elapsed <= Duration::from_secs(10), "blocked for {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn terminal_session_fails_fast() {
    let fx = fixture(true).await;
    fx.registry
        .apply(&fx.user_id, fx.generation, Transition::Disconnected("network".into()))
        .await
        .expect("disconnect");

    let started = tokio::time::Instant::now();
    let err = fx
        .gateway
        .get_messages(&fx.user_id, &ConversationId::from("c1"))
        .await
        .expect_err("not ready");
    assert!(matches!(err, SessionError::NotReady { .. }));
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test]
async fn readiness_observed_once_client_comes_up() {
    let fx = fixture(false).await;
    fx.client.add_chat(direct_chat("c1", "Ada", Some(1))).await;

    let client = Arc::clone(&fx.client);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(600)).await;
        client.emit(TransportEvent::Ready).await;
    });

    assert_eq!(fx.gateway.count_conversations(&fx.user_id).await.expect("count"), 1);
}

#[tokio::test]
async fn empty_account_lists_nothing() {
    let fx = fixture(true).await;
    let list = fx
        .gateway
        .list_conversations(&fx.user_id)
        .await
        .expect("list");
    assert!(list.is_empty());
    assert_eq!(fx.gateway.count_conversations(&fx.user_id).await.expect("count"), 0);
}

#[tokio::test]
async fn summaries_resolve_names_previews_and_order() {
    let fx = fixture(true).await;
    let client = &fx.client;

    client.add_chat(direct_chat("111@c.us", "Chat A", None)).await;
    client.add_chat(group_chat("team@g.us", "Team", None)).await;
    client.add_chat(direct_chat("222@c.us", "Chat C", None)).await;

    client
        .set_contact(RawContact {
            id: "111@c.us".into(),
            name: Some("Alice".into()),
            push_name: None,
            number: Some("111".into()),
        })
        .await;
    client.set_avatar("111@c.us", "https://avatars.test/alice.jpg").await;
    client
        .add_message(text_message("111@c.us", "m1", "see you soon", true, 200))
        .await;

    client.add_message(image_message("222@c.us", "m2", 150)).await;
    client
        .set_media(
            "m2",
            MediaPayload {
                mime_type: "image/jpeg".into(),
                data: vec![1, 2, 3],
            },
        )
        .await;

    let list = fx
        .gateway
        .list_conversations(&fx.user_id)
        .await
        .expect("list");
    let ids: Vec<&str> = list.iter().map(|summary| summary.id.as_str()).collect();
    assert_eq!(ids, ["111@c.us", "222@c.us", "team@g.us"]);

    let alice = &list[0];
    assert_eq!(alice.name, "Alice");
    assert_eq!(alice.phone.as_deref(), Some("111"));
    assert_eq!(alice.avatar_url.as_deref(), Some("https://avatars.test/alice.jpg"));
    let preview = alice.last_message.as_ref().expect("preview");
    assert_eq!(preview.text, "see you soon");
    assert!(preview.from_me);

    let photo = &list[1];
    assert_eq!(photo.name, "Chat C");
    let preview = photo.last_message.as_ref().expect("preview");
    assert_eq!(preview.text, "Image");
    assert_eq!(preview.kind, MessageKind::Image);
    assert_eq!(preview.thumbnail.as_deref(), Some("data:image/jpeg;base64,AQID"));

    let team = &list[2];
    assert!(team.is_group);
    assert!(team.timestamp.is_none());
    assert!(team.last_message.is_none());
}

#[tokio::test]
async fn large_media_is_not_inlined() {
    let fx = fixture(true).await;
    fx.client.add_chat(direct_chat("c1", "Ada", None)).await;
    fx.client.add_message(image_message("c1", "big", 10)).await;
    fx.client
        .set_media(
            "big",
            MediaPayload {
                mime_type: "image/png".into(),
                data: vec![0; 100 * 1024],
            },
        )
        .await;

    let list = fx
        .gateway
        .list_conversations(&fx.user_id)
        .await
        .expect("list");
    let preview = list[0].last_message.as_ref().expect("preview");
    assert_eq!(preview.text, "Image");
    assert!(preview.thumbnail.is_none());
}

#[tokio::test(start_paused = true)]
async fn slow_and_failing_sub_fetches_degrade_entries() {
    let fx = fixture(true).await;
    fx.client.add_chat(direct_chat("c1", "Ada", Some(5))).await;
    fx.client.add_chat(direct_chat("c2", "Grace", Some(4))).await;
    fx.client.set_avatar("c1", "https://avatars.test/ada.jpg").await;
    fx.client.fail_contact_lookups(true).await;
    fx.client
        .set_latency(MemoryLatency {
            avatar: Some(Duration::from_secs(30)),
            messages: Some(Duration::from_secs(30)),
            ..MemoryLatency::default()
        })
        .await;

    let started = tokio::time::Instant::now();
    let list = fx
        .gateway
        .list_conversations(&fx.user_id)
        .await
        .expect("list");
    let elapsed = started.elapsed();

    assert_eq!(list.len(), 2);
    for summary in &list {
        assert!(summary.avatar_url.is_none());
        assert!(summary.last_message.is_none());
        assert!(summary.phone.is_none());
    }
    assert_eq!(list[0].name, "Ada");
    assert_eq!(list[1].name, "Grace");
    assert!(elapsed >= Duration::from_secs(5));
    assert!(elapsed < Duration::from_secs(30), "took {elapsed:?}");
}

#[tokio::test]
async fn messages_map_sender_and_delivery_status() {
    let fx = fixture(true).await;
    fx.client.add_chat(direct_chat("c1", "Ada", None)).await;

    let mut sent = text_message("c1", "m2", "on my way", true, 11);
    sent.ack = 3;
    let mut delivered = text_message("c1", "m3", "ok", true, 12);
    delivered.ack = 2;
    let mut captioned = image_message("c1", "m4", 13);
    captioned.caption = Some("look".into());

    for message in [
        text_message("c1", "m1", "where are you?", false, 10),
        sent,
        delivered,
        captioned,
    ] {
        fx.client.add_message(message).await;
    }

    let messages = fx
        .gateway
        .get_messages(&fx.user_id, &ConversationId::from("c1"))
        .await
        .expect("messages");

    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0].sender, MessageSender::Them);
    assert_eq!(messages[0].status, None);
    assert_eq!(messages[1].sender, MessageSender::Me);
    assert_eq!(messages[1].status, Some(DeliveryStatus::Read));
    assert_eq!(messages[2].status, Some(DeliveryStatus::Delivered));
    assert_eq!(messages[3].text, "look");
    assert_eq!(messages[3].kind, MessageKind::Image);
}

#[tokio::test]
async fn history_is_capped_at_the_most_recent_messages() {
    let fx = fixture(true).await;
    fx.client.add_chat(direct_chat("c1", "Ada", None)).await;
    for n in 0..120 {
        fx.client
            .add_message(text_message("c1", &format!("m{n}"), "hi", n % 2 == 0, n))
            .await;
    }

    let messages = fx
        .gateway
        .get_messages(&fx.user_id, &ConversationId::from("c1"))
        .await
        .expect("messages");
    assert_eq!(messages.len(), 100);
    assert_eq!(messages[0].id.as_str(), "m20");
    assert_eq!(messages[99].id.as_str(), "m119");
}

#[tokio::test]
async fn unknown_conversation_is_reported() {
    let fx = fixture(true).await;
    let missing = ConversationId::from("ghost@c.us");

    let err = fx
        .gateway
        .get_messages(&fx.user_id, &missing)
        .await
        .expect_err("not found");
    assert!(matches!(err, SessionError::ConversationNotFound(id) if id == missing));

    let err = fx
        .gateway
        .send_message(&fx.user_id, &missing, "hello")
        .await
        .expect_err("not found");
    assert!(matches!(err, SessionError::ConversationNotFound(_)));
}

#[tokio::test]
async fn send_returns_transport_message_id() {
    let fx = fixture(true).await;
    fx.client.add_chat(direct_chat("c1", "Ada", None)).await;
    fx.client.queue_message_id("abc123").await;

    let receipt = fx
        .gateway
        .send_message(&fx.user_id, &ConversationId::from("c1"), "hi")
        .await
        .expect("sent");
    assert_eq!(receipt.message_id.as_str(), "abc123");
    assert!(receipt.verified);
}

#[tokio::test]
async fn blank_text_is_rejected_before_touching_the_client() {
    let fx = fixture(false).await;
    let err = fx
        .gateway
        .send_message(&fx.user_id, &ConversationId::from("c1"), "   ")
        .await
        .expect_err("validation");
    assert!(matches!(err, SessionError::Validation(_)));
}
