use super::*;
use chat_transport::{
    memory::{MemoryBehavior, MemoryChatClient},
    ClientOptions,
};

fn user(id: &str) -> UserId {
    UserId::parse(id).expect("user id")
}

fn memory_client(user_id: &str) -> Arc<dyn ChatClient> {
    Arc::new(MemoryChatClient::new(
        ClientOptions {
            user_id: user_id.to_string(),
            credential_dir: std::env::temp_dir().join(format!("registry-test-{user_id}")),
        },
        MemoryBehavior::default(),
    ))
}

async fn started_with_client(registry: &SessionRegistry, user_id: &UserId) -> u64 {
    let (generation, _) = registry
        .start(user_id, StartKind::Pairing)
        .await
        .expect("start");
    registry
        .attach_client(
            user_id,
            generation,
            memory_client(user_id.as_str()),
            tokio::spawn(async {}),
        )
        .await
        .map_err(|_| "superseded")
        .expect("attach");
    generation
}

#[tokio::test]
async fn absent_user_reports_not_initialized() {
    let registry = SessionRegistry::new();
    let u1 = user("u1");
    assert_eq!(registry.status(&u1).await, SessionStatus::NotInitialized);
    assert!(registry.get(&u1).await.is_none());
    assert!(registry.client_handle(&u1).await.is_none());
}

#[tokio::test]
async fn pairing_artifact_present_only_while_qr_ready() {
    let registry = SessionRegistry::new();
    let u1 = user("u1");
    let generation = started_with_client(&registry, &u1).await;

    let steps = [
        Transition::PairingIssued("code-1".into()),
        Transition::PairingIssued("code-2".into()),
        Transition::Authenticated,
        Transition::Ready,
    ];
    for step in steps {
        let applied = registry.apply(&u1, generation, step).await.expect("apply");
        let view = registry.get(&u1).await.expect("view");
        assert_eq!(view.status, applied.status);
        assert_eq!(
            view.pairing_artifact.is_some(),
            view.status == SessionStatus::QrReady,
            "artifact invariant broken in {}",
            view.status
        );
    }

    let view = registry.get(&u1).await.expect("view");
    assert_eq!(view.status, SessionStatus::Connected);
    assert!(view.pairing_artifact.is_none());
    assert!(view.has_client);
}

#[tokio::test]
async fn reissued_code_replaces_artifact() {
    let registry = SessionRegistry::new();
    let u1 = user("u1");
    let generation = started_with_client(&registry, &u1).await;

    for code in ["first", "second"] {
        registry
            .apply(&u1, generation, Transition::PairingIssued(code.into()))
            .await
            .expect("apply");
    }
    let view = registry.get(&u1).await.expect("view");
    assert_eq!(view.pairing_artifact.as_deref(), Some("second"));
}

#[tokio::test]
async fn terminal_event_releases_client_and_records_reason() {
    let registry = SessionRegistry::new();
    let u1 = user("u1");
    let generation = started_with_client(&registry, &u1).await;

    let applied = registry
        .apply(&u1, generation, Transition::AuthFailed("logged out".into()))
        .await
        .expect("apply");
    let released = applied.released.expect("terminal releases");
    assert!(released.client.is_some());

    let view = registry.get(&u1).await.expect("view");
    assert_eq!(view.status, SessionStatus::AuthFailure);
    assert!(!view.has_client);
    assert_eq!(view.last_error.as_deref(), Some("logged out"));
    assert!(registry.client_handle(&u1).await.is_none());
}

#[tokio::test]
async fn events_from_superseded_generation_are_rejected() {
    let registry = SessionRegistry::new();
    let u1 = user("u1");
    let old = started_with_client(&registry, &u1).await;
    registry
        .apply(&u1, old, Transition::Disconnected("network".into()))
        .await
        .expect("disconnect");
    let new = started_with_client(&registry, &u1).await;
    assert!(new > old);

    let err = registry
        .apply(&u1, old, Transition::Ready)
        .await
        .err()
        .expect("stale event rejected");
    assert_eq!(err, ApplyError::Stale { stale: old, current: new });
    assert_eq!(registry.status(&u1).await, SessionStatus::Initializing);
}

#[tokio::test]
async fn start_is_refused_while_handshake_in_progress() {
    let registry = SessionRegistry::new();
    let u1 = user("u1");
    started_with_client(&registry, &u1).await;

    let err = registry
        .start(&u1, StartKind::Restoring)
        .await
        .err()
        .expect("start refused");
    assert!(matches!(err, ApplyError::Invalid(_)));
}

#[tokio::test]
async fn attach_after_discard_hands_client_back() {
    let registry = SessionRegistry::new();
    let u1 = user("u1");
    let (generation, _) = registry.start(&u1, StartKind::Pairing).await.expect("start");
    assert!(registry.discard(&u1, generation).await.is_some());

    let result = registry
        .attach_client(&u1, generation, memory_client("u1"), tokio::spawn(async {}))
        .await;
    let released = result.err().expect("handed back");
    assert!(released.client.is_some());
    assert!(registry.get(&u1).await.is_none());
}

#[tokio::test]
async fn discard_ignores_other_generations() {
    let registry = SessionRegistry::new();
    let u1 = user("u1");
    let generation = started_with_client(&registry, &u1).await;
    assert!(registry.discard(&u1, generation + 1).await.is_none());
    assert!(registry.get(&u1).await.is_some());
}

#[tokio::test]
async fn wait_for_observes_transition_from_another_task() {
    let registry = Arc::new(SessionRegistry::new());
    let u1 = user("u1");
    let generation = started_with_client(&registry, &u1).await;

    let writer = {
        let registry = Arc::clone(&registry);
        let u1 = u1.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            registry
                .apply(&u1, generation, Transition::Ready)
                .await
                .map(|applied| applied.status)
        })
    };

    let status = registry
        .wait_for(&u1, Duration::from_secs(2), SessionStatus::is_connected)
        .await;
    assert_eq!(status, SessionStatus::Connected);
    assert_eq!(
        writer.await.expect("join").expect("apply"),
        SessionStatus::Connected
    );
}

#[tokio::test(start_paused = true)]
async fn wait_for_gives_up_after_deadline() {
    let registry = SessionRegistry::new();
    let u1 = user("u1");
    started_with_client(&registry, &u1).await;

    let started = tokio::time::Instant::now();
    let status = registry
        .wait_for(&u1, Duration::from_secs(2), SessionStatus::is_connected)
        .await;
    assert_eq!(status, SessionStatus::Initializing);
    assert!(started.elapsed() >= Duration::from_secs(2));
}
