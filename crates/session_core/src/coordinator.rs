use std::{sync::Arc, time::Duration};

use chat_transport::{ChatClient, ChatClientFactory, ClientOptions, TransportEvent};
use shared::domain::{SessionStatus, UserId};
use tokio::{
    runtime::Handle,
    sync::broadcast::{self, error::RecvError},
    task::{AbortHandle, JoinHandle},
};
use tracing::{debug, error, info, warn};

use crate::{
    config::SessionConfig,
    credentials::CredentialStore,
    error::SessionError,
    registry::{ApplyError, Released, SessionRegistry},
    single_flight::SingleFlight,
    state::{StartKind, Transition},
    timeouts::with_timeout,
};

/// What an initialize or restore call observed when it returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOutcome {
    pub connected: bool,
    /// Stored credentials exist, or a live session does.
    pub has_session: bool,
    /// A handshake is still underway; poll status for the result.
    pub pending: bool,
}

impl SessionOutcome {
    pub fn connected() -> Self {
        Self {
            connected: true,
            has_session: true,
            pending: false,
        }
    }

    pub fn pending(has_session: bool) -> Self {
        Self {
            connected: false,
            has_session,
            pending: true,
        }
    }

    pub fn no_session() -> Self {
        Self {
            connected: false,
            has_session: false,
            pending: false,
        }
    }
}

/// Starts, restores and tears down per-user clients.
///
/// Initialization and restoration for one user share a single flight, so
/// concurrent callers never create two clients. Lifecycle events from each
/// client are pumped into the registry by a task tagged with the client's
/// generation.
pub struct SessionCoordinator {
    registry: Arc<SessionRegistry>,
    factory: Arc<dyn ChatClientFactory>,
    credentials: CredentialStore,
    flights: SingleFlight<UserId, SessionOutcome, SessionError>,
    config: Arc<SessionConfig>,
}

impl SessionCoordinator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        factory: Arc<dyn ChatClientFactory>,
        config: Arc<SessionConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            factory,
            credentials: CredentialStore::new(&config.credentials_root),
            flights: SingleFlight::new(),
            config,
        })
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn has_pending_flight(&self, user_id: &UserId) -> bool {
        self.flights.is_pending(user_id)
    }

    /// Starts pairing for `user_id` and returns without waiting for the
    /// handshake to finish.
    pub async fn initialize(self: &Arc<Self>, user_id: &UserId) -> Result<SessionOutcome, SessionError> {
        let mut outcome = SessionOutcome::no_session();
        // A restoration flight that found no credentials is joined at most
        // once before starting our own pairing flight.
        for _ in 0..2 {
            let status = self.registry.status(user_id).await;
            if status.is_connected() {
                return Ok(SessionOutcome::connected());
            }
            if status.is_handshaking() {
                debug!(user_id = %user_id, status = %status, "session: initialize while handshake underway");
                return Ok(SessionOutcome::pending(false));
            }

            outcome = self
                .flights
                .run(
                    user_id.clone(),
                    Arc::clone(self).start_pairing(user_id.clone()),
                    cancelled(user_id),
                )
                .await?;
            if outcome.connected || outcome.pending {
                return Ok(outcome);
            }
            debug!(user_id = %user_id, "session: joined restoration found no credentials");
        }
        Ok(outcome)
    }

    /// Reattaches to stored credentials, waiting briefly for the client to
    /// come up.
    pub async fn restore(self: &Arc<Self>, user_id: &UserId) -> Result<SessionOutcome, SessionError> {
        let status = self.registry.status(user_id).await;
        if status.is_connected() {
            return Ok(SessionOutcome::connected());
        }
        if status.is_handshaking() {
            let status = self
                .registry
                .wait_for(user_id, self.config.handshake_recheck(), |status| {
                    status.is_connected() || status.is_terminal()
                })
                .await;
            if status.is_terminal() {
                let reason = self.failure_reason(user_id, status).await;
                return Err(restoration_failed(user_id, status, reason));
            }
            return Ok(if status.is_connected() {
                SessionOutcome::connected()
            } else {
                SessionOutcome::pending(true)
            });
        }

        self.flights
            .run(
                user_id.clone(),
                Arc::clone(self).start_restoring(user_id.clone()),
                cancelled(user_id),
            )
            .await
    }

    async fn start_pairing(self: Arc<Self>, user_id: UserId) -> Result<SessionOutcome, SessionError> {
        // Re-checked inside the flight: the caller's read may be stale.
        let status = self.registry.status(&user_id).await;
        if status.is_connected() {
            return Ok(SessionOutcome::connected());
        }
        if status.is_handshaking() {
            return Ok(SessionOutcome::pending(false));
        }

        let generation = self.open_generation(&user_id, StartKind::Pairing).await?;
        self.launch(&user_id, generation).await?;
        info!(user_id = %user_id, generation, "session: pairing started");
        Ok(SessionOutcome::pending(false))
    }

    async fn start_restoring(self: Arc<Self>, user_id: UserId) -> Result<SessionOutcome, SessionError> {
        let status = self.registry.status(&user_id).await;
        if status.is_connected() {
            return Ok(SessionOutcome::connected());
        }
        if status.is_handshaking() {
            return Ok(SessionOutcome::pending(true));
        }
        if !self.credentials.exists(&user_id).await {
            info!(user_id = %user_id, "session: no stored credentials to restore");
            return Ok(SessionOutcome::no_session());
        }

        let generation = self.open_generation(&user_id, StartKind::Restoring).await?;
        self.launch(&user_id, generation).await?;
        info!(user_id = %user_id, generation, "session: restoration started");

        let status = self
            .registry
            .wait_for(&user_id, self.config.restore_wait(), |status| {
                status.is_connected() || status.is_terminal()
            })
            .await;
        match status {
            SessionStatus::Connected => {
                info!(user_id = %user_id, generation, "session: restored");
                Ok(SessionOutcome::connected())
            }
            SessionStatus::AuthFailure | SessionStatus::Disconnected => {
                let reason = self.failure_reason(&user_id, status).await;
                if let Some(released) = self.registry.discard(&user_id, generation).await {
                    self.teardown(&user_id, released).await;
                }
                warn!(user_id = %user_id, generation, status = %status, "session: restoration failed: {reason}");
                Err(restoration_failed(&user_id, status, reason))
            }
            _ => {
                debug!(user_id = %user_id, generation, status = %status, "session: restoration still pending");
                Ok(SessionOutcome::pending(true))
            }
        }
    }

    async fn failure_reason(&self, user_id: &UserId, status: SessionStatus) -> String {
        self.registry
            .get(user_id)
            .await
            .and_then(|view| view.last_error)
            .unwrap_or_else(|| status.to_string())
    }

    async fn open_generation(&self, user_id: &UserId, kind: StartKind) -> Result<u64, SessionError> {
        let (generation, previous) = self
            .registry
            .start(user_id, kind)
            .await
            .map_err(|err| SessionError::Internal(err.to_string()))?;
        self.teardown(user_id, previous).await;
        Ok(generation)
    }

    /// Creates and connects the client for `generation`. On failure the
    /// session is cleared so a later call can start over.
    async fn launch(self: &Arc<Self>, user_id: &UserId, generation: u64) -> Result<(), SessionError> {
        let result = self.create_and_connect(user_id, generation).await;
        if let Err(err) = &result {
            error!(user_id = %user_id, generation, "session: client start failed: {err}");
            if let Some(released) = self.registry.discard(user_id, generation).await {
                self.teardown(user_id, released).await;
            }
        }
        result
    }

    async fn create_and_connect(
        self: &Arc<Self>,
        user_id: &UserId,
        generation: u64,
    ) -> Result<(), SessionError> {
        let options = ClientOptions {
            user_id: user_id.to_string(),
            credential_dir: self.credentials.dir_for(user_id),
        };
        let client = self
            .factory
            .create(options)
            .await
            .map_err(SessionError::transport)?;

        let event_task = self.spawn_event_pump(user_id.clone(), generation, client.subscribe_events());
        // Until the registry owns the client, an abort of this flight must
        // not drop it without a destroy.
        let unattached = UnattachedClient::new(
            user_id.clone(),
            Arc::clone(&client),
            event_task.abort_handle(),
            self.config.destroy_timeout(),
        );
        let attached = self
            .registry
            .attach_client(user_id, generation, Arc::clone(&client), event_task)
            .await;
        unattached.disarm();
        if let Err(released) = attached {
            self.teardown(user_id, released).await;
            return Err(SessionError::Cancelled(user_id.clone()));
        }

        client.connect().await.map_err(SessionError::transport)
    }

    fn spawn_event_pump(
        self: &Arc<Self>,
        user_id: UserId,
        generation: u64,
        mut events: broadcast::Receiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(user_id = %user_id, generation, skipped, "session: lifecycle events lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        TransportEvent::Disconnected("transport event stream closed".to_string())
                    }
                };
                if !coordinator.handle_event(&user_id, generation, event).await {
                    break;
                }
            }
            debug!(user_id = %user_id, generation, "session: event pump stopped");
        })
    }

    /// Applies one lifecycle event. Returns whether more events are expected
    /// from this client.
    async fn handle_event(&self, user_id: &UserId, generation: u64, event: TransportEvent) -> bool {
        let terminal = event.is_terminal();
        let auth_failed = matches!(event, TransportEvent::AuthFailure(_));

        if matches!(event, TransportEvent::PairingCode(_))
            && self.registry.status(user_id).await == SessionStatus::Restoring
        {
            match self
                .registry
                .apply(user_id, generation, Transition::CredentialsRejected)
                .await
            {
                Ok(_) => info!(user_id = %user_id, generation, "session: stored credentials rejected, pairing again"),
                Err(err) => debug!(user_id = %user_id, generation, "session: {err}"),
            }
        }

        let transition = Transition::from(event);
        let name = transition.name();
        match self.registry.apply(user_id, generation, transition).await {
            Ok(applied) => {
                info!(
                    user_id = %user_id,
                    generation,
                    event = name,
                    status = %applied.status,
                    "session: lifecycle event applied"
                );
                if auth_failed && self.config.purge_credentials_on_auth_failure {
                    self.purge_credentials(user_id).await;
                }
                // The event task is this task; dropping its handle detaches it.
                if let Some(released) = applied.released {
                    self.destroy_client(user_id, released.client).await;
                }
            }
            Err(err @ (ApplyError::Stale { .. } | ApplyError::UnknownSession(_))) => {
                debug!(user_id = %user_id, generation, event = name, "session: dropping event: {err}");
                return false;
            }
            Err(ApplyError::Invalid(err)) => {
                warn!(user_id = %user_id, generation, "session: ignoring event: {err}");
            }
        }
        !terminal
    }

    async fn purge_credentials(&self, user_id: &UserId) {
        match self.credentials.purge(user_id).await {
            Ok(true) => info!(user_id = %user_id, "session: rejected credentials purged"),
            Ok(false) => {}
            Err(err) => warn!(user_id = %user_id, "session: failed to purge credentials: {err}"),
        }
    }

    /// Tears down the user's session. Stored credentials are kept so the
    /// session can be restored later. Returns whether anything was running.
    pub async fn disconnect(&self, user_id: &UserId) -> bool {
        let cancelled = self.flights.cancel(user_id).await;
        let released = self.registry.remove(user_id).await;
        let existed = released.is_some();
        if let Some(released) = released {
            self.teardown(user_id, released).await;
        }
        if existed || cancelled {
            info!(user_id = %user_id, cancelled, "session: disconnected");
        }
        existed || cancelled
    }

    pub async fn shutdown(&self) {
        let mut user_ids = self.registry.user_ids().await;
        for user_id in self.flights.pending_keys() {
            if !user_ids.contains(&user_id) {
                user_ids.push(user_id);
            }
        }
        let count = user_ids.len();
        for user_id in user_ids {
            self.disconnect(&user_id).await;
        }
        info!(sessions = count, "session: all sessions shut down");
    }

    async fn teardown(&self, user_id: &UserId, released: Released) {
        if let Some(task) = released.event_task {
            task.abort();
        }
        self.destroy_client(user_id, released.client).await;
    }

    async fn destroy_client(&self, user_id: &UserId, client: Option<Arc<dyn ChatClient>>) {
        if let Some(client) = client {
            destroy_with_timeout(user_id, client, self.config.destroy_timeout()).await;
        }
    }
}

async fn destroy_with_timeout(user_id: &UserId, client: Arc<dyn ChatClient>, after: Duration) {
    match with_timeout("client destroy", after, client.destroy()).await {
        Ok(Ok(())) => debug!(user_id = %user_id, "session: client destroyed"),
        Ok(Err(err)) => warn!(user_id = %user_id, "session: client destroy failed: {err:#}"),
        Err(elapsed) => warn!(user_id = %user_id, "session: {elapsed}"),
    }
}

/// A freshly created client not yet installed in the registry. Dropping it
/// armed stops its event pump and destroys the client in the background.
struct UnattachedClient {
    user_id: UserId,
    client: Option<Arc<dyn ChatClient>>,
    event_task: Option<AbortHandle>,
    destroy_timeout: Duration,
}

impl UnattachedClient {
    fn new(
        user_id: UserId,
        client: Arc<dyn ChatClient>,
        event_task: AbortHandle,
        destroy_timeout: Duration,
    ) -> Self {
        Self {
            user_id,
            client: Some(client),
            event_task: Some(event_task),
            destroy_timeout,
        }
    }

    fn disarm(mut self) {
        self.client = None;
        self.event_task = None;
    }
}

impl Drop for UnattachedClient {
    fn drop(&mut self) {
        if let Some(task) = self.event_task.take() {
            task.abort();
        }
        let Some(client) = self.client.take() else {
            return;
        };
        warn!(user_id = %self.user_id, "session: start abandoned before the client was installed");
        match Handle::try_current() {
            Ok(runtime) => {
                let user_id = self.user_id.clone();
                let after = self.destroy_timeout;
                runtime.spawn(async move {
                    destroy_with_timeout(&user_id, client, after).await;
                });
            }
            Err(_) => {
                warn!(user_id = %self.user_id, "session: no runtime left to destroy abandoned client");
            }
        }
    }
}

fn restoration_failed(user_id: &UserId, status: SessionStatus, reason: String) -> SessionError {
    if status == SessionStatus::AuthFailure {
        SessionError::AuthFailure {
            user_id: user_id.clone(),
            reason,
        }
    } else {
        SessionError::Transport(format!("disconnected during restoration: {reason}"))
    }
}

fn cancelled(user_id: &UserId) -> impl FnOnce() -> SessionError + Send + 'static {
    let user_id = user_id.clone();
    move || SessionError::Cancelled(user_id)
}

#[cfg(test)]
#[path = "tests/coordinator_tests.rs"]
mod tests;
