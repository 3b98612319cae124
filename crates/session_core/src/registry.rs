use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chat_transport::ChatClient;
use shared::domain::{SessionStatus, UserId};
use thiserror::Error;
use tokio::{
    sync::{watch, RwLock},
    task::JoinHandle,
};

use crate::{
    state::{next_status, InvalidTransition, StartKind, Transition},
    timeouts::with_timeout,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub user_id: UserId,
    pub status: SessionStatus,
    pub pairing_artifact: Option<String>,
    pub has_client: bool,
    pub generation: u64,
    pub last_error: Option<String>,
}

struct SessionEntry {
    status: SessionStatus,
    pairing_artifact: Option<String>,
    client: Option<Arc<dyn ChatClient>>,
    generation: u64,
    event_task: Option<JoinHandle<()>>,
    last_error: Option<String>,
}

impl SessionEntry {
    fn new(status: SessionStatus, generation: u64) -> Self {
        Self {
            status,
            pairing_artifact: None,
            client: None,
            generation,
            event_task: None,
            last_error: None,
        }
    }

    fn release(&mut self) -> Released {
        Released {
            client: self.client.take(),
            event_task: self.event_task.take(),
        }
    }

    fn view(&self, user_id: &UserId) -> SessionView {
        SessionView {
            user_id: user_id.clone(),
            status: self.status,
            pairing_artifact: self.pairing_artifact.clone(),
            has_client: self.client.is_some(),
            generation: self.generation,
            last_error: self.last_error.clone(),
        }
    }
}

/// Client and event task detached from the registry. The caller owns their
/// teardown.
#[derive(Default)]
pub struct Released {
    pub client: Option<Arc<dyn ChatClient>>,
    pub event_task: Option<JoinHandle<()>>,
}

pub struct Applied {
    pub status: SessionStatus,
    pub released: Option<Released>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error("no session registered for user {0}")]
    UnknownSession(UserId),
    #[error("event from superseded client generation {stale} (current {current})")]
    Stale { stale: u64, current: u64 },
    #[error(transparent)]
    Invalid(#[from] InvalidTransition),
}

/// In-memory map of per-user sessions.
///
/// Every write goes through [`SessionRegistry::start`],
/// [`SessionRegistry::apply`] or removal, so status and pairing artifact
/// always change together. Each installed client gets a fresh generation and
/// writes tagged with an older generation are rejected.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<UserId, SessionEntry>>,
    next_generation: AtomicU64,
    changes: watch::Sender<u64>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            changes,
        }
    }

    pub async fn get(&self, user_id: &UserId) -> Option<SessionView> {
        self.sessions
            .read()
            .await
            .get(user_id)
            .map(|entry| entry.view(user_id))
    }

    pub async fn status(&self, user_id: &UserId) -> SessionStatus {
        self.sessions
            .read()
            .await
            .get(user_id)
            .map_or(SessionStatus::NotInitialized, |entry| entry.status)
    }

    pub async fn client_handle(&self, user_id: &UserId) -> Option<Arc<dyn ChatClient>> {
        self.sessions
            .read()
            .await
            .get(user_id)
            .and_then(|entry| entry.client.clone())
    }

    pub async fn user_ids(&self) -> Vec<UserId> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Opens a new generation for `user_id`, replacing an absent or terminal
    /// entry. Whatever the replaced entry still held is handed back.
    pub async fn start(
        &self,
        user_id: &UserId,
        kind: StartKind,
    ) -> Result<(u64, Released), ApplyError> {
        let released = {
            let mut sessions = self.sessions.write().await;
            let current = sessions
                .get(user_id)
                .map_or(SessionStatus::NotInitialized, |entry| entry.status);
            let status = next_status(current, &Transition::Start(kind))?;
            let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
            let previous = sessions.insert(user_id.clone(), SessionEntry::new(status, generation));
            (
                generation,
                previous.map(|mut entry| entry.release()).unwrap_or_default(),
            )
        };
        self.notify();
        Ok(released)
    }

    /// Installs the client for `generation`. If that generation has been
    /// superseded or removed meanwhile, the client and task are handed back.
    pub async fn attach_client(
        &self,
        user_id: &UserId,
        generation: u64,
        client: Arc<dyn ChatClient>,
        event_task: JoinHandle<()>,
    ) -> Result<(), Released> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(user_id) {
            Some(entry) if entry.generation == generation && !entry.status.is_terminal() => {
                entry.client = Some(client);
                entry.event_task = Some(event_task);
                Ok(())
            }
            _ => Err(Released {
                client: Some(client),
                event_task: Some(event_task),
            }),
        }
    }

    /// Single mutation entry point for status changes.
    pub async fn apply(
        &self,
        user_id: &UserId,
        generation: u64,
        transition: Transition,
    ) -> Result<Applied, ApplyError> {
        let applied = {
            let mut sessions = self.sessions.write().await;
            let entry = sessions
                .get_mut(user_id)
                .ok_or_else(|| ApplyError::UnknownSession(user_id.clone()))?;
            if entry.generation != generation {
                return Err(ApplyError::Stale {
                    stale: generation,
                    current: entry.generation,
                });
            }

            let status = next_status(entry.status, &transition)?;
            entry.status = status;
            match transition {
                Transition::PairingIssued(code) => entry.pairing_artifact = Some(code),
                Transition::AuthFailed(reason) | Transition::Disconnected(reason) => {
                    entry.last_error = Some(reason);
                }
                _ => {}
            }
            if status != SessionStatus::QrReady {
                entry.pairing_artifact = None;
            }

            Applied {
                status,
                released: status.is_terminal().then(|| entry.release()),
            }
        };
        self.notify();
        Ok(applied)
    }

    /// Removes the entry only if it still belongs to `generation`.
    pub async fn discard(&self, user_id: &UserId, generation: u64) -> Option<Released> {
        let released = {
            let mut sessions = self.sessions.write().await;
            if sessions.get(user_id)?.generation != generation {
                return None;
            }
            sessions.remove(user_id).map(|mut entry| entry.release())
        };
        self.notify();
        released
    }

    pub async fn remove(&self, user_id: &UserId) -> Option<Released> {
        let released = self
            .sessions
            .write()
            .await
            .remove(user_id)
            .map(|mut entry| entry.release());
        if released.is_some() {
            self.notify();
        }
        released
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Waits up to `within` for the status of `user_id` to satisfy
    /// `predicate`, returning the last status observed either way.
    pub async fn wait_for<P>(&self, user_id: &UserId, within: Duration, predicate: P) -> SessionStatus
    where
        P: Fn(SessionStatus) -> bool,
    {
        let mut changes = self.subscribe();
        let waited = with_timeout("session status wait", within, async {
            loop {
                let status = self.status(user_id).await;
                if predicate(status) || changes.changed().await.is_err() {
                    return status;
                }
            }
        })
        .await;

        match waited {
            Ok(status) => status,
            Err(_) => self.status(user_id).await,
        }
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
