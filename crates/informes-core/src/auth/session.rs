use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, warn};

use super::key_value_store::{ACCESS_TOKEN_SLOT, REFRESH_TOKEN_SLOT};
use super::token::{self, Claims, Credential};
use super::{AuthError, KeyValueStore};

/// Where the session stands in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Unauthenticated,
    Authenticated,
    Refreshing,
}

/// A credential pair together with the claims decoded from its access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveCredential {
    pub credential: Credential,
    pub claims: Claims,
}

/// Snapshot of the session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    status: SessionStatus,
    active: Option<ActiveCredential>,
    last_error: Option<String>,
    epoch: u64,
    revision: u64,
}

impl Session {
    fn empty() -> Self {
        Self {
            status: SessionStatus::Unauthenticated,
            active: None,
            last_error: None,
            epoch: 0,
            revision: 0,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_authenticated(&self) -> bool {
        self.status == SessionStatus::Authenticated
    }

    pub fn active(&self) -> Option<&ActiveCredential> {
        self.active.as_ref()
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.active.as_ref().map(|active| &active.credential)
    }

    pub fn claims(&self) -> Option<&Claims> {
        self.active.as_ref().map(|active| &active.claims)
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Advances whenever the credential is replaced or cleared.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Advances on every state transition, including error and status changes.
    pub fn revision(&self) -> u64 {
        self.revision
    }
}

/// Result of reading persisted slots at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// Nothing usable was stored.
    Empty,
    /// A non-expired credential was restored; the session is authenticated.
    Active,
    /// The stored access token has lapsed; the pair is held until it is renewed.
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&Session) + Send + Sync>;

/// Single owner of the session: in-memory state plus the persisted credential slots.
pub struct SessionStore {
    storage: Box<dyn KeyValueStore>,
    state: RwLock<Session>,
    // Keeps storage writes and the in-memory update of one mutation together.
    mutation: Mutex<()>,
    listeners: Mutex<Vec<(SubscriptionId, Listener)>>,
    next_subscription: AtomicU64,
}

impl SessionStore {
    pub fn new<S>(storage: S) -> Self
    where
        S: KeyValueStore + 'static,
    {
        Self {
            storage: Box::new(storage),
            state: RwLock::new(Session::empty()),
            mutation: Mutex::new(()),
            listeners: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    pub fn get(&self) -> Session {
        self.state.read().clone()
    }

    pub fn epoch(&self) -> u64 {
        self.state.read().epoch
    }

    /// Decode and persist a new credential pair, replacing the current session.
    pub fn set(&self, credential: Credential) -> Result<Session, AuthError> {
        let claims = token::decode(&credential.access_token)?;
        let snapshot = {
            let _mutation = self.mutation.lock();
            self.apply_credential(credential, claims)?
        };
        self.after_replace(&snapshot);
        Ok(snapshot)
    }

    /// Like [`SessionStore::set`], but only while the session epoch still equals `epoch`.
    /// Returns `Ok(None)` when the session was superseded in the meantime.
    pub fn set_if_current(
        &self,
        epoch: u64,
        credential: Credential,
    ) -> Result<Option<Session>, AuthError> {
        let claims = token::decode(&credential.access_token)?;
        let snapshot = {
            let _mutation = self.mutation.lock();
            if self.state.read().epoch != epoch {
                return Ok(None);
            }
            self.apply_credential(credential, claims)?
        };
        self.after_replace(&snapshot);
        Ok(Some(snapshot))
    }

    // Caller holds the mutation lock.
    fn apply_credential(
        &self,
        credential: Credential,
        claims: Claims,
    ) -> Result<Session, AuthError> {
        let previous_access = self.storage.get(ACCESS_TOKEN_SLOT)?;
        self.storage
            .set(ACCESS_TOKEN_SLOT, &credential.access_token)?;
        if let Err(err) = self
            .storage
            .set(REFRESH_TOKEN_SLOT, &credential.refresh_token)
        {
            // Never leave a new access token paired with the old refresh token.
            let rollback = match &previous_access {
                Some(access) => self.storage.set(ACCESS_TOKEN_SLOT, access),
                None => self.storage.remove(ACCESS_TOKEN_SLOT),
            };
            if let Err(rollback_err) = rollback {
                warn!(error = %rollback_err, "failed to roll back persisted access token");
            }
            return Err(err);
        }

        let status = if claims.is_expired_at(Utc::now()) {
            SessionStatus::Unauthenticated
        } else {
            SessionStatus::Authenticated
        };

        let mut state = self.state.write();
        state.status = status;
        state.active = Some(ActiveCredential { credential, claims });
        state.last_error = None;
        state.epoch += 1;
        state.revision += 1;
        Ok(state.clone())
    }

    fn after_replace(&self, snapshot: &Session) {
        debug!(
            status = ?snapshot.status,
            epoch = snapshot.epoch,
            "session credential replaced"
        );
        self.notify(snapshot);
    }

    /// Drop the credential from memory and storage. Storage failures are logged, not returned.
    pub fn clear(&self) -> Session {
        let snapshot = {
            let _mutation = self.mutation.lock();
            self.apply_clear()
        };
        self.after_clear(&snapshot);
        snapshot
    }

    /// Clear only if the session epoch still equals `epoch`.
    pub fn clear_if_current(&self, epoch: u64) -> Option<Session> {
        let snapshot = {
            let _mutation = self.mutation.lock();
            if self.state.read().epoch != epoch {
                return None;
            }
            self.apply_clear()
        };
        self.after_clear(&snapshot);
        Some(snapshot)
    }

    // Caller holds the mutation lock.
    fn apply_clear(&self) -> Session {
        for slot in [ACCESS_TOKEN_SLOT, REFRESH_TOKEN_SLOT] {
            if let Err(err) = self.storage.remove(slot) {
                warn!(slot, error = %err, "failed to remove persisted session slot");
            }
        }

        let mut state = self.state.write();
        state.status = SessionStatus::Unauthenticated;
        state.active = None;
        state.epoch += 1;
        state.revision += 1;
        state.clone()
    }

    fn after_clear(&self, snapshot: &Session) {
        debug!(epoch = snapshot.epoch, "session cleared");
        self.notify(snapshot);
    }

    /// Rehydrate the session from the persisted slots.
    pub fn restore(&self) -> Result<RestoreOutcome, AuthError> {
        let access = self.storage.get(ACCESS_TOKEN_SLOT)?;
        let refresh = self.storage.get(REFRESH_TOKEN_SLOT)?;

        let (access, refresh) = match (access, refresh) {
            (Some(access), Some(refresh)) => (access, refresh),
            (None, None) => return Ok(RestoreOutcome::Empty),
            _ => {
                warn!("discarding incomplete persisted credential");
                self.clear();
                return Ok(RestoreOutcome::Empty);
            }
        };

        match self.set(Credential::new(access, refresh)) {
            Ok(session) if session.is_authenticated() => Ok(RestoreOutcome::Active),
            Ok(_) => Ok(RestoreOutcome::Expired),
            Err(AuthError::Decode(err)) => {
                warn!(error = %err, "discarding undecodable persisted credential");
                self.clear();
                Ok(RestoreOutcome::Empty)
            }
            Err(err) => Err(err),
        }
    }

    /// Flag the session as renewing while the session epoch still equals `epoch`.
    /// Returns `false` when the credential was replaced or cleared in the meantime.
    pub fn mark_refreshing_if_current(&self, epoch: u64) -> bool {
        let snapshot = {
            let _mutation = self.mutation.lock();
            let mut state = self.state.write();
            if state.epoch != epoch || state.active.is_none() {
                return false;
            }
            if state.status == SessionStatus::Refreshing {
                return true;
            }
            state.status = SessionStatus::Refreshing;
            state.revision += 1;
            state.clone()
        };
        self.notify(&snapshot);
        true
    }

    pub fn set_error(&self, message: impl Into<String>) -> Session {
        self.update_error(Some(message.into()))
    }

    pub fn clear_error(&self) -> Session {
        self.update_error(None)
    }

    fn update_error(&self, error: Option<String>) -> Session {
        let snapshot = {
            let _mutation = self.mutation.lock();
            let mut state = self.state.write();
            state.last_error = error;
            state.revision += 1;
            state.clone()
        };
        self.notify(&snapshot);
        snapshot
    }

    /// Register a callback invoked after every state transition.
    ///
    /// Callbacks run on the mutating thread once all locks are released, so they
    /// may read or mutate the store. Snapshots can arrive out of order under
    /// concurrent mutation; compare [`Session::revision`] to discard stale ones.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    fn notify(&self, session: &Session) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(session);
        }
    }
}
