use std::sync::Arc;

use tracing::{info, warn};
use url::Url;

use crate::api::AuthenticatedRequestExecutor;
use crate::config::ClientConfig;

use super::session::SubscriptionId;
use super::{
    AuthClient, AuthError, AutoRenewalScheduler, Credential, FederatedPayload, KeyValueStore,
    RefreshCoordinator, RestoreOutcome, Session, SessionStore, TaskScheduler, TokioScheduler,
};

/// Coordinates login, logout, federated completion, renewal and authenticated requests
/// around one [`SessionStore`].
pub struct SessionManager {
    client: AuthClient,
    store: Arc<SessionStore>,
    coordinator: RefreshCoordinator,
    scheduler: AutoRenewalScheduler,
    executor: AuthenticatedRequestExecutor,
}

impl SessionManager {
    /// Build a manager whose renewal timers run on the current tokio runtime.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<S>(config: ClientConfig, storage: S) -> Result<Self, AuthError>
    where
        S: KeyValueStore + 'static,
    {
        Self::with_task_scheduler(config, storage, Arc::new(TokioScheduler::current()))
    }

    pub fn with_task_scheduler<S>(
        config: ClientConfig,
        storage: S,
        tasks: Arc<dyn TaskScheduler>,
    ) -> Result<Self, AuthError>
    where
        S: KeyValueStore + 'static,
    {
        let lead_time = config.refresh_lead_time;
        let client = AuthClient::new(config)?;
        let store = Arc::new(SessionStore::new(storage));
        let coordinator = RefreshCoordinator::new(Arc::clone(&store), client.clone());
        let scheduler = AutoRenewalScheduler::new(coordinator.clone(), tasks, lead_time);
        scheduler.attach();
        let executor = AuthenticatedRequestExecutor::new(&client, coordinator.clone());
        Ok(Self {
            client,
            store,
            coordinator,
            scheduler,
            executor,
        })
    }

    /// Rehydrate the persisted session. A held credential whose access token
    /// has lapsed is renewed before returning.
    pub async fn start(&self) -> Result<RestoreOutcome, AuthError> {
        let outcome = self.store.restore()?;
        if outcome == RestoreOutcome::Expired {
            info!("stored access token expired; renewing");
            if let Err(failure) = self.coordinator.refresh().await {
                warn!(error = %failure, "could not renew stored session");
            }
        }
        Ok(outcome)
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        match self.client.login(email, password).await {
            Ok(credential) => self.establish(credential),
            Err(err) => {
                warn!(error = %err, "login failed");
                self.store.set_error(err.to_string());
                Err(err)
            }
        }
    }

    pub fn logout(&self) -> Session {
        info!("signing out");
        self.store.clear()
    }

    /// Apply the outcome of a federated login. A provider error signs out any
    /// current session and is recorded as the last error.
    pub fn complete_federated_login(&self, payload: FederatedPayload) -> Result<Session, AuthError> {
        match payload {
            FederatedPayload::Error(message) => {
                warn!(error = %message, "federated login reported an error");
                self.store.clear();
                self.store.set_error(message.clone());
                Err(AuthError::FederatedLogin(message))
            }
            FederatedPayload::Tokens {
                access_token,
                refresh_token,
            } => self.establish(Credential::new(access_token, refresh_token)),
        }
    }

    pub fn complete_federated_redirect(&self, redirect: &Url) -> Result<Session, AuthError> {
        let payload = FederatedPayload::from_redirect(redirect)?;
        self.complete_federated_login(payload)
    }

    pub fn federated_login_url(&self, provider: &str) -> Result<Url, AuthError> {
        self.client.federated_login_url(provider)
    }

    pub fn session(&self) -> Session {
        self.store.get()
    }

    pub fn last_error(&self) -> Option<String> {
        self.store.get().last_error().map(ToOwned::to_owned)
    }

    pub fn clear_error(&self) {
        self.store.clear_error();
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        self.store.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.store.unsubscribe(id)
    }

    pub fn executor(&self) -> &AuthenticatedRequestExecutor {
        &self.executor
    }

    pub fn auth_client(&self) -> &AuthClient {
        &self.client
    }

    pub fn scheduler(&self) -> &AutoRenewalScheduler {
        &self.scheduler
    }

    fn establish(&self, credential: Credential) -> Result<Session, AuthError> {
        match self.store.set(credential) {
            Ok(session) => {
                if let Some(claims) = session.claims() {
                    info!(subject = %claims.subject, role = %claims.role, "signed in");
                }
                Ok(session)
            }
            Err(err) => {
                warn!(error = %err, "rejecting credential issued by the server");
                self.store.set_error(err.to_string());
                Err(err)
            }
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.scheduler.detach();
    }
}
