use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{AuthClient, AuthError, Credential, RefreshFailure, SessionStore};

type PendingRefresh = Shared<BoxFuture<'static, Result<Credential, RefreshFailure>>>;

/// Renews the credential held by a [`SessionStore`], with at most one renewal in flight.
///
/// Callers arriving while a renewal is running await that same renewal and
/// receive the same outcome. The renewal runs on its own task, so it finishes
/// and writes its result back even if every caller stops waiting.
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<SessionStore>,
    client: AuthClient,
    pending: Mutex<Option<PendingRefresh>>,
}

impl RefreshCoordinator {
    pub fn new(store: Arc<SessionStore>, client: AuthClient) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                client,
                pending: Mutex::new(None),
            }),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.inner.store
    }

    /// Whether a renewal is currently in flight.
    pub fn is_refreshing(&self) -> bool {
        self.inner.pending.lock().is_some()
    }

    pub async fn refresh(&self) -> Result<Credential, RefreshFailure> {
        let pending = {
            let mut slot = self.inner.pending.lock();
            match slot.as_ref() {
                Some(pending) => {
                    debug!("joining in-flight credential renewal");
                    pending.clone()
                }
                None => {
                    let session = self.inner.store.get();
                    let refresh_token = match session.credential() {
                        Some(credential) if !credential.refresh_token.is_empty() => {
                            credential.refresh_token.clone()
                        }
                        _ => {
                            drop(slot);
                            warn!("no refresh token available; ending session");
                            self.inner.store.clear();
                            return Err(RefreshFailure::MissingRefreshToken);
                        }
                    };

                    let inner = Arc::clone(&self.inner);
                    let epoch = session.epoch();
                    let task =
                        tokio::spawn(async move { inner.perform(epoch, refresh_token).await });
                    let pending = async move {
                        match task.await {
                            Ok(outcome) => outcome,
                            Err(_) => Err(RefreshFailure::Aborted),
                        }
                    }
                    .boxed()
                    .shared();
                    *slot = Some(pending.clone());
                    pending
                }
            }
        };
        pending.await
    }
}

/// Empties the pending slot when a renewal ends, including by panic or abort.
struct ClearPending<'a>(&'a Mutex<Option<PendingRefresh>>);

impl Drop for ClearPending<'_> {
    fn drop(&mut self) {
        self.0.lock().take();
    }
}

impl Inner {
    async fn perform(&self, epoch: u64, refresh_token: String) -> Result<Credential, RefreshFailure> {
        let _clear = ClearPending(&self.pending);
        self.renew(epoch, refresh_token).await
    }

    async fn renew(&self, epoch: u64, refresh_token: String) -> Result<Credential, RefreshFailure> {
        if !self.store.mark_refreshing_if_current(epoch) {
            debug!(epoch, "session replaced before renewal started");
            return Err(RefreshFailure::Superseded);
        }
        debug!(epoch, "renewing access token");

        let tokens = match self.client.refresh(&refresh_token).await {
            Ok(tokens) => tokens,
            Err(failure) => return Err(self.fail(epoch, failure)),
        };

        let credential = Credential::new(
            tokens.access_token,
            tokens.refresh_token.unwrap_or(refresh_token),
        );

        match self.store.set_if_current(epoch, credential.clone()) {
            Ok(Some(_)) => {
                info!("access token renewed");
                Ok(credential)
            }
            Ok(None) => {
                debug!(epoch, "discarding renewal for superseded session");
                Err(RefreshFailure::Superseded)
            }
            Err(AuthError::Decode(err)) => Err(self.fail(epoch, RefreshFailure::Decode(err))),
            Err(err) => Err(self.fail(epoch, RefreshFailure::Storage(err.to_string()))),
        }
    }

    fn fail(&self, epoch: u64, failure: RefreshFailure) -> RefreshFailure {
        warn!(error = %failure, "credential renewal failed; ending session");
        self.store.clear_if_current(epoch);
        failure
    }
}
