mod client;
mod error;
mod federated;
pub(crate) mod key_value_store;
mod manager;
mod refresh;
mod scheduler;
mod session;
pub(crate) mod token;

pub use client::{
    AuthClient, RefreshedTokens, RegistrationRequest, FEDERATED_AUTHORIZATION_PATH,
    FORGOT_PASSWORD_PATH, LOGIN_PATH, REFRESH_PATH, REGISTER_PATH, RESET_PASSWORD_PATH,
    VERIFY_RESET_TOKEN_PATH,
};
pub use error::{AuthError, DecodeError, RefreshFailure};
pub use federated::FederatedPayload;
pub use key_value_store::{
    FileKeyValueStore, KeyValueStore, MemoryKeyValueStore, ACCESS_TOKEN_SLOT, REFRESH_TOKEN_SLOT,
};
pub use manager::SessionManager;
pub use refresh::RefreshCoordinator;
pub use scheduler::{
    plan, AutoRenewalScheduler, RenewalPlan, ScheduledTask, TaskScheduler, TokioScheduler,
};
pub use session::{
    ActiveCredential, RestoreOutcome, Session, SessionStatus, SessionStore, SubscriptionId,
};
pub use token::{decode, Claims, Credential, DEFAULT_ROLE, ROLE_CLAIMS};
