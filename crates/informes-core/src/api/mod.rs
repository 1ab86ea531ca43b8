//! Authenticated access to the rest of the API.

mod executor;
pub(crate) mod response;

pub use executor::{ApiRequest, AuthenticatedRequestExecutor};
