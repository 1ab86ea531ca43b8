use url::Url;

use super::AuthError;

/// Outcome carried back by the federated provider's redirect.
#[derive(Clone, PartialEq, Eq)]
pub enum FederatedPayload {
    Error(String),
    Tokens {
        access_token: String,
        refresh_token: String,
    },
}

impl FederatedPayload {
    /// Read `token`, `refreshToken` and `error` from the redirect query string.
    pub fn from_redirect(redirect: &Url) -> Result<Self, AuthError> {
        let mut access_token = None;
        let mut refresh_token = None;
        let mut error = None;
        for (key, value) in redirect.query_pairs() {
            match key.as_ref() {
                "token" => access_token = Some(value.into_owned()),
                "refreshToken" => refresh_token = Some(value.into_owned()),
                "error" => error = Some(value.into_owned()),
                _ => {}
            }
        }

        if let Some(message) = error {
            return Ok(FederatedPayload::Error(message));
        }
        match (access_token, refresh_token) {
            (Some(access_token), Some(refresh_token))
                if !access_token.is_empty() && !refresh_token.is_empty() =>
            {
                Ok(FederatedPayload::Tokens {
                    access_token,
                    refresh_token,
                })
            }
            _ => Err(AuthError::InvalidRedirect(
                "redirect carries neither an error nor both tokens".into(),
            )),
        }
    }
}

impl std::fmt::Debug for FederatedPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FederatedPayload::Error(message) => f.debug_tuple("Error").field(message).finish(),
            FederatedPayload::Tokens { .. } => f.debug_struct("Tokens").finish_non_exhaustive(),
        }
    }
}
