use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

use crate::api::response::{failure_message, server_message};
use crate::config::ClientConfig;

use super::{AuthError, Credential, RefreshFailure};

const USER_AGENT: &str = "informes/0.1.0";
const LOGIN_FALLBACK_MESSAGE: &str = "Error en login";

pub const LOGIN_PATH: &str = "auth/login";
pub const REFRESH_PATH: &str = "auth/refresh";
pub const REGISTER_PATH: &str = "auth/register";
pub const FORGOT_PASSWORD_PATH: &str = "auth/forgot-password";
pub const VERIFY_RESET_TOKEN_PATH: &str = "auth/verify-reset-token";
pub const RESET_PASSWORD_PATH: &str = "auth/reset-password";
pub const FEDERATED_AUTHORIZATION_PATH: &str = "oauth2/authorization";

/// Tokens returned by the renewal endpoint. The refresh token is only present when rotated.
#[derive(Clone)]
pub struct RefreshedTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

impl std::fmt::Debug for RefreshedTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshedTokens")
            .field("rotated", &self.refresh_token.is_some())
            .finish_non_exhaustive()
    }
}

/// Account sign-up payload.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub nombre: String,
    pub apellido_paterno: String,
    pub apellido_materno: String,
    pub email: String,
    pub telefono: String,
    pub genero: String,
    pub password: String,
    pub confirm_password: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    #[serde(rename = "refreshToken")]
    refresh_token: Option<String>,
}

/// Calls the unauthenticated `/auth/*` endpoints of the API.
#[derive(Debug, Clone)]
pub struct AuthClient {
    http: Client,
    config: ClientConfig,
}

impl AuthClient {
    pub fn new(config: ClientConfig) -> Result<Self, AuthError> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Shared connection pool; cloning is cheap.
    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Exchange an email/password pair for a credential.
    pub async fn login(&self, email: &str, password: &str) -> Result<Credential, AuthError> {
        let response = self
            .http
            .post(self.config.endpoint(LOGIN_PATH)?)
            .json(&json!({ "email": email, "password": password }))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            let message =
                server_message(&body).unwrap_or_else(|| LOGIN_FALLBACK_MESSAGE.to_owned());
            return Err(AuthError::Api { status, message });
        }

        let payload: TokenResponse = serde_json::from_str(&body)?;
        let access_token = payload
            .token
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::IncompleteResponse("token"))?;
        let refresh_token = payload
            .refresh_token
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::IncompleteResponse("refreshToken"))?;
        Ok(Credential::new(access_token, refresh_token))
    }

    /// Submit a refresh token to the renewal endpoint.
    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshedTokens, RefreshFailure> {
        let url = self
            .config
            .endpoint(REFRESH_PATH)
            .map_err(|err| RefreshFailure::Transport(err.to_string()))?;
        let response = self
            .http
            .post(url)
            .json(&json!({ "refreshToken": refresh_token }))
            .send()
            .await
            .map_err(|err| RefreshFailure::Transport(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| RefreshFailure::Transport(err.to_string()))?;
        if !status.is_success() {
            return Err(RefreshFailure::Rejected {
                status: status.as_u16(),
                message: failure_message(status, &body),
            });
        }

        let payload: TokenResponse =
            serde_json::from_str(&body).map_err(|_| RefreshFailure::IncompletePayload)?;
        let access_token = payload
            .token
            .filter(|token| !token.is_empty())
            .ok_or(RefreshFailure::IncompletePayload)?;
        Ok(RefreshedTokens {
            access_token,
            refresh_token: payload.refresh_token.filter(|token| !token.is_empty()),
        })
    }

    /// Where to send the browser to start a federated login with `provider` (e.g. `google`).
    pub fn federated_login_url(&self, provider: &str) -> Result<Url, AuthError> {
        Ok(self
            .config
            .endpoint(&format!("{FEDERATED_AUTHORIZATION_PATH}/{provider}"))?)
    }

    pub async fn register(&self, request: &RegistrationRequest) -> Result<String, AuthError> {
        self.post_for_message(REGISTER_PATH, request).await
    }

    pub async fn forgot_password(&self, email: &str) -> Result<String, AuthError> {
        self.post_for_message(FORGOT_PASSWORD_PATH, &json!({ "email": email }))
            .await
    }

    pub async fn verify_reset_token(&self, token: &str) -> Result<String, AuthError> {
        self.post_for_message(VERIFY_RESET_TOKEN_PATH, &json!({ "token": token }))
            .await
    }

    pub async fn reset_password(&self, token: &str, new_password: &str) -> Result<String, AuthError> {
        self.post_for_message(
            RESET_PASSWORD_PATH,
            &json!({ "token": token, "newPassword": new_password }),
        )
        .await
    }

    async fn post_for_message<T>(&self, path: &str, body: &T) -> Result<String, AuthError>
    where
        T: Serialize + ?Sized,
    {
        let response = self
            .http
            .post(self.config.endpoint(path)?)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(AuthError::Api {
                status,
                message: failure_message(status, &text),
            });
        }
        Ok(server_message(&text).unwrap_or_else(|| default_success_message(status)))
    }
}

fn default_success_message(status: StatusCode) -> String {
    status
        .canonical_reason()
        .unwrap_or("OK")
        .to_owned()
}
