use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::auth::{AuthClient, AuthError, RefreshCoordinator, RefreshFailure};
use crate::config::ClientConfig;

use super::response::{failure_message, parse_body};

/// A call to the API, relative to the configured base URL unless `path` is absolute.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    body: Option<Value>,
    query: Vec<(String, String)>,
    headers: HeaderMap,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            query: Vec::new(),
            headers: HeaderMap::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn serialized<T: Serialize + ?Sized>(self, body: &T) -> Result<Self, AuthError> {
        Ok(self.json(serde_json::to_value(body)?))
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Extra header; replaces the default of the same name.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Sends requests with the session's bearer token, renewing it when it is
/// missing, expired, or rejected by the server.
#[derive(Clone)]
pub struct AuthenticatedRequestExecutor {
    http: Client,
    config: ClientConfig,
    coordinator: RefreshCoordinator,
}

impl AuthenticatedRequestExecutor {
    pub fn new(client: &AuthClient, coordinator: RefreshCoordinator) -> Self {
        Self {
            http: client.http().clone(),
            config: client.config().clone(),
            coordinator,
        }
    }

    pub async fn execute(&self, request: &ApiRequest) -> Result<Value, AuthError> {
        let url = self.config.endpoint(&request.path)?;
        let token = self.current_token().await?;

        let response = self.send(&url, request, &token).await?;
        if !is_auth_failure(response.status()) {
            return finish(response).await;
        }

        debug!(status = %response.status(), path = %request.path, "request rejected; renewing and retrying once");
        let token = self.renew().await?;
        let retry = self.send(&url, request, &token).await?;
        if is_auth_failure(retry.status()) {
            warn!(status = %retry.status(), path = %request.path, "renewed credential rejected; ending session");
            self.coordinator.store().clear();
            return Err(AuthError::SessionExpired);
        }
        finish(retry).await
    }

    pub async fn execute_json<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T, AuthError> {
        let value = self.execute(request).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn current_token(&self) -> Result<String, AuthError> {
        let session = self.coordinator.store().get();
        match session.active() {
            Some(active) if !active.claims.is_expired() => {
                Ok(active.credential.access_token.clone())
            }
            _ => {
                debug!("no usable access token; renewing before the request");
                self.renew().await
            }
        }
    }

    async fn renew(&self) -> Result<String, AuthError> {
        let epoch = self.coordinator.store().epoch();
        match self.coordinator.refresh().await {
            Ok(credential) => Ok(credential.access_token),
            Err(failure) => {
                if failure != RefreshFailure::Superseded {
                    self.coordinator.store().clear_if_current(epoch);
                }
                warn!(error = %failure, "could not renew credential for request");
                Err(AuthError::SessionExpired)
            }
        }
    }

    async fn send(
        &self,
        url: &Url,
        request: &ApiRequest,
        token: &str,
    ) -> Result<Response, AuthError> {
        debug!(method = %request.method, path = %request.path, "sending authenticated request");
        let mut builder = self
            .http
            .request(request.method.clone(), url.clone())
            .bearer_auth(token)
            .header(CONTENT_TYPE, "application/json")
            .headers(request.headers.clone());
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        Ok(builder.send().await?)
    }
}

fn is_auth_failure(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

async fn finish(response: Response) -> Result<Value, AuthError> {
    let status = response.status();
    let body = response.text().await?;
    if status.is_success() {
        Ok(parse_body(&body))
    } else {
        Err(AuthError::Api {
            status,
            message: failure_message(status, &body),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::token::testing::token_expiring_in;
    use crate::auth::{Credential, MemoryKeyValueStore, SessionStatus, SessionStore};
    use httpmock::prelude::*;
    use std::sync::Arc;

    struct Harness {
        executor: AuthenticatedRequestExecutor,
        store: Arc<SessionStore>,
        storage: MemoryKeyValueStore,
    }

    fn harness(server: &MockServer) -> Harness {
        let storage = MemoryKeyValueStore::new();
        let store = Arc::new(SessionStore::new(storage.clone()));
        let config = ClientConfig::new(Url::parse(&server.base_url()).unwrap());
        let client = AuthClient::new(config).unwrap();
        let coordinator = RefreshCoordinator::new(Arc::clone(&store), client.clone());
        Harness {
            executor: AuthenticatedRequestExecutor::new(&client, coordinator),
            store,
            storage,
        }
    }

    #[tokio::test]
    async fn renews_expired_token_before_first_request() {
        let server = MockServer::start();
        let fresh = token_expiring_in("ana", "USER", 3600);
        let refresh = server.mock(|when, then| {
            when.method(POST).path("/auth/refresh");
            then.status(200)
                .json_body_obj(&serde_json::json!({ "token": fresh, "refreshToken": "r2" }));
        });
        let info = server.mock(|when, then| {
            when.method(GET)
                .path("/user/info")
                .header("authorization", format!("Bearer {fresh}"));
            then.status(200)
                .json_body_obj(&serde_json::json!({ "email": "ana@ine.mx" }));
        });

        let harness = harness(&server);
        harness
            .store
            .set(Credential::new(token_expiring_in("ana", "USER", -10), "r1"))
            .unwrap();

        let body = harness
            .executor
            .execute(&ApiRequest::get("user/info"))
            .await
            .unwrap();
        assert_eq!(body["email"], "ana@ine.mx");
        refresh.assert_hits(1);
        info.assert_hits(1);
    }

    #[tokio::test]
    async fn retries_once_with_renewed_token() {
        let server = MockServer::start();
        let stale = token_expiring_in("ana", "USER", 3600);
        let fresh = token_expiring_in("ana", "ADMIN", 7200);
        server.mock(|when, then| {
            when.method(POST).path("/auth/refresh");
            then.status(200)
                .json_body_obj(&serde_json::json!({ "token": fresh }));
        });
        let rejected = server.mock(|when, then| {
            when.method(POST)
                .path("/reportes")
                .header("authorization", format!("Bearer {stale}"));
            then.status(401);
        });
        let accepted = server.mock(|when, then| {
            when.method(POST)
                .path("/reportes")
                .header("authorization", format!("Bearer {fresh}"))
                .json_body_obj(&serde_json::json!({ "titulo": "Mensual" }));
            then.status(201).json_body_obj(&serde_json::json!({ "id": 7 }));
        });

        let harness = harness(&server);
        harness.store.set(Credential::new(stale, "r1")).unwrap();

        let request = ApiRequest::post("reportes").json(serde_json::json!({ "titulo": "Mensual" }));
        let body = harness.executor.execute(&request).await.unwrap();
        assert_eq!(body["id"], 7);
        rejected.assert_hits(1);
        accepted.assert_hits(1);
        assert_eq!(harness.store.get().claims().unwrap().role, "ADMIN");
    }

    #[tokio::test]
    async fn second_rejection_expires_session() {
        let server = MockServer::start();
        let refresh = server.mock(|when, then| {
            when.method(POST).path("/auth/refresh");
            then.status(200).json_body_obj(
                &serde_json::json!({ "token": token_expiring_in("ana", "USER", 3600) }),
            );
        });
        let forbidden = server.mock(|when, then| {
            when.method(GET).path("/admin/usuarios");
            then.status(403);
        });

        let harness = harness(&server);
        harness
            .store
            .set(Credential::new(token_expiring_in("ana", "USER", 3600), "r1"))
            .unwrap();

        let err = harness
            .executor
            .execute(&ApiRequest::get("admin/usuarios"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::SessionExpired));
        assert_eq!(
            err.to_string(),
            "Sesión expirada. Por favor inicia sesión nuevamente."
        );
        forbidden.assert_hits(2);
        refresh.assert_hits(1);
        assert_eq!(harness.store.get().status(), SessionStatus::Unauthenticated);
        assert!(harness.storage.is_empty());
    }

    #[tokio::test]
    async fn failed_renewal_expires_session_without_request() {
        let server = MockServer::start();
        let refresh = server.mock(|when, then| {
            when.method(POST).path("/auth/refresh");
            then.status(401)
                .json_body_obj(&serde_json::json!({ "mensaje": "Refresh token expirado" }));
        });
        let endpoint = server.mock(|when, then| {
            when.method(GET).path("/reportes");
            then.status(200);
        });

        let harness = harness(&server);
        harness
            .store
            .set(Credential::new(token_expiring_in("ana", "USER", -5), "r1"))
            .unwrap();

        let err = harness
            .executor
            .execute(&ApiRequest::get("reportes"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::SessionExpired));
        refresh.assert_hits(1);
        endpoint.assert_hits(0);
        assert!(harness.store.get().credential().is_none());
    }

    #[tokio::test]
    async fn normalizes_error_bodies() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/reportes/99");
            then.status(404)
                .json_body_obj(&serde_json::json!({ "mensaje": "Reporte no encontrado" }));
        });
        server.mock(|when, then| {
            when.method(DELETE).path("/reportes/1");
            then.status(500);
        });

        let harness = harness(&server);
        harness
            .store
            .set(Credential::new(token_expiring_in("ana", "USER", 3600), "r1"))
            .unwrap();

        match harness
            .executor
            .execute(&ApiRequest::get("reportes/99"))
            .await
            .unwrap_err()
        {
            AuthError::Api { status, message } => {
                assert_eq!(status, StatusCode::NOT_FOUND);
                assert_eq!(message, "Reporte no encontrado");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let err = harness
            .executor
            .execute(&ApiRequest::delete("reportes/1"))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "request failed with status 500 Internal Server Error"
        );
        assert!(harness.store.get().is_authenticated());
    }

    #[tokio::test]
    async fn empty_success_body_is_null() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(PUT)
                .path("/reportes/1")
                .query_param("notificar", "true");
            then.status(204);
        });

        let harness = harness(&server);
        harness
            .store
            .set(Credential::new(token_expiring_in("ana", "USER", 3600), "r1"))
            .unwrap();

        let request = ApiRequest::put("reportes/1").query("notificar", "true");
        let body = harness.executor.execute(&request).await.unwrap();
        assert_eq!(body, Value::Null);
        mock.assert();
    }
}
