use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::api::{ApiRequest, AuthenticatedRequestExecutor};
use crate::auth::AuthError;

pub const USER_INFO_PATH: &str = "user/info";

/// Profile of the signed-in user as reported by the API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    #[serde(default)]
    pub nombre: Option<String>,
    #[serde(default)]
    pub apellido_paterno: Option<String>,
    #[serde(default)]
    pub apellido_materno: Option<String>,
    #[serde(default, alias = "correo")]
    pub email: Option<String>,
    #[serde(default)]
    pub telefono: Option<String>,
    #[serde(default)]
    pub genero: Option<String>,
    #[serde(default, alias = "rol")]
    pub role: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserInfo {
    pub fn full_name(&self) -> Option<String> {
        let parts: Vec<&str> = [&self.nombre, &self.apellido_paterno, &self.apellido_materno]
            .into_iter()
            .filter_map(|part| part.as_deref())
            .filter(|part| !part.is_empty())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

#[derive(Clone)]
pub struct ProfileService {
    executor: AuthenticatedRequestExecutor,
}

impl ProfileService {
    pub fn new(executor: AuthenticatedRequestExecutor) -> Self {
        Self { executor }
    }

    pub async fn user_info(&self) -> Result<UserInfo, AuthError> {
        self.executor
            .execute_json(&ApiRequest::get(USER_INFO_PATH))
            .await
    }
}
