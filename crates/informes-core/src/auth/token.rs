use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::DecodeError;

/// Claim names consulted, in order, for the user's role.
pub const ROLE_CLAIMS: [&str; 3] = ["role", "rol", "roles"];
/// Role assumed when the token carries none of [`ROLE_CLAIMS`].
pub const DEFAULT_ROLE: &str = "USER";

/// Access/refresh token pair issued by the login and refresh endpoints.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
        }
    }
}

// Tokens stay out of logs and panic messages.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .finish()
    }
}

/// Identity attributes carried by an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub subject: String,
    pub role: String,
    pub email: Option<String>,
    /// Expiry as seconds since the Unix epoch.
    pub expires_at: i64,
}

impl Claims {
    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.expires_at, 0).single()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp_millis() >= self.expires_at.saturating_mul(1000)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Time left before expiry; negative once the token has lapsed.
    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Duration {
        Duration::milliseconds(self.expires_at.saturating_mul(1000) - now.timestamp_millis())
    }

    /// Name to show for the signed-in user: the email claim when present, otherwise the subject.
    pub fn display_name(&self) -> &str {
        self.email.as_deref().unwrap_or(&self.subject)
    }
}

/// Decode the claims of a JWT access token.
///
/// The signature is not verified: the client only reads identity and expiry
/// from tokens handed to it by the API.
pub fn decode(token: &str) -> Result<Claims, DecodeError> {
    let segments: Vec<&str> = token.trim().split('.').collect();
    if segments.len() != 3 {
        return Err(DecodeError::Malformed(segments.len()));
    }

    let payload = URL_SAFE_NO_PAD
        .decode(segments[1].trim_end_matches('='))
        .map_err(|err| DecodeError::Base64(err.to_string()))?;
    let value: Value =
        serde_json::from_slice(&payload).map_err(|err| DecodeError::Json(err.to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| DecodeError::Json("payload is not an object".into()))?;

    let subject = object
        .get("sub")
        .and_then(Value::as_str)
        .filter(|sub| !sub.is_empty())
        .ok_or(DecodeError::MissingClaim("sub"))?
        .to_owned();

    let expires_at = object
        .get("exp")
        .and_then(|exp| exp.as_i64().or_else(|| exp.as_f64().map(|secs| secs as i64)))
        .ok_or(DecodeError::MissingClaim("exp"))?;

    let email = object
        .get("email")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned);

    Ok(Claims {
        subject,
        role: extract_role(object),
        email,
        expires_at,
    })
}

fn extract_role(object: &Map<String, Value>) -> String {
    ROLE_CLAIMS
        .iter()
        .filter_map(|name| object.get(*name))
        .find_map(|value| match value {
            Value::String(role) if !role.is_empty() => Some(role.clone()),
            Value::Array(roles) => roles
                .iter()
                .filter_map(Value::as_str)
                .find(|role| !role.is_empty())
                .map(ToOwned::to_owned),
            _ => None,
        })
        .unwrap_or_else(|| DEFAULT_ROLE.to_owned())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub(crate) fn token_from_claims(claims: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(b"signature");
        format!("{header}.{payload}.{signature}")
    }

    /// Token for `sub` with the given role, expiring `seconds` from now (negative for the past).
    pub(crate) fn token_expiring_in(sub: &str, role: &str, seconds: i64) -> String {
        token_from_claims(serde_json::json!({
            "sub": sub,
            "role": role,
            "exp": Utc::now().timestamp() + seconds,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::testing::token_from_claims;
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_embedded_expiry_and_identity() {
        let token = token_from_claims(json!({
            "sub": "ana@ine.mx",
            "email": "ana@ine.mx",
            "role": "ADMIN",
            "exp": 1_900_000_000,
        }));
        let claims = decode(&token).unwrap();
        assert_eq!(claims.expires_at, 1_900_000_000);
        assert_eq!(claims.subject, "ana@ine.mx");
        assert_eq!(claims.role, "ADMIN");
        assert_eq!(claims.display_name(), "ana@ine.mx");
    }

    #[test]
    fn role_falls_back_through_documented_order() {
        let rol = token_from_claims(json!({"sub": "a", "exp": 1, "rol": "VOCAL"}));
        assert_eq!(decode(&rol).unwrap().role, "VOCAL");

        let role_wins = token_from_claims(json!({"sub": "a", "exp": 1, "rol": "VOCAL", "role": "ADMIN"}));
        assert_eq!(decode(&role_wins).unwrap().role, "ADMIN");

        let roles = token_from_claims(json!({"sub": "a", "exp": 1, "roles": ["RRHH", "USER"]}));
        assert_eq!(decode(&roles).unwrap().role, "RRHH");

        let none = token_from_claims(json!({"sub": "a", "exp": 1}));
        assert_eq!(decode(&none).unwrap().role, DEFAULT_ROLE);
    }

    #[test]
    fn malformed_tokens_fail() {
        assert_eq!(decode("not-a-jwt"), Err(DecodeError::Malformed(1)));
        assert!(matches!(decode("a.!!!.c"), Err(DecodeError::Base64(_))));

        let not_json = format!("a.{}.c", URL_SAFE_NO_PAD.encode(b"plain text"));
        assert!(matches!(decode(&not_json), Err(DecodeError::Json(_))));
    }

    #[test]
    fn missing_required_claims_fail() {
        let no_exp = token_from_claims(json!({"sub": "a"}));
        assert_eq!(decode(&no_exp), Err(DecodeError::MissingClaim("exp")));

        let no_sub = token_from_claims(json!({"exp": 10}));
        assert_eq!(decode(&no_sub), Err(DecodeError::MissingClaim("sub")));
    }

    #[test]
    fn expiry_checks_use_milliseconds() {
        let claims = Claims {
            subject: "a".into(),
            role: DEFAULT_ROLE.into(),
            email: None,
            expires_at: 1_000,
        };
        let before = Utc.timestamp_millis_opt(999_999).unwrap();
        let at = Utc.timestamp_millis_opt(1_000_000).unwrap();
        assert!(!claims.is_expired_at(before));
        assert!(claims.is_expired_at(at));
        assert_eq!(claims.time_until_expiry(before), Duration::milliseconds(1));
    }

    #[test]
    fn credential_debug_is_redacted() {
        let credential = Credential::new("secret-access", "secret-refresh");
        let rendered = format!("{credential:?}");
        assert!(!rendered.contains("secret"));
    }
}
