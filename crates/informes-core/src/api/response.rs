use reqwest::StatusCode;
use serde_json::Value;

/// JSON fields the API uses for human-readable messages, in lookup order.
const MESSAGE_FIELDS: [&str; 3] = ["mensaje", "message", "error"];

/// Pull a human-readable message out of a response body.
pub(crate) fn server_message(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(object)) => MESSAGE_FIELDS
            .iter()
            .filter_map(|field| object.get(*field))
            .filter_map(Value::as_str)
            .map(str::trim)
            .find(|message| !message.is_empty())
            .map(ToOwned::to_owned),
        Ok(Value::String(message)) if !message.trim().is_empty() => Some(message),
        Ok(_) => None,
        Err(_) => Some(trimmed.to_owned()),
    }
}

/// Message for a failed request: the server's own wording when it sent one.
pub(crate) fn failure_message(status: StatusCode, body: &str) -> String {
    server_message(body).unwrap_or_else(|| format!("request failed with status {status}"))
}

/// Parse a success body, treating empty or non-JSON payloads as `null`.
pub(crate) fn parse_body(body: &str) -> Value {
    if body.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(body).unwrap_or(Value::Null)
}
