//! Origin-bound message tokens attached to outgoing sends.
//!
//! Creating and validating tokens is the provider's business; this module only
//! carries them. On the wire a token travels twice: base64(JSON) in the
//! [`MESSAGE_TOKEN_HEADER`] header and as plain JSON in the body under
//! [`MESSAGE_TOKEN_FIELD`].

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tower::BoxError;

pub const MESSAGE_TOKEN_HEADER: &str = "x-message-token";
pub const MESSAGE_TOKEN_FIELD: &str = "_messageToken";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageToken {
    pub salt: String,
    pub hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cave_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tome_id: Option<String>,
    /// Epoch millis
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

/// Supplies a token per send. `Ok(None)` sends without one.
pub trait MessageTokenProvider: Send + Sync {
    fn token(&self) -> Result<Option<MessageToken>, BoxError>;
}

impl<F> MessageTokenProvider for F
where
    F: Fn() -> Result<Option<MessageToken>, BoxError> + Send + Sync,
{
    fn token(&self) -> Result<Option<MessageToken>, BoxError> {
        self()
    }
}

pub fn serialize_token(token: &MessageToken) -> Result<String, serde_json::Error> {
    let json = serde_json::to_vec(token)?;
    Ok(STANDARD.encode(json))
}

/// Inverse of [`serialize_token`]; `None` for anything malformed.
pub fn parse_token(serialized: &str) -> Option<MessageToken> {
    let bytes = STANDARD.decode(serialized.trim()).ok()?;
    serde_json::from_slice(&bytes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> MessageToken {
        MessageToken {
            salt: "c2FsdA".into(),
            hash: "abc123".into(),
            origin_id: Some("https://app.example".into()),
            cave_id: None,
            tome_id: Some("orders".into()),
            expires_at: Some(1_700_000_000_000),
        }
    }

    #[test]
    fn header_value_parses_back() {
        let header = serialize_token(&token()).unwrap();
        assert_eq!(parse_token(&header), Some(token()));
    }

    #[test]
    fn body_form_uses_camel_case_and_skips_missing() {
        let json = serde_json::to_value(token()).unwrap();
        assert_eq!(json["originId"], "https://app.example");
        assert_eq!(json["tomeId"], "orders");
        assert!(json.get("caveId").is_none());
    }

    #[test]
    fn malformed_input_is_none() {
        assert_eq!(parse_token("not base64!"), None);
        assert_eq!(parse_token(&STANDARD.encode(b"{\"salt\":1}")), None);
    }

    #[test]
    fn closures_are_providers() {
        let provider = || -> Result<Option<MessageToken>, BoxError> { Ok(Some(token())) };
        assert_eq!(provider.token().unwrap().unwrap().tome_id.as_deref(), Some("orders"));

        let failing = || Err::<Option<MessageToken>, BoxError>("vault sealed".into());
        assert!(failing.token().is_err());
    }
}
