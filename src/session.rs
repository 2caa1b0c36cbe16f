//! Session data model shared by the store, the backends and the gate.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Application-defined claims carried in the access token.
///
/// A flat mapping of string keys to arbitrary JSON values. Updates always
/// replace the whole mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JwtPayload(Map<String, Value>);

impl JwtPayload {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Builder-style insert, used when constructing a payload from scratch.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    pub fn to_json_string(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }

    /// Parse a JSON object. Anything other than an object is rejected.
    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl From<Map<String, Value>> for JwtPayload {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// A logical session as seen by application code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    /// Backend-assigned opaque id, stable across token rotations.
    pub session_handle: String,
    pub payload: JwtPayload,
}

/// Tokens issued together by a create or refresh operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub id_refresh_token: String,
    pub anti_csrf_token: Option<String>,
}

/// Token components found on an inbound request. Any of them may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresentedTokens {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub id_refresh_token: Option<String>,
    pub anti_csrf_token: Option<String>,
}

impl From<&TokenPair> for PresentedTokens {
    fn from(pair: &TokenPair) -> Self {
        Self {
            access_token: Some(pair.access_token.clone()),
            refresh_token: Some(pair.refresh_token.clone()),
            id_refresh_token: Some(pair.id_refresh_token.clone()),
            anti_csrf_token: pair.anti_csrf_token.clone(),
        }
    }
}

/// Result of a backend create or refresh: the new pair and the session it belongs to.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub tokens: TokenPair,
    pub session: Session,
}

/// Result of a payload update: the synchronized session and an access token
/// re-issued with the new payload.
#[derive(Debug, Clone)]
pub struct PayloadUpdate {
    pub session: Session,
    pub access_token: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_serializes_as_flat_object() {
        let payload = JwtPayload::new().with("role", "admin").with("count", 3);
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value, json!({ "role": "admin", "count": 3 }));
    }

    #[test]
    fn test_payload_rejects_non_object() {
        assert!(JwtPayload::from_json_str("[1, 2]").is_err());
        assert!(JwtPayload::from_json_str("{}").unwrap().is_empty());
    }

    #[test]
    fn test_presented_from_pair() {
        let pair = TokenPair {
            access_token: "a".into(),
            refresh_token: "r".into(),
            id_refresh_token: "i".into(),
            anti_csrf_token: None,
        };
        let presented = PresentedTokens::from(&pair);
        assert_eq!(presented.access_token.as_deref(), Some("a"));
        assert_eq!(presented.refresh_token.as_deref(), Some("r"));
        assert_eq!(presented.id_refresh_token.as_deref(), Some("i"));
        assert!(presented.anti_csrf_token.is_none());
    }
}
