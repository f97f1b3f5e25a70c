//! Session identity and the `get_user` capability.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("identity provider failed: {0}")]
pub struct IdentityError(pub String);

/// What the editor knows about the local user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: String,
    pub client_id: String,
    /// Opaque to the adapter; forwarded to peers on join.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl UserIdentity {
    pub fn new(user_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            client_id: client_id.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Identity bound to one open session. Never changes while the session lives.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionIdentity {
    pub room_id: String,
    pub user_id: String,
    pub client_id: String,
    pub metadata: serde_json::Value,
}

impl SessionIdentity {
    pub fn new(room_id: impl Into<String>, user: UserIdentity) -> Self {
        Self {
            room_id: room_id.into(),
            user_id: user.user_id,
            client_id: user.client_id,
            metadata: user.metadata,
        }
    }
}

/// Supplies the local user. Called once per `open()`.
pub trait IdentityProvider: Send + Sync {
    fn get_user(&self) -> Result<UserIdentity, IdentityError>;
}

impl<F> IdentityProvider for F
where
    F: Fn() -> Result<UserIdentity, IdentityError> + Send + Sync,
{
    fn get_user(&self) -> Result<UserIdentity, IdentityError> {
        self()
    }
}

/// Always returns the same user.
#[derive(Debug, Clone)]
pub struct StaticIdentity(pub UserIdentity);

impl IdentityProvider for StaticIdentity {
    fn get_user(&self) -> Result<UserIdentity, IdentityError> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_identity_from_user() {
        let user = UserIdentity::new("alice", "tab-1")
            .with_metadata(serde_json::json!({ "name": "Alice", "color": "#ff0000" }));
        let identity = SessionIdentity::new("room-42", user);

        assert_eq!(identity.room_id, "room-42");
        assert_eq!(identity.user_id, "alice");
        assert_eq!(identity.client_id, "tab-1");
        assert_eq!(identity.metadata["name"], "Alice");
    }

    #[test]
    fn test_closure_provider() {
        let provider = || Ok(UserIdentity::new("bob", "c1"));
        assert_eq!(provider.get_user().unwrap().user_id, "bob");

        let failing = || Err(IdentityError("no session cookie".into()));
        assert!(failing.get_user().is_err());
    }
}
