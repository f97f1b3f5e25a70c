//! Connection URL negotiation for the managed broker transport.
//!
//! The broker hands out short-lived URLs scoped to a room and user. A fresh
//! descriptor is fetched for every connection attempt.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConnectError;

/// Broker-issued connection target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDescriptor {
    pub url: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ConnectionDescriptor {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            expires_at: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Reject descriptors that cannot be used for a connection.
    pub fn validate(self) -> Result<Self, ConnectError> {
        if self.url.trim().is_empty() {
            return Err(ConnectError::NegotiationFailed(
                "negotiation returned no url".to_string(),
            ));
        }
        if self.is_expired(Utc::now()) {
            return Err(ConnectError::NegotiationFailed(format!(
                "negotiated url already expired at {}",
                self.expires_at.map(|t| t.to_rfc3339()).unwrap_or_default()
            )));
        }
        Ok(self)
    }
}

/// Exchanges `{room_id, user_id}` for a connection URL.
#[async_trait]
pub trait Negotiator: Send + Sync {
    async fn negotiate(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> Result<ConnectionDescriptor, ConnectError>;
}

/// Raw response body; `url` is optional here so a missing field is reported
/// as a negotiation failure rather than a JSON error.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NegotiateResponse {
    url: Option<String>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

/// `GET {endpoint}?roomId=..&userId=..` returning `{ "url", "expiresAt" }`.
#[derive(Debug, Clone)]
pub struct HttpNegotiator {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpNegotiator {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Negotiator for HttpNegotiator {
    async fn negotiate(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> Result<ConnectionDescriptor, ConnectError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("roomId", room_id), ("userId", user_id)])
            .send()
            .await
            .map_err(|e| ConnectError::NegotiationFailed(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConnectError::NegotiationFailed(format!(
                "negotiate endpoint returned HTTP {}",
                status.as_u16()
            )));
        }

        let body: NegotiateResponse = response
            .json()
            .await
            .map_err(|e| ConnectError::NegotiationFailed(format!("malformed response: {e}")))?;

        let url = body.url.unwrap_or_default();
        log::debug!("negotiated connection url for room {room_id}");
        ConnectionDescriptor {
            url,
            expires_at: body.expires_at,
        }
        .validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_descriptor_json_shape() {
        let descriptor: ConnectionDescriptor = serde_json::from_str(
            r#"{ "url": "wss://broker/client/hubs/rooms", "expiresAt": "2030-01-01T00:00:00Z" }"#,
        )
        .unwrap();
        assert_eq!(descriptor.url, "wss://broker/client/hubs/rooms");
        assert!(descriptor.expires_at.is_some());
    }

    #[test]
    fn test_expires_at_optional() {
        let descriptor: ConnectionDescriptor =
            serde_json::from_str(r#"{ "url": "wss://broker" }"#).unwrap();
        assert_eq!(descriptor.expires_at, None);
        assert!(descriptor.validate().is_ok());
    }

    #[test]
    fn test_empty_url_rejected() {
        let err = ConnectionDescriptor::new("  ").validate().unwrap_err();
        assert!(matches!(err, ConnectError::NegotiationFailed(_)));
    }

    #[test]
    fn test_expired_descriptor_rejected() {
        let descriptor = ConnectionDescriptor {
            url: "wss://broker".into(),
            expires_at: Some(Utc::now() - Duration::seconds(5)),
        };
        assert!(descriptor.is_expired(Utc::now()));
        assert!(matches!(
            descriptor.validate(),
            Err(ConnectError::NegotiationFailed(_))
        ));
    }
}
