//! Transport binding: one connection attempt against either the direct room
//! server or the managed broker.
//!
//! ```text
//! Direct:   Connecting ──────────────────────► ws {ws_base}/rooms/{room}
//! Managed:  Negotiating ─► negotiator ─► url ─► Connecting ─► ws {url}
//! ```
//!
//! Retry and the status machine around repeated attempts live in the
//! session task; this module only knows how to make one attempt.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::error::ConnectError;
use crate::identity::SessionIdentity;
use crate::negotiate::Negotiator;
use crate::status::{ConnectionStatus, StatusTracker};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Request header carrying the user id on direct connections.
pub const USER_ID_HEADER: &str = "x-tandem-user-id";
/// Request header carrying the client id on direct connections.
pub const CLIENT_ID_HEADER: &str = "x-tandem-client-id";

/// The two interchangeable channel providers.
#[derive(Clone)]
pub enum TransportStrategy {
    Direct { ws_base: String },
    Managed { negotiator: Arc<dyn Negotiator> },
}

impl fmt::Debug for TransportStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct { ws_base } => f.debug_struct("Direct").field("ws_base", ws_base).finish(),
            Self::Managed { .. } => f.debug_struct("Managed").finish_non_exhaustive(),
        }
    }
}

impl TransportStrategy {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Direct { .. } => "direct",
            Self::Managed { .. } => "managed",
        }
    }
}

/// Room endpoint for the direct transport.
pub fn direct_room_url(ws_base: &str, room_id: &str) -> String {
    format!("{}/rooms/{}", ws_base.trim_end_matches('/'), room_id)
}

/// An open socket plus where it came from.
pub struct ActiveChannel {
    pub stream: WsStream,
    pub url: String,
    /// Broker URL expiry, managed transport only
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for ActiveChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveChannel")
            .field("url", &self.url)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Makes connection attempts and reports the attempt's status transitions.
#[derive(Debug, Clone)]
pub struct TransportBinding {
    strategy: TransportStrategy,
    connect_timeout: Duration,
    status: StatusTracker,
}

impl TransportBinding {
    pub fn new(strategy: TransportStrategy, connect_timeout: Duration, status: StatusTracker) -> Self {
        Self {
            strategy,
            connect_timeout,
            status,
        }
    }

    pub fn strategy(&self) -> &TransportStrategy {
        &self.strategy
    }

    pub(crate) fn status(&self) -> &StatusTracker {
        &self.status
    }

    /// One connection attempt. Transitions to `Negotiating` (managed only)
    /// and `Connecting`; the caller decides what follows.
    ///
    /// Dropping the returned future cancels the attempt, including an
    /// in-flight negotiation.
    pub async fn connect(&self, identity: &SessionIdentity) -> Result<ActiveChannel, ConnectError> {
        match &self.strategy {
            TransportStrategy::Direct { ws_base } => {
                self.status.transition(ConnectionStatus::Connecting);
                let url = direct_room_url(ws_base, &identity.room_id);
                let stream = self.open_socket(&url, Some(identity)).await?;
                Ok(ActiveChannel {
                    stream,
                    url,
                    expires_at: None,
                })
            }
            TransportStrategy::Managed { negotiator } => {
                self.status.transition(ConnectionStatus::Negotiating);
                let descriptor = tokio::time::timeout(
                    self.connect_timeout,
                    negotiator.negotiate(&identity.room_id, &identity.user_id),
                )
                .await
                .map_err(|_| ConnectError::Timeout(self.connect_timeout))??
                .validate()?;

                self.status.transition(ConnectionStatus::Connecting);
                // Broker URLs carry their own credentials.
                let stream = self.open_socket(&descriptor.url, None).await?;
                Ok(ActiveChannel {
                    stream,
                    url: descriptor.url,
                    expires_at: descriptor.expires_at,
                })
            }
        }
    }

    async fn open_socket(
        &self,
        url: &str,
        identity: Option<&SessionIdentity>,
    ) -> Result<WsStream, ConnectError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| ConnectError::Unreachable(format!("invalid url {url}: {e}")))?;

        if let Some(identity) = identity {
            let headers = request.headers_mut();
            for (name, value) in [
                (USER_ID_HEADER, &identity.user_id),
                (CLIENT_ID_HEADER, &identity.client_id),
            ] {
                let value = HeaderValue::from_str(value).map_err(|e| {
                    ConnectError::Unreachable(format!("identity not usable as {name}: {e}"))
                })?;
                headers.insert(name, value);
            }
        }

        let (stream, _response) =
            tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request))
                .await
                .map_err(|_| ConnectError::Timeout(self.connect_timeout))?
                .map_err(|e| ConnectError::Unreachable(format!("{url}: {e}")))?;

        log::info!("socket open to {url}");
        Ok(stream)
    }
}
