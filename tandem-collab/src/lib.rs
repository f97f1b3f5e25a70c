//! # tandem-collab — Collaboration connection adapter for Tandem
//!
//! Binds a local editing session to a real-time room channel, tracks the
//! connection lifecycle, and batches local edits into undo units.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌──────────────────┐
//!   editor ─────► │  CollabAdapter   │ ── subscribe ──► status callbacks
//!                 └────────┬─────────┘
//!                          │ open(room)
//!                          ▼
//!                 ┌──────────────────┐      ┌──────────────┐
//!                 │  SessionHandle   │ ───► │ UndoBatcher  │ ──► undo units
//!                 └────────┬─────────┘      └──────────────┘
//!                          │ commands
//!                          ▼
//!                 ┌──────────────────┐      ┌──────────────┐
//!                 │   SessionTask    │ ───► │StatusTracker │
//!                 └────────┬─────────┘      └──────────────┘
//!                          │ connect()
//!                          ▼
//!                 ┌──────────────────┐
//!                 │ TransportBinding │
//!                 └───┬──────────┬───┘
//!          Direct     │          │     Managed
//!   ws {base}/rooms/{id}         negotiate ─► ws {url}
//! ```
//!
//! ## Modules
//!
//! - [`config`] — TOML-loadable adapter configuration
//! - [`status`] — Connection status state machine and subscriptions
//! - [`undo`] — Capture-window undo batching
//! - [`negotiate`] — Broker URL negotiation (HTTP)
//! - [`transport`] — Single connection attempt per strategy
//! - [`protocol`] — Binary frame protocol (bincode)
//! - [`session`] — Session task, offline queue, and the editor's handle
//! - [`adapter`] — Composition root

pub mod adapter;
pub mod backoff;
pub mod config;
pub mod error;
pub mod identity;
pub mod negotiate;
pub mod protocol;
pub mod session;
pub mod status;
pub mod transport;
pub mod undo;

// Re-exports for convenience
pub use adapter::CollabAdapter;
pub use backoff::Backoff;
pub use config::{CollabConfig, ConfigError, TransportConfig};
pub use error::{CallerError, CollabError, ConnectError};
pub use identity::{IdentityError, IdentityProvider, SessionIdentity, StaticIdentity, UserIdentity};
pub use negotiate::{ConnectionDescriptor, HttpNegotiator, Negotiator};
pub use protocol::{Frame, FrameKind, PeerPresence, ProtocolError};
pub use session::{OfflineQueue, SessionEvent, SessionHandle};
pub use status::{ConnectionStatus, StatusSubscription, StatusTracker};
pub use transport::{ActiveChannel, TransportBinding, TransportStrategy};
pub use undo::{SealCause, UndoBatcher, UndoUnit};
