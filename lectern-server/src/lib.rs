//! # lectern-server: WebSocket front end for the session hub
//!
//! ## Modules
//!
//! - [`config`]: `ServerConfig` and `LECTERN_*` environment overrides
//! - [`identity`]: Handshake target parsing and the identity resolver seam
//! - [`dispatch`]: Inbound client actions → hub operations
//! - [`server`]: Accept loop and per-connection pump

pub mod config;
pub mod identity;
pub mod dispatch;
pub mod server;

pub use config::{ConfigError, ServerConfig};
pub use identity::{ConnectRequest, HandshakeError, Identity, IdentityResolver, QueryIdentityResolver};
pub use dispatch::{dispatch, handle_text, ConnectionContext};
pub use server::{BoxError, TransportServer, TransportStats};
