//! `connect-core` — the peer-to-peer LAN file transfer core.
//!
//! One module per component from the design doc (C1-C8), plus the shared
//! wire types (`protocol`), configuration (`config`), and error kinds
//! (`error`). The `server` crate wires these into an `axum` HTTP/WebSocket
//! process; nothing in here decides routing or middleware policy.

pub mod auth;
pub mod config;
pub mod discovery;
pub mod error;
pub mod hub;
pub mod port;
pub mod protocol;
pub mod session;
pub mod sink;
pub mod transfer;
