//! # gantry-engine - Container Engine REST Client
//!
//! Speaks the libpod REST API over a local Unix socket: JSON-shaped
//! request/response calls, long-lived streaming monitors (events, stats,
//! log tailing), and upgrade-based interactive terminals (exec/attach).
//!
//! Depends on [`gantry_core`] for the error model and typed events.
//!
//! ## Public API
//!
//! ### Addressing (`address`)
//! - [`Scope`] - Which engine instance a call targets (system or per-user
//!   socket); resolution happens per call, never cached
//!
//! ### Requests (`request`)
//! - [`Request`] - Method, path, query params, and body; encodes to
//!   HTTP/1.0 bytes, plain or as an Upgrade handshake
//!
//! ### Exchanges (`connection`)
//! - [`Connection`] - Sequential calls and monitors against one scope;
//!   `&mut self` makes concurrent use unrepresentable
//! - [`ConnectionHandle`] - Closes a Connection a monitor is borrowing
//! - [`call()`] / [`call_json()`] - Scoped one-shot wrappers that always
//!   close the Connection they open
//!
//! ### Interactive terminals (`tunnel`)
//! - [`Tunnel`] - Duplex byte relay behind an HTTP Upgrade handshake
//! - [`Handshake`] - The pure 101-gate state machine
//!
//! ### Operations (`client`)
//! - [`client`] - The libpod operation surface: containers, pods, images,
//!   volumes, events, exec/attach orchestration
//!
//! ### Plumbing (`framing`, `http`)
//! - [`RecordFramer`] - Reassembles delimited records from arbitrary chunks
//! - [`ResponseHead`] - Minimal HTTP/1.0 response head parsing

pub mod address;
pub mod client;
pub mod connection;
pub mod framing;
pub mod http;
pub mod request;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;
pub mod tunnel;

// Public API re-exports
pub use address::{Scope, SYSTEM_SOCKET};
pub use connection::{call, call_json, Connection, ConnectionHandle, ConnectionState, Diagnostics};
pub use framing::{find_header_end, RecordFramer};
pub use http::ResponseHead;
pub use request::{Method, Request};
pub use tunnel::{Handshake, HandshakeProgress, Tunnel, TunnelState, REDRAW_BYTE};

/// Re-exported from `gantry_core` for convenience. Canonical import:
/// `gantry_core::{Error, Result, ...}`.
pub use gantry_core::{EngineError, EngineEvent, Error, Result};
