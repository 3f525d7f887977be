//! WebSocket Relay
//!
//! This module contains the logic for pairing each client WebSocket with an
//! authenticated upstream session and relaying between them:
//!
//! - `session`: the per-client lifecycle, from upgrade to close.
//! - `upstream`: opens the upstream socket and sends the setup message.
//! - `relay`: the two forwarding loops and their teardown.
//! - `tools`: answers upstream tool calls locally.
//! - `registry`: live upstream sockets and the health monitor that prunes them.
//! - `protocol` and `frame`: message shapes and transport adaptation.

pub mod frame;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod session;
pub mod tools;
pub mod upstream;

pub use session::ws_handler;
