//! Livewire Proxy Library Crate
//!
//! A WebSocket relay between browser clients and a realtime multimodal
//! upstream service. It holds the configuration, shared state, router and
//! WebSocket session logic; the `proxy` binary is a thin wrapper around it.

pub mod config;
pub mod error;
pub mod handlers;
pub mod router;
pub mod state;
pub mod ws;
