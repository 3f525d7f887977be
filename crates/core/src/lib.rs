//! External HTTP collaborators used by the live proxy.
//!
//! Nothing in this crate knows about WebSockets: `auth` obtains bearer
//! credentials for the upstream realtime service and `weather` performs the
//! city weather lookup that backs the `get_weather` tool.

pub mod auth;
pub mod weather;
