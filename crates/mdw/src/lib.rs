//! Middleware adapters for the aesync chain ports.
//!
//! - [`MdwClient`] - paginated Chain Read API over HTTP (`reqwest`)
//! - [`MdwSocket`] - push channels over a websocket (`tokio-tungstenite`)

mod client;
mod socket;
mod wire;

pub use client::{MdwClient, MdwClientConfig};
pub use socket::MdwSocket;
pub use wire::Channel;
