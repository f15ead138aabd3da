//! TCP client and server built on [`Connection`].

pub mod connection;
pub mod server;

pub use connection::{Connection, CLOSE_LINGER};
pub use server::{BindFlags, BindOptions, Server, ServerEvent};

use tokio::net::ToSocketAddrs;

use crate::types::Result;

/// Open an outbound connection. Call [`Connection::start`] once listeners
/// are registered.
pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Connection> {
    Connection::connect(addr).await
}
