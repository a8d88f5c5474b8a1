//! Wire protocol handling
//!
//! This module implements the framed JSON wire protocol for
//! client-server communication: length-prefixed request/response frames
//! plus the two streaming surfaces (WatchStream and WatchKeyValue).

pub mod connection;
pub mod protocol;
pub mod server;

pub use connection::ConnectionHandler;
pub use protocol::{read_message, write_message, Request, RequestBody, Response, WireError};
pub use server::ProtocolServer;
