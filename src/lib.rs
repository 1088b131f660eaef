//! Remora - remote session core
//!
//! Client side: bearer credentials with background refresh, a duplex
//! connection with correlated RPC, and file transfer with server-pushed
//! progress. A dropped connection stays down until the caller connects again.
//!
//! Server side (feature `server`): the session daemon with a sandboxed
//! storage root.

pub mod checksum;
pub mod cli;
pub mod config;
pub mod connection;
pub mod credential;
pub mod error;
pub mod keystore;
pub mod logger;
pub mod named_mutex;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod rpc;
#[cfg(feature = "server")]
pub mod server;
pub mod session;
pub mod tls;
pub mod token_client;
pub mod token_manager;
pub mod transfer;
pub mod transport;
pub mod url;

pub use error::{ErrorKind, Result, SessionError};
