//! JSON-RPC over WebSocket plumbing for the TrueNAS middleware.
//!
//! A single task owns the socket; callers submit requests through a channel
//! and wait on a per-request reply slot. See [`session::Session`].

mod error;
pub mod protocol;
mod session;

pub use error::RpcError;
pub use session::{ConnState, Session, SessionConfig, SessionHandle};
