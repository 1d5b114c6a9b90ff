//! TrueNAS middleware client library
//!
//! This library provides the backend half of the TrueNAS CSI driver:
//! a persistent, reconnecting JSON-RPC-over-WebSocket session to the
//! TrueNAS middleware and a typed client for the storage operations the
//! driver needs.
//!
//! The library is split into several modules:
//! - `rpc`: WebSocket session management and JSON-RPC framing
//! - `client`: typed operations (datasets, ZVOLs, shares, NVMe-oF, snapshots)
//! - `types`: wire types returned by the middleware
//! - `metrics`: Prometheus metrics for session health

pub mod client;
pub mod error;
pub mod metrics;
pub mod rpc;
pub mod types;

pub use client::TruenasClient;
pub use error::{ClientError, Result};
pub use rpc::{ConnState, RpcError, Session, SessionConfig, SessionHandle};
