//! JSON-RPC 2.0 frame types for the TrueNAS middleware wire protocol.
//!
//! Request ids are numeric and client-assigned; the middleware echoes the id
//! back on the matching response. Responses carry either `result` or `error`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outbound JSON-RPC request frame.
#[derive(Debug, Serialize)]
pub struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: &'a Value,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: &'a Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

/// Inbound JSON-RPC response frame.
///
/// Frames without an `id` are middleware notifications (collection change
/// events); the session drops them.
#[derive(Debug, Deserialize)]
pub struct Response {
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<ErrorFrame>,
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorFrame {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}
