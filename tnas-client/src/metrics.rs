//! Prometheus metrics for backend session health.
//!
//! The exporter itself is installed by the driver binary; this module only
//! records against the global recorder.

use metrics::{counter, gauge};

use crate::rpc::ConnState;

/// Metric names
pub mod names {
    /// Gauge (0/1 per state label): current backend session state
    pub const BACKEND_SESSION_STATE: &str = "csi_backend_session_state";
    /// Counter: reconnect attempts by outcome
    pub const BACKEND_RECONNECTS_TOTAL: &str = "csi_backend_reconnects_total";
}

/// Publish the session state as a one-hot gauge over all states.
pub fn set_session_state(state: ConnState) {
    for s in ConnState::ALL {
        let value = if s == state { 1.0 } else { 0.0 };
        gauge!(names::BACKEND_SESSION_STATE, "state" => s.to_string()).set(value);
    }
}

/// Record a reconnect attempt outcome ("success" or "failure").
pub fn record_reconnect(outcome: &str) {
    counter!(names::BACKEND_RECONNECTS_TOTAL, "outcome" => outcome.to_string()).increment(1);
}
