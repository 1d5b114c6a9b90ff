//! CSI Identity Service Implementation
//!
//! Plugin identification, capability reporting, and the readiness probe.
//! Probe health is derived from the live backend session: the driver only
//! reports ready while the TrueNAS session is authenticated and the daemon
//! is not shutting down.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tonic::{Request, Response, Status};
use tracing::debug;

use tnas_client::ConnState;

use crate::csi;

pub const DRIVER_NAME: &str = "tns.csi.io";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Readiness of the driver as reported by the Identity probe.
///
/// Combines the backend session state (observed through the session's watch
/// channel) with a shutdown flag. The probe goes not-ready while the session
/// is in backoff, so orchestrator health checks see backend outages without
/// the daemon ever exiting.
pub struct ReadinessState {
    session: watch::Receiver<ConnState>,
    shutting_down: AtomicBool,
}

impl ReadinessState {
    pub fn new(session: watch::Receiver<ConnState>) -> Self {
        Self {
            session,
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Current backend session state.
    pub fn session_state(&self) -> ConnState {
        *self.session.borrow()
    }

    /// Ready only while authenticated to the backend and not shutting down.
    pub fn is_ready(&self) -> bool {
        !self.shutting_down.load(Ordering::SeqCst)
            && self.session_state() == ConnState::Authenticated
    }

    /// Flip the probe to not-ready for the rest of the process lifetime.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }
}

impl fmt::Debug for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessState")
            .field("session", &self.session_state())
            .field(
                "shutting_down",
                &self.shutting_down.load(Ordering::SeqCst),
            )
            .finish()
    }
}

/// CSI Identity Service
///
/// Implements the CSI Identity service which provides:
/// - Plugin identification (name and version)
/// - Plugin capability reporting
/// - Readiness probing backed by the session state
pub struct IdentityService {
    readiness: Option<Arc<ReadinessState>>,
}

impl IdentityService {
    /// An identity service that always reports ready (tests, tooling).
    pub fn new() -> Self {
        Self { readiness: None }
    }

    /// An identity service whose probe follows the given readiness state.
    pub fn with_readiness(readiness: Arc<ReadinessState>) -> Self {
        Self {
            readiness: Some(readiness),
        }
    }
}

impl Default for IdentityService {
    fn default() -> Self {
        Self::new()
    }
}

#[tonic::async_trait]
impl csi::identity_server::Identity for IdentityService {
    /// Returns the name and version of the CSI plugin.
    async fn get_plugin_info(
        &self,
        _request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        Ok(Response::new(csi::GetPluginInfoResponse {
            name: DRIVER_NAME.to_string(),
            vendor_version: DRIVER_VERSION.to_string(),
            manifest: std::collections::HashMap::new(),
        }))
    }

    /// Returns the capabilities of the CSI plugin: controller service and
    /// online volume expansion.
    async fn get_plugin_capabilities(
        &self,
        _request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        let capabilities = [
            csi::plugin_capability::Type::Service(csi::plugin_capability::Service {
                r#type: csi::plugin_capability::service::Type::ControllerService as i32,
            }),
            csi::plugin_capability::Type::VolumeExpansion(
                csi::plugin_capability::VolumeExpansion {
                    r#type: csi::plugin_capability::volume_expansion::Type::Online as i32,
                },
            ),
        ]
        .into_iter()
        .map(|t| csi::PluginCapability { r#type: Some(t) })
        .collect();

        Ok(Response::new(csi::GetPluginCapabilitiesResponse {
            capabilities,
        }))
    }

    /// Probes the plugin to check if it is ready.
    ///
    /// Not-ready means the backend session is connecting or in backoff, or
    /// the daemon is shutting down.
    async fn probe(
        &self,
        _request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        let ready = match &self.readiness {
            Some(state) => {
                let ready = state.is_ready();
                debug!(session = %state.session_state(), ready, "Probe");
                ready
            }
            None => true,
        };
        Ok(Response::new(csi::ProbeResponse { ready: Some(ready) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csi::identity_server::Identity;

    fn readiness(initial: ConnState) -> (watch::Sender<ConnState>, Arc<ReadinessState>) {
        let (tx, rx) = watch::channel(initial);
        (tx, Arc::new(ReadinessState::new(rx)))
    }

    async fn probe(service: &IdentityService) -> Option<bool> {
        service
            .probe(Request::new(csi::ProbeRequest {}))
            .await
            .unwrap()
            .into_inner()
            .ready
    }

    #[tokio::test]
    async fn test_get_plugin_info() {
        let service = IdentityService::new();
        let info = service
            .get_plugin_info(Request::new(csi::GetPluginInfoRequest {}))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(info.name, DRIVER_NAME);
        assert_eq!(info.vendor_version, DRIVER_VERSION);
        assert!(info.manifest.is_empty());
    }

    #[tokio::test]
    async fn test_get_plugin_capabilities() {
        let service = IdentityService::new();
        let caps = service
            .get_plugin_capabilities(Request::new(csi::GetPluginCapabilitiesRequest {}))
            .await
            .unwrap()
            .into_inner();

        // Controller service and online volume expansion
        assert_eq!(caps.capabilities.len(), 2);
    }

    #[tokio::test]
    async fn test_probe_without_state_is_always_ready() {
        let service = IdentityService::new();
        assert_eq!(probe(&service).await, Some(true));
    }

    #[tokio::test]
    async fn test_probe_follows_session_state() {
        let (session, state) = readiness(ConnState::Connecting);
        let service = IdentityService::with_readiness(state);

        // Not ready until the session authenticates
        assert_eq!(probe(&service).await, Some(false));

        session.send_replace(ConnState::Authenticated);
        assert_eq!(probe(&service).await, Some(true));

        // A reconnecting session degrades the probe
        session.send_replace(ConnState::Backoff);
        assert_eq!(probe(&service).await, Some(false));

        session.send_replace(ConnState::Authenticated);
        assert_eq!(probe(&service).await, Some(true));
    }

    #[tokio::test]
    async fn test_probe_not_ready_during_shutdown() {
        let (_session, state) = readiness(ConnState::Authenticated);
        let service = IdentityService::with_readiness(state.clone());

        assert_eq!(probe(&service).await, Some(true));

        // Shutdown wins over a healthy session, and is sticky
        state.begin_shutdown();
        assert_eq!(probe(&service).await, Some(false));
    }

    #[test]
    fn test_readiness_state_transitions() {
        let (session, state) = readiness(ConnState::Disconnected);
        assert!(!state.is_ready());
        assert_eq!(state.session_state(), ConnState::Disconnected);

        session.send_replace(ConnState::Authenticated);
        assert!(state.is_ready());

        state.begin_shutdown();
        assert!(!state.is_ready());
    }
}
