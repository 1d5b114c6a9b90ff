//! Backend session management.
//!
//! A single task owns the WebSocket to the TrueNAS middleware. It
//! authenticates with an API key, keeps the connection alive with pings,
//! multiplexes concurrent requests by request id, and reconnects with
//! exponential backoff when the socket drops. Callers never touch the
//! socket; they submit requests through [`SessionHandle`] and wait for the
//! reply.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

use super::error::RpcError;
use super::protocol::{Request, Response};
use crate::metrics;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Ping cadence while authenticated.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

/// Read deadline: the socket is considered dead after this much silence
/// (4x the ping interval).
pub const DEFAULT_READ_DEADLINE: Duration = Duration::from_secs(120);

/// Default per-call timeout applied when the caller does not pass one.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Reconnect delays in seconds; the last entry repeats forever.
const BACKOFF_SCHEDULE: [u64; 5] = [5, 10, 20, 40, 60];

/// Submission queue depth. Callers block once this many requests are queued.
const SUBMIT_QUEUE_DEPTH: usize = 64;

/// Connection state of the backend session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Authenticated,
    Backoff,
}

impl ConnState {
    /// All states, for metrics gauge fan-out.
    pub const ALL: [ConnState; 4] = [
        ConnState::Disconnected,
        ConnState::Connecting,
        ConnState::Authenticated,
        ConnState::Backoff,
    ];
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnState::Disconnected => "disconnected",
            ConnState::Connecting => "connecting",
            ConnState::Authenticated => "authenticated",
            ConnState::Backoff => "backoff",
        };
        f.write_str(s)
    }
}

/// Session configuration.
#[derive(Clone)]
pub struct SessionConfig {
    /// WebSocket URL of the middleware, e.g. `wss://nas.example.net/api/current`.
    pub socket_url: String,
    /// API key used for `auth.login_with_api_key`.
    pub api_key: String,
    pub ping_interval: Duration,
    pub read_deadline: Duration,
    pub call_timeout: Duration,
}

impl SessionConfig {
    pub fn new(socket_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            socket_url: socket_url.into(),
            api_key: api_key.into(),
            ping_interval: DEFAULT_PING_INTERVAL,
            read_deadline: DEFAULT_READ_DEADLINE,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("socket_url", &self.socket_url)
            .field("api_key", &"<redacted>")
            .field("ping_interval", &self.ping_interval)
            .field("read_deadline", &self.read_deadline)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

struct Submission {
    method: String,
    params: Value,
    reply: oneshot::Sender<Result<Value, RpcError>>,
}

/// Cloneable handle for submitting requests to the session task.
#[derive(Clone)]
pub struct SessionHandle {
    submit: mpsc::Sender<Submission>,
    state: watch::Receiver<ConnState>,
    call_timeout: Duration,
}

impl SessionHandle {
    /// Current connection state.
    pub fn state(&self) -> ConnState {
        *self.state.borrow()
    }

    /// A watch receiver for observing state transitions (readiness probes).
    pub fn state_watch(&self) -> watch::Receiver<ConnState> {
        self.state.clone()
    }

    /// Issue a JSON-RPC call with the session default timeout.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.call_with_timeout(method, params, self.call_timeout)
            .await
    }

    /// Issue a JSON-RPC call with an explicit per-call timeout.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        call_timeout: Duration,
    ) -> Result<Value, RpcError> {
        // Fail fast while the session is between reconnect attempts; the
        // orchestrator retries with its own backoff.
        if self.state() == ConnState::Backoff {
            return Err(RpcError::Unavailable(
                "backend session is reconnecting".to_string(),
            ));
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let submission = Submission {
            method: method.to_string(),
            params,
            reply: reply_tx,
        };

        self.submit
            .send(submission)
            .await
            .map_err(|_| RpcError::Unavailable("backend session terminated".to_string()))?;

        match timeout(call_timeout, reply_rx).await {
            Err(_) => Err(RpcError::Timeout(call_timeout)),
            Ok(Err(_)) => Err(RpcError::Unavailable(
                "request abandoned during reconnect".to_string(),
            )),
            Ok(Ok(result)) => result,
        }
    }
}

/// The session task. Owns the WebSocket exclusively.
pub struct Session {
    config: SessionConfig,
    submit_rx: mpsc::Receiver<Submission>,
    state_tx: watch::Sender<ConnState>,
    pending: HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>,
    next_id: u64,
    reconnect_attempt: u32,
    last_pong: Option<Instant>,
}

impl Session {
    /// Connect and authenticate, then spawn the session task.
    ///
    /// The first connect is performed inline so that startup fails loudly on
    /// bad configuration or credentials; once this returns, reconnection is
    /// handled internally and never gives up.
    pub async fn connect(config: SessionConfig) -> Result<SessionHandle, RpcError> {
        let (submit_tx, submit_rx) = mpsc::channel(SUBMIT_QUEUE_DEPTH);
        let (state_tx, state_rx) = watch::channel(ConnState::Disconnected);

        let call_timeout = config.call_timeout;
        let mut session = Session {
            config,
            submit_rx,
            state_tx,
            pending: HashMap::new(),
            next_id: 0,
            reconnect_attempt: 0,
            last_pong: None,
        };

        let ws = session.establish().await?;
        info!(url = %session.config.socket_url, "Authenticated to TrueNAS middleware");

        tokio::spawn(session.run(ws));

        Ok(SessionHandle {
            submit: submit_tx,
            state: state_rx,
            call_timeout,
        })
    }

    fn set_state(&self, state: ConnState) {
        self.state_tx.send_replace(state);
        metrics::set_session_state(state);
    }

    fn next_request_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Open the socket and authenticate with the API key.
    async fn establish(&mut self) -> Result<Ws, RpcError> {
        self.set_state(ConnState::Connecting);

        let (mut ws, _) = connect_async(self.config.socket_url.as_str())
            .await
            .map_err(|e| RpcError::Unavailable(format!("WebSocket connect failed: {e}")))?;

        self.authenticate(&mut ws).await?;
        self.set_state(ConnState::Authenticated);
        Ok(ws)
    }

    async fn authenticate(&mut self, ws: &mut Ws) -> Result<(), RpcError> {
        let id = self.next_request_id();
        let params = json!([self.config.api_key]);
        let frame = serde_json::to_string(&Request::new(id, "auth.login_with_api_key", &params))
            .map_err(|e| RpcError::Protocol(e.to_string()))?;

        ws.send(Message::Text(frame.into()))
            .await
            .map_err(|e| RpcError::Unavailable(format!("auth send failed: {e}")))?;

        // Read until our response shows up; the middleware may interleave
        // control frames.
        loop {
            let msg = match timeout(self.config.read_deadline, ws.next()).await {
                Err(_) => {
                    return Err(RpcError::Unavailable(
                        "no response to authentication".to_string(),
                    ));
                }
                Ok(None) => {
                    return Err(RpcError::Unavailable(
                        "socket closed during authentication".to_string(),
                    ));
                }
                Ok(Some(Err(e))) => return Err(RpcError::Unavailable(e.to_string())),
                Ok(Some(Ok(msg))) => msg,
            };

            let text = match msg {
                Message::Text(text) => text,
                Message::Ping(payload) => {
                    let _ = ws.send(Message::Pong(payload)).await;
                    continue;
                }
                Message::Close(_) => {
                    return Err(RpcError::Unavailable(
                        "socket closed during authentication".to_string(),
                    ));
                }
                _ => continue,
            };

            let response: Response = serde_json::from_str(&text)
                .map_err(|e| RpcError::Protocol(format!("bad auth response: {e}")))?;

            if response.id != Some(id) {
                continue;
            }

            if let Some(err) = response.error {
                return Err(RpcError::AuthFailed(err.message));
            }

            return match response.result {
                Some(Value::Bool(true)) => Ok(()),
                // Newer middleware returns a session object instead of a bool.
                Some(Value::Object(_)) => Ok(()),
                other => Err(RpcError::AuthFailed(format!(
                    "unexpected login result: {other:?}"
                ))),
            };
        }
    }

    /// Main loop: serve the connection, then reconnect forever on loss.
    async fn run(mut self, mut ws: Ws) {
        loop {
            let reason = self.serve(&mut ws).await;

            if self.submit_rx.is_closed() {
                debug!("All session handles dropped; stopping session task");
                self.set_state(ConnState::Disconnected);
                return;
            }

            let silent_for = self
                .last_pong
                .map(|at| at.elapsed())
                .unwrap_or(Duration::ZERO);
            warn!(
                error = %reason,
                pending = self.pending.len(),
                silent_for = ?silent_for,
                "WebSocket session lost"
            );

            self.fail_pending();
            self.set_state(ConnState::Backoff);

            ws = self.reconnect().await;
        }
    }

    /// Reconnect with exponential backoff; never gives up.
    async fn reconnect(&mut self) -> Ws {
        loop {
            self.reconnect_attempt += 1;
            let delay = backoff_delay(self.reconnect_attempt);
            info!(
                attempt = self.reconnect_attempt,
                delay_secs = delay.as_secs(),
                "Reconnecting to TrueNAS middleware"
            );

            self.backoff_sleep(delay).await;

            match self.establish().await {
                Ok(ws) => {
                    info!(
                        "Successfully authenticated after {} attempts",
                        self.reconnect_attempt
                    );
                    metrics::record_reconnect("success");
                    self.reconnect_attempt = 0;
                    return ws;
                }
                Err(e) => {
                    warn!(
                        attempt = self.reconnect_attempt,
                        error = %e,
                        "Reconnect attempt failed"
                    );
                    metrics::record_reconnect("failure");
                    self.set_state(ConnState::Backoff);
                }
            }
        }
    }

    /// Sleep out a backoff delay while answering submissions with a
    /// retriable error instead of letting them queue against a dead socket.
    async fn backoff_sleep(&mut self, delay: Duration) {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => return,
                maybe_sub = self.submit_rx.recv() => {
                    match maybe_sub {
                        Some(sub) => {
                            let _ = sub.reply.send(Err(RpcError::Unavailable(
                                "backend session is reconnecting".to_string(),
                            )));
                        }
                        None => {
                            tokio::time::sleep_until(deadline).await;
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Serve one connection until it fails. Returns the failure reason.
    async fn serve(&mut self, ws: &mut Ws) -> RpcError {
        let read_deadline = self.config.read_deadline;
        let mut ping = interval_at(
            Instant::now() + self.config.ping_interval,
            self.config.ping_interval,
        );
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_sub = self.submit_rx.recv() => {
                    let Some(sub) = maybe_sub else {
                        return RpcError::Unavailable("driver shutting down".to_string());
                    };
                    if let Err(e) = self.send_request(ws, sub).await {
                        return e;
                    }
                }
                read = timeout(read_deadline, ws.next()) => {
                    match read {
                        Err(_) => {
                            return RpcError::Unavailable(format!(
                                "read deadline exceeded ({read_deadline:?} of silence)"
                            ));
                        }
                        Ok(None) => return RpcError::Unavailable("socket closed".to_string()),
                        Ok(Some(Err(e))) => return RpcError::Unavailable(e.to_string()),
                        Ok(Some(Ok(msg))) => {
                            if let Err(e) = self.handle_message(ws, msg).await {
                                return e;
                            }
                        }
                    }
                }
                _ = ping.tick() => {
                    if let Err(e) = ws.send(Message::Ping(Vec::new().into())).await {
                        return RpcError::Unavailable(format!("ping failed: {e}"));
                    }
                }
            }
        }
    }

    async fn send_request(&mut self, ws: &mut Ws, sub: Submission) -> Result<(), RpcError> {
        let id = self.next_request_id();
        let frame =
            match serde_json::to_string(&Request::new(id, &sub.method, &sub.params)) {
                Ok(frame) => frame,
                Err(e) => {
                    let _ = sub.reply.send(Err(RpcError::Protocol(e.to_string())));
                    return Ok(());
                }
            };

        self.pending.insert(id, sub.reply);

        if let Err(e) = ws.send(Message::Text(frame.into())).await {
            // The waiter is failed together with the rest in fail_pending().
            return Err(RpcError::Unavailable(format!("write failed: {e}")));
        }

        debug!(id, method = %sub.method, "Submitted backend request");
        Ok(())
    }

    async fn handle_message(&mut self, ws: &mut Ws, msg: Message) -> Result<(), RpcError> {
        match msg {
            Message::Text(text) => {
                self.dispatch(&text);
                Ok(())
            }
            Message::Pong(_) => {
                self.last_pong = Some(Instant::now());
                Ok(())
            }
            Message::Ping(payload) => ws
                .send(Message::Pong(payload))
                .await
                .map_err(|e| RpcError::Unavailable(format!("pong failed: {e}"))),
            Message::Close(frame) => Err(RpcError::Unavailable(format!(
                "close frame received: {frame:?}"
            ))),
            // Binary and raw frames are not part of the middleware protocol.
            _ => Ok(()),
        }
    }

    /// Route a response frame to its waiter by request id.
    fn dispatch(&mut self, text: &str) {
        let response: Response = match serde_json::from_str(text) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Dropping unparseable frame from middleware");
                return;
            }
        };

        let Some(id) = response.id else {
            // Middleware event notification; this driver does not subscribe.
            return;
        };

        let Some(waiter) = self.pending.remove(&id) else {
            // Caller timed out or was cancelled before the reply arrived.
            debug!(id, "Response for unknown request id");
            return;
        };

        let result = match response.error {
            Some(err) => Err(RpcError::Fault {
                code: err.code,
                message: err.message,
            }),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };

        let _ = waiter.send(result);
    }

    /// Fail every in-flight request with a retriable error.
    fn fail_pending(&mut self) {
        for (_, waiter) in self.pending.drain() {
            let _ = waiter.send(Err(RpcError::Unavailable(
                "connection lost before response".to_string(),
            )));
        }
    }
}

/// Delay before reconnect attempt `n` (1-based): 5s, 10s, 20s, 40s, then 60s
/// forever.
fn backoff_delay(attempt: u32) -> Duration {
    let idx = (attempt.saturating_sub(1) as usize).min(BACKOFF_SCHEDULE.len() - 1);
    Duration::from_secs(BACKOFF_SCHEDULE[idx])
}
