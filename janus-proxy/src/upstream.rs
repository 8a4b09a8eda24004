//! Upstream pool sessions.
//!
//! One session task per configured pool. The session owns the TCP (or
//! TLS) connection, walks the subscribe/authorize handshake, tracks the
//! pool's extranonce and difficulty, keeps the bounded job ring, and
//! correlates share submits with their responses. It reconnects with
//! jittered exponential backoff and never terminates on its own except
//! at shutdown.
//!
//! State shared with the rest of the proxy goes through a
//! `tokio::sync::watch` snapshot that is replaced wholesale on every
//! change; readers never observe a half-updated session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::{PoolEntry, PoolFlavour};
use crate::events::EventSink;
use crate::job::{JobRecord, JobRing};
use crate::metrics::Counters;
use crate::stratum::{
    self, error_codes, parse_error_array, JsonRpcMessage, StratumError, StratumResult, Transport,
};
use crate::types::{PoolId, SubmitOutcome};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(120);
const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);
const PENDING_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Consecutive submit timeouts after which the pool is considered
/// unhealthy and the connection is torn down.
const UNHEALTHY_TIMEOUT_STREAK: u32 = 5;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ConnState {
    Connecting,
    Subscribing,
    Authorizing,
    Ready,
    Reconnecting,
    Down,
}

/// Runtime configuration for one upstream session.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamConfig {
    pub id: PoolId,
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// Full username sent upstream (`user` or `user.worker`).
    pub username: String,
    pub password: String,
    pub flavour: PoolFlavour,
    pub extranonce_subscribe: bool,
    pub user_agent: String,
}

impl UpstreamConfig {
    /// Derive from a config snapshot entry.
    pub fn from_entry(id: PoolId, entry: &PoolEntry) -> Self {
        let username = if entry.worker.is_empty() {
            entry.user.clone()
        } else {
            format!("{}.{}", entry.user, entry.worker)
        };
        Self {
            id,
            host: entry.host.clone(),
            port: entry.port,
            tls: entry.tls,
            username,
            password: entry.pass.clone(),
            flavour: entry.flavour,
            extranonce_subscribe: entry.extranonce_subscribe,
            user_agent: concat!("janus-proxy/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Atomic view of an upstream session.
#[derive(Debug, Clone)]
pub struct UpstreamSnapshot {
    pub state: ConnState,
    /// Pool-assigned extranonce1, hex.
    pub extranonce1: String,
    pub extranonce2_size: usize,
    /// Current share difficulty. Stratum's implicit default is 1 until
    /// the pool says otherwise.
    pub difficulty: f64,
    pub version_rolling_mask: Option<u32>,
    pub jobs: JobRing,
    pub last_job_at: Option<Instant>,
}

impl Default for UpstreamSnapshot {
    fn default() -> Self {
        Self {
            state: ConnState::Connecting,
            extranonce1: String::new(),
            extranonce2_size: 0,
            difficulty: 1.0,
            version_rolling_mask: None,
            jobs: JobRing::new(),
            last_job_at: None,
        }
    }
}

/// A share bound for this upstream, already in the pool's extranonce
/// layout. The session fills in its own username.
#[derive(Debug, Clone)]
pub struct UpstreamSubmit {
    pub pool_job_id: String,
    /// Hex, sized to the pool's extranonce2_size.
    pub extranonce2: String,
    pub ntime: String,
    pub nonce: String,
    pub version_bits: Option<String>,
}

/// Commands accepted by a session task.
pub enum UpstreamCommand {
    /// Submit a share; the outcome arrives on the oneshot.
    Submit {
        submit: UpstreamSubmit,
        outcome_tx: oneshot::Sender<SubmitOutcome>,
    },
    /// Adopt a new configuration, reconnecting if it differs.
    Reconfigure(UpstreamConfig),
}

/// Events published to the supervisor hub.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    StateChanged { pool: PoolId, state: ConnState },
    NewJob { pool: PoolId, job: Arc<JobRecord> },
    DifficultyChanged { pool: PoolId, difficulty: f64 },
    ExtranonceChanged { pool: PoolId },
}

/// Cheap handle onto a running session.
#[derive(Clone)]
pub struct UpstreamHandle {
    pub id: PoolId,
    cmd_tx: mpsc::Sender<UpstreamCommand>,
    snapshot_rx: watch::Receiver<UpstreamSnapshot>,
}

impl UpstreamHandle {
    /// Current snapshot of the session.
    pub fn snapshot(&self) -> UpstreamSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Queue a share for submission.
    ///
    /// The returned receiver resolves with the outcome; it errs if the
    /// session dropped the command, which callers treat as a local
    /// rejection.
    pub fn submit(&self, submit: UpstreamSubmit) -> oneshot::Receiver<SubmitOutcome> {
        let (outcome_tx, outcome_rx) = oneshot::channel();
        if let Err(e) = self.cmd_tx.try_send(UpstreamCommand::Submit { submit, outcome_tx }) {
            warn!(pool = %self.id, error = %e, "Dropping submit, upstream command queue unavailable");
        }
        outcome_rx
    }

    /// Apply a new config; the session reconnects only if it changed.
    pub fn reconfigure(&self, config: UpstreamConfig) {
        if self
            .cmd_tx
            .try_send(UpstreamCommand::Reconfigure(config))
            .is_err()
        {
            warn!(pool = %self.id, "Upstream command queue unavailable for reconfigure");
        }
    }
}

/// Both upstream handles, passed around as one collaborator.
#[derive(Clone)]
pub struct Upstreams {
    pub a: UpstreamHandle,
    pub b: UpstreamHandle,
}

impl Upstreams {
    pub fn get(&self, id: PoolId) -> &UpstreamHandle {
        match id {
            PoolId::A => &self.a,
            PoolId::B => &self.b,
        }
    }
}

/// Spawn an upstream session task.
pub fn spawn(
    config: UpstreamConfig,
    event_tx: mpsc::Sender<UpstreamEvent>,
    shutdown: CancellationToken,
    counters: Arc<Counters>,
    events: EventSink,
) -> (UpstreamHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (snapshot_tx, snapshot_rx) = watch::channel(UpstreamSnapshot::default());
    let id = config.id;

    let session = UpstreamSession {
        config,
        event_tx,
        cmd_rx,
        snapshot_tx,
        shutdown,
        counters,
        events,
        state: ConnState::Connecting,
        extranonce1: String::new(),
        extranonce2_size: 0,
        difficulty: 1.0,
        version_mask: None,
        jobs: JobRing::new(),
        last_job_at: None,
        next_id: 1,
        pending: HashMap::new(),
        timeout_streak: 0,
        redirect: None,
    };

    let handle = UpstreamHandle {
        id,
        cmd_tx,
        snapshot_rx,
    };
    let join = tokio::spawn(session.run());
    (handle, join)
}

/// In-flight submit awaiting its response.
struct PendingSubmit {
    outcome_tx: oneshot::Sender<SubmitOutcome>,
    sent_at: Instant,
}

/// Why the serve loop returned without an error.
enum ServeExit {
    Shutdown,
    Reconfigured,
}

/// Jittered exponential backoff, reset once the session reaches `Ready`.
struct Backoff {
    current: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            current: BACKOFF_BASE,
        }
    }

    fn reset(&mut self) {
        self.current = BACKOFF_BASE;
    }

    fn next(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..=1.5);
        let delay = self.current.mul_f64(jitter).min(BACKOFF_CAP);
        self.current = (self.current * 2).min(BACKOFF_CAP);
        delay
    }
}

/// The session task.
pub struct UpstreamSession {
    config: UpstreamConfig,
    event_tx: mpsc::Sender<UpstreamEvent>,
    cmd_rx: mpsc::Receiver<UpstreamCommand>,
    snapshot_tx: watch::Sender<UpstreamSnapshot>,
    shutdown: CancellationToken,
    counters: Arc<Counters>,
    events: EventSink,

    state: ConnState,
    extranonce1: String,
    extranonce2_size: usize,
    difficulty: f64,
    version_mask: Option<u32>,
    jobs: JobRing,
    last_job_at: Option<Instant>,

    /// Auto-incrementing request id; submit ids are monotone.
    next_id: u64,
    pending: HashMap<u64, PendingSubmit>,
    timeout_streak: u32,

    /// Host/port override from `client.reconnect`, consumed on the next
    /// connect attempt.
    redirect: Option<(String, u16)>,
}

impl UpstreamSession {
    async fn run(mut self) {
        let mut backoff = Backoff::new();

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            self.set_state(ConnState::Connecting).await;

            match self.connect_and_serve(&mut backoff).await {
                Ok(ServeExit::Shutdown) => break,
                Ok(ServeExit::Reconfigured) => {
                    debug!(pool = %self.config.id, "Reconnecting with new configuration");
                    self.teardown_connection_state();
                    backoff.reset();
                    continue;
                }
                Err(e) => {
                    self.events
                        .pool_disconnected(self.config.id, &e.to_string());
                    warn!(pool = %self.config.id, error = %e, "Upstream connection lost");
                }
            }

            self.teardown_connection_state();
            self.set_state(ConnState::Reconnecting).await;
            self.counters.pool_reconnects.inc(self.config.id);

            let delay = backoff.next();
            debug!(pool = %self.config.id, delay_ms = delay.as_millis() as u64, "Backing off before reconnect");

            let deadline = tokio::time::sleep(delay);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    _ = self.shutdown.cancelled() => {
                        self.set_state(ConnState::Down).await;
                        return;
                    }
                    Some(cmd) = self.cmd_rx.recv() => {
                        if self.handle_command_while_down(cmd) {
                            // Reconfigured: retry immediately
                            backoff.reset();
                            break;
                        }
                    }
                }
            }
        }

        self.teardown_connection_state();
        self.set_state(ConnState::Down).await;
    }

    /// Commands arriving while disconnected. Submits cannot succeed and
    /// are failed fast. Returns true when a reconfigure should cut the
    /// backoff short.
    fn handle_command_while_down(&mut self, cmd: UpstreamCommand) -> bool {
        match cmd {
            UpstreamCommand::Submit { outcome_tx, .. } => {
                let _ = outcome_tx.send(SubmitOutcome::Rejected {
                    code: error_codes::OTHER,
                    message: "Pool disconnected".to_string(),
                    error: json!([error_codes::OTHER, "Pool disconnected", Value::Null]),
                });
                false
            }
            UpstreamCommand::Reconfigure(config) => {
                let changed = config != self.config;
                self.config = config;
                changed
            }
        }
    }

    /// Drop per-connection protocol state. Jobs move to the eviction log
    /// so late submits stay decidable under the stale grace window.
    fn teardown_connection_state(&mut self) {
        self.jobs.clear();
        self.timeout_streak = 0;
        for (_, pending) in self.pending.drain() {
            let _ = pending.outcome_tx.send(SubmitOutcome::Timeout);
        }
        self.publish();
    }

    async fn connect_and_serve(&mut self, backoff: &mut Backoff) -> StratumResult<ServeExit> {
        let (host, port) = self
            .redirect
            .take()
            .unwrap_or_else(|| (self.config.host.clone(), self.config.port));

        let mut conn = tokio::time::timeout(CONNECT_TIMEOUT, stratum::connect(&host, port, self.config.tls))
            .await
            .map_err(|_| StratumError::ConnectionFailed("connect timeout".to_string()))??;

        self.handshake(conn.as_mut()).await?;
        backoff.reset();
        self.serve(conn.as_mut()).await
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Send a request and wait for its response, handling notifications
    /// that arrive interleaved. Stratum pools freely mix `mining.notify`
    /// and `mining.set_difficulty` into the handshake.
    async fn send_request(
        &mut self,
        conn: &mut dyn Transport,
        method: &str,
        params: Value,
        timeout_dur: Duration,
    ) -> StratumResult<JsonRpcMessage> {
        use tokio::time::timeout;

        let id = self.next_id();
        let msg = JsonRpcMessage::request(id, method, params);
        conn.write_message(&msg).await?;
        self.counters.messages_tx_upstream.inc(self.config.id);

        timeout(timeout_dur, async {
            loop {
                tokio::select! {
                    result = conn.read_message() => {
                        let msg = result?.ok_or(StratumError::Disconnected)?;
                        self.counters.messages_rx_upstream.inc(self.config.id);

                        match msg {
                            JsonRpcMessage::Response { id: resp_id, .. } if resp_id == id => {
                                return Ok(msg);
                            }
                            JsonRpcMessage::Response { id: other_id, result, error } => {
                                // A submit response may race the handshake of a
                                // reconfigure cycle; resolve it normally.
                                self.resolve_pending(other_id, result, error);
                            }
                            JsonRpcMessage::Request { id: None, method, params } => {
                                self.handle_notification(&method, &params).await?;
                            }
                            JsonRpcMessage::Request { id: Some(_), method, .. } => {
                                warn!(pool = %self.config.id, method = %method, "Server sent request during setup");
                            }
                        }
                    }

                    _ = self.shutdown.cancelled() => {
                        return Err(StratumError::Disconnected);
                    }
                }
            }
        })
        .await
        .map_err(|_| StratumError::Timeout)?
    }

    /// Request version rolling via `mining.configure`.
    ///
    /// Optional extension: error responses and timeouts degrade to no
    /// version rolling rather than failing the session.
    async fn configure_version_rolling(
        &mut self,
        conn: &mut dyn Transport,
    ) -> StratumResult<Option<u32>> {
        let result = self
            .send_request(
                conn,
                "mining.configure",
                json!([
                    ["version-rolling"],
                    {"version-rolling.mask": "1fffe000"}
                ]),
                Duration::from_secs(5),
            )
            .await;

        match result {
            Ok(JsonRpcMessage::Response {
                result: Some(result),
                error: None,
                ..
            }) => {
                let obj = match result.as_object() {
                    Some(obj) => obj,
                    None => return Ok(None),
                };
                let accepted = obj
                    .get("version-rolling")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if !accepted {
                    debug!(pool = %self.config.id, "Pool declined version rolling");
                    return Ok(None);
                }
                let mask = obj
                    .get("version-rolling.mask")
                    .and_then(Value::as_str)
                    .and_then(|s| u32::from_str_radix(s.trim_start_matches("0x"), 16).ok());
                Ok(mask)
            }
            Ok(JsonRpcMessage::Response { error: Some(_), .. }) | Err(StratumError::Timeout) => {
                debug!(pool = %self.config.id, "Pool doesn't support mining.configure");
                Ok(None)
            }
            Err(e) => Err(e),
            _ => Ok(None),
        }
    }

    async fn subscribe(&mut self, conn: &mut dyn Transport) -> StratumResult<()> {
        let user_agent = self.config.user_agent.clone();
        let response = self
            .send_request(conn, "mining.subscribe", json!([user_agent]), REQUEST_TIMEOUT)
            .await?;

        match response {
            JsonRpcMessage::Response {
                result: Some(result),
                error: None,
                ..
            } => {
                // Result: [[subscriptions...], extranonce1, extranonce2_size]
                let arr = result.as_array().ok_or_else(|| {
                    StratumError::InvalidMessage("subscribe result not an array".to_string())
                })?;
                if arr.len() < 3 {
                    return Err(StratumError::InvalidMessage(
                        "subscribe result too short".to_string(),
                    ));
                }

                let extranonce1 = arr[1]
                    .as_str()
                    .ok_or_else(|| {
                        StratumError::InvalidMessage("extranonce1 not a string".to_string())
                    })?
                    .to_string();
                let extranonce2_size = arr[2].as_u64().ok_or_else(|| {
                    StratumError::InvalidMessage("extranonce2_size not a number".to_string())
                })? as usize;

                debug!(
                    pool = %self.config.id,
                    extranonce1 = %extranonce1,
                    extranonce2_size,
                    "Subscribed"
                );

                self.extranonce1 = extranonce1;
                self.extranonce2_size = extranonce2_size;
                self.publish();
                Ok(())
            }
            JsonRpcMessage::Response {
                error: Some(error), ..
            } => Err(StratumError::SubscriptionFailed(format!("{error:?}"))),
            _ => Err(StratumError::UnexpectedResponse(
                "invalid subscribe response".to_string(),
            )),
        }
    }

    async fn authorize(&mut self, conn: &mut dyn Transport) -> StratumResult<()> {
        let username = self.config.username.clone();
        let password = self.config.password.clone();
        let response = self
            .send_request(
                conn,
                "mining.authorize",
                json!([username, password]),
                REQUEST_TIMEOUT,
            )
            .await?;

        match response {
            JsonRpcMessage::Response {
                result: Some(result),
                error: None,
                ..
            } => {
                if result.as_bool().unwrap_or(false) {
                    Ok(())
                } else {
                    Err(StratumError::AuthorizationFailed(
                        "pool returned false".to_string(),
                    ))
                }
            }
            JsonRpcMessage::Response {
                error: Some(error), ..
            } => Err(StratumError::AuthorizationFailed(format!("{error:?}"))),
            _ => Err(StratumError::UnexpectedResponse(
                "invalid authorize response".to_string(),
            )),
        }
    }

    /// Send `mining.extranonce.subscribe`; tolerated if refused.
    async fn extranonce_subscribe(&mut self, conn: &mut dyn Transport) -> StratumResult<()> {
        match self
            .send_request(conn, "mining.extranonce.subscribe", json!([]), Duration::from_secs(5))
            .await
        {
            Ok(_) => Ok(()),
            Err(StratumError::Timeout) => {
                debug!(pool = %self.config.id, "No response to extranonce.subscribe");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Walk the handshake in flavour order.
    ///
    /// `ck-type` pools require `mining.extranonce.subscribe` before
    /// authorize and may push difficulty ahead of the first job; the
    /// interleaved-notification handling in `send_request` records that
    /// difficulty so the first job is issued against it.
    async fn handshake(&mut self, conn: &mut dyn Transport) -> StratumResult<()> {
        self.set_state(ConnState::Subscribing).await;

        self.version_mask = self.configure_version_rolling(conn).await?;
        self.subscribe(conn).await?;

        if self.config.flavour == PoolFlavour::CkType {
            self.extranonce_subscribe(conn).await?;
        }

        self.set_state(ConnState::Authorizing).await;
        self.authorize(conn).await?;

        if self.config.flavour == PoolFlavour::Generic && self.config.extranonce_subscribe {
            self.extranonce_subscribe(conn).await?;
        }

        debug!(pool = %self.config.id, "Authorized");
        self.set_state(ConnState::Ready).await;
        Ok(())
    }

    /// Main loop in `Ready`.
    async fn serve(&mut self, conn: &mut dyn Transport) -> StratumResult<ServeExit> {
        let mut sweep = tokio::time::interval(PENDING_SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_rx = tokio::time::Instant::now();

        loop {
            let idle = tokio::time::sleep_until(last_rx + IDLE_READ_TIMEOUT);
            tokio::pin!(idle);

            tokio::select! {
                msg = conn.read_message() => {
                    last_rx = tokio::time::Instant::now();
                    match msg {
                        Ok(Some(JsonRpcMessage::Request { id: None, method, params })) => {
                            self.counters.messages_rx_upstream.inc(self.config.id);
                            self.handle_notification(&method, &params).await?;
                        }
                        Ok(Some(JsonRpcMessage::Response { id, result, error })) => {
                            self.counters.messages_rx_upstream.inc(self.config.id);
                            self.resolve_pending(id, result, error);
                        }
                        Ok(Some(JsonRpcMessage::Request { id: Some(_), method, .. })) => {
                            warn!(pool = %self.config.id, method = %method, "Server sent request, ignoring");
                        }
                        Ok(None) => return Err(StratumError::Disconnected),
                        Err(e @ StratumError::InvalidMessage(_)) | Err(e @ StratumError::LineTooLong) => {
                            // Malformed traffic from a pool: close and reconnect
                            self.events.protocol_error(self.config.id.label(), &e.to_string());
                            return Err(e);
                        }
                        Err(e) => return Err(e),
                    }
                }

                Some(cmd) = self.cmd_rx.recv() => {
                    match cmd {
                        UpstreamCommand::Submit { submit, outcome_tx } => {
                            self.send_submit(conn, submit, outcome_tx).await?;
                        }
                        UpstreamCommand::Reconfigure(config) => {
                            if config != self.config {
                                self.config = config;
                                return Ok(ServeExit::Reconfigured);
                            }
                        }
                    }
                }

                _ = sweep.tick() => {
                    if self.sweep_pending() {
                        warn!(pool = %self.config.id, "Submit timeout streak, forcing reconnect");
                        return Err(StratumError::Timeout);
                    }
                }

                _ = &mut idle => {
                    warn!(pool = %self.config.id, "No traffic for {}s, forcing reconnect", IDLE_READ_TIMEOUT.as_secs());
                    return Err(StratumError::Timeout);
                }

                _ = self.shutdown.cancelled() => {
                    return Ok(ServeExit::Shutdown);
                }
            }
        }
    }

    async fn send_submit(
        &mut self,
        conn: &mut dyn Transport,
        submit: UpstreamSubmit,
        outcome_tx: oneshot::Sender<SubmitOutcome>,
    ) -> StratumResult<()> {
        let id = self.next_id();

        let mut params = vec![
            json!(self.config.username),
            json!(submit.pool_job_id),
            json!(submit.extranonce2),
            json!(submit.ntime),
            json!(submit.nonce),
        ];
        if let Some(version_bits) = &submit.version_bits {
            params.push(json!(version_bits));
        }

        trace!(pool = %self.config.id, submit_id = id, job_id = %submit.pool_job_id, "Submitting share");

        self.pending.insert(
            id,
            PendingSubmit {
                outcome_tx,
                sent_at: Instant::now(),
            },
        );

        let msg = JsonRpcMessage::request(id, "mining.submit", Value::Array(params));
        conn.write_message(&msg).await?;
        self.counters.messages_tx_upstream.inc(self.config.id);
        Ok(())
    }

    /// Pair a response with its pending submit.
    fn resolve_pending(&mut self, id: u64, result: Option<Value>, error: Option<Value>) {
        let pending = match self.pending.remove(&id) {
            Some(pending) => pending,
            None => {
                debug!(pool = %self.config.id, msg_id = id, "Stray response");
                return;
            }
        };

        self.timeout_streak = 0;

        let outcome = match (result, error) {
            (_, Some(error)) => {
                let (code, message) = parse_error_array(&error);
                SubmitOutcome::Rejected {
                    code,
                    message,
                    error,
                }
            }
            (Some(result), None) => {
                if result.as_bool().unwrap_or(false) {
                    SubmitOutcome::Accepted
                } else {
                    // Some pools reject with a bare false result
                    SubmitOutcome::Rejected {
                        code: error_codes::OTHER,
                        message: "Pool returned false".to_string(),
                        error: Value::Null,
                    }
                }
            }
            (None, None) => SubmitOutcome::Rejected {
                code: error_codes::OTHER,
                message: "Empty response".to_string(),
                error: Value::Null,
            },
        };

        let _ = pending.outcome_tx.send(outcome);
    }

    /// Time out pending submits past the deadline. Returns true when the
    /// streak marks the pool unhealthy.
    fn sweep_pending(&mut self) -> bool {
        self.sweep_pending_at(Instant::now())
    }

    fn sweep_pending_at(&mut self, now: Instant) -> bool {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.sent_at) >= SUBMIT_TIMEOUT)
            .map(|(&id, _)| id)
            .collect();

        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                warn!(pool = %self.config.id, submit_id = id, "Share submit timed out");
                self.counters.share_timeouts.inc(self.config.id);
                self.timeout_streak += 1;
                let _ = pending.outcome_tx.send(SubmitOutcome::Timeout);
            }
        }

        self.timeout_streak >= UNHEALTHY_TIMEOUT_STREAK
    }

    async fn handle_notification(&mut self, method: &str, params: &Value) -> StratumResult<()> {
        match method {
            "mining.notify" => {
                let arr = params.as_array().ok_or_else(|| {
                    StratumError::InvalidMessage("mining.notify params not an array".to_string())
                })?;
                let job = JobRecord::from_notify_params(self.config.id, arr, self.difficulty)
                    .map_err(StratumError::InvalidMessage)?;
                let job = Arc::new(job);

                trace!(pool = %self.config.id, job_id = %job.pool_job_id, clean = job.clean_jobs, "New job");

                self.jobs.push(job.clone());
                self.last_job_at = Some(Instant::now());
                self.publish();
                self.emit(UpstreamEvent::NewJob {
                    pool: self.config.id,
                    job,
                })
                .await;
            }
            "mining.set_difficulty" => {
                let difficulty = params
                    .as_array()
                    .and_then(|arr| arr.first())
                    .and_then(Value::as_f64)
                    .ok_or_else(|| {
                        StratumError::InvalidMessage("set_difficulty params invalid".to_string())
                    })?;

                debug!(pool = %self.config.id, difficulty, "Difficulty changed");
                self.difficulty = difficulty;
                self.publish();
                self.emit(UpstreamEvent::DifficultyChanged {
                    pool: self.config.id,
                    difficulty,
                })
                .await;
            }
            "mining.set_extranonce" => {
                let arr = params.as_array().ok_or_else(|| {
                    StratumError::InvalidMessage("set_extranonce params not an array".to_string())
                })?;
                let extranonce1 = arr
                    .first()
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        StratumError::InvalidMessage("extranonce1 not a string".to_string())
                    })?
                    .to_string();
                let extranonce2_size = arr.get(1).and_then(Value::as_u64).ok_or_else(|| {
                    StratumError::InvalidMessage("extranonce2_size not a number".to_string())
                })? as usize;

                debug!(pool = %self.config.id, extranonce1 = %extranonce1, extranonce2_size, "Extranonce changed");
                self.extranonce1 = extranonce1;
                self.extranonce2_size = extranonce2_size;
                // Jobs issued against the old extranonce are no longer minable
                self.jobs.clear();
                self.publish();
                self.events.extranonce_change(self.config.id);
                self.emit(UpstreamEvent::ExtranonceChanged {
                    pool: self.config.id,
                })
                .await;
            }
            "mining.set_version_mask" => {
                if let Some(mask) = params
                    .as_array()
                    .and_then(|arr| arr.first())
                    .and_then(Value::as_str)
                    .and_then(|s| u32::from_str_radix(s.trim_start_matches("0x"), 16).ok())
                {
                    self.version_mask = Some(mask);
                    self.publish();
                }
            }
            "client.reconnect" => {
                // Honour a suggested host/port for the next attempt
                if let Some(arr) = params.as_array() {
                    let host = arr.first().and_then(Value::as_str).map(str::to_owned);
                    let port = arr
                        .get(1)
                        .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
                        .and_then(|p| u16::try_from(p).ok());
                    if let (Some(host), Some(port)) = (host, port) {
                        if !host.is_empty() {
                            debug!(pool = %self.config.id, host = %host, port, "Pool requested reconnect with redirect");
                            self.redirect = Some((host, port));
                        }
                    }
                }
                return Err(StratumError::Disconnected);
            }
            _ => {
                warn!(pool = %self.config.id, method = %method, "Unknown notification method");
            }
        }
        Ok(())
    }

    async fn set_state(&mut self, state: ConnState) {
        if self.state == state {
            return;
        }
        debug!(pool = %self.config.id, ?state, "Connection state changed");
        self.state = state;
        self.publish();
        self.emit(UpstreamEvent::StateChanged {
            pool: self.config.id,
            state,
        })
        .await;
    }

    async fn emit(&self, event: UpstreamEvent) {
        // The hub outliving sessions is a shutdown-ordering detail only
        let _ = self.event_tx.send(event).await;
    }

    /// Replace the published snapshot.
    fn publish(&self) {
        let _ = self.snapshot_tx.send_replace(UpstreamSnapshot {
            state: self.state,
            extranonce1: self.extranonce1.clone(),
            extranonce2_size: self.extranonce2_size,
            difficulty: self.difficulty,
            version_rolling_mask: self.version_mask,
            jobs: self.jobs.clone(),
            last_job_at: self.last_job_at,
        });
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Build a handle backed by a test-controlled snapshot, returning
    /// the command receiver so tests can observe submits and the watch
    /// sender so tests can mutate the snapshot.
    pub fn stub_handle(
        id: PoolId,
        snapshot: UpstreamSnapshot,
    ) -> (
        UpstreamHandle,
        mpsc::Receiver<UpstreamCommand>,
        watch::Sender<UpstreamSnapshot>,
    ) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (snapshot_tx, snapshot_rx) = watch::channel(snapshot);
        (
            UpstreamHandle {
                id,
                cmd_tx,
                snapshot_rx,
            },
            cmd_rx,
            snapshot_tx,
        )
    }

    /// Snapshot for a Ready pool with the given extranonce geometry.
    pub fn ready_snapshot(extranonce1: &str, extranonce2_size: usize, difficulty: f64) -> UpstreamSnapshot {
        UpstreamSnapshot {
            state: ConnState::Ready,
            extranonce1: extranonce1.to_string(),
            extranonce2_size,
            difficulty,
            version_rolling_mask: None,
            jobs: JobRing::new(),
            last_job_at: None,
        }
    }
}
