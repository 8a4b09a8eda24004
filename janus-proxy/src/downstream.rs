//! Downstream miner sessions.
//!
//! One session per connected miner, structured as a task trio: a reader
//! task that frames lines off the socket, a writer task that is the sole
//! holder of the write half, and the session task that owns all protocol
//! state. Commands from the scheduler hub arrive on a bounded channel.
//!
//! The miner sees a stable proxy-minted extranonce1 and proxy-minted job
//! ids; pool switches re-route the session without reconnecting it. On a
//! switch the miner is always sent `mining.set_difficulty` followed by a
//! `mining.notify` with `clean_jobs` forced true, in that order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::PoolEntry;
use crate::events::EventSink;
use crate::extranonce::{mint_extranonce1, ExtranonceLayout};
use crate::job::JobRecord;
use crate::metrics::Counters;
use crate::router::{
    AttributionMap, JobAttribution, RecentSubmits, ShareRouter, SubmitDisposition, SubmitRequest,
    RECENT_SUBMIT_MAX_AGE,
};
use crate::scheduler::Scheduler;
use crate::stratum::{error_codes, JsonRpcMessage, MAX_LINE_BYTES};
use crate::types::{MinerId, PoolId, SubmitOutcome};
use crate::upstream::{ConnState, Upstreams};

/// How often per-session state is pruned.
const SESSION_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Read-half drain allowance at shutdown.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);

/// Miner protocol states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum DownstreamState {
    Hello,
    Subscribed,
    Authorized,
    Active,
    Closing,
}

/// Commands from the supervisor hub and scheduler.
#[derive(Debug, Clone)]
pub enum DownstreamCommand {
    /// Route the miner to a pool; sends difficulty then a clean job.
    AssignPool { to: PoolId },
    /// No pool available; stop forwarding work.
    Quiesce,
    /// A pool produced a job; forwarded only if that pool is active.
    PoolJob { pool: PoolId, job: Arc<JobRecord> },
    /// A pool changed difficulty; forwarded only if active.
    PoolDifficulty { pool: PoolId, difficulty: f64 },
}

/// Live session status for the registry and the dashboard.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DownstreamStatus {
    pub miner: MinerId,
    pub peer: String,
    pub state: DownstreamState,
    pub worker: String,
    pub active_pool: Option<PoolId>,
    pub advertised_difficulty: u64,
}

impl DownstreamStatus {
    pub fn connecting(miner: MinerId, peer: String) -> Self {
        Self {
            miner,
            peer,
            state: DownstreamState::Hello,
            worker: String::new(),
            active_pool: None,
            advertised_difficulty: 0,
        }
    }
}

/// Handle kept in the supervisor's registry.
#[derive(Clone)]
pub struct DownstreamHandle {
    pub miner: MinerId,
    pub cmd_tx: mpsc::Sender<DownstreamCommand>,
    pub status_rx: watch::Receiver<DownstreamStatus>,
}

impl DownstreamHandle {
    /// True once the session task has exited.
    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    pub fn status(&self) -> DownstreamStatus {
        self.status_rx.borrow().clone()
    }
}

/// Downstream difficulty clamping for one pool's jobs.
///
/// Keeps a pool's vardiff from forcing unusably low (or high) values on
/// miners, and rounds up to an integer: some miners ignore fractional
/// difficulty params.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffPolicy {
    pub min: f64,
    pub max: f64,
}

impl DiffPolicy {
    pub fn from_entry(entry: &PoolEntry) -> Self {
        Self {
            min: entry.diff_min,
            max: entry.diff_max,
        }
    }

    /// Clamp and ceil to an integer difficulty, at least 1.
    pub fn clamp(&self, difficulty: f64) -> u64 {
        let mut d = difficulty;
        if self.min > 0.0 && d < self.min {
            d = self.min;
        }
        if self.max > 0.0 && d > self.max {
            d = self.max;
        }
        (d.ceil() as u64).max(1)
    }
}

/// Everything a session needs from the supervisor.
#[derive(Clone)]
pub struct SessionContext {
    pub miner: MinerId,
    pub peer: String,
    pub upstreams: Upstreams,
    pub scheduler: Arc<Scheduler>,
    pub router: Arc<ShareRouter>,
    pub counters: Arc<Counters>,
    pub events: EventSink,
    /// Global proxy job id counter, supervisor-owned.
    pub job_seq: Arc<AtomicU64>,
    /// extranonce2 size advertised to the miner.
    pub extranonce2_size: usize,
    /// Worker allowlist; empty allows all.
    pub allowed_workers: Arc<Vec<String>>,
    pub diff_policies: [DiffPolicy; 2],
    pub shutdown: CancellationToken,
}

/// Reduce a miner username (`wallet.worker` shapes) to its worker tag.
fn extract_worker_name(user: &str) -> String {
    let user = user.trim();
    if user.is_empty() {
        return "unknown".to_string();
    }
    match user.rsplit_once('.') {
        Some((_, last)) if !last.trim().is_empty() => last.trim().to_string(),
        _ => user.to_string(),
    }
}

/// Run a miner session to completion.
pub async fn run_session<S>(
    stream: S,
    ctx: SessionContext,
    cmd_rx: mpsc::Receiver<DownstreamCommand>,
    status_tx: watch::Sender<DownstreamStatus>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);

    let (line_tx, line_rx) = mpsc::channel::<Result<String, &'static str>>(64);
    let (writer_tx, writer_rx) = mpsc::channel::<String>(256);

    let reader = tokio::spawn(reader_task(BufReader::new(read_half), line_tx));
    let writer = tokio::spawn(writer_task(BufWriter::new(write_half), writer_rx));

    Counters::inc(&ctx.counters.miner_connections_total);
    Counters::inc(&ctx.counters.miner_connections_active);
    ctx.events.miner_connected(ctx.miner, &ctx.peer);

    let session = Session {
        extranonce1: mint_extranonce1(ctx.miner),
        ctx,
        writer_tx,
        status_tx,
        state: DownstreamState::Hello,
        worker: String::new(),
        active: None,
        advertised_difficulty: 0,
        jobs: AttributionMap::default(),
        recent: RecentSubmits::default(),
        layout_error_flagged: [false; 2],
    };

    let ctx = session.ctx.clone();
    session.serve(line_rx, cmd_rx).await;

    ctx.scheduler.deregister_miner(ctx.miner);
    Counters::dec(&ctx.counters.miner_connections_active);
    ctx.events.miner_disconnected(ctx.miner, &ctx.peer);

    // Writer exits once the session's senders are dropped; give the read
    // half a short drain, then stop caring.
    let _ = writer.await;
    let _ = tokio::time::timeout(SHUTDOWN_DRAIN, reader).await;
}

/// Frame lines off the read half into the session channel.
async fn reader_task<R>(mut reader: BufReader<R>, line_tx: mpsc::Sender<Result<String, &'static str>>)
where
    R: AsyncRead + Unpin,
{
    use tokio::io::AsyncBufReadExt;

    let mut buf = String::with_capacity(1024);
    loop {
        buf.clear();
        match reader.read_line(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.len() > MAX_LINE_BYTES {
                    let _ = line_tx.send(Err("line exceeds framing limit")).await;
                    break;
                }
                let line = buf.trim();
                if line.is_empty() {
                    continue;
                }
                if line_tx.send(Ok(line.to_string())).await.is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
}

/// Sole owner of the write half; serializes all outbound lines.
async fn writer_task<W>(mut writer: BufWriter<W>, mut writer_rx: mpsc::Receiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = writer_rx.recv().await {
        if writer.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        if writer.write_all(b"\n").await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

struct Session {
    ctx: SessionContext,
    writer_tx: mpsc::Sender<String>,
    status_tx: watch::Sender<DownstreamStatus>,

    state: DownstreamState,
    worker: String,
    /// Proxy-minted extranonce1 advertised to this miner.
    extranonce1: String,
    active: Option<PoolId>,
    /// Last difficulty written downstream; 0 before the first.
    advertised_difficulty: u64,
    jobs: AttributionMap,
    recent: RecentSubmits,
    /// Layout mismatch already reported, per pool.
    layout_error_flagged: [bool; 2],
}

impl Session {
    async fn serve(
        mut self,
        mut line_rx: mpsc::Receiver<Result<String, &'static str>>,
        mut cmd_rx: mpsc::Receiver<DownstreamCommand>,
    ) {
        let mut prune = tokio::time::interval(SESSION_PRUNE_INTERVAL);
        prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                line = line_rx.recv() => match line {
                    Some(Ok(line)) => {
                        Counters::inc(&self.ctx.counters.messages_rx_downstream);
                        if !self.handle_line(&line).await {
                            break;
                        }
                    }
                    Some(Err(violation)) => {
                        self.close_with_violation(violation).await;
                        break;
                    }
                    None => break, // miner hung up
                },

                Some(cmd) = cmd_rx.recv() => {
                    self.handle_command(cmd).await;
                }

                _ = prune.tick() => {
                    self.recent.prune(RECENT_SUBMIT_MAX_AGE);
                }

                _ = self.ctx.shutdown.cancelled() => {
                    // Ask the miner to come back once we're up again
                    self.send(&JsonRpcMessage::notification(
                        "client.reconnect",
                        json!([]),
                    )).await;
                    break;
                }
            }
        }

        self.state = DownstreamState::Closing;
        self.publish_status();
    }

    /// Returns false when the session must close.
    async fn handle_line(&mut self, line: &str) -> bool {
        let msg: JsonRpcMessage = match serde_json::from_str(line) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(miner = self.ctx.miner, error = %e, "Malformed message from miner");
                self.close_with_violation("malformed JSON").await;
                return false;
            }
        };

        match msg {
            JsonRpcMessage::Request {
                id: Some(id),
                method,
                params,
            } => self.handle_request(id, &method, &params).await,
            JsonRpcMessage::Request {
                id: None, method, ..
            } => {
                trace!(miner = self.ctx.miner, method = %method, "Ignoring miner notification");
                true
            }
            JsonRpcMessage::Response { .. } => {
                trace!(miner = self.ctx.miner, "Ignoring response from miner");
                true
            }
        }
    }

    async fn handle_request(&mut self, id: u64, method: &str, params: &Value) -> bool {
        match method {
            "mining.subscribe" => self.on_subscribe(id).await,
            "mining.authorize" => self.on_authorize(id, params).await,
            "mining.submit" => self.on_submit(id, params).await,
            "mining.suggest_difficulty" => {
                // Accepted but advisory; difficulty follows the active
                // pool's policy-clamped value
                let suggested = params
                    .as_array()
                    .and_then(|arr| arr.first())
                    .and_then(Value::as_f64);
                trace!(miner = self.ctx.miner, suggested, "Miner suggested difficulty");
                self.send(&JsonRpcMessage::response_ok(id, json!(true))).await;
                true
            }
            "mining.extranonce.subscribe" => {
                // Accepted; the miner-facing extranonce geometry is
                // proxy-owned and never changes mid-session
                self.send(&JsonRpcMessage::response_ok(id, json!(true))).await;
                true
            }
            "mining.configure" => self.on_configure(id, params).await,
            _ => {
                debug!(miner = self.ctx.miner, method = %method, "Unknown method from miner");
                self.send(&JsonRpcMessage::response_err(
                    id,
                    error_codes::METHOD_NOT_FOUND,
                    "Method not found",
                ))
                .await;
                true
            }
        }
    }

    async fn on_subscribe(&mut self, id: u64) -> bool {
        let result = json!([
            [
                ["mining.set_difficulty", self.extranonce1],
                ["mining.notify", self.extranonce1]
            ],
            self.extranonce1,
            self.ctx.extranonce2_size
        ]);
        self.send(&JsonRpcMessage::response_ok(id, result)).await;

        if self.state == DownstreamState::Hello {
            self.state = DownstreamState::Subscribed;
            self.publish_status();
        }
        true
    }

    async fn on_authorize(&mut self, id: u64, params: &Value) -> bool {
        let username = params
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(Value::as_str)
            .unwrap_or_default();
        let worker = extract_worker_name(username);

        if !self.ctx.allowed_workers.is_empty()
            && !self.ctx.allowed_workers.iter().any(|w| w == &worker)
        {
            warn!(miner = self.ctx.miner, worker = %worker, "Worker not in allowlist");
            self.send(&JsonRpcMessage::response_err(
                id,
                error_codes::UNAUTHORIZED_WORKER,
                "Unauthorized worker",
            ))
            .await;
            return true;
        }

        self.worker = worker;
        self.send(&JsonRpcMessage::response_ok(id, json!(true))).await;

        if matches!(self.state, DownstreamState::Hello | DownstreamState::Subscribed) {
            self.state = DownstreamState::Authorized;
            debug!(miner = self.ctx.miner, worker = %self.worker, "Miner authorized");

            match self
                .ctx
                .scheduler
                .register_miner(self.ctx.miner, Instant::now())
            {
                Some(pool) => self.activate(pool).await,
                None => {
                    self.ctx.events.pool_unavailable(self.ctx.miner);
                    self.publish_status();
                }
            }
        }
        true
    }

    async fn on_configure(&mut self, id: u64, params: &Value) -> bool {
        // Version rolling passes through only when both upstreams
        // negotiated a mask; submits carry the miner's version_bits.
        let requested_mask = params
            .as_array()
            .and_then(|arr| arr.get(1))
            .and_then(Value::as_object)
            .and_then(|obj| obj.get("version-rolling.mask"))
            .and_then(Value::as_str)
            .and_then(|s| u32::from_str_radix(s.trim_start_matches("0x"), 16).ok())
            .unwrap_or(0x1fffe000);

        let mask_a = self.ctx.upstreams.a.snapshot().version_rolling_mask;
        let mask_b = self.ctx.upstreams.b.snapshot().version_rolling_mask;

        let combined = match (mask_a, mask_b) {
            (Some(a), Some(b)) => {
                let mask = a & b & requested_mask;
                (mask != 0).then_some(mask)
            }
            _ => None,
        };

        let result = match combined {
            Some(mask) => json!({
                "version-rolling": true,
                "version-rolling.mask": format!("{mask:08x}"),
            }),
            None => json!({ "version-rolling": false }),
        };
        self.send(&JsonRpcMessage::response_ok(id, result)).await;
        true
    }

    async fn on_submit(&mut self, id: u64, params: &Value) -> bool {
        if !matches!(
            self.state,
            DownstreamState::Authorized | DownstreamState::Active
        ) {
            self.send(&JsonRpcMessage::response_err(
                id,
                error_codes::UNAUTHORIZED_WORKER,
                "Unauthorized worker",
            ))
            .await;
            return true;
        }

        Counters::inc(&self.ctx.counters.shares_submitted);

        // Params: [username, job_id, extranonce2, ntime, nonce, version_bits?]
        let arr = match params.as_array() {
            Some(arr) if arr.len() >= 5 => arr,
            _ => {
                self.send(&JsonRpcMessage::response_err(
                    id,
                    error_codes::OTHER,
                    "Malformed submit",
                ))
                .await;
                return true;
            }
        };
        let field = |i: usize| arr.get(i).and_then(Value::as_str).map(str::to_owned);
        let request = match (field(1), field(2), field(3), field(4)) {
            (Some(proxy_job_id), Some(extranonce2), Some(ntime), Some(nonce)) => SubmitRequest {
                proxy_job_id,
                extranonce2,
                ntime,
                nonce,
                version_bits: field(5),
            },
            _ => {
                self.send(&JsonRpcMessage::response_err(
                    id,
                    error_codes::OTHER,
                    "Malformed submit",
                ))
                .await;
                return true;
            }
        };

        let disposition = self.ctx.router.route(
            self.ctx.miner,
            &request,
            &self.jobs,
            &mut self.recent,
            &self.ctx.upstreams,
            &self.extranonce1,
            self.ctx.extranonce2_size,
        );

        match disposition {
            SubmitDisposition::RejectLocal { code, message } => {
                trace!(
                    miner = self.ctx.miner,
                    job_id = %request.proxy_job_id,
                    code,
                    message,
                    "Submit rejected locally"
                );
                self.send(&JsonRpcMessage::response_err(id, code, message)).await;
            }
            SubmitDisposition::Forward {
                pool,
                difficulty,
                submit,
            } => {
                let outcome_rx = self.ctx.upstreams.get(pool).submit(submit);
                self.spawn_submit_response(id, pool, difficulty, outcome_rx);
            }
        }
        true
    }

    /// Pair the upstream outcome with the miner's request off-loop, so a
    /// slow pool never stalls the session.
    fn spawn_submit_response(
        &self,
        id: u64,
        pool: PoolId,
        difficulty: f64,
        outcome_rx: oneshot::Receiver<SubmitOutcome>,
    ) {
        let writer_tx = self.writer_tx.clone();
        let counters = self.ctx.counters.clone();
        let events = self.ctx.events.clone();
        let miner = self.ctx.miner;

        tokio::spawn(async move {
            let outcome = outcome_rx.await.unwrap_or(SubmitOutcome::Rejected {
                code: error_codes::OTHER,
                message: "Pool unavailable".to_string(),
                error: json!([error_codes::OTHER, "Pool unavailable", Value::Null]),
            });

            let response = match &outcome {
                SubmitOutcome::Accepted => {
                    counters.shares_accepted.inc(pool);
                    counters.accepted_difficulty.add(pool, difficulty);
                    events.share_result(pool, miner, true, None);
                    JsonRpcMessage::response_ok(id, json!(true))
                }
                SubmitOutcome::Rejected {
                    message, error, ..
                } => {
                    counters.shares_rejected.inc(pool);
                    events.share_result(pool, miner, false, Some(message.as_str()));
                    if error.is_null() {
                        // Pool rejected with a bare false result
                        JsonRpcMessage::Response {
                            id,
                            result: Some(json!(false)),
                            error: None,
                        }
                    } else {
                        // Echo the pool's error verbatim
                        JsonRpcMessage::Response {
                            id,
                            result: None,
                            error: Some(error.clone()),
                        }
                    }
                }
                SubmitOutcome::Timeout => {
                    events.share_result(pool, miner, false, Some("timeout"));
                    JsonRpcMessage::response_err(id, error_codes::OTHER, "Share submit timeout")
                }
                SubmitOutcome::StaleLocal => {
                    JsonRpcMessage::response_err(id, error_codes::JOB_NOT_FOUND, "Stale share")
                }
                SubmitOutcome::DuplicateLocal => JsonRpcMessage::response_err(
                    id,
                    error_codes::DUPLICATE_SHARE,
                    "Duplicate share",
                ),
            };

            if let Ok(line) = serde_json::to_string(&response) {
                if writer_tx.send(line).await.is_ok() {
                    Counters::inc(&counters.messages_tx_downstream);
                }
            }
        });
    }

    async fn handle_command(&mut self, cmd: DownstreamCommand) {
        match cmd {
            DownstreamCommand::AssignPool { to } => {
                if matches!(
                    self.state,
                    DownstreamState::Authorized | DownstreamState::Active
                ) {
                    self.activate(to).await;
                }
            }
            DownstreamCommand::Quiesce => {
                self.active = None;
                self.publish_status();
            }
            DownstreamCommand::PoolJob { pool, job } => {
                if self.active == Some(pool) && self.state == DownstreamState::Active {
                    let diff = self.ctx.diff_policies[pool.index()].clamp(job.difficulty);
                    if diff != self.advertised_difficulty {
                        self.send_difficulty(diff).await;
                    }
                    self.forward_job(pool, &job, job.clean_jobs).await;
                }
            }
            DownstreamCommand::PoolDifficulty { pool, difficulty } => {
                if self.active == Some(pool) && self.state == DownstreamState::Active {
                    let diff = self.ctx.diff_policies[pool.index()].clamp(difficulty);
                    if diff != self.advertised_difficulty {
                        self.send_difficulty(diff).await;
                        self.publish_status();
                    }
                }
            }
        }
    }

    /// Route the miner to `pool`: difficulty first, then the pool's
    /// latest job with `clean_jobs` forced true. The ordering is
    /// mandatory; reversing it causes reject storms on real miners.
    async fn activate(&mut self, pool: PoolId) {
        self.active = Some(pool);
        self.state = DownstreamState::Active;

        let snapshot = self.ctx.upstreams.get(pool).snapshot();
        if snapshot.state != ConnState::Ready {
            // Raced a disconnect; the scheduler will re-route shortly
            self.publish_status();
            return;
        }

        let diff = self.ctx.diff_policies[pool.index()].clamp(snapshot.difficulty);
        self.send_difficulty(diff).await;

        if let Some(job) = snapshot.jobs.latest() {
            self.forward_job(pool, job, true).await;
        }
        self.publish_status();
    }

    async fn send_difficulty(&mut self, difficulty: u64) {
        self.advertised_difficulty = difficulty;
        self.send(&JsonRpcMessage::notification(
            "mining.set_difficulty",
            json!([difficulty]),
        ))
        .await;
    }

    /// Rewrite and forward one job. Mints the proxy job id and records
    /// the attribution; the mapping never changes afterwards.
    async fn forward_job(&mut self, pool: PoolId, job: &Arc<JobRecord>, clean: bool) {
        let snapshot = self.ctx.upstreams.get(pool).snapshot();
        let layout = match ExtranonceLayout::resolve(
            &snapshot.extranonce1,
            snapshot.extranonce2_size,
            self.ctx.extranonce2_size,
        ) {
            Some(layout) => layout,
            None => {
                if !self.layout_error_flagged[pool.index()] {
                    self.layout_error_flagged[pool.index()] = true;
                    self.ctx.events.protocol_error(
                        pool.label(),
                        "extranonce2 budget cannot hold the proxy layout",
                    );
                }
                return;
            }
        };

        let proxy_job_id = format!("{:x}", self.ctx.job_seq.fetch_add(1, Ordering::Relaxed));
        self.jobs.insert(
            proxy_job_id.clone(),
            JobAttribution {
                pool,
                pool_job_id: job.pool_job_id.clone(),
                difficulty: job.difficulty,
            },
        );

        let params = json!([
            proxy_job_id,
            job.prevhash,
            layout.downstream_coinbase1(&job.coinbase1),
            layout.downstream_coinbase2(&job.coinbase2),
            job.merkle_branch,
            job.version,
            job.nbits,
            job.ntime,
            clean
        ]);
        self.send(&JsonRpcMessage::notification("mining.notify", params))
            .await;

        self.ctx.counters.jobs_forwarded.inc(pool);
        self.ctx
            .events
            .job_forwarded(self.ctx.miner, pool, &proxy_job_id, &job.pool_job_id);
    }

    async fn close_with_violation(&mut self, detail: &str) {
        self.ctx.events.protocol_error("downstream", detail);
        // Short diagnostic, then the session closes; the miner reconnects
        let diagnostic = json!({
            "id": Value::Null,
            "result": Value::Null,
            "error": [error_codes::OTHER, detail, Value::Null],
        });
        let _ = self.writer_tx.send(diagnostic.to_string()).await;
    }

    async fn send(&self, msg: &JsonRpcMessage) {
        match serde_json::to_string(msg) {
            Ok(line) => {
                if self.writer_tx.send(line).await.is_ok() {
                    Counters::inc(&self.ctx.counters.messages_tx_downstream);
                }
            }
            Err(e) => warn!(miner = self.ctx.miner, error = %e, "Failed to serialize message"),
        }
    }

    fn publish_status(&self) {
        let _ = self.status_tx.send_replace(DownstreamStatus {
            miner: self.ctx.miner,
            peer: self.ctx.peer.clone(),
            state: self.state,
            worker: self.worker.clone(),
            active_pool: self.active,
            advertised_difficulty: self.advertised_difficulty,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScheduleMode;
    use crate::job::JobRing;
    use crate::scheduler::SchedulerSettings;
    use crate::upstream::test_support::{ready_snapshot, stub_handle};
    use crate::upstream::{UpstreamCommand, UpstreamSnapshot};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, DuplexStream};

    fn test_job(pool: PoolId, id: &str, difficulty: f64) -> Arc<JobRecord> {
        Arc::new(JobRecord {
            pool,
            pool_job_id: id.to_string(),
            prevhash: "aa".repeat(32),
            coinbase1: "c1c1".into(),
            coinbase2: "c2c2".into(),
            merkle_branch: vec!["mm".repeat(32)],
            version: "20000000".into(),
            nbits: "1d00ffff".into(),
            ntime: "5a5a5a5a".into(),
            clean_jobs: false,
            received_at: Instant::now(),
            difficulty,
        })
    }

    struct Harness {
        /// Miner's side of the wire.
        miner_write: tokio::io::WriteHalf<DuplexStream>,
        miner_lines: tokio::io::Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
        cmd_tx: mpsc::Sender<DownstreamCommand>,
        status_rx: watch::Receiver<DownstreamStatus>,
        cmd_a: mpsc::Receiver<UpstreamCommand>,
        cmd_b: mpsc::Receiver<UpstreamCommand>,
        _snap_a: watch::Sender<UpstreamSnapshot>,
        _snap_b: watch::Sender<UpstreamSnapshot>,
        counters: Arc<Counters>,
        shutdown: CancellationToken,
    }

    impl Harness {
        async fn send_line(&mut self, line: &str) {
            self.miner_write
                .write_all(format!("{line}\n").as_bytes())
                .await
                .unwrap();
        }

        async fn recv_json(&mut self) -> Value {
            let line = tokio::time::timeout(Duration::from_secs(5), self.miner_lines.next_line())
                .await
                .expect("timed out waiting for proxy output")
                .unwrap()
                .expect("session closed unexpectedly");
            serde_json::from_str(&line).unwrap()
        }
    }

    fn harness() -> Harness {
        harness_with(|_| {})
    }

    fn harness_with(tweak: impl FnOnce(&mut SessionContext)) -> Harness {
        let mut snap_a = ready_snapshot("f1f1f1f1", 8, 1024.0);
        let mut ring = JobRing::new();
        ring.push(test_job(PoolId::A, "a-1", 1024.0));
        snap_a.jobs = ring;

        let mut snap_b = ready_snapshot("e2e2e2e2", 8, 2048.0);
        let mut ring = JobRing::new();
        ring.push(test_job(PoolId::B, "b-1", 2048.0));
        snap_b.jobs = ring;

        let (a, cmd_a, snap_a_tx) = stub_handle(PoolId::A, snap_a);
        let (b, cmd_b, snap_b_tx) = stub_handle(PoolId::B, snap_b);
        let upstreams = Upstreams { a, b };

        let t0 = Instant::now();
        let scheduler = Arc::new(Scheduler::new(
            SchedulerSettings {
                mode: ScheduleMode::Fixed,
                weight_a: 50,
                weight_b: 50,
                slot: Duration::from_secs(60),
                dwell_floor: Duration::from_secs(30),
                autobalance: Default::default(),
            },
            t0,
        ));
        scheduler.set_pool_ready(PoolId::A, true, t0);
        scheduler.set_pool_ready(PoolId::B, true, t0);

        let counters = Arc::new(Counters::default());
        let events = EventSink::default();
        let shutdown = CancellationToken::new();

        let mut ctx = SessionContext {
            miner: 7,
            peer: "127.0.0.1:40000".to_string(),
            upstreams,
            scheduler,
            router: Arc::new(ShareRouter::new(
                Duration::from_secs(20),
                counters.clone(),
                events.clone(),
            )),
            counters: counters.clone(),
            events,
            job_seq: Arc::new(AtomicU64::new(1)),
            extranonce2_size: 4,
            allowed_workers: Arc::new(Vec::new()),
            diff_policies: [DiffPolicy::default(); 2],
            shutdown: shutdown.clone(),
        };
        tweak(&mut ctx);

        let (miner_side, proxy_side) = tokio::io::duplex(64 * 1024);
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (status_tx, status_rx) =
            watch::channel(DownstreamStatus::connecting(7, ctx.peer.clone()));

        tokio::spawn(run_session(proxy_side, ctx, cmd_rx, status_tx));

        let (miner_read, miner_write) = tokio::io::split(miner_side);
        Harness {
            miner_write,
            miner_lines: BufReader::new(miner_read).lines(),
            cmd_tx,
            status_rx,
            cmd_a,
            cmd_b,
            _snap_a: snap_a_tx,
            _snap_b: snap_b_tx,
            counters,
            shutdown,
        }
    }

    /// Subscribe + authorize; returns the proxy job id from the first
    /// notify. Asserts the mandatory set_difficulty → notify ordering.
    async fn handshake(h: &mut Harness) -> String {
        h.send_line(r#"{"id":1,"method":"mining.subscribe","params":["miner/1.0"]}"#)
            .await;
        let reply = h.recv_json().await;
        assert_eq!(reply["id"], 1);
        // Result: [subscriptions, extranonce1, extranonce2_size]
        assert_eq!(reply["result"][1], "4a580007");
        assert_eq!(reply["result"][2], 4);

        h.send_line(r#"{"id":2,"method":"mining.authorize","params":["wallet.rig1","x"]}"#)
            .await;
        let reply = h.recv_json().await;
        assert_eq!(reply["result"], true);
        assert_eq!(reply["error"], Value::Null);

        // Initial routing: difficulty strictly before the clean job
        let diff = h.recv_json().await;
        assert_eq!(diff["method"], "mining.set_difficulty");
        let notify = h.recv_json().await;
        assert_eq!(notify["method"], "mining.notify");
        assert_eq!(notify["params"][8], true, "initial notify must be clean");

        notify["params"][0].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn subscribe_advertises_minted_extranonce() {
        let mut h = harness();
        let _ = handshake(&mut h).await;

        let status = h.status_rx.borrow().clone();
        assert_eq!(status.state, DownstreamState::Active);
        assert_eq!(status.worker, "rig1");
        assert_eq!(status.active_pool, Some(PoolId::A));
    }

    /// The forwarded job carries the upstream extranonce spliced into
    /// coinbase1 and a proxy-minted job id.
    #[tokio::test]
    async fn forwarded_job_is_rewritten() {
        let mut h = harness();

        h.send_line(r#"{"id":1,"method":"mining.subscribe","params":[]}"#).await;
        let _ = h.recv_json().await;
        h.send_line(r#"{"id":2,"method":"mining.authorize","params":["w.r","x"]}"#).await;
        let _ = h.recv_json().await;
        let _diff = h.recv_json().await;
        let notify = h.recv_json().await;

        // coinbase1 ends with pool A's extranonce1
        assert_eq!(notify["params"][2], "c1c1f1f1f1f1");
        assert_eq!(notify["params"][3], "c2c2");
        // job id is proxy-minted hex, not the pool's id
        assert_ne!(notify["params"][0], "a-1");
    }

    /// Scenario: submit accepted end to end, echoed verbatim.
    #[tokio::test]
    async fn submit_roundtrip_accepted() {
        let mut h = harness();
        let job_id = handshake(&mut h).await;

        h.send_line(&format!(
            r#"{{"id":10,"method":"mining.submit","params":["wallet.rig1","{job_id}","01020304","5a5a5a5a","deadbeef"]}}"#
        ))
        .await;

        // The upstream stub observes the laid-out submit
        let cmd = tokio::time::timeout(Duration::from_secs(5), h.cmd_a.recv())
            .await
            .unwrap()
            .unwrap();
        let outcome_tx = match cmd {
            UpstreamCommand::Submit { submit, outcome_tx } => {
                assert_eq!(submit.pool_job_id, "a-1");
                assert_eq!(submit.extranonce2, "4a58000701020304");
                assert_eq!(submit.nonce, "deadbeef");
                outcome_tx
            }
            _ => panic!("expected submit command"),
        };
        outcome_tx.send(SubmitOutcome::Accepted).unwrap();

        let reply = h.recv_json().await;
        assert_eq!(reply["id"], 10);
        assert_eq!(reply["result"], true);
        assert_eq!(reply["error"], Value::Null);

        assert_eq!(h.counters.shares_accepted.get(PoolId::A), 1);
        assert_eq!(h.counters.accepted_difficulty.get(PoolId::A), 1024.0);
    }

    /// Scenario: duplicate submit is rejected locally with code 22 and
    /// never reaches upstream twice.
    #[tokio::test]
    async fn duplicate_submit_rejected_locally() {
        let mut h = harness();
        let job_id = handshake(&mut h).await;

        let submit = format!(
            r#"{{"id":10,"method":"mining.submit","params":["wallet.rig1","{job_id}","01020304","5a5a5a5a","deadbeef"]}}"#
        );
        h.send_line(&submit).await;

        let cmd = tokio::time::timeout(Duration::from_secs(5), h.cmd_a.recv())
            .await
            .unwrap()
            .unwrap();
        if let UpstreamCommand::Submit { outcome_tx, .. } = cmd {
            outcome_tx.send(SubmitOutcome::Accepted).unwrap();
        }
        let first = h.recv_json().await;
        assert_eq!(first["result"], true);

        // Identical resubmit
        h.send_line(&submit.replace(r#""id":10"#, r#""id":11"#)).await;
        let second = h.recv_json().await;
        assert_eq!(second["id"], 11);
        assert_eq!(second["error"][0], 22);
        assert_eq!(second["error"][1], "Duplicate share");

        assert_eq!(
            h.counters
                .shares_rejected_duplicate
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
        // Upstream saw exactly one submit
        assert!(h.cmd_a.try_recv().is_err());
    }

    /// Property: on a pool switch the next two downstream messages are
    /// set_difficulty then notify with clean_jobs=true.
    #[tokio::test]
    async fn switch_sends_difficulty_then_clean_notify() {
        let mut h = harness();
        let _ = handshake(&mut h).await;

        h.cmd_tx
            .send(DownstreamCommand::AssignPool { to: PoolId::B })
            .await
            .unwrap();

        let diff = h.recv_json().await;
        assert_eq!(diff["method"], "mining.set_difficulty");
        assert_eq!(diff["params"][0], 2048);

        let notify = h.recv_json().await;
        assert_eq!(notify["method"], "mining.notify");
        assert_eq!(notify["params"][8], true);
        // Job now comes from pool B's cache
        assert_eq!(notify["params"][2], "c1c1e2e2e2e2");
    }

    /// Scenario: a submit against the old pool's job after a switch is
    /// attributed to the old pool.
    #[tokio::test]
    async fn late_submit_routes_to_issuing_pool() {
        let mut h = harness();
        let old_job = handshake(&mut h).await;

        h.cmd_tx
            .send(DownstreamCommand::AssignPool { to: PoolId::B })
            .await
            .unwrap();
        let _diff = h.recv_json().await;
        let _notify = h.recv_json().await;

        // Submit against the job issued while pool A was active
        h.send_line(&format!(
            r#"{{"id":20,"method":"mining.submit","params":["wallet.rig1","{old_job}","01020304","5a5a5a5a","cafebabe"]}}"#
        ))
        .await;

        let cmd = tokio::time::timeout(Duration::from_secs(5), h.cmd_a.recv())
            .await
            .expect("expected submit to pool A")
            .unwrap();
        match cmd {
            UpstreamCommand::Submit { submit, outcome_tx } => {
                assert_eq!(submit.pool_job_id, "a-1");
                outcome_tx.send(SubmitOutcome::Accepted).unwrap();
            }
            _ => panic!("expected submit"),
        }

        let reply = h.recv_json().await;
        assert_eq!(reply["result"], true);
        // Pool B never saw the share
        assert!(h.cmd_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn new_job_on_active_pool_is_forwarded() {
        let mut h = harness();
        let _ = handshake(&mut h).await;

        h.cmd_tx
            .send(DownstreamCommand::PoolJob {
                pool: PoolId::A,
                job: test_job(PoolId::A, "a-2", 1024.0),
            })
            .await
            .unwrap();

        let notify = h.recv_json().await;
        assert_eq!(notify["method"], "mining.notify");
        assert_eq!(notify["params"][8], false);

        // Jobs for the inactive pool are dropped silently
        h.cmd_tx
            .send(DownstreamCommand::PoolJob {
                pool: PoolId::B,
                job: test_job(PoolId::B, "b-9", 2048.0),
            })
            .await
            .unwrap();
        h.cmd_tx
            .send(DownstreamCommand::PoolDifficulty {
                pool: PoolId::A,
                difficulty: 4096.0,
            })
            .await
            .unwrap();

        // Next message is the difficulty change, not a B job
        let msg = h.recv_json().await;
        assert_eq!(msg["method"], "mining.set_difficulty");
        assert_eq!(msg["params"][0], 4096);
    }

    #[tokio::test]
    async fn unknown_method_gets_method_not_found() {
        let mut h = harness();
        h.send_line(r#"{"id":5,"method":"mining.get_transactions","params":[]}"#)
            .await;
        let reply = h.recv_json().await;
        assert_eq!(reply["id"], 5);
        assert_eq!(reply["error"][0], -3);
    }

    #[tokio::test]
    async fn disallowed_worker_is_refused() {
        let mut h = harness_with(|ctx| {
            ctx.allowed_workers = Arc::new(vec!["rig1".to_string()]);
        });

        h.send_line(r#"{"id":1,"method":"mining.subscribe","params":[]}"#).await;
        let _ = h.recv_json().await;

        h.send_line(r#"{"id":2,"method":"mining.authorize","params":["wallet.intruder","x"]}"#)
            .await;
        let reply = h.recv_json().await;
        assert_eq!(reply["error"][0], 24);

        // An allowed worker still gets through
        h.send_line(r#"{"id":3,"method":"mining.authorize","params":["wallet.rig1","x"]}"#)
            .await;
        let reply = h.recv_json().await;
        assert_eq!(reply["result"], true);
    }

    #[tokio::test]
    async fn malformed_json_closes_with_diagnostic() {
        let mut h = harness();
        h.send_line("this is not json").await;

        let reply = h.recv_json().await;
        assert_eq!(reply["error"][0], 20);

        // Session closes: next read is EOF
        let eof = tokio::time::timeout(Duration::from_secs(5), h.miner_lines.next_line())
            .await
            .unwrap()
            .unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn suggest_difficulty_is_advisory() {
        let mut h = harness();
        h.send_line(r#"{"id":4,"method":"mining.suggest_difficulty","params":[512]}"#)
            .await;
        let reply = h.recv_json().await;
        assert_eq!(reply["result"], true);
    }

    #[tokio::test]
    async fn shutdown_sends_client_reconnect() {
        let mut h = harness();
        let _ = handshake(&mut h).await;

        h.shutdown.cancel();
        let msg = h.recv_json().await;
        assert_eq!(msg["method"], "client.reconnect");
    }

    #[test]
    fn worker_name_extraction() {
        assert_eq!(extract_worker_name("wallet.rig1"), "rig1");
        assert_eq!(extract_worker_name("wallet.rig1.suffix"), "suffix");
        assert_eq!(extract_worker_name("solo"), "solo");
        assert_eq!(extract_worker_name(""), "unknown");
        assert_eq!(extract_worker_name("wallet."), "wallet.");
    }

    #[test]
    fn diff_policy_clamps_and_ceils() {
        let policy = DiffPolicy { min: 16.0, max: 4096.0 };
        assert_eq!(policy.clamp(1.0), 16);
        assert_eq!(policy.clamp(100000.0), 4096);
        assert_eq!(policy.clamp(756.3), 757);

        let open = DiffPolicy::default();
        assert_eq!(open.clamp(0.2), 1);
        assert_eq!(open.clamp(1024.0), 1024);
    }
}
