//! Supervisor: component lifetimes, registries, and state pruning.
//!
//! The supervisor owns the upstream sessions, the downstream listener
//! and registry, the scheduler ticker, the pruner, and the HTTP
//! endpoints. Restartable components run under a respawn wrapper that
//! catches panics, emits `component_crashed`, and restarts after
//! backoff; a component fault never takes the process down. Upstream
//! and downstream sessions are fault-tolerant by construction (their
//! error paths are `Result`-driven reconnect/close, not panics), and a
//! panicking session task is logged and affects only that session.

use std::future::Future;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::{mpsc, watch};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::api;
use crate::config::Config;
use crate::downstream::{
    self, DiffPolicy, DownstreamCommand, DownstreamHandle, DownstreamStatus, SessionContext,
};
use crate::events::EventSink;
use crate::metrics::Counters;
use crate::router::ShareRouter;
use crate::scheduler::{RouteChange, Scheduler, SchedulerSettings};
use crate::types::{MinerId, PoolId};
use crate::upstream::{self, ConnState, UpstreamConfig, UpstreamEvent, Upstreams};

const SCHEDULER_TICK: Duration = Duration::from_secs(1);
const PRUNE_PERIOD: Duration = Duration::from_secs(60);
const RESPAWN_BACKOFF_BASE: Duration = Duration::from_secs(1);
const RESPAWN_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Live downstream sessions.
///
/// Sessions are pushed on accept and cleaned up lazily once their
/// command channel closes, in the style of a lazily-pruned registry.
#[derive(Default)]
pub struct DownstreamRegistry {
    sessions: Vec<DownstreamHandle>,
}

impl DownstreamRegistry {
    pub fn push(&mut self, handle: DownstreamHandle) {
        self.sessions.push(handle);
    }

    /// Drop records of sessions whose task has exited.
    pub fn prune_closed(&mut self) {
        self.sessions.retain(|h| !h.is_closed());
    }

    pub fn get(&self, miner: MinerId) -> Option<DownstreamHandle> {
        self.sessions
            .iter()
            .find(|h| h.miner == miner && !h.is_closed())
            .cloned()
    }

    /// Handles of all open sessions.
    pub fn handles(&mut self) -> Vec<DownstreamHandle> {
        self.prune_closed();
        self.sessions.clone()
    }

    /// Status of every open session.
    pub fn statuses(&mut self) -> Vec<DownstreamStatus> {
        self.prune_closed();
        self.sessions.iter().map(|h| h.status()).collect()
    }

    pub fn len(&mut self) -> usize {
        self.prune_closed();
        self.sessions.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }
}

/// Shared collaborators handed to the hub, ticker, and listener.
#[derive(Clone)]
struct Shared {
    scheduler: Arc<Scheduler>,
    registry: Arc<Mutex<DownstreamRegistry>>,
    upstreams: Upstreams,
    router: Arc<ShareRouter>,
    counters: Arc<Counters>,
    events: EventSink,
    job_seq: Arc<AtomicU64>,
    session_counter: Arc<AtomicU16>,
    config: Arc<Mutex<Config>>,
    shutdown: CancellationToken,
}

/// Apply scheduler route changes to the affected sessions.
///
/// A switch with a previous pool is a committed switch event; initial
/// assignments and quiesce-recoveries are not.
fn dispatch_changes(shared: &Shared, changes: Vec<RouteChange>) {
    if changes.is_empty() {
        return;
    }
    let registry = shared.registry.lock().unwrap_or_else(|e| e.into_inner());
    for change in changes {
        match change {
            RouteChange::Switch { miner, from, to } => {
                if let Some(handle) = registry.get(miner) {
                    if handle
                        .cmd_tx
                        .try_send(DownstreamCommand::AssignPool { to })
                        .is_err()
                    {
                        warn!(miner, "Session command queue full, dropping assignment");
                        continue;
                    }
                }
                if let Some(from) = from {
                    Counters::inc(&shared.counters.pool_switches);
                    shared.events.pool_switched(miner, from, to);
                }
            }
            RouteChange::Quiesce { miner } => {
                if let Some(handle) = registry.get(miner) {
                    let _ = handle.cmd_tx.try_send(DownstreamCommand::Quiesce);
                }
                shared.events.pool_unavailable(miner);
            }
        }
    }
}

/// Fan upstream events out to the scheduler and the routed sessions.
async fn hub_loop(shared: Shared, event_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<UpstreamEvent>>>) {
    let mut event_rx = event_rx.lock().await;
    loop {
        let event = tokio::select! {
            event = event_rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
            _ = shared.shutdown.cancelled() => return,
        };

        match event {
            UpstreamEvent::NewJob { pool, job } => {
                let handles = shared
                    .registry
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .handles();
                for handle in handles {
                    // Sessions ignore jobs for pools they are not on
                    let _ = handle.cmd_tx.try_send(DownstreamCommand::PoolJob {
                        pool,
                        job: job.clone(),
                    });
                }
            }
            UpstreamEvent::DifficultyChanged { pool, difficulty } => {
                let handles = shared
                    .registry
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .handles();
                for handle in handles {
                    let _ = handle
                        .cmd_tx
                        .try_send(DownstreamCommand::PoolDifficulty { pool, difficulty });
                }
            }
            UpstreamEvent::ExtranonceChanged { .. } => {
                // Absorbed: the splice layout is re-read from the
                // snapshot on every forward, and the miner-facing
                // extranonce geometry never changes.
            }
            UpstreamEvent::StateChanged { pool, state } => {
                let ready = state == ConnState::Ready;
                let changes = shared.scheduler.set_pool_ready(pool, ready, Instant::now());
                dispatch_changes(&shared, changes);
            }
        }
    }
}

/// Drive slot boundaries and dwell-gated switches.
async fn ticker_loop(shared: Shared) {
    let mut tick = tokio::time::interval(SCHEDULER_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let changes = shared.scheduler.tick(Instant::now());
                dispatch_changes(&shared, changes);
            }
            _ = shared.shutdown.cancelled() => return,
        }
    }
}

/// Periodic state pruning.
async fn pruner_loop(shared: Shared) {
    let mut tick = tokio::time::interval(PRUNE_PERIOD);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let mut registry = shared.registry.lock().unwrap_or_else(|e| e.into_inner());
                registry.prune_closed();
            }
            _ = shared.shutdown.cancelled() => return,
        }
    }
}

/// Accept miners and spawn their sessions.
async fn accept_loop(listener: Arc<TcpListener>, shared: Shared) {
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
            _ = shared.shutdown.cancelled() => return,
        };

        let _ = stream.set_nodelay(true);
        let miner = shared.session_counter.fetch_add(1, Ordering::Relaxed);
        let peer = peer.to_string();
        debug!(miner, peer = %peer, "Miner connected");

        let (extranonce2_size, allowed_workers, diff_policies) = {
            let config = shared.config.lock().unwrap_or_else(|e| e.into_inner());
            (
                config.stratum.extranonce2_size,
                Arc::new(config.stratum.allowed_workers.clone()),
                [
                    DiffPolicy::from_entry(&config.pool_a),
                    DiffPolicy::from_entry(&config.pool_b),
                ],
            )
        };

        let ctx = SessionContext {
            miner,
            peer: peer.clone(),
            upstreams: shared.upstreams.clone(),
            scheduler: shared.scheduler.clone(),
            router: shared.router.clone(),
            counters: shared.counters.clone(),
            events: shared.events.clone(),
            job_seq: shared.job_seq.clone(),
            extranonce2_size,
            allowed_workers,
            diff_policies,
            shutdown: shared.shutdown.clone(),
        };

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (status_tx, status_rx) = watch::channel(DownstreamStatus::connecting(miner, peer));
        shared
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(DownstreamHandle {
                miner,
                cmd_tx,
                status_rx,
            });

        // Watch the session so a panic is contained and visible
        let events = shared.events.clone();
        let join = tokio::spawn(downstream::run_session(stream, ctx, cmd_rx, status_tx));
        tokio::spawn(async move {
            if let Err(e) = join.await {
                if e.is_panic() {
                    error!(miner, "Downstream session panicked");
                    events.component_crashed("downstream_session");
                }
            }
        });
    }
}

/// Run a restartable component, respawning on panic after backoff.
fn spawn_supervised<F, Fut>(
    tracker: &TaskTracker,
    shutdown: CancellationToken,
    events: EventSink,
    name: &'static str,
    mut factory: F,
) where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tracker.spawn(async move {
        let mut backoff = RESPAWN_BACKOFF_BASE;
        loop {
            let join = tokio::spawn(factory());
            match join.await {
                Ok(()) => return,
                Err(e) if e.is_panic() => {
                    error!(component = name, "Component panicked, restarting");
                    events.component_crashed(name);
                }
                Err(_) => return,
            }

            if shutdown.is_cancelled() {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.cancelled() => return,
            }
            backoff = (backoff * 2).min(RESPAWN_BACKOFF_CAP);
        }
    });
}

/// The proxy supervisor.
pub struct Supervisor {
    config: Config,
    config_path: Option<std::path::PathBuf>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            config_path: None,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Remember the config file so SIGHUP can re-apply it.
    pub fn with_config_path(mut self, path: std::path::PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    /// Run until SIGINT/SIGTERM.
    pub async fn run(self) -> anyhow::Result<()> {
        let Supervisor {
            config,
            config_path,
            shutdown,
            tracker,
        } = self;

        config.validate()?;

        let counters = Arc::new(Counters::default());
        let events = EventSink::new(&config.log.events);
        let scheduler = Arc::new(Scheduler::new(
            SchedulerSettings::from(&config),
            Instant::now(),
        ));

        // Upstream sessions, one per pool, live for the whole run
        let (event_tx, event_rx) = mpsc::channel::<UpstreamEvent>(256);
        let (handle_a, _join_a) = upstream::spawn(
            UpstreamConfig::from_entry(PoolId::A, &config.pool_a),
            event_tx.clone(),
            shutdown.clone(),
            counters.clone(),
            events.clone(),
        );
        let (handle_b, _join_b) = upstream::spawn(
            UpstreamConfig::from_entry(PoolId::B, &config.pool_b),
            event_tx,
            shutdown.clone(),
            counters.clone(),
            events.clone(),
        );
        let upstreams = Upstreams {
            a: handle_a,
            b: handle_b,
        };

        let router = Arc::new(ShareRouter::new(
            Duration::from_secs(config.stale_grace_seconds),
            counters.clone(),
            events.clone(),
        ));

        let stratum_bind = config.stratum.bind.clone();
        let metrics_bind = config.metrics.bind.clone();
        let api_bind = config.api.bind.clone();

        let shared = Shared {
            scheduler,
            registry: Arc::new(Mutex::new(DownstreamRegistry::default())),
            upstreams,
            router,
            counters,
            events: events.clone(),
            job_seq: Arc::new(AtomicU64::new(1)),
            session_counter: Arc::new(AtomicU16::new(1)),
            config: Arc::new(Mutex::new(config)),
            shutdown: shutdown.clone(),
        };

        // Hub: the event receiver survives respawns behind a mutex
        let event_rx = Arc::new(tokio::sync::Mutex::new(event_rx));
        spawn_supervised(&tracker, shutdown.clone(), events.clone(), "hub", {
            let shared = shared.clone();
            move || hub_loop(shared.clone(), event_rx.clone())
        });

        spawn_supervised(&tracker, shutdown.clone(), events.clone(), "scheduler_ticker", {
            let shared = shared.clone();
            move || ticker_loop(shared.clone())
        });

        spawn_supervised(&tracker, shutdown.clone(), events.clone(), "pruner", {
            let shared = shared.clone();
            move || pruner_loop(shared.clone())
        });

        let listener = Arc::new(
            TcpListener::bind(&stratum_bind)
                .await
                .with_context(|| format!("binding stratum listener on {stratum_bind}"))?,
        );
        info!(bind = %stratum_bind, "Stratum listener up");
        spawn_supervised(&tracker, shutdown.clone(), events.clone(), "stratum_listener", {
            let shared = shared.clone();
            let listener = listener.clone();
            move || accept_loop(listener.clone(), shared.clone())
        });

        spawn_supervised(&tracker, shutdown.clone(), events.clone(), "metrics_endpoint", {
            let counters = shared.counters.clone();
            let shutdown = shutdown.clone();
            move || {
                let counters = counters.clone();
                let shutdown = shutdown.clone();
                let bind = metrics_bind.clone();
                async move {
                    if let Err(e) = api::serve_metrics(&bind, counters, shutdown).await {
                        warn!(error = %e, "Metrics endpoint failed");
                    }
                }
            }
        });

        spawn_supervised(&tracker, shutdown.clone(), events.clone(), "status_api", {
            let state = api::StatusState {
                upstreams: shared.upstreams.clone(),
                registry: shared.registry.clone(),
                scheduler: shared.scheduler.clone(),
                counters: shared.counters.clone(),
                started: Instant::now(),
            };
            let shutdown = shutdown.clone();
            move || {
                let state = state.clone();
                let shutdown = shutdown.clone();
                let bind = api_bind.clone();
                async move {
                    if let Err(e) = api::serve_status(&bind, state, shutdown).await {
                        warn!(error = %e, "Status API failed");
                    }
                }
            }
        });

        tracker.close();
        info!("Started.");

        // Signal handling
        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;
        let mut sighup = unix::signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                    break;
                }
                _ = sighup.recv() => {
                    if let Some(path) = &config_path {
                        match Config::load_from(path) {
                            Ok(new_config) => {
                                info!(path = %path.display(), "Applying reloaded configuration");
                                apply_config(&shared, new_config);
                            }
                            Err(e) => {
                                // The previous snapshot keeps running
                                error!(error = %e, "Config reload rejected");
                            }
                        }
                    }
                }
            }
        }

        shutdown.cancel();
        tracker.wait().await;
        info!("Exiting.");
        Ok(())
    }
}

/// Atomically adopt a validated snapshot.
///
/// Upstream sessions compare their config and reconnect only when their
/// entry changed; scheduler settings apply at the next tick; listener
/// binds are fixed for the process lifetime.
fn apply_config(shared: &Shared, new_config: Config) {
    shared
        .scheduler
        .apply_settings(SchedulerSettings::from(&new_config));
    shared
        .upstreams
        .a
        .reconfigure(UpstreamConfig::from_entry(PoolId::A, &new_config.pool_a));
    shared
        .upstreams
        .b
        .reconfigure(UpstreamConfig::from_entry(PoolId::B, &new_config.pool_b));

    let mut config = shared.config.lock().unwrap_or_else(|e| e.into_inner());
    *config = new_config;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScheduleMode;
    use crate::upstream::test_support::{ready_snapshot, stub_handle};

    fn stub_shared() -> (Shared, mpsc::Receiver<crate::upstream::UpstreamCommand>) {
        let (a, cmd_a, _tx_a) = stub_handle(PoolId::A, ready_snapshot("f1f1f1f1", 8, 1024.0));
        let (b, _cmd_b, _tx_b) = stub_handle(PoolId::B, ready_snapshot("e2e2e2e2", 8, 2048.0));

        let counters = Arc::new(Counters::default());
        let events = EventSink::default();
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

        let config: Config = toml::from_str(
            r#"
            [pool_a]
            host = "a.test"
            port = 3333
            user = "w"

            [pool_b]
            host = "b.test"
            port = 3334
            user = "w"
            "#,
        )
        .unwrap();

        let shared = Shared {
            scheduler,
            registry: Arc::new(Mutex::new(DownstreamRegistry::default())),
            upstreams: Upstreams { a, b },
            router: Arc::new(ShareRouter::new(
                Duration::from_secs(20),
                counters.clone(),
                events.clone(),
            )),
            counters,
            events,
            job_seq: Arc::new(AtomicU64::new(1)),
            session_counter: Arc::new(AtomicU16::new(1)),
            config: Arc::new(Mutex::new(config)),
            shutdown: CancellationToken::new(),
        };
        (shared, cmd_a)
    }

    fn registry_handle(
        miner: MinerId,
    ) -> (DownstreamHandle, mpsc::Receiver<DownstreamCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let (_status_tx, status_rx) =
            watch::channel(DownstreamStatus::connecting(miner, "t".into()));
        (
            DownstreamHandle {
                miner,
                cmd_tx,
                status_rx,
            },
            cmd_rx,
        )
    }

    #[tokio::test]
    async fn registry_prunes_closed_sessions() {
        let mut registry = DownstreamRegistry::default();
        let (open, _open_rx) = registry_handle(1);
        let (closed, closed_rx) = registry_handle(2);
        drop(closed_rx);

        registry.push(open);
        registry.push(closed);

        assert_eq!(registry.len(), 1);
        assert!(registry.get(1).is_some());
        assert!(registry.get(2).is_none());
    }

    #[tokio::test]
    async fn dispatch_sends_assignments_and_counts_switches() {
        let (shared, _cmd_a) = stub_shared();
        let (handle, mut cmd_rx) = registry_handle(1);
        shared
            .registry
            .lock()
            .unwrap()
            .push(handle);

        dispatch_changes(
            &shared,
            vec![RouteChange::Switch {
                miner: 1,
                from: Some(PoolId::A),
                to: PoolId::B,
            }],
        );

        match cmd_rx.try_recv().unwrap() {
            DownstreamCommand::AssignPool { to } => assert_eq!(to, PoolId::B),
            other => panic!("expected AssignPool, got {other:?}"),
        }
        assert_eq!(
            shared.counters.pool_switches.load(Ordering::Relaxed),
            1
        );

        // Initial assignment: no switch counted
        dispatch_changes(
            &shared,
            vec![RouteChange::Switch {
                miner: 1,
                from: None,
                to: PoolId::A,
            }],
        );
        assert_eq!(
            shared.counters.pool_switches.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn hub_broadcasts_jobs_to_sessions() {
        let (shared, _cmd_a) = stub_shared();
        let (handle, mut cmd_rx) = registry_handle(1);
        shared.registry.lock().unwrap().push(handle);

        let (event_tx, event_rx) = mpsc::channel(16);
        let event_rx = Arc::new(tokio::sync::Mutex::new(event_rx));
        let hub = tokio::spawn(hub_loop(shared.clone(), event_rx));

        let job = Arc::new(crate::job::JobRecord {
            pool: PoolId::A,
            pool_job_id: "a-1".into(),
            prevhash: "00".repeat(32),
            coinbase1: "aa".into(),
            coinbase2: "bb".into(),
            merkle_branch: vec![],
            version: "20000000".into(),
            nbits: "1d00ffff".into(),
            ntime: "5a5a5a5a".into(),
            clean_jobs: false,
            received_at: Instant::now(),
            difficulty: 1024.0,
        });
        event_tx
            .send(UpstreamEvent::NewJob {
                pool: PoolId::A,
                job,
            })
            .await
            .unwrap();

        let cmd = tokio::time::timeout(Duration::from_secs(5), cmd_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(cmd, DownstreamCommand::PoolJob { pool: PoolId::A, .. }));

        drop(event_tx);
        let _ = hub.await;
    }

    #[tokio::test]
    async fn hub_failover_reroutes_miner() {
        let (shared, _cmd_a) = stub_shared();
        let t0 = Instant::now();
        shared.scheduler.set_pool_ready(PoolId::A, true, t0);
        shared.scheduler.set_pool_ready(PoolId::B, true, t0);
        shared.scheduler.register_miner(1, t0);
        let initial = shared.scheduler.active_pool(1).unwrap();

        let (handle, mut cmd_rx) = registry_handle(1);
        shared.registry.lock().unwrap().push(handle);

        let (event_tx, event_rx) = mpsc::channel(16);
        let event_rx = Arc::new(tokio::sync::Mutex::new(event_rx));
        let hub = tokio::spawn(hub_loop(shared.clone(), event_rx));

        event_tx
            .send(UpstreamEvent::StateChanged {
                pool: initial,
                state: ConnState::Reconnecting,
            })
            .await
            .unwrap();

        let cmd = tokio::time::timeout(Duration::from_secs(5), cmd_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match cmd {
            DownstreamCommand::AssignPool { to } => assert_eq!(to, initial.other()),
            other => panic!("expected failover assignment, got {other:?}"),
        }
        assert_eq!(shared.scheduler.active_pool(1), Some(initial.other()));

        drop(event_tx);
        let _ = hub.await;
    }

    #[tokio::test]
    async fn supervised_component_restarts_after_panic() {
        let tracker = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let runs = Arc::new(AtomicU64::new(0));

        tokio::time::pause();

        spawn_supervised(&tracker, shutdown.clone(), EventSink::default(), "test", {
            let runs = runs.clone();
            let shutdown = shutdown.clone();
            move || {
                let runs = runs.clone();
                let shutdown = shutdown.clone();
                async move {
                    if runs.fetch_add(1, Ordering::SeqCst) == 0 {
                        panic!("boom");
                    }
                    // Second run: behave until shutdown
                    shutdown.cancelled().await;
                }
            }
        });
        tracker.close();

        // Allow the panic, the backoff, and the respawn to play out
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(runs.load(Ordering::SeqCst) >= 2, "component was not respawned");

        shutdown.cancel();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn apply_config_updates_scheduler_weights() {
        let (shared, _cmd_a) = stub_shared();
        let mut new_config = shared.config.lock().unwrap().clone();
        new_config.weights.a = 90;
        new_config.weights.b = 10;

        apply_config(&shared, new_config);

        let status = shared.scheduler.status(Instant::now());
        assert_eq!((status.weight_a, status.weight_b), (90, 10));
        assert_eq!(shared.config.lock().unwrap().weights.a, 90);
    }
}
