//! Read-only HTTP surface: the status API for the dashboard
//! collaborator and the Prometheus metrics endpoint.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, warn, Level};

use crate::daemon::DownstreamRegistry;
use crate::downstream::DownstreamStatus;
use crate::metrics::Counters;
use crate::scheduler::{Scheduler, SchedulerStatus};
use crate::types::PoolId;
use crate::upstream::{ConnState, Upstreams};

/// Shared state for the status handlers.
#[derive(Clone)]
pub struct StatusState {
    pub upstreams: Upstreams,
    pub registry: Arc<Mutex<DownstreamRegistry>>,
    pub scheduler: Arc<Scheduler>,
    pub counters: Arc<Counters>,
    pub started: Instant,
}

/// One snapshot of everything the dashboard shows.
#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub uptime_secs: u64,
    pub upstreams: Vec<UpstreamStatus>,
    pub downstreams: DownstreamSummary,
    pub scheduler: SchedulerStatus,
    pub counters: CounterSnapshot,
}

#[derive(Debug, Serialize)]
pub struct UpstreamStatus {
    pub pool: PoolId,
    pub state: ConnState,
    pub extranonce1: String,
    pub extranonce2_size: usize,
    pub difficulty: f64,
    pub jobs_cached: usize,
    pub last_job_age_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct DownstreamSummary {
    pub count: usize,
    pub sessions: Vec<DownstreamStatus>,
}

#[derive(Debug, Serialize)]
pub struct CounterSnapshot {
    pub shares_submitted: u64,
    pub shares_accepted_a: u64,
    pub shares_accepted_b: u64,
    pub shares_rejected_a: u64,
    pub shares_rejected_b: u64,
    pub shares_rejected_stale: u64,
    pub shares_rejected_duplicate: u64,
    pub jobs_forwarded_a: u64,
    pub jobs_forwarded_b: u64,
    pub pool_switches: u64,
    pub accepted_difficulty_a: f64,
    pub accepted_difficulty_b: f64,
}

/// Assemble the snapshot from live state.
pub fn build_snapshot(state: &StatusState) -> StatusSnapshot {
    use std::sync::atomic::Ordering;

    let now = Instant::now();
    let upstreams = [&state.upstreams.a, &state.upstreams.b]
        .into_iter()
        .map(|handle| {
            let snapshot = handle.snapshot();
            UpstreamStatus {
                pool: handle.id,
                state: snapshot.state,
                extranonce1: snapshot.extranonce1,
                extranonce2_size: snapshot.extranonce2_size,
                difficulty: snapshot.difficulty,
                jobs_cached: snapshot.jobs.len(),
                last_job_age_secs: snapshot
                    .last_job_at
                    .map(|at| now.saturating_duration_since(at).as_secs()),
            }
        })
        .collect();

    let sessions = state
        .registry
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .statuses();

    let counters = &state.counters;
    StatusSnapshot {
        uptime_secs: now.saturating_duration_since(state.started).as_secs(),
        upstreams,
        downstreams: DownstreamSummary {
            count: sessions.len(),
            sessions,
        },
        scheduler: state.scheduler.status(now),
        counters: CounterSnapshot {
            shares_submitted: counters.shares_submitted.load(Ordering::Relaxed),
            shares_accepted_a: counters.shares_accepted.get(PoolId::A),
            shares_accepted_b: counters.shares_accepted.get(PoolId::B),
            shares_rejected_a: counters.shares_rejected.get(PoolId::A),
            shares_rejected_b: counters.shares_rejected.get(PoolId::B),
            shares_rejected_stale: counters.shares_rejected_stale.load(Ordering::Relaxed),
            shares_rejected_duplicate: counters
                .shares_rejected_duplicate
                .load(Ordering::Relaxed),
            jobs_forwarded_a: counters.jobs_forwarded.get(PoolId::A),
            jobs_forwarded_b: counters.jobs_forwarded.get(PoolId::B),
            pool_switches: counters.pool_switches.load(Ordering::Relaxed),
            accepted_difficulty_a: counters.accepted_difficulty.get(PoolId::A),
            accepted_difficulty_b: counters.accepted_difficulty.get(PoolId::B),
        },
    }
}

async fn status(State(state): State<StatusState>) -> Json<StatusSnapshot> {
    Json(build_snapshot(&state))
}

async fn health() -> &'static str {
    "OK"
}

async fn metrics(State(counters): State<Arc<Counters>>) -> String {
    counters.render_prometheus()
}

/// Serve the read-only status API until shutdown.
pub async fn serve_status(
    bind: &str,
    state: StatusState,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = Router::new()
        .route("/api/v0/status", get(status))
        .route("/api/v0/health", get(health))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state);

    let listener = TcpListener::bind(bind).await?;
    let addr = listener.local_addr()?;
    info!(url = %format!("http://{addr}"), "Status API listening.");
    if !addr.ip().is_loopback() {
        warn!(
            "Status API is bound to a non-localhost address ({}). \
             This exposes proxy state to the network without authentication.",
            addr.ip()
        );
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

/// Serve `/metrics` in Prometheus text format until shutdown.
pub async fn serve_metrics(
    bind: &str,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics))
        .with_state(counters);

    let listener = TcpListener::bind(bind).await?;
    info!(url = %format!("http://{}/metrics", listener.local_addr()?), "Metrics endpoint listening.");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::test_support::{ready_snapshot, stub_handle};

    fn test_state() -> StatusState {
        let (a, _cmd_a, _tx_a) = stub_handle(PoolId::A, ready_snapshot("f1f1f1f1", 8, 1024.0));
        let (b, _cmd_b, _tx_b) = stub_handle(PoolId::B, ready_snapshot("e2e2e2e2", 8, 2048.0));

        let settings = crate::scheduler::SchedulerSettings {
            mode: crate::config::ScheduleMode::Fixed,
            weight_a: 50,
            weight_b: 50,
            slot: std::time::Duration::from_secs(60),
            dwell_floor: std::time::Duration::from_secs(30),
            autobalance: Default::default(),
        };

        StatusState {
            upstreams: Upstreams { a, b },
            registry: Arc::new(Mutex::new(DownstreamRegistry::default())),
            scheduler: Arc::new(Scheduler::new(settings, Instant::now())),
            counters: Arc::new(Counters::default()),
            started: Instant::now(),
        }
    }

    #[tokio::test]
    async fn snapshot_reflects_upstream_state() {
        let state = test_state();
        state.counters.shares_accepted.inc(PoolId::B);
        state.counters.accepted_difficulty.add(PoolId::B, 2048.0);

        let snapshot = build_snapshot(&state);

        assert_eq!(snapshot.upstreams.len(), 2);
        assert_eq!(snapshot.upstreams[0].pool, PoolId::A);
        assert_eq!(snapshot.upstreams[0].extranonce1, "f1f1f1f1");
        assert!(matches!(snapshot.upstreams[0].state, ConnState::Ready));
        assert_eq!(snapshot.downstreams.count, 0);
        assert_eq!(snapshot.counters.shares_accepted_b, 1);
        assert_eq!(snapshot.counters.accepted_difficulty_b, 2048.0);
        assert_eq!(snapshot.scheduler.weight_a, 50);
    }

    #[tokio::test]
    async fn snapshot_serializes_to_json() {
        let snapshot = build_snapshot(&test_state());
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json["uptime_secs"].is_u64());
        assert_eq!(json["upstreams"][0]["pool"], "a");
        assert_eq!(json["scheduler"]["mode"], "fixed");
    }
}
