//! In-memory counters published to the metrics collaborator.
//!
//! Counters are plain atomics updated from any task; the collaborator
//! scrapes them through [`Counters::render_prometheus`], which produces
//! the Prometheus text exposition format. Gauges that derive from live
//! state (connection counts, active pool) are included here; everything
//! else lives in the status API.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::PoolId;

/// Per-pool counter pair indexed by [`PoolId::index`].
#[derive(Debug, Default)]
pub struct PerPool {
    counts: [AtomicU64; 2],
}

impl PerPool {
    pub fn inc(&self, pool: PoolId) {
        self.counts[pool.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, pool: PoolId) -> u64 {
        self.counts[pool.index()].load(Ordering::Relaxed)
    }
}

/// Per-pool float accumulator (difficulty sums).
///
/// Stored as f64 bits in an atomic; updates use a CAS loop since shares
/// arrive from concurrent sessions.
#[derive(Debug, Default)]
pub struct PerPoolSum {
    bits: [AtomicU64; 2],
}

impl PerPoolSum {
    pub fn add(&self, pool: PoolId, value: f64) {
        let cell = &self.bits[pool.index()];
        let mut current = cell.load(Ordering::Relaxed);
        loop {
            let next = (f64::from_bits(current) + value).to_bits();
            match cell.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn get(&self, pool: PoolId) -> f64 {
        f64::from_bits(self.bits[pool.index()].load(Ordering::Relaxed))
    }
}

/// The proxy's counter table.
#[derive(Debug, Default)]
pub struct Counters {
    /// Submits received from miners, before any validation.
    pub shares_submitted: AtomicU64,
    /// Shares the pools accepted.
    pub shares_accepted: PerPool,
    /// Shares the pools rejected.
    pub shares_rejected: PerPool,
    /// Submits rejected locally because the job fell out of the grace window.
    pub shares_rejected_stale: AtomicU64,
    /// Submits rejected locally as duplicates.
    pub shares_rejected_duplicate: AtomicU64,
    /// Submits that never got an upstream response.
    pub share_timeouts: PerPool,
    /// Sum of share difficulty for accepted shares.
    pub accepted_difficulty: PerPoolSum,
    /// Jobs forwarded downstream.
    pub jobs_forwarded: PerPool,
    /// Committed scheduler switches.
    pub pool_switches: AtomicU64,
    /// Miner connections accepted over the proxy lifetime.
    pub miner_connections_total: AtomicU64,
    /// Currently connected miners.
    pub miner_connections_active: AtomicU64,
    /// Upstream reconnect attempts.
    pub pool_reconnects: PerPool,
    /// Messages read from miners.
    pub messages_rx_downstream: AtomicU64,
    /// Messages written to miners.
    pub messages_tx_downstream: AtomicU64,
    /// Messages read from pools.
    pub messages_rx_upstream: PerPool,
    /// Messages written to pools.
    pub messages_tx_upstream: PerPool,
}

impl Counters {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(counter: &AtomicU64) {
        counter.fetch_sub(1, Ordering::Relaxed);
    }

    /// Render the table in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        use std::fmt::Write;

        let mut out = String::with_capacity(2048);
        let mut counter = |name: &str, help: &str, value: u64| {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {value}");
        };

        counter(
            "janus_shares_submitted_total",
            "Shares submitted by miners",
            self.shares_submitted.load(Ordering::Relaxed),
        );
        counter(
            "janus_shares_rejected_stale_total",
            "Shares rejected locally as stale",
            self.shares_rejected_stale.load(Ordering::Relaxed),
        );
        counter(
            "janus_shares_rejected_duplicate_total",
            "Shares rejected locally as duplicates",
            self.shares_rejected_duplicate.load(Ordering::Relaxed),
        );
        counter(
            "janus_pool_switches_total",
            "Committed active-pool switches",
            self.pool_switches.load(Ordering::Relaxed),
        );
        counter(
            "janus_miner_connections_total",
            "Miner connections accepted",
            self.miner_connections_total.load(Ordering::Relaxed),
        );
        counter(
            "janus_messages_rx_downstream_total",
            "Messages received from miners",
            self.messages_rx_downstream.load(Ordering::Relaxed),
        );
        counter(
            "janus_messages_tx_downstream_total",
            "Messages sent to miners",
            self.messages_tx_downstream.load(Ordering::Relaxed),
        );

        let mut pool_counter = |name: &str, help: &str, table: &PerPool| {
            let _ = writeln!(out, "# HELP {name} {help}");
            let _ = writeln!(out, "# TYPE {name} counter");
            for pool in [PoolId::A, PoolId::B] {
                let _ = writeln!(out, "{name}{{pool=\"{}\"}} {}", pool.label(), table.get(pool));
            }
        };

        pool_counter(
            "janus_shares_accepted_total",
            "Shares accepted by pools",
            &self.shares_accepted,
        );
        pool_counter(
            "janus_shares_rejected_total",
            "Shares rejected by pools",
            &self.shares_rejected,
        );
        pool_counter(
            "janus_share_timeouts_total",
            "Share submits without an upstream response",
            &self.share_timeouts,
        );
        pool_counter(
            "janus_jobs_forwarded_total",
            "Jobs forwarded to miners",
            &self.jobs_forwarded,
        );
        pool_counter(
            "janus_pool_reconnects_total",
            "Upstream reconnect attempts",
            &self.pool_reconnects,
        );
        pool_counter(
            "janus_messages_rx_upstream_total",
            "Messages received from pools",
            &self.messages_rx_upstream,
        );
        pool_counter(
            "janus_messages_tx_upstream_total",
            "Messages sent to pools",
            &self.messages_tx_upstream,
        );

        let _ = writeln!(
            out,
            "# HELP janus_accepted_difficulty_sum Sum of difficulty for accepted shares"
        );
        let _ = writeln!(out, "# TYPE janus_accepted_difficulty_sum counter");
        for pool in [PoolId::A, PoolId::B] {
            let _ = writeln!(
                out,
                "janus_accepted_difficulty_sum{{pool=\"{}\"}} {}",
                pool.label(),
                self.accepted_difficulty.get(pool)
            );
        }

        let _ = writeln!(
            out,
            "# HELP janus_downstream_connections Currently connected miners"
        );
        let _ = writeln!(out, "# TYPE janus_downstream_connections gauge");
        let _ = writeln!(
            out,
            "janus_downstream_connections {}",
            self.miner_connections_active.load(Ordering::Relaxed)
        );

        out
    }
}
