//! Pool selection: slot planning, auto-balance, dwell and fail-over.
//!
//! The scheduler decides, at any moment, which pool is active for a
//! given miner. Wall-clock is partitioned into slots; slots are assigned
//! to pools by a largest-remainder planner so that over a sliding window
//! each pool's share of slots approaches its weight. Miners follow the
//! slot target, constrained by a per-miner dwell floor; an upstream
//! leaving `Ready` overrides everything and fails its miners over
//! immediately.
//!
//! All state lives behind one mutex; every re-routing decision for a
//! tick happens inside a single critical section.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::{AutoBalanceConfig, Config, ScheduleMode};
use crate::types::{MinerId, PoolId};

/// Sliding window of slot assignments the planner balances over.
const PLANNER_WINDOW: usize = 100;

/// Coins per block and seconds per block, shared by both chains the
/// proxy balances between. With equal subsidy and interval the
/// profitability ratio reduces to inverse network hashrate.
const BLOCK_SUBSIDY: f64 = 3.125;
const BLOCK_INTERVAL_SECS: f64 = 600.0;

/// Scheduler settings derived from a config snapshot.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub mode: ScheduleMode,
    pub weight_a: u32,
    pub weight_b: u32,
    pub slot: Duration,
    pub dwell_floor: Duration,
    pub autobalance: AutoBalanceConfig,
}

impl From<&Config> for SchedulerSettings {
    fn from(config: &Config) -> Self {
        Self {
            mode: config.mode,
            weight_a: config.weights.a,
            weight_b: config.weights.b,
            slot: Duration::from_secs(config.slot_seconds),
            dwell_floor: Duration::from_secs(config.dwell_floor_seconds),
            autobalance: config.autobalance,
        }
    }
}

/// A re-routing decision for one miner.
///
/// `Switch` with `from: None` is an assignment (first route or recovery
/// from quiescence) and is not counted as a switch event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteChange {
    Switch {
        miner: MinerId,
        from: Option<PoolId>,
        to: PoolId,
    },
    Quiesce {
        miner: MinerId,
    },
}

/// Status snapshot for the dashboard API.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub mode: String,
    pub weight_a: u32,
    pub weight_b: u32,
    pub next_slot_in_secs: u64,
    pub miners: Vec<MinerRouteStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MinerRouteStatus {
    pub miner: MinerId,
    pub active_pool: Option<PoolId>,
}

/// Largest-remainder assignment of slots to pools over a sliding window.
///
/// Each call picks the pool with the greater deficit against its quota
/// for the window-plus-this-slot, so any window of W slots holds each
/// pool within one slot of `w / (wa + wb) * W`.
#[derive(Debug, Default)]
struct SlotPlanner {
    window: std::collections::VecDeque<PoolId>,
}

impl SlotPlanner {
    fn next(&mut self, weight_a: u32, weight_b: u32) -> PoolId {
        let pick = if weight_a == 0 {
            PoolId::B
        } else if weight_b == 0 {
            PoolId::A
        } else {
            let total = (weight_a + weight_b) as f64;
            let n = self.window.len() as f64;
            let count_a = self.window.iter().filter(|&&p| p == PoolId::A).count() as f64;
            let count_b = n - count_a;

            let deficit_a = weight_a as f64 / total * (n + 1.0) - count_a;
            let deficit_b = weight_b as f64 / total * (n + 1.0) - count_b;

            if deficit_a >= deficit_b {
                PoolId::A
            } else {
                PoolId::B
            }
        };

        self.window.push_back(pick);
        while self.window.len() > PLANNER_WINDOW {
            self.window.pop_front();
        }
        pick
    }
}

/// Exponentially-weighted moving average with a half-life.
#[derive(Debug, Clone, Copy)]
struct Ema {
    halflife_secs: f64,
    value: Option<f64>,
    last_update: Option<Instant>,
}

impl Ema {
    fn new(halflife: Duration) -> Self {
        Self {
            halflife_secs: halflife.as_secs_f64(),
            value: None,
            last_update: None,
        }
    }

    fn update(&mut self, sample: f64, now: Instant) {
        match (self.value, self.last_update) {
            (Some(value), Some(last)) => {
                let dt = now.saturating_duration_since(last).as_secs_f64();
                let alpha = 1.0 - 0.5_f64.powf(dt / self.halflife_secs);
                self.value = Some(value + alpha * (sample - value));
            }
            _ => self.value = Some(sample),
        }
        self.last_update = Some(now);
    }

    fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Short- and long-horizon hashrate estimates for one chain.
#[derive(Debug, Clone, Copy)]
struct ChainEstimate {
    short: Ema,
    long: Ema,
}

impl ChainEstimate {
    fn new(autobalance: &AutoBalanceConfig) -> Self {
        Self {
            short: Ema::new(Duration::from_secs(autobalance.short_halflife_seconds)),
            long: Ema::new(Duration::from_secs(autobalance.long_halflife_seconds)),
        }
    }

    fn observe(&mut self, rate: f64, now: Instant) {
        self.short.update(rate, now);
        self.long.update(rate, now);
    }

    fn blended(&self, blend_short: f64) -> Option<f64> {
        match (self.short.value(), self.long.value()) {
            (Some(short), Some(long)) => Some(blend_short * short + (1.0 - blend_short) * long),
            (Some(short), None) => Some(short),
            (None, Some(long)) => Some(long),
            (None, None) => None,
        }
    }
}

#[derive(Debug)]
struct MinerRoute {
    active: Option<PoolId>,
    last_switch: Option<Instant>,
}

struct Inner {
    settings: SchedulerSettings,
    /// Effective weights; equal to configured in `Fixed` mode, derived
    /// from hashrate estimates in `AutoBalance`.
    weight_a: u32,
    weight_b: u32,
    planner: SlotPlanner,
    slot_started: Instant,
    slot_target: PoolId,
    ready: [bool; 2],
    miners: HashMap<MinerId, MinerRoute>,
    chains: [ChainEstimate; 2],
    last_rebalance: Instant,
}

/// The scheduling engine.
pub struct Scheduler {
    inner: Mutex<Inner>,
}

impl Scheduler {
    pub fn new(settings: SchedulerSettings, now: Instant) -> Self {
        let chains = [
            ChainEstimate::new(&settings.autobalance),
            ChainEstimate::new(&settings.autobalance),
        ];
        let weight_a = settings.weight_a;
        let weight_b = settings.weight_b;
        let mut planner = SlotPlanner::default();
        let slot_target = planner.next(weight_a, weight_b);

        Self {
            inner: Mutex::new(Inner {
                settings,
                weight_a,
                weight_b,
                planner,
                slot_started: now,
                slot_target,
                ready: [false, false],
                miners: HashMap::new(),
                chains,
                last_rebalance: now,
            }),
        }
    }

    /// Register a miner and return its initial pool, if any is usable.
    /// Initial assignment is not a switch event.
    pub fn register_miner(&self, miner: MinerId, _now: Instant) -> Option<PoolId> {
        let mut inner = self.lock();
        let target = Self::effective_target(&inner);
        inner.miners.insert(
            miner,
            MinerRoute {
                active: target,
                last_switch: None,
            },
        );
        target
    }

    pub fn deregister_miner(&self, miner: MinerId) {
        self.lock().miners.remove(&miner);
    }

    pub fn active_pool(&self, miner: MinerId) -> Option<PoolId> {
        self.lock().miners.get(&miner).and_then(|r| r.active)
    }

    /// Feed a network hashrate observation for the chain behind a pool.
    /// The measurement fetcher is an external collaborator.
    pub fn observe_network_hashrate(&self, pool: PoolId, rate: f64, now: Instant) {
        if rate > 0.0 {
            self.lock().chains[pool.index()].observe(rate, now);
        }
    }

    /// Record an upstream readiness transition.
    ///
    /// A pool leaving `Ready` fails its miners over immediately,
    /// bypassing the dwell floor; a pool returning waits for the next
    /// slot boundary except for quiesced miners, which are re-routed at
    /// once.
    pub fn set_pool_ready(&self, pool: PoolId, ready: bool, now: Instant) -> Vec<RouteChange> {
        let mut inner = self.lock();
        if inner.ready[pool.index()] == ready {
            return Vec::new();
        }
        inner.ready[pool.index()] = ready;

        let mut changes = Vec::new();

        if !ready {
            let fallback = pool.other();
            let fallback_ready = inner.ready[fallback.index()];
            for (&miner, route) in inner.miners.iter_mut() {
                if route.active != Some(pool) {
                    continue;
                }
                if fallback_ready {
                    route.active = Some(fallback);
                    route.last_switch = Some(now);
                    changes.push(RouteChange::Switch {
                        miner,
                        from: Some(pool),
                        to: fallback,
                    });
                } else {
                    route.active = None;
                    changes.push(RouteChange::Quiesce { miner });
                }
            }
        } else {
            // Re-route quiesced miners now; routed miners wait for the
            // next slot boundary.
            if let Some(target) = Self::effective_target(&inner) {
                for (&miner, route) in inner.miners.iter_mut() {
                    if route.active.is_none() {
                        route.active = Some(target);
                        route.last_switch = Some(now);
                        changes.push(RouteChange::Switch {
                            miner,
                            from: None,
                            to: target,
                        });
                    }
                }
            }
        }

        changes
    }

    /// Periodic tick: advance slots, rebalance weights, move miners that
    /// are off-target and past their dwell floor.
    pub fn tick(&self, now: Instant) -> Vec<RouteChange> {
        let mut inner = self.lock();

        if inner.settings.mode == ScheduleMode::Autobalance {
            let period = Duration::from_secs(inner.settings.autobalance.period_seconds);
            if now.saturating_duration_since(inner.last_rebalance) >= period {
                inner.last_rebalance = now;
                Self::rebalance(&mut inner);
            }
        }

        // Advance slot boundaries that have elapsed
        let slot = inner.settings.slot;
        while now.saturating_duration_since(inner.slot_started) >= slot {
            inner.slot_started += slot;
            let (wa, wb) = (inner.weight_a, inner.weight_b);
            inner.slot_target = inner.planner.next(wa, wb);
        }

        let target = match Self::effective_target(&inner) {
            Some(target) => target,
            None => {
                // No usable pool: quiesce everyone still routed
                let mut changes = Vec::new();
                for (&miner, route) in inner.miners.iter_mut() {
                    if route.active.take().is_some() {
                        changes.push(RouteChange::Quiesce { miner });
                    }
                }
                return changes;
            }
        };

        let dwell = inner.settings.dwell_floor;
        let mut changes = Vec::new();
        for (&miner, route) in inner.miners.iter_mut() {
            match route.active {
                Some(active) if active == target => {}
                Some(active) => {
                    let dwell_ok = route
                        .last_switch
                        .map_or(true, |at| now.saturating_duration_since(at) >= dwell);
                    if dwell_ok {
                        route.active = Some(target);
                        route.last_switch = Some(now);
                        changes.push(RouteChange::Switch {
                            miner,
                            from: Some(active),
                            to: target,
                        });
                    }
                }
                None => {
                    route.active = Some(target);
                    route.last_switch = Some(now);
                    changes.push(RouteChange::Switch {
                        miner,
                        from: None,
                        to: target,
                    });
                }
            }
        }

        changes
    }

    /// Atomically adopt new settings from a reloaded config.
    pub fn apply_settings(&self, settings: SchedulerSettings) {
        let mut inner = self.lock();
        inner.weight_a = settings.weight_a;
        inner.weight_b = settings.weight_b;
        inner.chains = [
            ChainEstimate::new(&settings.autobalance),
            ChainEstimate::new(&settings.autobalance),
        ];
        inner.settings = settings;
    }

    pub fn status(&self, now: Instant) -> SchedulerStatus {
        let inner = self.lock();
        let elapsed = now.saturating_duration_since(inner.slot_started);
        let next_slot_in = inner.settings.slot.saturating_sub(elapsed);

        let mut miners: Vec<MinerRouteStatus> = inner
            .miners
            .iter()
            .map(|(&miner, route)| MinerRouteStatus {
                miner,
                active_pool: route.active,
            })
            .collect();
        miners.sort_by_key(|m| m.miner);

        SchedulerStatus {
            mode: match inner.settings.mode {
                ScheduleMode::Fixed => "fixed".to_string(),
                ScheduleMode::Autobalance => "autobalance".to_string(),
            },
            weight_a: inner.weight_a,
            weight_b: inner.weight_b,
            next_slot_in_secs: next_slot_in.as_secs(),
            miners,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The pool the scheduler would route to right now, or `None` when
    /// neither pool is usable.
    fn effective_target(inner: &Inner) -> Option<PoolId> {
        let ready_a = inner.ready[PoolId::A.index()];
        let ready_b = inner.ready[PoolId::B.index()];

        match (ready_a, ready_b) {
            (false, false) => None,
            (true, false) => Some(PoolId::A),
            (false, true) => Some(PoolId::B),
            (true, true) => {
                // Single-pool collapse at a zero weight, else the slot target
                if inner.weight_a == 0 {
                    Some(PoolId::B)
                } else if inner.weight_b == 0 {
                    Some(PoolId::A)
                } else {
                    Some(inner.slot_target)
                }
            }
        }
    }

    /// Derive weights from blended profitability per unit hash.
    ///
    /// `profitability(X) = subsidy / (network_hashrate(X) * interval)`,
    /// the expected coins one hash contributes. Missing estimates keep
    /// the configured weights.
    fn rebalance(inner: &mut Inner) {
        let blend = inner.settings.autobalance.blend_short;
        let rate_a = inner.chains[0].blended(blend);
        let rate_b = inner.chains[1].blended(blend);

        let (rate_a, rate_b) = match (rate_a, rate_b) {
            (Some(a), Some(b)) if a > 0.0 && b > 0.0 => (a, b),
            _ => {
                inner.weight_a = inner.settings.weight_a;
                inner.weight_b = inner.settings.weight_b;
                return;
            }
        };

        let prof_a = BLOCK_SUBSIDY / (rate_a * BLOCK_INTERVAL_SECS);
        let prof_b = BLOCK_SUBSIDY / (rate_b * BLOCK_INTERVAL_SECS);
        let share_a = prof_a / (prof_a + prof_b);

        inner.weight_a = ((share_a * 1000.0).round() as u32).max(1);
        inner.weight_b = (1000 - inner.weight_a.min(999)).max(1);
    }
}
