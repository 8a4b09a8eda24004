//! Structured event emission.
//!
//! The proxy's observable behaviour is narrated as a fixed vocabulary of
//! events, emitted as `tracing` events with typed fields under the
//! `janus_proxy::event` target. The log sink collaborator subscribes to
//! that target; `log.events` in the config narrows the vocabulary.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{MinerId, PoolId};

/// Event vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PoolSwitched,
    ShareResult,
    JobForwarded,
    PoolDisconnected,
    PoolUnavailable,
    MinerConnected,
    MinerDisconnected,
    ExtranonceChange,
    StaleShare,
    DuplicateShare,
    ProtocolError,
    ComponentCrashed,
}

const EVENT_TARGET: &str = "janus_proxy::event";

/// Filtered emitter handed to every component.
///
/// Cheap to clone; an empty filter means everything is emitted.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    enabled: Option<Arc<HashSet<EventKind>>>,
}

impl EventSink {
    /// Build a sink from the configured subset. An empty slice enables
    /// all events.
    pub fn new(kinds: &[EventKind]) -> Self {
        if kinds.is_empty() {
            Self { enabled: None }
        } else {
            Self {
                enabled: Some(Arc::new(kinds.iter().copied().collect())),
            }
        }
    }

    fn on(&self, kind: EventKind) -> bool {
        match &self.enabled {
            None => true,
            Some(set) => set.contains(&kind),
        }
    }

    pub fn pool_switched(&self, miner: MinerId, from: PoolId, to: PoolId) {
        if self.on(EventKind::PoolSwitched) {
            info!(target: EVENT_TARGET, miner, from = %from, to = %to, "pool_switched");
        }
    }

    pub fn share_result(&self, pool: PoolId, miner: MinerId, accepted: bool, reason: Option<&str>) {
        if self.on(EventKind::ShareResult) {
            info!(
                target: EVENT_TARGET,
                pool = %pool,
                miner,
                accepted,
                reason,
                "share_result"
            );
        }
    }

    pub fn job_forwarded(&self, miner: MinerId, pool: PoolId, proxy_job_id: &str, pool_job_id: &str) {
        if self.on(EventKind::JobForwarded) {
            info!(
                target: EVENT_TARGET,
                miner,
                pool = %pool,
                proxy_job_id,
                pool_job_id,
                "job_forwarded"
            );
        }
    }

    pub fn pool_disconnected(&self, pool: PoolId, reason: &str) {
        if self.on(EventKind::PoolDisconnected) {
            warn!(target: EVENT_TARGET, pool = %pool, reason, "pool_disconnected");
        }
    }

    pub fn pool_unavailable(&self, miner: MinerId) {
        if self.on(EventKind::PoolUnavailable) {
            warn!(target: EVENT_TARGET, miner, "pool_unavailable");
        }
    }

    pub fn miner_connected(&self, miner: MinerId, peer: &str) {
        if self.on(EventKind::MinerConnected) {
            info!(target: EVENT_TARGET, miner, peer, "miner_connected");
        }
    }

    pub fn miner_disconnected(&self, miner: MinerId, peer: &str) {
        if self.on(EventKind::MinerDisconnected) {
            info!(target: EVENT_TARGET, miner, peer, "miner_disconnected");
        }
    }

    pub fn extranonce_change(&self, pool: PoolId) {
        if self.on(EventKind::ExtranonceChange) {
            info!(target: EVENT_TARGET, pool = %pool, "extranonce_change");
        }
    }

    pub fn stale_share(&self, miner: MinerId, proxy_job_id: &str, forwarded: bool) {
        if self.on(EventKind::StaleShare) {
            info!(target: EVENT_TARGET, miner, proxy_job_id, forwarded, "stale_share");
        }
    }

    pub fn duplicate_share(&self, miner: MinerId, proxy_job_id: &str) {
        if self.on(EventKind::DuplicateShare) {
            info!(target: EVENT_TARGET, miner, proxy_job_id, "duplicate_share");
        }
    }

    pub fn protocol_error(&self, side: &str, detail: &str) {
        if self.on(EventKind::ProtocolError) {
            warn!(target: EVENT_TARGET, side, detail, "protocol_error");
        }
    }

    pub fn component_crashed(&self, component: &str) {
        if self.on(EventKind::ComponentCrashed) {
            warn!(target: EVENT_TARGET, component, "component_crashed");
        }
    }
}
