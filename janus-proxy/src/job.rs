//! Job records and the bounded per-upstream job ring.
//!
//! Job fields are kept exactly as received: the proxy never assembles
//! block headers or recomputes merkle roots, so `prevhash`, the coinbase
//! halves, branches, `version`, `nbits` and `ntime` stay opaque hex.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::types::PoolId;

/// Number of jobs retained per upstream.
pub const JOB_RING_CAPACITY: usize = 16;

/// Number of evicted job ids remembered for the stale-grace window.
const EVICTION_LOG_CAPACITY: usize = 64;

/// One `mining.notify` from an upstream pool, as received.
#[derive(Debug, Clone)]
pub struct JobRecord {
    /// Pool that issued the job
    pub pool: PoolId,
    /// Job id exactly as the pool sent it
    pub pool_job_id: String,
    pub prevhash: String,
    pub coinbase1: String,
    pub coinbase2: String,
    pub merkle_branch: Vec<String>,
    pub version: String,
    pub nbits: String,
    pub ntime: String,
    pub clean_jobs: bool,
    /// When the notify arrived
    pub received_at: Instant,
    /// Share difficulty in force when the job was issued
    pub difficulty: f64,
}

impl JobRecord {
    /// Parse from `mining.notify` params.
    ///
    /// Params are `[job_id, prevhash, coinbase1, coinbase2, merkle_branch,
    /// version, nbits, ntime, clean_jobs]`. All strings are kept verbatim.
    pub fn from_notify_params(
        pool: PoolId,
        params: &[Value],
        difficulty: f64,
    ) -> Result<Self, String> {
        if params.len() < 9 {
            return Err("mining.notify params too short".to_string());
        }

        let str_at = |i: usize, name: &str| -> Result<String, String> {
            params[i]
                .as_str()
                .map(str::to_owned)
                .ok_or_else(|| format!("{name} not a string"))
        };

        let branches_json = params[4]
            .as_array()
            .ok_or("merkle_branch not an array")?;
        let mut merkle_branch = Vec::with_capacity(branches_json.len());
        for branch in branches_json {
            merkle_branch.push(
                branch
                    .as_str()
                    .map(str::to_owned)
                    .ok_or("merkle branch not a string")?,
            );
        }

        Ok(Self {
            pool,
            pool_job_id: str_at(0, "job_id")?,
            prevhash: str_at(1, "prevhash")?,
            coinbase1: str_at(2, "coinbase1")?,
            coinbase2: str_at(3, "coinbase2")?,
            merkle_branch,
            version: str_at(5, "version")?,
            nbits: str_at(6, "nbits")?,
            ntime: str_at(7, "ntime")?,
            clean_jobs: params[8].as_bool().ok_or("clean_jobs not a bool")?,
            received_at: Instant::now(),
            difficulty,
        })
    }
}

/// Bounded FIFO of the most recent jobs from one upstream.
///
/// Evicted job ids are remembered with their eviction instant so the
/// router can decide whether a late submit falls inside the stale grace
/// window. The ring is cloned into upstream snapshots; entries are
/// `Arc`-shared so the clone is cheap.
#[derive(Debug, Clone, Default)]
pub struct JobRing {
    jobs: VecDeque<Arc<JobRecord>>,
    evicted: VecDeque<(String, Instant)>,
}

impl JobRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job, evicting the oldest when full.
    pub fn push(&mut self, job: Arc<JobRecord>) {
        while self.jobs.len() >= JOB_RING_CAPACITY {
            if let Some(old) = self.jobs.pop_front() {
                self.evicted
                    .push_back((old.pool_job_id.clone(), Instant::now()));
            }
        }
        while self.evicted.len() > EVICTION_LOG_CAPACITY {
            self.evicted.pop_front();
        }
        self.jobs.push_back(job);
    }

    /// Drop every cached job, as on `clean_jobs` or reconnect.
    pub fn clear(&mut self) {
        let now = Instant::now();
        for old in self.jobs.drain(..) {
            self.evicted.push_back((old.pool_job_id.clone(), now));
        }
        while self.evicted.len() > EVICTION_LOG_CAPACITY {
            self.evicted.pop_front();
        }
    }

    pub fn contains(&self, pool_job_id: &str) -> bool {
        self.jobs.iter().any(|j| j.pool_job_id == pool_job_id)
    }

    pub fn get(&self, pool_job_id: &str) -> Option<&Arc<JobRecord>> {
        self.jobs.iter().find(|j| j.pool_job_id == pool_job_id)
    }

    /// Most recently received job.
    pub fn latest(&self) -> Option<&Arc<JobRecord>> {
        self.jobs.back()
    }

    /// When the given job id left the ring, if remembered.
    pub fn evicted_at(&self, pool_job_id: &str) -> Option<Instant> {
        self.evicted
            .iter()
            .rev()
            .find(|(id, _)| id == pool_job_id)
            .map(|&(_, at)| at)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
