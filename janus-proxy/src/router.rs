//! Share attribution and local submit validation.
//!
//! Every job forwarded downstream is recorded as an immutable mapping
//! `proxy_job_id → (pool, pool_job_id, difficulty)`. A submit is routed
//! to the pool recorded at minting time, regardless of any pool switch
//! in between; late shares land on the pool whose work they solve.
//!
//! Local rejection (unknown job, stale beyond grace, duplicate,
//! malformed extranonce) happens before any upstream traffic.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::events::EventSink;
use crate::extranonce::ExtranonceLayout;
use crate::metrics::Counters;
use crate::stratum::error_codes;
use crate::types::{MinerId, PoolId};
use crate::upstream::{ConnState, Upstreams, UpstreamSubmit};

/// Bound on per-session proxy-job attributions. Jobs this old are far
/// beyond any stale grace window.
const ATTRIBUTION_CAPACITY: usize = 256;

/// Bound on the per-session duplicate-detection window.
const RECENT_SUBMIT_CAPACITY: usize = 2048;

/// Age past which duplicate-window entries are pruned.
pub const RECENT_SUBMIT_MAX_AGE: Duration = Duration::from_secs(600);

/// Where a job sent downstream came from.
#[derive(Debug, Clone)]
pub struct JobAttribution {
    pub pool: PoolId,
    pub pool_job_id: String,
    /// Share difficulty in force when the job was issued.
    pub difficulty: f64,
}

/// Per-downstream-session map of minted proxy job ids.
///
/// Entries are immutable once inserted; eviction is FIFO.
#[derive(Debug, Default)]
pub struct AttributionMap {
    map: HashMap<String, JobAttribution>,
    order: VecDeque<String>,
}

impl AttributionMap {
    pub fn insert(&mut self, proxy_job_id: String, attribution: JobAttribution) {
        while self.order.len() >= ATTRIBUTION_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.map.remove(&old);
            }
        }
        self.order.push_back(proxy_job_id.clone());
        self.map.insert(proxy_job_id, attribution);
    }

    pub fn get(&self, proxy_job_id: &str) -> Option<&JobAttribution> {
        self.map.get(proxy_job_id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Duplicate-share fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SubmitKey {
    proxy_job_id: String,
    extranonce2: String,
    ntime: String,
    nonce: String,
}

/// Bounded window of recently seen submits for one session.
#[derive(Debug, Default)]
pub struct RecentSubmits {
    seen: HashSet<SubmitKey>,
    order: VecDeque<(SubmitKey, Instant)>,
}

impl RecentSubmits {
    /// Record the submit; returns false when it was already present.
    fn check_and_insert(&mut self, key: SubmitKey) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        while self.order.len() >= RECENT_SUBMIT_CAPACITY {
            if let Some((old, _)) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        self.order.push_back((key.clone(), Instant::now()));
        self.seen.insert(key);
        true
    }

    /// Drop entries older than `max_age`.
    pub fn prune(&mut self, max_age: Duration) {
        let now = Instant::now();
        while let Some((_, at)) = self.order.front() {
            if now.saturating_duration_since(*at) <= max_age {
                break;
            }
            if let Some((old, _)) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// One `mining.submit` from a miner, fields verbatim.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub proxy_job_id: String,
    pub extranonce2: String,
    pub ntime: String,
    pub nonce: String,
    pub version_bits: Option<String>,
}

/// Validation verdict for a submit.
#[derive(Debug)]
pub enum SubmitDisposition {
    /// Reject without upstream traffic.
    RejectLocal { code: i64, message: &'static str },
    /// Forward to the attributed pool.
    Forward {
        pool: PoolId,
        /// Difficulty recorded at job issuance, for accounting.
        difficulty: f64,
        submit: UpstreamSubmit,
    },
}

/// Stateless routing policy; per-session state is passed in.
pub struct ShareRouter {
    stale_grace: Duration,
    counters: Arc<Counters>,
    events: EventSink,
}

impl ShareRouter {
    pub fn new(stale_grace: Duration, counters: Arc<Counters>, events: EventSink) -> Self {
        Self {
            stale_grace,
            counters,
            events,
        }
    }

    /// Validate a submit and decide its route.
    #[allow(clippy::too_many_arguments)]
    pub fn route(
        &self,
        miner: MinerId,
        request: &SubmitRequest,
        jobs: &AttributionMap,
        recent: &mut RecentSubmits,
        upstreams: &Upstreams,
        proxy_extranonce1: &str,
        miner_extranonce2_size: usize,
    ) -> SubmitDisposition {
        let attribution = match jobs.get(&request.proxy_job_id) {
            Some(attribution) => attribution,
            None => {
                return SubmitDisposition::RejectLocal {
                    code: error_codes::JOB_NOT_FOUND,
                    message: "Job not found",
                }
            }
        };

        if request.extranonce2.len() != miner_extranonce2_size * 2
            || !request.extranonce2.chars().all(|c| c.is_ascii_hexdigit())
        {
            return SubmitDisposition::RejectLocal {
                code: error_codes::OTHER,
                message: "Invalid extranonce2",
            };
        }

        // Stale check against the pool's ring, with the grace window
        let snapshot = upstreams.get(attribution.pool).snapshot();
        let fresh = snapshot.state == ConnState::Ready
            && snapshot.jobs.contains(&attribution.pool_job_id);
        if !fresh {
            let within_grace = snapshot.state == ConnState::Ready
                && snapshot
                    .jobs
                    .evicted_at(&attribution.pool_job_id)
                    .map_or(false, |at| at.elapsed() < self.stale_grace);

            if !within_grace {
                Counters::inc(&self.counters.shares_rejected_stale);
                self.events
                    .stale_share(miner, &request.proxy_job_id, false);
                return SubmitDisposition::RejectLocal {
                    code: error_codes::JOB_NOT_FOUND,
                    message: "Stale share",
                };
            }
            self.events.stale_share(miner, &request.proxy_job_id, true);
        }

        // Duplicate suppression
        let key = SubmitKey {
            proxy_job_id: request.proxy_job_id.clone(),
            extranonce2: request.extranonce2.clone(),
            ntime: request.ntime.clone(),
            nonce: request.nonce.clone(),
        };
        if !recent.check_and_insert(key) {
            Counters::inc(&self.counters.shares_rejected_duplicate);
            self.events.duplicate_share(miner, &request.proxy_job_id);
            return SubmitDisposition::RejectLocal {
                code: error_codes::DUPLICATE_SHARE,
                message: "Duplicate share",
            };
        }

        // Rebuild the pool-bound extranonce2
        let layout = match ExtranonceLayout::resolve(
            &snapshot.extranonce1,
            snapshot.extranonce2_size,
            miner_extranonce2_size,
        ) {
            Some(layout) => layout,
            None => {
                self.events.protocol_error(
                    attribution.pool.label(),
                    "extranonce2 budget cannot hold the proxy layout",
                );
                return SubmitDisposition::RejectLocal {
                    code: error_codes::OTHER,
                    message: "Extranonce layout mismatch",
                };
            }
        };

        SubmitDisposition::Forward {
            pool: attribution.pool,
            difficulty: attribution.difficulty,
            submit: UpstreamSubmit {
                pool_job_id: attribution.pool_job_id.clone(),
                extranonce2: layout
                    .upstream_extranonce2(proxy_extranonce1, &request.extranonce2),
                ntime: request.ntime.clone(),
                nonce: request.nonce.clone(),
                version_bits: request.version_bits.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobRecord, JobRing, JOB_RING_CAPACITY};
    use crate::upstream::test_support::{ready_snapshot, stub_handle};
    use crate::upstream::UpstreamSnapshot;

    fn test_router(stale_grace: Duration) -> ShareRouter {
        ShareRouter::new(stale_grace, Arc::new(Counters::default()), EventSink::default())
    }

    fn job(pool: PoolId, id: &str) -> Arc<JobRecord> {
        Arc::new(JobRecord {
            pool,
            pool_job_id: id.to_string(),
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
        })
    }

    fn upstreams_with_rings(ring_a: JobRing, ring_b: JobRing) -> Upstreams {
        let mut snap_a = ready_snapshot("f1f1f1f1", 8, 1024.0);
        snap_a.jobs = ring_a;
        let mut snap_b = ready_snapshot("e2e2e2e2", 8, 2048.0);
        snap_b.jobs = ring_b;

        let (a, _cmd_a, _tx_a) = stub_handle(PoolId::A, snap_a);
        let (b, _cmd_b, _tx_b) = stub_handle(PoolId::B, snap_b);
        Upstreams { a, b }
    }

    fn request(job_id: &str, nonce: &str) -> SubmitRequest {
        SubmitRequest {
            proxy_job_id: job_id.to_string(),
            extranonce2: "01020304".to_string(),
            ntime: "5a5a5a5a".to_string(),
            nonce: nonce.to_string(),
            version_bits: None,
        }
    }

    /// Attribution recorded at minting time survives pool switches: a
    /// share against an old pool-A job routes to A even when the miner
    /// has since switched to B.
    #[test]
    fn attribution_is_immutable_across_switches() {
        let router = test_router(Duration::from_secs(20));

        let mut ring_a = JobRing::new();
        ring_a.push(job(PoolId::A, "a-55"));
        let mut ring_b = JobRing::new();
        ring_b.push(job(PoolId::B, "b-90"));
        let upstreams = upstreams_with_rings(ring_a, ring_b);

        let mut jobs = AttributionMap::default();
        jobs.insert(
            "1".into(),
            JobAttribution {
                pool: PoolId::A,
                pool_job_id: "a-55".into(),
                difficulty: 1024.0,
            },
        );
        // Miner has since been switched to B and received a B job
        jobs.insert(
            "2".into(),
            JobAttribution {
                pool: PoolId::B,
                pool_job_id: "b-90".into(),
                difficulty: 2048.0,
            },
        );

        let mut recent = RecentSubmits::default();
        match router.route(
            1,
            &request("1", "deadbeef"),
            &jobs,
            &mut recent,
            &upstreams,
            "4a580001",
            4,
        ) {
            SubmitDisposition::Forward {
                pool,
                difficulty,
                submit,
            } => {
                assert_eq!(pool, PoolId::A);
                assert_eq!(difficulty, 1024.0);
                assert_eq!(submit.pool_job_id, "a-55");
                assert_eq!(submit.extranonce2, "4a58000101020304");
            }
            other => panic!("expected Forward to A, got {other:?}"),
        }
    }

    #[test]
    fn unknown_job_is_rejected_locally() {
        let router = test_router(Duration::from_secs(20));
        let upstreams = upstreams_with_rings(JobRing::new(), JobRing::new());
        let jobs = AttributionMap::default();
        let mut recent = RecentSubmits::default();

        match router.route(
            1,
            &request("77", "deadbeef"),
            &jobs,
            &mut recent,
            &upstreams,
            "4a580001",
            4,
        ) {
            SubmitDisposition::RejectLocal { code, message } => {
                assert_eq!(code, error_codes::JOB_NOT_FOUND);
                assert_eq!(message, "Job not found");
            }
            other => panic!("expected local reject, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_submit_never_reaches_upstream() {
        let router = test_router(Duration::from_secs(20));

        let mut ring_a = JobRing::new();
        ring_a.push(job(PoolId::A, "a-1"));
        let upstreams = upstreams_with_rings(ring_a, JobRing::new());

        let mut jobs = AttributionMap::default();
        jobs.insert(
            "1".into(),
            JobAttribution {
                pool: PoolId::A,
                pool_job_id: "a-1".into(),
                difficulty: 512.0,
            },
        );
        let mut recent = RecentSubmits::default();

        let first = router.route(
            1,
            &request("1", "deadbeef"),
            &jobs,
            &mut recent,
            &upstreams,
            "4a580001",
            4,
        );
        assert!(matches!(first, SubmitDisposition::Forward { .. }));

        let second = router.route(
            1,
            &request("1", "deadbeef"),
            &jobs,
            &mut recent,
            &upstreams,
            "4a580001",
            4,
        );
        match second {
            SubmitDisposition::RejectLocal { code, message } => {
                assert_eq!(code, error_codes::DUPLICATE_SHARE);
                assert_eq!(message, "Duplicate share");
            }
            other => panic!("expected duplicate reject, got {other:?}"),
        }

        // A different nonce on the same job is not a duplicate
        let third = router.route(
            1,
            &request("1", "cafebabe"),
            &jobs,
            &mut recent,
            &upstreams,
            "4a580001",
            4,
        );
        assert!(matches!(third, SubmitDisposition::Forward { .. }));
    }

    #[test]
    fn evicted_job_within_grace_is_forwarded() {
        let router = test_router(Duration::from_secs(20));

        // Fill the ring until the first job falls out
        let mut ring_a = JobRing::new();
        for i in 0..=JOB_RING_CAPACITY {
            ring_a.push(job(PoolId::A, &format!("a-{i}")));
        }
        assert!(!ring_a.contains("a-0"));
        let upstreams = upstreams_with_rings(ring_a, JobRing::new());

        let mut jobs = AttributionMap::default();
        jobs.insert(
            "1".into(),
            JobAttribution {
                pool: PoolId::A,
                pool_job_id: "a-0".into(),
                difficulty: 512.0,
            },
        );
        let mut recent = RecentSubmits::default();

        // Evicted moments ago: inside the grace window
        let verdict = router.route(
            1,
            &request("1", "deadbeef"),
            &jobs,
            &mut recent,
            &upstreams,
            "4a580001",
            4,
        );
        assert!(matches!(verdict, SubmitDisposition::Forward { .. }));
    }

    #[test]
    fn evicted_job_beyond_grace_is_rejected() {
        // Zero grace: any eviction age is beyond the window
        let router = test_router(Duration::ZERO);

        let mut ring_a = JobRing::new();
        for i in 0..=JOB_RING_CAPACITY {
            ring_a.push(job(PoolId::A, &format!("a-{i}")));
        }
        let upstreams = upstreams_with_rings(ring_a, JobRing::new());

        let mut jobs = AttributionMap::default();
        jobs.insert(
            "1".into(),
            JobAttribution {
                pool: PoolId::A,
                pool_job_id: "a-0".into(),
                difficulty: 512.0,
            },
        );
        let mut recent = RecentSubmits::default();

        match router.route(
            1,
            &request("1", "deadbeef"),
            &jobs,
            &mut recent,
            &upstreams,
            "4a580001",
            4,
        ) {
            SubmitDisposition::RejectLocal { code, message } => {
                assert_eq!(code, error_codes::JOB_NOT_FOUND);
                assert_eq!(message, "Stale share");
            }
            other => panic!("expected stale reject, got {other:?}"),
        }
    }

    #[test]
    fn submit_to_downed_pool_is_rejected() {
        let router = test_router(Duration::from_secs(20));

        let mut ring_a = JobRing::new();
        ring_a.push(job(PoolId::A, "a-1"));
        let mut snap_a = ready_snapshot("f1f1f1f1", 8, 1024.0);
        snap_a.jobs = ring_a;
        snap_a.state = ConnState::Reconnecting;
        let (a, _cmd_a, _tx_a) = stub_handle(PoolId::A, snap_a);
        let (b, _cmd_b, _tx_b) = stub_handle(PoolId::B, ready_snapshot("e2", 8, 1.0));
        let upstreams = Upstreams { a, b };

        let mut jobs = AttributionMap::default();
        jobs.insert(
            "1".into(),
            JobAttribution {
                pool: PoolId::A,
                pool_job_id: "a-1".into(),
                difficulty: 512.0,
            },
        );
        let mut recent = RecentSubmits::default();

        match router.route(
            1,
            &request("1", "deadbeef"),
            &jobs,
            &mut recent,
            &upstreams,
            "4a580001",
            4,
        ) {
            SubmitDisposition::RejectLocal { message, .. } => {
                assert_eq!(message, "Stale share");
            }
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[test]
    fn malformed_extranonce2_is_rejected() {
        let router = test_router(Duration::from_secs(20));
        let mut ring_a = JobRing::new();
        ring_a.push(job(PoolId::A, "a-1"));
        let upstreams = upstreams_with_rings(ring_a, JobRing::new());

        let mut jobs = AttributionMap::default();
        jobs.insert(
            "1".into(),
            JobAttribution {
                pool: PoolId::A,
                pool_job_id: "a-1".into(),
                difficulty: 512.0,
            },
        );
        let mut recent = RecentSubmits::default();

        let mut bad = request("1", "deadbeef");
        bad.extranonce2 = "zz".to_string();
        match router.route(1, &bad, &jobs, &mut recent, &upstreams, "4a580001", 4) {
            SubmitDisposition::RejectLocal { code, .. } => {
                assert_eq!(code, error_codes::OTHER)
            }
            other => panic!("expected reject, got {other:?}"),
        }
    }

    #[test]
    fn attribution_map_is_bounded() {
        let mut jobs = AttributionMap::default();
        for i in 0..ATTRIBUTION_CAPACITY + 10 {
            jobs.insert(
                format!("{i}"),
                JobAttribution {
                    pool: PoolId::A,
                    pool_job_id: format!("a-{i}"),
                    difficulty: 1.0,
                },
            );
        }
        assert_eq!(jobs.len(), ATTRIBUTION_CAPACITY);
        assert!(jobs.get("0").is_none());
        assert!(jobs.get("10").is_some());
    }

    #[test]
    fn recent_submits_window_is_bounded_and_prunable() {
        let mut recent = RecentSubmits::default();
        for i in 0..RECENT_SUBMIT_CAPACITY + 5 {
            let fresh = recent.check_and_insert(SubmitKey {
                proxy_job_id: format!("{i}"),
                extranonce2: "01020304".into(),
                ntime: "5a5a5a5a".into(),
                nonce: "deadbeef".into(),
            });
            assert!(fresh);
        }
        assert_eq!(recent.len(), RECENT_SUBMIT_CAPACITY);

        recent.prune(Duration::ZERO);
        assert!(recent.is_empty());
    }
}
