//! janus-proxy: a dual-pool Stratum v1 mining proxy.
//!
//! The proxy presents itself as a pool to downstream miners while holding
//! client sessions to two upstream pools, splitting each miner's hashing
//! effort between them according to a configured weighting or an
//! auto-balancing rule. Stratum semantics are preserved on both sides:
//! miners see a stable extranonce and a monotonic job lineage, pools see
//! correctly attributed shares.

pub mod api;
pub mod config;
pub mod daemon;
pub mod downstream;
pub mod events;
pub mod extranonce;
pub mod job;
pub mod metrics;
pub mod router;
pub mod scheduler;
pub mod stratum;
pub mod tracing;
pub mod types;
pub mod upstream;
