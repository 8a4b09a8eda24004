//! Core identifiers shared across the proxy.

use std::fmt;

use serde::Serialize;

/// The two configured upstream pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolId {
    A,
    B,
}

impl PoolId {
    /// The other pool.
    pub fn other(self) -> Self {
        match self {
            PoolId::A => PoolId::B,
            PoolId::B => PoolId::A,
        }
    }

    /// Lowercase label for metrics and event fields.
    pub fn label(self) -> &'static str {
        match self {
            PoolId::A => "a",
            PoolId::B => "b",
        }
    }

    /// Array index for per-pool tables.
    pub fn index(self) -> usize {
        match self {
            PoolId::A => 0,
            PoolId::B => 1,
        }
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolId::A => write!(f, "A"),
            PoolId::B => write!(f, "B"),
        }
    }
}

/// Downstream session identifier.
///
/// Doubles as the 16-bit session counter spliced into the miner's
/// extranonce1, so it is unique for the proxy's lifetime by construction.
pub type MinerId = u16;

/// Final disposition of one `mining.submit`.
///
/// Local rejections never generate upstream traffic; the remaining
/// variants are resolved by pairing the upstream response with the
/// pending submit id.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// Pool returned `{result: true}`.
    Accepted,
    /// Pool rejected the share. `error` carries the pool's error value
    /// verbatim so it can be echoed to the miner; it is `Null` when the
    /// pool signalled rejection with a bare `{result: false}`.
    Rejected {
        code: i64,
        message: String,
        error: serde_json::Value,
    },
    /// Rejected locally: job evicted beyond the stale grace window.
    StaleLocal,
    /// Rejected locally: identical submit already seen.
    DuplicateLocal,
    /// No upstream response within the submit timeout.
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_id_other_and_labels() {
        assert_eq!(PoolId::A.other(), PoolId::B);
        assert_eq!(PoolId::B.other(), PoolId::A);
        assert_eq!(PoolId::A.label(), "a");
        assert_eq!(PoolId::B.index(), 1);
        assert_eq!(PoolId::A.to_string(), "A");
    }
}
