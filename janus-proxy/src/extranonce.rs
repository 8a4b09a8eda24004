//! Proxy extranonce minting and per-upstream splice layout.
//!
//! The proxy advertises its own 4-byte extranonce1 to each miner: a fixed
//! 2-byte proxy prefix followed by the miner's 16-bit session counter.
//! The upstream pool's extranonce1 is baked into the `coinbase1` the
//! proxy forwards downstream, and any slack in the upstream's
//! extranonce2 budget becomes zero-fill prepended to the forwarded
//! `coinbase2`. On submit the proxy reconstructs the pool-bound
//! extranonce2 as `proxy_extranonce1 ∥ miner_extranonce2 ∥ zero-fill`,
//! so the bytes the miner hashed and the bytes the pool reconstructs are
//! identical.

/// Two-byte prefix identifying proxy-minted extranonce1 values.
pub const PROXY_EXTRANONCE1_PREFIX: [u8; 2] = [0x4a, 0x58];

/// Size in bytes of the extranonce1 advertised to miners.
pub const PROXY_EXTRANONCE1_SIZE: usize = 4;

/// Mint the extranonce1 advertised to a miner: prefix ∥ session counter.
pub fn mint_extranonce1(session_counter: u16) -> String {
    let mut bytes = [0u8; PROXY_EXTRANONCE1_SIZE];
    bytes[..2].copy_from_slice(&PROXY_EXTRANONCE1_PREFIX);
    bytes[2..].copy_from_slice(&session_counter.to_be_bytes());
    hex::encode(bytes)
}

/// Cached splice arithmetic for one upstream, resolved at subscribe time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtranonceLayout {
    /// The upstream pool's extranonce1, hex as received.
    upstream_extranonce1: String,
    /// Zero bytes appended after the miner's extranonce2 to fill the
    /// upstream's extranonce2 budget.
    pad: usize,
}

impl ExtranonceLayout {
    /// Resolve the layout for an upstream.
    ///
    /// Returns `None` when the upstream's extranonce2 budget cannot hold
    /// the proxy extranonce1 plus the miner's extranonce2; jobs from such
    /// a pool are not forwardable.
    pub fn resolve(
        upstream_extranonce1: &str,
        upstream_extranonce2_size: usize,
        miner_extranonce2_size: usize,
    ) -> Option<Self> {
        let need = PROXY_EXTRANONCE1_SIZE + miner_extranonce2_size;
        if upstream_extranonce2_size < need {
            return None;
        }
        Some(Self {
            upstream_extranonce1: upstream_extranonce1.to_owned(),
            pad: upstream_extranonce2_size - need,
        })
    }

    /// `coinbase1` to forward downstream: the pool's coinbase1 with its
    /// extranonce1 spliced onto the end.
    pub fn downstream_coinbase1(&self, coinbase1: &str) -> String {
        let mut out = String::with_capacity(coinbase1.len() + self.upstream_extranonce1.len());
        out.push_str(coinbase1);
        out.push_str(&self.upstream_extranonce1);
        out
    }

    /// `coinbase2` to forward downstream: zero-fill for the unused tail
    /// of the upstream extranonce2 budget, then the pool's coinbase2.
    pub fn downstream_coinbase2(&self, coinbase2: &str) -> String {
        let mut out = String::with_capacity(self.pad * 2 + coinbase2.len());
        for _ in 0..self.pad {
            out.push_str("00");
        }
        out.push_str(coinbase2);
        out
    }

    /// The extranonce2 to submit upstream for a miner's share.
    pub fn upstream_extranonce2(&self, proxy_extranonce1: &str, miner_extranonce2: &str) -> String {
        let mut out =
            String::with_capacity(proxy_extranonce1.len() + miner_extranonce2.len() + self.pad * 2);
        out.push_str(proxy_extranonce1);
        out.push_str(miner_extranonce2);
        for _ in 0..self.pad {
            out.push_str("00");
        }
        out
    }
}
