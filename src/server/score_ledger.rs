use std::fmt::Debug;

use libp2p::PeerId;

/// Decides how the byte counters of a peer translate into scheduling priority.
pub trait ReciprocityPolicy: Debug + Send + Sync + 'static {
    /// How much the peer owes us, higher means we gave more than we got.
    fn debt_ratio(&self, bytes_sent: u64, bytes_recv: u64) -> f64;

    /// Whether a peer with the given ratio is only served after everyone else.
    fn is_overdrawn(&self, debt_ratio: f64) -> bool;
}

/// `sent / max(recv, 1)`, overdrawn above a fixed threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DebtRatioPolicy {
    pub threshold: f64,
}

impl Default for DebtRatioPolicy {
    fn default() -> Self {
        DebtRatioPolicy { threshold: 2.0 }
    }
}

impl ReciprocityPolicy for DebtRatioPolicy {
    fn debt_ratio(&self, bytes_sent: u64, bytes_recv: u64) -> f64 {
        bytes_sent as f64 / bytes_recv.max(1) as f64
    }

    fn is_overdrawn(&self, debt_ratio: f64) -> bool {
        debt_ratio > self.threshold
    }
}

/// Stores the data exchange relationship between two peers.
///
/// All counters only ever grow.
#[derive(Debug, Clone, Default)]
pub struct ScoreLedger {
    /// Tracks bytes sent.
    bytes_sent: u64,
    /// Tracks bytes received in blocks we wanted.
    bytes_recv: u64,
    /// Tracks bytes received in blocks we did not want or already had.
    bytes_dup_recv: u64,
    /// Number of exchanges we had with this peer.
    exchange_count: u64,
}

/// A summary of the ledger for the given peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    pub peer: PeerId,
    /// The debt ratio.
    pub value: f64,
    pub sent: u64,
    pub recv: u64,
    /// Duplicate bytes, not part of the debt ratio.
    pub dup_recv: u64,
    pub exchanged: u64,
}

impl Receipt {
    /// The receipt of a peer we never exchanged anything with.
    pub fn empty(peer: PeerId) -> Self {
        Receipt {
            peer,
            value: 0.,
            sent: 0,
            recv: 0,
            dup_recv: 0,
            exchanged: 0,
        }
    }
}

impl ScoreLedger {
    /// Increments the sent counter, each sent block is one exchange.
    pub fn add_to_sent_bytes(&mut self, n: usize) {
        self.exchange_count += 1;
        self.bytes_sent += n as u64;
    }

    /// Increments the received counters.
    ///
    /// Only blocks we actually wanted count as an exchange and pay down the debt ratio,
    /// everything else is tracked as duplicate bytes.
    pub fn add_to_recv_bytes(&mut self, n: usize, was_wanted: bool) {
        if was_wanted {
            self.exchange_count += 1;
            self.bytes_recv += n as u64;
        } else {
            self.bytes_dup_recv += n as u64;
        }
    }

    /// Returns the receipt for this ledger
    pub fn receipt(&self, partner: PeerId, policy: &dyn ReciprocityPolicy) -> Receipt {
        Receipt {
            peer: partner,
            value: policy.debt_ratio(self.bytes_sent, self.bytes_recv),
            sent: self.bytes_sent,
            recv: self.bytes_recv,
            dup_recv: self.bytes_dup_recv,
            exchanged: self.exchange_count,
        }
    }
}
