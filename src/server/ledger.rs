use std::time::{Duration, Instant};

use ahash::AHashMap;
use cid::Cid;
use libp2p::PeerId;

use crate::{
    client::wantlist::{Entry, Wantlist},
    message::{Priority, WantType},
};

use super::score_ledger::ScoreLedger;

/// Tracks the wantlist and the exchange counters for a given partner.
///
/// Both the send and the receive path account through this struct, under the
/// same per-peer lock.
#[derive(Debug)]
pub struct Ledger {
    /// The remote peer.
    partner: PeerId,
    wantlist: Wantlist,
    score: ScoreLedger,
    /// Failed send attempts per key, cleared on success.
    send_failures: AHashMap<Cid, u32>,
    /// Set while the peer is disconnected.
    disconnected_at: Option<Instant>,
    /// Set once the ledger was removed from the engine.
    released: bool,
}

impl Ledger {
    pub fn new(partner: PeerId) -> Self {
        Ledger {
            partner,
            wantlist: Default::default(),
            score: Default::default(),
            send_failures: Default::default(),
            disconnected_at: None,
            released: false,
        }
    }

    pub fn partner(&self) -> &PeerId {
        &self.partner
    }

    pub fn score(&self) -> &ScoreLedger {
        &self.score
    }

    pub fn score_mut(&mut self) -> &mut ScoreLedger {
        &mut self.score
    }

    pub fn wants(&mut self, cid: Cid, priority: Priority, want_type: WantType) {
        self.wantlist.add(cid, priority, want_type);
    }

    pub fn cancel_want(&mut self, cid: &Cid) -> Option<Entry> {
        self.send_failures.remove(cid);
        self.wantlist.remove(cid)
    }

    pub fn wantlist_get(&self, cid: &Cid) -> Option<&Entry> {
        self.wantlist.get(cid)
    }

    pub fn wantlist_mut(&mut self) -> &mut Wantlist {
        &mut self.wantlist
    }

    pub fn entries(&mut self) -> impl Iterator<Item = Entry> + '_ {
        self.wantlist.entries()
    }

    /// Clears the wantlist, returning the keys that were on it.
    pub fn clear_wantlist(&mut self) -> Vec<Cid> {
        let cids = self.wantlist.entries().map(|e| e.cid).collect();
        self.wantlist.clear();
        self.send_failures.clear();
        cids
    }

    /// Records a failed send of `cid`, returning the number of failed attempts so far.
    pub fn record_send_failure(&mut self, cid: Cid) -> u32 {
        let attempts = self.send_failures.entry(cid).or_default();
        *attempts += 1;
        *attempts
    }

    pub fn clear_send_failure(&mut self, cid: &Cid) {
        self.send_failures.remove(cid);
    }

    pub fn is_connected(&self) -> bool {
        self.disconnected_at.is_none()
    }

    pub fn set_connected(&mut self) {
        self.disconnected_at = None;
    }

    pub fn set_disconnected(&mut self, now: Instant) {
        if self.disconnected_at.is_none() {
            self.disconnected_at = Some(now);
        }
    }

    pub fn release(&mut self) {
        self.released = true;
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// A ledger can be released once its peer has been gone for longer than `retention`
    /// and nothing is wanted anymore.
    pub fn is_expired(&self, now: Instant, retention: Duration) -> bool {
        match self.disconnected_at {
            Some(at) => self.wantlist.is_empty() && now.saturating_duration_since(at) >= retention,
            None => false,
        }
    }
}
