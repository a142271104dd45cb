use ahash::{AHashMap, AHashSet};
use cid::Cid;
use libp2p::PeerId;

/// Reverse index from keys to the peers that want them.
#[derive(Default, Debug)]
pub struct PeerLedger {
    cids: AHashMap<Cid, AHashSet<PeerId>>,
}

impl PeerLedger {
    pub fn wants(&mut self, peer: PeerId, cid: Cid) {
        self.cids.entry(cid).or_default().insert(peer);
    }

    pub fn cancel_want(&mut self, peer: &PeerId, cid: &Cid) {
        if let Some(peers) = self.cids.get_mut(cid) {
            peers.remove(peer);
            if peers.is_empty() {
                self.cids.remove(cid);
            }
        }
    }

    pub fn peers(&self, cid: &Cid) -> Vec<PeerId> {
        self.cids
            .get(cid)
            .map(|peers| peers.iter().copied().collect())
            .unwrap_or_default()
    }
}
