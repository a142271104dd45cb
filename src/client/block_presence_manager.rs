use std::sync::Arc;

use ahash::AHashMap;
use cid::Cid;
use libp2p::PeerId;
use tokio::sync::RwLock;

/// Tracks which peers told us they have or do not have a block.
#[derive(Debug, Clone, Default)]
pub struct BlockPresenceManager {
    presence: Arc<RwLock<AHashMap<Cid, AHashMap<PeerId, bool>>>>,
}

impl BlockPresenceManager {
    /// Called when a peer sends us information about which blocks it has and does not have.
    pub async fn receive_from(&self, peer: &PeerId, haves: &[Cid], dont_haves: &[Cid]) {
        let presence = &mut *self.presence.write().await;

        for key in haves {
            update_block_presence(presence, peer, key, true);
        }
        for key in dont_haves {
            update_block_presence(presence, peer, key, false);
        }
    }

    /// Indicates wether the given peer has sent a `HAVE` for the given `cid`.
    pub async fn peer_has_block(&self, peer: &PeerId, cid: &Cid) -> bool {
        let presence = self.presence.read().await;
        presence
            .get(cid)
            .and_then(|l| l.get(peer))
            .copied()
            .unwrap_or_default()
    }

    /// Indicates wether the given peer has sent a `DONT_HAVE` for the given `cid`.
    pub async fn peer_does_not_have_block(&self, peer: &PeerId, cid: &Cid) -> bool {
        let presence = self.presence.read().await;
        presence
            .get(cid)
            .and_then(|l| l.get(peer).map(|have| !*have))
            .unwrap_or_default()
    }

    /// Returns the subset of `keys` the peer has not declared unavailable.
    pub async fn filter_unavailable<'a>(
        &self,
        peer: &PeerId,
        keys: impl IntoIterator<Item = &'a Cid>,
    ) -> Vec<Cid> {
        let presence = &*self.presence.read().await;
        keys.into_iter()
            .filter(|key| {
                presence
                    .get(key)
                    .and_then(|l| l.get(peer))
                    .map(|have| *have)
                    .unwrap_or(true)
            })
            .copied()
            .collect()
    }

    /// Cleans up the given keys.
    pub async fn remove_keys(&self, keys: &[Cid]) {
        let presence = &mut *self.presence.write().await;
        for key in keys {
            presence.remove(key);
        }
    }

    /// Forgets everything the peer told us.
    pub async fn remove_peer(&self, peer: &PeerId) {
        let presence = &mut *self.presence.write().await;
        presence.retain(|_, peers| {
            peers.remove(peer);
            !peers.is_empty()
        });
    }

    /// Indicates whether we are tracking this key.
    #[cfg(test)]
    pub async fn has_key(&self, cid: &Cid) -> bool {
        let presence = &*self.presence.read().await;
        presence.contains_key(cid)
    }
}

fn update_block_presence(
    presence: &mut AHashMap<Cid, AHashMap<PeerId, bool>>,
    peer: &PeerId,
    key: &Cid,
    present: bool,
) {
    let entry = presence.entry(*key).or_default();

    // Make sure not to change HAVE to DONT_HAVE
    if let Some(has) = entry.get(peer) {
        if *has {
            return;
        }
    }

    entry.insert(*peer, present);
}
