use cid::Cid;
use libp2p::PeerId;
use tokio::sync::Mutex;

/// A view of the exchange.
///
/// The counters are copied under a single lock and always agree with each other. The
/// wantlist, the peers and the provide buffer length are read one after another, so under
/// concurrent traffic they may be a moment apart from the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stat {
    pub provide_buf_len: usize,
    pub blocks_received: u64,
    pub blocks_sent: u64,
    pub data_received: u64,
    pub data_sent: u64,
    pub dup_blks_received: u64,
    pub dup_data_received: u64,
    pub messages_received: u64,
    pub wantlist: Vec<Cid>,
    pub peers: Vec<PeerId>,
}

/// The raw counters behind a [`Stat`].
///
/// Useful receives and duplicate receives are disjoint: every received block
/// lands in exactly one of the two pairs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub blocks_received: u64,
    pub data_received: u64,
    pub dup_blks_received: u64,
    pub dup_data_received: u64,
    pub blocks_sent: u64,
    pub data_sent: u64,
    pub messages_received: u64,
}

/// Aggregates the counters of the client and the server.
///
/// All counters live behind a single lock, so a copy always reflects one
/// logical instant.
#[derive(Debug, Default)]
pub struct StatAggregator {
    counters: Mutex<Counters>,
}

impl StatAggregator {
    pub async fn record_received(&self, len: usize, useful: bool) {
        let counters = &mut *self.counters.lock().await;
        if useful {
            counters.blocks_received += 1;
            counters.data_received += len as u64;
        } else {
            counters.dup_blks_received += 1;
            counters.dup_data_received += len as u64;
        }
    }

    pub async fn record_sent(&self, blocks: u64, bytes: u64) {
        let counters = &mut *self.counters.lock().await;
        counters.blocks_sent += blocks;
        counters.data_sent += bytes;
    }

    pub async fn record_message_received(&self) {
        self.counters.lock().await.messages_received += 1;
    }

    pub async fn counters(&self) -> Counters {
        *self.counters.lock().await
    }
}
