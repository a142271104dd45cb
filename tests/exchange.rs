use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use iroh_exchange::{
    BitswapMessage, Bitswap, Block, Config, Exchange, Network, Receipt, Reprovider, SessionId,
    Stat, Store, WantType, WantlistEntry,
};
use libp2p::PeerId;
use multihash::{Code, MultihashDigest};
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

const RAW: u64 = 0x55;

fn block(data: &str) -> Block {
    let data = Bytes::from(data.to_string());
    let cid = Cid::new_v1(RAW, Code::Sha2_256.digest(&data));
    Block::new(data, cid)
}

#[derive(Debug, Clone, Default)]
struct MemStore {
    blocks: Arc<RwLock<HashMap<Cid, Block>>>,
    /// `put` fails for these cids.
    broken: Arc<RwLock<HashSet<Cid>>>,
    /// `has` waits here, so concurrent receives line up.
    has_barrier: Option<Arc<Barrier>>,
}

impl MemStore {
    fn with_has_barrier(n: usize) -> Self {
        MemStore {
            has_barrier: Some(Arc::new(Barrier::new(n))),
            ..Default::default()
        }
    }

    fn break_put(&self, cid: Cid) {
        self.broken.write().unwrap().insert(cid);
    }

    fn contains(&self, cid: &Cid) -> bool {
        self.blocks.read().unwrap().contains_key(cid)
    }

    fn with(blocks: &[&Block]) -> Self {
        let store = MemStore::default();
        for block in blocks {
            store
                .blocks
                .write()
                .unwrap()
                .insert(block.cid, (*block).clone());
        }
        store
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get_size(&self, cid: &Cid) -> Result<Option<usize>> {
        Ok(self.blocks.read().unwrap().get(cid).map(|b| b.len()))
    }

    async fn get(&self, cid: &Cid) -> Result<Option<Block>> {
        Ok(self.blocks.read().unwrap().get(cid).cloned())
    }

    async fn has(&self, cid: &Cid) -> Result<bool> {
        if let Some(barrier) = &self.has_barrier {
            barrier.wait().await;
        }
        Ok(self.contains(cid))
    }

    async fn put(&self, block: Block) -> Result<()> {
        if self.broken.read().unwrap().contains(&block.cid) {
            return Err(anyhow!("disk full"));
        }
        self.blocks.write().unwrap().insert(block.cid, block);
        Ok(())
    }
}

/// Records every message instead of sending it.
#[derive(Debug, Clone, Default)]
struct RecordingNetwork {
    sent: Arc<Mutex<Vec<(PeerId, BitswapMessage)>>>,
}

impl RecordingNetwork {
    fn sent_to(&self, peer: &PeerId) -> Vec<BitswapMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == peer)
            .map(|(_, msg)| msg.clone())
            .collect()
    }
}

#[async_trait]
impl Network for RecordingNetwork {
    async fn send_message(&self, peer: PeerId, message: BitswapMessage) -> Result<()> {
        self.sent.lock().unwrap().push((peer, message));
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct FailingNetwork;

#[async_trait]
impl Network for FailingNetwork {
    async fn send_message(&self, _peer: PeerId, _message: BitswapMessage) -> Result<()> {
        Err(anyhow!("connection reset"))
    }
}

#[derive(Debug)]
struct OfflineReprovider;

#[async_trait]
impl Reprovider for OfflineReprovider {
    async fn trigger(&self, _cancel: CancellationToken) -> Result<()> {
        Err(anyhow!("routing offline"))
    }
}

/// Workers are disabled so sends can be driven by the test.
fn test_config() -> Config {
    let mut config = Config::default();
    config.server.task_worker_count = 0;
    config.server.ledger_sweep_interval = Duration::ZERO;
    config.client.want_sweep_interval = Duration::ZERO;
    config
}

async fn bitswap<N: Network>(store: MemStore, network: N) -> Bitswap<MemStore> {
    Bitswap::builder(PeerId::random(), store, network)
        .config(test_config())
        .build()
        .await
}

fn wants(entries: &[(&Block, i32)]) -> BitswapMessage {
    let mut msg = BitswapMessage::new(false);
    for (block, priority) in entries {
        msg.add_entry(block.cid, *priority, WantType::Block, false);
    }
    msg
}

fn blocks(blocks: &[&Block]) -> BitswapMessage {
    let mut msg = BitswapMessage::new(false);
    for block in blocks {
        msg.add_block((*block).clone());
    }
    msg
}

fn cids(entries: &[WantlistEntry]) -> Vec<Cid> {
    entries.iter().map(|e| e.cid).collect()
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let bs = bitswap(MemStore::default(), RecordingNetwork::default()).await;
    let (a, b) = (block("a"), block("b"));

    let session = bs.new_session().await;
    session.want_blocks(&[a.cid, b.cid]).await;

    bs.cancel_wants(&[a.cid], session.id()).await;
    let after_first = bs.wantlist().await;
    bs.cancel_wants(&[a.cid], session.id()).await;
    let after_second = bs.wantlist().await;

    assert_eq!(cids(&after_first), vec![b.cid]);
    assert_eq!(after_first, after_second);

    // cancelling something nobody wants is fine too
    bs.cancel_wants(&[block("c").cid], session.id()).await;
    bs.cancel_wants_for_all_sessions(&[block("c").cid]).await;
    assert_eq!(bs.wantlist().await, after_second);
    bs.stop().await.unwrap();
}

#[tokio::test]
async fn wanted_blocks_count_once() {
    let bs = bitswap(MemStore::default(), RecordingNetwork::default()).await;
    let peer = PeerId::random();
    let received: Vec<_> = ["one", "two", "three"].into_iter().map(block).collect();

    bs.peer_connected(&peer).await;
    let session = bs.new_session().await;
    let keys: Vec<_> = received.iter().map(|b| b.cid).collect();
    session.want_blocks(&keys).await;

    let refs: Vec<_> = received.iter().collect();
    bs.receive_message(&peer, &blocks(&refs)).await.unwrap();

    let receipt = bs.ledger_for_peer(&peer).await;
    assert_eq!(receipt.exchanged, 3);
    assert_eq!(receipt.recv, 3 + 3 + 5);

    let stat = bs.stat().await;
    assert_eq!(stat.blocks_received, 3);
    assert_eq!(stat.data_received, 11);
    assert_eq!(stat.dup_blks_received, 0);
    assert_eq!(stat.dup_data_received, 0);
    assert_eq!(stat.messages_received, 1);
    assert!(stat.wantlist.is_empty());
    bs.stop().await.unwrap();
}

#[tokio::test]
async fn unwanted_block_is_a_duplicate() {
    let bs = bitswap(MemStore::default(), RecordingNetwork::default()).await;
    let peer = PeerId::random();
    let unwanted = block("nobody asked");

    bs.receive_message(&peer, &blocks(&[&unwanted])).await.unwrap();

    let stat = bs.stat().await;
    assert_eq!(stat.dup_blks_received, 1);
    assert_eq!(stat.dup_data_received, unwanted.len() as u64);
    assert_eq!(stat.blocks_received, 0);

    let receipt = bs.ledger_for_peer(&peer).await;
    assert_eq!(receipt.exchanged, 0);
    assert_eq!(receipt.recv, 0);
    assert_eq!(receipt.dup_recv, unwanted.len() as u64);
    bs.stop().await.unwrap();
}

#[tokio::test]
async fn already_stored_block_is_a_duplicate() {
    let held = block("held");
    let bs = bitswap(MemStore::with(&[&held]), RecordingNetwork::default()).await;
    let peer = PeerId::random();

    let session = bs.new_session().await;
    session.want_blocks(&[held.cid]).await;
    bs.receive_message(&peer, &blocks(&[&held])).await.unwrap();

    let stat = bs.stat().await;
    assert_eq!(stat.dup_blks_received, 1);
    assert_eq!(stat.blocks_received, 0);
    assert!(stat.wantlist.is_empty());
    assert_eq!(bs.ledger_for_peer(&peer).await.exchanged, 0);
    bs.stop().await.unwrap();
}

#[tokio::test]
async fn debt_ratio_moves_with_traffic() {
    let bs = bitswap(MemStore::default(), RecordingNetwork::default()).await;
    let peer = PeerId::random();
    let x = block("x").cid;
    let server = bs.server();

    let mut last = server.debt_ratio(&peer).await;
    for _ in 0..3 {
        server.record_sent(&peer, &x, 100).await;
        let ratio = server.debt_ratio(&peer).await;
        assert!(ratio >= last);
        last = ratio;
    }
    for _ in 0..3 {
        server.record_received(&peer, &x, 70, true).await;
        let ratio = server.debt_ratio(&peer).await;
        assert!(ratio <= last);
        last = ratio;
    }
    bs.stop().await.unwrap();
}

#[tokio::test]
async fn debt_ratio_halves_when_received_doubles() {
    let bs = bitswap(MemStore::default(), RecordingNetwork::default()).await;
    let p2 = PeerId::random();
    let x = block("x").cid;

    bs.server().record_sent(&p2, &x, 1000).await;
    bs.server().record_received(&p2, &x, 500, true).await;
    assert_eq!(bs.ledger_for_peer(&p2).await.value, 2.0);

    bs.server().record_received(&p2, &x, 500, true).await;
    assert_eq!(bs.ledger_for_peer(&p2).await.value, 1.0);
    bs.stop().await.unwrap();
}

#[tokio::test]
async fn sessions_are_isolated() {
    let bs = bitswap(MemStore::default(), RecordingNetwork::default()).await;
    let peer = PeerId::random();
    let (a, x) = (block("a"), block("x"));

    let s1 = bs.new_session().await;
    let s2 = bs.new_session().await;

    s1.want_blocks(&[a.cid]).await;
    s2.cancel_wants(&[a.cid]).await;
    assert_eq!(cids(&bs.wantlist().await), vec![a.cid]);

    s2.want_blocks(&[a.cid]).await;
    s1.cancel_wants(&[a.cid]).await;
    assert_eq!(cids(&bs.wantlist().await), vec![a.cid]);
    s2.cancel_wants(&[a.cid]).await;
    assert!(bs.wantlist().await.is_empty());

    // a block arriving satisfies every session at once
    s1.want_blocks(&[x.cid]).await;
    s2.want_blocks(&[x.cid]).await;
    bs.receive_message(&peer, &blocks(&[&x])).await.unwrap();
    assert!(bs.wantlist().await.is_empty());
    assert!(!bs.client().session_wants(s1.id(), &x.cid).await);
    assert!(!bs.client().session_wants(s2.id(), &x.cid).await);
    bs.stop().await.unwrap();
}

#[tokio::test]
async fn closing_a_session_drops_its_wants() {
    let network = RecordingNetwork::default();
    let bs = bitswap(MemStore::default(), network.clone()).await;
    let peer = PeerId::random();
    let (a, b) = (block("a"), block("b"));

    bs.peer_connected(&peer).await;
    let s1 = bs.new_session().await;
    let s2 = bs.new_session().await;
    s1.want_blocks(&[a.cid, b.cid]).await;
    s2.want_blocks(&[b.cid]).await;

    s1.close().await;
    assert_eq!(cids(&bs.wantlist().await), vec![b.cid]);

    let cancels: Vec<_> = network
        .sent_to(&peer)
        .iter()
        .flat_map(|msg| msg.wantlist().filter(|e| e.cancel).map(|e| e.cid).collect::<Vec<_>>())
        .collect();
    assert_eq!(cancels, vec![a.cid]);
    bs.stop().await.unwrap();
}

#[tokio::test]
async fn obligations_follow_priority_and_availability() {
    let (a, b, c) = (block("a"), block("b"), block("c"));
    let store = MemStore::with(&[&a, &c]);
    let bs = bitswap(store.clone(), RecordingNetwork::default()).await;
    let p1 = PeerId::random();

    bs.peer_connected(&p1).await;
    bs.receive_message(&p1, &wants(&[(&a, 3), (&b, 1), (&c, 2)]))
        .await
        .unwrap();

    let obligations = bs.server().obligations_for_peer(&p1).await;
    let order: Vec<_> = obligations.iter().map(|o| (o.cid, o.priority)).collect();
    assert_eq!(order, vec![(a.cid, 3), (c.cid, 2)]);

    // b is still wanted, just not available yet
    let wanted = cids(&bs.wantlist_for_peer(&p1).await);
    assert_eq!(wanted, vec![a.cid, c.cid, b.cid]);

    store.put(b.clone()).await.unwrap();
    bs.notify_new_blocks(&[b.clone()]).await;
    let order: Vec<_> = bs
        .server()
        .obligations_for_peer(&p1)
        .await
        .iter()
        .map(|o| o.cid)
        .collect();
    assert_eq!(order, vec![a.cid, c.cid, b.cid]);
    bs.stop().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn sent_blocks_are_accounted() {
    let a = block("hello world");
    let network = RecordingNetwork::default();
    let bs = bitswap(MemStore::with(&[&a]), network.clone()).await;
    let peer = PeerId::random();

    bs.peer_connected(&peer).await;
    bs.receive_message(&peer, &wants(&[(&a, 1)])).await.unwrap();

    let sent_to = bs.server().send_next(3).await.unwrap();
    assert_eq!(sent_to, Some(peer));

    let sent = network.sent_to(&peer);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].blocks().map(|b| b.cid).collect::<Vec<_>>(), vec![a.cid]);

    let receipt = bs.ledger_for_peer(&peer).await;
    assert_eq!(receipt.sent, a.len() as u64);
    assert_eq!(receipt.exchanged, 1);

    let stat = bs.stat().await;
    assert_eq!(stat.blocks_sent, 1);
    assert_eq!(stat.data_sent, a.len() as u64);
    assert!(bs.wantlist_for_peer(&peer).await.is_empty());
    assert!(bs.server().obligations_for_peer(&peer).await.is_empty());
    bs.stop().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn failed_sends_are_requeued_until_the_budget_runs_out() {
    let a = block("a");
    let bs = bitswap(MemStore::with(&[&a]), FailingNetwork).await;
    let peer = PeerId::random();

    bs.peer_connected(&peer).await;
    bs.receive_message(&peer, &wants(&[(&a, 7)])).await.unwrap();

    let err = bs.server().send_next(2).await.unwrap_err();
    assert!(format!("{:#}", err).contains("connection reset"));

    // back in the queue at the same priority
    let obligations = bs.server().obligations_for_peer(&peer).await;
    assert_eq!(obligations.len(), 1);
    assert_eq!(obligations[0].cid, a.cid);
    assert_eq!(obligations[0].priority, 7);

    assert!(bs.server().send_next(2).await.is_err());
    assert!(bs.server().obligations_for_peer(&peer).await.is_empty());
    assert!(bs.wantlist_for_peer(&peer).await.is_empty());

    let receipt = bs.ledger_for_peer(&peer).await;
    assert_eq!(receipt.sent, 0);
    assert_eq!(receipt.exchanged, 0);
    assert_eq!(bs.stat().await.blocks_sent, 0);
    bs.stop().await.unwrap();
}

#[tokio::test]
async fn reconnect_keeps_the_ledger() {
    let bs = bitswap(MemStore::default(), RecordingNetwork::default()).await;
    let peer = PeerId::random();
    let x = block("x").cid;

    bs.peer_connected(&peer).await;
    bs.server().record_sent(&peer, &x, 100).await;
    assert_eq!(bs.stat().await.peers, vec![peer]);

    bs.peer_disconnected(&peer).await;
    assert!(bs.stat().await.peers.is_empty());
    assert_eq!(bs.server().sweep_ledgers().await, 0);

    bs.peer_connected(&peer).await;
    let receipt = bs.ledger_for_peer(&peer).await;
    assert_eq!(receipt.sent, 100);
    assert_eq!(receipt.value, 100.0);
    bs.stop().await.unwrap();
}

#[tokio::test]
async fn wants_skip_peers_without_the_block() {
    let network = RecordingNetwork::default();
    let bs = bitswap(MemStore::default(), network.clone()).await;
    let peer = PeerId::random();
    let a = block("a");

    bs.peer_connected(&peer).await;
    let session = bs.new_session().await;
    session.want_blocks(&[a.cid]).await;
    assert_eq!(network.sent_to(&peer).len(), 1);

    let mut msg = BitswapMessage::new(false);
    msg.add_dont_have(a.cid);
    bs.receive_message(&peer, &msg).await.unwrap();
    assert!(bs.client().peer_does_not_have_block(&peer, &a.cid).await);

    // a priority bump is not announced to a peer that does not have the block
    session.want_blocks_with_priority(&[a.cid], 9).await;
    assert_eq!(network.sent_to(&peer).len(), 1);
    bs.stop().await.unwrap();
}

#[tokio::test]
async fn new_peers_receive_the_full_wantlist() {
    let network = RecordingNetwork::default();
    let bs = bitswap(MemStore::default(), network.clone()).await;
    let (a, b) = (block("a"), block("b"));

    let session = bs.new_session().await;
    session.want_blocks_with_priority(&[a.cid], 1).await;
    session.want_blocks_with_priority(&[b.cid], 5).await;

    let peer = PeerId::random();
    bs.peer_connected(&peer).await;

    let sent = network.sent_to(&peer);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].full());
    let entries: Vec<_> = sent[0].wantlist().map(|e| (e.cid, e.priority)).collect();
    assert_eq!(entries, vec![(b.cid, 5), (a.cid, 1)]);
    bs.stop().await.unwrap();
}

#[tokio::test]
async fn reprovide_errors_pass_through() {
    let bs = Bitswap::builder(PeerId::random(), MemStore::default(), RecordingNetwork::default())
        .config(test_config())
        .reprovider(Arc::new(OfflineReprovider))
        .build()
        .await;
    let err = bs
        .trigger_reprovide(CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "routing offline");
    bs.stop().await.unwrap();

    let bs = bitswap(MemStore::default(), RecordingNetwork::default()).await;
    assert!(bs.trigger_reprovide(CancellationToken::new()).await.is_err());
    bs.stop().await.unwrap();
}

/// A fixed exchange, standing in for the real engine behind the capability trait.
#[derive(Debug, Default)]
struct StaticExchange {
    stat: Stat,
}

#[async_trait]
impl Exchange for StaticExchange {
    async fn wantlist(&self) -> Vec<WantlistEntry> {
        Vec::new()
    }

    async fn wantlist_for_peer(&self, _peer: &PeerId) -> Vec<WantlistEntry> {
        Vec::new()
    }

    async fn cancel_wants(&self, _keys: &[Cid], _session: SessionId) {}

    async fn cancel_wants_for_all_sessions(&self, _keys: &[Cid]) {}

    async fn stat(&self) -> Stat {
        self.stat.clone()
    }

    async fn ledger_for_peer(&self, peer: &PeerId) -> Receipt {
        Receipt::empty(*peer)
    }

    async fn trigger_reprovide(&self, _cancel: CancellationToken) -> Result<()> {
        Ok(())
    }
}

async fn blocks_received(exchange: &dyn Exchange) -> u64 {
    exchange.stat().await.blocks_received
}

#[tokio::test]
async fn exchange_is_usable_as_a_trait_object() {
    let fake = StaticExchange {
        stat: Stat {
            blocks_received: 42,
            ..Default::default()
        },
    };
    assert_eq!(blocks_received(&fake).await, 42);

    let bs = bitswap(MemStore::default(), RecordingNetwork::default()).await;
    assert_eq!(blocks_received(&bs).await, 0);
    let peer = PeerId::random();
    assert_eq!(bs.ledger_for_peer(&peer).await, Receipt::empty(peer));
    // our own wantlist is reported for our own peer id
    assert_eq!(bs.wantlist_for_peer(bs.self_id()).await, bs.wantlist().await);
    bs.stop().await.unwrap();
}

#[tokio::test]
async fn dropped_sessions_are_swept() {
    let network = RecordingNetwork::default();
    let bs = bitswap(MemStore::default(), network.clone()).await;
    let peer = PeerId::random();
    let (a, b) = (block("a"), block("b"));
    bs.peer_connected(&peer).await;

    let kept = bs.new_session().await;
    kept.want_blocks(&[b.cid]).await;
    {
        let dropped = bs.new_session().await;
        dropped.want_blocks(&[a.cid, b.cid]).await;
    }
    assert_eq!(bs.wantlist().await.len(), 2);

    assert_eq!(bs.client().sweep().await, 1);
    assert_eq!(cids(&bs.wantlist().await), vec![b.cid]);
    assert!(bs.client().session_wants(kept.id(), &b.cid).await);
    assert_eq!(bs.client().sweep().await, 0);

    let cancels: Vec<_> = network
        .sent_to(&peer)
        .iter()
        .flat_map(|msg| msg.wantlist().filter(|e| e.cancel).map(|e| e.cid).collect::<Vec<_>>())
        .collect();
    assert_eq!(cancels, vec![a.cid]);

    drop(kept);
    assert_eq!(bs.client().sweep().await, 1);
    assert!(bs.wantlist().await.is_empty());
    bs.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_receives_of_a_wanted_block_count_once() {
    let x = block("raced");
    let bs = bitswap(MemStore::with_has_barrier(2), RecordingNetwork::default()).await;
    let (p1, p2) = (PeerId::random(), PeerId::random());

    let session = bs.new_session().await;
    session.want_blocks(&[x.cid]).await;

    let msg = blocks(&[&x]);
    let (r1, r2) = tokio::join!(bs.receive_message(&p1, &msg), bs.receive_message(&p2, &msg));
    r1.unwrap();
    r2.unwrap();

    let stat = bs.stat().await;
    assert_eq!(stat.blocks_received, 1);
    assert_eq!(stat.data_received, x.len() as u64);
    assert_eq!(stat.dup_blks_received, 1);
    assert!(stat.wantlist.is_empty());

    let exchanged = bs.ledger_for_peer(&p1).await.exchanged + bs.ledger_for_peer(&p2).await.exchanged;
    assert_eq!(exchanged, 1);
    bs.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_racing_a_block_resolves_to_one_outcome() {
    let bs = bitswap(MemStore::default(), RecordingNetwork::default()).await;
    let peer = PeerId::random();
    let session = bs.new_session().await;

    let rounds = 32;
    for i in 0..rounds {
        let x = block(&format!("round {i}"));
        session.want_blocks(&[x.cid]).await;
        let msg = blocks(&[&x]);
        let cancel = [x.cid];
        let (received, ()) =
            tokio::join!(bs.receive_message(&peer, &msg), session.cancel_wants(&cancel));
        received.unwrap();
        assert!(bs.wantlist().await.is_empty());
    }

    // every block landed in exactly one of the two buckets
    let stat = bs.stat().await;
    assert_eq!(stat.blocks_received + stat.dup_blks_received, rounds);
    assert_eq!(bs.ledger_for_peer(&peer).await.exchanged, stat.blocks_received);
    bs.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ledger_updates_are_not_lost() {
    let bs = bitswap(MemStore::default(), RecordingNetwork::default()).await;
    let peer = PeerId::random();
    let x = block("x").cid;
    bs.peer_connected(&peer).await;

    let mut handles = Vec::new();
    for _ in 0..50 {
        let sender = bs.clone();
        handles.push(tokio::spawn(async move {
            sender.server().record_sent(&peer, &x, 4).await;
        }));
        let receiver = bs.clone();
        handles.push(tokio::spawn(async move {
            receiver.server().record_received(&peer, &x, 2, true).await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let receipt = bs.ledger_for_peer(&peer).await;
    assert_eq!(receipt.sent, 200);
    assert_eq!(receipt.recv, 100);
    assert_eq!(receipt.exchanged, 100);
    assert_eq!(receipt.value, 2.0);
    bs.stop().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn store_failure_keeps_the_want_and_the_rest_of_the_message() {
    let store = MemStore::default();
    let bs = bitswap(store.clone(), RecordingNetwork::default()).await;
    let peer = PeerId::random();
    let (a, b, c, d) = (block("a"), block("b"), block("c"), block("d"));
    store.break_put(b.cid);
    store.blocks.write().unwrap().insert(d.cid, d.clone());

    let session = bs.new_session().await;
    session.want_blocks(&[a.cid, b.cid, c.cid]).await;

    let mut msg = blocks(&[&a, &b, &c]);
    msg.add_entry(d.cid, 1, WantType::Block, false);
    assert!(bs.receive_message(&peer, &msg).await.is_err());

    // the failed block is still wanted, the others are stored
    assert_eq!(cids(&bs.wantlist().await), vec![b.cid]);
    assert!(bs.client().session_wants(session.id(), &b.cid).await);
    assert!(store.contains(&a.cid));
    assert!(store.contains(&c.cid));
    assert!(!store.contains(&b.cid));

    let stat = bs.stat().await;
    assert_eq!(stat.blocks_received, 2);
    assert_eq!(stat.dup_blks_received, 0);
    assert_eq!(bs.ledger_for_peer(&peer).await.exchanged, 2);

    // the wantlist part of the message was still handled
    assert_eq!(cids(&bs.wantlist_for_peer(&peer).await), vec![d.cid]);

    // a retry succeeds once the store recovers
    store.broken.write().unwrap().clear();
    bs.receive_message(&peer, &blocks(&[&b])).await.unwrap();
    assert!(bs.wantlist().await.is_empty());
    assert_eq!(bs.stat().await.blocks_received, 3);
    bs.stop().await.unwrap();
}
