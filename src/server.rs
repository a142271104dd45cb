//! The serving side of the exchange: turns the wants of other peers into block envelopes.

use std::{sync::Arc, time::Instant};

use anyhow::{Context, Result};
use cid::Cid;
use iroh_metrics::{inc, inc_by};
use libp2p::PeerId;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::decision::Engine as DecisionEngine;
pub use self::{
    decision::{Obligation, ObligationKind, PeerBlockRequestFilter},
    score_ledger::{DebtRatioPolicy, Receipt, ReciprocityPolicy},
};
use crate::{
    block::Block,
    client::{wantlist::Entry, ReceivedBlock},
    config::ServerConfig,
    message::BitswapMessage,
    metrics::Metrics,
    network::Network,
    routing::Provider,
    stat::StatAggregator,
    Store,
};

mod blockstore_manager;
mod decision;
mod ledger;
mod peer_ledger;
mod score_ledger;
mod task_merger;

#[derive(Debug, Clone)]
pub struct Server<S: Store> {
    inner: Arc<Inner<S>>,
}

#[derive(Debug)]
struct Inner<S: Store> {
    /// Decision engine for which who to send which blocks to.
    engine: DecisionEngine<S>,
    /// Provides interaction with the network.
    network: Arc<dyn Network>,
    /// Counters for various statistics.
    stats: Arc<StatAggregator>,
    /// Channel for newly added blocks, which are to be provided to the network.
    /// `None` when provide announcements are disabled.
    new_blocks: Option<mpsc::Sender<Cid>>,
    /// The size of the channel buffer to use.
    has_block_buffer_size: usize,
    closer: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: Store> Server<S> {
    pub async fn new(
        network: Arc<dyn Network>,
        store: S,
        stats: Arc<StatAggregator>,
        config: ServerConfig,
        policy: Arc<dyn ReciprocityPolicy>,
        peer_block_request_filter: Option<Arc<dyn PeerBlockRequestFilter>>,
        provider: Option<Arc<dyn Provider>>,
    ) -> Self {
        let engine = DecisionEngine::new(store, &config, policy, peer_block_request_filter);

        let provider = provider.filter(|_| config.provide_enabled);
        let (new_blocks, new_blocks_r) = match provider {
            Some(_) => {
                let (s, r) = mpsc::channel(config.has_block_buffer_size.max(1));
                (Some(s), Some(r))
            }
            None => (None, None),
        };

        let server = Server {
            inner: Arc::new(Inner {
                engine,
                network,
                stats,
                new_blocks,
                has_block_buffer_size: config.has_block_buffer_size,
                closer: CancellationToken::new(),
                workers: Default::default(),
            }),
        };

        let mut workers = Vec::with_capacity(config.task_worker_count + 2);

        // start up workers to handle requests from other nodes for the data on this node
        let retry_budget = config.send_retry_budget;
        for i in 0..config.task_worker_count {
            let server = server.clone();
            workers.push(tokio::task::spawn(async move {
                loop {
                    match server.send_next(retry_budget).await {
                        Ok(Some(_)) => {}
                        Ok(None) => break,
                        Err(err) => {
                            debug!("task worker {}: {:?}", i, err);
                        }
                    }
                }
                debug!("task worker {} shutting down", i);
            }));
        }

        let sweep_interval = config.ledger_sweep_interval;
        if !sweep_interval.is_zero() {
            let server = server.clone();
            workers.push(tokio::task::spawn(async move {
                let mut ticker = tokio::time::interval(sweep_interval);
                // the first tick completes immediately
                ticker.tick().await;
                loop {
                    tokio::select! {
                        biased;
                        _ = server.inner.closer.cancelled() => break,
                        _ = ticker.tick() => {
                            server.sweep_ledgers().await;
                        }
                    }
                }
            }));
        }

        if let (Some(provider), Some(mut new_blocks)) = (provider, new_blocks_r) {
            let closer = server.inner.closer.clone();
            workers.push(tokio::task::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = closer.cancelled() => break,
                        key = new_blocks.recv() => {
                            let Some(key) = key else {
                                break;
                            };
                            if let Err(err) = provider.provide(key).await {
                                warn!("failed to provide {}: {:?}", key, err);
                            }
                        }
                    }
                }
                debug!("provide worker shutting down");
            }));
        }

        server.inner.workers.lock().await.extend(workers);
        server
    }

    /// Stops all workers and waits for them to finish.
    pub async fn stop(&self) -> Result<()> {
        self.inner.closer.cancel();
        let workers: Vec<_> = self.inner.workers.lock().await.drain(..).collect();
        for worker in workers {
            worker.await.context("server worker panicked")?;
        }
        Ok(())
    }

    /// Builds the next envelope and hands it to the network.
    ///
    /// Obligations that failed to send `retry_budget` times are dropped instead of requeued.
    /// Returns the peer the envelope went to, or `None` once the server is stopped.
    pub async fn send_next(&self, retry_budget: u32) -> Result<Option<PeerId>> {
        let Some(envelope) = self.inner.engine.next_envelope(&self.inner.closer).await? else {
            return Ok(None);
        };
        let peer = envelope.peer;

        match self
            .inner
            .network
            .send_message(peer, envelope.message.clone())
            .await
        {
            Ok(()) => {
                let blocks = envelope.message.blocks_len() as u64;
                let bytes: u64 = envelope.message.blocks().map(|b| b.len() as u64).sum();
                self.inner.stats.record_sent(blocks, bytes).await;
                inc_by!(Metrics, blocks_sent, blocks);
                inc_by!(Metrics, block_bytes_sent, bytes);
                self.inner.engine.message_sent(&envelope).await;
                Ok(Some(peer))
            }
            Err(err) => {
                inc!(Metrics, send_errors);
                let dropped = self
                    .inner
                    .engine
                    .envelope_failed(envelope, retry_budget)
                    .await;
                if !dropped.is_empty() {
                    warn!(
                        "dropping {} obligations to {} after repeated send failures",
                        dropped.len(),
                        peer
                    );
                }
                Err(err.context(format!("failed to send message to {}", peer)))
            }
        }
    }

    /// Returns the aggregated data communication for the given peer.
    pub async fn ledger_for_peer(&self, peer: &PeerId) -> Receipt {
        self.inner.engine.ledger_for_peer(peer).await
    }

    pub async fn debt_ratio(&self, peer: &PeerId) -> f64 {
        self.inner.engine.debt_ratio(peer).await
    }

    /// Returns the currently known want list for the given peer.
    pub async fn wantlist_for_peer(&self, peer: &PeerId) -> Vec<Entry> {
        self.inner.engine.wantlist_for_peer(peer).await
    }

    /// The scheduled sends towards `peer`, in the order they will go out.
    pub async fn obligations_for_peer(&self, peer: &PeerId) -> Vec<Obligation> {
        self.inner.engine.obligations_for_peer(peer).await
    }

    /// Returns the number of blocks waiting to be announced.
    pub fn provide_buf_len(&self) -> usize {
        match self.inner.new_blocks {
            Some(ref s) => self.inner.has_block_buffer_size.max(1) - s.capacity(),
            None => 0,
        }
    }

    /// Returns a list of peers with whom the local node is connected.
    pub async fn peers(&self) -> Vec<PeerId> {
        self.inner.engine.peers().await
    }

    /// Announces the existence of blocks to this bitswap service.
    /// Potentially notifies peers waiting on them and queues them for providing.
    pub async fn notify_new_blocks(&self, blocks: &[Block]) {
        self.inner.engine.notify_new_blocks(blocks).await;

        if let Some(ref new_blocks) = self.inner.new_blocks {
            for block in blocks {
                if new_blocks.try_send(block.cid).is_err() {
                    debug!("provide buffer full, skipping {}", block.cid);
                    inc!(Metrics, provides_dropped);
                }
            }
        }
    }

    /// Handles the wantlist part of a message from `peer`.
    pub async fn receive_message(&self, peer: &PeerId, message: &BitswapMessage) {
        self.inner.engine.message_received(peer, message).await;
    }

    /// Notifies the decision engine that a peer sent us blocks, crediting it for the
    /// useful ones.
    pub async fn received_blocks(&self, from: &PeerId, blocks: &[ReceivedBlock]) {
        if blocks.is_empty() {
            return;
        }
        debug!("received {} blocks from {}", blocks.len(), from);
        for received in blocks {
            self.inner
                .engine
                .record_received(
                    from,
                    &received.block.cid,
                    received.block.len(),
                    received.useful,
                )
                .await;
        }
    }

    /// Accounts a transmission that happened outside of the send workers.
    pub async fn record_sent(&self, peer: &PeerId, cid: &Cid, len: usize) {
        self.inner.engine.record_sent(peer, cid, len).await;
    }

    /// Accounts a receive that happened outside of [`Server::received_blocks`].
    pub async fn record_received(&self, peer: &PeerId, cid: &Cid, len: usize, was_wanted: bool) {
        self.inner
            .engine
            .record_received(peer, cid, len, was_wanted)
            .await;
    }

    pub async fn peer_connected(&self, peer: &PeerId) {
        info!("peer connected: {}", peer);
        self.inner.engine.peer_connected(peer).await;
    }

    pub async fn peer_disconnected(&self, peer: &PeerId) {
        info!("peer disconnected: {}", peer);
        self.inner.engine.peer_disconnected(peer).await;
    }

    /// Releases the ledgers of peers gone for longer than the retention window.
    pub async fn sweep_ledgers(&self) -> usize {
        self.inner.engine.sweep_ledgers(Instant::now()).await
    }
}
