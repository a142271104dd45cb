//! Want tracking and a reciprocity driven decision engine for a bitswap style block exchange.
//!
//! The [`Bitswap`] facade combines the want side ([`client::Client`]) with the serving side
//! ([`server::Server`]). Transport, block storage and content routing are collaborators,
//! plugged in through the [`Network`], [`Store`], [`Provider`] and [`Reprovider`] traits.

use std::fmt::Debug;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use cid::Cid;
use iroh_metrics::inc;
use libp2p::PeerId;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use self::client::{session::Session, Client};
use self::server::Server;
use self::stat::StatAggregator;

mod block;
pub mod client;
pub mod config;
mod error;
mod message;
pub mod metrics;
mod network;
pub mod peer_task_queue;
mod routing;
pub mod server;
mod stat;

pub use self::block::Block;
pub use self::client::session::SessionId;
pub use self::client::wantlist::Entry as WantlistEntry;
pub use self::config::Config;
pub use self::error::Error;
pub use self::message::{BitswapMessage, BlockPresence, BlockPresenceType, Entry, Priority, WantType};
pub use self::network::Network;
pub use self::routing::{Provider, Reprovider};
pub use self::server::{
    DebtRatioPolicy, Obligation, ObligationKind, PeerBlockRequestFilter, Receipt,
    ReciprocityPolicy,
};
pub use self::stat::Stat;

/// Local block storage.
///
/// Absence is reported as `Ok(None)` / `Ok(false)`, errors are reserved for storage failures.
#[async_trait]
pub trait Store: Debug + Clone + Send + Sync + 'static {
    async fn get_size(&self, cid: &Cid) -> Result<Option<usize>>;
    async fn get(&self, cid: &Cid) -> Result<Option<Block>>;
    async fn has(&self, cid: &Cid) -> Result<bool>;
    async fn put(&self, block: Block) -> Result<()>;
}

/// The programmatic surface of the exchange used by operators and tooling.
///
/// [`Bitswap`] is the production implementation, tests can provide their own.
#[async_trait]
pub trait Exchange: Debug + Send + Sync {
    /// The local wantlist, highest priority first.
    async fn wantlist(&self) -> Vec<WantlistEntry>;

    /// What `peer` is known to want from us, highest priority first.
    async fn wantlist_for_peer(&self, peer: &PeerId) -> Vec<WantlistEntry>;

    /// Cancels the wants of a single session.
    async fn cancel_wants(&self, keys: &[Cid], session: SessionId);

    /// Cancels the given keys no matter which session wants them.
    ///
    /// This is an administrative operation, ordinary requesters should close their sessions.
    async fn cancel_wants_for_all_sessions(&self, keys: &[Cid]);

    /// Counters and current state, see [`Stat`] for how consistent the snapshot is.
    async fn stat(&self) -> Stat;

    /// Ledger snapshot for `peer`; unknown peers get an empty receipt.
    async fn ledger_for_peer(&self, peer: &PeerId) -> Receipt;

    /// Asks the routing layer to re-announce everything we hold.
    ///
    /// Errors from the reprovider are returned as is.
    async fn trigger_reprovide(&self, cancel: CancellationToken) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct Bitswap<S: Store> {
    self_id: PeerId,
    client: Client<S>,
    server: Server<S>,
    stats: Arc<StatAggregator>,
    reprovider: Option<Arc<dyn Reprovider>>,
}

/// Builder for [`Bitswap`].
pub struct BitswapBuilder<S: Store> {
    self_id: PeerId,
    store: S,
    network: Arc<dyn Network>,
    config: Config,
    provider: Option<Arc<dyn Provider>>,
    reprovider: Option<Arc<dyn Reprovider>>,
    policy: Option<Arc<dyn ReciprocityPolicy>>,
    peer_block_request_filter: Option<Arc<dyn PeerBlockRequestFilter>>,
}

impl<S: Store> Debug for BitswapBuilder<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitswapBuilder")
            .field("self_id", &self.self_id)
            .field("store", &self.store)
            .field("network", &self.network)
            .field("config", &self.config)
            .field("provider", &self.provider)
            .field("reprovider", &self.reprovider)
            .field("policy", &self.policy)
            .field(
                "peer_block_request_filter",
                &self
                    .peer_block_request_filter
                    .as_ref()
                    .map(|_| "Arc<dyn PeerBlockRequestFilter>"),
            )
            .finish()
    }
}

impl<S: Store> BitswapBuilder<S> {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Announces newly stored blocks through `provider`.
    pub fn provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn reprovider(mut self, reprovider: Arc<dyn Reprovider>) -> Self {
        self.reprovider = Some(reprovider);
        self
    }

    /// Replaces the default [`DebtRatioPolicy`].
    pub fn policy(mut self, policy: Arc<dyn ReciprocityPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Only wants for which `filter` returns true are served.
    pub fn peer_block_request_filter<F: PeerBlockRequestFilter>(mut self, filter: F) -> Self {
        self.peer_block_request_filter = Some(Arc::new(filter));
        self
    }

    pub async fn build(self) -> Bitswap<S> {
        let BitswapBuilder {
            self_id,
            store,
            network,
            config,
            provider,
            reprovider,
            policy,
            peer_block_request_filter,
        } = self;

        let policy = policy.unwrap_or_else(|| {
            Arc::new(DebtRatioPolicy {
                threshold: config.server.debt_ratio_threshold,
            })
        });
        let stats = Arc::new(StatAggregator::default());

        let server = Server::new(
            network.clone(),
            store.clone(),
            stats.clone(),
            config.server,
            policy,
            peer_block_request_filter,
            provider,
        )
        .await;
        let client = Client::new(network, store, stats.clone(), config.client).await;

        Bitswap {
            self_id,
            client,
            server,
            stats,
            reprovider,
        }
    }
}

impl<S: Store> Bitswap<S> {
    pub fn builder<N: Network>(self_id: PeerId, store: S, network: N) -> BitswapBuilder<S> {
        BitswapBuilder {
            self_id,
            store,
            network: Arc::new(network),
            config: Config::default(),
            provider: None,
            reprovider: None,
            policy: None,
            peer_block_request_filter: None,
        }
    }

    pub fn self_id(&self) -> &PeerId {
        &self.self_id
    }

    pub fn server(&self) -> &Server<S> {
        &self.server
    }

    pub fn client(&self) -> &Client<S> {
        &self.client
    }

    /// Creates a new session; wants issued through it are cancelled together when it closes.
    pub async fn new_session(&self) -> Session<S> {
        self.client.new_session().await
    }

    /// Handles a message received from `peer`.
    ///
    /// Presences and blocks are processed before the wantlist, so a peer that sends a block
    /// together with a want for it is served from the freshly stored block.
    ///
    /// Store failures are reported after the whole message was processed; blocks stored
    /// before and after a failure are still accounted.
    pub async fn receive_message(&self, peer: &PeerId, message: &BitswapMessage) -> Result<()> {
        self.stats.record_message_received().await;
        inc!(metrics::Metrics, messages_received);

        let haves: Vec<Cid> = message.haves().copied().collect();
        let dont_haves: Vec<Cid> = message.dont_haves().copied().collect();
        if !haves.is_empty() || !dont_haves.is_empty() {
            self.client
                .receive_presences(peer, &haves, &dont_haves)
                .await;
        }

        let mut failed = Vec::new();
        if message.blocks_len() > 0 {
            let blocks: Vec<Block> = message.blocks().cloned().collect();
            let outcome = self.client.receive_blocks(peer, &blocks).await;
            failed = outcome.failed;
            self.server.received_blocks(peer, &outcome.received).await;

            let newly_stored: Vec<Block> = outcome
                .received
                .into_iter()
                .filter(|r| r.newly_stored)
                .map(|r| r.block)
                .collect();
            self.server.notify_new_blocks(&newly_stored).await;
        }

        if message.wantlist().next().is_some() || message.full() {
            self.server.receive_message(peer, message).await;
        }

        let failed_count = failed.len();
        match failed.into_iter().next() {
            Some((cid, err)) => Err(err.context(format!(
                "failed to receive {} of {} blocks from {}, first {}",
                failed_count,
                message.blocks_len(),
                peer,
                cid
            ))),
            None => Ok(()),
        }
    }

    /// Announces blocks that were added to the store locally.
    pub async fn notify_new_blocks(&self, blocks: &[Block]) {
        self.client.notify_new_blocks(blocks).await;
        self.server.notify_new_blocks(blocks).await;
    }

    pub async fn peer_connected(&self, peer: &PeerId) {
        self.server.peer_connected(peer).await;
        self.client.peer_connected(peer).await;
    }

    pub async fn peer_disconnected(&self, peer: &PeerId) {
        self.client.peer_disconnected(peer).await;
        self.server.peer_disconnected(peer).await;
    }

    /// Stops all background workers.
    pub async fn stop(&self) -> Result<()> {
        self.client.stop().await?;
        self.server.stop().await?;
        Ok(())
    }
}

#[async_trait]
impl<S: Store> Exchange for Bitswap<S> {
    async fn wantlist(&self) -> Vec<WantlistEntry> {
        self.client.get_wantlist().await
    }

    async fn wantlist_for_peer(&self, peer: &PeerId) -> Vec<WantlistEntry> {
        if peer == &self.self_id {
            return self.client.get_wantlist().await;
        }
        self.server.wantlist_for_peer(peer).await
    }

    async fn cancel_wants(&self, keys: &[Cid], session: SessionId) {
        self.client.cancel_wants(keys, session).await
    }

    async fn cancel_wants_for_all_sessions(&self, keys: &[Cid]) {
        self.client.cancel_wants_for_all_sessions(keys).await
    }

    async fn stat(&self) -> Stat {
        let counters = self.stats.counters().await;
        let wantlist = self
            .client
            .get_wantlist()
            .await
            .into_iter()
            .map(|e| e.cid)
            .collect();
        let peers = self.server.peers().await;

        Stat {
            provide_buf_len: self.server.provide_buf_len(),
            blocks_received: counters.blocks_received,
            blocks_sent: counters.blocks_sent,
            data_received: counters.data_received,
            data_sent: counters.data_sent,
            dup_blks_received: counters.dup_blks_received,
            dup_data_received: counters.dup_data_received,
            messages_received: counters.messages_received,
            wantlist,
            peers,
        }
    }

    async fn ledger_for_peer(&self, peer: &PeerId) -> Receipt {
        self.server.ledger_for_peer(peer).await
    }

    async fn trigger_reprovide(&self, cancel: CancellationToken) -> Result<()> {
        let reprovider = self
            .reprovider
            .as_ref()
            .ok_or_else(|| anyhow!("no reprovider configured"))?;
        inc!(metrics::Metrics, reprovide_triggered);
        debug!("triggering reprovide");
        reprovider.trigger(cancel).await
    }
}

/// Parses a cid given by an operator.
pub fn parse_cid(input: &str) -> Result<Cid, Error> {
    Ok(Cid::try_from(input)?)
}

/// Parses a peer id given by an operator.
pub fn parse_peer_id(input: &str) -> Result<PeerId, Error> {
    input.parse().map_err(|err: libp2p::identity::ParseError| Error::PeerId {
        input: input.to_string(),
        reason: err.to_string(),
    })
}
