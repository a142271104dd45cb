use std::fmt::Debug;

use anyhow::Result;
use async_trait::async_trait;
use libp2p::PeerId;

use crate::message::BitswapMessage;

/// Outbound side of the transport.
///
/// Delivers want announcements, cancels and block envelopes to a single peer.
/// Implementations must not retry internally, a failed send is reported back
/// to the caller which owns the retry policy.
#[async_trait]
pub trait Network: Debug + Send + Sync + 'static {
    async fn send_message(&self, peer: PeerId, message: BitswapMessage) -> Result<()>;
}
