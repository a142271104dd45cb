use std::fmt::Debug;

use anyhow::Result;
use async_trait::async_trait;
use cid::Cid;
use tokio_util::sync::CancellationToken;

/// Announces newly stored blocks to the content routing layer.
#[async_trait]
pub trait Provider: Debug + Send + Sync + 'static {
    async fn provide(&self, key: Cid) -> Result<()>;
}

/// Re-announces all locally held content.
///
/// Implemented by the routing layer; the exchange only forwards operator
/// requests and hands back whatever error comes out.
#[async_trait]
pub trait Reprovider: Debug + Send + Sync + 'static {
    async fn trigger(&self, cancel: CancellationToken) -> Result<()>;
}
