//! Metrics for the exchange.

use iroh_metrics::core::{Core, Counter, Metric};
use struct_iterable::Iterable;

/// Counters tracked by the exchange.
#[derive(Debug, Clone, Iterable)]
#[allow(missing_docs)]
pub struct Metrics {
    pub wants_received: Counter,
    pub cancels_received: Counter,
    pub messages_received: Counter,
    pub blocks_sent: Counter,
    pub block_bytes_sent: Counter,
    pub blocks_received: Counter,
    pub block_bytes_received: Counter,
    pub dup_blocks_received: Counter,
    pub dup_bytes_received: Counter,
    pub send_errors: Counter,
    pub obligations_requeued: Counter,
    pub obligations_dropped: Counter,
    pub announce_errors: Counter,
    pub store_errors: Counter,
    pub sessions_created: Counter,
    pub sessions_destroyed: Counter,
    pub orphan_wants_swept: Counter,
    pub ledgers_swept: Counter,
    pub provides_dropped: Counter,
    pub reprovide_triggered: Counter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            wants_received: Counter::new("Number of want entries received from peers"),
            cancels_received: Counter::new("Number of cancel entries received from peers"),
            messages_received: Counter::new("Number of messages received from peers"),
            blocks_sent: Counter::new("Number of blocks sent to peers"),
            block_bytes_sent: Counter::new("Number of block bytes sent to peers"),
            blocks_received: Counter::new("Number of wanted blocks received"),
            block_bytes_received: Counter::new("Number of wanted block bytes received"),
            dup_blocks_received: Counter::new("Number of unwanted or already stored blocks received"),
            dup_bytes_received: Counter::new("Number of bytes in duplicate blocks received"),
            send_errors: Counter::new("Number of envelopes that failed to send"),
            obligations_requeued: Counter::new("Number of obligations returned to the queue"),
            obligations_dropped: Counter::new("Number of obligations dropped after the retry budget"),
            announce_errors: Counter::new("Number of want or cancel announcements that failed"),
            store_errors: Counter::new("Number of received blocks the store failed on"),
            sessions_created: Counter::new("Number of sessions created"),
            sessions_destroyed: Counter::new("Number of sessions destroyed"),
            orphan_wants_swept: Counter::new("Number of wants removed by the orphan sweep"),
            ledgers_swept: Counter::new("Number of disconnected ledgers released"),
            provides_dropped: Counter::new("Number of provide announcements dropped on a full buffer"),
            reprovide_triggered: Counter::new("Number of reprovide triggers"),
        }
    }
}

impl Metric for Metrics {
    fn name() -> &'static str {
        "exchange"
    }
}

/// Init the metrics collection core.
pub fn init_metrics() {
    Core::init(|reg, metrics| {
        metrics.insert(Metrics::new(reg));
    });
}
