//! Event Relay
//!
//! Consumes frames handed off by the stream handler, decodes recognized
//! events and notifies the devices subscribed to the affected addresses.

pub mod receipt;

pub use receipt::*;

use crate::metrics::RelayMetrics;
use crate::notify::{DeliveryResult, NotificationDispatcher};
use crate::stream::StreamFrame;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Event name carrying a [`TransactionReceipt`]
pub const RECEIPT_EVENT: &str = "receipt";

/// Default capacity of the stream-to-relay channel
pub const RELAY_CHANNEL_CAPACITY: usize = 1024;

/// What happened to one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// Receipt decoded; one entry per attempted delivery
    Delivered(Vec<DeliveryResult>),
    Unrecognized(String),
    Undecodable(String),
}

/// Frame consumer driving the dispatcher
pub struct Relay {
    dispatcher: Arc<NotificationDispatcher>,
    metrics: Arc<RelayMetrics>,
}

impl Relay {
    pub fn new(dispatcher: Arc<NotificationDispatcher>, metrics: Arc<RelayMetrics>) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            metrics,
        })
    }

    /// Handle one frame end to end
    pub async fn handle_frame(&self, frame: StreamFrame) -> RelayOutcome {
        if frame.event != RECEIPT_EVENT {
            self.metrics.record_frame("unrecognized");
            debug!(event = %frame.event, "Ignoring unrecognized event");
            return RelayOutcome::Unrecognized(frame.event);
        }

        let receipt: TransactionReceipt = match frame.decode_data() {
            Ok(receipt) => receipt,
            Err(e) => {
                self.metrics.record_frame("undecodable");
                warn!(event = %frame.event, error = %e, "Dropping undecodable receipt");
                return RelayOutcome::Undecodable(e.to_string());
            }
        };
        self.metrics.record_frame(RECEIPT_EVENT);

        let mut results = Vec::new();
        for (party, address) in receipt.parties() {
            let message = receipt.message_for(party);
            let delivered = self.dispatcher.notify_address(address, &message).await;
            debug!(
                tx_id = %receipt.tx_id,
                party = party.as_str(),
                address = %address,
                devices = delivered.len(),
                "Receipt relayed"
            );
            results.extend(delivered);
        }
        RelayOutcome::Delivered(results)
    }

    /// Consume frames until the channel closes or `cancel` fires
    pub async fn run(self: Arc<Self>, mut frames: mpsc::Receiver<StreamFrame>, cancel: CancellationToken) {
        info!("Relay started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = frames.recv() => match frame {
                    Some(frame) => {
                        self.handle_frame(frame).await;
                    }
                    None => break,
                },
            }
        }
        info!("Relay stopped");
    }
}

/// Build a stream handler that hands frames to the relay channel
///
/// The handler never blocks; frames arriving while the channel is full are
/// dropped and counted as `overflow`.
pub fn frame_forwarder(
    sender: mpsc::Sender<StreamFrame>,
    metrics: Arc<RelayMetrics>,
) -> impl Fn(StreamFrame) + Send + Sync + 'static {
    move |frame| {
        if let Err(e) = sender.try_send(frame) {
            metrics.record_frame("overflow");
            let (event, reason) = match &e {
                mpsc::error::TrySendError::Full(f) => (f.event.clone(), "full"),
                mpsc::error::TrySendError::Closed(f) => (f.event.clone(), "closed"),
            };
            warn!(event = %event, reason = reason, "Relay channel rejected frame");
        }
    }
}
