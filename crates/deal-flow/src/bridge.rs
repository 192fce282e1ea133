//! Stream bridge: hands fragments from a blocking worker to the async
//! publisher loop over an unbounded channel.

use crate::state::{Applied, CancelFlag};
use deal_core::StageEmitter;
use std::time::Duration;
use tokio::sync::mpsc;

/// Values carried from the worker side to the publisher
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeItem {
    /// One text fragment
    Fragment(String),
    /// Progress milestone
    Progress {
        /// 0..=100
        percent: u8,
        /// Milestone description
        message: String,
    },
    /// Sentinel: the run is over and no more values follow
    Done(Applied),
}

/// Producer half. Cloned once for the worker and kept by the runner for the sentinel.
#[derive(Debug, Clone)]
pub struct BridgeSender {
    tx: mpsc::UnboundedSender<BridgeItem>,
    cancel: CancelFlag,
}

/// Consumer half, owned by the publisher loop
#[derive(Debug)]
pub struct BridgeReceiver {
    rx: mpsc::UnboundedReceiver<BridgeItem>,
}

/// Outcome of one receive-with-timeout
#[derive(Debug, PartialEq)]
pub enum Received {
    /// Next value in enqueue order
    Item(BridgeItem),
    /// Nothing arrived within the poll interval
    Idle,
    /// Every sender is gone
    Disconnected,
}

/// Create a bridge for one stage run
pub fn channel(cancel: CancelFlag) -> (BridgeSender, BridgeReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (BridgeSender { tx, cancel }, BridgeReceiver { rx })
}

impl BridgeSender {
    /// Enqueue the sentinel
    pub fn finish(&self, outcome: Applied) {
        // The publisher may already have stopped after a cancel.
        let _ = self.tx.send(BridgeItem::Done(outcome));
    }
}

impl StageEmitter for BridgeSender {
    fn emit(&self, fragment: String) {
        let _ = self.tx.send(BridgeItem::Fragment(fragment));
    }

    fn progress(&self, percent: u8, message: &str) {
        let _ = self.tx.send(BridgeItem::Progress {
            percent: percent.min(100),
            message: message.to_string(),
        });
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl BridgeReceiver {
    /// Wait up to `wait` for the next value
    pub async fn poll(&mut self, wait: Duration) -> Received {
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(Some(item)) => Received::Item(item),
            Ok(None) => Received::Disconnected,
            Err(_) => Received::Idle,
        }
    }
}
