// =============================================================================
// Event Queue — unbounded multi-producer FIFO feeding the single dispatcher
// =============================================================================
//
// Producers (live trade feeds, the snapshot scheduler) never block and are
// never refused while the dispatcher is alive. Depth is tracked with an
// atomic counter so the consumer can warn when the backlog grows past the
// configured threshold. No shedding is applied.
// =============================================================================

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::QueueClosed;
use crate::types::MarketEvent;

/// Create a connected sender/receiver pair.
pub fn event_queue(alert_threshold: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        EventSender {
            tx,
            depth: depth.clone(),
        },
        EventReceiver {
            rx,
            depth,
            alert_threshold,
            alerting: false,
        },
    )
}

/// Cloneable producer handle.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<MarketEvent>,
    depth: Arc<AtomicUsize>,
}

impl EventSender {
    /// Append an event. Fails only once the consumer has shut down.
    pub fn enqueue(&self, event: MarketEvent) -> Result<(), QueueClosed> {
        self.depth.fetch_add(1, Ordering::Relaxed);
        self.tx.send(event).map_err(|_| {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            QueueClosed
        })
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// What a bounded wait on the queue produced.
#[derive(Debug)]
pub enum Received {
    Event(MarketEvent),
    /// Nothing arrived within the wait.
    Idle,
    /// Every sender is gone and the queue is drained.
    Closed,
}

/// The single consumer handle.
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<MarketEvent>,
    depth: Arc<AtomicUsize>,
    alert_threshold: usize,
    /// Set while depth is above the threshold, so the warning fires once per
    /// excursion rather than once per event.
    alerting: bool,
}

impl EventReceiver {
    /// Wait up to `wait` for the next event.
    pub async fn recv_timeout(&mut self, wait: Duration) -> Received {
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(Some(event)) => {
                self.on_dequeued();
                Received::Event(event)
            }
            Ok(None) => Received::Closed,
            Err(_) => Received::Idle,
        }
    }

    /// Take an already-queued event without waiting.
    pub fn try_recv(&mut self) -> Option<MarketEvent> {
        let event = self.rx.try_recv().ok()?;
        self.on_dequeued();
        Some(event)
    }

    /// Refuse further events; queued ones can still be drained.
    pub fn close(&mut self) {
        self.rx.close();
    }

    fn on_dequeued(&mut self) {
        let remaining = self
            .depth
            .fetch_sub(1, Ordering::Relaxed)
            .saturating_sub(1);

        if remaining > self.alert_threshold {
            if !self.alerting {
                warn!(
                    depth = remaining,
                    threshold = self.alert_threshold,
                    "event queue depth above alert threshold"
                );
                self.alerting = true;
            }
        } else if self.alerting {
            info!(depth = remaining, "event queue depth back under threshold");
            self.alerting = false;
        }
    }

    #[cfg(test)]
    fn is_alerting(&self) -> bool {
        self.alerting
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
