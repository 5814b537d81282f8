//! Fan-out of one message to every registered peer but the sender.
//!
//! The engine takes a snapshot of the registry, releases the lock, and only
//! then sends. A recipient whose send fails is deregistered and closed; the
//! rest of the batch is still attempted and the sender never sees the error.

use std::io;

use tracing::{debug, warn};

use crate::registry::{AsyncRegistry, PeerId, Registry};

/// Sending side of a registered connection.
///
/// Clones refer to the same underlying connection.
pub trait Outbox: Clone + Send + Sync + 'static {
    /// Sends one already-rendered unit of text.
    fn deliver(&self, text: &str) -> io::Result<()>;

    /// Releases the connection after a failed delivery. Errors are swallowed.
    fn close(&self) {}
}

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: Vec<PeerId>,
    pub failed: Vec<PeerId>,
}

impl Delivery {
    pub fn recipients(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }

    /// True when nobody besides the sender was registered.
    pub fn had_no_recipients(&self) -> bool {
        self.recipients() == 0
    }
}

/// Sends `text` to each recipient independently.
pub fn deliver_all<H: Outbox>(recipients: &[(PeerId, H)], text: &str) -> Delivery {
    let mut delivery = Delivery::default();
    for (id, outbox) in recipients {
        match outbox.deliver(text) {
            Ok(()) => delivery.delivered.push(*id),
            Err(err) => {
                warn!(peer = %id, error = ?err, "delivery failed; dropping recipient");
                delivery.failed.push(*id);
            }
        }
    }
    delivery
}

/// Broadcast for the thread-per-connection relay.
pub fn broadcast<H: Outbox>(registry: &Registry<H>, text: &str, excluding: Option<PeerId>) -> Delivery {
    let recipients = registry.snapshot(excluding);
    let delivery = deliver_all(&recipients, text);
    for id in &delivery.failed {
        if let Some(outbox) = registry.deregister(*id) {
            outbox.close();
        }
    }
    debug!(
        delivered = delivery.delivered.len(),
        failed = delivery.failed.len(),
        "broadcast finished"
    );
    delivery
}

/// Broadcast for the cooperative chat server.
pub async fn broadcast_async<H: Outbox>(
    registry: &AsyncRegistry<H>,
    text: &str,
    excluding: Option<PeerId>,
) -> Delivery {
    let recipients = registry.snapshot(excluding).await;
    let delivery = deliver_all(&recipients, text);
    for id in &delivery.failed {
        if let Some(outbox) = registry.deregister(*id).await {
            outbox.close();
        }
    }
    debug!(
        delivered = delivery.delivered.len(),
        failed = delivery.failed.len(),
        "broadcast finished"
    );
    delivery
}
