//! Event system for ledger operations
//!
//! Services publish a [`LedgerEvent`] after a write has committed. Delivery
//! is best-effort: an event with no subscribers is dropped and never fails
//! the operation that produced it.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use crate::db::models::{ActorType, BatchStatus, EventType, PaymentMode, PaymentStatus, ProductStatus};

/// Ledger events emitted by services
#[derive(Debug, Clone)]
pub enum LedgerEvent {
    ActorRegistered {
        actor_id: String,
        actor_type: ActorType,
    },

    // Batch events
    BatchCreated {
        batch_id: String,
        farmer_id: String,
        herb_name: String,
    },
    BatchDeactivated {
        batch_id: String,
    },
    ChainEventAppended {
        batch_id: String,
        event_id: String,
        event_type: EventType,
    },

    // Payment events
    PaymentOpened {
        payment_id: String,
        batch_id: String,
        payment_mode: PaymentMode,
    },
    PaymentSettled {
        payment_id: String,
        batch_id: String,
        amount: i64,
    },
    PaymentStatusChanged {
        payment_id: String,
        status: PaymentStatus,
    },
    OwnershipTransferred {
        batch_id: String,
        new_owner_id: String,
        new_owner_type: ActorType,
        status: BatchStatus,
    },

    // Product events
    ProductCreated {
        product_id: String,
        industry_id: String,
        source_batches: usize,
    },
    ProductStatusChanged {
        product_id: String,
        status: ProductStatus,
    },
    ProductPackaged {
        product_id: String,
        batches: usize,
    },
    ProductScanned {
        product_id: String,
        total_scans: u64,
    },
}

/// Receives every ledger event published on the bus
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &LedgerEvent);
}

/// Event bus for broadcasting ledger events
pub struct EventBus {
    sender: broadcast::Sender<LedgerEvent>,
}

impl EventBus {
    /// Bus with room for 1024 undelivered events per subscriber
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to current subscribers; a bus with none drops the event
    pub fn emit(&self, event: LedgerEvent) {
        trace!(event = ?event, "Emitting ledger event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Audit trail listener
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &LedgerEvent) {
        match event {
            LedgerEvent::BatchCreated { batch_id, farmer_id, herb_name } => {
                info!(batch_id = %batch_id, farmer_id = %farmer_id, herb = %herb_name, "Batch created");
            }
            LedgerEvent::PaymentSettled { payment_id, batch_id, amount } => {
                info!(payment_id = %payment_id, batch_id = %batch_id, amount, "Payment settled");
            }
            LedgerEvent::OwnershipTransferred { batch_id, new_owner_id, new_owner_type, status } => {
                info!(
                    batch_id = %batch_id,
                    owner = %new_owner_id,
                    owner_type = %new_owner_type,
                    status = %status,
                    "Ownership transferred"
                );
            }
            LedgerEvent::ProductCreated { product_id, industry_id, source_batches } => {
                info!(
                    product_id = %product_id,
                    industry_id = %industry_id,
                    source_batches,
                    "Final product created"
                );
            }
            LedgerEvent::ChainEventAppended { batch_id, event_id, event_type } => {
                debug!(batch_id = %batch_id, event_id = %event_id, event_type = %event_type, "Chain event appended");
            }
            _ => {
                trace!(event = ?event, "Ledger event");
            }
        }
    }
}

/// Drive a [`LoggingEventListener`] from its own task until the bus closes
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}
