use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event; a closed channel is logged and otherwise ignored.
    pub async fn send_or_log(&self, event: Event) {
        let name = event.name();
        if let Err(e) = self.send(event).await {
            warn!(event = name, error = %e, "dropping domain event");
        }
    }
}

/// Domain events raised by the basket, checkout, refund and screening services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    BasketFrozen(i32),
    BasketThawed(i32),
    BasketMerged {
        basket_id: i32,
        merged_basket_ids: Vec<i32>,
    },

    PaymentAccepted {
        basket_id: i32,
        processor: String,
        transaction_id: Option<String>,
        amount: Decimal,
        currency: String,
    },
    PaymentRejected {
        basket_id: Option<i32>,
        processor: String,
        reason: String,
    },

    OrderPlaced {
        order_id: Uuid,
        order_number: String,
        basket_id: i32,
    },

    RefundCreated {
        refund_id: Uuid,
        order_number: String,
        total_credit: Decimal,
    },
    RefundApproved {
        refund_id: Uuid,
        order_number: String,
        amount: Decimal,
    },
    RefundDenied(Uuid),
    RefundFailed {
        refund_id: Uuid,
        reason: String,
    },

    SdnCheckFailed {
        basket_id: Option<i32>,
        username: Option<String>,
        hits: i64,
    },
}

impl Event {
    /// Stable event name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Event::BasketFrozen(_) => "basket_frozen",
            Event::BasketThawed(_) => "basket_thawed",
            Event::BasketMerged { .. } => "basket_merged",
            Event::PaymentAccepted { .. } => "payment_accepted",
            Event::PaymentRejected { .. } => "payment_rejected",
            Event::OrderPlaced { .. } => "order_placed",
            Event::RefundCreated { .. } => "refund_created",
            Event::RefundApproved { .. } => "refund_approved",
            Event::RefundDenied(_) => "refund_denied",
            Event::RefundFailed { .. } => "refund_failed",
            Event::SdnCheckFailed { .. } => "sdn_check_failed",
        }
    }
}

/// Creates a bounded event channel.
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender::new(tx), rx)
}

// Drains the channel, logging each event until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::PaymentRejected {
                basket_id,
                processor,
                reason,
            } => {
                warn!(?basket_id, %processor, %reason, "payment rejected");
            }
            Event::RefundFailed { refund_id, reason } => {
                error!(%refund_id, %reason, "refund failed; manual retry required");
            }
            Event::SdnCheckFailed {
                basket_id,
                username,
                hits,
            } => {
                warn!(?basket_id, ?username, hits, "purchaser matched a sanctions list");
            }
            Event::OrderPlaced {
                order_number,
                basket_id,
                ..
            } => {
                info!(%order_number, basket_id, "order placed");
            }
            other => {
                info!(event = other.name(), payload = ?other, "domain event");
            }
        }
    }

    warn!("Event processing loop has ended");
}
