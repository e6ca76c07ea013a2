use crate::{
    entities::{
        order::{self, OrderStatus},
        order_line::{self, OrderLineStatus},
        payment_event::{self, PaymentEventType},
        payment_source,
        refund::{self, RefundStatus},
        refund_line::{self, RefundLineStatus},
        Order, OrderLine, PaymentSource, Refund, RefundLine,
    },
    db::is_unique_violation,
    errors::ServiceError,
    events::{Event, EventSender},
    payment::{CreditRequest, PaymentError, PaymentProcessorRegistry},
    services::orders::OrderService,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateRefundInput {
    #[validate(length(min = 1))]
    pub order_number: String,
    /// Order lines to refund; every refundable line when absent
    pub line_ids: Option<Vec<Uuid>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundWithLines {
    pub refund: refund::Model,
    pub lines: Vec<refund_line::Model>,
}

/// Refund pipeline: create, then approve (credit the processor) or deny.
#[derive(Clone)]
pub struct RefundService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    orders: OrderService,
    registry: Arc<PaymentProcessorRegistry>,
}

impl RefundService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        orders: OrderService,
        registry: Arc<PaymentProcessorRegistry>,
    ) -> Self {
        Self {
            db,
            event_sender,
            orders,
            registry,
        }
    }

    #[instrument(skip(self, input), fields(order_number = %input.order_number))]
    pub async fn create_refund(&self, input: CreateRefundInput) -> Result<RefundWithLines, ServiceError> {
        input.validate()?;
        let order = self.orders.get_by_number(&input.order_number).await?;
        let order_lines = OrderLine::find()
            .filter(order_line::Column::OrderId.eq(order.id))
            .all(&*self.db)
            .await?;

        let requested: Vec<order_line::Model> = match &input.line_ids {
            Some(ids) => {
                let known: HashSet<Uuid> = order_lines.iter().map(|l| l.id).collect();
                if let Some(stray) = ids.iter().find(|id| !known.contains(id)) {
                    return Err(ServiceError::InvalidInput(format!(
                        "Line {} does not belong to order {}",
                        stray, order.number
                    )));
                }
                order_lines
                    .into_iter()
                    .filter(|l| ids.contains(&l.id))
                    .collect()
            }
            None => order_lines,
        };

        // Coverage is read and claimed in one transaction; the partial unique index on
        // refund_lines(order_line_id) turns a concurrent claim into a constraint error
        let txn = self.db.begin().await?;
        let covered: HashSet<Uuid> = RefundLine::find()
            .filter(refund_line::Column::OrderLineId.is_in(requested.iter().map(|l| l.id)))
            .filter(refund_line::Column::Status.ne(RefundLineStatus::Denied))
            .all(&txn)
            .await?
            .into_iter()
            .map(|l| l.order_line_id)
            .collect();
        let refundable: Vec<_> = requested
            .into_iter()
            .filter(|l| !covered.contains(&l.id))
            .collect();
        if refundable.is_empty() {
            return Err(no_refundable_lines(&order.number));
        }

        let now = Utc::now();
        let total_credit: Decimal = refundable.iter().map(|l| l.line_price).sum();
        let refund = refund::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            owner: Set(order.owner.clone()),
            status: Set(RefundStatus::Open),
            total_credit: Set(total_credit),
            currency: Set(order.currency.clone()),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let mut lines = Vec::with_capacity(refundable.len());
        for line in &refundable {
            let saved = refund_line::ActiveModel {
                id: Set(Uuid::new_v4()),
                refund_id: Set(refund.id),
                order_line_id: Set(line.id),
                quantity: Set(line.quantity),
                line_credit: Set(line.line_price),
                status: Set(RefundLineStatus::Open),
            }
            .insert(&txn)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    warn!(order_line_id = %line.id, "line claimed by a concurrent refund");
                    no_refundable_lines(&order.number)
                } else {
                    e.into()
                }
            })?;
            lines.push(saved);
        }
        txn.commit().await?;

        info!(refund_id = %refund.id, %total_credit, "refund created");
        self.event_sender
            .send_or_log(Event::RefundCreated {
                refund_id: refund.id,
                order_number: order.number.clone(),
                total_credit,
            })
            .await;
        Ok(RefundWithLines { refund, lines })
    }

    pub async fn get_refund(&self, refund_id: Uuid) -> Result<RefundWithLines, ServiceError> {
        let refund = find_refund(&*self.db, refund_id).await?;
        let lines = RefundLine::find()
            .filter(refund_line::Column::RefundId.eq(refund_id))
            .all(&*self.db)
            .await?;
        Ok(RefundWithLines { refund, lines })
    }

    /// Credits the buyer and completes the refund.
    ///
    /// A processor failure leaves the refund in `PaymentRefundError`, from which
    /// approval can be retried.
    #[instrument(skip(self))]
    pub async fn approve(&self, refund_id: Uuid) -> Result<RefundWithLines, ServiceError> {
        let refund = find_refund(&*self.db, refund_id).await?;
        let order = Order::find_by_id(refund.order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", refund.order_id)))?;

        match refund.status {
            RefundStatus::Complete => return self.get_refund(refund_id).await,
            RefundStatus::Denied => {
                return Err(ServiceError::InvalidOperation(format!(
                    "Refund {} was denied",
                    refund_id
                )))
            }
            RefundStatus::PaymentRefundPending => {
                return Err(ServiceError::Conflict(format!(
                    "Refund {} is already being credited",
                    refund_id
                )))
            }
            RefundStatus::Open | RefundStatus::PaymentRefundError => {
                if refund.total_credit > Decimal::ZERO {
                    self.credit_source(&refund, &order).await?;
                } else {
                    set_status(&*self.db, &refund, RefundStatus::PaymentRefunded).await?;
                }
            }
            RefundStatus::PaymentRefunded => {}
        }

        self.complete(refund_id, &order).await?;
        info!(%refund_id, order_number = %order.number, "refund approved");
        self.event_sender
            .send_or_log(Event::RefundApproved {
                refund_id,
                order_number: order.number.clone(),
                amount: refund.total_credit,
            })
            .await;
        self.get_refund(refund_id).await
    }

    #[instrument(skip(self))]
    pub async fn deny(&self, refund_id: Uuid) -> Result<RefundWithLines, ServiceError> {
        let refund = find_refund(&*self.db, refund_id).await?;
        match refund.status {
            RefundStatus::Denied => return self.get_refund(refund_id).await,
            RefundStatus::Open => {}
            other => {
                return Err(ServiceError::InvalidOperation(format!(
                    "Refund {} is {:?} and can no longer be denied",
                    refund_id, other
                )))
            }
        }

        let txn = self.db.begin().await?;
        set_status(&txn, &refund, RefundStatus::Denied).await?;
        RefundLine::update_many()
            .set(refund_line::ActiveModel {
                status: Set(RefundLineStatus::Denied),
                ..Default::default()
            })
            .filter(refund_line::Column::RefundId.eq(refund_id))
            .exec(&txn)
            .await?;
        txn.commit().await?;

        info!(%refund_id, "refund denied");
        self.event_sender
            .send_or_log(Event::RefundDenied(refund_id))
            .await;
        self.get_refund(refund_id).await
    }

    async fn credit_source(&self, refund: &refund::Model, order: &order::Model) -> Result<(), ServiceError> {
        let source = PaymentSource::find()
            .filter(payment_source::Column::OrderId.eq(order.id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::InvalidOperation(format!("Order {} has no payment source", order.number))
            })?;

        let refunded = source.amount_refunded + refund.total_credit;
        if refunded > source.amount_debited {
            return Err(ServiceError::InvalidOperation(format!(
                "Refunding {} would exceed the {} debited for order {}",
                refund.total_credit, source.amount_debited, order.number
            )));
        }

        // Only the approval that wins this transition may contact the processor
        let refund = &set_status(&*self.db, refund, RefundStatus::PaymentRefundPending).await?;
        let credit = self.issue_credit(&source, refund, order).await;

        let refund_reference = match credit {
            Ok(reference) => reference,
            Err(e) => {
                error!(refund_id = %refund.id, error = %e, "processor refused credit");
                set_status(&*self.db, refund, RefundStatus::PaymentRefundError).await?;
                self.event_sender
                    .send_or_log(Event::RefundFailed {
                        refund_id: refund.id,
                        reason: e.to_string(),
                    })
                    .await;
                return Err(e.into());
            }
        };

        let txn = self.db.begin().await?;
        // Re-read inside the transaction so credits from other refunds are kept
        let current = PaymentSource::find_by_id(source.id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Payment source {} not found", source.id))
            })?;
        let amount_refunded = current.amount_refunded + refund.total_credit;
        let mut current: payment_source::ActiveModel = current.into();
        current.amount_refunded = Set(amount_refunded);
        current.update(&txn).await?;

        payment_event::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order.id),
            event_type: Set(PaymentEventType::Refunded),
            amount: Set(refund.total_credit),
            reference: Set(refund_reference.or(source.reference.clone())),
            processor_name: Set(source.source_type.clone()),
            created_at: Set(Utc::now()),
        }
        .insert(&txn)
        .await?;

        set_status(&txn, refund, RefundStatus::PaymentRefunded).await?;
        txn.commit().await?;
        Ok(())
    }

    async fn issue_credit(
        &self,
        source: &payment_source::Model,
        refund: &refund::Model,
        order: &order::Model,
    ) -> Result<Option<String>, PaymentError> {
        let processor = self.registry.configured(&source.source_type)?;
        // Sources without a processor transaction (invoices) cannot be credited
        let reference = source
            .reference
            .clone()
            .ok_or_else(|| PaymentError::RefundNotSupported(source.source_type.clone()))?;
        processor
            .issue_credit(&CreditRequest {
                order_number: order.number.clone(),
                reference,
                amount: refund.total_credit,
                currency: refund.currency.clone(),
            })
            .await
    }

    async fn complete(&self, refund_id: Uuid, order: &order::Model) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;
        let refund = find_refund(&txn, refund_id).await?;
        let lines = RefundLine::find()
            .filter(refund_line::Column::RefundId.eq(refund_id))
            .all(&txn)
            .await?;

        RefundLine::update_many()
            .set(refund_line::ActiveModel {
                status: Set(RefundLineStatus::Complete),
                ..Default::default()
            })
            .filter(refund_line::Column::RefundId.eq(refund_id))
            .exec(&txn)
            .await?;
        OrderLine::update_many()
            .set(order_line::ActiveModel {
                status: Set(OrderLineStatus::Refunded),
                ..Default::default()
            })
            .filter(order_line::Column::Id.is_in(lines.iter().map(|l| l.order_line_id)))
            .exec(&txn)
            .await?;

        let outstanding = OrderLine::find()
            .filter(order_line::Column::OrderId.eq(order.id))
            .filter(order_line::Column::Status.ne(OrderLineStatus::Refunded))
            .all(&txn)
            .await?;
        if outstanding.is_empty() {
            Order::update_many()
                .set(order::ActiveModel {
                    status: Set(OrderStatus::Refunded),
                    updated_at: Set(Utc::now()),
                    ..Default::default()
                })
                .filter(order::Column::Id.eq(order.id))
                .exec(&txn)
                .await?;
        }

        set_status(&txn, &refund, RefundStatus::Complete).await?;
        txn.commit().await?;
        Ok(())
    }
}

async fn find_refund<C: ConnectionTrait>(conn: &C, refund_id: Uuid) -> Result<refund::Model, ServiceError> {
    Refund::find_by_id(refund_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Refund {} not found", refund_id)))
}

/// Moves a refund along the pipeline; the row must still hold the status it was read with.
async fn set_status<C: ConnectionTrait>(
    conn: &C,
    refund: &refund::Model,
    to: RefundStatus,
) -> Result<refund::Model, ServiceError> {
    if !refund.status.can_transition_to(to) {
        return Err(ServiceError::InvalidOperation(format!(
            "Refund {} cannot move from {:?} to {:?}",
            refund.id, refund.status, to
        )));
    }
    let updated_at = Utc::now();
    let result = Refund::update_many()
        .set(refund::ActiveModel {
            status: Set(to),
            updated_at: Set(updated_at),
            ..Default::default()
        })
        .filter(refund::Column::Id.eq(refund.id))
        .filter(refund::Column::Status.eq(refund.status))
        .exec(conn)
        .await?;
    if result.rows_affected != 1 {
        warn!(refund_id = %refund.id, "refund changed concurrently");
        return Err(ServiceError::Conflict(format!(
            "Refund {} was modified concurrently",
            refund.id
        )));
    }
    Ok(refund::Model {
        status: to,
        updated_at,
        ..refund.clone()
    })
}

fn no_refundable_lines(order_number: &str) -> ServiceError {
    ServiceError::InvalidOperation(format!("Order {} has no refundable lines", order_number))
}
