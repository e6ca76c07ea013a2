use crate::{
    config::AppConfig,
    entities::{
        basket::{self, BasketStatus},
        order::{self, OrderStatus},
        order_line::{self, OrderLineStatus},
        payment_event::{self, PaymentEventType},
        payment_source, Basket, Order, OrderLine, PaymentEvent, PaymentSource,
    },
    errors::ServiceError,
    payment::HandledProcessorResponse,
    services::baskets::BasketWithLines,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, QueryOrder,
    Set, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Derives order numbers from basket ids and back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderNumberGenerator {
    prefix: String,
    offset: i64,
}

impl OrderNumberGenerator {
    pub fn new(prefix: impl Into<String>, offset: i64) -> Self {
        Self {
            prefix: prefix.into(),
            offset,
        }
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::new(cfg.order_number_prefix.clone(), cfg.order_number_offset)
    }

    pub fn order_number(&self, basket_id: i32) -> String {
        format!("{}-{}", self.prefix, self.offset + i64::from(basket_id))
    }

    pub fn basket_id_for_order_number(&self, number: &str) -> Result<i32, ServiceError> {
        let invalid = || ServiceError::InvalidInput(format!("Invalid order number {number:?}"));
        let (prefix, value) = number.rsplit_once('-').ok_or_else(invalid)?;
        if prefix != self.prefix || value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let value: i64 = value.parse().map_err(|_| invalid())?;
        let basket_id = value.checked_sub(self.offset).ok_or_else(invalid)?;
        if basket_id <= 0 {
            return Err(invalid());
        }
        i32::try_from(basket_id).map_err(|_| invalid())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderDetails {
    pub order: order::Model,
    pub lines: Vec<order_line::Model>,
    pub sources: Vec<payment_source::Model>,
    pub payment_events: Vec<payment_event::Model>,
}

#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    numbers: OrderNumberGenerator,
}

impl OrderService {
    pub fn new(db: Arc<DatabaseConnection>, config: Arc<AppConfig>) -> Self {
        Self {
            db,
            numbers: OrderNumberGenerator::from_config(&config),
        }
    }

    pub fn numbers(&self) -> &OrderNumberGenerator {
        &self.numbers
    }

    pub async fn get_by_number(&self, number: &str) -> Result<order::Model, ServiceError> {
        Order::find()
            .filter(order::Column::Number.eq(number))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", number)))
    }

    pub async fn find_for_basket(&self, basket_id: i32) -> Result<Option<order::Model>, ServiceError> {
        Ok(Order::find()
            .filter(order::Column::BasketId.eq(basket_id))
            .one(&*self.db)
            .await?)
    }

    pub async fn get_with_details(&self, number: &str) -> Result<OrderDetails, ServiceError> {
        let order = self.get_by_number(number).await?;
        let lines = OrderLine::find()
            .filter(order_line::Column::OrderId.eq(order.id))
            .all(&*self.db)
            .await?;
        let sources = PaymentSource::find()
            .filter(payment_source::Column::OrderId.eq(order.id))
            .all(&*self.db)
            .await?;
        let payment_events = PaymentEvent::find()
            .filter(payment_event::Column::OrderId.eq(order.id))
            .order_by_asc(payment_event::Column::CreatedAt)
            .all(&*self.db)
            .await?;
        Ok(OrderDetails {
            order,
            lines,
            sources,
            payment_events,
        })
    }

    /// The `Paid` event recorded for a processor transaction, on any order.
    pub async fn find_paid_event(
        &self,
        processor_name: &str,
        reference: &str,
    ) -> Result<Option<payment_event::Model>, ServiceError> {
        Ok(PaymentEvent::find()
            .filter(payment_event::Column::EventType.eq(PaymentEventType::Paid))
            .filter(payment_event::Column::ProcessorName.eq(processor_name))
            .filter(payment_event::Column::Reference.eq(reference))
            .one(&*self.db)
            .await?)
    }

    /// Whether `order_id` was paid by this processor transaction.
    pub async fn has_paid_event(
        &self,
        order_id: Uuid,
        processor_name: &str,
        reference: &str,
    ) -> Result<bool, ServiceError> {
        let event = PaymentEvent::find()
            .filter(payment_event::Column::OrderId.eq(order_id))
            .filter(payment_event::Column::EventType.eq(PaymentEventType::Paid))
            .filter(payment_event::Column::ProcessorName.eq(processor_name))
            .filter(payment_event::Column::Reference.eq(reference))
            .one(&*self.db)
            .await?;
        Ok(event.is_some())
    }

    /// Creates the order for a paid basket in a single transaction.
    ///
    /// The basket must move from Open or Frozen to Submitted; if another placement
    /// won the race, or the unique constraints on order number or basket fire,
    /// the result is [`ServiceError::OrderAlreadyPlaced`].
    #[instrument(skip(self, basket, payment), fields(basket_id = basket.basket.id))]
    pub async fn place_order(
        &self,
        basket: &BasketWithLines,
        payment: Option<&HandledProcessorResponse>,
        processor_name: Option<&str>,
    ) -> Result<order::Model, ServiceError> {
        let basket_id = basket.basket.id;
        let number = self.numbers.order_number(basket_id);
        let now = Utc::now();
        let total = basket.total();

        let txn = self.db.begin().await?;

        let submitted = Basket::update_many()
            .set(basket::ActiveModel {
                status: Set(BasketStatus::Submitted),
                submitted_at: Set(Some(now)),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(basket::Column::Id.eq(basket_id))
            .filter(basket::Column::Status.is_in([BasketStatus::Open, BasketStatus::Frozen]))
            .exec(&txn)
            .await?;
        if submitted.rows_affected != 1 {
            let existing = Order::find()
                .filter(order::Column::BasketId.eq(basket_id))
                .one(&txn)
                .await?;
            return Err(match existing {
                Some(_) => ServiceError::OrderAlreadyPlaced(basket_id),
                None => ServiceError::InvalidOperation(format!(
                    "Basket {} can no longer be ordered",
                    basket_id
                )),
            });
        }

        let order_id = Uuid::new_v4();
        let inserted = order::ActiveModel {
            id: Set(order_id),
            number: Set(number.clone()),
            basket_id: Set(basket_id),
            owner: Set(basket.basket.owner.clone()),
            currency: Set(basket.basket.currency.clone()),
            total_incl_tax: Set(total),
            total_excl_tax: Set(total),
            status: Set(OrderStatus::Complete),
            payment_processor: Set(processor_name.map(str::to_string)),
            date_placed: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await
        .map_err(|e| already_placed_or(e, basket_id))?;

        for line in &basket.lines {
            order_line::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                sku: Set(line.sku.clone()),
                title: Set(line.title.clone()),
                quantity: Set(line.quantity),
                unit_price: Set(line.unit_price),
                line_price: Set(line.line_price()),
                status: Set(OrderLineStatus::Complete),
            }
            .insert(&txn)
            .await?;
        }

        if let (Some(payment), Some(processor_name)) = (payment, processor_name) {
            payment_source::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                source_type: Set(processor_name.to_string()),
                currency: Set(payment.currency.clone()),
                amount_allocated: Set(payment.total),
                amount_debited: Set(payment.total),
                amount_refunded: Set(Decimal::ZERO),
                reference: Set(payment.transaction_id.clone()),
                label: Set(payment.card_number.clone()),
                card_type: Set(payment.card_type.clone()),
                created_at: Set(now),
            }
            .insert(&txn)
            .await?;

            payment_event::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                event_type: Set(PaymentEventType::Paid),
                amount: Set(payment.total),
                reference: Set(payment.transaction_id.clone()),
                processor_name: Set(processor_name.to_string()),
                created_at: Set(now),
            }
            .insert(&txn)
            .await?;
        }

        txn.commit()
            .await
            .map_err(|e| already_placed_or(e, basket_id))?;

        info!(order_number = %inserted.number, basket_id, %total, "order placed");
        Ok(inserted)
    }
}

fn already_placed_or(err: DbErr, basket_id: i32) -> ServiceError {
    if crate::db::is_unique_violation(&err) {
        warn!(basket_id, "order insert hit a unique constraint");
        ServiceError::OrderAlreadyPlaced(basket_id)
    } else {
        ServiceError::DatabaseError(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn generator() -> OrderNumberGenerator {
        OrderNumberGenerator::new("EDX", 100000)
    }

    #[test]
    fn order_number_adds_offset() {
        assert_eq!(generator().order_number(1), "EDX-100001");
        assert_eq!(generator().order_number(42), "EDX-100042");
    }

    #[rstest]
    #[case("EDX-100000")]
    #[case("EDX-99999")]
    #[case("ABC-100001")]
    #[case("EDX100001")]
    #[case("EDX-")]
    #[case("EDX-10a001")]
    #[case("EDX--100001")]
    #[case("EDX-99999999999999999999")]
    fn malformed_order_numbers_are_rejected(#[case] number: &str) {
        assert!(matches!(
            generator().basket_id_for_order_number(number),
            Err(ServiceError::InvalidInput(_))
        ));
    }

    #[test]
    fn prefixes_may_contain_dashes() {
        let numbers = OrderNumberGenerator::new("EDX-TEST", 0);
        assert_eq!(numbers.order_number(7), "EDX-TEST-7");
        assert_eq!(numbers.basket_id_for_order_number("EDX-TEST-7").unwrap(), 7);
    }

    proptest! {
        #[test]
        fn order_numbers_invert(basket_id in 1i32..i32::MAX, offset in 0i64..1_000_000_000) {
            let numbers = OrderNumberGenerator::new("EDX", offset);
            let number = numbers.order_number(basket_id);
            prop_assert_eq!(numbers.basket_id_for_order_number(&number).unwrap(), basket_id);
        }
    }
}
