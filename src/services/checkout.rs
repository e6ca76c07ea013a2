//! Turning processor responses into orders exactly once.
//!
//! Every entry point records the raw response first, then funnels into
//! [`CheckoutService::apply_payment`], which decides between placing an order,
//! acknowledging a redundant notification and refusing a second payment.

use crate::{
    config::AppConfig,
    entities::order,
    errors::ServiceError,
    events::{Event, EventSender},
    payment::{
        cybersource, invoice, paypal, stripe, CheckoutContext, PaymentAuditLog, PaymentError,
        PaymentProcessor, PaymentProcessorRegistry, TransactionParameters,
    },
    services::{
        baskets::{BasketService, BasketWithLines},
        orders::OrderService,
        sdn::{SdnCheckOutcome, SdnQuery, SdnService},
    },
};
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use validator::Validate;

/// Buyer details used for sanctions screening.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct BuyerDetails {
    #[validate(length(min = 1, max = 255))]
    pub full_name: String,
    #[validate(length(max = 255))]
    pub city: String,
    #[validate(length(equal = 2))]
    pub country: String,
    #[validate(email)]
    pub email: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct StartCheckoutInput {
    pub basket_id: i32,
    #[validate(length(min = 1))]
    pub processor: String,
    #[validate]
    pub buyer: Option<BuyerDetails>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutStarted {
    pub basket_id: i32,
    pub order_number: String,
    pub total: Decimal,
    pub currency: String,
    pub parameters: TransactionParameters,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", content = "order", rename_all = "snake_case")]
pub enum PaymentOutcome {
    /// A new order was created by this payment
    Placed(order::Model),
    /// The payment had already produced this order
    AlreadyPlaced(order::Model),
}

impl PaymentOutcome {
    pub fn order(&self) -> &order::Model {
        match self {
            PaymentOutcome::Placed(order) | PaymentOutcome::AlreadyPlaced(order) => order,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Processed { outcome: PaymentOutcome },
    Acknowledged { event_type: String },
}

#[derive(Clone)]
pub struct CheckoutService {
    config: Arc<AppConfig>,
    event_sender: Arc<EventSender>,
    baskets: BasketService,
    orders: OrderService,
    sdn: SdnService,
    registry: Arc<PaymentProcessorRegistry>,
    audit: PaymentAuditLog,
}

impl CheckoutService {
    pub fn new(
        config: Arc<AppConfig>,
        event_sender: Arc<EventSender>,
        baskets: BasketService,
        orders: OrderService,
        sdn: SdnService,
        registry: Arc<PaymentProcessorRegistry>,
        audit: PaymentAuditLog,
    ) -> Self {
        Self {
            config,
            event_sender,
            baskets,
            orders,
            sdn,
            registry,
            audit,
        }
    }

    /// Screens the buyer, freezes the basket and asks the processor how to collect payment.
    #[instrument(skip(self, input), fields(basket_id = input.basket_id, processor = %input.processor))]
    pub async fn start_checkout(&self, input: StartCheckoutInput) -> Result<CheckoutStarted, ServiceError> {
        input.validate()?;
        let processor = self.registry.get(&input.processor)?;
        let basket = self.payable_basket(input.basket_id).await?;

        if self.sdn.is_enabled() {
            let buyer = input.buyer.as_ref().ok_or_else(|| {
                ServiceError::ValidationError("Buyer details are required for checkout".into())
            })?;
            let query = SdnQuery {
                full_name: buyer.full_name.clone(),
                city: buyer.city.clone(),
                country: buyer.country.clone(),
            };
            let outcome = self
                .sdn
                .check(Some(basket.id()), buyer.username.as_deref(), &query)
                .await?;
            if let SdnCheckOutcome::Hit { .. } = outcome {
                return Err(ServiceError::Forbidden(
                    "Purchase blocked by sanctions screening".into(),
                ));
            }
        }

        self.baskets.freeze(basket.id()).await?;

        let ctx = CheckoutContext {
            order_number: self.orders.numbers().order_number(basket.id()),
            return_url: self.config.receipt_page_url.clone(),
            cancel_url: self.config.cancel_page_url.clone(),
            buyer_email: input.buyer.as_ref().and_then(|b| b.email.clone()),
        };
        let parameters = match processor.transaction_parameters(&basket, &ctx).await {
            Ok(parameters) => parameters,
            Err(e) => {
                warn!(error = %e, "could not start payment; releasing basket");
                self.baskets.thaw(basket.id()).await?;
                return Err(e.into());
            }
        };

        if let Some(transaction_id) = parameters.transaction_id.as_deref() {
            self.audit
                .record(
                    processor.name(),
                    Some(transaction_id),
                    Some(basket.id()),
                    serde_json::to_value(&parameters)?,
                )
                .await?;
        }

        info!(order_number = %ctx.order_number, "checkout started");
        Ok(CheckoutStarted {
            basket_id: basket.id(),
            order_number: ctx.order_number,
            total: basket.total(),
            currency: basket.basket.currency.clone(),
            parameters,
        })
    }

    /// Handles a CyberSource Secure Acceptance notification (merchant POST).
    #[instrument(skip(self, fields))]
    pub async fn handle_cybersource_notification(
        &self,
        fields: BTreeMap<String, String>,
    ) -> Result<PaymentOutcome, ServiceError> {
        let transaction_id = fields.get("transaction_id").cloned().filter(|t| !t.is_empty());
        let basket_id = fields
            .get("req_reference_number")
            .and_then(|number| self.orders.numbers().basket_id_for_order_number(number).ok());
        let response = serde_json::to_value(&fields)?;

        self.audit
            .record(
                cybersource::NAME,
                transaction_id.as_deref(),
                basket_id,
                response.clone(),
            )
            .await?;

        let processor = self.registry.cybersource()?;
        if let Err(e) = processor.verify_signature(&fields) {
            counter!("coursecart.payment.signature_failures", 1, "processor" => cybersource::NAME);
            warn!(?basket_id, "CyberSource notification failed signature verification");
            return Err(e.into());
        }

        let basket_id = basket_id.ok_or_else(|| {
            PaymentError::InvalidResponse("notification has no valid req_reference_number".into())
        })?;

        // A decline or cancel moved no money, so it never counts against an existing order
        if let Err(e) = processor.normalize(&fields) {
            if e.is_processor_decision() {
                if let Some(order) = self.orders.find_for_basket(basket_id).await? {
                    info!(order_number = %order.number, reason = %e, "processor decision for a basket that already has an order");
                    counter!("coursecart.payment.outcomes", 1, "processor" => cybersource::NAME, "outcome" => e.kind());
                    return Err(e.into());
                }
            }
        }
        self.apply_payment(processor, &response, basket_id, transaction_id.as_deref())
            .await
    }

    /// Handles a signed Stripe webhook delivery.
    #[instrument(skip(self, payload, signature))]
    pub async fn handle_stripe_webhook(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<WebhookOutcome, ServiceError> {
        let processor = self.registry.stripe()?;
        let event = match processor.verify_webhook(payload, signature, chrono::Utc::now().timestamp()) {
            Ok(event) => event,
            Err(e) => {
                counter!("coursecart.payment.signature_failures", 1, "processor" => stripe::NAME);
                return Err(e.into());
            }
        };

        let event_type = event
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();
        let intent = event
            .pointer("/data/object")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let intent_id = intent.get("id").and_then(|v| v.as_str()).map(str::to_string);

        let mut basket_id = intent
            .pointer("/metadata/basket_id")
            .and_then(|v| v.as_str())
            .and_then(|v| v.parse::<i32>().ok());
        if basket_id.is_none() {
            if let Some(intent_id) = intent_id.as_deref() {
                basket_id = self
                    .audit
                    .find_basket_for_transaction(stripe::NAME, intent_id)
                    .await?;
            }
        }

        self.audit
            .record(stripe::NAME, intent_id.as_deref(), basket_id, event.clone())
            .await?;

        match event_type.as_str() {
            "payment_intent.succeeded" => {
                let basket_id = basket_id.ok_or_else(|| {
                    PaymentError::InvalidResponse("payment intent is not linked to a basket".into())
                })?;
                let outcome = self
                    .apply_payment(processor, &intent, basket_id, intent_id.as_deref())
                    .await?;
                Ok(WebhookOutcome::Processed { outcome })
            }
            "payment_intent.payment_failed" => {
                let reason = intent
                    .pointer("/last_payment_error/message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("payment failed")
                    .to_string();
                self.reject(stripe::NAME, basket_id, &PaymentError::TransactionDeclined(reason))
                    .await;
                Ok(WebhookOutcome::Acknowledged { event_type })
            }
            _ => {
                info!(%event_type, "ignoring Stripe event");
                Ok(WebhookOutcome::Acknowledged { event_type })
            }
        }
    }

    /// Completes the PayPal return leg once the buyer approved the payment.
    #[instrument(skip(self))]
    pub async fn execute_paypal_payment(
        &self,
        payment_id: &str,
        payer_id: &str,
    ) -> Result<PaymentOutcome, ServiceError> {
        let processor = self.registry.paypal()?;
        let basket_id = self
            .audit
            .find_basket_for_transaction(paypal::NAME, payment_id)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("No basket is waiting for PayPal payment {payment_id}"))
            })?;

        let response = serde_json::json!({ "paymentId": payment_id, "PayerID": payer_id });
        self.audit
            .record(paypal::NAME, Some(payment_id), Some(basket_id), response.clone())
            .await?;
        self.apply_payment(processor, &response, basket_id, Some(payment_id))
            .await
    }

    /// Places an order for a basket that costs nothing.
    #[instrument(skip(self))]
    pub async fn place_free_order(&self, basket_id: i32) -> Result<order::Model, ServiceError> {
        let basket = self.payable_basket(basket_id).await?;
        if basket.total() != Decimal::ZERO {
            return Err(ServiceError::InvalidOperation(format!(
                "Basket {} total is {}, not free",
                basket_id,
                basket.total()
            )));
        }
        let order = self.orders.place_order(&basket, None, None).await?;
        self.announce_order(&order).await;
        Ok(order)
    }

    #[instrument(skip(self))]
    pub async fn place_invoiced_order(&self, basket_id: i32) -> Result<PaymentOutcome, ServiceError> {
        let processor = self.registry.get(invoice::NAME)?;
        self.apply_payment(processor, &serde_json::json!({}), basket_id, None)
            .await
    }

    /// Applies a processor response to a basket.
    ///
    /// At most one order exists per basket. A response for a basket that already has
    /// an order is acknowledged when it is the payment that produced the order, and
    /// refused as an excess payment otherwise.
    #[instrument(skip(self, processor, response), fields(processor = processor.name()))]
    pub async fn apply_payment(
        &self,
        processor: Arc<dyn PaymentProcessor>,
        response: &serde_json::Value,
        basket_id: i32,
        transaction_id: Option<&str>,
    ) -> Result<PaymentOutcome, ServiceError> {
        let name = processor.name();

        if let Some(order) = self.orders.find_for_basket(basket_id).await? {
            return self.classify_existing(order, name, transaction_id).await;
        }

        let basket = self.baskets.get_basket(basket_id).await?;
        if !basket.basket.status.accepts_payment() {
            // An order placed since the check above is classified like any late delivery
            if let Some(order) = self.orders.find_for_basket(basket_id).await? {
                return self.classify_existing(order, name, transaction_id).await;
            }
            return Err(ServiceError::InvalidOperation(format!(
                "Basket {} is {:?} and cannot be paid",
                basket_id, basket.basket.status
            )));
        }

        if let Some(reference) = transaction_id {
            if let Some(event) = self.orders.find_paid_event(name, reference).await? {
                if let Some(order) = self.orders.find_for_basket(basket_id).await? {
                    return self.classify_existing(order, name, transaction_id).await;
                }
                error!(basket_id, order_id = %event.order_id, %reference, "transaction already paid another order");
                counter!("coursecart.payment.outcomes", 1, "processor" => name, "outcome" => "redundant");
                return Err(PaymentError::RedundantPaymentNotification(reference.to_string()).into());
            }
        }

        let handled = match processor.handle_processor_response(response, &basket).await {
            Ok(handled) => handled,
            Err(e) => {
                self.reject(name, Some(basket_id), &e).await;
                return Err(e.into());
            }
        };

        if let Err(e) = reconcile(&basket, handled.currency.as_str(), handled.total) {
            error!(
                basket_id,
                transaction_id = ?handled.transaction_id,
                error = %e,
                "payment does not match basket; manual refund required"
            );
            counter!("coursecart.payment.outcomes", 1, "processor" => name, "outcome" => e.kind());
            return Err(e.into());
        }

        let reference = handled
            .transaction_id
            .clone()
            .or_else(|| transaction_id.map(str::to_string));
        let order = match self.orders.place_order(&basket, Some(&handled), Some(name)).await {
            Ok(order) => order,
            Err(ServiceError::OrderAlreadyPlaced(_)) => {
                let order = self.orders.find_for_basket(basket_id).await?.ok_or_else(|| {
                    ServiceError::InternalError(format!("order for basket {basket_id} vanished"))
                })?;
                return self
                    .classify_existing(order, name, reference.as_deref())
                    .await;
            }
            Err(e) => return Err(e),
        };

        counter!("coursecart.payment.outcomes", 1, "processor" => name, "outcome" => "accepted");
        self.event_sender
            .send_or_log(Event::PaymentAccepted {
                basket_id,
                processor: name.to_string(),
                transaction_id: reference,
                amount: handled.total,
                currency: handled.currency.clone(),
            })
            .await;
        self.announce_order(&order).await;
        Ok(PaymentOutcome::Placed(order))
    }

    async fn payable_basket(&self, basket_id: i32) -> Result<BasketWithLines, ServiceError> {
        let basket = self.baskets.get_basket(basket_id).await?;
        if !basket.basket.status.accepts_payment() {
            return Err(ServiceError::InvalidOperation(format!(
                "Basket {} is {:?} and cannot be checked out",
                basket_id, basket.basket.status
            )));
        }
        if basket.is_empty() {
            return Err(ServiceError::InvalidOperation(format!(
                "Basket {} is empty",
                basket_id
            )));
        }
        Ok(basket)
    }

    async fn classify_existing(
        &self,
        order: order::Model,
        processor_name: &str,
        transaction_id: Option<&str>,
    ) -> Result<PaymentOutcome, ServiceError> {
        let same_payment = match transaction_id {
            Some(reference) => {
                self.orders
                    .has_paid_event(order.id, processor_name, reference)
                    .await?
            }
            None => order.payment_processor.as_deref() == Some(processor_name),
        };

        if same_payment {
            info!(order_number = %order.number, "redundant payment notification");
            counter!("coursecart.payment.outcomes", 1, "processor" => processor_name.to_string(), "outcome" => "already_placed");
            return Ok(PaymentOutcome::AlreadyPlaced(order));
        }

        error!(
            order_number = %order.number,
            processor = processor_name,
            transaction_id = ?transaction_id,
            "received payment for a basket that already has an order; manual refund required"
        );
        counter!("coursecart.payment.outcomes", 1, "processor" => processor_name.to_string(), "outcome" => "excessive");
        Err(PaymentError::ExcessivePaymentForOrder {
            order_number: order.number,
        }
        .into())
    }

    async fn reject(&self, processor_name: &str, basket_id: Option<i32>, err: &PaymentError) {
        warn!(?basket_id, processor = processor_name, error = %err, "payment rejected");
        counter!("coursecart.payment.outcomes", 1, "processor" => processor_name.to_string(), "outcome" => err.kind());

        if let (true, Some(basket_id)) = (err.releases_basket(), basket_id) {
            if let Err(e) = self.baskets.thaw(basket_id).await {
                warn!(basket_id, error = %e, "could not release basket after rejection");
            }
        }
        self.event_sender
            .send_or_log(Event::PaymentRejected {
                basket_id,
                processor: processor_name.to_string(),
                reason: err.to_string(),
            })
            .await;
    }

    async fn announce_order(&self, order: &order::Model) {
        self.event_sender
            .send_or_log(Event::OrderPlaced {
                order_id: order.id,
                order_number: order.number.clone(),
                basket_id: order.basket_id,
            })
            .await;
    }
}

/// Checks a normalized payment against the basket it pays for.
pub fn reconcile(basket: &BasketWithLines, currency: &str, total: Decimal) -> Result<(), PaymentError> {
    if !currency.eq_ignore_ascii_case(&basket.basket.currency) {
        return Err(PaymentError::CurrencyMismatch {
            paid: currency.to_string(),
            expected: basket.basket.currency.clone(),
        });
    }
    let expected = basket.total();
    if total != expected {
        return Err(PaymentError::AmountMismatch {
            paid: total,
            expected,
        });
    }
    Ok(())
}
