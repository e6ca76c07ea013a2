//! Invoice payment: the buyer is billed offline, so the order is placed immediately.

use async_trait::async_trait;
use std::collections::BTreeMap;

use super::{
    CheckoutContext, CreditRequest, HandledProcessorResponse, PaymentError, PaymentProcessor,
    TransactionParameters,
};
use crate::services::baskets::BasketWithLines;

pub const NAME: &str = "invoice";

#[derive(Debug, Default, Clone)]
pub struct Invoice;

#[async_trait]
impl PaymentProcessor for Invoice {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn transaction_parameters(
        &self,
        _basket: &BasketWithLines,
        ctx: &CheckoutContext,
    ) -> Result<TransactionParameters, PaymentError> {
        let mut fields = BTreeMap::new();
        fields.insert("order_number".to_string(), ctx.order_number.clone());
        Ok(TransactionParameters {
            processor: NAME.to_string(),
            transaction_id: None,
            payment_page_url: None,
            fields,
        })
    }

    async fn handle_processor_response(
        &self,
        _response: &serde_json::Value,
        basket: &BasketWithLines,
    ) -> Result<HandledProcessorResponse, PaymentError> {
        Ok(HandledProcessorResponse {
            transaction_id: None,
            total: basket.total(),
            currency: basket.basket.currency.clone(),
            card_number: None,
            card_type: None,
        })
    }

    async fn issue_credit(&self, _credit: &CreditRequest) -> Result<Option<String>, PaymentError> {
        Err(PaymentError::RefundNotSupported(NAME.to_string()))
    }
}
