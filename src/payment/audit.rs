use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::entities::payment_processor_response::{self, Entity as PaymentProcessorResponse};
use crate::errors::ServiceError;

/// Append-only log of raw processor responses.
#[derive(Clone)]
pub struct PaymentAuditLog {
    db: Arc<DatabaseConnection>,
}

impl PaymentAuditLog {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    #[instrument(skip(self, response))]
    pub async fn record(
        &self,
        processor_name: &str,
        transaction_id: Option<&str>,
        basket_id: Option<i32>,
        response: serde_json::Value,
    ) -> Result<payment_processor_response::Model, ServiceError> {
        let entry = payment_processor_response::ActiveModel {
            id: Set(Uuid::new_v4()),
            processor_name: Set(processor_name.to_string()),
            transaction_id: Set(transaction_id.map(str::to_string)),
            basket_id: Set(basket_id),
            response: Set(response),
            created_at: Set(Utc::now()),
        };
        let saved = entry.insert(&*self.db).await?;
        debug!(entry_id = %saved.id, "processor response recorded");
        Ok(saved)
    }

    /// Basket of the earliest recorded response for a processor transaction.
    pub async fn find_basket_for_transaction(
        &self,
        processor_name: &str,
        transaction_id: &str,
    ) -> Result<Option<i32>, ServiceError> {
        let entry = PaymentProcessorResponse::find()
            .filter(payment_processor_response::Column::ProcessorName.eq(processor_name))
            .filter(payment_processor_response::Column::TransactionId.eq(transaction_id))
            .filter(payment_processor_response::Column::BasketId.is_not_null())
            .order_by_asc(payment_processor_response::Column::CreatedAt)
            .one(&*self.db)
            .await?;
        Ok(entry.and_then(|e| e.basket_id))
    }

    pub async fn list_for_basket(
        &self,
        basket_id: i32,
    ) -> Result<Vec<payment_processor_response::Model>, ServiceError> {
        Ok(PaymentProcessorResponse::find()
            .filter(payment_processor_response::Column::BasketId.eq(basket_id))
            .order_by_asc(payment_processor_response::Column::CreatedAt)
            .all(&*self.db)
            .await?)
    }
}
