use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The financial instrument that paid for an order, with running debit/refund totals
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payment_sources")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub order_id: Uuid,
    /// Name of the processor that debited this source
    pub source_type: String,
    pub currency: String,
    #[sea_orm(column_type = "Decimal(Some((12, 2)))")]
    pub amount_allocated: Decimal,
    #[sea_orm(column_type = "Decimal(Some((12, 2)))")]
    pub amount_debited: Decimal,
    #[sea_orm(column_type = "Decimal(Some((12, 2)))")]
    pub amount_refunded: Decimal,
    /// Processor transaction id
    #[sea_orm(nullable)]
    pub reference: Option<String>,
    /// Masked card number or account label
    #[sea_orm(nullable)]
    pub label: Option<String>,
    #[sea_orm(nullable)]
    pub card_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Model {
    pub fn refundable_balance(&self) -> Decimal {
        self.amount_debited - self.amount_refunded
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id"
    )]
    Order,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
