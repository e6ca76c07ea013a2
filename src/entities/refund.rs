use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "refunds")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub order_id: Uuid,
    #[sea_orm(nullable)]
    pub owner: Option<String>,
    pub status: RefundStatus,
    #[sea_orm(column_type = "Decimal(Some((12, 2)))")]
    pub total_credit: Decimal,
    pub currency: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id"
    )]
    Order,
    #[sea_orm(has_many = "super::refund_line::Entity")]
    Lines,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

impl Related<super::refund_line::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Lines.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(30))")]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    #[sea_orm(string_value = "open")]
    Open,
    #[sea_orm(string_value = "denied")]
    Denied,
    #[sea_orm(string_value = "payment_refund_pending")]
    PaymentRefundPending,
    #[sea_orm(string_value = "payment_refund_error")]
    PaymentRefundError,
    #[sea_orm(string_value = "payment_refunded")]
    PaymentRefunded,
    #[sea_orm(string_value = "complete")]
    Complete,
}

impl RefundStatus {
    /// Statuses reachable from `self` in one step
    pub fn successors(self) -> &'static [RefundStatus] {
        use RefundStatus::*;
        match self {
            Open => &[Denied, PaymentRefundPending, PaymentRefunded],
            PaymentRefundPending => &[PaymentRefunded, PaymentRefundError],
            PaymentRefundError => &[PaymentRefundPending],
            PaymentRefunded => &[Complete],
            Denied | Complete => &[],
        }
    }

    pub fn can_transition_to(self, next: RefundStatus) -> bool {
        self.successors().contains(&next)
    }
}
