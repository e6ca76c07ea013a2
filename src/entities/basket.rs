use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Basket entity: a buyer's in-progress collection of products
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "baskets")]
pub struct Model {
    /// Integer ids; order numbers are derived from them
    #[sea_orm(primary_key)]
    pub id: i32,
    #[sea_orm(nullable)]
    pub owner: Option<String>,
    pub currency: String,
    pub status: BasketStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[sea_orm(nullable)]
    pub submitted_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::basket_line::Entity")]
    Lines,
}

impl Related<super::basket_line::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Lines.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Basket status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
pub enum BasketStatus {
    #[sea_orm(string_value = "open")]
    Open,
    /// Lines were moved into another open basket of the same owner
    #[sea_orm(string_value = "merged")]
    Merged,
    /// Payment is in flight; contents are locked
    #[sea_orm(string_value = "frozen")]
    Frozen,
    /// An order was placed from this basket
    #[sea_orm(string_value = "submitted")]
    Submitted,
}

impl BasketStatus {
    /// Whether a payment may still be applied to a basket in this status
    pub fn accepts_payment(self) -> bool {
        matches!(self, BasketStatus::Open | BasketStatus::Frozen)
    }
}
