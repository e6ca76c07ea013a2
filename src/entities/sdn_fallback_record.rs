use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Locally stored sanctions list entry, screened when the remote API is unavailable
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sdn_fallback_records")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    /// Originating list, e.g. "Specially Designated Nationals (SDN)"
    pub source: String,
    /// Primary and alternate names, space separated
    pub names: String,
    pub addresses: String,
    /// ISO country codes, space separated
    pub countries: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
