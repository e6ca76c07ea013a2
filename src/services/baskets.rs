use crate::{
    config::AppConfig,
    entities::{
        basket::{self, BasketStatus},
        basket_line, Basket, BasketLine,
    },
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::{Validate, ValidationError};

static CURRENCY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z]{3}$").expect("currency pattern compiles"));
static SKU_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:+-]*$").expect("sku pattern compiles"));

pub(crate) fn validate_currency(currency: &str) -> Result<(), ValidationError> {
    if CURRENCY_RE.is_match(currency) {
        Ok(())
    } else {
        let mut err = ValidationError::new("currency");
        err.message = Some("Currency must be a 3-letter ISO code".into());
        Err(err)
    }
}

/// Minor-unit digits a currency allows; processors charge amounts rounded to this.
pub fn currency_exponent(currency: &str) -> u32 {
    if crate::payment::stripe::is_zero_decimal(currency) {
        0
    } else {
        2
    }
}

fn validate_unit_price(value: &Decimal) -> Result<(), ValidationError> {
    if *value < Decimal::ZERO {
        let mut err = ValidationError::new("range");
        err.message = Some("Price must not be negative".into());
        return Err(err);
    }
    if value.normalize().scale() > 2 {
        let mut err = ValidationError::new("precision");
        err.message = Some("Price must not have more than two decimal places".into());
        return Err(err);
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct CreateBasketInput {
    #[validate(length(min = 1, max = 255))]
    pub owner: Option<String>,
    #[validate(custom = "validate_currency")]
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct AddLineInput {
    #[validate(length(min = 1, max = 128), regex = "SKU_RE")]
    pub sku: String,
    #[validate(length(min = 1, max = 255))]
    pub title: String,
    #[validate(custom = "validate_unit_price")]
    pub unit_price: Decimal,
    #[validate(range(min = 1, max = 1000))]
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct BasketWithLines {
    pub basket: basket::Model,
    pub lines: Vec<basket_line::Model>,
}

impl BasketWithLines {
    pub fn id(&self) -> i32 {
        self.basket.id
    }

    /// Sum of quantity x unit price over every line
    pub fn total(&self) -> Decimal {
        self.lines.iter().map(basket_line::Model::line_price).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

/// Basket lifecycle: creation, line edits, merging and the freeze used during payment.
#[derive(Clone)]
pub struct BasketService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    config: Arc<AppConfig>,
}

impl BasketService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            db,
            event_sender,
            config,
        }
    }

    #[instrument(skip(self))]
    pub async fn create_basket(
        &self,
        input: CreateBasketInput,
    ) -> Result<basket::Model, ServiceError> {
        input.validate()?;
        let currency = input
            .currency
            .unwrap_or_else(|| self.config.default_currency.clone())
            .to_uppercase();
        let basket = insert_open_basket(&*self.db, input.owner, currency).await?;
        info!(basket_id = basket.id, "basket created");
        Ok(basket)
    }

    pub async fn get_basket(&self, basket_id: i32) -> Result<BasketWithLines, ServiceError> {
        load_basket(&*self.db, basket_id).await
    }

    /// Returns the owner's open basket, merging any extra open baskets into the oldest.
    #[instrument(skip(self))]
    pub async fn get_or_create_open_basket(
        &self,
        owner: &str,
        currency: Option<String>,
    ) -> Result<BasketWithLines, ServiceError> {
        if let Some(currency) = currency.as_deref() {
            validate_currency(currency)
                .map_err(|_| ServiceError::ValidationError(format!("Invalid currency {currency}")))?;
        }

        let txn = self.db.begin().await?;
        let mut open = Basket::find()
            .filter(basket::Column::Owner.eq(owner))
            .filter(basket::Column::Status.eq(BasketStatus::Open))
            .order_by_asc(basket::Column::Id)
            .all(&txn)
            .await?;

        if open.is_empty() {
            let currency = currency
                .unwrap_or_else(|| self.config.default_currency.clone())
                .to_uppercase();
            let basket = insert_open_basket(&txn, Some(owner.to_string()), currency).await?;
            txn.commit().await?;
            return Ok(BasketWithLines {
                basket,
                lines: Vec::new(),
            });
        }

        let keep = open.remove(0);
        let mut merged_ids = Vec::with_capacity(open.len());
        for other in open {
            merge_lines(&txn, other.id, keep.id).await?;
            let mut other: basket::ActiveModel = other.into();
            other.status = Set(BasketStatus::Merged);
            other.updated_at = Set(Utc::now());
            let other = other.update(&txn).await?;
            merged_ids.push(other.id);
        }
        let result = load_basket(&txn, keep.id).await?;
        txn.commit().await?;

        if !merged_ids.is_empty() {
            info!(basket_id = keep.id, merged = ?merged_ids, "merged open baskets");
            self.event_sender
                .send_or_log(Event::BasketMerged {
                    basket_id: keep.id,
                    merged_basket_ids: merged_ids,
                })
                .await;
        }
        Ok(result)
    }

    /// Adds a product line; an existing line for the same SKU has its quantity increased.
    #[instrument(skip(self, input), fields(sku = %input.sku))]
    pub async fn add_line(
        &self,
        basket_id: i32,
        input: AddLineInput,
    ) -> Result<BasketWithLines, ServiceError> {
        input.validate()?;
        let txn = self.db.begin().await?;
        let basket = require_open(&txn, basket_id).await?;
        if input.unit_price.normalize().scale() > currency_exponent(&basket.currency) {
            return Err(ServiceError::ValidationError(format!(
                "unit_price: {} has more decimal places than {} allows",
                input.unit_price, basket.currency
            )));
        }

        let existing = BasketLine::find()
            .filter(basket_line::Column::BasketId.eq(basket_id))
            .filter(basket_line::Column::Sku.eq(input.sku.as_str()))
            .one(&txn)
            .await?;

        match existing {
            Some(line) => {
                let quantity = line.quantity + input.quantity;
                let mut line: basket_line::ActiveModel = line.into();
                line.quantity = Set(quantity);
                line.unit_price = Set(input.unit_price);
                line.update(&txn).await?;
            }
            None => {
                basket_line::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    basket_id: Set(basket_id),
                    sku: Set(input.sku.clone()),
                    title: Set(input.title.clone()),
                    quantity: Set(input.quantity),
                    unit_price: Set(input.unit_price),
                    created_at: Set(Utc::now()),
                }
                .insert(&txn)
                .await?;
            }
        }
        touch(&txn, basket_id).await?;
        let result = load_basket(&txn, basket_id).await?;
        txn.commit().await?;

        info!(basket_id, quantity = input.quantity, "line added to basket");
        Ok(result)
    }

    #[instrument(skip(self))]
    pub async fn remove_line(
        &self,
        basket_id: i32,
        line_id: Uuid,
    ) -> Result<BasketWithLines, ServiceError> {
        let txn = self.db.begin().await?;
        require_open(&txn, basket_id).await?;

        let deleted = BasketLine::delete_many()
            .filter(basket_line::Column::Id.eq(line_id))
            .filter(basket_line::Column::BasketId.eq(basket_id))
            .exec(&txn)
            .await?;
        if deleted.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!(
                "Line {} not found in basket {}",
                line_id, basket_id
            )));
        }
        touch(&txn, basket_id).await?;
        let result = load_basket(&txn, basket_id).await?;
        txn.commit().await?;
        Ok(result)
    }

    /// Removes every line from an open basket.
    #[instrument(skip(self))]
    pub async fn flush(&self, basket_id: i32) -> Result<BasketWithLines, ServiceError> {
        let txn = self.db.begin().await?;
        require_open(&txn, basket_id).await?;
        BasketLine::delete_many()
            .filter(basket_line::Column::BasketId.eq(basket_id))
            .exec(&txn)
            .await?;
        touch(&txn, basket_id).await?;
        let result = load_basket(&txn, basket_id).await?;
        txn.commit().await?;
        Ok(result)
    }

    /// Locks the basket contents while a payment is in flight.
    #[instrument(skip(self))]
    pub async fn freeze(&self, basket_id: i32) -> Result<(), ServiceError> {
        let changed = transition(
            &*self.db,
            basket_id,
            BasketStatus::Open,
            BasketStatus::Frozen,
        )
        .await?;
        if changed {
            self.event_sender
                .send_or_log(Event::BasketFrozen(basket_id))
                .await;
        }
        Ok(())
    }

    /// Reopens a frozen basket so the buyer can edit it or pay again.
    #[instrument(skip(self))]
    pub async fn thaw(&self, basket_id: i32) -> Result<(), ServiceError> {
        let changed = transition(
            &*self.db,
            basket_id,
            BasketStatus::Frozen,
            BasketStatus::Open,
        )
        .await?;
        if changed {
            self.event_sender
                .send_or_log(Event::BasketThawed(basket_id))
                .await;
        }
        Ok(())
    }
}

async fn insert_open_basket<C: ConnectionTrait>(
    conn: &C,
    owner: Option<String>,
    currency: String,
) -> Result<basket::Model, ServiceError> {
    let now = Utc::now();
    let basket = basket::ActiveModel {
        owner: Set(owner),
        currency: Set(currency),
        status: Set(BasketStatus::Open),
        created_at: Set(now),
        updated_at: Set(now),
        submitted_at: Set(None),
        ..Default::default()
    };
    Ok(basket.insert(conn).await?)
}

pub(crate) async fn load_basket<C: ConnectionTrait>(
    conn: &C,
    basket_id: i32,
) -> Result<BasketWithLines, ServiceError> {
    let basket = Basket::find_by_id(basket_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Basket {} not found", basket_id)))?;
    let lines = BasketLine::find()
        .filter(basket_line::Column::BasketId.eq(basket_id))
        .order_by_asc(basket_line::Column::CreatedAt)
        .all(conn)
        .await?;
    Ok(BasketWithLines { basket, lines })
}

async fn require_open<C: ConnectionTrait>(
    conn: &C,
    basket_id: i32,
) -> Result<basket::Model, ServiceError> {
    let basket = Basket::find_by_id(basket_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Basket {} not found", basket_id)))?;
    if basket.status != BasketStatus::Open {
        return Err(ServiceError::InvalidOperation(format!(
            "Basket {} is {:?} and cannot be modified",
            basket_id, basket.status
        )));
    }
    Ok(basket)
}

async fn touch<C: ConnectionTrait>(conn: &C, basket_id: i32) -> Result<(), ServiceError> {
    Basket::update_many()
        .set(basket::ActiveModel {
            updated_at: Set(Utc::now()),
            ..Default::default()
        })
        .filter(basket::Column::Id.eq(basket_id))
        .exec(conn)
        .await?;
    Ok(())
}

/// Moves a basket between statuses. Returns whether a row changed; already being
/// in `to` counts as success.
async fn transition<C: ConnectionTrait>(
    conn: &C,
    basket_id: i32,
    from: BasketStatus,
    to: BasketStatus,
) -> Result<bool, ServiceError> {
    let result = Basket::update_many()
        .set(basket::ActiveModel {
            status: Set(to),
            updated_at: Set(Utc::now()),
            ..Default::default()
        })
        .filter(basket::Column::Id.eq(basket_id))
        .filter(basket::Column::Status.eq(from))
        .exec(conn)
        .await?;
    if result.rows_affected == 1 {
        return Ok(true);
    }

    let basket = Basket::find_by_id(basket_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Basket {} not found", basket_id)))?;
    if basket.status == to {
        Ok(false)
    } else {
        Err(ServiceError::InvalidOperation(format!(
            "Basket {} cannot move from {:?} to {:?}",
            basket_id, basket.status, to
        )))
    }
}

async fn merge_lines<C: ConnectionTrait>(
    conn: &C,
    from_basket: i32,
    into_basket: i32,
) -> Result<(), ServiceError> {
    let lines = BasketLine::find()
        .filter(basket_line::Column::BasketId.eq(from_basket))
        .all(conn)
        .await?;
    for line in lines {
        let existing = BasketLine::find()
            .filter(basket_line::Column::BasketId.eq(into_basket))
            .filter(basket_line::Column::Sku.eq(line.sku.as_str()))
            .one(conn)
            .await?;
        match existing {
            Some(target) => {
                let quantity = target.quantity + line.quantity;
                let mut target: basket_line::ActiveModel = target.into();
                target.quantity = Set(quantity);
                target.update(conn).await?;
                BasketLine::delete_by_id(line.id).exec(conn).await?;
            }
            None => {
                let mut moved: basket_line::ActiveModel = line.into();
                moved.basket_id = Set(into_basket);
                moved.update(conn).await?;
            }
        }
    }
    Ok(())
}
