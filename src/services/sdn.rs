//! Sanctioned-party screening against the trade.gov consolidated screening list,
//! with a locally stored list used when the API cannot be reached.

use crate::{
    config::AppConfig,
    entities::{sdn_check_failure, sdn_fallback_record, SdnFallbackRecord},
    errors::ServiceError,
    events::{Event, EventSender},
};
use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SdnQuery {
    #[validate(length(min = 1, max = 255))]
    pub full_name: String,
    #[validate(length(max = 255))]
    pub city: String,
    /// ISO 3166-1 alpha-2 country code
    #[validate(length(equal = 2))]
    pub country: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScreeningResult {
    pub hits: i64,
    pub response: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SdnCheckOutcome {
    Clear,
    Hit { hits: i64 },
}

#[async_trait]
pub trait SanctionsScreening: Send + Sync {
    async fn search(&self, query: &SdnQuery) -> Result<ScreeningResult, ServiceError>;
}

pub struct TradeGovSdnClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    lists: Vec<String>,
    timeout: Duration,
}

impl TradeGovSdnClient {
    pub fn new(
        http: reqwest::Client,
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        lists: Vec<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            http,
            api_url: api_url.into(),
            api_key: api_key.into(),
            lists,
            timeout,
        }
    }
}

#[async_trait]
impl SanctionsScreening for TradeGovSdnClient {
    #[instrument(skip(self, query), fields(country = %query.country))]
    async fn search(&self, query: &SdnQuery) -> Result<ScreeningResult, ServiceError> {
        let sources = self.lists.join(",");
        let response = self
            .http
            .get(&self.api_url)
            .timeout(self.timeout)
            .header("subscription-key", &self.api_key)
            .query(&[
                ("sources", sources.as_str()),
                ("type", "Individual"),
                ("name", query.full_name.as_str()),
                ("city", query.city.as_str()),
                ("countries", query.country.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("SDN search failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::ExternalServiceError(format!(
                "SDN search returned {status}"
            )));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("unreadable SDN response: {e}")))?;
        let hits = body
            .get("total")
            .and_then(|t| t.as_i64())
            .ok_or_else(|| ServiceError::ExternalServiceError("SDN response has no total".into()))?;
        Ok(ScreeningResult {
            hits,
            response: body,
        })
    }
}

/// Lowercased word tokens of a name, punctuation treated as whitespace.
pub fn name_tokens(name: &str) -> BTreeSet<String> {
    name.chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Uppercased country codes from a list separated by commas, semicolons or whitespace.
pub fn country_codes(raw: &str) -> Vec<String> {
    raw.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|code| !code.is_empty())
        .map(str::to_uppercase)
        .collect()
}

/// A record matches when it covers the query country and contains every query name token.
pub fn fallback_matches(record: &sdn_fallback_record::Model, query: &SdnQuery) -> bool {
    let country = query.country.trim().to_uppercase();
    let covers_country = country_codes(&record.countries)
        .iter()
        .any(|c| *c == country);
    if !covers_country {
        return false;
    }
    let wanted = name_tokens(&query.full_name);
    !wanted.is_empty() && wanted.is_subset(&name_tokens(&record.names))
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewSdnRecord {
    #[validate(length(min = 1))]
    pub source: String,
    #[validate(length(min = 1))]
    pub names: String,
    #[serde(default)]
    pub addresses: String,
    #[serde(default)]
    pub countries: String,
}

#[derive(Clone)]
pub struct SdnService {
    db: Arc<DatabaseConnection>,
    event_sender: Arc<EventSender>,
    enabled: bool,
    client: Option<Arc<dyn SanctionsScreening>>,
}

impl SdnService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: Arc<EventSender>,
        config: Arc<AppConfig>,
    ) -> Self {
        let client = config.sdn_api_key.as_ref().map(|key| {
            Arc::new(TradeGovSdnClient::new(
                reqwest::Client::new(),
                config.sdn_api_url.clone(),
                key.clone(),
                config.sdn_lists(),
                Duration::from_secs(config.sdn_timeout_secs),
            )) as Arc<dyn SanctionsScreening>
        });
        Self {
            db,
            event_sender,
            enabled: config.sdn_check_enabled,
            client,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[instrument(skip(self, query))]
    pub async fn check(
        &self,
        basket_id: Option<i32>,
        username: Option<&str>,
        query: &SdnQuery,
    ) -> Result<SdnCheckOutcome, ServiceError> {
        if !self.enabled {
            return Ok(SdnCheckOutcome::Clear);
        }
        query.validate()?;

        let result = match &self.client {
            Some(client) => match client.search(query).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(error = %e, "SDN API unavailable; screening against the local list");
                    self.fallback_search(query).await?
                }
            },
            None => self.fallback_search(query).await?,
        };

        if result.hits == 0 {
            return Ok(SdnCheckOutcome::Clear);
        }

        sdn_check_failure::ActiveModel {
            id: Set(Uuid::new_v4()),
            full_name: Set(query.full_name.clone()),
            username: Set(username.map(str::to_string)),
            city: Set(query.city.clone()),
            country: Set(query.country.to_uppercase()),
            basket_id: Set(basket_id),
            hits: Set(i32::try_from(result.hits).unwrap_or(i32::MAX)),
            sdn_check_response: Set(result.response),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await?;

        warn!(?basket_id, hits = result.hits, "purchaser matched a sanctions list");
        self.event_sender
            .send_or_log(Event::SdnCheckFailed {
                basket_id,
                username: username.map(str::to_string),
                hits: result.hits,
            })
            .await;
        Ok(SdnCheckOutcome::Hit { hits: result.hits })
    }

    pub async fn fallback_search(&self, query: &SdnQuery) -> Result<ScreeningResult, ServiceError> {
        let country = query.country.trim().to_uppercase();
        let candidates = SdnFallbackRecord::find()
            .filter(sdn_fallback_record::Column::Countries.contains(country.as_str()))
            .all(&*self.db)
            .await?;
        let matches: Vec<_> = candidates
            .into_iter()
            .filter(|record| fallback_matches(record, query))
            .collect();
        Ok(ScreeningResult {
            hits: matches.len() as i64,
            response: serde_json::json!({
                "source": "fallback",
                "total": matches.len(),
                "results": matches,
            }),
        })
    }

    /// Replaces the local list in one transaction.
    #[instrument(skip(self, records), fields(count = records.len()))]
    pub async fn replace_fallback_records(
        &self,
        records: Vec<NewSdnRecord>,
    ) -> Result<usize, ServiceError> {
        for record in &records {
            record.validate()?;
        }
        let txn = self.db.begin().await?;
        SdnFallbackRecord::delete_many().exec(&txn).await?;
        for record in &records {
            sdn_fallback_record::ActiveModel {
                id: Set(Uuid::new_v4()),
                source: Set(record.source.clone()),
                names: Set(record.names.clone()),
                addresses: Set(record.addresses.clone()),
                countries: Set(country_codes(&record.countries).join(" ")),
            }
            .insert(&txn)
            .await?;
        }
        txn.commit().await?;
        info!(count = records.len(), "SDN fallback list replaced");
        Ok(records.len())
    }
}
