use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

use crate::payment::KNOWN_PROCESSORS;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_ORDER_NUMBER_PREFIX: &str = "EDX";
const DEFAULT_ORDER_NUMBER_OFFSET: i64 = 100_000;
const DEFAULT_PAYMENT_PROCESSORS: &str = "cybersource,paypal,stripe,invoice";

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[validate(schema(function = "validate_payment_processors", skip_on_field_errors = false))]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1))]
    pub event_channel_capacity: usize,

    /// Currency assigned to baskets created without one
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub default_currency: String,

    /// Prefix of generated order numbers (e.g. "EDX" in "EDX-100042")
    #[serde(default = "default_order_number_prefix")]
    #[validate(length(min = 1))]
    pub order_number_prefix: String,

    /// Offset added to basket ids when generating order numbers
    #[serde(default = "default_order_number_offset")]
    #[validate(range(min = 0))]
    pub order_number_offset: i64,

    /// Enabled payment processors, comma-separated, in display order
    #[serde(default = "default_payment_processors")]
    pub payment_processors: String,

    /// Processors switched off without a redeploy, comma-separated
    #[serde(default)]
    pub disabled_payment_processors: Option<String>,

    /// Page the buyer lands on after a successful payment
    #[serde(default)]
    pub receipt_page_url: Option<String>,

    /// Page the buyer lands on after cancelling a payment
    #[serde(default)]
    pub cancel_page_url: Option<String>,

    // ========== CyberSource ==========
    #[serde(default)]
    pub cybersource_profile_id: Option<String>,
    #[serde(default)]
    pub cybersource_access_key: Option<String>,
    /// Secure Acceptance secret used to sign and verify form fields
    #[serde(default)]
    pub cybersource_secret_key: Option<String>,
    #[serde(default = "default_cybersource_payment_page_url")]
    pub cybersource_payment_page_url: String,
    #[serde(default = "default_cybersource_rest_api_url")]
    pub cybersource_rest_api_url: String,
    #[serde(default)]
    pub cybersource_merchant_id: Option<String>,
    #[serde(default)]
    pub cybersource_api_key_id: Option<String>,
    /// Base64 encoded shared secret for REST HTTP signatures
    #[serde(default)]
    pub cybersource_api_secret: Option<String>,

    // ========== PayPal ==========
    #[serde(default = "default_paypal_api_url")]
    pub paypal_api_url: String,
    #[serde(default)]
    pub paypal_client_id: Option<String>,
    #[serde(default)]
    pub paypal_client_secret: Option<String>,
    /// Number of times a payment execution is attempted
    #[serde(default = "default_paypal_retry_attempts")]
    #[validate(range(min = 1, max = 10))]
    pub paypal_retry_attempts: u32,

    // ========== Stripe ==========
    #[serde(default = "default_stripe_api_url")]
    pub stripe_api_url: String,
    #[serde(default)]
    pub stripe_secret_key: Option<String>,
    #[serde(default)]
    pub stripe_publishable_key: Option<String>,
    #[serde(default)]
    pub stripe_webhook_secret: Option<String>,
    #[serde(default = "default_stripe_webhook_tolerance_secs")]
    pub stripe_webhook_tolerance_secs: u64,

    // ========== SDN screening ==========
    #[serde(default)]
    pub sdn_check_enabled: bool,
    #[serde(default = "default_sdn_api_url")]
    pub sdn_api_url: String,
    #[serde(default)]
    pub sdn_api_key: Option<String>,
    /// Screening lists searched, comma-separated
    #[serde(default = "default_sdn_lists")]
    pub sdn_lists: String,
    #[serde(default = "default_sdn_timeout_secs")]
    #[validate(range(min = 1))]
    pub sdn_timeout_secs: u64,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the essentials
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            default_currency: default_currency(),
            order_number_prefix: default_order_number_prefix(),
            order_number_offset: default_order_number_offset(),
            payment_processors: default_payment_processors(),
            disabled_payment_processors: None,
            receipt_page_url: None,
            cancel_page_url: None,
            cybersource_profile_id: None,
            cybersource_access_key: None,
            cybersource_secret_key: None,
            cybersource_payment_page_url: default_cybersource_payment_page_url(),
            cybersource_rest_api_url: default_cybersource_rest_api_url(),
            cybersource_merchant_id: None,
            cybersource_api_key_id: None,
            cybersource_api_secret: None,
            paypal_api_url: default_paypal_api_url(),
            paypal_client_id: None,
            paypal_client_secret: None,
            paypal_retry_attempts: default_paypal_retry_attempts(),
            stripe_api_url: default_stripe_api_url(),
            stripe_secret_key: None,
            stripe_publishable_key: None,
            stripe_webhook_secret: None,
            stripe_webhook_tolerance_secs: default_stripe_webhook_tolerance_secs(),
            sdn_check_enabled: false,
            sdn_api_url: default_sdn_api_url(),
            sdn_api_key: None,
            sdn_lists: default_sdn_lists(),
            sdn_timeout_secs: default_sdn_timeout_secs(),
        }
    }

    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    /// Enabled processor names, trimmed and lowercased, in configured order
    pub fn enabled_processors(&self) -> Vec<String> {
        split_list(&self.payment_processors)
    }

    /// Processor names currently switched off
    pub fn disabled_processors(&self) -> Vec<String> {
        self.disabled_payment_processors
            .as_deref()
            .map(split_list)
            .unwrap_or_default()
    }

    pub fn sdn_lists(&self) -> Vec<String> {
        self.sdn_lists
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_order_number_prefix() -> String {
    DEFAULT_ORDER_NUMBER_PREFIX.to_string()
}

fn default_order_number_offset() -> i64 {
    DEFAULT_ORDER_NUMBER_OFFSET
}

fn default_payment_processors() -> String {
    DEFAULT_PAYMENT_PROCESSORS.to_string()
}

fn default_cybersource_payment_page_url() -> String {
    "https://testsecureacceptance.cybersource.com/pay".to_string()
}

fn default_cybersource_rest_api_url() -> String {
    "https://apitest.cybersource.com".to_string()
}

fn default_paypal_api_url() -> String {
    "https://api.sandbox.paypal.com".to_string()
}

fn default_paypal_retry_attempts() -> u32 {
    1
}

fn default_stripe_api_url() -> String {
    "https://api.stripe.com".to_string()
}

fn default_stripe_webhook_tolerance_secs() -> u64 {
    300
}

fn default_sdn_api_url() -> String {
    "https://data.trade.gov/consolidated_screening_list/v1/search".to_string()
}

fn default_sdn_lists() -> String {
    "SDN,ISN".to_string()
}

fn default_sdn_timeout_secs() -> u64 {
    5
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_payment_processors(config: &AppConfig) -> Result<(), ValidationError> {
    let unknown: Vec<String> = config
        .enabled_processors()
        .into_iter()
        .filter(|name| !KNOWN_PROCESSORS.contains(&name.as_str()))
        .collect();

    if unknown.is_empty() {
        Ok(())
    } else {
        let mut err = ValidationError::new("payment_processors");
        err.message = Some(format!("Unknown payment processors: {}", unknown.join(", ")).into());
        Err(err)
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("coursecart_api={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());

    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://coursecart.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
