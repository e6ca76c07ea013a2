use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::cybersource::{self, Cybersource};
use super::invoice::{self, Invoice};
use super::paypal::{self, Paypal};
use super::stripe::{self, Stripe};
use super::{PaymentError, PaymentProcessor};
use crate::config::AppConfig;

/// The enabled payment processors, in display order, plus kill switches.
pub struct PaymentProcessorRegistry {
    order: Vec<String>,
    disabled: HashSet<String>,
    cybersource: Option<Arc<Cybersource>>,
    paypal: Option<Arc<Paypal>>,
    stripe: Option<Arc<Stripe>>,
    invoice: Option<Arc<Invoice>>,
}

impl PaymentProcessorRegistry {
    pub fn from_config(cfg: &AppConfig) -> Result<Self, PaymentError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PaymentError::GatewayError(format!("failed to build HTTP client: {e}")))?;

        let mut registry = Self {
            order: Vec::new(),
            disabled: cfg.disabled_processors().into_iter().collect(),
            cybersource: None,
            paypal: None,
            stripe: None,
            invoice: None,
        };
        for name in cfg.enabled_processors() {
            match name.as_str() {
                cybersource::NAME => {
                    registry.cybersource = Some(Arc::new(Cybersource::from_app_config(cfg, http.clone())))
                }
                paypal::NAME => {
                    registry.paypal = Some(Arc::new(Paypal::from_app_config(cfg, http.clone())))
                }
                stripe::NAME => {
                    registry.stripe = Some(Arc::new(Stripe::from_app_config(cfg, http.clone())))
                }
                invoice::NAME => registry.invoice = Some(Arc::new(Invoice)),
                other => return Err(PaymentError::ProcessorNotFound(other.to_string())),
            }
            registry.order.push(name);
        }
        info!(processors = ?registry.order, disabled = ?registry.disabled, "payment processors loaded");
        Ok(registry)
    }

    fn ensure_enabled(&self, name: &str) -> Result<(), PaymentError> {
        if self.disabled.contains(name) {
            return Err(PaymentError::ProcessorDisabled(name.to_string()));
        }
        Ok(())
    }

    fn typed<T>(&self, name: &str, slot: &Option<Arc<T>>) -> Result<Arc<T>, PaymentError> {
        let processor = slot
            .clone()
            .ok_or_else(|| PaymentError::ProcessorNotFound(name.to_string()))?;
        self.ensure_enabled(name)?;
        Ok(processor)
    }

    /// The processor a buyer may pay with now; refused while its kill switch is on.
    pub fn get(&self, name: &str) -> Result<Arc<dyn PaymentProcessor>, PaymentError> {
        self.ensure_enabled(name)?;
        self.configured(name)
    }

    /// Any configured processor, disabled or not. Refunds of existing orders go through here.
    pub fn configured(&self, name: &str) -> Result<Arc<dyn PaymentProcessor>, PaymentError> {
        let missing = || PaymentError::ProcessorNotFound(name.to_string());
        let processor: Arc<dyn PaymentProcessor> = match name {
            cybersource::NAME => self.cybersource.clone().ok_or_else(missing)? as Arc<dyn PaymentProcessor>,
            paypal::NAME => self.paypal.clone().ok_or_else(missing)? as Arc<dyn PaymentProcessor>,
            stripe::NAME => self.stripe.clone().ok_or_else(missing)? as Arc<dyn PaymentProcessor>,
            invoice::NAME => self.invoice.clone().ok_or_else(missing)? as Arc<dyn PaymentProcessor>,
            _ => return Err(missing()),
        };
        Ok(processor)
    }

    pub fn cybersource(&self) -> Result<Arc<Cybersource>, PaymentError> {
        self.typed(cybersource::NAME, &self.cybersource)
    }

    pub fn paypal(&self) -> Result<Arc<Paypal>, PaymentError> {
        self.typed(paypal::NAME, &self.paypal)
    }

    pub fn stripe(&self) -> Result<Arc<Stripe>, PaymentError> {
        self.typed(stripe::NAME, &self.stripe)
    }

    /// Names of processors a buyer can currently choose, in configured order.
    pub fn available(&self) -> Vec<&str> {
        self.order
            .iter()
            .map(String::as_str)
            .filter(|name| !self.disabled.contains(*name))
            .collect()
    }
}
