//! HMAC-SHA256 signing schemes used by the supported processors.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::PaymentError;

type HmacSha256 = Hmac<Sha256>;

fn mac_for(key: &[u8]) -> Result<HmacSha256, PaymentError> {
    HmacSha256::new_from_slice(key)
        .map_err(|_| PaymentError::GatewayError("invalid signing key".to_string()))
}

pub fn hmac_sha256(key: &[u8], message: &[u8]) -> Result<Vec<u8>, PaymentError> {
    let mut mac = mac_for(key)?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Constant-time comparison of an HMAC over `message` against `expected`.
pub fn verify_hmac_sha256(key: &[u8], message: &[u8], expected: &[u8]) -> Result<(), PaymentError> {
    let mut mac = mac_for(key)?;
    mac.update(message);
    mac.verify_slice(expected)
        .map_err(|_| PaymentError::InvalidSignature)
}

/// The "name=value,name=value" message CyberSource signs, in the order of `names`.
fn signed_message(fields: &BTreeMap<String, String>, names: &[&str]) -> Result<String, PaymentError> {
    let mut parts = Vec::with_capacity(names.len());
    for name in names {
        let value = fields.get(*name).ok_or(PaymentError::InvalidSignature)?;
        parts.push(format!("{name}={value}"));
    }
    Ok(parts.join(","))
}

fn signed_names(fields: &BTreeMap<String, String>) -> Result<Vec<&str>, PaymentError> {
    let names = fields
        .get("signed_field_names")
        .ok_or(PaymentError::InvalidSignature)?;
    Ok(names.split(',').map(str::trim).filter(|n| !n.is_empty()).collect())
}

/// Signs the fields listed in `signed_field_names`; returns the base64 signature.
pub fn sign_secure_acceptance(
    secret: &str,
    fields: &BTreeMap<String, String>,
) -> Result<String, PaymentError> {
    let names = signed_names(fields)?;
    let message = signed_message(fields, &names)?;
    Ok(BASE64.encode(hmac_sha256(secret.as_bytes(), message.as_bytes())?))
}

/// Verifies the `signature` field of a Secure Acceptance response.
pub fn verify_secure_acceptance(
    secret: &str,
    fields: &BTreeMap<String, String>,
) -> Result<(), PaymentError> {
    let signature = fields
        .get("signature")
        .ok_or(PaymentError::InvalidSignature)?;
    let signature = BASE64
        .decode(signature.trim())
        .map_err(|_| PaymentError::InvalidSignature)?;
    let names = signed_names(fields)?;
    let message = signed_message(fields, &names)?;
    verify_hmac_sha256(secret.as_bytes(), message.as_bytes(), &signature)
}

/// A parsed `Stripe-Signature` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StripeSignatureHeader {
    pub timestamp: i64,
    pub signatures: Vec<String>,
}

impl StripeSignatureHeader {
    pub fn parse(header: &str) -> Result<Self, PaymentError> {
        let mut timestamp = None;
        let mut signatures = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => {
                    timestamp = Some(
                        value
                            .parse::<i64>()
                            .map_err(|_| PaymentError::InvalidSignature)?,
                    );
                }
                Some(("v1", value)) => signatures.push(value.to_string()),
                _ => {}
            }
        }
        match timestamp {
            Some(timestamp) if !signatures.is_empty() => Ok(Self {
                timestamp,
                signatures,
            }),
            _ => Err(PaymentError::InvalidSignature),
        }
    }
}

/// Verifies a webhook signed with Stripe's `t=...,v1=...` scheme.
pub fn verify_stripe_signature(
    secret: &str,
    payload: &[u8],
    header: &str,
    now: i64,
    tolerance_secs: u64,
) -> Result<(), PaymentError> {
    let header = StripeSignatureHeader::parse(header)?;
    if now.abs_diff(header.timestamp) > tolerance_secs {
        return Err(PaymentError::InvalidSignature);
    }

    let mut message = format!("{}.", header.timestamp).into_bytes();
    message.extend_from_slice(payload);

    let matched = header.signatures.iter().any(|candidate| {
        hex::decode(candidate)
            .ok()
            .map(|expected| verify_hmac_sha256(secret.as_bytes(), &message, &expected).is_ok())
            .unwrap_or(false)
    });
    if matched {
        Ok(())
    } else {
        Err(PaymentError::InvalidSignature)
    }
}

/// Builds a `Stripe-Signature` header value for `payload` at `timestamp`.
pub fn stripe_signature_header(
    secret: &str,
    payload: &[u8],
    timestamp: i64,
) -> Result<String, PaymentError> {
    let mut message = format!("{timestamp}.").into_bytes();
    message.extend_from_slice(payload);
    let signature = hex::encode(hmac_sha256(secret.as_bytes(), &message)?);
    Ok(format!("t={timestamp},v1={signature}"))
}

/// `SHA-256=<base64 digest>` for a request body.
pub fn body_digest(body: &[u8]) -> String {
    format!("SHA-256={}", BASE64.encode(Sha256::digest(body)))
}

/// Headers needed to authenticate a CyberSource REST request with an HTTP Signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSignatureHeaders {
    pub date: String,
    pub digest: String,
    pub signature: String,
}

pub struct HttpSignatureRequest<'a> {
    pub key_id: &'a str,
    /// Base64 encoded shared secret
    pub shared_secret: &'a str,
    pub merchant_id: &'a str,
    pub host: &'a str,
    pub method: &'a str,
    pub path: &'a str,
    pub date: &'a str,
    pub body: &'a [u8],
}

pub fn http_signature(request: &HttpSignatureRequest<'_>) -> Result<HttpSignatureHeaders, PaymentError> {
    let digest = body_digest(request.body);
    let signing_string = format!(
        "host: {}\ndate: {}\n(request-target): {} {}\ndigest: {}\nv-c-merchant-id: {}",
        request.host,
        request.date,
        request.method.to_lowercase(),
        request.path,
        digest,
        request.merchant_id,
    );
    let key = BASE64
        .decode(request.shared_secret)
        .map_err(|_| PaymentError::GatewayError("REST shared secret is not base64".to_string()))?;
    let signature = BASE64.encode(hmac_sha256(&key, signing_string.as_bytes())?);

    Ok(HttpSignatureHeaders {
        date: request.date.to_string(),
        digest,
        signature: format!(
            "keyid=\"{}\", algorithm=\"HmacSHA256\", headers=\"host date (request-target) digest v-c-merchant-id\", signature=\"{}\"",
            request.key_id, signature
        ),
    })
}
