//! Input validation for catalog records.
//!
//! Field ranges and lengths are declared on the request types with
//! `validator`. This module holds the checks a derive cannot express:
//! - endpoint URLs (scheme, SSRF protection against internal targets)
//! - idempotency key locators
//! - custom response content types
//! - endpoint authentication settings

use std::net::IpAddr;

use axum::http::HeaderValue;

use crate::dedup::KeyLocator;
use crate::error::{FieldErrors, WebhookError};
use crate::models::{CustomResponse, EndpointAuth, OAuth2Grant};
use crate::services::token_service::MAX_ASSERTION_EXPIRY_SECS;

// ---------------------------------------------------------------------------
// URL validation
// ---------------------------------------------------------------------------

/// Validate an endpoint delivery URL.
///
/// Checks:
/// 1. URL is parseable
/// 2. Scheme is HTTPS (or HTTP if `allow_http` is true for dev/test)
/// 3. Host is not a private/internal address, unless `allow_private`
pub fn validate_endpoint_url(
    url: &str,
    allow_http: bool,
    allow_private: bool,
) -> Result<(), WebhookError> {
    let parsed = url::Url::parse(url)
        .map_err(|e| WebhookError::InvalidUrl(format!("Invalid URL format: {e}")))?;

    match parsed.scheme() {
        "https" => {}
        "http" if allow_http => {}
        "http" => {
            return Err(WebhookError::InvalidUrl(
                "Endpoint URLs must use HTTPS".to_string(),
            ));
        }
        scheme => {
            return Err(WebhookError::InvalidUrl(format!(
                "Unsupported URL scheme: {scheme}"
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| WebhookError::InvalidUrl("URL must have a host".to_string()))?;

    if !allow_private {
        validate_host_not_internal(host)?;
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Validate that a host is not a private/internal address.
///
/// Blocks:
/// - Loopback addresses (127.0.0.0/8, ::1)
/// - Private networks (10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16, fc00::/7)
/// - Link-local (169.254.0.0/16, fe80::/10), which includes cloud metadata endpoints
/// - CGNAT (100.64.0.0/10)
/// - Internal hostnames (localhost, *.internal, *.local)
pub fn validate_host_not_internal(host: &str) -> Result<(), WebhookError> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        if is_internal_ip(&ip) {
            return Err(WebhookError::SsrfDetected(format!(
                "Destination host {host} is a private/internal address"
            )));
        }
    }

    let lower = host.to_ascii_lowercase();
    if lower == "localhost"
        || lower.ends_with(".localhost")
        || lower.ends_with(".internal")
        || lower.ends_with(".local")
    {
        return Err(WebhookError::SsrfDetected(format!(
            "Destination host {host} is a restricted internal hostname"
        )));
    }

    Ok(())
}

fn is_internal_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64) // 100.64.0.0/10 (CGNAT)
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_internal_ip(&IpAddr::V4(mapped));
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00 // fc00::/7 unique local
                || (first & 0xffc0) == 0xfe80 // fe80::/10 link local
        }
    }
}

// ---------------------------------------------------------------------------
// Record validation
// ---------------------------------------------------------------------------

/// The content type is echoed back verbatim as a response header.
pub fn validate_custom_response(response: &CustomResponse, errors: &mut FieldErrors) {
    if response.content_type.trim().is_empty()
        || HeaderValue::from_str(&response.content_type).is_err()
    {
        errors.push(
            "custom_response.content_type",
            "must be a non-empty, valid header value",
        );
    }
}

pub fn validate_endpoint_auth(auth: &EndpointAuth, errors: &mut FieldErrors) {
    let EndpointAuth::OAuth2(config) = auth else {
        return;
    };
    if url::Url::parse(&config.token_url).is_err() {
        errors.push("auth.token_url", "must be a valid URL");
    }
    if let OAuth2Grant::ClientAssertion { expiry_secs, .. } = &config.grant {
        if *expiry_secs == 0 || *expiry_secs > MAX_ASSERTION_EXPIRY_SECS {
            errors.push(
                "auth.expiry_secs",
                format!("must be between 1 and {MAX_ASSERTION_EXPIRY_SECS}"),
            );
        }
    }
}

pub fn validate_idempotency_keys(keys: &[String], errors: &mut FieldErrors) {
    for key in keys {
        if KeyLocator::parse(key).is_none() {
            errors.push(
                "idempotency_keys",
                format!("unsupported locator {key}"),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
