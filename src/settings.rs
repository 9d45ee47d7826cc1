//! Typed access to the `configs` key/value table.
//!
//! Keys are dotted `Section.Key` strings.

use anyhow::Result;
use std::time::Duration;
use tracing::{info, warn};

use crate::db::{self, Pool};
use crate::model::Credentials;

pub const INITIALIZED: &str = "initialized";
pub const AUTH_COOKIE: &str = "Auth.cookie";
pub const AUTH_TOKEN: &str = "Auth.token";
pub const GENERAL_START_ID: &str = "General.start_id";
pub const GENERAL_REQUEST_INTERVAL: &str = "General.request_interval";

// `General.request_interval` stays unset so `scan.request_interval_ms` applies
// until someone stores an override.
const DEFAULTS: &[(&str, &str)] = &[
    (GENERAL_START_ID, "11312122"),
    (AUTH_COOKIE, ""),
    (AUTH_TOKEN, ""),
];

/// Write the default entries once. Later calls leave user edits alone.
pub async fn seed_defaults(pool: &Pool) -> Result<bool> {
    if db::get_config(pool, INITIALIZED).await?.is_some() {
        return Ok(false);
    }
    for (key, value) in DEFAULTS {
        db::save_config(pool, key, value).await?;
    }
    db::save_config(pool, INITIALIZED, "true").await?;
    info!("seeded default settings");
    Ok(true)
}

pub async fn load_credentials(pool: &Pool) -> Result<Credentials> {
    let cookie = db::get_config(pool, AUTH_COOKIE).await?.unwrap_or_default();
    let token = db::get_config(pool, AUTH_TOKEN).await?.unwrap_or_default();
    Ok(Credentials::new(cookie, token))
}

pub async fn save_credentials(pool: &Pool, credentials: &Credentials) -> Result<()> {
    db::save_config(pool, AUTH_COOKIE, &credentials.cookie).await?;
    db::save_config(pool, AUTH_TOKEN, &credentials.token).await?;
    Ok(())
}

/// Stored interval in seconds; fractional values are accepted.
pub async fn request_interval(pool: &Pool) -> Result<Option<Duration>> {
    let Some(raw) = db::get_config(pool, GENERAL_REQUEST_INTERVAL).await? else {
        return Ok(None);
    };
    let parsed = raw
        .trim()
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok());
    if parsed.is_none() {
        warn!(value = %raw, "ignoring unparsable request interval");
    }
    Ok(parsed)
}

/// Stored interval if there is a usable one, `fallback` otherwise.
pub async fn effective_interval(pool: &Pool, fallback: Duration) -> Result<Duration> {
    Ok(request_interval(pool).await?.unwrap_or(fallback))
}

pub async fn start_id(pool: &Pool) -> Result<Option<i64>> {
    let raw = db::get_config(pool, GENERAL_START_ID).await?;
    Ok(raw.and_then(|s| s.trim().parse().ok()))
}

pub async fn save_start_id(pool: &Pool, start_id: i64) -> Result<()> {
    db::save_config(pool, GENERAL_START_ID, &start_id.to_string()).await
}
