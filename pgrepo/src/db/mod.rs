//! Database layer for data persistence and access.
//!
//! This module implements the data access layer using SQLx with PostgreSQL, following the
//! Repository pattern.
//!
//! ```text
//! ┌─────────────┐
//! │   Caller    │  (owns the pool / transaction)
//! └──────┬──────┘
//!        │ &mut PgConnection
//!        ↓
//! ┌─────────────┐
//! │ Repositories│  (db::handlers)
//! └──────┬──────┘
//!        │
//!        ↓
//! ┌─────────────┐
//! │   Models    │  (db::models)
//! └──────┬──────┘
//!        │
//!        ↓
//! ┌─────────────┐
//! │  PostgreSQL │
//! └─────────────┘
//! ```
//!
//! # Modules
//!
//! - [`handlers`]: Repository implementations
//! - [`models`]: Database record structures matching table schemas
//! - [`errors`]: Database-specific error types
//! - [`embedded`]: Embedded PostgreSQL database support (optional feature)

pub mod embedded;
pub mod errors;
pub mod handlers;
pub mod models;

use std::{str::FromStr, time::Duration};

use anyhow::Context;
use sqlx::{
    PgPool,
    postgres::{PgConnectOptions, PgPoolOptions},
};
use tracing::debug;

use crate::config::PoolSettings;

/// Build a connection pool for `database_url` with the given settings.
///
/// A configured `statement_timeout` is sent as a connection parameter, so every statement on
/// every pooled connection is aborted server-side once it runs longer than that.
pub async fn connect(database_url: &str, settings: &PoolSettings) -> anyhow::Result<PgPool> {
    let mut connect_options = PgConnectOptions::from_str(database_url).context("Invalid database URL")?;
    if let Some(timeout) = settings.statement_timeout {
        connect_options = connect_options.options([("statement_timeout", timeout.as_millis().to_string())]);
    }

    let mut pool_options = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs));
    if settings.idle_timeout_secs > 0 {
        pool_options = pool_options.idle_timeout(Duration::from_secs(settings.idle_timeout_secs));
    }
    if settings.max_lifetime_secs > 0 {
        pool_options = pool_options.max_lifetime(Duration::from_secs(settings.max_lifetime_secs));
    }

    let pool = pool_options
        .connect_with(connect_options)
        .await
        .with_context(|| format!("Failed to connect to {}", embedded::mask_password(database_url)))?;

    debug!(
        max_connections = settings.max_connections,
        "Connected to {}",
        embedded::mask_password(database_url)
    );
    Ok(pool)
}
