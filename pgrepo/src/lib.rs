//! # pgrepo: a PostgreSQL users repository
//!
//! A narrow, typed data-access layer over the `users` table, together with the machinery to
//! test it against a disposable PostgreSQL server where every test runs inside its own
//! transaction that is rolled back afterwards.
//!
//! ## Layout
//!
//! - [`db::handlers`]: the [`Users`](db::handlers::Users) repository (`insert` / `get`)
//! - [`db::models`]: the [`User`](db::models::users::User) record
//! - [`db::errors`]: [`DbError`](db::errors::DbError), which wraps storage errors without
//!   hiding their SQLSTATE
//! - [`db::embedded`]: embedded PostgreSQL (feature `embedded-db`, on by default)
//! - [`config`]: figment-based database configuration
//! - `test_utils` (feature `test-utils`): DSN registration and transactional test handles
//!
//! ## Usage
//!
//! ```ignore
//! use pgrepo::{config::Config, db::handlers::{Repository, Users}, db::models::users::User};
//!
//! let database = pgrepo::setup_database(&Config::load_default()?).await?;
//! let mut conn = database.pool().acquire().await?;
//! let mut users = Users::new(&mut conn);
//!
//! users.insert(&User::new("29974652-b51f-4826-baf0-c8bd2f1cf4c9", "email")).await?;
//! let user = users.get("29974652-b51f-4826-baf0-c8bd2f1cf4c9").await?;
//! ```
//!
//! ## Migrations
//!
//! The schema lives in `migrations/` and is applied by [`setup_database`], by the test
//! utilities, or with `sqlx migrate run`:
//!
//! ```ignore
//! pgrepo::migrator().run(&pool).await?;
//! ```

pub mod config;
pub mod db;
pub mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use sqlx::PgPool;
use tracing::info;

use crate::config::{Config, DatabaseConfig};
use crate::db::embedded::EmbeddedDatabase;

/// Get the pgrepo database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// A migrated connection pool, plus the embedded server behind it when there is one.
///
/// Dropping a `Database` built on an embedded server shuts that server down; use
/// [`Database::close`] to do it gracefully.
pub struct Database {
    pool: PgPool,
    embedded_db: Option<EmbeddedDatabase>,
}

impl Database {
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close the pool, then stop the embedded server if this process started one
    pub async fn close(self) -> anyhow::Result<()> {
        self.pool.close().await;
        if let Some(embedded_db) = self.embedded_db {
            embedded_db.stop().await?;
        }
        Ok(())
    }
}

/// Setup the database connection and run migrations
pub async fn setup_database(config: &Config) -> anyhow::Result<Database> {
    let (embedded_db, database_url) = match &config.database {
        DatabaseConfig::Embedded {
            data_dir,
            persistent,
            database_name,
            ..
        } => {
            info!("Starting with embedded database (persistent: {})", persistent);
            if !persistent {
                info!("persistent=false: database will be ephemeral and data will be lost on shutdown");
            }
            let embedded_db = EmbeddedDatabase::start(data_dir.clone(), *persistent, database_name).await?;
            let url = embedded_db.connection_string().to_string();
            (Some(embedded_db), url)
        }
        DatabaseConfig::External { url, .. } => {
            info!("Using external database");
            (None, url.clone())
        }
    };

    let pool = db::connect(&database_url, config.database.pool_settings()).await?;
    migrator().run(&pool).await?;

    Ok(Database { pool, embedded_db })
}
