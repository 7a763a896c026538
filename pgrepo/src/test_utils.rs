//! Test utilities for database testing (available with `test-utils` feature).
//!
//! Tests share one database per process and isolate themselves with transactions: every call
//! to [`transaction_testing_db`] opens a dedicated connection, applies the schema (once per
//! process) and starts a transaction that is rolled back when the handle is dropped. Nothing a
//! test writes is ever committed, so tests can run in parallel against the same rows.
//!
//! The database is resolved in this order:
//!
//! 1. a DSN passed to [`register`]
//! 2. the configured database ([`Config::load_default`]): an external URL (e.g. from
//!    `DATABASE_URL`) is used as is, an embedded one is started once per test process on a
//!    dedicated thread and lives until the process exits
//!
//! ```ignore
//! #[test_log::test(tokio::test)]
//! async fn test_something() {
//!     let mut tx = pgrepo::test_utils::transaction_testing_db().await.unwrap();
//!     let mut repo = Users::new(&mut tx);
//!     // ...
//! }
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::OnceLock;

use anyhow::Context;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::{Config, DatabaseConfig, PoolSettings};
use crate::db::{self, embedded::mask_password};

static REGISTERED_DSN: OnceLock<String> = OnceLock::new();
static SCHEMA_READY: OnceCell<()> = OnceCell::const_new();

/// Register the connection string of the test database for this process.
///
/// Returns `false` if a DSN was already registered; the first registration wins.
pub fn register(dsn: impl Into<String>) -> bool {
    match REGISTERED_DSN.set(dsn.into()) {
        Ok(()) => {
            info!("Registered test database: {}", mask_password(registered_dsn().unwrap_or_default()));
            true
        }
        Err(rejected) => {
            if registered_dsn() != Some(rejected.as_str()) {
                warn!(
                    "Ignoring test database {}: {} is already registered",
                    mask_password(&rejected),
                    mask_password(registered_dsn().unwrap_or_default())
                );
            }
            false
        }
    }
}

/// The registered test database, if any
pub fn registered_dsn() -> Option<&'static str> {
    REGISTERED_DSN.get().map(String::as_str)
}

/// Resolve (and register) the test database connection string.
pub async fn database_url() -> anyhow::Result<String> {
    if let Some(dsn) = registered_dsn() {
        return Ok(dsn.to_string());
    }

    let config = Config::load_default().context("Failed to load test database configuration")?;
    let dsn = match config.database {
        DatabaseConfig::External { url, .. } => url,
        DatabaseConfig::Embedded {
            data_dir, database_name, ..
        } => ephemeral::start(data_dir, database_name).await?,
    };

    register(dsn.clone());
    Ok(registered_dsn().map(str::to_string).unwrap_or(dsn))
}

/// A connection with an open transaction, rolled back when dropped.
///
/// Derefs to [`PgConnection`], so it can be handed to repositories directly:
/// `Users::new(&mut tx)`.
pub struct TestTransaction {
    tx: Transaction<'static, Postgres>,
    _pool: PgPool,
}

impl TestTransaction {
    /// Roll back now instead of on drop
    pub async fn rollback(self) -> anyhow::Result<()> {
        self.tx.rollback().await.context("Failed to roll back test transaction")
    }
}

impl Deref for TestTransaction {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        &self.tx
    }
}

impl DerefMut for TestTransaction {
    fn deref_mut(&mut self) -> &mut PgConnection {
        &mut self.tx
    }
}

/// Open a connection to the test database scoped to a transaction that is never committed.
pub async fn transaction_testing_db() -> anyhow::Result<TestTransaction> {
    let dsn = database_url().await?;
    ensure_schema(&dsn).await?;

    // One connection per handle: pools are bound to the runtime that created them and every
    // #[tokio::test] has its own runtime
    let settings = PoolSettings {
        max_connections: 1,
        min_connections: 0,
        ..Default::default()
    };
    let pool = db::connect(&dsn, &settings).await?;
    let tx = pool.begin().await.context("Failed to begin test transaction")?;

    Ok(TestTransaction { tx, _pool: pool })
}

async fn ensure_schema(dsn: &str) -> anyhow::Result<()> {
    SCHEMA_READY
        .get_or_try_init(|| async move {
            let settings = PoolSettings {
                max_connections: 1,
                min_connections: 0,
                ..Default::default()
            };
            let pool = db::connect(dsn, &settings).await?;
            let migrated = crate::migrator().run(&pool).await;
            pool.close().await;
            migrated.context("Failed to migrate test database")?;
            debug!("Test database schema is up to date");
            anyhow::Ok(())
        })
        .await?;
    Ok(())
}

#[cfg(feature = "embedded-db")]
mod ephemeral {
    use std::path::PathBuf;
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::sync::{Mutex, OnceLock};
    use std::time::Duration;

    use crate::db::embedded::EmbeddedDatabase;

    static EPHEMERAL_DSN: OnceLock<Result<String, String>> = OnceLock::new();
    static SHUTDOWN: Mutex<Option<ShutdownHandle>> = Mutex::new(None);

    const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

    /// Start the process-wide ephemeral server (once) and return its connection string.
    pub(super) async fn start(data_dir: Option<PathBuf>, database_name: String) -> anyhow::Result<String> {
        let result = tokio::task::spawn_blocking(move || {
            EPHEMERAL_DSN
                .get_or_init(|| spawn_server(data_dir, database_name))
                .clone()
        })
        .await?;
        result.map_err(anyhow::Error::msg)
    }

    /// Asks a server thread to stop and waits for it to confirm.
    pub(super) struct ShutdownHandle {
        stop: Sender<()>,
        stopped: Receiver<()>,
    }

    impl ShutdownHandle {
        /// Returns `true` once the server thread confirmed, `false` if it is gone or too slow.
        pub(super) fn shutdown(self, timeout: Duration) -> bool {
            if self.stop.send(()).is_err() {
                return false;
            }
            self.stopped.recv_timeout(timeout).is_ok()
        }
    }

    // Test binaries exit without dropping the server thread's locals, so the server is stopped
    // (and its temporary data directory removed) from a process destructor. No logging here:
    // the subscriber may already be gone.
    #[ctor::dtor]
    unsafe fn stop_ephemeral_server() {
        let handle = match SHUTDOWN.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            let _ = handle.shutdown(SHUTDOWN_TIMEOUT);
        }
    }

    // The server gets its own thread and runtime so it outlives the runtime of the test that
    // happened to start it.
    fn spawn_server(data_dir: Option<PathBuf>, database_name: String) -> Result<String, String> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (stopped_tx, stopped_rx) = mpsc::channel::<()>();

        std::thread::Builder::new()
            .name("pgrepo-test-db".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("Failed to build test database runtime: {e}")));
                        return;
                    }
                };

                runtime.block_on(async move {
                    let embedded_db = match EmbeddedDatabase::start(data_dir, false, &database_name).await {
                        Ok(embedded_db) => embedded_db,
                        Err(e) => {
                            let _ = ready_tx.send(Err(format!("{e:#}")));
                            return;
                        }
                    };
                    let _ = ready_tx.send(Ok(embedded_db.connection_string().to_string()));

                    // Parked until the process destructor asks for a shutdown
                    let _ = tokio::task::spawn_blocking(move || stop_rx.recv()).await;
                    let _ = embedded_db.stop().await;
                    let _ = stopped_tx.send(());
                });
            })
            .map_err(|e| format!("Failed to spawn test database thread: {e}"))?;

        let dsn = ready_rx
            .recv()
            .map_err(|e| format!("Test database thread exited before reporting: {e}"))??;

        let handle = ShutdownHandle {
            stop: stop_tx,
            stopped: stopped_rx,
        };
        match SHUTDOWN.lock() {
            Ok(mut guard) => *guard = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }
        Ok(dsn)
    }

}

#[cfg(not(feature = "embedded-db"))]
mod ephemeral {
    use std::path::PathBuf;

    pub(super) async fn start(_data_dir: Option<PathBuf>, _database_name: String) -> anyhow::Result<String> {
        anyhow::bail!(
            "The test database is configured as embedded but the embedded-db feature is not enabled. \
             Set DATABASE_URL or rebuild with --features embedded-db."
        )
    }
}
