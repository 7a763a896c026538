//! Repository implementations for database access.
//!
//! Each repository:
//! - Borrows a SQLx connection or transaction (`&mut PgConnection`)
//! - Runs one parameterized statement per operation
//! - Returns models from [`crate::db::models`]
//! - Wraps storage errors into [`crate::db::errors::DbError`] without discarding them
//!
//! # Available Repositories
//!
//! - [`Users`]: rows of the `users` table
//!
//! # Common Pattern
//!
//! ```ignore
//! use pgrepo::db::handlers::{Repository, Users};
//! use pgrepo::db::models::users::User;
//!
//! async fn example(pool: &sqlx::PgPool) -> anyhow::Result<()> {
//!     let mut tx = pool.begin().await?;
//!     let mut repo = Users::new(&mut tx);
//!
//!     repo.insert(&User::new("29974652-b51f-4826-baf0-c8bd2f1cf4c9", "email")).await?;
//!     let user = repo.get("29974652-b51f-4826-baf0-c8bd2f1cf4c9").await?;
//!
//!     tx.commit().await?;
//!     Ok(())
//! }
//! ```

pub mod repository;
pub mod users;

pub use repository::Repository;
pub use users::Users;
