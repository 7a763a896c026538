//! Database record models matching table schemas.
//!
//! Each model struct matches one table and derives `sqlx::FromRow` so repositories can map
//! query results onto it with `sqlx::query_as`.
//!
//! - [`users`]: rows of the `users` table

pub mod users;
