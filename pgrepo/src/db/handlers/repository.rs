//! Base repository trait for database operations.

use crate::db::errors::Result;

/// Base repository trait providing the common database operations.
///
/// A repository is a data access layer for one postgres table. It borrows a connection for its
/// whole lifetime and runs exactly one statement per operation; it never opens, commits or
/// closes anything itself, so it composes with whatever transaction the caller started.
#[async_trait::async_trait]
pub trait Repository {
    /// The entity type stored in the table
    type Entity: Send + Sync;

    /// The identifier type for lookups
    type Id: ?Sized + Sync;

    /// Insert a new entity
    async fn insert(&mut self, entity: &Self::Entity) -> Result<()>;

    /// Get an entity by ID, failing with [`DbError::NotFound`](crate::db::errors::DbError::NotFound)
    /// when no row matches
    async fn get(&mut self, id: &Self::Id) -> Result<Self::Entity>;
}
