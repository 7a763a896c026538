//! Database models for users.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::types::UserId;

/// One row of the `users` table.
///
/// `id` is carried as text: the `UUID` column type is the only validation it gets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: UserId,
    pub email: String,
}

impl User {
    pub fn new(id: impl Into<UserId>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
        }
    }
}
