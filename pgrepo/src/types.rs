//! Common type definitions.

/// Identifier of a row in `users`. Kept as text so that malformed values reach the database,
/// whose `UUID` column type rejects them.
pub type UserId = String;

/// Abbreviate an identifier to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_id(id: &str) -> String {
    id.chars().take(8).collect()
}
