//! Database repository for users.

use sqlx::PgConnection;
use tracing::instrument;

use crate::{
    db::{
        errors::{DbError, Result},
        handlers::repository::Repository,
        models::users::User,
    },
    types::abbrev_id,
};

/// Repository for the `users` table, bound to a borrowed connection.
pub struct Users<'c> {
    db: &'c mut PgConnection,
}

#[async_trait::async_trait]
impl<'c> Repository for Users<'c> {
    type Entity = User;
    type Id = str;

    #[instrument(skip_all, fields(user_id = %abbrev_id(&user.id)))]
    async fn insert(&mut self, user: &User) -> Result<()> {
        // The id is bound as text and cast server-side so the UUID parser does the validation
        sqlx::query(
            r#"
            INSERT INTO users (user_id, email)
            VALUES ($1::uuid, $2)
            "#,
        )
        .bind(user.id.as_str())
        .bind(user.email.as_str())
        .execute(&mut *self.db)
        .await
        .map_err(|e| DbError::wrap("execute insert", e))?;

        Ok(())
    }

    #[instrument(skip_all, fields(user_id = %abbrev_id(id)))]
    async fn get(&mut self, id: &str) -> Result<User> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT user_id::text AS id, email
            FROM users
            WHERE user_id = $1::uuid
            "#,
        )
        .bind(id)
        .fetch_one(&mut *self.db)
        .await
        .map_err(|e| DbError::wrap("scan result", e))
    }
}

impl<'c> Users<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Build a repository from a connection slot that may be empty.
    ///
    /// # Panics
    ///
    /// Panics if `db` is `None`: a repository without a connection can never work, and failing
    /// here points at the caller instead of at the first query.
    #[track_caller]
    pub fn from_optional(db: Option<&'c mut PgConnection>) -> Self {
        match db {
            Some(db) => Self::new(db),
            None => panic!("users repository constructed without a database connection"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{database_url, transaction_testing_db};
    use sqlx::Connection;
    use std::error::Error as _;
    use std::time::Duration;

    const VALID_UUID: &str = "29974652-b51f-4826-baf0-c8bd2f1cf4c9";

    fn test_user() -> User {
        User::new(VALID_UUID, "email")
    }

    #[test_log::test(tokio::test)]
    async fn test_insert_user() {
        let mut tx = transaction_testing_db().await.unwrap();
        let mut repo = Users::new(&mut tx);

        let result = repo.insert(&test_user()).await;
        assert!(result.is_ok(), "insert failed: {result:?}");
    }

    // Same id as test_insert_user: each test runs in its own rolled-back transaction
    #[test_log::test(tokio::test)]
    async fn test_insert_user_isolated_from_other_tests() {
        let mut tx = transaction_testing_db().await.unwrap();
        let mut repo = Users::new(&mut tx);

        repo.insert(&test_user()).await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_insert_user_invalid_id() {
        let mut tx = transaction_testing_db().await.unwrap();
        let mut repo = Users::new(&mut tx);

        let err = repo.insert(&User::new("id", "email")).await.unwrap_err();

        match &err {
            DbError::InvalidInput { operation, message, .. } => {
                assert_eq!(*operation, "execute insert");
                assert_eq!(message, "invalid input syntax for type uuid: \"id\"");
            }
            other => panic!("expected InvalidInput, got {other:?}"),
        }
        assert_eq!(err.code().as_deref(), Some("22P02"));
        assert_eq!(
            err.database_error().map(|e| e.message().to_string()).as_deref(),
            Some("invalid input syntax for type uuid: \"id\"")
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_insert_duplicate_primary_key() {
        let mut tx = transaction_testing_db().await.unwrap();
        let mut repo = Users::new(&mut tx);

        repo.insert(&test_user()).await.unwrap();
        let err = repo.insert(&test_user()).await.unwrap_err();

        match &err {
            DbError::UniqueViolation {
                operation,
                constraint,
                table,
                message,
                conflicting_value,
                ..
            } => {
                assert_eq!(*operation, "execute insert");
                assert_eq!(constraint.as_deref(), Some("users_pkey"));
                assert_eq!(table.as_deref(), Some("users"));
                assert_eq!(message, "duplicate key value violates unique constraint \"users_pkey\"");
                assert_eq!(conflicting_value.as_deref(), Some(VALID_UUID));
            }
            other => panic!("expected UniqueViolation, got {other:?}"),
        }
        assert_eq!(err.code().as_deref(), Some("23505"));
        assert!(err.to_string().starts_with("execute insert: "));
        assert!(err.to_string().contains("users_pkey"));
    }

    #[test_log::test(tokio::test)]
    async fn test_insert_keeps_original_error_as_source() {
        let mut tx = transaction_testing_db().await.unwrap();
        let mut repo = Users::new(&mut tx);

        repo.insert(&test_user()).await.unwrap();
        let err = repo.insert(&test_user()).await.unwrap_err();

        let source = err.source().and_then(|s| s.downcast_ref::<sqlx::Error>());
        let pg_err = source
            .and_then(|s| s.as_database_error())
            .and_then(|e| e.try_downcast_ref::<sqlx::postgres::PgDatabaseError>())
            .expect("source is a postgres error");
        assert_eq!(pg_err.code(), "23505");
    }

    #[test_log::test(tokio::test)]
    async fn test_get_user() {
        let mut tx = transaction_testing_db().await.unwrap();
        let mut repo = Users::new(&mut tx);

        let user = test_user();
        repo.insert(&user).await.unwrap();

        let retrieved = repo.get(VALID_UUID).await.unwrap();
        assert_eq!(retrieved, user);
    }

    #[test_log::test(tokio::test)]
    async fn test_get_user_not_found() {
        let mut tx = transaction_testing_db().await.unwrap();
        let mut repo = Users::new(&mut tx);

        let err = repo.get(VALID_UUID).await.unwrap_err();

        assert!(err.is_not_found());
        assert!(matches!(err, DbError::NotFound { operation: "scan result", .. }));
        assert!(matches!(err.sqlx_error(), Some(sqlx::Error::RowNotFound)));
    }

    #[test_log::test(tokio::test)]
    async fn test_get_user_invalid_id() {
        let mut tx = transaction_testing_db().await.unwrap();
        let mut repo = Users::new(&mut tx);

        let err = repo.get("id").await.unwrap_err();

        match &err {
            DbError::InvalidInput { operation, message, .. } => {
                assert_eq!(*operation, "scan result");
                assert_eq!(message, "invalid input syntax for type uuid: \"id\"");
            }
            other => panic!("expected InvalidInput, got {other:?}"),
        }
        assert_eq!(err.code().as_deref(), Some("22P02"));
    }

    #[test_log::test(tokio::test)]
    async fn test_insert_accepts_empty_email() {
        let mut tx = transaction_testing_db().await.unwrap();
        let mut repo = Users::new(&mut tx);

        // Only NOT NULL is enforced on email
        let user = User::new(VALID_UUID, "");
        repo.insert(&user).await.unwrap();

        assert_eq!(repo.get(VALID_UUID).await.unwrap(), user);
    }

    #[test_log::test(tokio::test)]
    async fn test_rolled_back_insert_is_not_visible() {
        let mut tx = transaction_testing_db().await.unwrap();
        Users::new(&mut tx).insert(&test_user()).await.unwrap();
        tx.rollback().await.unwrap();

        let mut tx = transaction_testing_db().await.unwrap();
        let err = Users::new(&mut tx).get(VALID_UUID).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[test_log::test(tokio::test)]
    async fn test_concurrent_inserts_on_independent_handles() {
        let ids = [
            "6f1c1c4e-2d0a-4a43-9b53-1f4b7f0d6a01",
            "6f1c1c4e-2d0a-4a43-9b53-1f4b7f0d6a02",
            "6f1c1c4e-2d0a-4a43-9b53-1f4b7f0d6a03",
            "6f1c1c4e-2d0a-4a43-9b53-1f4b7f0d6a04",
            "6f1c1c4e-2d0a-4a43-9b53-1f4b7f0d6a05",
        ];

        let handles: Vec<_> = ids
            .into_iter()
            .map(|id| {
                tokio::spawn(async move {
                    let mut tx = transaction_testing_db().await?;
                    let mut repo = Users::new(&mut tx);
                    let user = User::new(id, format!("{id}@example.com"));
                    repo.insert(&user).await?;
                    let retrieved = repo.get(id).await?;
                    anyhow::Ok(retrieved == user)
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.await.unwrap().unwrap());
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_same_id_on_parallel_handles_succeeds_after_rollback() {
        // Not shared with other tests, so only the spawned insert below can wait on `first`
        const CONTESTED_UUID: &str = "c0a801f4-7d1e-4b8a-9f3c-2e5d6a7b8c90";

        let mut first = transaction_testing_db().await.unwrap();
        Users::new(&mut first)
            .insert(&User::new(CONTESTED_UUID, "first"))
            .await
            .unwrap();
        let first_pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut *first)
            .await
            .unwrap();

        let second = tokio::spawn(async move {
            let mut tx = transaction_testing_db().await?;
            let mut repo = Users::new(&mut tx);
            repo.insert(&User::new(CONTESTED_UUID, "second")).await?;
            let user = repo.get(CONTESTED_UUID).await?;
            anyhow::Ok(user.email)
        });

        // Observe from outside both transactions until the second insert waits on the first
        let mut observer = PgConnection::connect(&database_url().await.unwrap()).await.unwrap();
        let blocked = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let waiting: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM pg_stat_activity WHERE $1 = ANY(pg_blocking_pids(pid))")
                        .bind(first_pid)
                        .fetch_one(&mut observer)
                        .await
                        .unwrap();
                if waiting > 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(blocked.is_ok(), "second insert never waited on the uncommitted row");
        assert!(!second.is_finished());

        first.rollback().await.unwrap();

        let email = tokio::time::timeout(Duration::from_secs(10), second)
            .await
            .expect("second insert still blocked after rollback")
            .unwrap()
            .unwrap();
        assert_eq!(email, "second");
        observer.close().await.unwrap();
    }

    #[test]
    #[should_panic(expected = "without a database connection")]
    fn test_from_optional_without_connection_panics() {
        let _ = Users::from_optional(None);
    }
}
