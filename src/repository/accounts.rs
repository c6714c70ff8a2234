//! Authoritative account storage in Postgres.
//!
//! `create_account` and `delete_account` hand back an [`AccountTx`]: the row
//! mutation stays invisible to other readers until the handle is committed,
//! which lets the coordinator order event emission before the visible commit.

use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::Instrument;
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};
use crate::models::{Account, NewAccount};

/// An open two-phase commit handle. Dropping it without calling
/// [`AccountTx::commit`] rolls the mutation back.
pub struct AccountTx {
    tx: Transaction<'static, Postgres>,
}

impl AccountTx {
    /// The open connection, for writes that must commit atomically with the
    /// prepared mutation (the event outbox).
    pub(crate) fn conn(&mut self) -> &mut sqlx::PgConnection {
        &mut *self.tx
    }

    /// Make the prepared mutation visible.
    ///
    /// # Errors
    /// Returns `INTERNAL` when the commit fails; the mutation is lost.
    pub async fn commit(self) -> ServiceResult<()> {
        self.tx.commit().await.map_err(ServiceError::from)
    }

    /// Explicitly abandon the handle. Equivalent to dropping it.
    pub async fn rollback(self) -> ServiceResult<()> {
        self.tx.rollback().await.map_err(ServiceError::from)
    }
}

#[derive(Clone)]
pub struct AccountsRepository {
    pool: PgPool,
}

impl AccountsRepository {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ping(&self) -> ServiceResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn exists_by_email(&self, email: &str) -> ServiceResult<bool> {
        let query = "SELECT 1 FROM accounts WHERE email = $1 LIMIT 1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(email)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await?;
        Ok(row.is_some())
    }

    pub async fn get_by_email(&self, email: &str) -> ServiceResult<Account> {
        let query =
            "SELECT id, email, password_hash, registration_date FROM accounts WHERE email = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let account = sqlx::query_as::<_, Account>(query)
            .bind(email)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await?;
        account.ok_or_else(|| ServiceError::not_found("account not found"))
    }

    pub async fn get_email(&self, account_id: Uuid) -> ServiceResult<String> {
        let query = "SELECT email FROM accounts WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "SELECT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(account_id)
            .fetch_optional(&self.pool)
            .instrument(span)
            .await?;
        row.map(|row| row.get("email"))
            .ok_or_else(|| ServiceError::not_found("account not found"))
    }

    /// Replace the stored password hash for `email`.
    ///
    /// # Errors
    /// Returns `NOT_FOUND` when no row is affected.
    pub async fn change_password(&self, email: &str, new_hash: &str) -> ServiceResult<()> {
        let query = "UPDATE accounts SET password_hash = $1 WHERE email = $2";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "UPDATE",
            db.statement = query
        );
        let result = sqlx::query(query)
            .bind(new_hash)
            .bind(email)
            .execute(&self.pool)
            .instrument(span)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::not_found("account not found"));
        }
        Ok(())
    }

    /// Prepare the activation insert and return the new id together with the
    /// uncommitted handle. The row is visible to other readers only after the
    /// handle commits.
    pub async fn create_account(&self, account: &NewAccount) -> ServiceResult<(AccountTx, Uuid)> {
        let mut tx = self.pool.begin().await?;
        let query = r"
            INSERT INTO accounts (email, password_hash, registration_date)
            VALUES ($1, $2, $3)
            RETURNING id
        ";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "INSERT",
            db.statement = query
        );
        let row = sqlx::query(query)
            .bind(&account.email)
            .bind(&account.password_hash)
            .bind(account.registration_date)
            .fetch_one(&mut *tx)
            .instrument(span)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    ServiceError::conflict("account with this email already exists")
                } else {
                    ServiceError::from(err)
                }
            })?;
        let id: Uuid = row.get("id");
        Ok((AccountTx { tx }, id))
    }

    /// Prepare the account delete; the row stays visible until the handle
    /// commits.
    pub async fn delete_account(&self, account_id: Uuid) -> ServiceResult<AccountTx> {
        let mut tx = self.pool.begin().await?;
        let query = "DELETE FROM accounts WHERE id = $1";
        let span = tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = "DELETE",
            db.statement = query
        );
        sqlx::query(query)
            .bind(account_id)
            .execute(&mut *tx)
            .instrument(span)
            .await?;
        Ok(AccountTx { tx })
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::is_unique_violation;
    use sqlx::error::{DatabaseError, ErrorKind};
    use std::borrow::Cow;
    use std::error::Error as StdError;
    use std::fmt;

    #[derive(Debug)]
    struct TestDbError {
        code: Option<&'static str>,
    }

    impl fmt::Display for TestDbError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test database error")
        }
    }

    impl StdError for TestDbError {}

    impl DatabaseError for TestDbError {
        fn message(&self) -> &'static str {
            "test database error"
        }

        fn code(&self) -> Option<Cow<'_, str>> {
            self.code.map(Cow::Borrowed)
        }

        fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn StdError + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn StdError + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> ErrorKind {
            ErrorKind::UniqueViolation
        }
    }

    #[test]
    fn unique_violation_matches_sqlstate() {
        let err = sqlx::Error::Database(Box::new(TestDbError {
            code: Some("23505"),
        }));
        assert!(is_unique_violation(&err));

        let err = sqlx::Error::Database(Box::new(TestDbError {
            code: Some("99999"),
        }));
        assert!(!is_unique_violation(&err));

        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }
}
