//! Domain event emission via a transactional outbox.
//!
//! Account-lifecycle events (`account_created`, `account_deleted`) are
//! written into `events_outbox` on the same open transaction as the account
//! mutation, so the event row and the identity change commit atomically and
//! the event stream is a causal superset of committed identity state.
//! Writing on the caller's transaction also means emission never acquires a
//! second pool connection while the mutation's connection is checked out.
//! Token-delivery requests have no transaction to ride and enqueue on the
//! pool from detached tasks. A detached worker (see [`publisher`]) drains
//! the table and hands rows to a pluggable sink with bounded-backoff
//! retries, giving at-least-once delivery; consumers must be idempotent on
//! the event key.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tracing::Instrument;
use uuid::Uuid;

use crate::error::ServiceResult;
use crate::repository::AccountTx;

pub mod publisher;

pub use publisher::{spawn_publisher_worker, EventPublisher, LogPublisher, PublisherConfig};

pub const ACCOUNT_CREATED_TOPIC: &str = "account_created";
pub const ACCOUNT_DELETED_TOPIC: &str = "account_deleted";
pub const EMAIL_VERIFICATION_TOPIC: &str = "email_verification_delivery_request";
pub const PASSWORD_CHANGE_TOPIC: &str = "password_change_delivery_request";

/// Published when an account activates; keyed by account id.
#[derive(Debug, Clone, Serialize)]
pub struct AccountCreated {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub registration_date: DateTime<Utc>,
}

/// Published when an account is deleted; keyed by account id.
#[derive(Debug, Clone, Serialize)]
pub struct AccountDeleted {
    pub email: String,
    pub account_id: Uuid,
}

/// Delivery request for an out-of-band token email; keyed by email.
#[derive(Debug, Clone, Serialize)]
pub struct TokenDelivery {
    pub email: String,
    pub token: String,
    pub callback_url: String,
    /// Seconds the callback link stays valid, mirrored from the token TTL.
    pub callback_url_ttl: u64,
}

/// One outbox row ready to insert.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OutboxRow {
    topic: String,
    key: String,
    payload: String,
}

fn outbox_row<T: Serialize>(topic: &str, key: &str, event: &T) -> ServiceResult<OutboxRow> {
    Ok(OutboxRow {
        topic: topic.to_string(),
        key: key.to_string(),
        payload: serde_json::to_string(event)?,
    })
}

async fn insert_row<'e, E>(executor: E, row: &OutboxRow) -> ServiceResult<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let query = r"
        INSERT INTO events_outbox (topic, key, payload)
        VALUES ($1, $2, $3::jsonb)
    ";
    let span = tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "INSERT",
        db.statement = query
    );
    sqlx::query(query)
        .bind(&row.topic)
        .bind(&row.key)
        .bind(&row.payload)
        .execute(executor)
        .instrument(span)
        .await?;
    Ok(())
}

#[derive(Clone)]
pub struct EventEmitter {
    pool: PgPool,
}

impl EventEmitter {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Write the event on the caller's open account transaction; it becomes
    /// visible together with the account mutation when the handle commits.
    ///
    /// # Errors
    /// Returns `INTERNAL` when the outbox row cannot be written; the caller
    /// abandons the handle, rolling both writes back.
    pub async fn account_created(
        &self,
        tx: &mut AccountTx,
        event: &AccountCreated,
    ) -> ServiceResult<()> {
        let row = outbox_row(ACCOUNT_CREATED_TOPIC, &event.id.to_string(), event)?;
        insert_row(tx.conn(), &row).await
    }

    pub async fn account_deleted(
        &self,
        tx: &mut AccountTx,
        event: &AccountDeleted,
    ) -> ServiceResult<()> {
        let row = outbox_row(ACCOUNT_DELETED_TOPIC, &event.account_id.to_string(), event)?;
        insert_row(tx.conn(), &row).await
    }

    pub async fn verify_email_requested(&self, event: &TokenDelivery) -> ServiceResult<()> {
        let row = outbox_row(EMAIL_VERIFICATION_TOPIC, &event.email, event)?;
        insert_row(&self.pool, &row).await
    }

    pub async fn change_password_requested(&self, event: &TokenDelivery) -> ServiceResult<()> {
        let row = outbox_row(PASSWORD_CHANGE_TOPIC, &event.email, event)?;
        insert_row(&self.pool, &row).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_created_row_is_keyed_by_account_id() {
        let id = Uuid::new_v4();
        let event = AccountCreated {
            id,
            email: "a@b.c".to_string(),
            username: "alice".to_string(),
            registration_date: Utc::now(),
        };
        let row = outbox_row(ACCOUNT_CREATED_TOPIC, &event.id.to_string(), &event)
            .expect("row");
        assert_eq!(row.topic, "account_created");
        assert_eq!(row.key, id.to_string());

        let value: serde_json::Value = serde_json::from_str(&row.payload).expect("payload");
        assert_eq!(value["email"], "a@b.c");
        assert_eq!(value["username"], "alice");
        assert!(value.get("registration_date").is_some());
    }

    #[test]
    fn account_deleted_row_is_keyed_by_account_id() {
        let account_id = Uuid::new_v4();
        let event = AccountDeleted {
            email: "a@b.c".to_string(),
            account_id,
        };
        let row = outbox_row(ACCOUNT_DELETED_TOPIC, &event.account_id.to_string(), &event)
            .expect("row");
        assert_eq!(row.topic, "account_deleted");
        assert_eq!(row.key, account_id.to_string());

        let value: serde_json::Value = serde_json::from_str(&row.payload).expect("payload");
        assert_eq!(value["email"], "a@b.c");
        assert_eq!(value["account_id"], account_id.to_string());
    }

    #[test]
    fn token_delivery_row_is_keyed_by_email() {
        let event = TokenDelivery {
            email: "a@b.c".to_string(),
            token: "tok".to_string(),
            callback_url: "https://x/verify".to_string(),
            callback_url_ttl: 3600,
        };
        let row = outbox_row(EMAIL_VERIFICATION_TOPIC, &event.email, &event).expect("row");
        assert_eq!(row.topic, "email_verification_delivery_request");
        assert_eq!(row.key, "a@b.c");

        let value: serde_json::Value = serde_json::from_str(&row.payload).expect("payload");
        assert_eq!(value["token"], "tok");
        assert_eq!(value["callback_url"], "https://x/verify");
        assert_eq!(value["callback_url_ttl"], 3600);
    }
}
