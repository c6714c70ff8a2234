//! Pending-registration store: email-keyed credentials held until the first
//! successful verification, bounded by the non-activated-account TTL.

use anyhow::{Context, Result};
use redis::{aio::ConnectionManager, AsyncCommands};
use std::time::Duration;
use tracing::debug;

use crate::error::{ServiceError, ServiceResult};
use crate::models::PendingRegistration;

#[derive(Clone)]
pub struct RegistrationStore {
    conn: ConnectionManager,
}

impl RegistrationStore {
    /// Connect to the registration store and verify the connection.
    ///
    /// # Errors
    /// Returns an error when the endpoint is unreachable.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid registration store URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to registration store")?;
        debug!("Connected to registration store");
        Ok(Self { conn })
    }

    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    pub async fn ping(&self) -> ServiceResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn exists(&self, email: &str) -> ServiceResult<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(email).await?)
    }

    /// Hold a registration for `email` until the TTL reclaims it.
    pub async fn set(
        &self,
        email: &str,
        registration: &PendingRegistration,
        ttl: Duration,
    ) -> ServiceResult<()> {
        let payload = serde_json::to_string(registration)?;
        let mut conn = self.conn.clone();
        let _: () = conn.set_ex(email, payload, ttl.as_secs()).await?;
        Ok(())
    }

    /// # Errors
    /// Returns `NOT_FOUND` when the registration is absent or TTL-evicted.
    pub async fn get(&self, email: &str) -> ServiceResult<PendingRegistration> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(email).await?;
        let payload =
            payload.ok_or_else(|| ServiceError::not_found("registration not found or expired"))?;
        Ok(serde_json::from_str(&payload)?)
    }

    /// Idempotent: deleting an absent registration succeeds.
    pub async fn delete(&self, email: &str) -> ServiceResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(email).await?;
        Ok(())
    }
}
