//! Outbox publisher worker.
//!
//! Pending `events_outbox` rows are drained in locked batches
//! (`FOR UPDATE SKIP LOCKED`, so several workers can run without
//! double-publishing) and handed to an [`EventPublisher`]. Failed rows are
//! retried with exponential backoff and jitter until a max attempt
//! threshold, then marked `failed`. The default [`LogPublisher`] logs the
//! event; a broker client implements the trait without touching the
//! coordinator.

use anyhow::{Context, Result};
use rand::Rng;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

/// One row ready for publication.
#[derive(Clone, Debug)]
pub struct OutboxEvent {
    pub topic: String,
    pub key: String,
    pub payload_json: String,
}

/// Downstream delivery abstraction used by the worker.
pub trait EventPublisher: Send + Sync {
    /// Publish an event or return an error to schedule a retry.
    fn publish(&self, event: &OutboxEvent) -> Result<()>;
}

/// Local dev publisher that logs the event instead of contacting a broker.
#[derive(Clone, Debug)]
pub struct LogPublisher;

impl EventPublisher for LogPublisher {
    fn publish(&self, event: &OutboxEvent) -> Result<()> {
        info!(
            topic = %event.topic,
            key = %event.key,
            payload = %event.payload_json,
            "event publish stub"
        );
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct PublisherConfig {
    poll_interval: Duration,
    batch_size: usize,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl PublisherConfig {
    /// Default worker config: 5s poll interval, 10 events per batch,
    /// 5 max attempts, and 5s->5m exponential backoff with jitter.
    #[must_use]
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 10,
            max_attempts: 5,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
        }
    }

    #[must_use]
    pub fn with_poll_interval_seconds(mut self, seconds: u64) -> Self {
        self.poll_interval = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_backoff_base_seconds(mut self, seconds: u64) -> Self {
        self.backoff_base = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_backoff_max_seconds(mut self, seconds: u64) -> Self {
        self.backoff_max = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn normalize(self) -> Self {
        let poll_interval = if self.poll_interval.is_zero() {
            Duration::from_secs(1)
        } else {
            self.poll_interval
        };
        let batch_size = if self.batch_size == 0 {
            1
        } else {
            self.batch_size
        };
        let max_attempts = self.max_attempts.max(1);
        let backoff_base = if self.backoff_base.is_zero() {
            Duration::from_secs(1)
        } else {
            self.backoff_base
        };
        let backoff_max = if self.backoff_max < backoff_base {
            backoff_base
        } else {
            self.backoff_max
        };
        Self {
            poll_interval,
            batch_size,
            max_attempts,
            backoff_base,
            backoff_max,
        }
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the detached worker that polls and publishes the outbox.
pub fn spawn_publisher_worker(
    pool: PgPool,
    publisher: Arc<dyn EventPublisher>,
    config: PublisherConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let config = config.normalize();

        loop {
            let batch_result = process_batch(&pool, publisher.as_ref(), &config).await;
            if let Err(err) = batch_result {
                error!("event outbox batch failed: {err}");
            }

            sleep(config.poll_interval).await;
        }
    })
}

async fn process_batch(
    pool: &PgPool,
    publisher: &dyn EventPublisher,
    config: &PublisherConfig,
) -> Result<usize> {
    let mut tx = pool
        .begin()
        .await
        .context("failed to start outbox transaction")?;

    let query = r"
        SELECT id, topic, key, payload::text AS payload, attempts
        FROM events_outbox
        WHERE status = 'pending'
          AND next_attempt_at <= NOW()
        ORDER BY next_attempt_at ASC, created_at ASC
        LIMIT $1
        FOR UPDATE SKIP LOCKED
    ";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );
    let rows = sqlx::query(query)
        .bind(i64::try_from(config.batch_size).unwrap_or(0))
        .fetch_all(&mut *tx)
        .instrument(span)
        .await
        .context("failed to load outbox batch")?;

    if rows.is_empty() {
        // Commit even on empty to release locks and keep the poll loop consistent.
        tx.commit()
            .await
            .context("failed to commit empty outbox batch")?;
        return Ok(0);
    }

    let row_count = rows.len();
    for row in rows {
        let id: Uuid = row.get("id");
        let attempts: i32 = row.get("attempts");
        let attempts = u32::try_from(attempts).unwrap_or(0);
        let event = OutboxEvent {
            topic: row.get("topic"),
            key: row.get("key"),
            payload_json: row.get("payload"),
        };

        let publish_result = publisher.publish(&event);
        update_status(&mut tx, id, attempts, publish_result, config).await?;
    }

    tx.commit()
        .await
        .context("failed to commit outbox batch")?;

    Ok(row_count)
}

async fn update_status(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: Uuid,
    attempts: u32,
    publish_result: Result<()>,
    config: &PublisherConfig,
) -> Result<()> {
    let next_attempt = attempts.saturating_add(1);
    let next_attempts_i32 = i32::try_from(next_attempt).unwrap_or(i32::MAX);
    match publish_result {
        Ok(()) => {
            let query = r"
                UPDATE events_outbox
                SET status = 'published',
                    attempts = $2,
                    last_error = NULL,
                    published_at = NOW(),
                    next_attempt_at = NOW()
                WHERE id = $1
            ";
            let span = info_span!(
                "db.query",
                db.system = "postgresql",
                db.operation = "UPDATE",
                db.statement = query
            );
            sqlx::query(query)
                .bind(id)
                .bind(next_attempts_i32)
                .execute(&mut **tx)
                .instrument(span)
                .await
                .context("failed to mark outbox row published")?;
        }
        Err(err) => {
            if next_attempt >= config.max_attempts {
                let query = r"
                    UPDATE events_outbox
                    SET status = 'failed',
                        attempts = $2,
                        last_error = $3,
                        next_attempt_at = NOW()
                    WHERE id = $1
                ";
                let span = info_span!(
                    "db.query",
                    db.system = "postgresql",
                    db.operation = "UPDATE",
                    db.statement = query
                );
                sqlx::query(query)
                    .bind(id)
                    .bind(next_attempts_i32)
                    .bind(err.to_string())
                    .execute(&mut **tx)
                    .instrument(span)
                    .await
                    .context("failed to mark outbox row failed")?;
            } else {
                let delay = backoff_delay(next_attempt, config.backoff_base, config.backoff_max);
                let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
                let query = r"
                    UPDATE events_outbox
                    SET status = 'pending',
                        attempts = $2,
                        last_error = $3,
                        next_attempt_at = NOW() + ($4 * INTERVAL '1 millisecond')
                    WHERE id = $1
                ";
                let span = info_span!(
                    "db.query",
                    db.system = "postgresql",
                    db.operation = "UPDATE",
                    db.statement = query
                );
                sqlx::query(query)
                    .bind(id)
                    .bind(next_attempts_i32)
                    .bind(err.to_string())
                    .bind(delay_ms)
                    .execute(&mut **tx)
                    .instrument(span)
                    .await
                    .context("failed to update outbox retry schedule")?;
            }
        }
    }

    Ok(())
}

fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let factor = 1u32 << shift;
    let delay = base.checked_mul(factor).unwrap_or(max);
    let capped = if delay > max { max } else { delay };
    jitter_delay(capped)
}

fn jitter_delay(delay: Duration) -> Duration {
    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    if delay_ms < 2 {
        return delay;
    }
    let half = delay_ms / 2;
    let jitter = rand::thread_rng().gen_range(0..=half);
    Duration::from_millis(half + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_floors_degenerate_settings() {
        let config = PublisherConfig::new()
            .with_poll_interval_seconds(0)
            .with_batch_size(0)
            .with_max_attempts(0)
            .with_backoff_base_seconds(0)
            .with_backoff_max_seconds(0)
            .normalize();
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.backoff_base, Duration::from_secs(1));
        assert!(config.backoff_max >= config.backoff_base);
    }

    #[test]
    fn backoff_delay_is_capped() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(300);
        for attempt in 1..=40 {
            assert!(backoff_delay(attempt, base, max) <= max);
        }
    }

    #[test]
    fn backoff_delay_grows_with_attempts() {
        let base = Duration::from_secs(4);
        let max = Duration::from_secs(3600);
        // Jitter halves the nominal delay at minimum; attempt 4 lower bound
        // (16s) still exceeds attempt 1 upper bound (4s).
        let first = backoff_delay(1, base, max);
        let fourth = backoff_delay(4, base, max);
        assert!(fourth >= first);
    }

    #[test]
    fn log_publisher_accepts_events() {
        let event = OutboxEvent {
            topic: "account_created".to_string(),
            key: "k".to_string(),
            payload_json: "{}".to_string(),
        };
        assert!(LogPublisher.publish(&event).is_ok());
    }
}
