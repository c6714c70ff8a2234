//! Session storage over two cross-indexed structures in one redis keyspace:
//! a session-by-id map and a per-account session-id set.
//!
//! Session values TTL-evict independently of the per-account set, so the set
//! is a superset of the live sessions. Every reader that enumerates the set
//! probes the referenced values and removes dangling ids in-line before
//! returning; that lazy reconciliation keeps the bi-map eventually
//! consistent without a tombstone log or a distributed lock.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, AsyncCommands};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};
use crate::models::{Session, SessionInfo};

#[derive(Clone)]
pub struct SessionStore {
    conn: ConnectionManager,
}

fn account_sessions_key(account_id: Uuid) -> String {
    format!("account_{account_id}")
}

fn ttl_seconds(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)
}

/// Zip set members with their probed values, separating live sessions from
/// dangling references whose value has TTL-evicted.
fn split_live(ids: Vec<String>, values: Vec<Option<String>>) -> (Vec<(String, String)>, Vec<String>) {
    let mut live = Vec::with_capacity(ids.len());
    let mut dangling = Vec::new();
    for (id, value) in ids.into_iter().zip(values) {
        match value {
            Some(value) => live.push((id, value)),
            None => dangling.push(id),
        }
    }
    (live, dangling)
}

impl SessionStore {
    /// Connect to the sessions store and verify the connection.
    ///
    /// # Errors
    /// Returns an error when the endpoint is unreachable.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid sessions store URL")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to sessions store")?;
        debug!("Connected to sessions store");
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

    /// Write the session value, add its id to the per-account set, and
    /// refresh the set TTL. The three sub-writes go out as one pipelined
    /// batch; each is idempotent, so a failed batch is repaired by the next
    /// reconciling read.
    pub async fn set_session(&self, session: &Session, ttl: Duration) -> ServiceResult<()> {
        let payload = serde_json::to_string(session)?;
        let set_key = account_sessions_key(session.account_id);
        let session_key = session.session_id.to_string();
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.set_ex(&session_key, payload, ttl.as_secs())
            .ignore()
            .sadd(&set_key, &session_key)
            .ignore()
            .expire(&set_key, ttl_seconds(ttl))
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    /// # Errors
    /// Returns `NOT_FOUND` when the session is absent or TTL-evicted.
    pub async fn get_session(&self, session_id: Uuid) -> ServiceResult<Session> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(session_id.to_string()).await?;
        let payload = payload.ok_or_else(|| ServiceError::not_found("session not found"))?;
        Ok(serde_json::from_str(&payload)?)
    }

    /// Reconciling read of the per-account set: probe every referenced value
    /// and drop dangling ids before returning the live ones.
    pub async fn get_session_ids(&self, account_id: Uuid) -> ServiceResult<Vec<Uuid>> {
        let sessions = self.live_sessions(account_id).await?;
        Ok(sessions.into_iter().map(|s| s.session_id).collect())
    }

    /// Reconciling read returning the `SessionInfo` projection keyed by
    /// session id.
    pub async fn get_sessions_for_account(
        &self,
        account_id: Uuid,
    ) -> ServiceResult<HashMap<Uuid, SessionInfo>> {
        let sessions = self.live_sessions(account_id).await?;
        Ok(sessions
            .into_iter()
            .map(|s| (s.session_id, SessionInfo::from(s)))
            .collect())
    }

    /// Overwrite the session with a refreshed `last_activity` and TTL; the
    /// per-account set TTL is refreshed in the same batch.
    pub async fn update_last_activity(
        &self,
        mut session: Session,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> ServiceResult<()> {
        session.last_activity = now;
        self.set_session(&session, ttl).await
    }

    /// Terminate the requested sessions that are live and owned by
    /// `account_id`. Ids that are not in the reconciled per-account set are
    /// dropped silently, so repeated termination is a no-op.
    pub async fn terminate_sessions(
        &self,
        session_ids: &[Uuid],
        account_id: Uuid,
    ) -> ServiceResult<()> {
        let live = self.get_session_ids(account_id).await?;
        let to_delete: Vec<String> = session_ids
            .iter()
            .filter(|id| live.contains(id))
            .map(Uuid::to_string)
            .collect();
        if to_delete.is_empty() {
            return Ok(());
        }

        let set_key = account_sessions_key(account_id);
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.del(&to_delete).ignore().srem(&set_key, &to_delete).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    /// Delete every session referenced by the per-account set, then the set
    /// itself.
    ///
    /// # Errors
    /// Returns `NOT_FOUND` when the set is already gone, which the delete
    /// cascade treats as terminal success.
    pub async fn terminate_all_sessions(&self, account_id: Uuid) -> ServiceResult<()> {
        let set_key = account_sessions_key(account_id);
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(&set_key).await?;
        if ids.is_empty() {
            return Err(ServiceError::not_found("no sessions for account"));
        }

        let mut pipe = redis::pipe();
        pipe.del(&ids).ignore().del(&set_key).ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    /// Enumerate the per-account set, probe the referenced values, prune
    /// dangling ids, and parse the surviving sessions.
    async fn live_sessions(&self, account_id: Uuid) -> ServiceResult<Vec<Session>> {
        let set_key = account_sessions_key(account_id);
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(&set_key).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let values: Vec<Option<String>> = conn.mget(&ids).await?;
        let (live, dangling) = split_live(ids, values);
        if !dangling.is_empty() {
            let _: () = conn.srem(&set_key, &dangling).await?;
        }

        let mut sessions = Vec::with_capacity(live.len());
        for (_, payload) in live {
            sessions.push(serde_json::from_str(&payload)?);
        }
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_sessions_key_is_prefixed() {
        let id = Uuid::nil();
        assert_eq!(
            account_sessions_key(id),
            "account_00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn split_live_separates_dangling_ids() {
        let ids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let values = vec![Some("va".to_string()), None, Some("vc".to_string())];
        let (live, dangling) = split_live(ids, values);
        assert_eq!(
            live,
            vec![
                ("a".to_string(), "va".to_string()),
                ("c".to_string(), "vc".to_string())
            ]
        );
        assert_eq!(dangling, vec!["b".to_string()]);
    }

    #[test]
    fn split_live_handles_all_live_and_all_dangling() {
        let (live, dangling) = split_live(vec!["a".to_string()], vec![Some("v".to_string())]);
        assert_eq!(live.len(), 1);
        assert!(dangling.is_empty());

        let (live, dangling) = split_live(vec!["a".to_string()], vec![None]);
        assert!(live.is_empty());
        assert_eq!(dangling, vec!["a".to_string()]);
    }

    #[test]
    fn ttl_seconds_saturates() {
        assert_eq!(ttl_seconds(Duration::from_secs(60)), 60);
        assert_eq!(ttl_seconds(Duration::from_secs(u64::MAX)), i64::MAX);
    }
}
