//! Domain records shared by the stores, the coordinator, and the API layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An activated account row. The only identity state that backs
/// authentication.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Account {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub registration_date: DateTime<Utc>,
}

/// Input for the activation transition; the id is assigned by the store.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub email: String,
    pub password_hash: String,
    pub registration_date: DateTime<Utc>,
}

/// Credential held in the pending-registration store until the first
/// successful verification, or until the TTL reclaims it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingRegistration {
    pub username: String,
    pub password_hash: String,
}

/// A live authenticated session. The session id is the sole client-held
/// access credential; the machine id must match on every authenticated call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub session_id: Uuid,
    pub account_id: Uuid,
    pub machine_id: String,
    pub client_ip: String,
    pub last_activity: DateTime<Utc>,
}

/// The subset of a session returned by `GetAllSessions`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionInfo {
    pub client_ip: String,
    pub machine_id: String,
    pub last_activity: DateTime<Utc>,
}

impl From<Session> for SessionInfo {
    fn from(session: Session) -> Self {
        Self {
            client_ip: session.client_ip,
            machine_id: session.machine_id,
            last_activity: session.last_activity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_round_trips_through_json() {
        let session = Session {
            session_id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            machine_id: "M1".to_string(),
            client_ip: "192.0.2.1".to_string(),
            last_activity: Utc::now(),
        };
        let encoded = serde_json::to_string(&session).expect("serialize");
        let decoded: Session = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(decoded, session);
    }

    #[test]
    fn session_info_projects_session_fields() {
        let session = Session {
            session_id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            machine_id: "M2".to_string(),
            client_ip: "2001:db8::1".to_string(),
            last_activity: Utc::now(),
        };
        let info = SessionInfo::from(session.clone());
        assert_eq!(info.machine_id, session.machine_id);
        assert_eq!(info.client_ip, session.client_ip);
        assert_eq!(info.last_activity, session.last_activity);
    }
}
