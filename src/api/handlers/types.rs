//! Request and response bodies for the HTTP surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::SessionInfo;

#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    pub email: String,
    pub username: String,
    pub password: String,
    pub repeat_password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub email: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyAccountRequest {
    pub verification_token: String,
}

#[derive(Debug, Deserialize)]
pub struct ChangePasswordRequest {
    pub change_password_token: String,
    pub new_password: String,
}

#[derive(Debug, Deserialize)]
pub struct SignInRequest {
    pub email: String,
    pub password: String,
    pub client_ip: String,
}

#[derive(Debug, Serialize)]
pub struct SignInResponse {
    pub session_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct TerminateSessionsRequest {
    pub sessions_to_terminate: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct SessionEntry {
    pub client_ip: String,
    pub machine_id: String,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub sessions: HashMap<Uuid, SessionEntry>,
}

impl From<HashMap<Uuid, SessionInfo>> for SessionsResponse {
    fn from(sessions: HashMap<Uuid, SessionInfo>) -> Self {
        Self {
            sessions: sessions
                .into_iter()
                .map(|(id, info)| {
                    (
                        id,
                        SessionEntry {
                            client_ip: info.client_ip,
                            machine_id: info.machine_id,
                            last_activity: info.last_activity,
                        },
                    )
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_response_keys_by_session_id() {
        let id = Uuid::new_v4();
        let mut sessions = HashMap::new();
        sessions.insert(
            id,
            SessionInfo {
                client_ip: "192.0.2.1".to_string(),
                machine_id: "M1".to_string(),
                last_activity: Utc::now(),
            },
        );
        let response = SessionsResponse::from(sessions);
        let value = serde_json::to_value(&response).expect("serialize");
        assert_eq!(value["sessions"][id.to_string()]["machine_id"], "M1");
    }

    #[test]
    fn create_account_request_allows_missing_repeat_password() {
        let body = r#"{"email":"a@b.c","username":"alice","password":"secret1"}"#;
        let request: CreateAccountRequest = serde_json::from_str(body).expect("deserialize");
        assert!(request.repeat_password.is_none());
    }
}
