use axum::http::HeaderMap;
use std::future::Future;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};

pub mod accounts;
pub mod health;
pub mod sessions;
pub mod types;

pub const SESSION_ID_HEADER: &str = "x-session-id";
pub const MACHINE_ID_HEADER: &str = "x-machine-id";
pub const ACCOUNT_ID_HEADER: &str = "x-account-id";

/// Session and machine ids carried on every authenticated request.
#[derive(Debug, Clone)]
pub struct AuthMeta {
    pub session_id: Uuid,
    pub machine_id: String,
}

/// Pull the session and machine ids out of the request headers. Missing or
/// malformed values are `UNAUTHENTICATED`, never a bad-request, so an
/// unauthenticated probe gets one uniform answer.
pub fn auth_meta(headers: &HeaderMap) -> ServiceResult<AuthMeta> {
    let session_id = headers
        .get(SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ServiceError::unauthenticated("no session id provided"))?;
    let session_id = session_id
        .parse::<Uuid>()
        .map_err(|_| ServiceError::unauthenticated("invalid session or machine id"))?;

    let machine_id = headers
        .get(MACHINE_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ServiceError::unauthenticated("no machine id provided"))?;

    Ok(AuthMeta {
        session_id,
        machine_id: machine_id.to_string(),
    })
}

/// Bound a handler body by the per-request deadline; an elapsed timer
/// surfaces as `DEADLINE_EXCEEDED`.
pub async fn with_deadline<F, T>(deadline: Duration, fut: F) -> ServiceResult<T>
where
    F: Future<Output = ServiceResult<T>>,
{
    tokio::time::timeout(deadline, fut).await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use crate::error::Kind;

    fn headers(session: Option<&str>, machine: Option<&str>) -> HeaderMap {
        let mut map = HeaderMap::new();
        if let Some(session) = session {
            map.insert(SESSION_ID_HEADER, HeaderValue::from_str(session).unwrap());
        }
        if let Some(machine) = machine {
            map.insert(MACHINE_ID_HEADER, HeaderValue::from_str(machine).unwrap());
        }
        map
    }

    #[test]
    fn auth_meta_parses_valid_headers() {
        let session_id = Uuid::new_v4();
        let map = headers(Some(&session_id.to_string()), Some("M1"));
        let meta = auth_meta(&map).expect("meta");
        assert_eq!(meta.session_id, session_id);
        assert_eq!(meta.machine_id, "M1");
    }

    #[test]
    fn auth_meta_rejects_missing_session_id() {
        let err = auth_meta(&headers(None, Some("M1"))).expect_err("must fail");
        assert_eq!(err.kind, Kind::Unauthenticated);
        assert_eq!(err.message, "no session id provided");
    }

    #[test]
    fn auth_meta_rejects_empty_machine_id() {
        let session_id = Uuid::new_v4().to_string();
        let err = auth_meta(&headers(Some(&session_id), Some(""))).expect_err("must fail");
        assert_eq!(err.kind, Kind::Unauthenticated);
        assert_eq!(err.message, "no machine id provided");
    }

    #[test]
    fn auth_meta_rejects_malformed_session_id() {
        let err = auth_meta(&headers(Some("not-a-uuid"), Some("M1"))).expect_err("must fail");
        assert_eq!(err.kind, Kind::Unauthenticated);
    }

    #[tokio::test]
    async fn with_deadline_times_out() {
        let err = with_deadline(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .expect_err("must time out");
        assert_eq!(err.kind, Kind::DeadlineExceeded);
    }

    #[tokio::test]
    async fn with_deadline_passes_through_results() {
        let value = with_deadline(Duration::from_secs(1), async { Ok(42) })
            .await
            .expect("value");
        assert_eq!(value, 42);
    }
}
