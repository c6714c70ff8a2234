use axum::{
    extract::Extension,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json},
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error};

use crate::api::{AppContext, GIT_COMMIT_HASH};

#[derive(Serialize, Debug)]
pub struct Health {
    commit: String,
    name: String,
    version: String,
    accounts_store: String,
    registration_store: String,
    sessions_store: String,
}

const fn status_str(ok: bool) -> &'static str {
    if ok {
        "ok"
    } else {
        "error"
    }
}

// axum handler for health
pub async fn health(Extension(ctx): Extension<Arc<AppContext>>) -> impl IntoResponse {
    let accounts = ctx.service.ping_accounts().await;
    let registration = ctx.service.ping_registration().await;
    let sessions = ctx.service.ping_sessions().await;

    for (store, result) in [
        ("accounts", &accounts),
        ("registration", &registration),
        ("sessions", &sessions),
    ] {
        match result {
            Ok(()) => debug!("{store} store is healthy"),
            Err(err) => error!("{store} store is unhealthy: {err}"),
        }
    }

    let health = Health {
        commit: GIT_COMMIT_HASH.to_string(),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        accounts_store: status_str(accounts.is_ok()).to_string(),
        registration_store: status_str(registration.is_ok()).to_string(),
        sessions_store: status_str(sessions.is_ok()).to_string(),
    };

    let short_hash = if health.commit.len() > 7 {
        &health.commit[0..7]
    } else {
        ""
    };

    let mut headers = HeaderMap::new();
    if let Ok(value) =
        format!("{}:{}:{}", health.name, health.version, short_hash).parse::<HeaderValue>()
    {
        headers.insert("X-App", value);
    }

    let is_healthy = accounts.is_ok() && registration.is_ok() && sessions.is_ok();
    let status = if is_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, headers, Json(health))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_str_maps_bool() {
        assert_eq!(status_str(true), "ok");
        assert_eq!(status_str(false), "error");
    }
}
