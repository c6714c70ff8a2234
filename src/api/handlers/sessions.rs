//! Session handlers: sign-in, session introspection, and termination.

use axum::{
    extract::Extension,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use tracing::{error, instrument};

use crate::api::error::ApiError;
use crate::api::handlers::{auth_meta, with_deadline, ACCOUNT_ID_HEADER};
use crate::api::AppContext;
use crate::error::ServiceError;

use super::types::{SessionsResponse, SignInRequest, SignInResponse, TerminateSessionsRequest};

#[instrument(skip(ctx, headers, payload))]
pub async fn sign_in(
    Extension(ctx): Extension<Arc<AppContext>>,
    headers: HeaderMap,
    Json(payload): Json<SignInRequest>,
) -> Result<Json<SignInResponse>, ApiError> {
    let machine_id = headers
        .get(super::MACHINE_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ServiceError::unauthenticated("no machine id provided"))
        .map_err(ApiError::from)?;

    let session_id = with_deadline(ctx.request_timeout, async {
        ctx.service
            .sign_in(
                payload.email.trim(),
                &payload.password,
                &payload.client_ip,
                machine_id,
            )
            .await
    })
    .await?;
    Ok(Json(SignInResponse { session_id }))
}

/// Resolve the caller's account id, returned in the `X-Account-Id` response
/// header.
#[instrument(skip(ctx, headers))]
pub async fn get_account_id(
    Extension(ctx): Extension<Arc<AppContext>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let meta = auth_meta(&headers)?;
    let account_id = with_deadline(ctx.request_timeout, async {
        ctx.service
            .get_account_id(meta.session_id, &meta.machine_id)
            .await
    })
    .await?;

    let mut response = StatusCode::OK.into_response();
    match HeaderValue::from_str(&account_id.to_string()) {
        Ok(value) => {
            response
                .headers_mut()
                .insert(HeaderName::from_static(ACCOUNT_ID_HEADER), value);
        }
        Err(err) => {
            error!("failed to build account id header: {err}");
            return Err(ApiError(ServiceError::internal(
                "failed to build account id header",
            )));
        }
    }
    Ok(response)
}

#[instrument(skip(ctx, headers))]
pub async fn logout(
    Extension(ctx): Extension<Arc<AppContext>>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let meta = auth_meta(&headers)?;
    with_deadline(ctx.request_timeout, async {
        ctx.service.logout(meta.session_id, &meta.machine_id).await
    })
    .await?;
    Ok(StatusCode::OK)
}

#[instrument(skip(ctx, headers))]
pub async fn get_all_sessions(
    Extension(ctx): Extension<Arc<AppContext>>,
    headers: HeaderMap,
) -> Result<Json<SessionsResponse>, ApiError> {
    let meta = auth_meta(&headers)?;
    let sessions = with_deadline(ctx.request_timeout, async {
        ctx.service
            .get_all_sessions(meta.session_id, &meta.machine_id)
            .await
    })
    .await?;
    Ok(Json(SessionsResponse::from(sessions)))
}

#[instrument(skip(ctx, headers, payload))]
pub async fn terminate_sessions(
    Extension(ctx): Extension<Arc<AppContext>>,
    headers: HeaderMap,
    Json(payload): Json<TerminateSessionsRequest>,
) -> Result<StatusCode, ApiError> {
    let meta = auth_meta(&headers)?;
    with_deadline(ctx.request_timeout, async {
        ctx.service
            .terminate_sessions(
                meta.session_id,
                &meta.machine_id,
                &payload.sessions_to_terminate,
            )
            .await
    })
    .await?;
    Ok(StatusCode::OK)
}
