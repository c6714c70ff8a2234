//! Account lifecycle handlers: registration, verification, password change,
//! and deletion.

use axum::{
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::Json,
};
use std::sync::Arc;
use tracing::instrument;

use crate::api::error::ApiError;
use crate::api::handlers::{auth_meta, with_deadline};
use crate::api::AppContext;

use super::types::{
    ChangePasswordRequest, CreateAccountRequest, TokenRequest, VerifyAccountRequest,
};

#[instrument(skip(ctx, payload))]
pub async fn create_account(
    Extension(ctx): Extension<Arc<AppContext>>,
    Json(payload): Json<CreateAccountRequest>,
) -> Result<StatusCode, ApiError> {
    with_deadline(ctx.request_timeout, async {
        ctx.service
            .create_account(
                payload.email.trim(),
                payload.username.trim(),
                &payload.password,
                payload.repeat_password.as_deref(),
            )
            .await
    })
    .await?;
    Ok(StatusCode::CREATED)
}

#[instrument(skip(ctx, payload))]
pub async fn request_verification_token(
    Extension(ctx): Extension<Arc<AppContext>>,
    Json(payload): Json<TokenRequest>,
) -> Result<StatusCode, ApiError> {
    with_deadline(ctx.request_timeout, async {
        ctx.service
            .request_account_verification_token(payload.email.trim(), &payload.url)
            .await
    })
    .await?;
    Ok(StatusCode::ACCEPTED)
}

#[instrument(skip(ctx, payload))]
pub async fn verify_account(
    Extension(ctx): Extension<Arc<AppContext>>,
    Json(payload): Json<VerifyAccountRequest>,
) -> Result<StatusCode, ApiError> {
    with_deadline(ctx.request_timeout, async {
        ctx.service.verify_account(&payload.verification_token).await
    })
    .await?;
    Ok(StatusCode::OK)
}

#[instrument(skip(ctx, payload))]
pub async fn request_change_password_token(
    Extension(ctx): Extension<Arc<AppContext>>,
    Json(payload): Json<TokenRequest>,
) -> Result<StatusCode, ApiError> {
    with_deadline(ctx.request_timeout, async {
        ctx.service
            .request_change_password_token(payload.email.trim(), &payload.url)
            .await
    })
    .await?;
    Ok(StatusCode::ACCEPTED)
}

#[instrument(skip(ctx, payload))]
pub async fn change_password(
    Extension(ctx): Extension<Arc<AppContext>>,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<StatusCode, ApiError> {
    with_deadline(ctx.request_timeout, async {
        ctx.service
            .change_password(&payload.change_password_token, &payload.new_password)
            .await
    })
    .await?;
    Ok(StatusCode::OK)
}

#[instrument(skip(ctx, headers))]
pub async fn delete_account(
    Extension(ctx): Extension<Arc<AppContext>>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let meta = auth_meta(&headers)?;
    with_deadline(ctx.request_timeout, async {
        ctx.service
            .delete_account(meta.session_id, &meta.machine_id)
            .await
    })
    .await?;
    Ok(StatusCode::OK)
}
