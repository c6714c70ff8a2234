use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Request},
    routing::{get, post},
    Extension, Router,
};
use secrecy::SecretString;
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    request_id::PropagateRequestIdLayer, set_header::SetRequestHeaderLayer, trace::TraceLayer,
};
use tracing::{info, info_span, Span};
use ulid::Ulid;

use crate::crypto::{PasswordHasher, TokenCodec};
use crate::events::{spawn_publisher_worker, EventEmitter, LogPublisher, PublisherConfig};
use crate::repository::{AccountsRepository, RegistrationStore, SessionStore};
use crate::service::{IdentityConfig, IdentityService};

pub(crate) mod error;
pub(crate) mod handlers;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub static APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

/// Everything the server needs to come up; built by the CLI from flags and
/// environment.
pub struct ServerConfig {
    pub port: u16,
    pub dsn: String,
    pub registration_store_url: String,
    pub sessions_store_url: String,
    pub bcrypt_cost: u32,
    pub verify_token_secret: SecretString,
    pub verify_token_ttl: Duration,
    pub change_password_token_secret: SecretString,
    pub change_password_token_ttl: Duration,
    pub request_timeout: Duration,
    pub identity: IdentityConfig,
    pub publisher: PublisherConfig,
}

/// Shared handler context.
pub struct AppContext {
    pub service: IdentityService,
    pub request_timeout: Duration,
}

#[must_use]
pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route(
            "/v1/accounts",
            post(handlers::accounts::create_account).delete(handlers::accounts::delete_account),
        )
        .route(
            "/v1/accounts/verification-token",
            post(handlers::accounts::request_verification_token),
        )
        .route("/v1/accounts/verify", post(handlers::accounts::verify_account))
        .route(
            "/v1/accounts/password-token",
            post(handlers::accounts::request_change_password_token),
        )
        .route("/v1/accounts/password", post(handlers::accounts::change_password))
        .route(
            "/v1/sessions",
            post(handlers::sessions::sign_in).get(handlers::sessions::get_all_sessions),
        )
        .route(
            "/v1/sessions/account-id",
            get(handlers::sessions::get_account_id),
        )
        .route("/v1/sessions/logout", post(handlers::sessions::logout))
        .route(
            "/v1/sessions/terminate",
            post(handlers::sessions::terminate_sessions),
        )
        .route("/health", get(handlers::health::health))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(Extension(ctx)),
        )
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(config: ServerConfig) -> Result<()> {
    // Connect to database
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(&config.dsn)
        .await
        .context("Failed to connect to database")?;

    sqlx::migrate!()
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;

    let registration = RegistrationStore::connect(&config.registration_store_url).await?;
    let sessions = SessionStore::connect(&config.sessions_store_url).await?;

    // Background worker drains events_outbox (DB-backed queue) and retries
    // failures with exponential backoff.
    spawn_publisher_worker(pool.clone(), Arc::new(LogPublisher), config.publisher);

    let service = IdentityService::new(
        AccountsRepository::new(pool.clone()),
        registration,
        sessions,
        EventEmitter::new(pool),
        PasswordHasher::new(config.bcrypt_cost),
        TokenCodec::new(config.verify_token_secret, config.verify_token_ttl),
        TokenCodec::new(
            config.change_password_token_secret,
            config.change_password_token_ttl,
        ),
        config.identity,
    );
    let ctx = Arc::new(AppContext {
        service,
        request_timeout: config.request_timeout,
    });

    let app = router(ctx);

    let listener = TcpListener::bind(format!("::0:{}", config.port)).await?;

    info!("Listening on [::]:{}", config.port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}
