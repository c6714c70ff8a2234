//! Identity coordinator: orders the stores, the hasher, the token codecs,
//! and the event emitter into the account and session operations.
//!
//! Account-lifecycle transitions (verify, delete) write their domain event
//! on the same open transaction as the row mutation and commit both at once,
//! so the event stream never misses a committed transition. Activity refresh
//! and the post-delete session cascade run as detached tasks; their failures
//! are logged, never surfaced to the caller.

use chrono::Utc;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::crypto::{PasswordHasher, TokenCodec};
use crate::error::{Kind, ServiceError, ServiceResult};
use crate::events::{AccountCreated, AccountDeleted, EventEmitter, TokenDelivery};
use crate::models::{NewAccount, PendingRegistration, Session, SessionInfo};
use crate::repository::{AccountsRepository, RegistrationStore, SessionStore};

mod validate;

/// Tunables for the coordinator; see the CLI for defaults and env mapping.
#[derive(Clone, Copy, Debug)]
pub struct IdentityConfig {
    /// How long an unverified registration is held before the store reclaims
    /// it.
    pub nonactivated_account_ttl: Duration,
    /// Session TTL, refreshed on every authenticated read.
    pub sessions_ttl: Duration,
    /// Attempts for the post-delete session termination cascade.
    pub terminate_retries: u32,
    /// Pause between cascade attempts.
    pub terminate_retry_sleep: Duration,
}

impl IdentityConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nonactivated_account_ttl: Duration::from_secs(86_400),
            sessions_ttl: Duration::from_secs(1_209_600),
            terminate_retries: 3,
            terminate_retry_sleep: Duration::from_millis(500),
        }
    }

    #[must_use]
    pub fn with_nonactivated_account_ttl(mut self, ttl: Duration) -> Self {
        self.nonactivated_account_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_sessions_ttl(mut self, ttl: Duration) -> Self {
        self.sessions_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_terminate_retries(mut self, retries: u32) -> Self {
        self.terminate_retries = retries;
        self
    }

    #[must_use]
    pub fn with_terminate_retry_sleep(mut self, sleep: Duration) -> Self {
        self.terminate_retry_sleep = sleep;
        self
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self::new()
    }
}

const SESSION_REJECTED: &str = "invalid session or machine id";

/// The only authorization predicate in the system: the session must exist
/// and its machine id must match the caller's. Absent sessions and machine
/// mismatches share one message so a probe cannot tell which check failed.
fn authenticate(lookup: ServiceResult<Session>, machine_id: &str) -> ServiceResult<Session> {
    let session = lookup.map_err(|err| match err.kind {
        Kind::NotFound => ServiceError::unauthenticated(SESSION_REJECTED),
        _ => err,
    })?;
    if session.machine_id != machine_id {
        return Err(ServiceError::unauthenticated(SESSION_REJECTED));
    }
    Ok(session)
}

/// Judge a termination request for an already-authenticated session; taking
/// the checked session keeps the target-list validation behind the
/// authorization predicate. Returns whether the caller's own session should
/// get an activity refresh.
fn termination_plan(session: &Session, targets: &[Uuid]) -> ServiceResult<bool> {
    if targets.is_empty() {
        return Err(ServiceError::invalid_argument("no sessions to terminate"));
    }
    Ok(!targets.contains(&session.session_id))
}

/// The delivery callback must be an absolute http(s) URL; the token is
/// appended to it by the delivery consumer.
fn valid_callback_url(callback_url: &str) -> ServiceResult<()> {
    let parsed = Url::parse(callback_url)
        .map_err(|_| ServiceError::invalid_argument("invalid callback url"))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(ServiceError::invalid_argument("invalid callback url"));
    }
    Ok(())
}

pub struct IdentityService {
    accounts: AccountsRepository,
    registration: RegistrationStore,
    sessions: SessionStore,
    emitter: EventEmitter,
    hasher: PasswordHasher,
    verify_tokens: TokenCodec,
    change_password_tokens: TokenCodec,
    config: IdentityConfig,
}

impl IdentityService {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        accounts: AccountsRepository,
        registration: RegistrationStore,
        sessions: SessionStore,
        emitter: EventEmitter,
        hasher: PasswordHasher,
        verify_tokens: TokenCodec,
        change_password_tokens: TokenCodec,
        config: IdentityConfig,
    ) -> Self {
        Self {
            accounts,
            registration,
            sessions,
            emitter,
            hasher,
            verify_tokens,
            change_password_tokens,
            config,
        }
    }

    pub async fn ping_accounts(&self) -> ServiceResult<()> {
        self.accounts.ping().await
    }

    pub async fn ping_registration(&self) -> ServiceResult<()> {
        self.registration.ping().await
    }

    pub async fn ping_sessions(&self) -> ServiceResult<()> {
        self.sessions.ping().await
    }

    /// Stage a registration: validate, reject emails already claimed by an
    /// activated account or a pending registration, hash the password, and
    /// hold the credential until verification or TTL eviction.
    pub async fn create_account(
        &self,
        email: &str,
        username: &str,
        password: &str,
        repeat_password: Option<&str>,
    ) -> ServiceResult<()> {
        validate::validate_signup(email, username, password, repeat_password)?;

        if self.accounts.exists_by_email(email).await? {
            return Err(ServiceError::conflict(
                "account with this email already exists",
            ));
        }
        if self.registration.exists(email).await? {
            return Err(ServiceError::conflict(
                "registration for this email is already pending",
            ));
        }

        let password_hash = self.hasher.hash(password)?;
        let pending = PendingRegistration {
            username: username.to_string(),
            password_hash,
        };
        self.registration
            .set(email, &pending, self.config.nonactivated_account_ttl)
            .await
    }

    /// Issue a verification token for a pending registration and hand the
    /// delivery request to the event stream. Delivery is fire-and-forget;
    /// the caller only learns whether the token was issued.
    pub async fn request_account_verification_token(
        &self,
        email: &str,
        callback_url: &str,
    ) -> ServiceResult<()> {
        validate::validate_email(email)?;
        valid_callback_url(callback_url)?;

        if self.accounts.exists_by_email(email).await? {
            return Err(ServiceError::invalid_argument("account already activated"));
        }
        if !self.registration.exists(email).await? {
            return Err(ServiceError::not_found("registration not found or expired"));
        }

        let token = self.verify_tokens.issue(email)?;
        let event = TokenDelivery {
            email: email.to_string(),
            token,
            callback_url: callback_url.to_string(),
            callback_url_ttl: self.verify_tokens.ttl().as_secs(),
        };
        let emitter = self.emitter.clone();
        tokio::spawn(async move {
            if let Err(err) = emitter.verify_email_requested(&event).await {
                warn!("failed to enqueue verification token delivery: {err}");
            }
        });
        Ok(())
    }

    /// Activate the account named by a verification token. The
    /// `account_created` event rides the activation transaction and commits
    /// with it; the pending registration is deleted best-effort afterwards.
    pub async fn verify_account(&self, token: &str) -> ServiceResult<()> {
        let email = self.verify_tokens.parse(token)?;
        let pending = self.registration.get(&email).await?;

        let account = NewAccount {
            email: email.clone(),
            password_hash: pending.password_hash,
            registration_date: Utc::now(),
        };
        let (mut tx, id) = self.accounts.create_account(&account).await?;

        let event = AccountCreated {
            id,
            email: email.clone(),
            username: pending.username,
            registration_date: account.registration_date,
        };
        if let Err(err) = self.emitter.account_created(&mut tx, &event).await {
            // Dropping the handle rolls the insert back.
            drop(tx);
            return Err(err);
        }
        tx.commit().await?;

        if let Err(err) = self.registration.delete(&email).await {
            warn!("failed to delete pending registration for activated account: {err}");
        }
        Ok(())
    }

    /// Authenticate and open a session. Unknown emails surface as
    /// `NOT_FOUND`; a wrong password as `INVALID_ARGUMENT` with a message
    /// that does not say which part failed.
    pub async fn sign_in(
        &self,
        email: &str,
        password: &str,
        client_ip: &str,
        machine_id: &str,
    ) -> ServiceResult<Uuid> {
        client_ip
            .parse::<IpAddr>()
            .map_err(|_| ServiceError::invalid_argument("invalid client ip address"))?;

        let account = self.accounts.get_by_email(email).await?;
        if !self.hasher.verify(password, &account.password_hash)? {
            return Err(ServiceError::invalid_argument("invalid login or password"));
        }

        let session = Session {
            session_id: Uuid::new_v4(),
            account_id: account.id,
            machine_id: machine_id.to_string(),
            client_ip: client_ip.to_string(),
            last_activity: Utc::now(),
        };
        self.sessions
            .set_session(&session, self.config.sessions_ttl)
            .await?;
        Ok(session.session_id)
    }

    /// Resolve the account id behind a session and refresh its activity in
    /// the background.
    pub async fn get_account_id(&self, session_id: Uuid, machine_id: &str) -> ServiceResult<Uuid> {
        let session = self.check_session(session_id, machine_id).await?;
        let account_id = session.account_id;
        self.spawn_activity_refresh(session);
        Ok(account_id)
    }

    /// Terminate the calling session. Idempotent: a session that already
    /// expired between the check and the delete still logs out cleanly.
    pub async fn logout(&self, session_id: Uuid, machine_id: &str) -> ServiceResult<()> {
        let session = self.check_session(session_id, machine_id).await?;
        self.sessions
            .terminate_sessions(&[session_id], session.account_id)
            .await
    }

    /// Issue a change-password token for an activated account and hand the
    /// delivery request to the event stream.
    pub async fn request_change_password_token(
        &self,
        email: &str,
        callback_url: &str,
    ) -> ServiceResult<()> {
        validate::validate_email(email)?;
        valid_callback_url(callback_url)?;

        if !self.accounts.exists_by_email(email).await? {
            return Err(ServiceError::not_found(
                "account with this email does not exist",
            ));
        }

        let token = self.change_password_tokens.issue(email)?;
        let event = TokenDelivery {
            email: email.to_string(),
            token,
            callback_url: callback_url.to_string(),
            callback_url_ttl: self.change_password_tokens.ttl().as_secs(),
        };
        let emitter = self.emitter.clone();
        tokio::spawn(async move {
            if let Err(err) = emitter.change_password_requested(&event).await {
                warn!("failed to enqueue change-password token delivery: {err}");
            }
        });
        Ok(())
    }

    /// Replace the password for the account named by a change-password
    /// token. Existing sessions stay live.
    pub async fn change_password(&self, token: &str, new_password: &str) -> ServiceResult<()> {
        validate::validate_password(new_password)?;
        let email = self.change_password_tokens.parse(token)?;

        if !self.accounts.exists_by_email(&email).await? {
            return Err(ServiceError::not_found(
                "account with this email does not exist",
            ));
        }

        let new_hash = self.hasher.hash(new_password)?;
        self.accounts.change_password(&email, &new_hash).await
    }

    /// Enumerate the caller's live sessions and refresh the caller's own
    /// activity in the background.
    pub async fn get_all_sessions(
        &self,
        session_id: Uuid,
        machine_id: &str,
    ) -> ServiceResult<HashMap<Uuid, SessionInfo>> {
        let session = self.check_session(session_id, machine_id).await?;
        let account_id = session.account_id;
        self.spawn_activity_refresh(session);
        self.sessions.get_sessions_for_account(account_id).await
    }

    /// Terminate a set of the caller's sessions. An empty target list is
    /// `INVALID_ARGUMENT`, judged only after the caller authenticates. Ids
    /// that are not live sessions of the caller are dropped silently; the
    /// caller's own activity is refreshed only when its session is not among
    /// the targets.
    pub async fn terminate_sessions(
        &self,
        session_id: Uuid,
        machine_id: &str,
        targets: &[Uuid],
    ) -> ServiceResult<()> {
        let session = self.check_session(session_id, machine_id).await?;
        let account_id = session.account_id;
        if termination_plan(&session, targets)? {
            self.spawn_activity_refresh(session);
        }
        self.sessions.terminate_sessions(targets, account_id).await
    }

    /// Delete the caller's account. The `account_deleted` event rides the
    /// delete transaction and commits with it; the caller's sessions are
    /// then terminated by a detached cascade with bounded retries.
    pub async fn delete_account(&self, session_id: Uuid, machine_id: &str) -> ServiceResult<()> {
        let session = self.check_session(session_id, machine_id).await?;
        let account_id = session.account_id;

        let email = self.accounts.get_email(account_id).await?;
        let mut tx = self.accounts.delete_account(account_id).await?;

        let event = AccountDeleted { email, account_id };
        if let Err(err) = self.emitter.account_deleted(&mut tx, &event).await {
            drop(tx);
            return Err(err);
        }
        tx.commit().await?;

        self.spawn_terminate_cascade(account_id);
        Ok(())
    }

    /// Load the session and run it through the authorization predicate.
    async fn check_session(&self, session_id: Uuid, machine_id: &str) -> ServiceResult<Session> {
        authenticate(self.sessions.get_session(session_id).await, machine_id)
    }

    fn spawn_activity_refresh(&self, session: Session) {
        let sessions = self.sessions.clone();
        let ttl = self.config.sessions_ttl;
        tokio::spawn(async move {
            let session_id = session.session_id;
            if let Err(err) = sessions.update_last_activity(session, Utc::now(), ttl).await {
                warn!(session_id = %session_id, "failed to refresh session activity: {err}");
            }
        });
    }

    /// Detached cascade: terminate every session of a deleted account.
    /// Stops on success or on `NOT_FOUND` (nothing left to terminate), and
    /// gives up after the configured attempts otherwise.
    fn spawn_terminate_cascade(&self, account_id: Uuid) {
        let sessions = self.sessions.clone();
        let retries = self.config.terminate_retries.max(1);
        let sleep = self.config.terminate_retry_sleep;
        tokio::spawn(async move {
            for attempt in 1..=retries {
                match sessions.terminate_all_sessions(account_id).await {
                    Ok(()) => {
                        debug!(account_id = %account_id, "terminated sessions for deleted account");
                        return;
                    }
                    Err(err) if err.kind == Kind::NotFound => {
                        debug!(account_id = %account_id, "no sessions left for deleted account");
                        return;
                    }
                    Err(err) => {
                        warn!(
                            account_id = %account_id,
                            attempt,
                            "failed to terminate sessions for deleted account: {err}"
                        );
                        if attempt < retries {
                            tokio::time::sleep(sleep).await;
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(machine_id: &str) -> Session {
        Session {
            session_id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            machine_id: machine_id.to_string(),
            client_ip: "192.0.2.1".to_string(),
            last_activity: Utc::now(),
        }
    }

    #[test]
    fn authenticate_accepts_matching_machine_id() {
        let session = session("M1");
        let checked = authenticate(Ok(session.clone()), "M1").expect("authenticated");
        assert_eq!(checked, session);
    }

    #[test]
    fn authenticate_rejects_machine_mismatch() {
        let err = authenticate(Ok(session("M1")), "M2").expect_err("must fail");
        assert_eq!(err.kind, Kind::Unauthenticated);
        assert_eq!(err.message, "invalid session or machine id");
    }

    #[test]
    fn authenticate_masks_absent_session() {
        let err = authenticate(Err(ServiceError::not_found("session not found")), "M1")
            .expect_err("must fail");
        assert_eq!(err.kind, Kind::Unauthenticated);
        assert_eq!(err.message, "invalid session or machine id");
    }

    #[test]
    fn authenticate_passes_store_failures_through() {
        let err = authenticate(Err(ServiceError::internal("store error")), "M1")
            .expect_err("must fail");
        assert_eq!(err.kind, Kind::Internal);
        assert_eq!(err.message, "store error");
    }

    #[test]
    fn termination_plan_rejects_empty_targets() {
        let err = termination_plan(&session("M1"), &[]).expect_err("must fail");
        assert_eq!(err.kind, Kind::InvalidArgument);
    }

    #[test]
    fn termination_plan_skips_refresh_when_self_targeted() {
        let session = session("M1");
        let other = Uuid::new_v4();
        assert!(!termination_plan(&session, &[session.session_id, other]).expect("plan"));
        assert!(termination_plan(&session, &[other]).expect("plan"));
    }

    #[test]
    fn config_builder_overrides_defaults() {
        let config = IdentityConfig::new()
            .with_nonactivated_account_ttl(Duration::from_secs(60))
            .with_sessions_ttl(Duration::from_secs(120))
            .with_terminate_retries(7)
            .with_terminate_retry_sleep(Duration::from_millis(10));
        assert_eq!(config.nonactivated_account_ttl, Duration::from_secs(60));
        assert_eq!(config.sessions_ttl, Duration::from_secs(120));
        assert_eq!(config.terminate_retries, 7);
        assert_eq!(config.terminate_retry_sleep, Duration::from_millis(10));
    }

    #[test]
    fn callback_url_must_be_absolute_http() {
        assert!(valid_callback_url("https://example.com/verify").is_ok());
        assert!(valid_callback_url("http://localhost:3000/verify").is_ok());
        assert!(valid_callback_url("/verify").is_err());
        assert!(valid_callback_url("ftp://example.com/verify").is_err());
        assert!(valid_callback_url("not a url").is_err());
    }

    #[test]
    fn config_defaults_match_documented_values() {
        let config = IdentityConfig::default();
        assert_eq!(config.nonactivated_account_ttl, Duration::from_secs(86_400));
        assert_eq!(config.sessions_ttl, Duration::from_secs(1_209_600));
        assert_eq!(config.terminate_retries, 3);
    }
}
