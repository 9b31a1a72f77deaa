//! Client session manager.
//!
//! The [`SessionManager`] is the single authority for "am I logged in, and
//! as what role". It drives the auth backend, normalizes every session it
//! sees into role flags, persists the result and publishes snapshots to
//! watchers.
//!
//! # Architecture
//!
//! - State lives in a [`tokio::sync::watch`] channel. Every change goes
//!   through one update path that recomputes role flags together with the
//!   session, persists the projection when it changed, and starts or stops
//!   the expiry task.
//! - Auth-mutating operations (`login`, `signup`, `logout`, `check_auth`,
//!   `update_password`) are serialized by an async in-flight guard; a second
//!   call waits for the first instead of racing it.
//! - The manager holds at most one backend change subscription. A new
//!   [`SessionManager::check_auth`] disposes the previous one before
//!   subscribing again.
//! - While authenticated, a background task checks the session expiry on a
//!   fixed interval and logs out once it has passed. The task holds only a
//!   weak reference to the manager and is aborted on leaving Authenticated.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use serverlist_client::session::{SessionManager, SessionManagerConfig};
//! use serverlist_client::storage::MemoryStorage;
//!
//! let manager = SessionManager::new(backend, Arc::new(MemoryStorage::new()), SessionManagerConfig::default());
//! manager.check_auth().await?;
//!
//! if manager.login("player@example.com", "correct horse").await.is_ok() {
//!     println!("admin: {}", manager.is_admin());
//! }
//! ```

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::backend::{AuthBackend, Subscription, UserAttributes};
use crate::error::AuthError;
use crate::storage::{AuthStorage, PersistedAuth};
use crate::types::{RoleFlags, Session, User, UserRole};
use crate::validation::{validate_email, validate_new_password, validate_password, ValidationError};

/// Default interval between expiry checks.
const DEFAULT_EXPIRY_CHECK_INTERVAL_SECS: u64 = 60;

/// Default redirect target of password reset emails.
const DEFAULT_PASSWORD_RESET_REDIRECT: &str = "http://localhost:5173/reset-password";

/// Configuration for the session manager.
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// How often an authenticated session is checked for expiry.
    pub expiry_check_interval: Duration,

    /// Page linked from password reset emails.
    pub password_reset_redirect: String,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            expiry_check_interval: Duration::from_secs(DEFAULT_EXPIRY_CHECK_INTERVAL_SECS),
            password_reset_redirect: DEFAULT_PASSWORD_RESET_REDIRECT.to_string(),
        }
    }
}

impl SessionManagerConfig {
    /// Creates a configuration for a site served at `site_url`.
    pub fn for_site(site_url: &str, expiry_check_interval: Duration) -> Self {
        Self {
            expiry_check_interval,
            password_reset_redirect: format!("{}/reset-password", site_url.trim_end_matches('/')),
        }
    }
}

/// Coarse auth state derived from a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Unauthenticated,
    Authenticating,
    Authenticated,
}

/// Informational outcome that is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthNotice {
    /// Account created; a session is issued once the email is verified.
    VerificationEmailSent,
    /// A password reset link was sent.
    PasswordResetEmailSent,
    /// The password was changed.
    PasswordUpdated,
}

impl fmt::Display for AuthNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Self::VerificationEmailSent => "Please check your email for verification link",
            Self::PasswordResetEmailSent => "Password reset link sent to your email",
            Self::PasswordUpdated => "Password updated successfully",
        };
        f.write_str(message)
    }
}

/// Result of a successful [`SessionManager::signup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignupOutcome {
    /// The backend issued a session right away.
    Authenticated,
    /// The account exists but must verify its email first.
    VerificationPending,
}

/// Snapshot of the session manager's state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthState {
    pub is_authenticated: bool,
    pub is_loading: bool,
    pub error: Option<AuthError>,
    pub notice: Option<AuthNotice>,
    pub user: Option<User>,
    pub session: Option<Session>,
    pub is_admin: bool,
    pub is_user: bool,
    /// Session expiry as epoch seconds.
    pub session_expiration: Option<i64>,
}

impl AuthState {
    /// Derives the coarse status.
    pub fn status(&self) -> AuthStatus {
        if self.is_loading {
            AuthStatus::Authenticating
        } else if self.is_authenticated {
            AuthStatus::Authenticated
        } else {
            AuthStatus::Unauthenticated
        }
    }

    /// Returns the role of the current session.
    pub fn role(&self) -> Option<UserRole> {
        self.session.as_ref().and_then(Session::role)
    }

    /// Replaces the session and everything derived from it.
    fn apply_session(&mut self, session: Option<Session>) {
        let flags = RoleFlags::from_role(session.as_ref().and_then(Session::role));
        self.is_admin = flags.is_admin;
        self.is_user = flags.is_user;
        self.is_authenticated = session.is_some();
        self.user = session.as_ref().map(|s| s.user.clone());
        self.session_expiration = session.as_ref().and_then(|s| s.expires_at);
        self.session = session;
    }

    /// Returns to the initial, unauthenticated state.
    fn reset(&mut self) {
        *self = Self::default();
    }

    /// The projection written to storage.
    pub fn to_persisted(&self) -> PersistedAuth {
        PersistedAuth {
            is_authenticated: self.is_authenticated,
            user: self.user.clone(),
            session: self.session.clone(),
            is_admin: self.is_admin,
            is_user: self.is_user,
            session_expiration: self.session_expiration,
        }
    }

    /// Rebuilds state from storage. Flags are recomputed from the stored
    /// session, never taken from disk.
    fn from_persisted(persisted: PersistedAuth) -> Self {
        let mut state = Self::default();
        state.apply_session(persisted.session);
        state
    }
}

struct Inner {
    backend: Arc<dyn AuthBackend>,
    storage: Arc<dyn AuthStorage>,
    config: SessionManagerConfig,
    state: watch::Sender<AuthState>,
    /// Serializes auth-mutating operations.
    op_guard: AsyncMutex<()>,
    subscription: parking_lot::Mutex<Option<Subscription>>,
    expiry_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.expiry_task.get_mut().take() {
            task.abort();
        }
    }
}

/// The session manager. Clones share state.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Creates a manager, rehydrating any state found in `storage`.
    ///
    /// Unreadable stored state is logged and ignored.
    pub fn new(
        backend: Arc<dyn AuthBackend>,
        storage: Arc<dyn AuthStorage>,
        config: SessionManagerConfig,
    ) -> Self {
        let initial = match storage.load() {
            Ok(Some(persisted)) => AuthState::from_persisted(persisted),
            Ok(None) => AuthState::default(),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable auth state");
                AuthState::default()
            }
        };

        debug!(
            authenticated = initial.is_authenticated,
            interval_secs = config.expiry_check_interval.as_secs(),
            "Session manager created"
        );

        let manager = Self {
            inner: Arc::new(Inner {
                backend,
                storage,
                config,
                state: watch::Sender::new(initial),
                op_guard: AsyncMutex::new(()),
                subscription: parking_lot::Mutex::new(None),
                expiry_task: parking_lot::Mutex::new(None),
            }),
        };
        manager.sync_expiry_task();
        manager
    }

    // ==================== Observers ====================

    /// Returns a snapshot of the current state.
    pub fn state(&self) -> AuthState {
        self.inner.state.borrow().clone()
    }

    /// Returns a receiver that observes every state change.
    pub fn watch(&self) -> watch::Receiver<AuthState> {
        self.inner.state.subscribe()
    }

    pub fn status(&self) -> AuthStatus {
        self.inner.state.borrow().status()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state.borrow().is_authenticated
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state.borrow().is_loading
    }

    pub fn is_admin(&self) -> bool {
        self.inner.state.borrow().is_admin
    }

    pub fn is_user(&self) -> bool {
        self.inner.state.borrow().is_user
    }

    pub fn error(&self) -> Option<AuthError> {
        self.inner.state.borrow().error.clone()
    }

    pub fn notice(&self) -> Option<AuthNotice> {
        self.inner.state.borrow().notice
    }

    pub fn session(&self) -> Option<Session> {
        self.inner.state.borrow().session.clone()
    }

    /// Returns true while the expiry task is scheduled.
    pub fn expiry_timer_active(&self) -> bool {
        self.inner
            .expiry_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    // ==================== Operations ====================

    /// Signs in with email and password.
    ///
    /// On failure the state is reset to unauthenticated and the error is
    /// recorded as well as returned.
    pub async fn login(&self, email: &str, password: &str) -> Result<(), AuthError> {
        let _guard = self.inner.op_guard.lock().await;
        self.login_locked(email, password).await
    }

    async fn login_locked(&self, email: &str, password: &str) -> Result<(), AuthError> {
        debug!("Login started");
        self.begin_authenticating();

        match self.inner.backend.sign_in_with_password(email.trim(), password).await {
            Ok(session) => {
                self.adopt(session);
                info!(user_id = ?self.user_id(), role = ?self.role(), "Login succeeded");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Login failed");
                Err(self.fail(e.into()))
            }
        }
    }

    /// Creates an account with the `user` role.
    ///
    /// Email and password are validated locally first; a validation failure
    /// is recorded without contacting the backend or touching the session.
    pub async fn signup(&self, email: &str, password: &str) -> Result<SignupOutcome, AuthError> {
        let email = email.trim();
        validate_email(email)
            .and_then(|()| validate_password(password))
            .map_err(|e| self.reject(e))?;

        let _guard = self.inner.op_guard.lock().await;
        debug!("Signup started");
        self.begin_authenticating();

        let metadata = json!({ "role": UserRole::User.as_str() });
        match self.inner.backend.sign_up(email, password, metadata).await {
            Ok(Some(session)) => {
                self.adopt(session);
                info!(user_id = ?self.user_id(), "Signup succeeded");
                Ok(SignupOutcome::Authenticated)
            }
            Ok(None) => {
                self.update(|state| {
                    state.is_loading = false;
                    state.notice = Some(AuthNotice::VerificationEmailSent);
                });
                info!("Signup succeeded, email verification pending");
                Ok(SignupOutcome::VerificationPending)
            }
            Err(e) => {
                warn!(error = %e, "Signup failed");
                Err(self.fail(e.into()))
            }
        }
    }

    /// Checks that `password` and `confirmation` match, then signs up.
    pub async fn signup_confirmed(
        &self,
        email: &str,
        password: &str,
        confirmation: &str,
    ) -> Result<SignupOutcome, AuthError> {
        if password != confirmation {
            return Err(self.reject(ValidationError::PasswordMismatch));
        }
        self.signup(email, password).await
    }

    /// Signs out.
    ///
    /// Local state is cleared even when the backend call fails; the failure
    /// is still recorded and returned. Without a session this is a no-op.
    pub async fn logout(&self) -> Result<(), AuthError> {
        let _guard = self.inner.op_guard.lock().await;
        self.logout_locked().await
    }

    async fn logout_locked(&self) -> Result<(), AuthError> {
        let signed_in = {
            let state = self.inner.state.borrow();
            state.is_authenticated || state.session.is_some()
        };
        if !signed_in {
            debug!("Logout skipped, no session");
            return Ok(());
        }

        let user_id = self.user_id();
        let result = self.inner.backend.sign_out().await;

        match result {
            Ok(()) => {
                self.update(AuthState::reset);
                info!(user_id = ?user_id, "Logged out");
                Ok(())
            }
            Err(e) => {
                warn!(user_id = ?user_id, error = %e, "Remote sign-out failed, cleared local session");
                Err(self.fail(e.into()))
            }
        }
    }

    /// Adopts the backend's current session, if any, and (re)establishes
    /// the change subscription.
    ///
    /// Any previous subscription is disposed first, so exactly one is active
    /// afterwards. A failed restore resets the state and records the error.
    pub async fn check_auth(&self) -> Result<(), AuthError> {
        let _guard = self.inner.op_guard.lock().await;
        debug!("Checking for an existing session");

        let result = match self.inner.backend.get_session().await {
            Ok(session) => {
                let restored = session.is_some();
                self.update(|state| state.apply_session(session));
                info!(restored, user_id = ?self.user_id(), role = ?self.role(), "Auth check complete");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Session restore failed");
                Err(self.fail(e.into()))
            }
        };

        self.subscribe_to_changes();
        result
    }

    /// Logs out if the stored session has expired. Returns true if it had.
    ///
    /// Expiry is checked again once the operation guard is held, so a login
    /// that finished in the meantime keeps its fresh session.
    pub async fn check_session_expiration(&self) -> bool {
        if self.expired_at().is_none() {
            return false;
        }

        let _guard = self.inner.op_guard.lock().await;
        let Some(expires_at) = self.expired_at() else {
            debug!("Session replaced while waiting, skipping expiry logout");
            return false;
        };

        warn!(expires_at, "Session expired, logging out");
        // A failed remote sign-out is already recorded in the state.
        let _ = self.logout_locked().await;
        true
    }

    /// Clears the recorded error. Nothing else changes.
    pub fn reset_error(&self) {
        self.update(|state| state.error = None);
    }

    /// Clears the informational notice. Nothing else changes.
    pub fn clear_notice(&self) {
        self.update(|state| state.notice = None);
    }

    /// Sends a password reset email.
    ///
    /// Failures are recorded without touching the session.
    pub async fn reset_password(&self, email: &str) -> Result<(), AuthError> {
        let email = email.trim();
        validate_email(email).map_err(|e| self.reject(e))?;

        self.update(|state| {
            state.error = None;
            state.notice = None;
        });

        let redirect = &self.inner.config.password_reset_redirect;
        match self.inner.backend.reset_password_for_email(email, redirect).await {
            Ok(()) => {
                self.update(|state| state.notice = Some(AuthNotice::PasswordResetEmailSent));
                info!("Password reset email requested");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Password reset request failed");
                Err(self.record(e.into()))
            }
        }
    }

    /// Changes the password, then signs in again with it.
    pub async fn update_password(&self, new_password: &str, confirmation: &str) -> Result<(), AuthError> {
        validate_new_password(new_password, confirmation).map_err(|e| self.reject(e))?;

        let _guard = self.inner.op_guard.lock().await;
        self.update(|state| {
            state.error = None;
            state.notice = None;
        });

        let user = match self
            .inner
            .backend
            .update_user(UserAttributes::password(new_password))
            .await
        {
            Ok(user) => user,
            Err(e) => {
                warn!(error = %e, "Password update failed");
                return Err(self.record(e.into()));
            }
        };
        info!(user_id = %user.id, "Password updated");

        let email = user
            .email
            .or_else(|| self.inner.state.borrow().user.as_ref().and_then(|u| u.email.clone()));
        if let Some(email) = email {
            self.login_locked(&email, new_password).await?;
        }

        self.update(|state| state.notice = Some(AuthNotice::PasswordUpdated));
        Ok(())
    }

    /// Drops the change subscription and stops the expiry task.
    pub fn shutdown(&self) {
        let subscription = self.inner.subscription.lock().take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
        let task = self.inner.expiry_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        debug!("Session manager shut down");
    }

    // ==================== Internals ====================

    fn user_id(&self) -> Option<String> {
        self.inner.state.borrow().user.as_ref().map(|u| u.id.clone())
    }

    fn role(&self) -> Option<UserRole> {
        self.inner.state.borrow().role()
    }

    /// Returns the expiry of the current session if it has passed.
    fn expired_at(&self) -> Option<i64> {
        let now = Utc::now().timestamp();
        let state = self.inner.state.borrow();
        state
            .session
            .as_ref()
            .filter(|session| session.is_expired_at(now))
            .and_then(|session| session.expires_at)
    }

    fn begin_authenticating(&self) {
        self.update(|state| {
            state.is_loading = true;
            state.error = None;
            state.notice = None;
        });
    }

    fn adopt(&self, session: Session) {
        self.update(|state| {
            state.apply_session(Some(session));
            state.is_loading = false;
            state.error = None;
        });
    }

    /// Resets to unauthenticated and records `error`.
    fn fail(&self, error: AuthError) -> AuthError {
        self.update(|state| {
            state.reset();
            state.error = Some(error.clone());
        });
        error
    }

    /// Records `error` without touching the session.
    fn record(&self, error: AuthError) -> AuthError {
        self.update(|state| state.error = Some(error.clone()));
        error
    }

    fn reject(&self, error: ValidationError) -> AuthError {
        debug!(error = %error, "Rejected by local validation");
        self.record(error.into())
    }

    /// Applies `change`, persists the projection if it moved and keeps the
    /// expiry task in step with the authenticated flag.
    fn update(&self, change: impl FnOnce(&mut AuthState)) {
        let mut persisted = None;
        self.inner.state.send_modify(|state| {
            let before = state.to_persisted();
            change(state);
            let after = state.to_persisted();
            if after != before {
                persisted = Some(after);
            }
        });

        if let Some(persisted) = persisted {
            if let Err(e) = self.inner.storage.save(&persisted) {
                warn!(error = %e, "Failed to persist auth state");
            }
        }

        self.sync_expiry_task();
    }

    /// Applies a session pushed by the backend.
    fn apply_pushed(&self, session: Option<Session>) {
        self.update(|state| state.apply_session(session));
    }

    fn subscribe_to_changes(&self) {
        let previous = self.inner.subscription.lock().take();
        if let Some(previous) = previous {
            debug!(subscription_id = previous.id(), "Disposing previous auth subscription");
            previous.unsubscribe();
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let subscription = self.inner.backend.on_auth_state_change(Arc::new(move |event, session| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            debug!(event = %event, has_session = session.is_some(), "Auth state pushed");
            SessionManager { inner }.apply_pushed(session);
        }));

        // A concurrent subscribe cannot happen: callers hold the op guard.
        *self.inner.subscription.lock() = Some(subscription);
    }

    /// Starts the expiry task on entering Authenticated and stops it on
    /// leaving.
    fn sync_expiry_task(&self) {
        let authenticated = self.inner.state.borrow().is_authenticated;
        let mut slot = self.inner.expiry_task.lock();

        if !authenticated {
            if let Some(task) = slot.take() {
                debug!("Stopping session expiry timer");
                task.abort();
            }
            return;
        }

        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            debug!("No async runtime, session expiry timer not started");
            return;
        };

        let period = self.inner.config.expiry_check_interval;
        let weak = Arc::downgrade(&self.inner);
        debug!(interval_secs = period.as_secs(), "Starting session expiry timer");
        *slot = Some(runtime.spawn(run_expiry_timer(weak, period)));
    }
}

async fn run_expiry_timer(inner: Weak<Inner>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let manager = SessionManager { inner };
        if manager.check_session_expiration().await {
            break;
        }
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("SessionManager")
            .field("status", &state.status())
            .field("is_admin", &state.is_admin)
            .field("is_user", &state.is_user)
            .field("session_expiration", &state.session_expiration)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn session_with_role(role: Option<&str>, expires_at: Option<i64>) -> Session {
        let mut metadata = Map::new();
        if let Some(role) = role {
            metadata.insert("role".to_string(), json!(role));
        }
        Session {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            token_type: "bearer".to_string(),
            expires_in: None,
            expires_at,
            user: User {
                id: "user-1".to_string(),
                email: Some("player@example.com".to_string()),
                user_metadata: metadata,
            },
        }
    }

    #[test]
    fn status_follows_flags() {
        let mut state = AuthState::default();
        assert_eq!(state.status(), AuthStatus::Unauthenticated);

        state.is_loading = true;
        assert_eq!(state.status(), AuthStatus::Authenticating);

        state.is_loading = false;
        state.apply_session(Some(session_with_role(Some("user"), None)));
        assert_eq!(state.status(), AuthStatus::Authenticated);
    }

    #[test]
    fn apply_session_recomputes_flags_together() {
        let mut state = AuthState::default();

        state.apply_session(Some(session_with_role(Some("admin"), Some(100))));
        assert!(state.is_admin && !state.is_user);
        assert_eq!(state.session_expiration, Some(100));
        assert_eq!(state.user.as_ref().map(|u| u.id.as_str()), Some("user-1"));

        state.apply_session(Some(session_with_role(Some("user"), None)));
        assert!(!state.is_admin && state.is_user);
        assert_eq!(state.session_expiration, None);

        state.apply_session(Some(session_with_role(Some("moderator"), None)));
        assert!(!state.is_admin && !state.is_user);
        assert!(state.is_authenticated);

        state.apply_session(None);
        assert_eq!(state, AuthState::default());
    }

    #[test]
    fn rehydration_ignores_stored_flags() {
        let persisted = PersistedAuth {
            is_authenticated: true,
            user: None,
            session: Some(session_with_role(Some("user"), Some(100))),
            is_admin: true,
            is_user: false,
            session_expiration: Some(1),
        };

        let state = AuthState::from_persisted(persisted);
        assert!(!state.is_admin);
        assert!(state.is_user);
        assert_eq!(state.session_expiration, Some(100));
        assert!(state.user.is_some());
    }

    #[test]
    fn rehydration_without_session_is_unauthenticated() {
        let persisted = PersistedAuth {
            is_authenticated: true,
            is_admin: true,
            ..PersistedAuth::default()
        };

        let state = AuthState::from_persisted(persisted);
        assert_eq!(state, AuthState::default());
    }

    #[test]
    fn persisted_projection_omits_transient_fields() {
        let mut state = AuthState::default();
        state.is_loading = true;
        state.notice = Some(AuthNotice::PasswordUpdated);
        assert_eq!(state.to_persisted(), PersistedAuth::default());
    }

    #[test]
    fn config_for_site_builds_reset_redirect() {
        let config = SessionManagerConfig::for_site("https://servers.example.com/", Duration::from_secs(30));
        assert_eq!(config.password_reset_redirect, "https://servers.example.com/reset-password");
        assert_eq!(config.expiry_check_interval, Duration::from_secs(30));

        let default = SessionManagerConfig::default();
        assert_eq!(default.expiry_check_interval, Duration::from_secs(60));
    }

    #[test]
    fn notice_messages() {
        assert_eq!(
            AuthNotice::VerificationEmailSent.to_string(),
            "Please check your email for verification link"
        );
    }
}
