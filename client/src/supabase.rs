//! Supabase auth client implementing [`AuthBackend`].
//!
//! This module talks to the Supabase auth service (GoTrue) over its REST API:
//! - Password sign-in and session refresh via `/auth/v1/token`
//! - Account creation via `/auth/v1/signup`
//! - Sign-out via `/auth/v1/logout`
//! - Password reset emails via `/auth/v1/recover`
//! - User updates via `/auth/v1/user`
//!
//! # Architecture
//!
//! [`SupabaseAuth`] keeps the current session in memory, like the browser
//! client keeps it in local storage, and pushes every change to listeners
//! registered through [`AuthBackend::on_auth_state_change`]. It is designed
//! to be shared via `Arc`. Requests time out after 5 seconds and are never
//! retried.
//!
//! # Example
//!
//! ```rust,ignore
//! use serverlist_client::backend::AuthBackend;
//! use serverlist_client::supabase::SupabaseAuth;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let auth = SupabaseAuth::new("https://your-project.supabase.co", "your-anon-key")?;
//!
//!     let session = auth.sign_in_with_password("player@example.com", "correct horse").await?;
//!     println!("Signed in as {}", session.user.id);
//!
//!     auth.sign_out().await?;
//!     Ok(())
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::backend::{AuthBackend, AuthListeners, AuthStateHandler, BackendError, Subscription, UserAttributes};
use crate::types::{AuthChangeEvent, Session, User};

/// Default timeout for auth API requests.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A session this close to expiry is refreshed before being handed out.
const EXPIRY_MARGIN_SECS: i64 = 10;

/// Client for the Supabase auth service.
///
/// # Thread Safety
///
/// The HTTP client is shareable across threads and the session slot is
/// behind a lock. Wrap in `Arc` for sharing.
#[derive(Debug)]
pub struct SupabaseAuth {
    /// The underlying HTTP client.
    http_client: Client,

    /// The base URL of the Supabase project (e.g., `https://xxx.supabase.co`).
    base_url: String,

    /// The Supabase anonymous/public key for API authentication.
    anon_key: String,

    /// The current session, if signed in.
    current: RwLock<Option<Session>>,

    /// Handlers for pushed session changes.
    listeners: AuthListeners,
}

impl SupabaseAuth {
    /// Creates a new auth client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - The Supabase project URL (e.g., `https://xxx.supabase.co`)
    /// * `anon_key` - The Supabase anonymous/public key
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Configuration`] if the HTTP client cannot be created.
    pub fn new(base_url: impl Into<String>, anon_key: impl Into<String>) -> Result<Self, BackendError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let anon_key = anon_key.into();

        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Configuration(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            base_url,
            anon_key,
            current: RwLock::new(None),
            listeners: AuthListeners::new(),
        })
    }

    /// Returns the base URL of the Supabase project.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Seeds a previously persisted session without emitting an event.
    ///
    /// The session is validated lazily: the next [`AuthBackend::get_session`]
    /// refreshes it if it is about to expire.
    pub fn restore(&self, session: Session) {
        debug!(user_id = %session.user.id, "Restoring persisted session");
        *self.current.write() = Some(session);
    }

    /// Returns the in-memory session without refreshing it.
    pub fn current_session(&self) -> Option<Session> {
        self.current.read().clone()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/auth/v1/{path}", self.base_url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, BackendError> {
        let response = request
            .header("apikey", &self.anon_key)
            .send()
            .await
            .map_err(|e| BackendError::from_send(e, REQUEST_TIMEOUT))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let err = BackendError::from_status(status.as_u16(), &body);
        if status.is_server_error() {
            error!(status = %status, error = %err, "Unexpected response from auth service");
        } else {
            debug!(status = %status, error = %err, "Auth service rejected request");
        }
        Err(err)
    }

    async fn parse<T: DeserializeOwned>(response: Response, what: &str) -> Result<T, BackendError> {
        response
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(format!("failed to parse {what} response: {e}")))
    }

    /// Stores a new session and notifies listeners.
    fn set_session(&self, session: Session, event: AuthChangeEvent) -> Session {
        let session = session.with_computed_expiry(Utc::now().timestamp());
        *self.current.write() = Some(session.clone());
        self.listeners.emit(event, Some(&session));
        session
    }

    /// Drops the session and notifies listeners.
    fn clear_session(&self) {
        let previous = self.current.write().take();
        if previous.is_some() {
            self.listeners.emit(AuthChangeEvent::SignedOut, None);
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Session, BackendError> {
        debug!("Refreshing session");

        let request = self
            .http_client
            .post(self.url("token"))
            .query(&[("grant_type", "refresh_token")])
            .json(&json!({ "refresh_token": refresh_token }));

        let session: Session = Self::parse(self.send(request).await?, "refresh").await?;
        info!(user_id = %session.user.id, "Session refreshed");
        Ok(self.set_session(session, AuthChangeEvent::TokenRefreshed))
    }
}

#[async_trait]
impl AuthBackend for SupabaseAuth {
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, BackendError> {
        debug!("Signing in with password");

        let request = self
            .http_client
            .post(self.url("token"))
            .query(&[("grant_type", "password")])
            .json(&json!({ "email": email, "password": password }));

        let session: Session = Self::parse(self.send(request).await?, "sign-in").await?;
        debug!(user_id = %session.user.id, "Signed in");
        Ok(self.set_session(session, AuthChangeEvent::SignedIn))
    }

    async fn sign_up(&self, email: &str, password: &str, metadata: Value) -> Result<Option<Session>, BackendError> {
        debug!("Creating account");

        let request = self
            .http_client
            .post(self.url("signup"))
            .json(&json!({ "email": email, "password": password, "data": metadata }));

        // With email confirmation enabled the service answers with the bare
        // user; otherwise it answers with a full session.
        let body: Value = Self::parse(self.send(request).await?, "sign-up").await?;
        if body.get("access_token").is_none() {
            debug!("Account created, email verification pending");
            return Ok(None);
        }

        let session: Session = serde_json::from_value(body)
            .map_err(|e| BackendError::InvalidResponse(format!("failed to parse sign-up session: {e}")))?;
        Ok(Some(self.set_session(session, AuthChangeEvent::SignedIn)))
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        let Some(session) = self.current_session() else {
            debug!("Sign-out requested without a session");
            return Ok(());
        };

        let request = self
            .http_client
            .post(self.url("logout"))
            .bearer_auth(&session.access_token);
        let result = self.send(request).await;

        // The local session goes regardless of what the service said.
        self.clear_session();

        match result {
            Ok(_) => Ok(()),
            // Already invalid on the server side.
            Err(BackendError::Api { status, .. })
                if status == StatusCode::UNAUTHORIZED.as_u16() || status == StatusCode::NOT_FOUND.as_u16() =>
            {
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "Remote sign-out failed");
                Err(err)
            }
        }
    }

    async fn get_session(&self) -> Result<Option<Session>, BackendError> {
        let Some(session) = self.current_session() else {
            return Ok(None);
        };

        if !session.expires_within(Utc::now().timestamp(), EXPIRY_MARGIN_SECS) {
            return Ok(Some(session));
        }

        match self.refresh(&session.refresh_token).await {
            Ok(session) => Ok(Some(session)),
            Err(err) => {
                if err.is_rejection() {
                    warn!(error = %err, "Session refresh rejected, discarding session");
                    self.clear_session();
                }
                Err(err)
            }
        }
    }

    fn on_auth_state_change(&self, handler: AuthStateHandler) -> Subscription {
        self.listeners.subscribe(handler)
    }

    async fn reset_password_for_email(&self, email: &str, redirect_to: &str) -> Result<(), BackendError> {
        debug!(redirect_to = %redirect_to, "Requesting password reset email");

        let request = self
            .http_client
            .post(self.url("recover"))
            .query(&[("redirect_to", redirect_to)])
            .json(&json!({ "email": email }));

        self.send(request).await?;
        Ok(())
    }

    async fn update_user(&self, attributes: UserAttributes) -> Result<User, BackendError> {
        let session = self.current_session().ok_or(BackendError::MissingSession)?;

        let request = self
            .http_client
            .put(self.url("user"))
            .bearer_auth(&session.access_token)
            .json(&attributes);

        let user: User = Self::parse(self.send(request).await?, "user").await?;
        debug!(user_id = %user.id, "User updated");

        let updated = Session {
            user: user.clone(),
            ..session
        };
        self.set_session(updated, AuthChangeEvent::UserUpdated);
        Ok(user)
    }
}
