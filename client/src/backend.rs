//! The backend seam: the auth contract the session manager depends on,
//! change-subscription handles, and the error type shared by the HTTP
//! clients.
//!
//! # Architecture
//!
//! [`AuthBackend`] is the only way the [`SessionManager`] talks to the auth
//! service. Production code uses [`SupabaseAuth`]; tests substitute a
//! double. Push notifications use an explicit observer interface:
//! [`AuthBackend::on_auth_state_change`] returns a [`Subscription`] whose
//! disposal (explicit [`Subscription::unsubscribe`] or drop) removes the
//! handler.
//!
//! [`SessionManager`]: crate::session::SessionManager
//! [`SupabaseAuth`]: crate::supabase::SupabaseAuth

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace};

use crate::types::{AuthChangeEvent, Session, User};

/// Errors returned by the backend clients.
///
/// These provide granular information about failures so the session manager
/// can decide what to show the user: API rejections carry the service's own
/// message, everything else is treated as an unexpected failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The service rejected the request (bad credentials, duplicate
    /// account, row-level security, ...).
    #[error("{message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Human-readable message from the service.
        message: String,
        /// Machine-readable error code, if the service sent one.
        code: Option<String>,
    },

    /// The request timed out.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The service is unreachable.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The response could not be parsed.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Client configuration error, such as an invalid URL.
    #[error("client configuration error: {0}")]
    Configuration(String),

    /// The operation needs a signed-in session and there is none.
    #[error("Auth session missing!")]
    MissingSession,

    /// An update or delete was attempted without any filter.
    #[error("refusing to {operation} every row of '{table}' without a filter")]
    UnfilteredMutation {
        /// `update` or `delete`.
        operation: &'static str,
        /// Target table.
        table: String,
    },
}

impl BackendError {
    /// Returns the machine-readable error code, if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Returns true for a rejection by the service, as opposed to a
    /// transport or parsing failure.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Api { .. } | Self::MissingSession)
    }

    /// Maps a reqwest send error.
    pub(crate) fn from_send(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout(timeout)
        } else if err.is_connect() {
            Self::Unavailable(format!("connection failed: {err}"))
        } else {
            Self::Unavailable(format!("request failed: {err}"))
        }
    }

    /// Builds an [`BackendError::Api`] from a non-success response body.
    ///
    /// Understands the error shapes used by GoTrue (`msg`, `error_code`,
    /// `error_description`) and PostgREST (`message`, `code`). Unparseable
    /// bodies become the message verbatim.
    pub(crate) fn from_status(status: u16, body: &str) -> Self {
        let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
        let (message, code) = match parsed {
            Some(body) => {
                let message = body
                    .msg
                    .or(body.message)
                    .or(body.error_description)
                    .or_else(|| body.error.clone())
                    .unwrap_or_else(|| format!("request failed with status {status}"));
                let code = body.error_code.or_else(|| body.code.and_then(code_string)).or(body.error);
                (message, code)
            }
            None if body.trim().is_empty() => (format!("request failed with status {status}"), None),
            None => (body.trim().to_string(), None),
        };

        Self::Api {
            status,
            message,
            code,
        }
    }
}

/// Error body fields used by the auth and table services.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    msg: Option<String>,
    message: Option<String>,
    error_description: Option<String>,
    error: Option<String>,
    error_code: Option<String>,
    code: Option<Value>,
}

/// GoTrue sends a numeric `code` (the HTTP status); PostgREST sends a string
/// code such as `42501`. Only the string form is a machine-readable code.
fn code_string(code: Value) -> Option<String> {
    match code {
        Value::String(code) => Some(code),
        _ => None,
    }
}

/// Attributes accepted by [`AuthBackend::update_user`].
#[derive(Clone, Default, Serialize)]
pub struct UserAttributes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl UserAttributes {
    /// Attributes that change only the password.
    pub fn password(password: impl Into<String>) -> Self {
        Self {
            password: Some(password.into()),
        }
    }
}

impl fmt::Debug for UserAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserAttributes")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Callback invoked on every pushed session change.
pub type AuthStateHandler = Arc<dyn Fn(AuthChangeEvent, Option<Session>) + Send + Sync>;

/// Handle for an active change subscription.
///
/// The handler stays registered until the handle is unsubscribed or dropped.
pub struct Subscription {
    id: u64,
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wraps an unsubscribe action.
    pub fn new(id: u64, unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id,
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Returns the subscription identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Removes the handler now.
    pub fn unsubscribe(mut self) {
        self.dispose();
    }

    fn dispose(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

/// In-process registry of auth change handlers.
#[derive(Default)]
pub struct AuthListeners {
    next_id: AtomicU64,
    handlers: Arc<Mutex<HashMap<u64, AuthStateHandler>>>,
}

impl AuthListeners {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler.
    pub fn subscribe(&self, handler: AuthStateHandler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().insert(id, handler);
        debug!(subscription_id = id, "Auth state listener registered");

        let handlers = Arc::clone(&self.handlers);
        Subscription::new(id, move || {
            if handlers.lock().remove(&id).is_some() {
                debug!(subscription_id = id, "Auth state listener removed");
            }
        })
    }

    /// Notifies every registered handler.
    ///
    /// Handlers are called outside the registry lock, so a handler may
    /// subscribe or unsubscribe without deadlocking.
    pub fn emit(&self, event: AuthChangeEvent, session: Option<&Session>) {
        let handlers: Vec<AuthStateHandler> = self.handlers.lock().values().cloned().collect();
        trace!(event = %event, listeners = handlers.len(), "Emitting auth state change");
        for handler in handlers {
            handler(event, session.cloned());
        }
    }

    /// Returns the number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Returns true if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.lock().is_empty()
    }
}

impl fmt::Debug for AuthListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthListeners")
            .field("listener_count", &self.len())
            .finish()
    }
}

/// Contract of the external auth service.
///
/// Implementations own credential verification, session issue and refresh;
/// the session manager only reacts to their results.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Exchanges email and password for a session.
    async fn sign_in_with_password(&self, email: &str, password: &str)
        -> Result<Session, BackendError>;

    /// Creates an account. Returns `None` when the account must verify its
    /// email before a session is issued.
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: Value,
    ) -> Result<Option<Session>, BackendError>;

    /// Terminates the current session.
    async fn sign_out(&self) -> Result<(), BackendError>;

    /// Returns the current session, refreshing it if needed.
    async fn get_session(&self) -> Result<Option<Session>, BackendError>;

    /// Registers a handler for pushed session changes.
    fn on_auth_state_change(&self, handler: AuthStateHandler) -> Subscription;

    /// Sends a password reset email linking to `redirect_to`.
    async fn reset_password_for_email(&self, email: &str, redirect_to: &str)
        -> Result<(), BackendError>;

    /// Updates the signed-in user.
    async fn update_user(&self, attributes: UserAttributes) -> Result<User, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn from_status_parses_gotrue_error_body() {
        let body = r#"{"code":400,"error_code":"invalid_credentials","msg":"Invalid login credentials"}"#;
        let err = BackendError::from_status(400, body);

        assert_eq!(
            err,
            BackendError::Api {
                status: 400,
                message: "Invalid login credentials".to_string(),
                code: Some("invalid_credentials".to_string()),
            }
        );
        assert_eq!(err.code(), Some("invalid_credentials"));
        assert!(err.is_rejection());
    }

    #[test]
    fn from_status_parses_oauth_style_error_body() {
        let body = r#"{"error":"invalid_grant","error_description":"Email not confirmed"}"#;
        let err = BackendError::from_status(400, body);

        assert_eq!(err.to_string(), "Email not confirmed");
        assert_eq!(err.code(), Some("invalid_grant"));
    }

    #[test]
    fn from_status_parses_postgrest_error_body() {
        let body = r#"{"code":"42501","message":"new row violates row-level security policy","details":null,"hint":null}"#;
        let err = BackendError::from_status(403, body);

        assert_eq!(err.to_string(), "new row violates row-level security policy");
        assert_eq!(err.code(), Some("42501"));
    }

    #[test]
    fn from_status_keeps_plain_text_body() {
        let err = BackendError::from_status(502, "Bad Gateway\n");
        assert_eq!(err.to_string(), "Bad Gateway");
        assert_eq!(err.code(), None);

        let err = BackendError::from_status(500, "");
        assert_eq!(err.to_string(), "request failed with status 500");
    }

    #[test]
    fn transport_errors_are_not_rejections() {
        assert!(!BackendError::Timeout(Duration::from_secs(5)).is_rejection());
        assert!(!BackendError::Unavailable("down".to_string()).is_rejection());
        assert!(BackendError::MissingSession.is_rejection());
    }

    #[test]
    fn backend_error_display() {
        assert_eq!(
            BackendError::Timeout(Duration::from_secs(5)).to_string(),
            "request timed out after 5s"
        );
        assert_eq!(
            BackendError::UnfilteredMutation {
                operation: "delete",
                table: "servers".to_string()
            }
            .to_string(),
            "refusing to delete every row of 'servers' without a filter"
        );
    }

    #[test]
    fn user_attributes_serialize_only_set_fields() {
        let json = serde_json::to_value(UserAttributes::password("new-password")).unwrap();
        assert_eq!(json, serde_json::json!({"password": "new-password"}));
    }

    #[test]
    fn user_attributes_debug_redacts_password() {
        let debug = format!("{:?}", UserAttributes::password("hunter2hunter2"));
        assert!(!debug.contains("hunter2hunter2"));
    }

    #[test]
    fn listeners_emit_until_unsubscribed() {
        let listeners = AuthListeners::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let subscription = listeners.subscribe(Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(listeners.len(), 1);

        listeners.emit(AuthChangeEvent::SignedOut, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        subscription.unsubscribe();
        assert!(listeners.is_empty());

        listeners.emit(AuthChangeEvent::SignedOut, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let listeners = AuthListeners::new();
        {
            let _subscription = listeners.subscribe(Arc::new(|_, _| {}));
            assert_eq!(listeners.len(), 1);
        }
        assert!(listeners.is_empty());
    }

    #[test]
    fn subscription_ids_are_unique() {
        let listeners = AuthListeners::new();
        let first = listeners.subscribe(Arc::new(|_, _| {}));
        let second = listeners.subscribe(Arc::new(|_, _| {}));
        assert_ne!(first.id(), second.id());
        assert_eq!(listeners.len(), 2);
    }
}
