//! Auth data types shared by the session manager and the backend clients.
//!
//! These mirror the JSON shapes returned by the Supabase auth service
//! (GoTrue) closely enough to deserialize them directly, while exposing the
//! derived views the rest of the crate needs: the user's role claim and the
//! role flags computed from it.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata key holding the role claim.
const ROLE_CLAIM: &str = "role";

/// Authorization tier carried in a user's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    /// May review, rank and delete submissions.
    Admin,
    /// Regular registered user.
    User,
}

impl UserRole {
    /// Parses a role claim value.
    ///
    /// Only the exact strings `"admin"` and `"user"` are recognised; anything
    /// else (other strings, numbers, null) yields `None`.
    pub fn from_claim(value: &Value) -> Option<Self> {
        match value.as_str()? {
            "admin" => Some(Self::Admin),
            "user" => Some(Self::User),
            _ => None,
        }
    }

    /// Returns the claim string for this role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
        }
    }
}

impl fmt::Display for UserRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role flags derived from a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleFlags {
    pub is_admin: bool,
    pub is_user: bool,
}

impl RoleFlags {
    /// Computes both flags from an optional role. They are never set
    /// independently.
    pub fn from_role(role: Option<UserRole>) -> Self {
        Self {
            is_admin: role == Some(UserRole::Admin),
            is_user: role == Some(UserRole::User),
        }
    }
}

/// An authenticated user as reported by the auth service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// The unique identifier for the user (UUID format).
    pub id: String,

    /// The user's email address, if available.
    #[serde(default)]
    pub email: Option<String>,

    /// Free-form metadata set at signup. Holds the role claim.
    #[serde(default)]
    pub user_metadata: Map<String, Value>,
}

impl User {
    /// Returns the role claim from the user's metadata, if valid.
    pub fn role(&self) -> Option<UserRole> {
        self.user_metadata.get(ROLE_CLAIM).and_then(UserRole::from_claim)
    }
}

/// A server-issued session.
///
/// Sessions are replaced wholesale on login, refresh and logout; nothing in
/// this crate edits one in place except to fill in a missing `expires_at`
/// when it is first received.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Bearer token for API calls.
    pub access_token: String,

    /// Token used to obtain a fresh access token.
    pub refresh_token: String,

    /// Token type, always `bearer` in practice.
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// Lifetime of the access token in seconds at issue time.
    #[serde(default)]
    pub expires_in: Option<i64>,

    /// Expiry as epoch seconds.
    #[serde(default)]
    pub expires_at: Option<i64>,

    /// The user this session belongs to.
    pub user: User,
}

fn default_token_type() -> String {
    "bearer".to_string()
}

impl Session {
    /// Fills in `expires_at` from `expires_in` if the service omitted it.
    pub fn with_computed_expiry(mut self, now: i64) -> Self {
        if self.expires_at.is_none() {
            self.expires_at = self.expires_in.map(|secs| now + secs);
        }
        self
    }

    /// Returns the role claim embedded in the session's user.
    pub fn role(&self) -> Option<UserRole> {
        self.user.role()
    }

    /// Returns true if the session has expired at the given epoch second.
    ///
    /// A session without an expiry never expires.
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    /// Returns true if the session expires within `margin_secs` of `now`.
    pub fn expires_within(&self, now: i64, margin_secs: i64) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at - margin_secs <= now)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("user_id", &self.user.id)
            .finish()
    }
}

/// Kinds of out-of-band session changes pushed by the auth backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthChangeEvent {
    SignedIn,
    SignedOut,
    TokenRefreshed,
    UserUpdated,
}

impl fmt::Display for AuthChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SignedIn => "SIGNED_IN",
            Self::SignedOut => "SIGNED_OUT",
            Self::TokenRefreshed => "TOKEN_REFRESHED",
            Self::UserUpdated => "USER_UPDATED",
        };
        f.write_str(name)
    }
}
