//! Table access over the Supabase REST API (PostgREST).
//!
//! Only the handful of operations the stores need are covered: select with
//! equality filters and ordering, insert, update and delete. Update and
//! delete require at least one filter; an unfiltered mutation is refused
//! before any request is built.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error};

use crate::backend::BackendError;
use crate::session::{AuthState, SessionManager};
use crate::supabase::REQUEST_TIMEOUT;

/// Sort direction for [`Query::order`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

impl Order {
    fn as_str(self) -> &'static str {
        match self {
            Self::Ascending => "asc",
            Self::Descending => "desc",
        }
    }
}

/// Row filter and ordering for a table request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    filters: Vec<(String, String)>,
    order: Option<(String, Order)>,
}

impl Query {
    /// An empty query matching every row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps rows where `column` equals `value`.
    pub fn eq(mut self, column: impl Into<String>, value: impl fmt::Display) -> Self {
        self.filters.push((column.into(), format!("eq.{value}")));
        self
    }

    /// Sorts the result by `column`.
    pub fn order(mut self, column: impl Into<String>, order: Order) -> Self {
        self.order = Some((column.into(), order));
        self
    }

    /// Returns true if at least one row filter is set.
    pub fn has_filters(&self) -> bool {
        !self.filters.is_empty()
    }

    /// Query-string pairs in PostgREST syntax.
    fn params(&self) -> Vec<(String, String)> {
        let mut params = self.filters.clone();
        if let Some((column, order)) = &self.order {
            params.push(("order".to_string(), format!("{column}.{}", order.as_str())));
        }
        params
    }
}

/// Where the user token for table requests comes from.
enum AccessToken {
    Fixed(Option<String>),
    /// Read from the session manager at request time.
    Session(watch::Receiver<AuthState>),
}

impl AccessToken {
    fn current(&self) -> Option<String> {
        match self {
            Self::Fixed(token) => token.clone(),
            Self::Session(state) => state.borrow().session.as_ref().map(|s| s.access_token.clone()),
        }
    }
}

/// Client for the project's tables.
///
/// Clones share the access token source, so a token set on one clone is
/// used by every store holding another.
#[derive(Clone)]
pub struct RestClient {
    http_client: Client,
    base_url: String,
    anon_key: String,
    access_token: Arc<RwLock<AccessToken>>,
}

impl RestClient {
    /// Creates a new table client.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Configuration`] if the HTTP client cannot be created.
    pub fn new(base_url: impl Into<String>, anon_key: impl Into<String>) -> Result<Self, BackendError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Configuration(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            http_client,
            base_url,
            anon_key: anon_key.into(),
            access_token: Arc::new(RwLock::new(AccessToken::Fixed(None))),
        })
    }

    /// Sets the user token sent with every request. `None` falls back to the
    /// anon key, so row-level security sees an anonymous caller.
    pub fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write() = AccessToken::Fixed(token);
    }

    /// Sends the token of whatever session `session` holds when each request
    /// is built. Refreshes, pushed sign-outs and expiry logouts apply to the
    /// next request without further calls.
    pub fn follow_session(&self, session: &SessionManager) {
        *self.access_token.write() = AccessToken::Session(session.watch());
    }

    /// Returns true if requests are sent with a user token.
    pub fn has_access_token(&self) -> bool {
        self.access_token.read().current().is_some()
    }

    /// Returns the bearer sent right now: the user token, or the anon key.
    pub fn bearer_token(&self) -> String {
        self.access_token
            .read()
            .current()
            .unwrap_or_else(|| self.anon_key.clone())
    }

    fn request(&self, method: reqwest::Method, table: &str) -> RequestBuilder {
        let bearer = self.bearer_token();

        self.http_client
            .request(method, format!("{}/rest/v1/{table}", self.base_url))
            .header("apikey", &self.anon_key)
            .bearer_auth(bearer)
    }

    async fn send(&self, request: RequestBuilder, table: &str) -> Result<Response, BackendError> {
        let response = request
            .send()
            .await
            .map_err(|e| BackendError::from_send(e, REQUEST_TIMEOUT))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let err = BackendError::from_status(status.as_u16(), &body);
        error!(table = %table, status = %status, error = %err, "Table request failed");
        Err(err)
    }

    /// Fetches rows matching `query`.
    pub async fn select<T: DeserializeOwned>(&self, table: &str, query: &Query) -> Result<Vec<T>, BackendError> {
        let mut params = vec![("select".to_string(), "*".to_string())];
        params.extend(query.params());

        let request = self.request(reqwest::Method::GET, table).query(&params);
        let rows: Vec<T> = self
            .send(request, table)
            .await?
            .json()
            .await
            .map_err(|e| BackendError::InvalidResponse(format!("failed to parse rows of '{table}': {e}")))?;

        debug!(table = %table, rows = rows.len(), "Fetched rows");
        Ok(rows)
    }

    /// Inserts rows.
    pub async fn insert<T: Serialize + Sync>(&self, table: &str, rows: &[T]) -> Result<(), BackendError> {
        let request = self
            .request(reqwest::Method::POST, table)
            .header("Prefer", "return=minimal")
            .json(rows);

        self.send(request, table).await?;
        debug!(table = %table, rows = rows.len(), "Inserted rows");
        Ok(())
    }

    /// Applies `patch` to rows matching `query`.
    pub async fn update<T: Serialize + Sync>(&self, table: &str, patch: &T, query: &Query) -> Result<(), BackendError> {
        if !query.has_filters() {
            return Err(BackendError::UnfilteredMutation {
                operation: "update",
                table: table.to_string(),
            });
        }

        let request = self
            .request(reqwest::Method::PATCH, table)
            .header("Prefer", "return=minimal")
            .query(&query.params())
            .json(patch);

        self.send(request, table).await?;
        debug!(table = %table, "Updated rows");
        Ok(())
    }

    /// Deletes rows matching `query`.
    pub async fn delete(&self, table: &str, query: &Query) -> Result<(), BackendError> {
        if !query.has_filters() {
            return Err(BackendError::UnfilteredMutation {
                operation: "delete",
                table: table.to_string(),
            });
        }

        let request = self.request(reqwest::Method::DELETE, table).query(&query.params());

        self.send(request, table).await?;
        debug!(table = %table, "Deleted rows");
        Ok(())
    }
}

impl fmt::Debug for RestClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestClient")
            .field("base_url", &self.base_url)
            .field("has_access_token", &self.has_access_token())
            .finish()
    }
}
