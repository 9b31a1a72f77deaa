//! Application wiring.
//!
//! [`ServerList`] builds the backend clients, the persisted storage, the
//! session manager and the stores from a [`Config`]. Table requests carry
//! the token of whatever session the manager holds at the time.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::AuthBackend;
use crate::config::Config;
use crate::error::{AuthError, ClientError, Result};
use crate::realtime::RealtimeClient;
use crate::rest::RestClient;
use crate::servers::ServerStore;
use crate::session::{SessionManager, SessionManagerConfig};
use crate::storage::{AuthStorage, FileStorage};
use crate::submissions::SubmissionStore;
use crate::supabase::SupabaseAuth;
use crate::types::User;

/// A connected client: session manager plus table stores.
#[derive(Debug)]
pub struct ServerList {
    session: SessionManager,
    rest: RestClient,
    realtime: RealtimeClient,
    submissions: SubmissionStore,
    servers: ServerStore,
}

impl ServerList {
    /// Builds a client talking to the configured Supabase project.
    ///
    /// A session persisted by an earlier run is handed to the auth client,
    /// which refreshes it on the first [`ServerList::start`] if needed.
    pub fn connect(config: &Config) -> Result<Self> {
        let auth = SupabaseAuth::new(&config.supabase_url, &config.supabase_anon_key)?;
        let storage = FileStorage::new(&config.data_dir);
        debug!(path = %storage.path().display(), "Using persisted auth state");

        match storage.load() {
            Ok(Some(persisted)) => {
                if let Some(session) = persisted.session {
                    auth.restore(session);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Ignoring unreadable auth state"),
        }

        let rest = RestClient::new(&config.supabase_url, &config.supabase_anon_key)?;
        let realtime = RealtimeClient::new(&config.supabase_url, &config.supabase_anon_key)?;
        Ok(Self::from_parts(
            Arc::new(auth),
            Arc::new(storage),
            config.session_manager_config(),
            rest,
            realtime,
        ))
    }

    /// Assembles a client from already built parts.
    pub fn from_parts(
        backend: Arc<dyn AuthBackend>,
        storage: Arc<dyn AuthStorage>,
        session_config: SessionManagerConfig,
        rest: RestClient,
        realtime: RealtimeClient,
    ) -> Self {
        let session = SessionManager::new(backend, storage, session_config);
        rest.follow_session(&session);
        Self {
            session,
            submissions: SubmissionStore::new(rest.clone()),
            servers: ServerStore::new(rest.clone()),
            rest,
            realtime,
        }
    }

    /// Restores the session and subscribes to pushed changes.
    pub async fn start(&self) -> std::result::Result<(), AuthError> {
        self.session.check_auth().await
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Table client shared by the stores.
    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    pub fn realtime(&self) -> &RealtimeClient {
        &self.realtime
    }

    pub fn submissions(&self) -> &SubmissionStore {
        &self.submissions
    }

    pub fn servers(&self) -> &ServerStore {
        &self.servers
    }

    /// Returns the signed-in user, for views gated on authentication.
    pub fn require_auth(&self) -> Result<User> {
        let state = self.session.state();
        match state.user {
            Some(user) if state.is_authenticated => Ok(user),
            _ => Err(ClientError::NotAuthenticated),
        }
    }

    /// Returns the signed-in admin, for the admin views.
    pub fn require_admin(&self) -> Result<User> {
        let user = self.require_auth()?;
        if !self.session.is_admin() {
            return Err(ClientError::NotAuthorized);
        }
        Ok(user)
    }

    /// Stops background work.
    pub fn shutdown(&self) {
        self.session.shutdown();
    }
}
