//! Wiring tests for [`ServerList`]: table requests carry the token of
//! whatever session the manager holds, including sessions pushed by the
//! auth service.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use serverlist_client::backend::{
    AuthBackend, AuthListeners, AuthStateHandler, BackendError, Subscription, UserAttributes,
};
use serverlist_client::realtime::RealtimeClient;
use serverlist_client::rest::RestClient;
use serverlist_client::session::SessionManagerConfig;
use serverlist_client::storage::MemoryStorage;
use serverlist_client::types::{AuthChangeEvent, Session, User};
use serverlist_client::ServerList;

const ANON_KEY: &str = "test-anon-key";

/// Auth double that only restores a session and pushes changes.
struct PushingBackend {
    current: Mutex<Option<Session>>,
    listeners: AuthListeners,
}

impl PushingBackend {
    fn new(session: Session) -> Self {
        Self {
            current: Mutex::new(Some(session)),
            listeners: AuthListeners::new(),
        }
    }

    fn push(&self, event: AuthChangeEvent, session: Option<&Session>) {
        *self.current.lock() = session.cloned();
        self.listeners.emit(event, session);
    }
}

#[async_trait]
impl AuthBackend for PushingBackend {
    async fn sign_in_with_password(&self, _email: &str, _password: &str) -> Result<Session, BackendError> {
        Err(BackendError::MissingSession)
    }

    async fn sign_up(&self, _email: &str, _password: &str, _metadata: Value) -> Result<Option<Session>, BackendError> {
        Err(BackendError::MissingSession)
    }

    async fn sign_out(&self) -> Result<(), BackendError> {
        *self.current.lock() = None;
        Ok(())
    }

    async fn get_session(&self) -> Result<Option<Session>, BackendError> {
        Ok(self.current.lock().clone())
    }

    fn on_auth_state_change(&self, handler: AuthStateHandler) -> Subscription {
        self.listeners.subscribe(handler)
    }

    async fn reset_password_for_email(&self, _email: &str, _redirect_to: &str) -> Result<(), BackendError> {
        Ok(())
    }

    async fn update_user(&self, _attributes: UserAttributes) -> Result<User, BackendError> {
        Err(BackendError::MissingSession)
    }
}

fn session(access_token: &str) -> Session {
    let mut metadata = Map::new();
    metadata.insert("role".to_string(), json!("user"));
    Session {
        access_token: access_token.to_string(),
        refresh_token: "refresh-token".to_string(),
        token_type: "bearer".to_string(),
        expires_in: Some(3600),
        expires_at: Some(Utc::now().timestamp() + 3600),
        user: User {
            id: "user-123".to_string(),
            email: Some("player@example.com".to_string()),
            user_metadata: metadata,
        },
    }
}

async fn expect_bearer(mock_server: &MockServer, token: &str) {
    Mock::given(method("GET"))
        .and(path("/rest/v1/servers"))
        .and(header("Authorization", format!("Bearer {token}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(mock_server)
        .await;
}

fn app(mock_server: &MockServer, backend: Arc<PushingBackend>) -> ServerList {
    ServerList::from_parts(
        backend,
        Arc::new(MemoryStorage::new()),
        SessionManagerConfig::for_site("https://servers.example.com", std::time::Duration::from_secs(60)),
        RestClient::new(mock_server.uri(), ANON_KEY).unwrap(),
        RealtimeClient::new(&mock_server.uri(), ANON_KEY).unwrap(),
    )
}

// ==================== token tests ====================

#[tokio::test]
async fn table_requests_follow_pushed_sessions() {
    let mock_server = MockServer::start().await;
    let backend = Arc::new(PushingBackend::new(session("access-1")));
    let app = app(&mock_server, backend.clone());

    expect_bearer(&mock_server, "access-1").await;
    expect_bearer(&mock_server, "access-2").await;
    expect_bearer(&mock_server, ANON_KEY).await;

    app.start().await.unwrap();
    assert!(app.rest().has_access_token());
    app.servers().fetch_servers().await.unwrap();

    backend.push(AuthChangeEvent::TokenRefreshed, Some(&session("access-2")));
    assert_eq!(app.rest().bearer_token(), "access-2");
    app.servers().fetch_servers().await.unwrap();

    backend.push(AuthChangeEvent::SignedOut, None);
    assert!(!app.rest().has_access_token());
    app.servers().fetch_servers().await.unwrap();

    app.shutdown();
}

#[tokio::test]
async fn logout_drops_token_from_table_requests() {
    let mock_server = MockServer::start().await;
    let app = app(&mock_server, Arc::new(PushingBackend::new(session("access-1"))));

    app.start().await.unwrap();
    assert_eq!(app.rest().bearer_token(), "access-1");

    app.session().logout().await.unwrap();
    assert_eq!(app.rest().bearer_token(), ANON_KEY);
}
