//! Listed servers and their active/inactive status.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, Subscription};
use crate::error::Result;
use crate::realtime::{RealtimeClient, TableFilter};
use crate::rest::{Order, Query, RestClient};

/// Table holding servers.
pub const SERVERS_TABLE: &str = "servers";

/// Realtime channel carrying changes to [`SERVERS_TABLE`].
pub const SERVERS_CHANNEL: &str = "servers-channel";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    Active,
    Inactive,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        })
    }
}

impl FromStr for ServerStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            other => Err(format!("unknown server status '{other}' (expected active or inactive)")),
        }
    }
}

/// A row of the servers table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    pub status: ServerStatus,
    pub created_at: DateTime<Utc>,
}

/// Server list state backed by the servers table.
///
/// Status changes are applied locally before the request is sent and
/// rolled back if it fails. Clones share the same list.
#[derive(Debug, Clone)]
pub struct ServerStore {
    client: RestClient,
    servers: Arc<RwLock<Vec<Server>>>,
    error: Arc<RwLock<Option<String>>>,
    /// Bumped after every successful fetch.
    version: Arc<watch::Sender<u64>>,
}

impl ServerStore {
    pub fn new(client: RestClient) -> Self {
        Self {
            client,
            servers: Arc::new(RwLock::new(Vec::new())),
            error: Arc::new(RwLock::new(None)),
            version: Arc::new(watch::channel(0).0),
        }
    }

    /// Notified whenever the list is reloaded.
    pub fn updates(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub fn servers(&self) -> Vec<Server> {
        self.servers.read().clone()
    }

    pub fn error(&self) -> Option<String> {
        self.error.read().clone()
    }

    pub fn clear_error(&self) {
        *self.error.write() = None;
    }

    /// Reloads every server, newest first.
    pub async fn fetch_servers(&self) -> Result<Vec<Server>> {
        *self.error.write() = None;
        let query = Query::new().order("created_at", Order::Descending);

        match self.client.select::<Server>(SERVERS_TABLE, &query).await {
            Ok(servers) => {
                debug!(count = servers.len(), "Servers fetched");
                *self.servers.write() = servers.clone();
                self.version.send_modify(|version| *version += 1);
                Ok(servers)
            }
            Err(e) => Err(self.failed(e)),
        }
    }

    /// Sets a server's status, optimistically.
    pub async fn update_server_status(&self, id: &str, status: ServerStatus) -> Result<()> {
        let previous = {
            let mut servers = self.servers.write();
            let previous = servers.clone();
            for server in servers.iter_mut().filter(|s| s.id == id) {
                server.status = status;
            }
            previous
        };

        let result = self
            .client
            .update(SERVERS_TABLE, &json!({ "status": status }), &Query::new().eq("id", id))
            .await;

        match result {
            Ok(()) => {
                info!(server_id = %id, status = %status, "Server status updated");
                Ok(())
            }
            Err(e) => {
                *self.servers.write() = previous;
                warn!(server_id = %id, "Rolled back server status");
                Err(self.failed(e))
            }
        }
    }

    /// Reloads the list whenever a row of the servers table changes.
    ///
    /// A failed reload is recorded in [`ServerStore::error`] and the feed
    /// stays open. Dropping the returned handle leaves the channel.
    pub fn subscribe_to_servers(&self, realtime: &RealtimeClient) -> Result<Subscription> {
        let mut feed = realtime.subscribe(
            SERVERS_CHANNEL,
            TableFilter::all_changes(SERVERS_TABLE),
            self.client.bearer_token(),
        )?;
        let id = feed.id();

        let store = self.clone();
        let task = tokio::spawn(async move {
            while let Some(change) = feed.next().await {
                debug!(kind = %change.kind, "Servers changed, reloading");
                let _ = store.fetch_servers().await;
            }
        });

        Ok(Subscription::new(id, move || {
            task.abort();
            debug!(feed_id = id, "Servers subscription removed");
        }))
    }

    fn failed(&self, err: BackendError) -> crate::error::ClientError {
        warn!(error = %err, "Server request failed");
        *self.error.write() = Some(err.to_string());
        err.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::Value;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::{timeout, Duration};
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn loaded_store(mock_server: &MockServer) -> ServerStore {
        Mock::given(method("GET"))
            .and(path("/rest/v1/servers"))
            .and(query_param("order", "created_at.desc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "s1", "name": "Rustafied", "ip_address": "10.0.0.1", "status": "active", "created_at": "2026-10-02T00:00:00Z"},
                {"id": "s2", "name": null, "ip_address": null, "status": "inactive", "created_at": "2026-10-01T00:00:00Z"}
            ])))
            .mount(mock_server)
            .await;

        let store = ServerStore::new(RestClient::new(mock_server.uri(), "anon").unwrap());
        store.fetch_servers().await.expect("fetch should succeed");
        store
    }

    #[test]
    fn status_parses_case_insensitively() {
        assert_eq!("Active".parse::<ServerStatus>(), Ok(ServerStatus::Active));
        assert_eq!("inactive".parse::<ServerStatus>(), Ok(ServerStatus::Inactive));
        assert!("paused".parse::<ServerStatus>().is_err());
    }

    #[tokio::test]
    async fn fetch_loads_servers() {
        let mock_server = MockServer::start().await;
        let store = loaded_store(&mock_server).await;

        let servers = store.servers();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[1].status, ServerStatus::Inactive);
        assert!(servers[1].name.is_none());
    }

    #[tokio::test]
    async fn status_update_keeps_optimistic_change() {
        let mock_server = MockServer::start().await;
        let store = loaded_store(&mock_server).await;

        Mock::given(method("PATCH"))
            .and(path("/rest/v1/servers"))
            .and(query_param("id", "eq.s1"))
            .and(body_json(json!({"status": "inactive"})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        store.update_server_status("s1", ServerStatus::Inactive).await.unwrap();

        assert_eq!(store.servers()[0].status, ServerStatus::Inactive);
        assert!(store.error().is_none());
    }

    #[tokio::test]
    async fn status_update_rolls_back_on_failure() {
        let mock_server = MockServer::start().await;
        let store = loaded_store(&mock_server).await;

        Mock::given(method("PATCH"))
            .and(path("/rest/v1/servers"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "code": "42501",
                "message": "permission denied for table servers"
            })))
            .mount(&mock_server)
            .await;

        let result = store.update_server_status("s1", ServerStatus::Inactive).await;

        assert!(result.is_err());
        assert_eq!(store.servers()[0].status, ServerStatus::Active);
        assert_eq!(store.error().as_deref(), Some("permission denied for table servers"));

        store.clear_error();
        assert!(store.error().is_none());
    }

    // ==================== realtime tests ====================

    const WAIT: Duration = Duration::from_secs(5);

    async fn expect_event(socket: &mut WebSocketStream<TcpStream>, event: &str) -> Value {
        loop {
            let message = timeout(WAIT, socket.next()).await.unwrap().unwrap().unwrap();
            if let Message::Text(text) = message {
                let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                if frame["event"] == event {
                    return frame;
                }
            }
        }
    }

    #[tokio::test]
    async fn pushed_change_reloads_servers() {
        let mock_server = MockServer::start().await;
        let store = loaded_store(&mock_server).await;
        let mut updates = store.updates();
        updates.borrow_and_update();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let realtime = RealtimeClient::new(&format!("http://{addr}"), "anon").unwrap();
        let subscription = store.subscribe_to_servers(&realtime).unwrap();

        let (stream, _) = listener.accept().await.unwrap();
        let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();

        let join = expect_event(&mut socket, "phx_join").await;
        assert_eq!(join["topic"], "realtime:servers-channel");
        assert_eq!(join["payload"]["config"]["postgres_changes"][0]["table"], "servers");
        // No session: the anon key is the bearer.
        assert_eq!(join["payload"]["access_token"], "anon");

        let reply = json!({
            "topic": "realtime:servers-channel",
            "event": "phx_reply",
            "payload": { "status": "ok", "response": {} },
            "ref": join["ref"]
        });
        socket.send(Message::Text(reply.to_string().into())).await.unwrap();

        let change = json!({
            "topic": "realtime:servers-channel",
            "event": "postgres_changes",
            "payload": { "data": {
                "schema": "public",
                "table": "servers",
                "type": "UPDATE",
                "record": { "id": "s2", "status": "active" },
                "old_record": { "id": "s2" }
            } },
            "ref": null
        });
        socket.send(Message::Text(change.to_string().into())).await.unwrap();

        timeout(WAIT, updates.changed()).await.unwrap().unwrap();
        let fetches = mock_server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.method.as_str() == "GET")
            .count();
        assert_eq!(fetches, 2);

        drop(subscription);
        expect_event(&mut socket, "phx_leave").await;
    }
}
