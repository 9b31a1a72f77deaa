//! Supabase Realtime change feeds.
//!
//! [`RealtimeClient::subscribe`] joins a channel on the project's Realtime
//! websocket and forwards the `postgres_changes` events of one table to a
//! [`ChangeFeed`]. The socket is kept alive with heartbeats and reopened
//! with backoff until the feed is dropped, at which point the channel is
//! left and the socket closed.
//!
//! # Protocol
//!
//! Messages are Phoenix channel frames (`vsn=1.0.0`):
//!
//! ```json
//! {"topic": "realtime:servers-channel", "event": "phx_join", "payload": {...}, "ref": "1", "join_ref": "1"}
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::backend::BackendError;

/// Interval between heartbeats on an open socket.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// Delays before reconnect attempts. The last one repeats.
const RECONNECT_DELAYS: [Duration; 4] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
];

const PROTOCOL_VERSION: &str = "1.0.0";

/// Changes buffered before the socket stops being read.
const FEED_BUFFER: usize = 64;

static NEXT_FEED_ID: AtomicU64 = AtomicU64::new(1);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        })
    }
}

/// A row change pushed by Realtime.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub commit_timestamp: Option<String>,
    /// New row, for inserts and updates.
    #[serde(default)]
    pub record: Option<Value>,
    /// Previous row (primary key only unless the table has full replica
    /// identity), for updates and deletes.
    #[serde(default)]
    pub old_record: Option<Value>,
}

/// Which changes a channel listens to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableFilter {
    /// `INSERT`, `UPDATE`, `DELETE` or `*`.
    pub event: String,
    pub schema: String,
    pub table: String,
}

impl TableFilter {
    /// Every change to a table in the `public` schema.
    pub fn all_changes(table: impl Into<String>) -> Self {
        Self {
            event: "*".to_string(),
            schema: "public".to_string(),
            table: table.into(),
        }
    }
}

/// Opens change feeds against a Supabase project.
#[derive(Clone)]
pub struct RealtimeClient {
    endpoint: String,
    anon_key: String,
}

impl RealtimeClient {
    /// Creates a client for the project at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Configuration`] if `base_url` is not an
    /// `http` or `https` URL.
    pub fn new(base_url: &str, anon_key: impl Into<String>) -> Result<Self, BackendError> {
        let base = base_url.trim_end_matches('/');
        let socket_base = if let Some(host) = base.strip_prefix("https://") {
            format!("wss://{host}")
        } else if let Some(host) = base.strip_prefix("http://") {
            format!("ws://{host}")
        } else {
            return Err(BackendError::Configuration(format!(
                "realtime needs an http or https project URL, got '{base_url}'"
            )));
        };

        Ok(Self {
            endpoint: format!("{socket_base}/realtime/v1/websocket"),
            anon_key: anon_key.into(),
        })
    }

    /// Returns the websocket endpoint, without query parameters.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn socket_url(&self) -> String {
        format!("{}?apikey={}&vsn={PROTOCOL_VERSION}", self.endpoint, self.anon_key)
    }

    /// Joins `channel` and starts forwarding the changes matched by
    /// `filter`. `access_token` is sent with every join so row-level
    /// security applies to the pushed rows.
    ///
    /// The connection runs on a background task until the returned feed is
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Configuration`] when called outside a Tokio
    /// runtime.
    pub fn subscribe(
        &self,
        channel: &str,
        filter: TableFilter,
        access_token: impl Into<String>,
    ) -> Result<ChangeFeed, BackendError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BackendError::Configuration(format!("realtime needs a Tokio runtime: {e}")))?;

        let id = NEXT_FEED_ID.fetch_add(1, Ordering::Relaxed);
        let channel = Channel {
            topic: format!("realtime:{channel}"),
            filter,
            access_token: access_token.into(),
        };
        info!(feed_id = id, topic = %channel.topic, table = %channel.filter.table, "Subscribing to realtime changes");

        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        runtime.spawn(run_feed(self.socket_url(), channel, tx, id));
        Ok(ChangeFeed { id, events: rx })
    }
}

impl fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Receiving end of a channel subscription.
///
/// Dropping the feed leaves the channel and closes the socket.
#[derive(Debug)]
pub struct ChangeFeed {
    id: u64,
    events: mpsc::Receiver<ChangeEvent>,
}

impl ChangeFeed {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the next change. Connection drops are retried internally
    /// and do not end the feed.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }
}

struct Channel {
    topic: String,
    filter: TableFilter,
    access_token: String,
}

impl Channel {
    fn join_message(&self, join_ref: &str) -> String {
        json!({
            "topic": self.topic,
            "event": "phx_join",
            "payload": {
                "config": {
                    "broadcast": { "ack": false, "self": false },
                    "presence": { "key": "" },
                    "postgres_changes": [self.filter],
                    "private": false
                },
                "access_token": self.access_token
            },
            "ref": join_ref,
            "join_ref": join_ref
        })
        .to_string()
    }

    fn leave_message(&self, msg_ref: &str) -> String {
        json!({
            "topic": self.topic,
            "event": "phx_leave",
            "payload": {},
            "ref": msg_ref
        })
        .to_string()
    }
}

fn heartbeat_message(msg_ref: &str) -> String {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": msg_ref
    })
    .to_string()
}

/// Message references, unique per connection.
#[derive(Default)]
struct Refs(u64);

impl Refs {
    fn next(&mut self) -> String {
        self.0 += 1;
        self.0.to_string()
    }
}

#[derive(Deserialize)]
struct Envelope {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    msg_ref: Option<String>,
}

#[derive(Debug, PartialEq)]
enum Inbound {
    Change(ChangeEvent),
    Joined,
    JoinFailed(String),
    Closed(String),
    Ignored,
}

fn parse_inbound(text: &str, topic: &str, join_ref: &str) -> Result<Inbound, serde_json::Error> {
    let Envelope {
        topic: message_topic,
        event,
        payload,
        msg_ref,
    } = serde_json::from_str(text)?;

    // Heartbeat replies arrive on the "phoenix" topic.
    if message_topic != topic {
        return Ok(Inbound::Ignored);
    }

    Ok(match event.as_str() {
        "phx_reply" if msg_ref.as_deref() == Some(join_ref) => {
            if payload.get("status").and_then(Value::as_str) == Some("ok") {
                Inbound::Joined
            } else {
                let reason = payload
                    .pointer("/response/reason")
                    .and_then(Value::as_str)
                    .unwrap_or("join rejected");
                Inbound::JoinFailed(reason.to_string())
            }
        }
        "postgres_changes" => {
            let data = payload.get("data").cloned().unwrap_or(Value::Null);
            Inbound::Change(serde_json::from_value(data)?)
        }
        "phx_error" => Inbound::Closed("channel crashed on the server".to_string()),
        "phx_close" => Inbound::Closed("channel closed by the server".to_string()),
        _ => Inbound::Ignored,
    })
}

/// Why a connection ended while the feed was still wanted.
struct Disconnect {
    joined: bool,
    reason: String,
}

impl Disconnect {
    fn new(joined: bool, reason: impl Into<String>) -> Self {
        Self {
            joined,
            reason: reason.into(),
        }
    }
}

async fn run_feed(url: String, channel: Channel, tx: mpsc::Sender<ChangeEvent>, feed_id: u64) {
    let mut failures = 0usize;

    loop {
        let disconnect = match run_connection(&url, &channel, &tx).await {
            Ok(()) => {
                debug!(feed_id, "Realtime feed dropped, connection task exiting");
                return;
            }
            Err(disconnect) => disconnect,
        };

        if disconnect.joined {
            failures = 0;
        }
        let delay = RECONNECT_DELAYS[failures.min(RECONNECT_DELAYS.len() - 1)];
        failures += 1;
        warn!(feed_id, reason = %disconnect.reason, retry_in = ?delay, "Realtime connection lost");

        tokio::select! {
            _ = tx.closed() => return,
            _ = sleep(delay) => {}
        }
    }
}

/// Runs one socket until the feed is dropped (`Ok`) or the connection ends.
async fn run_connection(
    url: &str,
    channel: &Channel,
    tx: &mpsc::Sender<ChangeEvent>,
) -> Result<(), Disconnect> {
    let mut socket = tokio::select! {
        _ = tx.closed() => return Ok(()),
        result = connect_async(url) => match result {
            Ok((socket, _response)) => socket,
            Err(e) => return Err(Disconnect::new(false, format!("connect failed: {e}"))),
        },
    };
    debug!(topic = %channel.topic, "Realtime socket open");

    let mut refs = Refs::default();
    let join_ref = refs.next();
    send(&mut socket, channel.join_message(&join_ref))
        .await
        .map_err(|e| Disconnect::new(false, e))?;

    let mut joined = false;
    let mut heartbeat = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tx.closed() => {
                // Best effort: the server also drops the channel with the socket.
                let _ = send(&mut socket, channel.leave_message(&refs.next())).await;
                let _ = socket.close(None).await;
                info!(topic = %channel.topic, "Left realtime channel");
                return Ok(());
            }
            _ = heartbeat.tick() => {
                send(&mut socket, heartbeat_message(&refs.next()))
                    .await
                    .map_err(|e| Disconnect::new(joined, e))?;
            }
            message = socket.next() => {
                let text = match message {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(Disconnect::new(joined, "socket closed"));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(Disconnect::new(joined, format!("socket error: {e}"))),
                };

                match parse_inbound(text.as_str(), &channel.topic, &join_ref) {
                    Ok(Inbound::Joined) => {
                        joined = true;
                        info!(topic = %channel.topic, "Joined realtime channel");
                    }
                    Ok(Inbound::JoinFailed(reason)) => {
                        return Err(Disconnect::new(joined, format!("join rejected: {reason}")));
                    }
                    Ok(Inbound::Closed(reason)) => return Err(Disconnect::new(joined, reason)),
                    Ok(Inbound::Change(event)) => {
                        debug!(table = %event.table, kind = %event.kind, "Realtime change received");
                        // A failed send means the feed was dropped; the next
                        // turn of the loop leaves the channel.
                        let _ = tx.send(event).await;
                    }
                    Ok(Inbound::Ignored) => {}
                    Err(e) => warn!(error = %e, "Ignoring malformed realtime message"),
                }
            }
        }
    }
}

async fn send(socket: &mut Socket, text: String) -> Result<(), String> {
    socket
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| format!("send failed: {e}"))
}
