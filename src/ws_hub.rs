//! Room-aware WebSocket hub built on top of the raw [`crate::ws::TakoWs`] handshake.
//!
//! `TakoWs` gets a connection from HTTP to an open [`WebSocketStream`]; everything past
//! that point (rooms, fan-out, keepalive, a JSON control-frame vocabulary, and per-route
//! event filtering) is this module's job. Each accepted connection gets its own bounded
//! mpsc writer task: the reader loop and any broadcast from another connection only ever
//! *enqueue* a message, they never write to the socket directly, so one slow peer can't
//! stall a broadcast to everyone else. Room membership lives in [`dashmap`] sets rather
//! than behind one lock, so joining, leaving, and broadcasting on different rooms never
//! contend with each other, and none of those operations span an `.await` that touches
//! the network.

use std::{
  collections::HashSet,
  sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
  },
  time::Duration,
};

use dashmap::{DashMap, DashSet};
use futures_util::{SinkExt, StreamExt};
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::{
  WebSocketStream,
  tungstenite::Message,
  tungstenite::protocol::{CloseFrame, frame::coding::CloseCode},
};
use uuid::Uuid;

use crate::{
  responder::Responder,
  signals::{EventBus, Signal, app_events, ids},
  types::{Request, Response},
  ws::TakoWs,
};

/// Unique id assigned to each accepted connection.
pub type ConnectionId = Uuid;

/// The event taxonomy a [`WsRoute`]'s enabled-event-set is drawn from. Every inbound
/// frame and transport event maps to exactly one of these before the hub checks whether
/// the route that accepted the connection allows it through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WsEvent {
  /// The connection finished its upgrade handshake.
  Connect,
  /// An application-level message: a `message`, `room_message`, or `direct_message`
  /// frame.
  Message,
  /// The connection closed.
  Close,
  /// A frame failed to parse as any recognized control frame.
  Error,
  /// A `join_room` frame.
  JoinRoom,
  /// A `leave_room` frame.
  LeaveRoom,
  /// A `ping` frame.
  Ping,
  /// A `pong` frame.
  Pong,
  /// A binary transport frame.
  Binary,
}

impl WsEvent {
  fn all() -> HashSet<WsEvent> {
    [
      WsEvent::Connect,
      WsEvent::Message,
      WsEvent::Close,
      WsEvent::Error,
      WsEvent::JoinRoom,
      WsEvent::LeaveRoom,
      WsEvent::Ping,
      WsEvent::Pong,
      WsEvent::Binary,
    ]
    .into_iter()
    .collect()
  }
}

/// A registered WebSocket endpoint: the path it answers at, plus which events it
/// accepts from a connection. Event filtering is enforced by the hub, not the host
/// handler, so a host binding never receives a frame it didn't opt into.
#[derive(Debug, Clone)]
pub struct WsRoute {
  pub path: String,
  enabled_events: HashSet<WsEvent>,
}

impl WsRoute {
  /// Creates a route at `path` with every event enabled.
  pub fn new(path: impl Into<String>) -> Self {
    Self {
      path: path.into(),
      enabled_events: WsEvent::all(),
    }
  }

  /// Restricts this route to exactly the given events; anything else is rejected (see
  /// [`WsHub::upgrade`]'s module docs on event filtering).
  pub fn with_events<I>(mut self, events: I) -> Self
  where
    I: IntoIterator<Item = WsEvent>,
  {
    self.enabled_events = events.into_iter().collect();
    self
  }

  fn allows(&self, event: WsEvent) -> bool {
    self.enabled_events.contains(&event)
  }
}

impl Default for WsRoute {
  fn default() -> Self {
    Self::new("/")
  }
}

/// JSON control frames a client may send. `Message` is the generic application payload;
/// anything that doesn't parse as any of these variants falls back to
/// [`WsHandlers::on_message`] with the raw JSON value, so a plain `{"foo": "bar"}`
/// payload (no `type` tag at all) still reaches the application callback.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundFrame {
  Ping {
    timestamp: i64,
  },
  Pong {
    timestamp: i64,
  },
  JoinRoom {
    room_id: String,
  },
  LeaveRoom {
    room_id: String,
  },
  RoomMessage {
    room_id: String,
    data: serde_json::Value,
  },
  DirectMessage {
    target_client_id: String,
    data: serde_json::Value,
  },
  Message {
    #[serde(default)]
    data: serde_json::Value,
  },
}

/// Frames the hub sends to a client, either in direct response to an [`InboundFrame`] or
/// as a side effect of another connection's action. Field names match the wire contract
/// exactly, including the hyphenated `client-id`/`server-time` on `welcome`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutboundFrame {
  Welcome {
    #[serde(rename = "client-id")]
    client_id: String,
    #[serde(rename = "server-time")]
    server_time: i64,
  },
  Ping {
    timestamp: i64,
  },
  Pong {
    timestamp: i64,
  },
  RoomJoined {
    room_id: String,
  },
  RoomLeft {
    room_id: String,
  },
  RoomMessage {
    room_id: String,
    data: serde_json::Value,
  },
  DirectMessage {
    target_client_id: String,
    data: serde_json::Value,
  },
  Message {
    data: serde_json::Value,
  },
  MessageAck {
    message: serde_json::Value,
  },
  Error {
    error: String,
    error_type: String,
  },
}

impl OutboundFrame {
  fn into_message(self) -> Message {
    Message::Text(serde_json::to_string(&self).unwrap_or_default().into())
  }
}

/// Hook invoked for every message a connection sends that isn't a recognized
/// [`InboundFrame`] variant, or for an explicit `message` frame — e.g. a host binding
/// that wants to run its own application-level protocol on top of rooms.
pub type MessageHandler = Arc<dyn Fn(ConnectionId, serde_json::Value) + Send + Sync>;
/// Hook invoked once a connection finishes its upgrade handshake.
pub type ConnectHandler = Arc<dyn Fn(ConnectionId) + Send + Sync>;
/// Hook invoked once a connection closes, after room membership has been torn down.
pub type CloseHandler = Arc<dyn Fn(ConnectionId) + Send + Sync>;
/// Hook invoked for a binary transport frame.
pub type BinaryHandler = Arc<dyn Fn(ConnectionId, Vec<u8>) + Send + Sync>;

/// Host callbacks for the events a [`WsRoute`] admits. Every field is optional: an
/// unset hook for an enabled event is simply never called, while a disabled event never
/// reaches the hook at all regardless of whether one is set.
#[derive(Clone, Default)]
pub struct WsHandlers {
  on_connect: Option<ConnectHandler>,
  on_message: Option<MessageHandler>,
  on_close: Option<CloseHandler>,
  on_binary: Option<BinaryHandler>,
}

impl WsHandlers {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn on_connect<F>(mut self, f: F) -> Self
  where
    F: Fn(ConnectionId) + Send + Sync + 'static,
  {
    self.on_connect = Some(Arc::new(f));
    self
  }

  pub fn on_message<F>(mut self, f: F) -> Self
  where
    F: Fn(ConnectionId, serde_json::Value) + Send + Sync + 'static,
  {
    self.on_message = Some(Arc::new(f));
    self
  }

  pub fn on_close<F>(mut self, f: F) -> Self
  where
    F: Fn(ConnectionId) + Send + Sync + 'static,
  {
    self.on_close = Some(Arc::new(f));
    self
  }

  pub fn on_binary<F>(mut self, f: F) -> Self
  where
    F: Fn(ConnectionId, Vec<u8>) + Send + Sync + 'static,
  {
    self.on_binary = Some(Arc::new(f));
    self
  }
}

struct ConnectionHandle {
  writer: mpsc::Sender<Message>,
  rooms: DashSet<String>,
  last_pong: Arc<AtomicI64>,
}

/// Central registry of open WebSocket connections and the rooms they belong to.
///
/// Construct one per application and share it across every upgraded connection via
/// `Arc<WsHub>`; [`WsHub::upgrade`] is the entry point a route handler calls to accept
/// an incoming upgrade request.
pub struct WsHub {
  connections: DashMap<ConnectionId, ConnectionHandle>,
  rooms: DashMap<String, DashSet<ConnectionId>>,
  events: EventBus,
  ping_interval: Duration,
  pong_timeout: Duration,
  writer_buffer: usize,
}

impl Default for WsHub {
  fn default() -> Self {
    Self::new()
  }
}

impl WsHub {
  /// Creates an empty hub with a 20 second keepalive ping interval, a 60 second pong
  /// timeout, and a 64-message writer buffer per connection.
  pub fn new() -> Self {
    Self {
      connections: DashMap::new(),
      rooms: DashMap::new(),
      events: app_events().clone(),
      ping_interval: Duration::from_secs(20),
      pong_timeout: Duration::from_secs(60),
      writer_buffer: 64,
    }
  }

  pub fn with_keepalive(mut self, ping_interval: Duration, pong_timeout: Duration) -> Self {
    self.ping_interval = ping_interval;
    self.pong_timeout = pong_timeout;
    self
  }

  /// Number of currently open connections.
  pub fn connection_count(&self) -> usize {
    self.connections.len()
  }

  /// Number of members currently in `room`.
  pub fn room_size(&self, room: &str) -> usize {
    self.rooms.get(room).map(|members| members.len()).unwrap_or(0)
  }

  /// Accepts a WebSocket upgrade request, registering the resulting connection with the
  /// hub under `route`'s event filter and invoking `handlers` for the events it admits.
  /// Sends a `welcome` frame as soon as the upgrade completes, per the control
  /// protocol's state machine (`Handshaking` -> `Open`).
  pub fn upgrade(self: &Arc<Self>, req: Request, route: WsRoute, handlers: WsHandlers) -> Response {
    let hub = self.clone();
    TakoWs::new(req, move |stream| hub.run_connection(stream, route, handlers)).into_response()
  }

  /// Sends `data` to every member of `room` except `exclude` (pass `None` to include
  /// everyone, including the sender when called from inside a message handler).
  pub fn send_to_room(&self, room: &str, data: &serde_json::Value, exclude: Option<ConnectionId>) {
    let Some(members) = self.rooms.get(room) else {
      return;
    };
    let message = OutboundFrame::RoomMessage {
      room_id: room.to_string(),
      data: data.clone(),
    }
    .into_message();
    for member in members.iter() {
      if Some(*member) == exclude {
        continue;
      }
      self.enqueue(*member, message.clone());
    }
  }

  /// Sends `data` to every open connection as a `message` frame.
  pub fn broadcast(&self, data: &serde_json::Value) {
    let message = OutboundFrame::Message { data: data.clone() }.into_message();
    for entry in self.connections.iter() {
      self.enqueue(*entry.key(), message.clone());
    }
  }

  fn enqueue(&self, conn: ConnectionId, message: Message) {
    if let Some(handle) = self.connections.get(&conn) {
      let _ = handle.writer.try_send(message);
    }
  }

  fn send_error(&self, conn: ConnectionId, error: &str, error_type: &str) {
    self.enqueue(
      conn,
      OutboundFrame::Error {
        error: error.to_string(),
        error_type: error_type.to_string(),
      }
      .into_message(),
    );
  }

  fn join(&self, conn: ConnectionId, room: &str) {
    self.rooms.entry(room.to_string()).or_default().insert(conn);
    if let Some(handle) = self.connections.get(&conn) {
      handle.rooms.insert(room.to_string());
    }
  }

  fn leave(&self, conn: ConnectionId, room: &str) {
    if let Some(members) = self.rooms.get(room) {
      members.remove(&conn);
    }
    if let Some(handle) = self.connections.get(&conn) {
      handle.rooms.remove(room);
    }
  }

  fn leave_all(&self, conn: ConnectionId) {
    if let Some((_, handle)) = self.connections.remove(&conn) {
      for room in handle.rooms.iter() {
        if let Some(members) = self.rooms.get(room.key()) {
          members.remove(&conn);
        }
      }
    }
  }

  async fn run_connection(self: Arc<Self>, stream: WebSocketStream<TokioIo<Upgraded>>, route: WsRoute, handlers: WsHandlers) {
    let conn_id = Uuid::new_v4();
    let client_id = conn_id.to_string();
    let (mut sink, mut source) = stream.split();
    let (writer_tx, mut writer_rx) = mpsc::channel::<Message>(self.writer_buffer);
    let last_pong = Arc::new(AtomicI64::new(now_secs()));

    self.connections.insert(
      conn_id,
      ConnectionHandle {
        writer: writer_tx.clone(),
        rooms: DashSet::new(),
        last_pong: last_pong.clone(),
      },
    );
    self.events.emit(Signal::new(ids::CONNECTION_OPENED)).await;

    let writer_task = tokio::spawn(async move {
      while let Some(message) = writer_rx.recv().await {
        let done = matches!(message, Message::Close(_));
        if sink.send(message).await.is_err() {
          break;
        }
        if done {
          break;
        }
      }
    });

    let _ = writer_tx.try_send(
      OutboundFrame::Welcome {
        client_id: client_id.clone(),
        server_time: now_secs(),
      }
      .into_message(),
    );
    if route.allows(WsEvent::Connect)
      && let Some(on_connect) = &handlers.on_connect
    {
      on_connect(conn_id);
    }

    let keepalive_tx = writer_tx.clone();
    let keepalive_pong = last_pong.clone();
    let ping_interval = self.ping_interval;
    let pong_timeout = self.pong_timeout;
    let keepalive_task = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(ping_interval);
      loop {
        ticker.tick().await;
        let elapsed = now_secs() - keepalive_pong.load(Ordering::Relaxed);
        if elapsed > pong_timeout.as_secs() as i64 {
          let close = Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "No pong".into(),
          }));
          let _ = keepalive_tx.try_send(close);
          break;
        }
        let ping = OutboundFrame::Ping { timestamp: now_secs() }.into_message();
        if keepalive_tx.try_send(ping).is_err() {
          break;
        }
      }
    });

    while let Some(frame) = source.next().await {
      let Ok(frame) = frame else { break };
      match frame {
        Message::Text(text) => self.handle_text(conn_id, &text, &route, &handlers, &last_pong),
        Message::Binary(data) => {
          if route.allows(WsEvent::Binary)
            && let Some(on_binary) = &handlers.on_binary
          {
            on_binary(conn_id, data.to_vec());
          }
        }
        Message::Pong(_) => {
          last_pong.store(now_secs(), Ordering::Relaxed);
        }
        Message::Ping(payload) => {
          let _ = writer_tx.try_send(Message::Pong(payload));
        }
        Message::Close(_) => break,
        Message::Frame(_) => {}
      }
    }

    keepalive_task.abort();
    self.leave_all(conn_id);
    writer_task.abort();
    self.events.emit(Signal::new(ids::CONNECTION_CLOSED)).await;
    if route.allows(WsEvent::Close)
      && let Some(on_close) = &handlers.on_close
    {
      on_close(conn_id);
    }
  }

  fn handle_text(&self, conn: ConnectionId, text: &str, route: &WsRoute, handlers: &WsHandlers, last_pong: &AtomicI64) {
    let raw: serde_json::Value = match serde_json::from_str(text) {
      Ok(value) => value,
      Err(_) => {
        if route.allows(WsEvent::Error) {
          self.send_error(conn, "invalid frame", "invalid_frame");
        }
        return;
      }
    };

    let frame: InboundFrame = match serde_json::from_value(raw.clone()) {
      Ok(frame) => frame,
      Err(_) => {
        if !route.allows(WsEvent::Message) {
          return;
        }
        if let Some(on_message) = &handlers.on_message {
          on_message(conn, raw);
        }
        return;
      }
    };

    match frame {
      // Protocol-level ping/pong replies are always sent, even on a route that
      // doesn't admit the `ping`/`pong` events, matching the keepalive contract.
      InboundFrame::Ping { timestamp } => {
        self.enqueue(conn, OutboundFrame::Pong { timestamp }.into_message());
      }
      InboundFrame::Pong { .. } => {
        last_pong.store(now_secs(), Ordering::Relaxed);
      }
      InboundFrame::JoinRoom { room_id } => {
        if !route.allows(WsEvent::JoinRoom) {
          self.send_error(conn, "join_room is disabled on this route", "event_disabled");
          return;
        }
        self.join(conn, &room_id);
        self.enqueue(conn, OutboundFrame::RoomJoined { room_id }.into_message());
      }
      InboundFrame::LeaveRoom { room_id } => {
        if !route.allows(WsEvent::LeaveRoom) {
          self.send_error(conn, "leave_room is disabled on this route", "event_disabled");
          return;
        }
        self.leave(conn, &room_id);
        self.enqueue(conn, OutboundFrame::RoomLeft { room_id }.into_message());
      }
      InboundFrame::RoomMessage { room_id, data } => {
        if !route.allows(WsEvent::Message) {
          self.send_error(conn, "room_message is disabled on this route", "event_disabled");
          return;
        }
        self.send_to_room(&room_id, &data, Some(conn));
        self.enqueue(conn, OutboundFrame::MessageAck { message: raw }.into_message());
      }
      InboundFrame::DirectMessage { target_client_id, data } => {
        if !route.allows(WsEvent::Message) {
          self.send_error(conn, "direct_message is disabled on this route", "event_disabled");
          return;
        }
        match target_client_id.parse::<Uuid>() {
          Ok(target) if self.connections.contains_key(&target) => {
            self.enqueue(
              target,
              OutboundFrame::DirectMessage {
                target_client_id: target_client_id.clone(),
                data,
              }
              .into_message(),
            );
            self.enqueue(conn, OutboundFrame::MessageAck { message: raw }.into_message());
          }
          _ => self.send_error(conn, "no connection with that client-id", "not_found"),
        }
      }
      InboundFrame::Message { data } => {
        if !route.allows(WsEvent::Message) {
          return;
        }
        if let Some(on_message) = &handlers.on_message {
          on_message(conn, data);
        }
      }
    }
  }
}

fn now_secs() -> i64 {
  std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .map(|d| d.as_secs() as i64)
    .unwrap_or(0)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn join_and_leave_update_room_membership() {
    let hub = WsHub::new();
    let conn = Uuid::new_v4();
    hub.connections.insert(
      conn,
      ConnectionHandle {
        writer: mpsc::channel(1).0,
        rooms: DashSet::new(),
        last_pong: Arc::new(AtomicI64::new(now_secs())),
      },
    );

    hub.join(conn, "lobby");
    assert_eq!(hub.room_size("lobby"), 1);

    hub.leave(conn, "lobby");
    assert_eq!(hub.room_size("lobby"), 0);
  }

  #[test]
  fn leave_all_removes_connection_from_every_room() {
    let hub = WsHub::new();
    let conn = Uuid::new_v4();
    hub.connections.insert(
      conn,
      ConnectionHandle {
        writer: mpsc::channel(1).0,
        rooms: DashSet::new(),
        last_pong: Arc::new(AtomicI64::new(now_secs())),
      },
    );
    hub.join(conn, "a");
    hub.join(conn, "b");

    hub.leave_all(conn);
    assert_eq!(hub.room_size("a"), 0);
    assert_eq!(hub.room_size("b"), 0);
    assert_eq!(hub.connection_count(), 0);
  }

  #[test]
  fn welcome_frame_round_trips_required_fields() {
    let frame = OutboundFrame::Welcome {
      client_id: "abc".to_string(),
      server_time: 1234,
    };
    let json = serde_json::to_value(&frame).unwrap();
    assert_eq!(json["type"], "welcome");
    assert_eq!(json["client-id"], "abc");
    assert_eq!(json["server-time"], 1234);
  }

  #[test]
  fn inbound_frames_parse_with_the_spec_vocabulary() {
    let join: InboundFrame = serde_json::from_str(r#"{"type":"join_room","room_id":"lobby"}"#).unwrap();
    assert!(matches!(join, InboundFrame::JoinRoom { room_id } if room_id == "lobby"));

    let direct: InboundFrame =
      serde_json::from_str(r#"{"type":"direct_message","target_client_id":"x","data":42}"#).unwrap();
    assert!(matches!(direct, InboundFrame::DirectMessage { target_client_id, .. } if target_client_id == "x"));

    let ping: InboundFrame = serde_json::from_str(r#"{"type":"ping","timestamp":1}"#).unwrap();
    assert!(matches!(ping, InboundFrame::Ping { timestamp: 1 }));
  }

  #[test]
  fn ws_route_defaults_to_every_event_enabled_and_can_be_restricted() {
    let route = WsRoute::new("/chat");
    assert!(route.allows(WsEvent::JoinRoom));
    assert!(route.allows(WsEvent::Binary));

    let restricted = WsRoute::new("/game").with_events([WsEvent::Connect, WsEvent::Message, WsEvent::Close]);
    assert!(restricted.allows(WsEvent::Message));
    assert!(!restricted.allows(WsEvent::JoinRoom));
  }

  #[tokio::test]
  async fn disabled_event_yields_event_disabled_error_without_mutating_rooms() {
    let hub = WsHub::new();
    let conn = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel(4);
    hub.connections.insert(
      conn,
      ConnectionHandle {
        writer: tx,
        rooms: DashSet::new(),
        last_pong: Arc::new(AtomicI64::new(now_secs())),
      },
    );

    let route = WsRoute::new("/game").with_events([WsEvent::Connect, WsEvent::Message, WsEvent::Close]);
    let handlers = WsHandlers::new();
    let last_pong = AtomicI64::new(now_secs());

    hub.handle_text(conn, r#"{"type":"join_room","room_id":"x"}"#, &route, &handlers, &last_pong);

    assert_eq!(hub.room_size("x"), 0);
    let sent = rx.try_recv().unwrap();
    let Message::Text(text) = sent else { panic!("expected text frame") };
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["type"], "error");
    assert_eq!(value["error_type"], "event_disabled");
  }

  #[tokio::test]
  async fn room_message_fans_out_and_acks_sender() {
    let hub = WsHub::new();
    let sender = Uuid::new_v4();
    let receiver = Uuid::new_v4();
    let (sender_tx, mut sender_rx) = mpsc::channel(4);
    let (receiver_tx, mut receiver_rx) = mpsc::channel(4);
    hub.connections.insert(
      sender,
      ConnectionHandle {
        writer: sender_tx,
        rooms: DashSet::new(),
        last_pong: Arc::new(AtomicI64::new(now_secs())),
      },
    );
    hub.connections.insert(
      receiver,
      ConnectionHandle {
        writer: receiver_tx,
        rooms: DashSet::new(),
        last_pong: Arc::new(AtomicI64::new(now_secs())),
      },
    );
    hub.join(sender, "r");
    hub.join(receiver, "r");

    let route = WsRoute::new("/chat");
    let handlers = WsHandlers::new();
    let last_pong = AtomicI64::new(now_secs());
    hub.handle_text(
      sender,
      r#"{"type":"room_message","room_id":"r","data":"hi"}"#,
      &route,
      &handlers,
      &last_pong,
    );

    let Message::Text(to_receiver) = receiver_rx.try_recv().unwrap() else {
      panic!("expected text frame")
    };
    let receiver_value: serde_json::Value = serde_json::from_str(&to_receiver).unwrap();
    assert_eq!(receiver_value["type"], "room_message");
    assert_eq!(receiver_value["data"], "hi");

    let Message::Text(to_sender) = sender_rx.try_recv().unwrap() else {
      panic!("expected text frame")
    };
    let sender_value: serde_json::Value = serde_json::from_str(&to_sender).unwrap();
    assert_eq!(sender_value["type"], "message_ack");
    assert!(sender_rx.try_recv().is_err());
  }
}
