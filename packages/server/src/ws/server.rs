//! WebSocket server implementation for managing client connections.
//!
//! This module provides a multi-room WebSocket server that owns the connection
//! registry, processes inbound control frames, and fans domain events out to
//! the rooms the routing table names. Commands are processed one at a time, in
//! arrival order, so every effect of one command lands before the next command
//! starts.

use std::{
    collections::{BTreeMap, BTreeSet},
    io,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use mebelplace_ws::{
    PushFallback, Room, WebsocketContext, WebsocketMessageError, WebsocketSendError,
    WebsocketSender, broadcast_event, joined_chat,
    models::{DomainEvent, InboundPayload, NewMessage, UserPresence},
    typing_started, typing_stopped,
};
use rand::Rng as _;
use serde_json::json;
use strum_macros::AsRefStr;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::ws::{ConnId, Msg};

#[async_trait]
impl WebsocketSender for WsServer {
    async fn send(&self, connection_id: &str, data: &str) -> Result<(), WebsocketSendError> {
        let id = connection_id.parse::<ConnId>()?;
        log::debug!("Sending to {id}");
        self.send_message_to(id, data.to_owned());
        Ok(())
    }

    async fn send_room(&self, room: &Room, data: &str) -> Result<usize, WebsocketSendError> {
        let Some(members) = self.rooms.get(room) else {
            return Ok(0);
        };

        for conn_id in members {
            if let Some(Connection { sender, .. }) = self.connections.get(conn_id) {
                // errors if client disconnected abruptly and hasn't been timed-out yet
                let _ = sender.send(data.to_owned());
            }
        }

        Ok(members.len())
    }

    async fn send_room_except(
        &self,
        room: &Room,
        connection_id: &str,
        data: &str,
    ) -> Result<usize, WebsocketSendError> {
        let skip = connection_id.parse::<ConnId>()?;

        let Some(members) = self.rooms.get(room) else {
            return Ok(0);
        };

        let mut sent = 0;

        for conn_id in members {
            if *conn_id != skip
                && let Some(Connection { sender, .. }) = self.connections.get(conn_id)
            {
                // errors if client disconnected abruptly and hasn't been timed-out yet
                let _ = sender.send(data.to_owned());
                sent += 1;
            }
        }

        Ok(sent)
    }
}

/// A command received by the [`WsServer`].
#[derive(Debug, AsRefStr)]
pub enum Command {
    /// Registers a new WebSocket connection.
    Connect {
        /// User this connection authenticated as, if any.
        user_id: Option<u64>,
        /// Channel sender for messages to this connection.
        conn_tx: mpsc::UnboundedSender<Msg>,
        /// Channel to send back the assigned connection ID.
        res_tx: oneshot::Sender<ConnId>,
    },

    /// Removes a WebSocket connection.
    Disconnect {
        /// Connection ID to disconnect.
        conn: ConnId,
    },

    /// Processes an incoming control frame from a connection.
    Message {
        /// The received message.
        msg: Msg,
        /// Connection ID that sent the message.
        conn: ConnId,
        /// Channel to signal completion.
        res_tx: oneshot::Sender<()>,
    },

    /// Fans a domain event out to its target rooms.
    Broadcast {
        /// The event to broadcast.
        event: DomainEvent,
        /// Channel to signal completion.
        res_tx: oneshot::Sender<()>,
    },
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Represents an active WebSocket connection.
#[derive(Debug, Clone)]
struct Connection {
    /// User this connection belongs to, once identified.
    user_id: Option<u64>,
    /// Channel for sending messages to this connection.
    sender: mpsc::UnboundedSender<Msg>,
}

/// A multi-room ws server.
///
/// Owns the connection registry: which connections exist, which user each one
/// belongs to, and which rooms each one is in. The room index and the
/// per-connection membership index mirror each other.
///
/// Call and spawn [`run`](Self::run) to start processing commands.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug)]
pub struct WsServer {
    /// Map of connection IDs to their message senders.
    connections: BTreeMap<ConnId, Connection>,

    /// Map of room to participant IDs in that room.
    rooms: BTreeMap<Room, BTreeSet<ConnId>>,

    /// Map of connection ID to the rooms it is a member of.
    memberships: BTreeMap<ConnId, BTreeSet<Room>>,

    /// Map of user ID to that user's live connections.
    users: BTreeMap<u64, BTreeSet<ConnId>>,

    /// Tracks total number of connected clients.
    visitor_count: Arc<AtomicUsize>,

    /// Delivery channel of last resort for users with no connections.
    push: Arc<dyn PushFallback>,

    /// Command receiver.
    cmd_rx: flume::Receiver<Command>,

    token: CancellationToken,
}

impl WsServer {
    #[must_use]
    pub fn new(push: Arc<dyn PushFallback>) -> (Self, WsServerHandle) {
        // create empty server with the default room
        let mut rooms = BTreeMap::new();
        rooms.insert(Room::Broadcast, BTreeSet::new());

        let (cmd_tx, cmd_rx) = flume::unbounded();
        let token = CancellationToken::new();
        let handle = WsServerHandle {
            cmd_tx,
            token: token.clone(),
        };

        (
            Self {
                connections: BTreeMap::new(),
                rooms,
                memberships: BTreeMap::new(),
                users: BTreeMap::new(),
                visitor_count: Arc::new(AtomicUsize::new(0)),
                push,
                cmd_rx,
                token,
            },
            handle,
        )
    }

    /// Send message directly to the user.
    fn send_message_to(&self, id: ConnId, msg: impl Into<String>) {
        if let Some(Connection { sender, .. }) = self.connections.get(&id) {
            // errors if client disconnected abruptly and hasn't been timed-out yet
            let _ = sender.send(msg.into());
        }
    }

    async fn broadcast(&self, event: &DomainEvent) {
        if let Err(e) = broadcast_event(self, &*self.push, event).await {
            log::error!("Failed to broadcast event {event}: {e:?}");
        }
    }

    /// Register new connection and assign unique ID to it.
    async fn connect(&mut self, user_id: Option<u64>, tx: mpsc::UnboundedSender<Msg>) -> ConnId {
        // register connection with random connection ID
        let conn_id = rand::rng().random::<u64>();

        log::debug!("Connection {conn_id} joined (user: {user_id:?})");

        self.connections.insert(
            conn_id,
            Connection {
                user_id: None,
                sender: tx,
            },
        );
        self.memberships.insert(conn_id, BTreeSet::new());

        // auto join connection to the broadcast room
        self.join(conn_id, Room::Broadcast);

        let count = self.visitor_count.fetch_add(1, Ordering::SeqCst);
        log::debug!("Visitor count: {}", count + 1);

        if let Some(user_id) = user_id {
            self.identify(conn_id, user_id).await;
        }

        conn_id
    }

    /// Marks `conn_id` as belonging to `user_id` and joins its personal room.
    ///
    /// The user's first live connection triggers a presence broadcast. Extra
    /// tabs do not.
    async fn identify(&mut self, conn_id: ConnId, user_id: u64) {
        let Some(connection) = self.connections.get_mut(&conn_id) else {
            log::debug!("Ignoring identify for unknown connection {conn_id}");
            return;
        };

        match connection.user_id {
            Some(existing) if existing == user_id => {
                self.join(conn_id, Room::User(user_id));
                return;
            }
            Some(existing) => {
                log::warn!(
                    "Connection {conn_id} is already identified as user {existing}; ignoring user {user_id}"
                );
                return;
            }
            None => {}
        }

        connection.user_id = Some(user_id);

        let conns = self.users.entry(user_id).or_default();
        conns.insert(conn_id);
        let went_online = conns.len() == 1;

        self.join(conn_id, Room::User(user_id));

        if went_online {
            self.broadcast(&DomainEvent::UserOnline(UserPresence { user_id }))
                .await;
        }
    }

    /// Adds `conn_id` to `room`. Joining a room twice is a no-op.
    fn join(&mut self, conn_id: ConnId, room: Room) {
        if !self.connections.contains_key(&conn_id) {
            log::debug!("Ignoring join to {room} for unknown connection {conn_id}");
            return;
        }

        log::debug!("Connection {conn_id} joining {room}");

        self.rooms.entry(room).or_default().insert(conn_id);
        self.memberships.entry(conn_id).or_default().insert(room);
    }

    /// Removes `conn_id` from `room`. Leaving a room the connection is not in
    /// is a no-op. Empty rooms are dropped from the index, except the
    /// broadcast room which always exists.
    fn leave(&mut self, conn_id: ConnId, room: Room) {
        log::debug!("Connection {conn_id} leaving {room}");

        if let Some(members) = self.rooms.get_mut(&room) {
            members.remove(&conn_id);

            if members.is_empty() && room != Room::Broadcast {
                self.rooms.remove(&room);
            }
        }

        if let Some(rooms) = self.memberships.get_mut(&conn_id) {
            rooms.remove(&room);
        }
    }

    /// Unregister connection from every index. Safe to call more than once,
    /// cleanup happens exactly once.
    async fn disconnect(&mut self, conn_id: ConnId) {
        let Some(connection) = self.connections.remove(&conn_id) else {
            log::debug!("Connection {conn_id} already disconnected");
            return;
        };

        log::debug!("Connection {conn_id} disconnected");

        if let Some(rooms) = self.memberships.remove(&conn_id) {
            for room in rooms {
                if let Some(members) = self.rooms.get_mut(&room) {
                    members.remove(&conn_id);

                    if members.is_empty() && room != Room::Broadcast {
                        self.rooms.remove(&room);
                    }
                }
            }
        }

        let count = self.visitor_count.fetch_sub(1, Ordering::SeqCst);
        log::debug!("Visitor count: {}", count - 1);

        if let Some(user_id) = connection.user_id {
            let went_offline = self.users.get_mut(&user_id).is_some_and(|conns| {
                conns.remove(&conn_id);
                conns.is_empty()
            });

            if went_offline {
                self.users.remove(&user_id);
                self.broadcast(&DomainEvent::UserOffline(UserPresence { user_id }))
                    .await;
            }
        }
    }

    async fn on_message(&mut self, conn_id: ConnId, msg: Msg) -> Result<(), WebsocketMessageError> {
        let payload = serde_json::from_str::<InboundPayload>(&msg)
            .map_err(|e| WebsocketMessageError::InvalidPayload(msg.clone(), e.to_string()))?;

        let context = WebsocketContext {
            connection_id: conn_id.to_string(),
            user_id: self.connections.get(&conn_id).and_then(|c| c.user_id),
        };

        log::debug!(
            "Received message type {payload} from {}",
            context.connection_id
        );

        match payload {
            InboundPayload::Ping(..) => {
                log::trace!("Ping from connection {conn_id}");
            }
            InboundPayload::JoinUserRoom(payload) => {
                self.identify(conn_id, payload.payload.user_id).await;
            }
            InboundPayload::JoinOrderRoom(payload) => {
                self.join(conn_id, Room::Order(payload.payload.order_id));
            }
            InboundPayload::JoinChat(payload) => {
                let chat_id = payload.payload.chat_id;

                self.join(conn_id, Room::Chat(chat_id));

                let ack = serde_json::to_value(joined_chat(chat_id))?.to_string();
                self.send(&context.connection_id, &ack).await?;
            }
            InboundPayload::LeaveChat(payload) => {
                self.leave(conn_id, Room::Chat(payload.payload.chat_id));
            }
            InboundPayload::SendMessage(payload) => {
                let user_id = context
                    .user_id
                    .ok_or(WebsocketMessageError::MissingUserId)?;
                let send = payload.payload;

                let event = DomainEvent::NewMessage(NewMessage {
                    chat_id: send.chat_id,
                    message: json!({
                        "content": send.content,
                        "type": send.kind,
                        "replyTo": send.reply_to,
                        "senderId": user_id,
                    }),
                    sender_id: user_id,
                });

                self.broadcast(&event).await;
            }
            InboundPayload::TypingStart(payload) => {
                let user_id = context
                    .user_id
                    .ok_or(WebsocketMessageError::MissingUserId)?;
                let chat_id = payload.payload.chat_id;

                let data = serde_json::to_value(typing_started(chat_id, user_id))?.to_string();
                self.send_room_except(&Room::Chat(chat_id), &context.connection_id, &data)
                    .await?;
            }
            InboundPayload::TypingStop(payload) => {
                let user_id = context
                    .user_id
                    .ok_or(WebsocketMessageError::MissingUserId)?;
                let chat_id = payload.payload.chat_id;

                let data = serde_json::to_value(typing_stopped(chat_id, user_id))?.to_string();
                self.send_room_except(&Room::Chat(chat_id), &context.connection_id, &data)
                    .await?;
            }
        }

        Ok(())
    }

    async fn process_command(&mut self, cmd: Command) {
        let cmd_str = cmd.to_string();

        if log::log_enabled!(log::Level::Trace) {
            log::trace!("process_command: cmd={cmd:?}");
        } else {
            log::debug!("process_command: cmd={cmd_str}");
        }

        match cmd {
            Command::Connect {
                user_id,
                conn_tx,
                res_tx,
            } => {
                let conn_id = self.connect(user_id, conn_tx).await;

                if res_tx.send(conn_id).is_err() {
                    log::error!("Failed to send back connection ID {conn_id}");
                }
            }

            Command::Disconnect { conn } => {
                self.disconnect(conn).await;
            }

            Command::Message { conn, msg, res_tx } => {
                if let Err(error) = self.on_message(conn, msg.clone()).await {
                    log::error!("Failed to process message from {conn}: {msg:?}: {error:?}");
                }
                let _ = res_tx.send(());
            }

            Command::Broadcast { event, res_tx } => {
                self.broadcast(&event).await;
                let _ = res_tx.send(());
            }
        }

        log::debug!("process_command: Finished processing cmd {cmd_str}");
    }

    /// Runs the command loop until the handle is shut down or every handle is
    /// dropped.
    ///
    /// # Errors
    ///
    /// * Returns `Ok` on clean shutdown; the `io::Result` exists so the task
    ///   can be joined alongside the HTTP server
    pub async fn run(mut self) -> io::Result<()> {
        let token = self.token.clone();
        let cmd_rx = self.cmd_rx.clone();

        while let Ok(Ok(cmd)) = tokio::select!(
            () = token.cancelled() => {
                log::debug!("WsServer was cancelled");
                Err(io::Error::new(io::ErrorKind::Interrupted, "Cancelled"))
            }
            cmd = cmd_rx.recv_async() => { Ok(cmd) }
        ) {
            log::trace!("Received WsServer command {cmd}");
            self.process_command(cmd).await;
        }

        log::debug!("Stopped WsServer");

        Ok(())
    }
}

/// Handle and command sender for ws server.
///
/// Reduces boilerplate of setting up response channels in `WebSocket` handlers.
#[derive(Debug, Clone)]
pub struct WsServerHandle {
    cmd_tx: flume::Sender<Command>,
    token: CancellationToken,
}

impl WsServerHandle {
    /// Register client message sender and obtain connection ID.
    ///
    /// # Panics
    ///
    /// * If the server dropped the response channel before replying
    pub async fn connect(
        &self,
        user_id: Option<u64>,
        conn_tx: mpsc::UnboundedSender<Msg>,
    ) -> ConnId {
        log::trace!("Sending Connect command");

        let (res_tx, res_rx) = oneshot::channel();

        self.send_command(Command::Connect {
            user_id,
            conn_tx,
            res_tx,
        })
        .await;

        res_rx
            .await
            .expect("Failed to recv response from ws server")
    }

    /// Forward an inbound control frame and wait until it has been processed.
    pub async fn send_message(&self, conn: ConnId, msg: impl Into<String> + Send) {
        log::trace!("Sending Message command");

        let (res_tx, res_rx) = oneshot::channel();

        self.send_command(Command::Message {
            msg: msg.into(),
            conn,
            res_tx,
        })
        .await;

        if res_rx.await.is_err() {
            log::error!("Failed to recv response from ws server");
        }
    }

    /// Fan a domain event out to its target rooms and wait until every room
    /// has been handled.
    pub async fn broadcast_event(&self, event: DomainEvent) {
        log::trace!("Sending Broadcast command");

        let (res_tx, res_rx) = oneshot::channel();

        self.send_command(Command::Broadcast { event, res_tx }).await;

        if res_rx.await.is_err() {
            log::error!("Failed to recv response from ws server");
        }
    }

    /// Unregister a connection and its room memberships.
    pub async fn disconnect(&self, conn: ConnId) {
        log::trace!("Sending Disconnect command");

        self.send_command(Command::Disconnect { conn }).await;
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    async fn send_command(&self, cmd: Command) {
        if let Err(e) = self.cmd_tx.send_async(cmd).await {
            log::error!("Failed to send command: {e:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use mebelplace_ws::models::{
        NewOrder, NewOrderResponse, OrderAccepted, OrderStatusUpdate, OutboundPayload,
    };
    use pretty_assertions::assert_eq;
    use serde_json::Value;

    use super::*;

    struct MockPushFallback {
        calls: Mutex<Vec<(u64, String)>>,
    }

    impl MockPushFallback {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(vec![]),
            })
        }
    }

    #[async_trait]
    impl PushFallback for MockPushFallback {
        async fn send_to_user(&self, user_id: u64, payload: &OutboundPayload) -> bool {
            self.calls
                .lock()
                .unwrap()
                .push((user_id, serde_json::to_string(payload).unwrap()));
            true
        }
    }

    fn new_server() -> (WsServer, WsServerHandle, Arc<MockPushFallback>) {
        let push = MockPushFallback::new();
        let (server, handle) = WsServer::new(push.clone());
        (server, handle, push)
    }

    fn conn_channel() -> (mpsc::UnboundedSender<Msg>, mpsc::UnboundedReceiver<Msg>) {
        mpsc::unbounded_channel()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Msg>) -> Vec<Msg> {
        let mut messages = vec![];

        while let Ok(msg) = rx.try_recv() {
            messages.push(msg);
        }

        messages
    }

    fn of_type(messages: &[Msg], message_type: &str) -> Vec<Value> {
        messages
            .iter()
            .map(|msg| serde_json::from_str::<Value>(msg).unwrap())
            .filter(|value| value["type"] == message_type)
            .collect()
    }

    fn assert_indices_consistent(server: &WsServer) {
        for (conn_id, rooms) in &server.memberships {
            for room in rooms {
                assert!(
                    server
                        .rooms
                        .get(room)
                        .is_some_and(|members| members.contains(conn_id)),
                    "connection {conn_id} thinks it is in {room} but the room disagrees"
                );
            }
        }

        for (room, members) in &server.rooms {
            for conn_id in members {
                assert!(
                    server
                        .memberships
                        .get(conn_id)
                        .is_some_and(|rooms| rooms.contains(room)),
                    "room {room} lists connection {conn_id} but the connection disagrees"
                );
            }
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_join_then_leave_restores_indices() {
        let (mut server, _handle, _push) = new_server();
        let (tx, _rx) = conn_channel();
        let conn_id = server.connect(None, tx).await;

        server.join(conn_id, Room::Order(42));

        assert_indices_consistent(&server);
        assert!(server.rooms[&Room::Order(42)].contains(&conn_id));

        server.leave(conn_id, Room::Order(42));

        assert_indices_consistent(&server);
        assert!(!server.rooms.contains_key(&Room::Order(42)));
    }

    #[test_log::test(tokio::test)]
    async fn test_join_is_idempotent() {
        let (mut server, _handle, _push) = new_server();
        let (tx, _rx) = conn_channel();
        let conn_id = server.connect(None, tx).await;

        server.join(conn_id, Room::Chat(5));
        server.join(conn_id, Room::Chat(5));

        assert_eq!(server.rooms[&Room::Chat(5)].len(), 1);
        assert_indices_consistent(&server);
    }

    #[test_log::test(tokio::test)]
    async fn test_leave_without_membership_is_noop() {
        let (mut server, _handle, _push) = new_server();
        let (tx, _rx) = conn_channel();
        let conn_id = server.connect(None, tx).await;

        server.leave(conn_id, Room::Chat(5));

        assert_indices_consistent(&server);
    }

    #[test_log::test(tokio::test)]
    async fn test_join_for_unknown_connection_is_ignored() {
        let (mut server, _handle, _push) = new_server();

        server.join(999, Room::Order(42));

        assert!(!server.rooms.contains_key(&Room::Order(42)));
        assert_indices_consistent(&server);
    }

    #[test_log::test(tokio::test)]
    async fn test_disconnect_cleans_every_index() {
        let (mut server, _handle, _push) = new_server();
        let (tx, _rx) = conn_channel();
        let conn_id = server.connect(Some(7), tx).await;

        server.join(conn_id, Room::Order(42));
        server.join(conn_id, Room::Chat(5));

        server.disconnect(conn_id).await;

        assert!(!server.connections.contains_key(&conn_id));
        assert!(!server.memberships.contains_key(&conn_id));
        assert!(!server.users.contains_key(&7));
        assert!(!server.rooms.contains_key(&Room::Order(42)));
        assert!(!server.rooms.contains_key(&Room::Chat(5)));
        assert!(server.rooms[&Room::Broadcast].is_empty());
        assert_eq!(server.visitor_count.load(Ordering::SeqCst), 0);
        assert_indices_consistent(&server);
    }

    #[test_log::test(tokio::test)]
    async fn test_disconnect_twice_is_safe() {
        let (mut server, _handle, _push) = new_server();

        let (observer_tx, mut observer_rx) = conn_channel();
        let _observer = server.connect(None, observer_tx).await;

        let (tx, _rx) = conn_channel();
        let conn_id = server.connect(Some(7), tx).await;

        server.disconnect(conn_id).await;
        server.disconnect(conn_id).await;

        assert_eq!(server.visitor_count.load(Ordering::SeqCst), 1);
        assert_eq!(of_type(&drain(&mut observer_rx), "user_offline").len(), 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_presence_announced_once_across_multiple_tabs() {
        let (mut server, _handle, _push) = new_server();

        let (observer_tx, mut observer_rx) = conn_channel();
        let _observer = server.connect(None, observer_tx).await;

        let (tx_a, _rx_a) = conn_channel();
        let (tx_b, _rx_b) = conn_channel();
        let conn_a = server.connect(Some(7), tx_a).await;
        let conn_b = server.connect(Some(7), tx_b).await;

        let online = of_type(&drain(&mut observer_rx), "user_online");

        assert_eq!(online.len(), 1);
        assert_eq!(online[0]["data"]["userId"], 7);

        server.disconnect(conn_a).await;

        assert_eq!(of_type(&drain(&mut observer_rx), "user_offline").len(), 0);

        server.disconnect(conn_b).await;

        let offline = of_type(&drain(&mut observer_rx), "user_offline");

        assert_eq!(offline.len(), 1);
        assert_eq!(offline[0]["data"]["userId"], 7);
    }

    #[test_log::test(tokio::test)]
    async fn test_order_accepted_reaches_each_party_exactly_once() {
        let (mut server, _handle, push) = new_server();

        let (master_tx, mut master_rx) = conn_channel();
        let _master = server.connect(Some(7), master_tx).await;

        let (client_tx, mut client_rx) = conn_channel();
        let _client = server.connect(Some(3), client_tx).await;

        let (spectator_tx, mut spectator_rx) = conn_channel();
        let spectator = server.connect(None, spectator_tx).await;
        server.join(spectator, Room::Order(42));

        // connected, but in neither the order room nor a party's user room
        let (bystander_tx, mut bystander_rx) = conn_channel();
        let _bystander = server.connect(Some(99), bystander_tx).await;

        drain(&mut master_rx);
        drain(&mut client_rx);
        drain(&mut spectator_rx);
        drain(&mut bystander_rx);

        server
            .broadcast(&DomainEvent::OrderAccepted(OrderAccepted {
                order_id: 42,
                master_id: 7,
                client_id: 3,
            }))
            .await;

        let master_messages = of_type(&drain(&mut master_rx), "order_accepted");
        let client_messages = of_type(&drain(&mut client_rx), "order_accepted");
        let spectator_messages = of_type(&drain(&mut spectator_rx), "order_accepted");

        assert_eq!(master_messages.len(), 1);
        assert_eq!(client_messages.len(), 1);
        assert_eq!(spectator_messages.len(), 1);

        for messages in [&master_messages, &client_messages, &spectator_messages] {
            assert_eq!(
                messages[0]["data"],
                serde_json::json!({"orderId": 42, "masterId": 7})
            );
        }

        assert_eq!(
            master_messages[0]["message"],
            "Your response has been accepted"
        );
        assert_eq!(
            client_messages[0]["message"],
            "Your order has been accepted"
        );
        assert_eq!(spectator_messages[0]["message"], "Order has been accepted");
        assert_eq!(of_type(&drain(&mut bystander_rx), "order_accepted").len(), 0);
        assert_eq!(push.calls.lock().unwrap().len(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_offline_client_falls_back_to_push() {
        let (mut server, _handle, push) = new_server();

        let (master_tx, _master_rx) = conn_channel();
        let _master = server.connect(Some(7), master_tx).await;

        server
            .broadcast(&DomainEvent::OrderAccepted(OrderAccepted {
                order_id: 42,
                master_id: 7,
                client_id: 3,
            }))
            .await;

        let calls = push.calls.lock().unwrap();

        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, 3);
        assert!(calls[0].1.contains("Your order has been accepted"));
    }

    #[test_log::test(tokio::test)]
    async fn test_broadcast_events_keep_publish_order() {
        let (mut server, _handle, _push) = new_server();

        let (tx, mut rx) = conn_channel();
        let _conn = server.connect(Some(3), tx).await;

        for status in ["accepted", "in_progress", "completed"] {
            server
                .broadcast(&DomainEvent::OrderStatusUpdate(OrderStatusUpdate {
                    order_id: 42,
                    status: status.to_owned(),
                    updated_by: 7,
                    client_id: 3,
                    master_id: Some(7),
                }))
                .await;
        }

        let statuses = of_type(&drain(&mut rx), "order_status_update")
            .iter()
            .map(|value| value["data"]["status"].as_str().unwrap().to_owned())
            .collect::<Vec<_>>();

        assert_eq!(statuses, vec!["accepted", "in_progress", "completed"]);
    }

    #[test_log::test(tokio::test)]
    async fn test_join_chat_acks_and_delivers_messages() {
        let (mut server, _handle, _push) = new_server();

        let (tx_a, mut rx_a) = conn_channel();
        let conn_a = server.connect(Some(7), tx_a).await;

        let (tx_b, mut rx_b) = conn_channel();
        let conn_b = server.connect(Some(3), tx_b).await;

        server
            .on_message(
                conn_a,
                serde_json::json!({"type": "join_chat", "payload": {"chatId": 5}}).to_string(),
            )
            .await
            .unwrap();

        assert_eq!(of_type(&drain(&mut rx_a), "joined_chat").len(), 1);

        server
            .on_message(
                conn_b,
                serde_json::json!({"type": "join_chat", "payload": {"chatId": 5}}).to_string(),
            )
            .await
            .unwrap();

        drain(&mut rx_a);
        drain(&mut rx_b);

        server
            .on_message(
                conn_a,
                serde_json::json!({
                    "type": "send_message",
                    "payload": {"chatId": 5, "content": "hello"}
                })
                .to_string(),
            )
            .await
            .unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            let messages = of_type(&drain(rx), "new_message");

            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0]["data"]["chatId"], 5);
            assert_eq!(messages[0]["data"]["senderId"], 7);
            assert_eq!(messages[0]["data"]["message"]["content"], "hello");
            assert_eq!(messages[0]["data"]["message"]["type"], "text");
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_send_message_requires_identity() {
        let (mut server, _handle, _push) = new_server();

        let (tx, _rx) = conn_channel();
        let conn_id = server.connect(None, tx).await;

        let result = server
            .on_message(
                conn_id,
                serde_json::json!({
                    "type": "send_message",
                    "payload": {"chatId": 5, "content": "hello"}
                })
                .to_string(),
            )
            .await;

        assert!(matches!(result, Err(WebsocketMessageError::MissingUserId)));
    }

    #[test_log::test(tokio::test)]
    async fn test_typing_relay_skips_sender() {
        let (mut server, _handle, _push) = new_server();

        let (tx_a, mut rx_a) = conn_channel();
        let conn_a = server.connect(Some(7), tx_a).await;

        let (tx_b, mut rx_b) = conn_channel();
        let conn_b = server.connect(Some(3), tx_b).await;

        server.join(conn_a, Room::Chat(5));
        server.join(conn_b, Room::Chat(5));
        drain(&mut rx_a);
        drain(&mut rx_b);

        server
            .on_message(
                conn_a,
                serde_json::json!({"type": "typing_start", "payload": {"chatId": 5}}).to_string(),
            )
            .await
            .unwrap();

        let received = of_type(&drain(&mut rx_b), "typing_start");

        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["data"]["userId"], 7);
        assert_eq!(of_type(&drain(&mut rx_a), "typing_start").len(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_invalid_payload_is_rejected() {
        let (mut server, _handle, _push) = new_server();

        let (tx, _rx) = conn_channel();
        let conn_id = server.connect(None, tx).await;

        let result = server.on_message(conn_id, "not json".to_owned()).await;

        assert!(matches!(
            result,
            Err(WebsocketMessageError::InvalidPayload(..))
        ));
    }

    #[test_log::test(tokio::test)]
    async fn test_commands_processed_through_handle() {
        let push = MockPushFallback::new();
        let (server, handle) = WsServer::new(push.clone());
        let server_task = tokio::task::spawn(server.run());

        let (tx, mut rx) = conn_channel();
        let conn_id = handle.connect(Some(7), tx).await;

        handle
            .send_message(
                conn_id,
                serde_json::json!({"type": "join_order_room", "payload": {"orderId": 42}})
                    .to_string(),
            )
            .await;

        handle
            .broadcast_event(DomainEvent::NewOrderResponse(NewOrderResponse {
                order_id: 42,
                response: serde_json::json!({"id": 1, "price": 50000}),
                client_id: 3,
            }))
            .await;

        let responses = of_type(&drain(&mut rx), "new_order_response");

        assert_eq!(responses.len(), 1);
        assert_eq!(
            responses[0]["data"],
            serde_json::json!({"orderId": 42, "response": {"id": 1, "price": 50000}})
        );

        // the client has no connection, so the event also went out as a push
        let calls = push.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, 3);
        drop(calls);

        handle.disconnect(conn_id).await;
        handle.shutdown();
        server_task.await.unwrap().unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_new_order_broadcast_reaches_everyone() {
        let (mut server, _handle, push) = new_server();

        let (tx_a, mut rx_a) = conn_channel();
        let _conn_a = server.connect(Some(7), tx_a).await;

        let (tx_b, mut rx_b) = conn_channel();
        let _conn_b = server.connect(None, tx_b).await;

        drain(&mut rx_a);
        drain(&mut rx_b);

        server
            .broadcast(&DomainEvent::NewOrder(NewOrder {
                order: serde_json::json!({"id": 42, "title": "Oak table"}),
            }))
            .await;

        for rx in [&mut rx_a, &mut rx_b] {
            let orders = of_type(&drain(rx), "new_order");

            assert_eq!(orders.len(), 1);
            assert_eq!(orders[0]["data"]["title"], "Oak table");
            assert_eq!(orders[0]["message"], "New order available");
        }

        assert_eq!(push.calls.lock().unwrap().len(), 0);
    }
}
