//! WebSocket client implementation for `MebelPlace` applications.
//!
//! This crate provides a robust WebSocket client with automatic reconnection,
//! room subscription tracking, and message handling for `MebelPlace`
//! applications.
//!
//! # Features
//!
//! * Automatic reconnection with linear backoff and a bounded retry budget
//! * Room subscriptions that are replayed after every reconnect
//! * Async/await based API using tokio
//! * Message multiplexing with separate send/receive channels
//! * Graceful cancellation and connection closing
//!
//! # Examples
//!
//! ```rust,no_run
//! # use mebelplace_app_ws::{WsClient, WsMessage};
//! # use mebelplace_ws::Room;
//! # use tokio::sync::mpsc;
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (client, handle) = WsClient::new("ws://localhost:8000/ws".to_string());
//! let (tx, mut rx) = mpsc::channel(100);
//!
//! // Start the websocket connection
//! tokio::spawn(async move { client.start(Some(7), None, || {}, tx).await });
//!
//! // Follow an order and receive its events
//! handle.join(Room::Order(42)).await?;
//!
//! while let Some(msg) = rx.recv().await {
//!     match msg {
//!         WsMessage::TextMessage(text) => println!("Received: {text}"),
//!         WsMessage::Message(bytes) => println!("Received {} bytes", bytes.len()),
//!         WsMessage::Ping => println!("Received ping"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_channel::mpsc::UnboundedSender;
use futures_util::{StreamExt as _, future, pin_mut};
use mebelplace_ws::{
    Room,
    models::{
        InboundPayload, JoinChat, JoinChatPayload, JoinOrderRoom, JoinOrderRoomPayload,
        JoinUserRoom, JoinUserRoomPayload, LeaveChat, LeaveChatPayload,
    },
};
use strum_macros::AsRefStr;
use thiserror::Error;
use tokio::select;
use tokio::sync::mpsc::Sender;
use tokio::sync::mpsc::error::SendError;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error, Message},
};
use tokio_util::sync::CancellationToken;

/// How long to wait before the first reconnect attempt. Later attempts back
/// off linearly on top of this.
const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(1000);

/// How many consecutive failed connection attempts are tolerated before
/// giving up.
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Error type for websocket connection failures.
#[derive(Debug, Error)]
pub enum ConnectWsError {
    /// The websocket connection was rejected with an HTTP 401 Unauthorized response.
    #[error("Unauthorized")]
    Unauthorized,
    /// Every reconnect attempt failed.
    #[error("Max reconnect attempts reached")]
    MaxReconnectAttemptsReached,
}

/// Messages that can be sent or received over a websocket connection.
pub enum WsMessage {
    /// A text message.
    TextMessage(String),
    /// A binary message.
    Message(Bytes),
    /// A ping message.
    Ping,
}

/// Error type for websocket send operations.
#[derive(Debug, Error)]
pub enum WebsocketSendError {
    /// An unknown error occurred during the send operation.
    #[error("Unknown: {0}")]
    Unknown(String),
    /// The websocket connection is not established.
    #[error("Not connected to websocket server")]
    NotConnected,
    /// The outgoing frame failed to serialize.
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Connection lifecycle of a [`WsClient`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsRefStr)]
pub enum ConnectionState {
    /// No connection, and none being attempted.
    #[default]
    Disconnected,
    /// First connection attempt in flight.
    Connecting,
    /// Live connection established.
    Connected,
    /// Connection lost; waiting to retry.
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Trait for types that can send messages over a websocket connection.
#[async_trait]
pub trait WebsocketSender: Send + Sync {
    /// Sends a text message over the websocket connection.
    ///
    /// # Errors
    ///
    /// * Returns [`WebsocketSendError::NotConnected`] if the connection is not established
    /// * Returns [`WebsocketSendError::Unknown`] if the send operation fails
    async fn send(&self, data: &str) -> Result<(), WebsocketSendError>;

    /// Sends a ping message over the websocket connection.
    ///
    /// # Errors
    ///
    /// * Returns [`WebsocketSendError::Unknown`] if the send operation fails
    async fn ping(&self) -> Result<(), WebsocketSendError>;
}

/// Debug implementation for trait objects implementing `WebsocketSender`.
impl core::fmt::Debug for dyn WebsocketSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{WebsocketSender}}")
    }
}

/// Control frame announcing membership in `room`, if the room kind has one.
fn join_payload(room: Room) -> Option<InboundPayload> {
    match room {
        Room::User(user_id) => Some(InboundPayload::JoinUserRoom(JoinUserRoomPayload {
            payload: JoinUserRoom { user_id },
        })),
        Room::Order(order_id) => Some(InboundPayload::JoinOrderRoom(JoinOrderRoomPayload {
            payload: JoinOrderRoom { order_id },
        })),
        Room::Chat(chat_id) => Some(InboundPayload::JoinChat(JoinChatPayload {
            payload: JoinChat { chat_id },
        })),
        Room::Broadcast => None,
    }
}

/// Control frame revoking membership in `room`. Only chat rooms have one.
fn leave_payload(room: Room) -> Option<InboundPayload> {
    match room {
        Room::Chat(chat_id) => Some(InboundPayload::LeaveChat(LeaveChatPayload {
            payload: LeaveChat { chat_id },
        })),
        _ => None,
    }
}

/// A handle to a websocket connection that allows subscribing to rooms,
/// sending messages, and closing the connection.
#[derive(Clone)]
pub struct WsHandle {
    sender: Arc<RwLock<Option<UnboundedSender<WsMessage>>>>,
    state: Arc<RwLock<ConnectionState>>,
    desired_rooms: Arc<RwLock<BTreeSet<Room>>>,
    cancellation_token: CancellationToken,
}

impl WsHandle {
    /// Closes the websocket connection.
    ///
    /// This method signals the websocket client to gracefully shut down by canceling
    /// the internal cancellation token. The connection will close after any pending
    /// operations complete.
    pub fn close(&self) {
        self.cancellation_token.cancel();
    }

    /// Current lifecycle state of the connection.
    ///
    /// # Panics
    ///
    /// * Panics if the internal `RwLock` is poisoned
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.read().unwrap()
    }

    /// Whether the connection is currently established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Subscribes to `room`.
    ///
    /// The subscription is remembered, so it survives reconnects. If the
    /// connection is live, the join frame is sent immediately.
    ///
    /// # Errors
    ///
    /// * Returns [`WebsocketSendError::Unknown`] if the join frame fails to send
    ///
    /// # Panics
    ///
    /// * Panics if the internal `RwLock` is poisoned
    pub async fn join(&self, room: Room) -> Result<(), WebsocketSendError> {
        self.desired_rooms.write().unwrap().insert(room);

        if !self.is_connected() {
            return Ok(());
        }

        if let Some(payload) = join_payload(room) {
            let data = serde_json::to_string(&payload)?;
            self.send(&data).await?;
        }

        Ok(())
    }

    /// Unsubscribes from `room`.
    ///
    /// Chat rooms have an explicit leave frame. For every other room kind the
    /// subscription is only dropped locally, so it stops being replayed on
    /// reconnect.
    ///
    /// # Errors
    ///
    /// * Returns [`WebsocketSendError::Unknown`] if the leave frame fails to send
    ///
    /// # Panics
    ///
    /// * Panics if the internal `RwLock` is poisoned
    pub async fn leave(&self, room: Room) -> Result<(), WebsocketSendError> {
        self.desired_rooms.write().unwrap().remove(&room);

        if !self.is_connected() {
            return Ok(());
        }

        if let Some(payload) = leave_payload(room) {
            let data = serde_json::to_string(&payload)?;
            self.send(&data).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl WebsocketSender for WsHandle {
    /// Sends a text message over the websocket connection.
    ///
    /// # Errors
    ///
    /// * Returns [`WebsocketSendError::NotConnected`] if the connection is not established
    /// * Returns [`WebsocketSendError::Unknown`] if the send operation fails
    ///
    /// # Panics
    ///
    /// * Panics if the internal `RwLock` is poisoned
    async fn send(&self, data: &str) -> Result<(), WebsocketSendError> {
        if !self.is_connected() {
            log::warn!("Not connected to websocket server; dropping message");
            return Err(WebsocketSendError::NotConnected);
        }

        if let Some(sender) = self.sender.read().unwrap().as_ref() {
            sender
                .unbounded_send(WsMessage::TextMessage(data.to_string()))
                .map_err(|e| WebsocketSendError::Unknown(e.to_string()))?;
        }
        Ok(())
    }

    /// Sends a ping message over the websocket connection.
    ///
    /// # Errors
    ///
    /// * Returns [`WebsocketSendError::Unknown`] if the send operation fails
    ///
    /// # Panics
    ///
    /// * Panics if the internal `RwLock` is poisoned
    async fn ping(&self) -> Result<(), WebsocketSendError> {
        if let Some(sender) = self.sender.read().unwrap().as_ref() {
            sender
                .unbounded_send(WsMessage::Ping)
                .map_err(|e| WebsocketSendError::Unknown(e.to_string()))?;
        }
        Ok(())
    }
}

/// A websocket client that manages connections and message handling.
#[derive(Clone)]
pub struct WsClient {
    url: String,
    sender: Arc<RwLock<Option<UnboundedSender<WsMessage>>>>,
    state: Arc<RwLock<ConnectionState>>,
    desired_rooms: Arc<RwLock<BTreeSet<Room>>>,
    reconnect_interval: Duration,
    max_reconnect_attempts: u32,
    cancellation_token: CancellationToken,
}

impl WsClient {
    /// Creates a new websocket client for the given URL.
    ///
    /// Returns a tuple containing the client and a handle to control the connection.
    #[must_use]
    pub fn new(url: String) -> (Self, WsHandle) {
        Self::new_inner(url, CancellationToken::new())
    }

    fn new_inner(url: String, cancellation_token: CancellationToken) -> (Self, WsHandle) {
        let sender = Arc::new(RwLock::new(None));
        let state = Arc::new(RwLock::new(ConnectionState::Disconnected));
        let desired_rooms = Arc::new(RwLock::new(BTreeSet::new()));
        let handle = WsHandle {
            sender: sender.clone(),
            state: state.clone(),
            desired_rooms: desired_rooms.clone(),
            cancellation_token: cancellation_token.clone(),
        };

        (
            Self {
                url,
                sender,
                state,
                desired_rooms,
                reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
                max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
                cancellation_token,
            },
            handle,
        )
    }

    /// Sets a custom cancellation token for the websocket client.
    ///
    /// This allows external cancellation of the websocket connection.
    #[must_use]
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Sets the base delay between reconnect attempts.
    #[must_use]
    pub const fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// Sets how many consecutive failed connection attempts are tolerated
    /// before [`start`](Self::start) gives up.
    #[must_use]
    pub const fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    async fn message_handler(
        tx: Sender<WsMessage>,
        m: Message,
    ) -> Result<(), SendError<WsMessage>> {
        log::trace!("Message from ws server: {m:?}");
        tx.send(match m {
            Message::Text(m) => WsMessage::TextMessage(m.to_string()),
            Message::Binary(m) => WsMessage::Message(m),
            Message::Ping(_m) => WsMessage::Ping,
            Message::Pong(_m) => {
                log::trace!("Received pong");
                return Ok(());
            }
            Message::Close(m) => {
                log::debug!("Received close: {m:?}");
                return Ok(());
            }
            Message::Frame(_m) => {
                log::warn!("Received unexpected raw frame");
                return Ok(());
            }
        })
        .await
    }

    /// Starts the websocket connection with automatic reconnection on failure.
    ///
    /// `user_id` and `token` are appended to the connection URL as query
    /// parameters, identifying the session to the server.
    ///
    /// # Errors
    ///
    /// * Returns [`ConnectWsError::Unauthorized`] if the websocket connection is unauthorized
    /// * Returns [`ConnectWsError::MaxReconnectAttemptsReached`] if every reconnect attempt failed
    ///
    /// # Panics
    ///
    /// * Panics if the internal `RwLock` is poisoned
    pub async fn start(
        &self,
        user_id: Option<u64>,
        token: Option<String>,
        on_start: impl Fn() + Send + 'static,
        tx: Sender<WsMessage>,
    ) -> Result<(), ConnectWsError> {
        self.start_handler(user_id, token, Self::message_handler, on_start, tx)
            .await
    }

    #[allow(
        clippy::too_many_lines,
        clippy::cognitive_complexity,
        clippy::redundant_pub_crate
    )]
    async fn start_handler<T, O>(
        &self,
        user_id: Option<u64>,
        token: Option<String>,
        handler: fn(sender: Sender<T>, m: Message) -> O,
        on_start: impl Fn() + Send + 'static,
        tx: Sender<T>,
    ) -> Result<(), ConnectWsError>
    where
        T: Send + 'static,
        O: Future<Output = Result<(), SendError<T>>> + Send + 'static,
    {
        let url = self.url.clone();
        let sender_arc = self.sender.clone();
        let state = self.state.clone();
        let desired_rooms = self.desired_rooms.clone();
        let cancellation_token = self.cancellation_token.clone();
        let reconnect_interval = self.reconnect_interval;
        let max_reconnect_attempts = self.max_reconnect_attempts;

        let mut attempts: u32 = 0;

        loop {
            let close_token = CancellationToken::new();

            let (txf, rxf) = futures_channel::mpsc::unbounded();

            sender_arc.write().unwrap().replace(txf.clone());

            let mut params = vec![];
            if let Some(user_id) = user_id {
                params.push(format!("userId={user_id}"));
            }
            if let Some(token) = &token {
                params.push(format!("token={token}"));
            }
            let url = if params.is_empty() {
                url.clone()
            } else {
                format!("{url}?{}", params.join("&"))
            };

            *state.write().unwrap() = if attempts == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            };

            log::debug!("Connecting to websocket '{url}'...");
            match select!(
                resp = connect_async(url) => resp,
                () = cancellation_token.cancelled() => {
                    log::debug!("Cancelling connect");
                    break;
                }
            ) {
                Ok((ws_stream, _)) => {
                    log::debug!("WebSocket handshake has been successfully completed");

                    *state.write().unwrap() = ConnectionState::Connected;

                    if attempts > 0 {
                        log::info!("WebSocket successfully reconnected");
                        attempts = 0;
                    }

                    on_start();

                    // replay room subscriptions so a reconnected session
                    // lands back in the same rooms
                    let rooms = desired_rooms.read().unwrap().clone();
                    for room in rooms {
                        let Some(payload) = join_payload(room) else {
                            continue;
                        };

                        match serde_json::to_string(&payload) {
                            Ok(data) => {
                                if let Err(e) = txf.unbounded_send(WsMessage::TextMessage(data)) {
                                    log::error!("Failed to replay subscription to {room}: {e:?}");
                                }
                            }
                            Err(e) => {
                                log::error!("Failed to serialize subscription to {room}: {e:?}");
                            }
                        }
                    }

                    let (write, read) = ws_stream.split();

                    let ws_writer = rxf
                        .map(|message| match message {
                            WsMessage::TextMessage(message) => {
                                log::trace!("Sending text packet message={message}");
                                Ok(Message::Text(message.into()))
                            }
                            WsMessage::Message(bytes) => {
                                log::debug!("Sending binary packet");
                                Ok(Message::Binary(bytes))
                            }
                            WsMessage::Ping => {
                                log::trace!("Sending ping");
                                Ok(Message::Ping(Bytes::new()))
                            }
                        })
                        .forward(write);

                    let ws_reader = read.for_each(|m| {
                        let tx = tx.clone();
                        let close_token = close_token.clone();

                        async move {
                            let m = match m {
                                Ok(m) => m,
                                Err(e) => {
                                    log::error!("Read Loop error: {e:?}");
                                    close_token.cancel();
                                    return;
                                }
                            };

                            // handled inline so messages reach the app in server order
                            if let Err(e) = handler(tx, m).await {
                                log::error!("Handler Send Loop error: {e:?}");
                                close_token.cancel();
                            }
                        }
                    });

                    let pinger = tokio::spawn({
                        let txf = txf.clone();
                        let close_token = close_token.clone();
                        let cancellation_token = cancellation_token.clone();

                        async move {
                            loop {
                                select!(
                                    () = close_token.cancelled() => { break; }
                                    () = cancellation_token.cancelled() => { break; }
                                    () = sleep(Duration::from_millis(5000)) => {
                                        log::trace!("Sending ping to server");
                                        if let Err(e) = txf.unbounded_send(WsMessage::Ping) {
                                            log::error!("Pinger Send Loop error: {e:?}");
                                            close_token.cancel();
                                            break;
                                        }
                                    }
                                );
                            }
                        }
                    });

                    pin_mut!(ws_writer, ws_reader);
                    select!(
                        () = close_token.cancelled() => {}
                        () = cancellation_token.cancelled() => {}
                        _ = future::select(ws_writer, ws_reader) => {}
                    );
                    if !close_token.is_cancelled() {
                        close_token.cancel();
                    }
                    log::debug!("start_handler: Waiting for pinger to finish...");
                    if let Err(e) = pinger.await {
                        log::warn!("start_handler: Pinger failed to finish: {e:?}");
                    }
                    log::info!("WebSocket connection closed");
                }
                Err(err) => {
                    log::error!("Websocket error: {err:?}");
                    if let Error::Http(response) = err {
                        if response.status() == StatusCode::UNAUTHORIZED {
                            log::error!("Unauthorized ws connection");
                            *state.write().unwrap() = ConnectionState::Disconnected;
                            sender_arc.write().unwrap().take();
                            return Err(ConnectWsError::Unauthorized);
                        }

                        if let Ok(body) =
                            std::str::from_utf8(response.body().as_ref().unwrap_or(&vec![]))
                        {
                            log::error!("error ({}): {body}", response.status());
                        } else {
                            log::error!("body: (unable to get body)");
                        }
                    } else {
                        log::error!("Failed to connect to websocket server: {err:?}");
                    }
                }
            }

            if cancellation_token.is_cancelled() {
                log::debug!("Cancelling retry");
                break;
            }

            attempts += 1;

            if attempts > max_reconnect_attempts {
                log::error!("Max reconnect attempts ({max_reconnect_attempts}) reached; giving up");
                *state.write().unwrap() = ConnectionState::Disconnected;
                sender_arc.write().unwrap().take();
                return Err(ConnectWsError::MaxReconnectAttemptsReached);
            }

            let delay = reconnect_interval * attempts;
            log::debug!("Retrying websocket connection in {delay:?} (attempt {attempts})");

            select!(
                () = sleep(delay) => {}
                () = cancellation_token.cancelled() => {
                    log::debug!("Cancelling retry");
                    break;
                }
            );
        }

        *state.write().unwrap() = ConnectionState::Disconnected;
        sender_arc.write().unwrap().take();

        log::debug!("Handler closed");

        Ok(())
    }
}
