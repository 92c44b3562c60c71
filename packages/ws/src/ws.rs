use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use thiserror::Error;

use crate::models::{
    ChatCreatedPayload, DomainEvent, JoinChat, JoinedChatPayload, NewMessagePayload,
    NewOrderPayload, NewOrderResponseData, NewOrderResponsePayload, OrderAcceptedData,
    OrderAcceptedPayload, OrderStatusUpdateData, OrderStatusUpdatePayload, OutboundPayload,
    TypingEvent, TypingEventPayload, UserPresencePayload,
};
use crate::rooms::Room;
use crate::router;

#[derive(Debug, Clone, Default)]
pub struct WebsocketContext {
    pub connection_id: String,
    pub user_id: Option<u64>,
}

#[derive(Debug, Error)]
pub enum WebsocketSendError {
    #[error("Unknown: {0}")]
    Unknown(String),
    #[error(transparent)]
    ParseInt(#[from] std::num::ParseIntError),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum WebsocketMessageError {
    #[error("Invalid payload: '{0}' ({1})")]
    InvalidPayload(String, String),
    #[error("Missing user id")]
    MissingUserId,
    #[error(transparent)]
    WebsocketSend(#[from] WebsocketSendError),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

#[async_trait]
pub trait WebsocketSender: Send + Sync {
    /// # Errors
    ///
    /// * If the message failed to send
    async fn send(&self, connection_id: &str, data: &str) -> Result<(), WebsocketSendError>;

    /// Sends `data` to every member of `room`, returning how many connections
    /// the room resolved to.
    ///
    /// # Errors
    ///
    /// * If the message failed to send
    async fn send_room(&self, room: &Room, data: &str) -> Result<usize, WebsocketSendError>;

    /// Sends `data` to every member of `room` except `connection_id`.
    ///
    /// # Errors
    ///
    /// * If the message failed to send
    async fn send_room_except(
        &self,
        room: &Room,
        connection_id: &str,
        data: &str,
    ) -> Result<usize, WebsocketSendError>;
}

impl core::fmt::Debug for dyn WebsocketSender {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("{WebsocketSender}")
    }
}

/// Delivery channel of last resort for users with no live connections.
#[async_trait]
pub trait PushFallback: Send + Sync {
    /// Hands `payload` to the push channel for `user_id`. Returns whether at
    /// least one push delivery succeeded. Must not fail loudly, delivery
    /// problems are the implementation's to log.
    async fn send_to_user(&self, user_id: u64, payload: &OutboundPayload) -> bool;
}

impl core::fmt::Debug for dyn PushFallback {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("{PushFallback}")
    }
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Builds the outbound notification for `event` as seen from `room`.
///
/// Some events carry a different human-readable message per audience, e.g. the
/// master and the client each get a personalized line when an order is
/// accepted. The `data` object is identical for every audience.
#[must_use]
pub fn notification_for(event: &DomainEvent, room: &Room, timestamp: &str) -> OutboundPayload {
    match event {
        DomainEvent::NewOrder(e) => OutboundPayload::NewOrder(NewOrderPayload {
            data: e.order.clone(),
            message: "New order available".to_owned(),
            timestamp: timestamp.to_owned(),
        }),
        DomainEvent::NewOrderResponse(e) => {
            OutboundPayload::NewOrderResponse(NewOrderResponsePayload {
                data: NewOrderResponseData {
                    order_id: e.order_id,
                    response: e.response.clone(),
                },
                message: "New response to your order".to_owned(),
                timestamp: timestamp.to_owned(),
            })
        }
        DomainEvent::OrderAccepted(e) => {
            // When the same user is both parties, the master line wins.
            let message = match room {
                Room::User(id) if *id == e.master_id => "Your response has been accepted",
                Room::User(..) => "Your order has been accepted",
                Room::Order(..) | Room::Chat(..) | Room::Broadcast => "Order has been accepted",
            };

            OutboundPayload::OrderAccepted(OrderAcceptedPayload {
                data: OrderAcceptedData {
                    order_id: e.order_id,
                    master_id: e.master_id,
                },
                message: message.to_owned(),
                timestamp: timestamp.to_owned(),
            })
        }
        DomainEvent::OrderStatusUpdate(e) => {
            OutboundPayload::OrderStatusUpdate(OrderStatusUpdatePayload {
                data: OrderStatusUpdateData {
                    order_id: e.order_id,
                    status: e.status.clone(),
                    updated_by: e.updated_by,
                },
                message: format!("Order status updated to {}", e.status),
                timestamp: timestamp.to_owned(),
            })
        }
        DomainEvent::ChatCreated(e) => {
            let message = match room {
                Room::User(id) if *id == e.client_id => "Chat created for your order",
                _ => "Chat created for accepted order",
            };

            OutboundPayload::ChatCreated(ChatCreatedPayload {
                data: e.clone(),
                message: message.to_owned(),
                timestamp: timestamp.to_owned(),
            })
        }
        DomainEvent::NewMessage(e) => OutboundPayload::NewMessage(NewMessagePayload {
            data: e.clone(),
            message: "New message in order chat".to_owned(),
            timestamp: timestamp.to_owned(),
        }),
        DomainEvent::UserOnline(e) => OutboundPayload::UserOnline(UserPresencePayload {
            data: e.clone(),
            message: "User is online".to_owned(),
            timestamp: timestamp.to_owned(),
        }),
        DomainEvent::UserOffline(e) => OutboundPayload::UserOffline(UserPresencePayload {
            data: e.clone(),
            message: "User is offline".to_owned(),
            timestamp: timestamp.to_owned(),
        }),
    }
}

/// Notification sent to a chat room while a participant is typing.
#[must_use]
pub fn typing_started(chat_id: u64, user_id: u64) -> OutboundPayload {
    OutboundPayload::TypingStart(TypingEventPayload {
        data: TypingEvent { chat_id, user_id },
        message: "User is typing".to_owned(),
        timestamp: now_timestamp(),
    })
}

/// Notification sent to a chat room once a participant stops typing.
#[must_use]
pub fn typing_stopped(chat_id: u64, user_id: u64) -> OutboundPayload {
    OutboundPayload::TypingStop(TypingEventPayload {
        data: TypingEvent { chat_id, user_id },
        message: "User stopped typing".to_owned(),
        timestamp: now_timestamp(),
    })
}

/// Acknowledgement sent back to a connection that joined a chat room.
#[must_use]
pub fn joined_chat(chat_id: u64) -> OutboundPayload {
    OutboundPayload::JoinedChat(JoinedChatPayload {
        data: JoinChat { chat_id },
        message: "Joined chat".to_owned(),
        timestamp: now_timestamp(),
    })
}

/// Fans `event` out to every room the routing table names.
///
/// Each room gets at most one copy of the notification. Personal rooms that
/// resolve to zero live connections fall back to `push`, one attempt per user
/// per event. Shared rooms never fall back, an empty order or chat room means
/// nobody cares right now.
///
/// # Errors
///
/// * If the notification failed to serialize
pub async fn broadcast_event(
    sender: &impl WebsocketSender,
    push: &(impl PushFallback + ?Sized),
    event: &DomainEvent,
) -> Result<(), WebsocketSendError> {
    let rooms = router::rooms_for(event);

    log::debug!("Broadcasting event {event} to {} room(s)", rooms.len());

    let timestamp = now_timestamp();

    for room in &rooms {
        let payload = notification_for(event, room, &timestamp);
        let data = serde_json::to_value(&payload)?.to_string();

        match sender.send_room(room, &data).await {
            Ok(0) => {
                if let Some(user_id) = room.user_id() {
                    log::debug!(
                        "No live connections in {room} for event {event}; falling back to push"
                    );

                    if !push.send_to_user(user_id, &payload).await {
                        log::debug!("Push fallback failed to reach user {user_id}");
                    }
                }
            }
            Ok(count) => {
                log::trace!("Sent event {event} to {count} connection(s) in {room}");
            }
            Err(e) => {
                log::error!("Failed to send event {event} to {room}: {e:?}");
            }
        }
    }

    Ok(())
}
