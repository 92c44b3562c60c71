use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::AsRefStr;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct EmptyPayload {}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JoinUserRoom {
    pub user_id: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JoinUserRoomPayload {
    pub payload: JoinUserRoom,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JoinOrderRoom {
    pub order_id: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JoinOrderRoomPayload {
    pub payload: JoinOrderRoom,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JoinChat {
    pub chat_id: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JoinChatPayload {
    pub payload: JoinChat,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LeaveChat {
    pub chat_id: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LeaveChatPayload {
    pub payload: LeaveChat,
}

fn default_message_kind() -> String {
    "text".to_owned()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub chat_id: u64,
    pub content: String,
    #[serde(rename = "type", default = "default_message_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    pub payload: SendMessage,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Typing {
    pub chat_id: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub payload: Typing,
}

#[derive(Debug, Serialize, Deserialize, Clone, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "type")]
#[strum(serialize_all = "snake_case")]
pub enum InboundPayload {
    Ping(EmptyPayload),
    JoinUserRoom(JoinUserRoomPayload),
    JoinOrderRoom(JoinOrderRoomPayload),
    JoinChat(JoinChatPayload),
    LeaveChat(LeaveChatPayload),
    SendMessage(SendMessagePayload),
    TypingStart(TypingPayload),
    TypingStop(TypingPayload),
}

impl std::fmt::Display for InboundPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub order: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderResponse {
    pub order_id: u64,
    pub response: Value,
    pub client_id: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OrderAccepted {
    pub order_id: u64,
    pub master_id: u64,
    pub client_id: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusUpdate {
    pub order_id: u64,
    pub status: String,
    pub updated_by: u64,
    pub client_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_id: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChatCreated {
    pub order_id: u64,
    pub chat_id: u64,
    pub client_id: u64,
    pub master_id: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub chat_id: u64,
    pub message: Value,
    pub sender_id: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UserPresence {
    pub user_id: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "type")]
#[strum(serialize_all = "snake_case")]
pub enum DomainEvent {
    NewOrder(NewOrder),
    NewOrderResponse(NewOrderResponse),
    OrderAccepted(OrderAccepted),
    OrderStatusUpdate(OrderStatusUpdate),
    ChatCreated(ChatCreated),
    NewMessage(NewMessage),
    UserOnline(UserPresence),
    UserOffline(UserPresence),
}

impl std::fmt::Display for DomainEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderPayload {
    pub data: Value,
    pub message: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderResponseData {
    pub order_id: u64,
    pub response: Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderResponsePayload {
    pub data: NewOrderResponseData,
    pub message: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OrderAcceptedData {
    pub order_id: u64,
    pub master_id: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OrderAcceptedPayload {
    pub data: OrderAcceptedData,
    pub message: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusUpdateData {
    pub order_id: u64,
    pub status: String,
    pub updated_by: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusUpdatePayload {
    pub data: OrderStatusUpdateData,
    pub message: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChatCreatedPayload {
    pub data: ChatCreated,
    pub message: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NewMessagePayload {
    pub data: NewMessage,
    pub message: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UserPresencePayload {
    pub data: UserPresence,
    pub message: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    pub chat_id: u64,
    pub user_id: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TypingEventPayload {
    pub data: TypingEvent,
    pub message: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JoinedChatPayload {
    pub data: JoinChat,
    pub message: String,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "type")]
#[strum(serialize_all = "snake_case")]
pub enum OutboundPayload {
    NewOrder(NewOrderPayload),
    NewOrderResponse(NewOrderResponsePayload),
    OrderAccepted(OrderAcceptedPayload),
    OrderStatusUpdate(OrderStatusUpdatePayload),
    ChatCreated(ChatCreatedPayload),
    NewMessage(NewMessagePayload),
    UserOnline(UserPresencePayload),
    UserOffline(UserPresencePayload),
    TypingStart(TypingEventPayload),
    TypingStop(TypingEventPayload),
    JoinedChat(JoinedChatPayload),
}

impl std::fmt::Display for OutboundPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}
