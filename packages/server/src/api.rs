use crate::ws::{handler, server::WsServerHandle};
use actix_web::{
    HttpResponse, Result, get, route,
    web::{self, Json},
};
use log::info;
use mebelplace_push::{PushGateway, PushSubscription};
use mebelplace_ws::models::DomainEvent;
use serde::Deserialize;
use serde_json::{Value, json};

#[route("/health", method = "GET")]
pub async fn health_endpoint() -> Result<Json<Value>> {
    info!("Healthy");
    Ok(Json(json!({"healthy": true})))
}

#[derive(Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    user_id: Option<u64>,
}

#[allow(clippy::future_not_send)]
#[get("/ws")]
pub async fn websocket(
    req: actix_web::HttpRequest,
    stream: web::Payload,
    query: web::Query<ConnectRequest>,
    ws_server: web::Data<WsServerHandle>,
) -> Result<HttpResponse, actix_web::Error> {
    let (response, session, msg_stream) = actix_ws::handle(&req, stream)?;

    // spawn websocket handler (and don't await it) so that the response is returned immediately
    actix_web::rt::spawn(handler::handle_ws(
        ws_server.get_ref().clone(),
        query.user_id,
        session,
        msg_stream,
    ));

    Ok(response)
}

#[route("/events", method = "POST")]
pub async fn publish_event_endpoint(
    event: Json<DomainEvent>,
    ws_server: web::Data<WsServerHandle>,
) -> Result<Json<Value>> {
    let event = event.into_inner();

    log::debug!("Publishing event {event}");

    ws_server.broadcast_event(event).await;

    Ok(Json(json!({"success": true})))
}

#[derive(Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    user_id: u64,
    subscription: PushSubscription,
}

#[route("/push/subscribe", method = "POST")]
pub async fn push_subscribe_endpoint(
    body: Json<SubscribeRequest>,
    push: web::Data<PushGateway>,
) -> Result<Json<Value>> {
    let body = body.into_inner();

    push.subscribe(body.user_id, body.subscription);

    Ok(Json(json!({"success": true})))
}

#[derive(Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeRequest {
    user_id: u64,
    endpoint: String,
}

#[route("/push/unsubscribe", method = "POST")]
pub async fn push_unsubscribe_endpoint(
    body: Json<UnsubscribeRequest>,
    push: web::Data<PushGateway>,
) -> Result<Json<Value>> {
    let body = body.into_inner();

    push.unsubscribe(body.user_id, &body.endpoint);

    Ok(Json(json!({"success": true})))
}

#[route("/push/vapid-public-key", method = "GET")]
pub async fn vapid_public_key_endpoint(push: web::Data<PushGateway>) -> Result<Json<Value>> {
    Ok(Json(json!({"publicKey": push.vapid_public_key()})))
}
