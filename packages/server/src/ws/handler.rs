use std::time::{Duration, Instant};

use actix_ws::Message;
use futures_util::{
    StreamExt as _,
    future::{Either, select},
};
use tokio::{pin, sync::mpsc, time::interval};

use crate::ws::server::WsServerHandle;

/// How often heartbeat pings are sent
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// How long before lack of client response causes a timeout
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shuttle frames between one client and the ws server, respond to ping
/// messages, and monitor connection health to detect network issues and free
/// up resources.
pub async fn handle_ws(
    ws_server: WsServerHandle,
    user_id: Option<u64>,
    mut session: actix_ws::Session,
    mut msg_stream: actix_ws::MessageStream,
) {
    let mut last_heartbeat = Instant::now();
    let mut interval = interval(HEARTBEAT_INTERVAL);

    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel();

    let conn_id = ws_server.connect(user_id, conn_tx).await;

    log::debug!("Connection {conn_id} opened (user: {user_id:?})");

    let close_reason = loop {
        // most of the futures we process need to be stack-pinned to work with select()

        let tick = interval.tick();
        pin!(tick);

        let msg_rx = conn_rx.recv();
        pin!(msg_rx);

        let messages = select(msg_stream.next(), msg_rx);
        pin!(messages);

        match select(messages, tick).await {
            // commands & messages received from client
            Either::Left((Either::Left((Some(Ok(msg)), _)), _)) => {
                log::trace!("msg: {msg:?}");

                match msg {
                    Message::Ping(bytes) => {
                        last_heartbeat = Instant::now();

                        if session.pong(&bytes).await.is_err() {
                            break None;
                        }
                    }

                    Message::Pong(_) => {
                        last_heartbeat = Instant::now();
                    }

                    Message::Text(text) => {
                        last_heartbeat = Instant::now();
                        ws_server.send_message(conn_id, text.to_string()).await;
                    }

                    Message::Binary(_bytes) => {
                        log::warn!("unexpected binary message");
                    }

                    Message::Close(reason) => break reason,

                    Message::Continuation(_) => {
                        log::warn!("no support for continuation frames");
                    }

                    // no-op; ignore
                    Message::Nop => {}
                }
            }

            // client WebSocket stream error
            Either::Left((Either::Left((Some(Err(err)), _)), _)) => {
                log::error!("{err}");
                break None;
            }

            // client WebSocket stream ended
            Either::Left((Either::Left((None, _)), _)) => break None,

            // ws messages received from other room participants
            Either::Left((Either::Right((Some(ws_msg), _)), _)) => {
                if session.text(ws_msg).await.is_err() {
                    break None;
                }
            }

            // all connection's message senders were dropped
            Either::Left((Either::Right((None, _)), _)) => unreachable!(
                "all connection message senders were dropped; ws server may have panicked"
            ),

            // heartbeat internal tick
            Either::Right((_inst, _)) => {
                // if no heartbeat ping/pong received recently, close the connection
                if Instant::now().duration_since(last_heartbeat) > CLIENT_TIMEOUT {
                    log::info!(
                        "client has not sent heartbeat in over {CLIENT_TIMEOUT:?}; disconnecting"
                    );
                    break None;
                }

                // send heartbeat ping
                let _ = session.ping(b"").await;
            }
        }
    };

    ws_server.disconnect(conn_id).await;

    // attempt to close connection gracefully
    let _ = session.close(close_reason).await;

    log::debug!("Connection {conn_id} closed");
}
