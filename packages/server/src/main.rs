#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

mod api;
mod ws;

use std::{env, sync::Arc};

use actix_cors::Cors;
use actix_web::{App, http, middleware, web};
use mebelplace_push::{DisabledPushProvider, PushGateway, VapidConfig};
use tokio::try_join;

#[actix_web::main]
async fn main() -> Result<(), std::io::Error> {
    env_logger::init();

    let service_port = {
        let args: Vec<String> = env::args().collect();

        if args.len() > 1 {
            args[1].parse::<u16>().unwrap()
        } else {
            env::var("PORT")
                .ok()
                .and_then(|port| port.parse::<u16>().ok())
                .unwrap_or(8000)
        }
    };

    let push_gateway = Arc::new(PushGateway::new(
        VapidConfig::from_env(),
        Box::new(DisabledPushProvider),
    ));

    let (ws_server, ws_server_handle) = ws::server::WsServer::new(push_gateway.clone());
    let ws_server = tokio::task::spawn(ws_server.run());

    let app = {
        let ws_server_handle = ws_server_handle.clone();
        let push_gateway = push_gateway.clone();

        move || {
            let cors = Cors::default()
                .allow_any_origin()
                .allowed_methods(vec!["GET", "POST"])
                .allowed_headers(vec![http::header::AUTHORIZATION, http::header::ACCEPT])
                .allowed_header(http::header::CONTENT_TYPE)
                .supports_credentials()
                .max_age(3600);

            App::new()
                .wrap(cors)
                .wrap(middleware::Compress::default())
                .app_data(web::Data::new(ws_server_handle.clone()))
                .app_data(web::Data::from(push_gateway.clone()))
                .service(api::health_endpoint)
                .service(api::websocket)
                .service(api::publish_event_endpoint)
                .service(api::push_subscribe_endpoint)
                .service(api::push_unsubscribe_endpoint)
                .service(api::vapid_public_key_endpoint)
        }
    };

    let http_server = actix_web::HttpServer::new(app)
        .bind(("0.0.0.0", service_port))?
        .run();

    log::info!("Listening on 0.0.0.0:{service_port}");

    try_join!(
        async move {
            let resp = http_server.await;
            ws_server_handle.shutdown();
            resp
        },
        async move { ws_server.await.map_err(std::io::Error::other)? }
    )?;

    Ok(())
}
