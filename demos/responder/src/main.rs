//! Serves a fake Alpaca management API with one camera and answers discovery requests for it.

use ascom_alpaca_discovery::discovery::DiscoveryServer;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use std::future::IntoFuture;
use std::net::Ipv4Addr;
use tokio::net::TcpListener;

fn value(value: Value) -> Json<Value> {
    Json(json!({
        "Value": value,
        "ErrorNumber": 0,
        "ErrorMessage": "",
    }))
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt::init();

    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 11111)).await?;
    let listen_addr = listener.local_addr()?;

    let app = Router::new()
        .route(
            "/management/apiversions",
            get(|| async { value(json!([1])) }),
        )
        .route(
            "/management/v1/description",
            get(|| async {
                value(json!({
                    "ServerName": "Responder demo",
                    "Manufacturer": "ascom-alpaca-discovery",
                    "ManufacturerVersion": env!("CARGO_PKG_VERSION"),
                    "Location": "Backyard",
                }))
            }),
        )
        .route(
            "/management/v1/configureddevices",
            get(|| async {
                value(json!([{
                    "DeviceName": "Demo camera",
                    "DeviceType": "Camera",
                    "DeviceNumber": 0,
                    "UniqueID": "5d4a1f86-5d8f-4b0e-9b33-6d3f0e7d4f01",
                }]))
            }),
        );

    let responder = DiscoveryServer::for_alpaca_server_at(listen_addr).bind()?;
    for addr in responder.listen_addrs() {
        tracing::info!(%addr, "Listening for discovery requests");
    }
    let responder = responder.spawn();

    tracing::info!(%listen_addr, "Serving Alpaca management API");

    tokio::select! {
        result = axum::serve(listener, app).into_future() => result?,
        result = tokio::signal::ctrl_c() => result?,
    }

    responder.dispose();

    Ok(())
}
