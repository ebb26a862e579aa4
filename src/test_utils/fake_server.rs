use axum::extract::Query;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{Value, json};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::TcpListener;
use tokio::task::AbortHandle;

#[derive(Deserialize)]
struct TransactionQuery {
    #[serde(rename = "ClientTransactionID")]
    client_transaction_id: Option<u32>,
}

fn envelope(value: Value, query: &TransactionQuery) -> Json<Value> {
    Json(json!({
        "Value": value,
        "ClientTransactionID": query.client_transaction_id,
        "ServerTransactionID": 1,
        "ErrorNumber": 0,
        "ErrorMessage": "",
    }))
}

fn value_route(value: Value) -> axum::routing::MethodRouter {
    get(move |Query(query): Query<TransactionQuery>| {
        std::future::ready(envelope(value.clone(), &query))
    })
}

/// Minimal Alpaca management API on a random loopback port.
#[derive(Debug)]
pub(crate) struct FakeAlpacaServer {
    addr: SocketAddr,
    task: AbortHandle,
}

impl FakeAlpacaServer {
    async fn start(ip: IpAddr, router: Router) -> eyre::Result<Self> {
        let listener = TcpListener::bind((ip, 0)).await?;
        let addr = listener.local_addr()?;
        let task = tokio::spawn(async move { axum::serve(listener, router).await }).abort_handle();
        tracing::debug!(%addr, "Started fake Alpaca server");
        Ok(Self { addr, task })
    }

    /// Serve the given `configureddevices` list along with a fixed description.
    pub(crate) async fn serve(devices: Value) -> eyre::Result<Self> {
        Self::serve_on(Ipv4Addr::LOCALHOST.into(), devices).await
    }

    /// Same as [`serve`](Self::serve), but on the given local address.
    pub(crate) async fn serve_on(ip: IpAddr, devices: Value) -> eyre::Result<Self> {
        Self::start(
            ip,
            Router::new()
                .route("/management/v1/configureddevices", value_route(devices))
                .route(
                    "/management/v1/description",
                    value_route(json!({
                        "ServerName": "Fake Alpaca server",
                        "Manufacturer": "Test",
                        "ManufacturerVersion": "0.0.0",
                        "Location": "Nowhere",
                    })),
                )
                .route("/management/apiversions", value_route(json!([1]))),
        )
        .await
    }

    /// Accept connections but never respond to any request.
    pub(crate) async fn hanging() -> eyre::Result<Self> {
        Self::start(
            Ipv4Addr::LOCALHOST.into(),
            Router::new().fallback(|| std::future::pending::<()>()),
        )
        .await
    }

    pub(crate) const fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for FakeAlpacaServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
