use super::transaction::RequestTransaction;
use crate::api::{ConfiguredDevice, ServerInfo, ServiceType};
use crate::response::ValueResponse;
use eyre::WrapErr;
use futures::TryFutureExt;
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::Instrument;

/// Management API of one discovered server.
#[derive(Debug, Clone)]
pub(crate) struct ManagementTarget {
    http: reqwest::Client,
    base_url: reqwest::Url,
}

impl ManagementTarget {
    #[cfg(test)]
    pub(crate) const fn base_url(&self) -> &reqwest::Url {
        &self.base_url
    }
}

/// Host name standing in for a scoped IPv6 address, since URLs can't carry zone ids.
fn scoped_host_name(addr: std::net::SocketAddrV6) -> String {
    format!(
        "ipv6-{ip:032x}-scope-{scope}.alpaca.invalid",
        ip = u128::from(*addr.ip()),
        scope = addr.scope_id(),
    )
}

/// Client for the management part of the Alpaca API of discovered servers.
#[derive(Debug, Clone)]
pub(crate) struct ManagementClient {
    inner: reqwest::Client,
    client_id: u32,
}

impl ManagementClient {
    pub(crate) fn new() -> Self {
        Self {
            inner: reqwest::Client::new(),
            client_id: rand::random(),
        }
    }

    /// Where to send management requests for a server discovered at `addr`.
    pub(crate) fn target(
        &self,
        service_type: ServiceType,
        addr: SocketAddr,
    ) -> eyre::Result<ManagementTarget> {
        match addr {
            SocketAddr::V6(scoped) if scoped.scope_id() != 0 => {
                let host = scoped_host_name(scoped);
                let http = reqwest::Client::builder()
                    .resolve(&host, addr)
                    .no_proxy()
                    .build()
                    .wrap_err("Couldn't create HTTP client for a scoped address")?;
                let base_url = format!("{service_type}://{host}:{port}/", port = addr.port())
                    .parse()
                    .wrap_err("Invalid server URL")?;
                Ok(ManagementTarget { http, base_url })
            }
            _ => Ok(ManagementTarget {
                http: self.inner.clone(),
                base_url: service_type
                    .base_url(addr)
                    .parse()
                    .wrap_err("Invalid server URL")?,
            }),
        }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        target: &ManagementTarget,
        path: &str,
        timeout: Duration,
    ) -> eyre::Result<T> {
        let request_transaction = RequestTransaction::new(self.client_id);

        let base_url = &target.base_url;
        let span = tracing::debug_span!(
            "Alpaca management request",
            %base_url,
            path,
            client_transaction_id = request_transaction.client_transaction_id,
            client_id = request_transaction.client_id,
        );

        async move {
            let response = target
                .http
                .get(base_url.join(path)?)
                .query(&request_transaction)
                .timeout(timeout)
                .send()
                .await?
                .error_for_status()?
                .json::<ValueResponse<T>>()
                .await?;

            tracing::debug!(
                server_transaction_id = response.server_transaction_id,
                "Received response",
            );

            match response.client_transaction_id {
                Some(received_client_transaction_id)
                    if received_client_transaction_id
                        != request_transaction.client_transaction_id =>
                {
                    tracing::warn!(
                        sent = request_transaction.client_transaction_id,
                        received = received_client_transaction_id,
                        "ClientTransactionID mismatch",
                    );
                }
                _ => {}
            }

            response.into_result()
        }
        .map_err(|err: eyre::Report| {
            tracing::debug!(%err, "Alpaca management request failed");
            err.wrap_err(format!("Failed to send Alpaca request to {path}"))
        })
        .instrument(span)
        .await
    }

    /// Devices hosted by the server, with their types as reported.
    ///
    /// Types are resolved by the caller so that one unknown type doesn't discard the whole list.
    pub(crate) async fn configured_devices(
        &self,
        target: &ManagementTarget,
        timeout: Duration,
    ) -> eyre::Result<Vec<ConfiguredDevice<String>>> {
        self.request(target, "management/v1/configureddevices", timeout)
            .await
            .wrap_err("Couldn't retrieve list of devices")
    }

    pub(crate) async fn server_info(
        &self,
        target: &ManagementTarget,
        timeout: Duration,
    ) -> eyre::Result<ServerInfo> {
        self.request(target, "management/v1/description", timeout)
            .await
            .wrap_err("Couldn't retrieve server info")
    }

    pub(crate) async fn api_versions(
        &self,
        target: &ManagementTarget,
        timeout: Duration,
    ) -> eyre::Result<Vec<u32>> {
        self.request(target, "management/apiversions", timeout)
            .await
            .wrap_err("Couldn't retrieve supported API versions")
    }
}
