/*!
Rust implementation of the [ASCOM Alpaca discovery protocol](https://ascom-standards.org/AlpacaDeviceAPI_v1.yaml).

Alpaca servers listen for a well-known UDP request (`alpacadiscovery1`) on port 32227 and answer
with the HTTP port their device API is served on. This crate implements both sides of that exchange:

- [`DiscoveryServer`](crate::discovery::DiscoveryServer) (feature `server`) - the responder
  that device servers run next to their HTTP API. It listens on IPv4 broadcast and on the IPv6
  multicast group, filters requests through a live-tunable [`AccessPolicy`](crate::discovery::AccessPolicy)
  and replies with `{"AlpacaPort": <port>}`.
- [`DiscoveryClient`](crate::discovery::DiscoveryClient) (feature `client`) - a low-level
  client that sends requests on every local network interface and yields a stream of unique server addresses.
- [`DiscoveryEngine`](crate::discovery::DiscoveryEngine) (feature `client`) - a stateful session
  owner that drives the client, enumerates devices hosted by each discovered server via its
  management API, optionally resolves host names and exposes the results.

## Usage

Discovering all cameras on the local network:

```no_run
use ascom_alpaca_discovery::DeviceType;
use ascom_alpaca_discovery::discovery::DiscoveryEngine;

# #[tokio::main]
# async fn main() -> eyre::Result<()> {
let cameras = DiscoveryEngine::discover_ascom_devices(Some(DeviceType::Camera)).await?;

for camera in cameras {
    println!("{} at {}:{}", camera.device_name, camera.ip_address, camera.ip_port);
}
# Ok(())
# }
```

Answering discovery requests for an Alpaca server listening on port 11111:

```no_run
use ascom_alpaca_discovery::discovery::DiscoveryServer;

# #[tokio::main]
# async fn main() -> eyre::Result<()> {
let responder = DiscoveryServer::new(11111).bind()?.spawn();

// ... serve the Alpaca HTTP API ...

responder.dispose();
# Ok(())
# }
```

## Logging

All internal diagnostics are reported via [`tracing`]. Both the responder and the engine accept
an optional [`tracing::Dispatch`] that is attached to every task they spawn; without one, tasks
inherit the dispatcher that is current when they are started.
*/

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub(crate) mod macros;

mod api;
pub use api::{ConfiguredDevice, DeviceType, ServerInfo, ServiceType, UnknownDeviceType};

mod errors;
pub use errors::DiscoveryError;

pub mod discovery;

#[cfg(feature = "client")]
mod client;

#[cfg(feature = "server")]
mod server;

#[cfg(feature = "client")]
mod response;

#[cfg(test)]
mod test_utils;
