//! Discovery of Alpaca devices on the local network.

#[cfg(feature = "client")]
pub use crate::client::{
    AlpacaServer, AscomDevice, BoundDiscoveryClient, CompletionHandler, DiscoveredEndpoint,
    DiscoveryClient, DiscoveryEngine, DiscoveryOptions, EndpointStatus, SessionState,
};
#[cfg(feature = "server")]
pub use crate::server::{
    AccessPolicy, BoundDiscoveryServer, DiscoveryServer, DiscoveryServerHandle, Ipv6Binding,
    SenderKind, SkippedSocket,
};

use netdev::Interface;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv6Addr, SocketAddr};
#[cfg(windows)]
use std::os::windows::prelude::AsRawSocket;
use tokio::net::UdpSocket;
use tracing::Dispatch;
use tracing::instrument::{WithDispatch, WithSubscriber};

/// IPv6 multicast group discovery requests are sent to.
pub const DISCOVERY_ADDR_V6: Ipv6Addr = Ipv6Addr::new(0xff12, 0, 0, 0, 0, 0, 0xa1, 0x9aca);
/// Discovery request payload. Also serves as the protocol version marker.
pub const DISCOVERY_MSG: &[u8] = b"alpacadiscovery1";
/// Default UDP port for discovery requests and responses.
pub const DEFAULT_DISCOVERY_PORT: u16 = 32227;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct AlpacaPort {
    #[serde(rename = "AlpacaPort")]
    pub(crate) alpaca_port: u16,
}

/// Identity of a socket within a responder or client socket registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketKey {
    /// Index of the network interface the socket is tied to, if any.
    pub interface: Option<u32>,
    /// Local address the socket is bound to.
    pub addr: SocketAddr,
}

impl std::fmt::Display for SocketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.interface {
            Some(interface) => write!(f, "{} (interface #{interface})", self.addr),
            None => self.addr.fmt(f),
        }
    }
}

pub(crate) fn get_active_interfaces() -> impl Iterator<Item = Interface> {
    netdev::get_interfaces()
        .into_iter()
        .filter(Interface::is_running)
}

/// Run `future` with the injected logger, or with whatever dispatcher is current right now.
pub(crate) fn with_logger<F>(future: F, logger: Option<&Dispatch>) -> WithDispatch<F> {
    match logger {
        Some(logger) => future.with_subscriber(logger.clone()),
        None => future.with_current_subscriber(),
    }
}

#[tracing::instrument(level = "trace", skip(configure))]
pub(crate) fn bind_socket(
    addr: SocketAddr,
    configure: impl FnOnce(&Socket) -> std::io::Result<()>,
) -> eyre::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    // For async code, we need to set the socket to non-blocking mode.
    socket.set_nonblocking(true)?;
    if addr.is_ipv6() {
        // IPv4 traffic always goes through dedicated IPv4 sockets.
        socket.set_only_v6(true)?;
    }
    configure(&socket)?;
    // SIO_UDP_CONNRESET is needed to ignore the occasional "port unreachable" errors
    // on Windows. Ideally we'd just ignore the error and move on but those tend to
    // render socket unusable so we'd have to recreate it as well.
    #[cfg(windows)]
    {
        use eyre::Context;
        use windows_sys::Win32::Networking::WinSock::{
            SIO_UDP_CONNRESET, WSAGetLastError, ioctlsocket,
        };

        unsafe {
            #[expect(
                clippy::as_conversions,
                clippy::cast_possible_truncation,
                clippy::cast_possible_wrap
            )]
            match ioctlsocket(socket.as_raw_socket() as _, SIO_UDP_CONNRESET as _, &mut 0) {
                0_i32 => Ok(()),
                _ => Err(WSAGetLastError()),
            }
        }
        .map_err(std::io::Error::from_raw_os_error)
        .context("Couldn't configure the UDP socket to ignore ICMP errors")?;
    }
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}
