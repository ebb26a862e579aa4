use crate::DiscoveryError;
use crate::discovery::{
    AlpacaPort, DEFAULT_DISCOVERY_PORT, DISCOVERY_ADDR_V6, DISCOVERY_MSG, SocketKey, bind_socket,
    get_active_interfaces,
};
use futures::Stream;
use indexmap::IndexMap;
use netdev::Interface;
use std::collections::HashSet;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::Instrument;

/// `{"AlpacaPort":12345}` plus plenty of room for whitespace and extra fields.
const RECV_BUFFER_SIZE: usize = 512;
/// Pause after a failed receive so that a broken socket doesn't spin.
const RECV_ERROR_DELAY: Duration = Duration::from_millis(10);

/// Alpaca discovery client.
#[derive(Debug, Clone, Copy)]
pub struct DiscoveryClient {
    /// Number of discovery requests to send on each socket.
    ///
    /// Defaults to 2.
    pub num_requests: usize,
    /// Time between discovery requests.
    ///
    /// Defaults to 100 ms.
    pub request_interval: Duration,
    /// Total time to wait for responses.
    ///
    /// Defaults to 1.5 seconds.
    pub timeout: Duration,
    /// Whether to send IPv4 broadcast requests.
    pub include_ipv4: bool,
    /// Whether to send IPv6 multicast requests.
    pub include_ipv6: bool,
    /// Discovery port to send requests to.
    ///
    /// Defaults to 32227.
    pub discovery_port: u16,
}

impl Default for DiscoveryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryClient {
    /// Create a discovery client with default settings.
    pub const fn new() -> Self {
        Self {
            num_requests: 2,
            request_interval: Duration::from_millis(100),
            timeout: Duration::from_millis(1500),
            include_ipv4: true,
            include_ipv6: true,
            discovery_port: DEFAULT_DISCOVERY_PORT,
        }
    }

    pub(crate) const fn validate(&self) -> Result<(), DiscoveryError> {
        if self.num_requests == 0 {
            return Err(DiscoveryError::configuration(
                "at least one discovery request must be sent",
            ));
        }
        if self.timeout.is_zero() {
            return Err(DiscoveryError::configuration(
                "discovery timeout must be positive",
            ));
        }
        if !self.include_ipv4 && !self.include_ipv6 {
            return Err(DiscoveryError::configuration(
                "at least one of IPv4 or IPv6 must be enabled",
            ));
        }
        Ok(())
    }

    /// Opens one socket per requested address family on every active network interface.
    ///
    /// Interfaces that fail are logged and skipped; fails only if nothing could be opened.
    ///
    /// Must be called from within a Tokio runtime.
    #[tracing::instrument(err)]
    pub fn bind(self) -> Result<BoundDiscoveryClient, DiscoveryError> {
        self.validate()?;

        let mut sockets = IndexMap::new();

        for intf in get_active_interfaces() {
            let targets = self
                .ipv4_targets(&intf)
                .chain(self.ipv6_targets(&intf))
                .collect::<Vec<_>>();

            for target in targets {
                let key = SocketKey {
                    interface: Some(intf.index),
                    addr: target.local_addr,
                };
                if sockets.contains_key(&key) {
                    continue;
                }
                match target.bind() {
                    Ok(socket) => {
                        tracing::trace!(%key, target = %target.addr, "Opened discovery socket");
                        let _ = sockets.insert(key, socket);
                    }
                    Err(err) => {
                        tracing::warn!(%key, interface = %intf.name, %err, "Couldn't open discovery socket, skipping");
                    }
                }
            }
        }

        if sockets.is_empty() {
            return Err(DiscoveryError::NoSocketsBound);
        }

        tracing::debug!(sockets = sockets.len(), "Opened discovery sockets");

        Ok(BoundDiscoveryClient {
            sockets,
            settings: self,
        })
    }

    fn ipv4_targets(&self, intf: &Interface) -> impl Iterator<Item = RequestTarget> {
        let port = self.discovery_port;

        self.include_ipv4
            .then_some(&intf.ipv4)
            .into_iter()
            .flatten()
            .filter_map(move |net| {
                let local = net.addr();
                let target = if local.is_loopback() {
                    // Loopback doesn't do broadcast, talk to the local machine directly.
                    local
                } else if intf.is_broadcast() {
                    net.broadcast()
                } else {
                    return None;
                };
                Some(RequestTarget {
                    local_addr: SocketAddr::new(local.into(), 0),
                    addr: SocketAddr::new(target.into(), port),
                    multicast_interface: None,
                })
            })
    }

    fn ipv6_targets(&self, intf: &Interface) -> impl Iterator<Item = RequestTarget> {
        let port = self.discovery_port;

        let target = if !self.include_ipv6 || intf.ipv6.is_empty() {
            None
        } else if intf.is_loopback() {
            Some(RequestTarget {
                local_addr: SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 0),
                addr: SocketAddr::new(Ipv6Addr::LOCALHOST.into(), port),
                multicast_interface: None,
            })
        } else if intf.is_multicast() {
            Some(RequestTarget {
                local_addr: SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
                addr: SocketAddrV6::new(DISCOVERY_ADDR_V6, port, 0, intf.index).into(),
                multicast_interface: Some(intf.index),
            })
        } else {
            None
        };

        target.into_iter()
    }
}

/// Where a single socket sends its requests from and to.
#[derive(Debug, Clone, Copy)]
struct RequestTarget {
    local_addr: SocketAddr,
    addr: SocketAddr,
    multicast_interface: Option<u32>,
}

impl RequestTarget {
    fn bind(self) -> eyre::Result<RequestSocket> {
        let socket = bind_socket(self.local_addr, |socket| {
            match self.multicast_interface {
                Some(index) => socket.set_multicast_if_v6(index)?,
                None if self.local_addr.is_ipv4() => socket.set_broadcast(true)?,
                None => {}
            }
            Ok(())
        })?;
        Ok(RequestSocket {
            socket,
            target: self.addr,
        })
    }
}

#[derive(Debug)]
struct RequestSocket {
    socket: UdpSocket,
    target: SocketAddr,
}

/// Parse a discovery response into the address of the Alpaca server that sent it.
pub(crate) fn parse_response(data: &[u8], src: SocketAddr) -> eyre::Result<SocketAddr> {
    // Tolerate trailing NULs and whitespace from sloppy servers.
    let end = data
        .iter()
        .rposition(|&b| b != 0 && !b.is_ascii_whitespace())
        .map_or(0, |pos| pos + 1);
    let AlpacaPort { alpaca_port } = serde_json::from_slice(&data[..end])?;
    eyre::ensure!(alpaca_port != 0, "Alpaca port can't be 0");
    Ok(match src {
        // Link-local addresses are only reachable through the interface the response came from.
        SocketAddr::V6(src) if src.ip().is_unicast_link_local() => {
            SocketAddrV6::new(*src.ip(), alpaca_port, 0, src.scope_id()).into()
        }
        _ => SocketAddr::new(src.ip().to_canonical(), alpaca_port),
    })
}

impl RequestSocket {
    async fn run(
        self,
        settings: DiscoveryClient,
        deadline: Instant,
        responses: mpsc::UnboundedSender<SocketAddr>,
    ) {
        let Self { socket, target } = self;

        let send = async {
            for request_num in 0..settings.num_requests {
                if request_num != 0 {
                    tokio::time::sleep(settings.request_interval).await;
                }
                tracing::debug!(request_num, %target, "Sending discovery request");
                if let Err(err) = socket.send_to(DISCOVERY_MSG, target).await {
                    tracing::warn!(request_num, %target, %err, "Failed to send discovery request");
                }
            }
        };

        let receive = async {
            let mut buf = [0; RECV_BUFFER_SIZE];
            loop {
                let (len, src) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(err) => {
                        tracing::warn!(%err, "Failed to receive discovery response");
                        tokio::time::sleep(RECV_ERROR_DELAY).await;
                        continue;
                    }
                };
                match parse_response(&buf[..len], src) {
                    Ok(addr) => {
                        tracing::debug!(%addr, "Received Alpaca discovery response");
                        if responses.send(addr).is_err() {
                            // Nobody is listening anymore.
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%src, %err, "Received unknown discovery response");
                    }
                }
            }
        };

        if tokio::time::timeout_at(deadline, futures::future::join(send, receive))
            .await
            .is_err()
        {
            tracing::trace!("Ending discovery due to timeout");
        }
    }
}

/// Discovery client with its sockets opened.
#[derive(Debug)]
pub struct BoundDiscoveryClient {
    sockets: IndexMap<SocketKey, RequestSocket>,
    settings: DiscoveryClient,
}

impl BoundDiscoveryClient {
    /// Local addresses of all opened sockets.
    pub fn local_addrs(&self) -> impl '_ + Iterator<Item = SocketAddr> {
        self.sockets
            .values()
            .filter_map(|sender| sender.socket.local_addr().ok())
    }

    /// Discover Alpaca servers on the local network.
    ///
    /// Returns a stream of unique server addresses that ends once
    /// [`timeout`](DiscoveryClient::timeout) has elapsed.
    pub fn discover_addrs(self) -> impl Stream<Item = SocketAddr> {
        let deadline = Instant::now() + self.settings.timeout;
        self.discover_addrs_until(deadline)
    }

    /// Same as [`discover_addrs`](Self::discover_addrs), but with an explicit deadline.
    ///
    /// Each socket runs in its own task; dropping the stream aborts them and closes the sockets.
    pub fn discover_addrs_until(self, deadline: Instant) -> impl Stream<Item = SocketAddr> {
        tracing::debug!("Starting Alpaca discovery");

        let (tx, rx) = mpsc::unbounded_channel();

        let tasks = self
            .sockets
            .into_iter()
            .map(|(key, sender)| {
                let task = sender
                    .run(self.settings, deadline, tx.clone())
                    .instrument(tracing::debug_span!("discovery_socket", %key));
                tokio::spawn(crate::discovery::with_logger(task, None)).abort_handle()
            })
            .collect();

        let state = DedupState {
            responses: rx,
            seen: HashSet::new(),
            _tasks: RequestTasks(tasks),
        };

        futures::stream::unfold(state, |mut state| async move {
            while let Some(addr) = state.responses.recv().await {
                if state.seen.insert(addr) {
                    return Some((addr, state));
                }
                tracing::trace!(%addr, "Ignoring duplicate discovery response");
            }
            None
        })
    }
}

struct DedupState {
    responses: mpsc::UnboundedReceiver<SocketAddr>,
    seen: HashSet<SocketAddr>,
    _tasks: RequestTasks,
}

/// Aborts the per-socket tasks when the stream is dropped early.
struct RequestTasks(Vec<AbortHandle>);

impl Drop for RequestTasks {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DiscoveryClient, parse_response};
    use crate::DiscoveryError;
    use futures::StreamExt;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};
    use std::time::Duration;
    use tokio::net::UdpSocket;

    #[test]
    fn parses_responses() -> eyre::Result<()> {
        let src = SocketAddr::new(Ipv4Addr::new(192, 168, 1, 5).into(), 32227);
        let expected = SocketAddr::new(src.ip(), 11111);

        eyre::ensure!(parse_response(br#"{"AlpacaPort":11111}"#, src)? == expected);
        eyre::ensure!(parse_response(b"{ \"AlpacaPort\": 11111 }\r\n\0\0", src)? == expected);
        eyre::ensure!(
            parse_response(br#"{"AlpacaPort":11111,"Extra":true}"#, src)? == expected
        );

        eyre::ensure!(parse_response(b"alpacadiscovery1", src).is_err());
        eyre::ensure!(parse_response(br#"{"AlpacaPort":70000}"#, src).is_err());
        eyre::ensure!(parse_response(br#"{"AlpacaPort":0}"#, src).is_err());
        eyre::ensure!(parse_response(br#"{"Port":11111}"#, src).is_err());

        Ok(())
    }

    #[test]
    fn canonicalizes_mapped_addresses() -> eyre::Result<()> {
        let src = SocketAddr::new(Ipv4Addr::LOCALHOST.to_ipv6_mapped().into(), 32227);
        let addr = parse_response(br#"{"AlpacaPort":80}"#, src)?;
        eyre::ensure!(addr.ip() == IpAddr::from(Ipv4Addr::LOCALHOST));

        let src = SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 32227);
        let addr = parse_response(br#"{"AlpacaPort":80}"#, src)?;
        eyre::ensure!(addr.ip() == IpAddr::from(Ipv6Addr::LOCALHOST));
        Ok(())
    }

    #[test]
    fn keeps_scope_of_link_local_senders() -> eyre::Result<()> {
        let link_local = Ipv6Addr::new(0xfe80, 0, 0, 0, 0xfc, 0xff, 0xfe00, 1);
        let src = SocketAddrV6::new(link_local, 32227, 0, 3).into();
        let addr = parse_response(br#"{"AlpacaPort":11111}"#, src)?;
        eyre::ensure!(
            addr == SocketAddrV6::new(link_local, 11111, 0, 3).into(),
            "Scope was lost: {addr}"
        );

        // Global addresses don't need a scope; the same server must not show up twice.
        let global = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);
        let src = SocketAddrV6::new(global, 32227, 0, 3).into();
        let addr = parse_response(br#"{"AlpacaPort":11111}"#, src)?;
        eyre::ensure!(addr == SocketAddr::new(global.into(), 11111));
        Ok(())
    }

    #[test]
    fn rejects_invalid_settings() {
        for client in [
            DiscoveryClient {
                num_requests: 0,
                ..DiscoveryClient::new()
            },
            DiscoveryClient {
                timeout: Duration::ZERO,
                ..DiscoveryClient::new()
            },
            DiscoveryClient {
                include_ipv4: false,
                include_ipv6: false,
                ..DiscoveryClient::new()
            },
        ] {
            assert!(matches!(
                client.validate(),
                Err(DiscoveryError::Configuration(_))
            ));
        }
        assert!(DiscoveryClient::new().validate().is_ok());
    }

    #[tokio::test]
    async fn deduplicates_and_ignores_garbage() -> eyre::Result<()> {
        // A misbehaving server that answers every request twice and adds some noise.
        let server = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let discovery_port = server.local_addr()?.port();

        let server_task = tokio::spawn(async move {
            let mut buf = [0; 64];
            while let Ok((_len, src)) = server.recv_from(&mut buf).await {
                let responses: [&[u8]; 3] = [
                    br#"{"AlpacaPort":4242}"#,
                    b"not json at all",
                    br#"{"AlpacaPort":4242}"#,
                ];
                for response in responses {
                    let _ = server.send_to(response, src).await;
                }
            }
        });

        let client = DiscoveryClient {
            discovery_port,
            num_requests: 3,
            request_interval: Duration::from_millis(50),
            timeout: Duration::from_millis(600),
            include_ipv6: false,
            ..DiscoveryClient::new()
        };

        let addrs = client.bind()?.discover_addrs().collect::<Vec<_>>().await;
        server_task.abort();

        eyre::ensure!(
            addrs == [SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 4242)],
            "Unexpected discovered addresses: {addrs:#?}"
        );

        Ok(())
    }
}
