use super::access::{AccessPolicy, HostAddrs, SenderKind};
use crate::DiscoveryError;
use crate::discovery::{
    AlpacaPort, DEFAULT_DISCOVERY_PORT, DISCOVERY_ADDR_V6, DISCOVERY_MSG, SocketKey, bind_socket,
    get_active_interfaces, with_logger,
};
use eyre::WrapErr;
use indexmap::IndexMap;
use netdev::Interface;
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::AbortHandle;
use tracing::{Dispatch, Instrument};

/// Datagrams are expected to be tiny, but some clients pad the request.
const RECV_BUFFER_SIZE: usize = 1024;
/// Pause before re-arming a socket whose receive failed twice in a row.
const REARM_DELAY: Duration = Duration::from_millis(100);

/// How IPv6 discovery sockets are bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ipv6Binding {
    /// One socket per link-local or loopback address of every multicast-capable adapter.
    ///
    /// Required on Windows, where a wildcard socket only receives multicast from one adapter.
    PerAdapter,
    /// A single `[::]` socket that joins the multicast group on every adapter.
    Wildcard,
}

impl Ipv6Binding {
    /// The binding mode that works on the current platform.
    pub const fn platform_default() -> Self {
        if cfg!(windows) {
            Self::PerAdapter
        } else {
            Self::Wildcard
        }
    }
}

impl Default for Ipv6Binding {
    fn default() -> Self {
        Self::platform_default()
    }
}

/// Alpaca discovery server.
#[derive(Debug, Clone)]
pub struct DiscoveryServer {
    /// Port of the running Alpaca server to report.
    pub alpaca_port: u16,
    /// Port to listen for discovery requests on.
    ///
    /// Defaults to 32227. Use 0 to pick a random port (shared by all sockets).
    pub discovery_port: u16,
    /// IPv4 address to listen on.
    ///
    /// Defaults to the unspecified address so that subnet broadcasts are received.
    pub ipv4_listen_addr: Ipv4Addr,
    /// Whether to listen for IPv4 broadcast requests.
    pub use_ipv4: bool,
    /// Whether to listen for IPv6 multicast requests.
    pub use_ipv6: bool,
    /// How IPv6 sockets are bound.
    pub ipv6_binding: Ipv6Binding,
    /// Which requests to answer.
    pub access: AccessPolicy,
    /// Logger to attach to the listener tasks.
    pub logger: Option<Dispatch>,
}

/// A socket that was requested but couldn't be bound.
#[derive(Debug, Clone)]
pub struct SkippedSocket {
    /// Interface and address the socket was meant for.
    pub key: SocketKey,
    /// Why binding failed.
    pub error: String,
}

impl DiscoveryServer {
    /// Creates a new discovery server for an Alpaca server listening on the specified port.
    pub fn new(alpaca_port: u16) -> Self {
        Self {
            alpaca_port,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            ipv4_listen_addr: Ipv4Addr::UNSPECIFIED,
            use_ipv4: true,
            use_ipv6: true,
            ipv6_binding: Ipv6Binding::platform_default(),
            access: AccessPolicy::default(),
            logger: None,
        }
    }

    /// Creates a new discovery server for Alpaca server running at the specified address.
    ///
    /// Only the port and the address family of `alpaca_listen_addr` are used; discovery
    /// itself always listens on wildcard / multicast addresses.
    pub fn for_alpaca_server_at(alpaca_listen_addr: SocketAddr) -> Self {
        let mut server = Self::new(alpaca_listen_addr.port());
        match alpaca_listen_addr.ip() {
            // A server bound to an IPv4 address is unreachable via IPv6 and vice versa.
            IpAddr::V4(ip) if !ip.is_unspecified() => server.use_ipv6 = false,
            IpAddr::V6(ip) if !ip.is_unspecified() => server.use_ipv4 = false,
            _ => {}
        }
        server
    }

    /// Binds the discovery sockets.
    ///
    /// Failures of individual sockets are logged and reported via
    /// [`BoundDiscoveryServer::skipped_sockets`]; it's up to the caller to decide
    /// whether a partially bound server is acceptable. Fails only if no socket could be bound.
    ///
    /// Must be called from within a Tokio runtime.
    #[tracing::instrument(skip(self), fields(alpaca_port = self.alpaca_port, discovery_port = self.discovery_port), err)]
    pub fn bind(self) -> Result<BoundDiscoveryServer, DiscoveryError> {
        if !self.use_ipv4 && !self.use_ipv6 {
            return Err(DiscoveryError::configuration(
                "at least one of IPv4 or IPv6 must be enabled",
            ));
        }

        let response_msg = serde_json::to_vec(&AlpacaPort {
            alpaca_port: self.alpaca_port,
        })
        .wrap_err("Couldn't serialize discovery response")?;

        let mut registry = SocketRegistry::new(self.discovery_port);

        if self.use_ipv4 {
            registry.bind_with(None, SocketAddr::new(self.ipv4_listen_addr.into(), 0), |addr| {
                bind_socket(addr, |socket| {
                    // Reuse address for parallel server instances in e.g. tests.
                    socket.set_reuse_address(true)?;
                    socket.set_broadcast(true)?;
                    socket.set_multicast_loop_v4(false)
                })
            });
        }

        if self.use_ipv6 {
            match self.ipv6_binding {
                Ipv6Binding::PerAdapter => registry.bind_ipv6_per_adapter(),
                Ipv6Binding::Wildcard => registry.bind_ipv6_wildcard(),
            }
        }

        if registry.sockets.is_empty() {
            return Err(DiscoveryError::NoSocketsBound);
        }

        tracing::debug!(
            bound = registry.sockets.len(),
            skipped = registry.skipped.len(),
            "Bound Alpaca discovery server"
        );

        Ok(BoundDiscoveryServer {
            sockets: registry.sockets,
            skipped: registry.skipped,
            responder: Arc::new(Responder {
                response_msg,
                access: self.access,
                host_addrs: HostAddrs::collect(),
                disposed: Arc::new(AtomicBool::new(false)),
            }),
            logger: self.logger,
        })
    }
}

/// Sockets bound so far, keyed by interface and address.
struct SocketRegistry {
    sockets: IndexMap<SocketKey, UdpSocket>,
    skipped: Vec<SkippedSocket>,
    /// Requested port until the first socket is bound, then the port actually used.
    port: u16,
}

impl SocketRegistry {
    fn new(port: u16) -> Self {
        Self {
            sockets: IndexMap::new(),
            skipped: Vec::new(),
            port,
        }
    }

    fn bind_with(
        &mut self,
        interface: Option<u32>,
        addr: SocketAddr,
        bind: impl FnOnce(SocketAddr) -> eyre::Result<UdpSocket>,
    ) {
        let mut addr = addr;
        addr.set_port(self.port);

        let key = SocketKey { interface, addr };

        match bind(addr).and_then(|socket| Ok((socket.local_addr()?, socket))) {
            Ok((local_addr, socket)) => {
                tracing::debug!(%key, %local_addr, "Bound discovery socket");
                self.port = local_addr.port();
                let _ = self.sockets.insert(
                    SocketKey {
                        interface,
                        addr: local_addr,
                    },
                    socket,
                );
            }
            Err(err) => {
                tracing::warn!(%key, %err, "Couldn't bind discovery socket, skipping");
                self.skipped.push(SkippedSocket {
                    key,
                    error: format!("{err:#}"),
                });
            }
        }
    }

    fn bind_ipv6_per_adapter(&mut self) {
        for intf in get_active_interfaces().filter(Interface::is_multicast) {
            let index = intf.index;

            for net in &intf.ipv6 {
                let ip = net.addr();

                let scope_id = if ip.is_unicast_link_local() {
                    index
                } else if ip.is_loopback() {
                    0
                } else {
                    continue;
                };

                self.bind_with(
                    Some(index),
                    SocketAddrV6::new(ip, 0, 0, scope_id).into(),
                    |addr| {
                        let socket = bind_socket(addr, |socket| socket.set_reuse_address(true))?;
                        socket
                            .join_multicast_v6(&DISCOVERY_ADDR_V6, index)
                            .wrap_err_with(|| {
                                format!("Couldn't join multicast group on {}", intf.name)
                            })?;
                        Ok(socket)
                    },
                );
            }
        }
    }

    fn bind_ipv6_wildcard(&mut self) {
        self.bind_with(None, SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0), |addr| {
            let socket = bind_socket(addr, |socket| socket.set_reuse_address(true))?;

            let indices = get_active_interfaces()
                .filter(|intf| intf.is_multicast() && !intf.ipv6.is_empty())
                .map(|intf| intf.index);

            let mut joined = 0_usize;
            // Index 0 lets the OS pick the default interface.
            for index in std::iter::once(0).chain(indices) {
                match socket.join_multicast_v6(&DISCOVERY_ADDR_V6, index) {
                    Ok(()) => joined += 1,
                    Err(err) => tracing::debug!(index, %err, "Couldn't join multicast group"),
                }
            }
            if joined == 0 {
                tracing::warn!("IPv6 discovery socket only receives unicast requests");
            }

            Ok(socket)
        });
    }
}

/// State shared by all listener loops of one server.
#[derive(Debug)]
struct Responder {
    response_msg: Vec<u8>,
    access: AccessPolicy,
    host_addrs: HostAddrs,
    disposed: Arc<AtomicBool>,
}

pub(crate) fn contains_discovery_msg(data: &[u8]) -> bool {
    data.windows(DISCOVERY_MSG.len())
        .any(|window| window == DISCOVERY_MSG)
}

impl Responder {
    async fn handle(&self, socket: &UdpSocket, data: &[u8], src: SocketAddr) -> eyre::Result<()> {
        let sender = SenderKind::classify(src.ip(), &self.host_addrs);
        if !self.access.admits(sender) {
            tracing::debug!(%src, ?sender, "Ignoring discovery request due to access policy");
            return Ok(());
        }
        if !contains_discovery_msg(data) {
            tracing::warn!(%src, "Received unknown packet");
            return Ok(());
        }
        if self.disposed.load(Ordering::Acquire) {
            return Ok(());
        }
        tracing::debug!(%src, ?sender, "Received Alpaca discovery request");
        eyre::ensure!(
            socket.send_to(&self.response_msg, src).await? == self.response_msg.len(),
            "Failed to send discovery response",
        );
        Ok(())
    }

    async fn serve(self: Arc<Self>, socket: UdpSocket) -> Infallible {
        let mut buf = [0; RECV_BUFFER_SIZE];
        loop {
            let (len, src) = match recv_with_retry(&socket, &mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    tracing::error!(%err, "Discovery socket failed to re-arm");
                    tokio::time::sleep(REARM_DELAY).await;
                    continue;
                }
            };
            if let Err(err) = self.handle(&socket, &buf[..len], src).await {
                tracing::error!(%src, %err, "Error while handling a discovery request");
            }
        }
    }
}

async fn recv_with_retry(
    socket: &UdpSocket,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddr)> {
    match socket.recv_from(buf).await {
        Ok(received) => Ok(received),
        Err(err) => {
            tracing::warn!(%err, "Failed to receive discovery request, retrying");
            socket.recv_from(buf).await
        }
    }
}

/// Discovery server bound to its sockets but not yet answering requests.
#[derive(Debug)]
pub struct BoundDiscoveryServer {
    sockets: IndexMap<SocketKey, UdpSocket>,
    skipped: Vec<SkippedSocket>,
    responder: Arc<Responder>,
    logger: Option<Dispatch>,
}

impl BoundDiscoveryServer {
    /// Local addresses of all bound sockets.
    pub fn listen_addrs(&self) -> impl '_ + ExactSizeIterator<Item = SocketAddr> {
        self.sockets.keys().map(|key| key.addr)
    }

    /// Port the server is listening on.
    ///
    /// Useful when binding to port 0.
    pub fn discovery_port(&self) -> u16 {
        self.listen_addrs().next().map_or(0, |addr| addr.port())
    }

    /// Sockets that were requested but couldn't be bound.
    pub fn skipped_sockets(&self) -> &[SkippedSocket] {
        &self.skipped
    }

    fn into_listeners(self) -> impl Iterator<Item = (SocketKey, impl Future<Output = Infallible>)> {
        let Self {
            sockets,
            responder,
            logger,
            ..
        } = self;

        sockets.into_iter().map(move |(key, socket)| {
            let listener = Arc::clone(&responder)
                .serve(socket)
                .instrument(tracing::error_span!("discovery_listener", %key));
            (key, with_logger(listener, logger.as_ref()))
        })
    }

    /// Starts answering discovery requests on all bound sockets.
    ///
    /// Note: this function starts an infinite async loop and it's your responsibility
    /// to spawn it off via [`tokio::spawn`] if necessary. Dropping the future closes the sockets.
    pub async fn start(self) -> Infallible {
        tracing::debug!("Starting Alpaca discovery server");
        let listeners = self
            .into_listeners()
            .map(|(_key, listener)| Box::pin(listener));
        let (never_returns, ..) = futures::future::select_all(listeners).await;
        never_returns
    }

    /// Spawns one task per bound socket and returns a handle for disposing of them.
    pub fn spawn(self) -> DiscoveryServerHandle {
        tracing::debug!("Spawning Alpaca discovery server");
        let disposed = Arc::clone(&self.responder.disposed);
        let tasks = self
            .into_listeners()
            .map(|(key, listener)| (key, tokio::spawn(listener).abort_handle()))
            .collect();
        DiscoveryServerHandle { tasks, disposed }
    }
}

/// Handle to a running discovery server.
///
/// The server is disposed of when this handle is dropped.
#[derive(Debug)]
pub struct DiscoveryServerHandle {
    tasks: IndexMap<SocketKey, AbortHandle>,
    disposed: Arc<AtomicBool>,
}

impl DiscoveryServerHandle {
    /// Local addresses of all sockets.
    pub fn listen_addrs(&self) -> impl '_ + ExactSizeIterator<Item = SocketAddr> {
        self.tasks.keys().map(|key| key.addr)
    }

    /// Port the server is listening on.
    pub fn discovery_port(&self) -> u16 {
        self.listen_addrs().next().map_or(0, |addr| addr.port())
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Stops answering requests and closes all sockets.
    ///
    /// In-flight requests are abandoned rather than awaited. Calling this more than once is a no-op.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        for (key, task) in &self.tasks {
            tracing::trace!(%key, "Closing discovery socket");
            task.abort();
        }
        tracing::debug!("Disposed Alpaca discovery server");
    }
}

impl Drop for DiscoveryServerHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}
