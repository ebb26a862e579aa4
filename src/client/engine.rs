use super::discovery::DiscoveryClient;
use super::dns::ReverseResolver;
use super::management::ManagementClient;
use super::results::{AlpacaServer, AscomDevice, DiscoveredEndpoint, Enumeration, Results};
use crate::DiscoveryError;
use crate::api::{DeviceType, ServiceType};
use crate::discovery::{DEFAULT_DISCOVERY_PORT, with_logger};
use futures::stream::FuturesUnordered;
use futures::{Stream, StreamExt};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{Dispatch, Instrument};

/// Reverse DNS is only attempted if at least this much of the session is left.
const MIN_DNS_RESOLUTION_TIME: Duration = Duration::from_millis(100);

/// Parameters of a discovery session.
#[derive(Debug, Clone, Copy)]
pub struct DiscoveryOptions {
    /// Number of discovery requests sent on each interface. Must be at least 1.
    pub poll_count: usize,
    /// Time between discovery requests.
    pub poll_interval: Duration,
    /// UDP port discovery requests are sent to.
    pub discovery_port: u16,
    /// Total duration of the session, including device enumeration. Must be positive.
    pub max_wait: Duration,
    /// Whether to resolve host names of discovered servers.
    pub resolve_dns: bool,
    /// Whether to send IPv4 broadcast requests.
    pub use_ipv4: bool,
    /// Whether to send IPv6 multicast requests.
    pub use_ipv6: bool,
    /// Protocol used to query discovered servers.
    pub service_type: ServiceType,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            poll_count: 2,
            poll_interval: Duration::from_millis(100),
            discovery_port: DEFAULT_DISCOVERY_PORT,
            max_wait: Duration::from_millis(1500),
            resolve_dns: false,
            use_ipv4: true,
            use_ipv6: true,
            service_type: ServiceType::Http,
        }
    }
}

impl DiscoveryOptions {
    /// Settings for the underlying discovery client.
    pub const fn client(&self) -> DiscoveryClient {
        DiscoveryClient {
            num_requests: self.poll_count,
            request_interval: self.poll_interval,
            timeout: self.max_wait,
            include_ipv4: self.use_ipv4,
            include_ipv6: self.use_ipv6,
            discovery_port: self.discovery_port,
        }
    }
}

/// Lifecycle of a [`DiscoveryEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session has been started yet.
    Idle,
    /// A session is collecting responses.
    Running,
    /// The last session has finished and its results are available.
    Complete,
    /// The engine was disposed.
    Disposed,
}

/// Callback invoked once at the end of every completed session.
pub type CompletionHandler = Arc<dyn Fn(&DiscoveryEngine) + Send + Sync>;

/// Stateful Alpaca discovery.
///
/// Runs one discovery session at a time: broadcasts requests on every interface, collects
/// responses and queries each discovered server for its devices, all within
/// [`max_wait`](DiscoveryOptions::max_wait).
///
/// The engine is a cheap handle: clones share the same state.
#[derive(Clone)]
pub struct DiscoveryEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    state: watch::Sender<SessionState>,
    results: Results,
    session: Mutex<Option<AbortHandle>>,
    handlers: Mutex<Vec<CompletionHandler>>,
    management: ManagementClient,
    logger: Option<Dispatch>,
}

impl std::fmt::Debug for DiscoveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryEngine")
            .field("state", &self.state())
            .field("endpoints", &self.inner.results.len())
            .finish_non_exhaustive()
    }
}

impl Default for DiscoveryEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DiscoveryEngine {
    /// Create an idle engine that logs via the dispatcher current at session start.
    pub fn new() -> Self {
        Self::with_optional_logger(None)
    }

    /// Create an idle engine that logs via the given dispatcher.
    pub fn with_logger(logger: Dispatch) -> Self {
        Self::with_optional_logger(Some(logger))
    }

    fn with_optional_logger(logger: Option<Dispatch>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                state: watch::Sender::new(SessionState::Idle),
                results: Results::default(),
                session: Mutex::new(None),
                handlers: Mutex::new(Vec::new()),
                management: ManagementClient::new(),
                logger,
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Whether the last session has finished.
    pub fn is_complete(&self) -> bool {
        self.state() == SessionState::Complete
    }

    /// Register a handler invoked at the end of every session.
    ///
    /// Handlers are dropped on [`dispose`](Self::dispose).
    pub fn on_completion(&self, handler: impl Fn(&Self) + Send + Sync + 'static) {
        lock(&self.inner.handlers).push(Arc::new(handler));
    }

    /// Wait until the current session ends.
    ///
    /// Returns the new state: [`SessionState::Complete`] or [`SessionState::Disposed`]
    /// (or the current state immediately if no session is running).
    pub async fn wait_for_completion(&self) -> SessionState {
        let mut state = self.inner.state.subscribe();
        state
            .wait_for(|state| *state != SessionState::Running)
            .await
            .map_or(SessionState::Disposed, |state| *state)
    }

    /// Start a discovery session with default options.
    pub fn start_default_discovery(&self) -> Result<(), DiscoveryError> {
        self.start_discovery(DiscoveryOptions::default())
    }

    /// Start a discovery session.
    ///
    /// Fails without side effects if the options are invalid, if a session is already running,
    /// if the engine was disposed or if no socket could be opened. Results of the previous
    /// session are cleared once the new one starts.
    ///
    /// Must be called from within a Tokio runtime.
    #[tracing::instrument(skip(self), err)]
    pub fn start_discovery(&self, options: DiscoveryOptions) -> Result<(), DiscoveryError> {
        let client = options.client();
        client.validate()?;
        self.ensure_can_start()?;
        let client = client.bind()?;
        self.begin_session(options, move |deadline| {
            client.discover_addrs_until(deadline)
        })
    }

    fn ensure_can_start(&self) -> Result<(), DiscoveryError> {
        match self.state() {
            SessionState::Running => Err(DiscoveryError::AlreadyRunning),
            SessionState::Disposed => Err(DiscoveryError::Disposed),
            SessionState::Idle | SessionState::Complete => Ok(()),
        }
    }

    /// Transition to [`SessionState::Running`] and spawn the session task.
    ///
    /// `discover` is called inside the session task with the session deadline.
    pub(crate) fn begin_session<S>(
        &self,
        options: DiscoveryOptions,
        discover: impl 'static + Send + FnOnce(Instant) -> S,
    ) -> Result<(), DiscoveryError>
    where
        S: 'static + Send + Stream<Item = SocketAddr>,
    {
        let mut rejection = Ok(());
        let _ = self.inner.state.send_if_modified(|state| {
            rejection = match state {
                SessionState::Running => Err(DiscoveryError::AlreadyRunning),
                SessionState::Disposed => Err(DiscoveryError::Disposed),
                SessionState::Idle | SessionState::Complete => {
                    *state = SessionState::Running;
                    return true;
                }
            };
            false
        });
        rejection?;

        self.inner.results.clear();

        let deadline = Instant::now() + options.max_wait;
        let session = self
            .clone()
            .run_session(options, deadline, discover)
            .instrument(tracing::info_span!("discovery_session"));
        let task = tokio::spawn(with_logger(session, self.inner.logger.as_ref()));
        *lock(&self.inner.session) = Some(task.abort_handle());

        // Disposal could have raced with the spawn above.
        if self.state() == SessionState::Disposed {
            task.abort();
        }

        Ok(())
    }

    async fn run_session<S: Stream<Item = SocketAddr>>(
        self,
        options: DiscoveryOptions,
        deadline: Instant,
        discover: impl FnOnce(Instant) -> S,
    ) {
        tracing::debug!(?options, "Starting discovery session");

        let resolver = if options.resolve_dns {
            ReverseResolver::from_system_conf()
                .inspect_err(|err| tracing::warn!(%err, "Host names won't be resolved"))
                .ok()
        } else {
            None
        };

        let mut addrs = pin!(discover(deadline));
        let mut enumerations = FuturesUnordered::new();
        let mut deadline_reached = pin!(tokio::time::sleep_until(deadline));

        loop {
            tokio::select! {
                () = &mut deadline_reached => break,
                addr = addrs.next() => match addr {
                    Some(addr) => {
                        if self.inner.results.insert(addr, options.service_type) {
                            tracing::info!(%addr, "Discovered Alpaca server");
                            enumerations.push(self.enumerate(addr, options.service_type, resolver.as_ref(), deadline));
                        }
                    }
                    None => break,
                },
                Some(()) = enumerations.next(), if !enumerations.is_empty() => {}
            }
        }

        // Every enumeration is bounded by the deadline as well.
        while enumerations.next().await.is_some() {}

        self.complete();
    }

    /// Query the management API (and optionally DNS) for one endpoint within the session budget.
    async fn enumerate(
        &self,
        addr: SocketAddr,
        service_type: ServiceType,
        resolver: Option<&ReverseResolver>,
        deadline: Instant,
    ) {
        let management = async {
            let mut enumeration = Enumeration::default();

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                enumeration.problems.push("No time left for device enumeration".to_owned());
                return enumeration;
            }

            let management = &self.inner.management;
            let target = match management.target(service_type, addr) {
                Ok(target) => target,
                Err(err) => {
                    tracing::warn!(%err, "Can't query the management API");
                    enumeration.problems.push(format!("{err:#}"));
                    return enumeration;
                }
            };

            let (devices, server_info, api_versions) = tokio::join!(
                management.configured_devices(&target, remaining),
                management.server_info(&target, remaining),
                management.api_versions(&target, remaining),
            );

            match devices {
                Ok(devices) => {
                    enumeration.devices = Some(
                        devices
                            .into_iter()
                            .filter_map(|device| {
                                device
                                    .typed()
                                    .inspect_err(|err| tracing::warn!(%err, "Skipping device"))
                                    .ok()
                            })
                            .collect(),
                    );
                }
                Err(err) => {
                    tracing::warn!(%err, "Couldn't enumerate devices");
                    enumeration.problems.push(format!("{err:#}"));
                }
            }
            match server_info {
                Ok(info) => enumeration.server_info = Some(info),
                Err(err) => {
                    tracing::debug!(%err, "Server description unavailable");
                    enumeration.problems.push(format!("{err:#}"));
                }
            }
            match api_versions {
                Ok(versions) => enumeration.api_versions = versions,
                Err(err) => {
                    tracing::debug!(%err, "Supported API versions unavailable");
                    enumeration.problems.push(format!("{err:#}"));
                }
            }

            enumeration
        };

        let host_name = async {
            let resolver = resolver?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining < MIN_DNS_RESOLUTION_TIME {
                tracing::debug!(?remaining, "Not enough time left to resolve host name");
                return None;
            }
            resolver.lookup(addr.ip(), remaining).await.ok()
        };

        let budgeted = tokio::time::timeout_at(deadline, async {
            tokio::join!(management, host_name)
        });

        match budgeted.await {
            Ok((enumeration, host_name)) => {
                if let Some(host_name) = host_name {
                    self.inner.results.set_host_name(addr, host_name);
                }
                self.inner.results.set_enumeration(addr, enumeration);
            }
            Err(_elapsed) => {
                tracing::warn!("Device enumeration didn't finish before the deadline");
                self.inner.results.set_enumeration(
                    addr,
                    Enumeration {
                        problems: vec!["Timed out".to_owned()],
                        ..Enumeration::default()
                    },
                );
            }
        }
    }

    fn complete(&self) {
        let completed = self.inner.state.send_if_modified(|state| {
            if *state == SessionState::Running {
                *state = SessionState::Complete;
                true
            } else {
                false
            }
        });
        if !completed {
            return;
        }

        tracing::info!(
            endpoints = self.inner.results.len(),
            "Discovery session complete"
        );

        let handlers = lock(&self.inner.handlers).clone();
        for handler in handlers {
            // A handler (or another thread) may dispose the engine mid-way.
            if self.state() == SessionState::Disposed {
                tracing::debug!("Engine disposed, skipping remaining completion handlers");
                break;
            }
            handler(self);
        }
    }

    /// Stop the current session, if any, and make the engine unusable.
    ///
    /// Sockets and outstanding requests are abandoned, not awaited. Pending completion
    /// handlers are never called. Calling this more than once is a no-op.
    pub fn dispose(&self) {
        if self.inner.state.send_replace(SessionState::Disposed) == SessionState::Disposed {
            return;
        }
        let session = lock(&self.inner.session).take();
        if let Some(session) = session {
            session.abort();
        }
        lock(&self.inner.handlers).clear();
        tracing::debug!("Disposed discovery engine");
    }

    /// Snapshot of the endpoints discovered so far in the current or last session.
    pub fn discovered_endpoints(&self) -> Vec<DiscoveredEndpoint> {
        self.inner.results.endpoints()
    }

    /// Devices found by the last completed session, in discovery order.
    ///
    /// Returns only devices of `device_type` if given. Empty while a session is running.
    pub fn get_ascom_devices(&self, device_type: Option<DeviceType>) -> Vec<AscomDevice> {
        if !self.is_complete() {
            return Vec::new();
        }
        self.inner.results.devices(device_type)
    }

    /// Distinct device types found by the last completed session.
    pub fn get_ascom_device_types(&self) -> BTreeSet<DeviceType> {
        self.get_ascom_devices(None)
            .into_iter()
            .map(|device| device.device_type)
            .collect()
    }

    /// Servers found by the last completed session, in discovery order.
    ///
    /// Includes servers whose devices couldn't be enumerated.
    pub fn get_alpaca_servers(&self) -> Vec<AlpacaServer> {
        if !self.is_complete() {
            return Vec::new();
        }
        self.inner.results.servers()
    }

    /// Run a complete session with default options and return the devices found.
    pub async fn discover_ascom_devices(
        device_type: Option<DeviceType>,
    ) -> Result<Vec<AscomDevice>, DiscoveryError> {
        Self::discover_ascom_devices_with(DiscoveryOptions::default(), device_type).await
    }

    /// Run a complete session with the given options and return the devices found.
    pub async fn discover_ascom_devices_with(
        options: DiscoveryOptions,
        device_type: Option<DeviceType>,
    ) -> Result<Vec<AscomDevice>, DiscoveryError> {
        let engine = Self::new();
        engine.start_discovery(options)?;
        let _ = engine.wait_for_completion().await;
        let devices = engine.get_ascom_devices(device_type);
        engine.dispose();
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::{DiscoveryEngine, DiscoveryOptions, SessionState};
    use crate::DiscoveryError;
    use crate::api::DeviceType;
    use crate::discovery::EndpointStatus;
    use crate::test_utils::FakeAlpacaServer;
    use serde_json::json;
    use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn quick_options(max_wait: Duration) -> DiscoveryOptions {
        DiscoveryOptions {
            max_wait,
            ..DiscoveryOptions::default()
        }
    }

    fn camera_server_devices() -> serde_json::Value {
        json!([
            {
                "DeviceName": "Main camera",
                "DeviceType": "Camera",
                "DeviceNumber": 0,
                "UniqueID": "0b6a2ba6-8f4f-4a63-9a4e-2fbd0a2b9c11",
            },
            {
                "DeviceName": "Something new",
                "DeviceType": "Gizmo",
                "DeviceNumber": 0,
                "UniqueID": "c0ffee",
            },
            {
                "DeviceName": "Filters",
                "DeviceType": "filterwheel",
                "DeviceNumber": 0,
                "UniqueID": "7d3f7a52-f0cb-4a36-8d6d-b9b8a0a0cf20",
            },
        ])
    }

    #[tokio::test]
    async fn rejects_invalid_options() -> eyre::Result<()> {
        let engine = DiscoveryEngine::new();

        for options in [
            DiscoveryOptions {
                poll_count: 0,
                ..DiscoveryOptions::default()
            },
            quick_options(Duration::ZERO),
            DiscoveryOptions {
                use_ipv4: false,
                use_ipv6: false,
                ..DiscoveryOptions::default()
            },
        ] {
            let result = engine.start_discovery(options);
            eyre::ensure!(
                matches!(result, Err(DiscoveryError::Configuration(_))),
                "Unexpected result for {options:?}: {result:?}"
            );
            eyre::ensure!(engine.state() == SessionState::Idle);
        }

        Ok(())
    }

    #[tokio::test]
    async fn second_session_is_rejected_while_running() -> eyre::Result<()> {
        let engine = DiscoveryEngine::new();
        let options = quick_options(Duration::from_millis(300));

        engine.begin_session(options, |_| futures::stream::pending())?;
        eyre::ensure!(engine.state() == SessionState::Running);

        eyre::ensure!(matches!(
            engine.begin_session(options, |_| futures::stream::empty()),
            Err(DiscoveryError::AlreadyRunning)
        ));
        eyre::ensure!(matches!(
            engine.start_discovery(options),
            Err(DiscoveryError::AlreadyRunning)
        ));

        // Never-ending address streams are still cut off by the deadline.
        let state =
            tokio::time::timeout(Duration::from_secs(2), engine.wait_for_completion()).await?;
        eyre::ensure!(state == SessionState::Complete, "Unexpected state {state:?}");

        Ok(())
    }

    #[tokio::test]
    async fn hanging_server_does_not_hold_back_others() -> eyre::Result<()> {
        let good = FakeAlpacaServer::serve(camera_server_devices()).await?;
        let hanging = FakeAlpacaServer::hanging().await?;

        let engine = DiscoveryEngine::new();
        let addrs = [good.addr(), hanging.addr(), good.addr()];
        engine.begin_session(quick_options(Duration::from_millis(800)), move |_| {
            futures::stream::iter(addrs)
        })?;

        eyre::ensure!(engine.get_ascom_devices(None).is_empty());

        let state =
            tokio::time::timeout(Duration::from_secs(3), engine.wait_for_completion()).await?;
        eyre::ensure!(state == SessionState::Complete, "Unexpected state {state:?}");

        let statuses = engine
            .discovered_endpoints()
            .iter()
            .map(|endpoint| (endpoint.addr, endpoint.status))
            .collect::<Vec<_>>();
        eyre::ensure!(
            statuses
                == [
                    (good.addr(), EndpointStatus::Resolved),
                    (hanging.addr(), EndpointStatus::Unresolved),
                ],
            "Unexpected endpoints: {statuses:#?}"
        );

        let devices = engine.get_ascom_devices(None);
        let found = devices
            .iter()
            .map(|device| (device.device_type, device.device_name.as_str()))
            .collect::<Vec<_>>();
        eyre::ensure!(
            found
                == [
                    (DeviceType::Camera, "Main camera"),
                    (DeviceType::FilterWheel, "Filters"),
                ],
            "Unexpected devices: {found:#?}"
        );
        eyre::ensure!(devices.iter().all(|device| {
            SocketAddr::new(device.ip_address, device.ip_port) == good.addr()
        }));

        eyre::ensure!(engine.get_ascom_devices(Some(DeviceType::FilterWheel)).len() == 1);
        eyre::ensure!(engine.get_ascom_devices(Some(DeviceType::Dome)).is_empty());
        eyre::ensure!(
            engine.get_ascom_device_types().into_iter().collect::<Vec<_>>()
                == [DeviceType::Camera, DeviceType::FilterWheel]
        );

        let servers = engine.get_alpaca_servers();
        eyre::ensure!(servers.len() == 2);
        eyre::ensure!(
            servers[0].server_info.as_ref().map(|info| &*info.server_name)
                == Some("Fake Alpaca server")
        );
        eyre::ensure!(servers[0].api_versions == [1]);
        eyre::ensure!(servers[0].status_message.is_empty());
        eyre::ensure!(!servers[1].status_message.is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn enumerates_servers_at_scoped_ipv6_addresses() -> eyre::Result<()> {
        let server =
            FakeAlpacaServer::serve_on(Ipv6Addr::LOCALHOST.into(), camera_server_devices()).await?;

        let loopback_index = netdev::get_interfaces()
            .into_iter()
            .find(netdev::Interface::is_loopback)
            .map_or(1, |intf| intf.index);
        // Same server, but addressed the way link-local responders are: with a zone id.
        let scoped = SocketAddr::V6(SocketAddrV6::new(
            Ipv6Addr::LOCALHOST,
            server.addr().port(),
            0,
            loopback_index,
        ));

        let engine = DiscoveryEngine::new();
        engine.begin_session(quick_options(Duration::from_millis(800)), move |_| {
            futures::stream::iter([scoped])
        })?;
        let _ = tokio::time::timeout(Duration::from_secs(3), engine.wait_for_completion()).await?;

        let endpoints = engine.discovered_endpoints();
        eyre::ensure!(
            endpoints.len() == 1 && endpoints[0].addr == scoped,
            "Unexpected endpoints: {endpoints:#?}"
        );
        let servers = engine.get_alpaca_servers();
        eyre::ensure!(
            endpoints[0].status == EndpointStatus::Resolved,
            "Scoped endpoint wasn't enumerated: {}",
            servers[0].status_message
        );
        eyre::ensure!(engine.get_ascom_devices(None).len() == 2);

        Ok(())
    }

    #[tokio::test]
    async fn restart_clears_previous_results() -> eyre::Result<()> {
        let server = FakeAlpacaServer::serve(camera_server_devices()).await?;
        let engine = DiscoveryEngine::new();
        let options = quick_options(Duration::from_millis(300));

        let addr = server.addr();
        engine.begin_session(options, move |_| futures::stream::iter([addr]))?;
        let _ = engine.wait_for_completion().await;
        eyre::ensure!(engine.discovered_endpoints().len() == 1);

        engine.begin_session(options, |_| futures::stream::pending())?;
        eyre::ensure!(engine.discovered_endpoints().is_empty());
        eyre::ensure!(engine.get_ascom_devices(None).is_empty());

        let _ = engine.wait_for_completion().await;
        eyre::ensure!(engine.is_complete());
        eyre::ensure!(engine.get_alpaca_servers().is_empty());

        Ok(())
    }

    #[tokio::test]
    async fn completion_handlers_fire_once_per_session() -> eyre::Result<()> {
        let engine = DiscoveryEngine::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.on_completion(move |engine| {
            let _ = tx.send(engine.state());
        });

        let options = quick_options(Duration::from_millis(100));
        for _ in 0..2_i32 {
            engine.begin_session(options, |_| futures::stream::empty())?;
            let _ = engine.wait_for_completion().await;
            eyre::ensure!(rx.recv().await == Some(SessionState::Complete));
            eyre::ensure!(rx.try_recv().is_err(), "Handler fired more than once");
        }

        Ok(())
    }

    #[tokio::test]
    async fn dispose_from_handler_skips_remaining_handlers() -> eyre::Result<()> {
        let engine = DiscoveryEngine::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let first_tx = tx.clone();
        engine.on_completion(move |engine| {
            let _ = first_tx.send("first");
            engine.dispose();
        });
        engine.on_completion(move |_| {
            let _ = tx.send("second");
        });

        engine.begin_session(quick_options(Duration::from_millis(100)), |_| {
            futures::stream::empty()
        })?;
        let _ = tokio::time::timeout(Duration::from_secs(1), engine.wait_for_completion()).await?;

        eyre::ensure!(rx.recv().await == Some("first"));
        // Both senders are gone once the handlers are dropped, without the second one firing.
        let rest = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await?;
        eyre::ensure!(rest.is_none(), "Handler fired after dispose: {rest:?}");
        eyre::ensure!(engine.state() == SessionState::Disposed);

        Ok(())
    }

    #[tokio::test]
    async fn dispose_cancels_session() -> eyre::Result<()> {
        let engine = DiscoveryEngine::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.on_completion(move |_| {
            let _ = tx.send(());
        });

        engine.begin_session(quick_options(Duration::from_secs(10)), |_| {
            futures::stream::pending()
        })?;

        let waiter = tokio::spawn({
            let engine = engine.clone();
            async move { engine.wait_for_completion().await }
        });

        engine.dispose();
        engine.dispose();

        let state = tokio::time::timeout(Duration::from_secs(1), waiter).await??;
        eyre::ensure!(state == SessionState::Disposed, "Unexpected state {state:?}");
        eyre::ensure!(engine.state() == SessionState::Disposed);
        // The handler (and with it the sender) is gone without being called.
        eyre::ensure!(rx.recv().await.is_none());

        eyre::ensure!(matches!(
            engine.start_default_discovery(),
            Err(DiscoveryError::Disposed)
        ));

        Ok(())
    }

    #[tokio::test]
    async fn session_with_dns_resolution_completes() -> eyre::Result<()> {
        let server = FakeAlpacaServer::serve(camera_server_devices()).await?;
        let engine = DiscoveryEngine::new();
        let options = DiscoveryOptions {
            resolve_dns: true,
            ..quick_options(Duration::from_millis(800))
        };

        let addr = server.addr();
        engine.begin_session(options, move |_| futures::stream::iter([addr]))?;

        let state =
            tokio::time::timeout(Duration::from_secs(3), engine.wait_for_completion()).await?;
        eyre::ensure!(state == SessionState::Complete, "Unexpected state {state:?}");
        // Whether 127.0.0.1 has a PTR record depends on the host, but devices are always there.
        eyre::ensure!(engine.get_ascom_devices(None).len() == 2);

        Ok(())
    }
}
