mod discovery;
pub use discovery::{BoundDiscoveryClient, DiscoveryClient};

mod dns;

mod engine;
pub use engine::{CompletionHandler, DiscoveryEngine, DiscoveryOptions, SessionState};

mod management;

mod results;
pub use results::{AlpacaServer, AscomDevice, DiscoveredEndpoint, EndpointStatus};

mod transaction;
