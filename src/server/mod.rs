mod access;
pub use access::{AccessPolicy, SenderKind};

mod discovery;
pub use discovery::{
    BoundDiscoveryServer, DiscoveryServer, DiscoveryServerHandle, Ipv6Binding, SkippedSocket,
};
