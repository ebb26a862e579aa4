use crate::discovery::get_active_interfaces;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Which discovery requests the responder is allowed to answer.
///
/// This is a shared handle: clones observe and modify the same flags, so the policy can be
/// toggled while the responder is running.
///
/// Requests from loopback addresses are always answered.
#[derive(Debug, Clone)]
pub struct AccessPolicy(Arc<AccessFlags>);

#[derive(Debug)]
struct AccessFlags {
    allow_remote_access: AtomicBool,
    local_respond_only_to_localhost: AtomicBool,
}

impl Default for AccessPolicy {
    /// Answer everyone.
    fn default() -> Self {
        Self::new(true, false)
    }
}

impl AccessPolicy {
    /// Create a new policy.
    pub fn new(allow_remote_access: bool, local_respond_only_to_localhost: bool) -> Self {
        Self(Arc::new(AccessFlags {
            allow_remote_access: AtomicBool::new(allow_remote_access),
            local_respond_only_to_localhost: AtomicBool::new(local_respond_only_to_localhost),
        }))
    }

    /// Whether requests from other machines are answered.
    pub fn allow_remote_access(&self) -> bool {
        self.0.allow_remote_access.load(Ordering::Relaxed)
    }

    /// Allow or forbid answering requests from other machines.
    pub fn set_allow_remote_access(&self, allow: bool) {
        self.0.allow_remote_access.store(allow, Ordering::Relaxed);
    }

    /// Whether requests sent from this machine's non-loopback addresses are ignored.
    pub fn local_respond_only_to_localhost(&self) -> bool {
        self.0.local_respond_only_to_localhost.load(Ordering::Relaxed)
    }

    /// Restrict requests from this machine to loopback addresses only.
    pub fn set_local_respond_only_to_localhost(&self, only_localhost: bool) {
        self.0
            .local_respond_only_to_localhost
            .store(only_localhost, Ordering::Relaxed);
    }

    /// Whether a request from the given kind of sender should be answered.
    pub fn admits(&self, sender: SenderKind) -> bool {
        match sender {
            SenderKind::Loopback => true,
            SenderKind::ThisHost => !self.local_respond_only_to_localhost(),
            SenderKind::Remote => self.allow_remote_access(),
        }
    }
}

/// Origin of a discovery request relative to this machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderKind {
    /// A loopback address.
    Loopback,
    /// One of this machine's own non-loopback addresses.
    ThisHost,
    /// Any other address.
    Remote,
}

impl SenderKind {
    pub(crate) fn classify(sender: IpAddr, host_addrs: &HostAddrs) -> Self {
        let sender = sender.to_canonical();
        if sender.is_loopback() {
            Self::Loopback
        } else if host_addrs.0.contains(&sender) {
            Self::ThisHost
        } else {
            Self::Remote
        }
    }
}

/// Addresses assigned to this machine's network interfaces.
#[derive(Debug, Default)]
pub(crate) struct HostAddrs(HashSet<IpAddr>);

impl HostAddrs {
    pub(crate) fn collect() -> Self {
        get_active_interfaces()
            .flat_map(|intf| {
                let v4 = intf.ipv4.into_iter().map(|net| IpAddr::V4(net.addr()));
                let v6 = intf.ipv6.into_iter().map(|net| IpAddr::V6(net.addr()));
                v4.chain(v6).collect::<Vec<_>>()
            })
            .collect()
    }
}

impl FromIterator<IpAddr> for HostAddrs {
    fn from_iter<T: IntoIterator<Item = IpAddr>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
