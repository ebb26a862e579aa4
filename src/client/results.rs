use crate::api::{ConfiguredDevice, DeviceType, ServerInfo, ServiceType};
use indexmap::IndexMap;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Outcome of the device enumeration for a discovered endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndpointStatus {
    /// Enumeration hasn't finished yet.
    Pending,
    /// The list of configured devices was retrieved.
    Resolved,
    /// The management API couldn't be queried in time.
    Unresolved,
}

/// An Alpaca server that answered a discovery request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredEndpoint {
    /// Address of the Alpaca API (sender IP and reported port).
    pub addr: SocketAddr,
    /// Protocol used to talk to the server.
    pub service_type: ServiceType,
    /// When the first response from this endpoint arrived.
    pub first_seen: Instant,
    /// Host name, if reverse DNS resolution was requested and succeeded.
    pub host_name: Option<String>,
    /// State of device enumeration.
    pub status: EndpointStatus,
}

/// A device hosted by a discovered Alpaca server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AscomDevice {
    /// Device name.
    pub device_name: String,
    /// Device type.
    pub device_type: DeviceType,
    /// Index of the device among devices of the same type on its server.
    pub device_number: usize,
    /// Globally unique device ID.
    pub unique_id: String,
    /// IP address of the server.
    pub ip_address: IpAddr,
    /// Port of the server's Alpaca API.
    pub ip_port: u16,
    /// Host name of the server, if resolved.
    pub host_name: Option<String>,
}

/// Everything known about a discovered Alpaca server.
#[derive(Debug, Clone)]
pub struct AlpacaServer {
    /// The endpoint the server was discovered at.
    pub endpoint: DiscoveredEndpoint,
    /// Server description, if it could be retrieved.
    pub server_info: Option<ServerInfo>,
    /// Supported Alpaca API versions, if they could be retrieved.
    pub api_versions: Vec<u32>,
    /// Devices hosted by the server.
    pub devices: Vec<AscomDevice>,
    /// Human-readable summary of enumeration problems, empty if none.
    pub status_message: String,
}

/// Result of querying the management API of one endpoint.
#[derive(Debug, Default)]
pub(crate) struct Enumeration {
    pub(crate) devices: Option<Vec<ConfiguredDevice>>,
    pub(crate) server_info: Option<ServerInfo>,
    pub(crate) api_versions: Vec<u32>,
    pub(crate) problems: Vec<String>,
}

#[derive(Debug)]
struct EndpointRecord {
    service_type: ServiceType,
    first_seen: Instant,
    host_name: Option<String>,
    enumeration: Option<Enumeration>,
}

impl EndpointRecord {
    fn endpoint(&self, addr: SocketAddr) -> DiscoveredEndpoint {
        DiscoveredEndpoint {
            addr,
            service_type: self.service_type,
            first_seen: self.first_seen,
            host_name: self.host_name.clone(),
            status: match &self.enumeration {
                None => EndpointStatus::Pending,
                Some(Enumeration { devices: Some(_), .. }) => EndpointStatus::Resolved,
                Some(Enumeration { devices: None, .. }) => EndpointStatus::Unresolved,
            },
        }
    }

    fn devices(&self, addr: SocketAddr) -> impl '_ + Iterator<Item = AscomDevice> {
        self.enumeration
            .iter()
            .filter_map(|enumeration| enumeration.devices.as_ref())
            .flatten()
            .map(move |device| AscomDevice {
                device_name: device.name.clone(),
                device_type: device.ty,
                device_number: device.number,
                unique_id: device.unique_id.clone(),
                ip_address: addr.ip(),
                ip_port: addr.port(),
                host_name: self.host_name.clone(),
            })
    }
}

/// Concurrently updated discovery results, in first-seen order.
#[derive(Debug, Default)]
pub(crate) struct Results(Mutex<IndexMap<SocketAddr, EndpointRecord>>);

impl Results {
    fn lock(&self) -> MutexGuard<'_, IndexMap<SocketAddr, EndpointRecord>> {
        // Records are only ever replaced wholesale, so a panic can't leave them half-updated.
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    /// Records a new endpoint; returns `false` if it was already known.
    pub(crate) fn insert(&self, addr: SocketAddr, service_type: ServiceType) -> bool {
        let mut records = self.lock();
        if records.contains_key(&addr) {
            return false;
        }
        let _ = records.insert(
            addr,
            EndpointRecord {
                service_type,
                first_seen: Instant::now(),
                host_name: None,
                enumeration: None,
            },
        );
        true
    }

    pub(crate) fn set_enumeration(&self, addr: SocketAddr, enumeration: Enumeration) {
        if let Some(record) = self.lock().get_mut(&addr) {
            record.enumeration = Some(enumeration);
        }
    }

    pub(crate) fn set_host_name(&self, addr: SocketAddr, host_name: String) {
        if let Some(record) = self.lock().get_mut(&addr) {
            record.host_name = Some(host_name);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn endpoints(&self) -> Vec<DiscoveredEndpoint> {
        self.lock()
            .iter()
            .map(|(&addr, record)| record.endpoint(addr))
            .collect()
    }

    pub(crate) fn devices(&self, device_type: Option<DeviceType>) -> Vec<AscomDevice> {
        self.lock()
            .iter()
            .flat_map(|(&addr, record)| record.devices(addr).collect::<Vec<_>>())
            .filter(|device| device_type.is_none_or(|ty| device.device_type == ty))
            .collect()
    }

    pub(crate) fn servers(&self) -> Vec<AlpacaServer> {
        self.lock()
            .iter()
            .map(|(&addr, record)| {
                let enumeration = record.enumeration.as_ref();
                AlpacaServer {
                    endpoint: record.endpoint(addr),
                    server_info: enumeration.and_then(|e| e.server_info.clone()),
                    api_versions: enumeration.map(|e| e.api_versions.clone()).unwrap_or_default(),
                    devices: record.devices(addr).collect(),
                    status_message: enumeration.map(|e| e.problems.join("; ")).unwrap_or_default(),
                }
            })
            .collect()
    }
}
