//! Types shared between the discovery protocol and the Alpaca management API.

mod server_info;
pub use server_info::*;

use crate::macros::device_types;
use std::net::SocketAddr;
use std::str::FromStr;
use thiserror::Error;

device_types! {
    #[doc = "Camera."]
    Camera = "camera",

    #[doc = "Cover calibrator."]
    CoverCalibrator = "covercalibrator",

    #[doc = "Dome."]
    Dome = "dome",

    #[doc = "Filter wheel."]
    FilterWheel = "filterwheel",

    #[doc = "Focuser."]
    Focuser = "focuser",

    #[doc = "Observing conditions (weather station)."]
    ObservingConditions = "observingconditions",

    #[doc = "Rotator."]
    Rotator = "rotator",

    #[doc = "Safety monitor."]
    SafetyMonitor = "safetymonitor",

    #[doc = "Switch."]
    Switch = "switch",

    #[doc = "Telescope."]
    Telescope = "telescope",
}

/// Error returned when a device type string doesn't match any known [`DeviceType`].
#[derive(Debug, Clone, Error)]
#[error("Unknown device type {0:?}")]
pub struct UnknownDeviceType(pub String);

impl FromStr for DeviceType {
    type Err = UnknownDeviceType;

    /// Parses either the management API name (`FilterWheel`) or the URL path (`filterwheel`),
    /// ignoring case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|ty| ty.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownDeviceType(s.to_owned()))
    }
}

impl TryFrom<String> for DeviceType {
    type Error = UnknownDeviceType;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Protocol used to talk to a discovered Alpaca server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, derive_more::Display)]
pub enum ServiceType {
    /// Plain HTTP.
    #[default]
    #[display("http")]
    Http,
    /// HTTP over TLS.
    #[display("https")]
    Https,
}

impl ServiceType {
    /// Base URL of an Alpaca server reachable at `addr` with this protocol.
    pub fn base_url(self, addr: SocketAddr) -> String {
        format!("{self}://{addr}/")
    }
}
