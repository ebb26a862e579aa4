use super::DeviceType;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// A device entry of the `/management/v1/configureddevices` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfiguredDevice<Ty = DeviceType> {
    /// Device name.
    #[serde(rename = "DeviceName")]
    pub name: String,
    /// Device type.
    #[serde(rename = "DeviceType")]
    pub ty: Ty,
    /// Index of the device among devices of the same type on this server.
    #[serde(rename = "DeviceNumber")]
    pub number: usize,
    /// Globally unique device ID.
    #[serde(rename = "UniqueID")]
    pub unique_id: String,
}

#[cfg(feature = "client")]
impl ConfiguredDevice<String> {
    /// Resolve the raw device type reported by a server.
    pub(crate) fn typed(self) -> Result<ConfiguredDevice, super::UnknownDeviceType> {
        Ok(ConfiguredDevice {
            ty: self.ty.parse()?,
            name: self.name,
            number: self.number,
            unique_id: self.unique_id,
        })
    }
}

/// General information about the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerInfo {
    /// Server name.
    pub server_name: Cow<'static, str>,
    /// Manufacturer name.
    pub manufacturer: Cow<'static, str>,
    /// Manufacturer version.
    pub manufacturer_version: Cow<'static, str>,
    /// Server location.
    pub location: Cow<'static, str>,
}
