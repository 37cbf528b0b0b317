//! The `Hub` entity: groups ports that share a parent USB device.

use crate::model::path::TopologyPath;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HubId(pub u32);

/// Device identity matched against during hotplug enumeration, before a
/// `nusb` handle has necessarily been opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRef {
    pub bus: u8,
    pub address: u8,
}

#[derive(Debug, Clone)]
pub struct Hub {
    pub id: HubId,
    pub hub_device: DeviceRef,
    /// YKUSH hubs expose their control interface through a distinct HID
    /// child device; generic hubs control themselves directly.
    pub comm_device: Option<DeviceRef>,
    pub num_ports: u8,
    pub old_firmware: bool,
    /// The hub's own topology path, e.g. `2-1` for a hub on bus 2's port 1.
    /// A child device arriving on `2-1-3` is on this hub's port 3; used to
    /// resolve a hotplug arrival back to the right `GenericHub`/`Ykush`
    /// port, since those ports have no real path until a device first
    /// enumerates under them (`spec.md` §3/§4.4/§4.5).
    pub path: Option<TopologyPath>,
}

impl Hub {
    pub fn new(id: HubId, hub_device: DeviceRef) -> Self {
        Self {
            id,
            hub_device,
            comm_device: None,
            num_ports: 0,
            old_firmware: false,
            path: None,
        }
    }
}
