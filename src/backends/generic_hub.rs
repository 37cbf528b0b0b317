//! Generic switchable-hub power-control backend.
//!
//! Grounded in `generic_handler.c`: power is switched with a USB 2.0
//! class-request `SET_FEATURE`/`CLEAR_FEATURE(PORT_POWER)` sent to the hub
//! itself (recipient "other", index = the hub's own 1-based port number),
//! not to the downstream device. Hub capability is established once at
//! hotplug time by reading the hub descriptor and checking
//! `wHubCharacteristics`' low two bits for per-port power switching.

use std::collections::HashMap;
use std::time::Duration;

use nusb::transfer::{ControlOut, ControlType, Recipient};
use tracing::warn;

use crate::backends::{Backend, Command, UpdateOutcome};
use crate::error::BackendError;
use crate::model::hub::HubId;
use crate::model::port::{BackendRef, MsgMode, Port, PowerState};

/// USB 2.0 `SET_FEATURE` request code.
const USB_REQ_SET_FEATURE: u8 = 3;
/// USB 2.0 `CLEAR_FEATURE` request code.
const USB_REQ_CLEAR_FEATURE: u8 = 1;
/// Port-power feature selector (USB 2.0 table 11-17).
const PORT_POWER: u16 = 8;
/// Every in-flight control transfer carries this library-level timeout.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);
/// Retry delay after a power toggle, mirroring [`crate::backends::ykush`].
pub const RESET_RETRY_DELAY: Duration = Duration::from_secs(5);

/// `0x0424:0x2514` is the YKUSH's own internal hub; it must never be driven
/// through the generic backend, only through its HID sideband.
pub const YKUSH_HUB_VID_PID: (u16, u16) = (0x0424, 0x2514);

/// A hub descriptor's fields relevant to power switching, as read by the
/// hotplug layer before a hub is handed to this backend.
#[derive(Debug, Clone, Copy)]
pub struct HubDescriptor {
    pub num_ports: u8,
    pub power_switching_per_port: bool,
}

/// Reads the hub class descriptor (type `0x29` for USB 2.0 hubs, `0x2A` for
/// USB 3.x) and extracts port count and per-port power-switching support.
pub async fn read_hub_descriptor(device: &nusb::Device, bcd_usb: u16) -> Option<HubDescriptor> {
    let descriptor_type: u16 = if bcd_usb >= 0x0300 { 0x2A } else { 0x29 };
    let control = nusb::transfer::ControlIn {
        control_type: ControlType::Class,
        recipient: Recipient::Device,
        request: 0x06, // GET_DESCRIPTOR
        value: descriptor_type << 8,
        index: 0,
        length: 12,
    };
    let data = device.control_in(control, TRANSFER_TIMEOUT).await.ok()?;
    if data.len() < 5 {
        return None;
    }
    let num_ports = data[2];
    let hub_characteristics = u16::from_le_bytes([data[3], data[4]]);
    Some(HubDescriptor {
        num_ports,
        power_switching_per_port: (hub_characteristics & 0x03) == 0x01,
    })
}

/// Holds the opened device handle for every managed generic hub. Ports only
/// carry a `hub_port` number in [`BackendRef::GenericHub`]; the handle used
/// to reach the hub over control transfers lives here, registered by the
/// USB hotplug layer once a hub has been probed and accepted.
#[derive(Default)]
pub struct GenericHubBackend {
    hubs: HashMap<HubId, nusb::Device>,
}

impl std::fmt::Debug for GenericHubBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenericHubBackend")
            .field("hubs", &self.hubs.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl GenericHubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_hub(&mut self, hub_id: HubId, device: nusb::Device) {
        self.hubs.insert(hub_id, device);
    }

    pub fn unregister_hub(&mut self, hub_id: HubId) {
        self.hubs.remove(&hub_id);
    }

    async fn set_port_power(&self, hub_id: HubId, port_num: u8, on: bool) -> Result<(), BackendError> {
        let device = self.hubs.get(&hub_id).ok_or(BackendError::Rejected)?;
        let request = if on { USB_REQ_SET_FEATURE } else { USB_REQ_CLEAR_FEATURE };
        let control = ControlOut {
            control_type: ControlType::Class,
            recipient: Recipient::Other,
            request,
            value: PORT_POWER,
            index: u16::from(port_num),
            data: &[],
        };
        device
            .control_out(control, TRANSFER_TIMEOUT)
            .await
            .map_err(|_| BackendError::Rejected)?;
        Ok(())
    }
}

#[async_trait::async_trait(?Send)]
impl Backend for GenericHubBackend {
    fn print(&self, port: &Port) -> String {
        format!(
            "Type Generic Path: {} State {:?} Pwr: {:?}",
            port.topology_paths
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("/"),
            port.connection_status,
            port.power_state,
        )
    }

    async fn update(&mut self, port: &mut Port, cmd: Command) -> Result<UpdateOutcome, BackendError> {
        let BackendRef::GenericHub { hub_port } = port.backend_ref else {
            unreachable!("GenericHubBackend invoked on a non-generic-hub port");
        };
        let hub_id = port.parent_hub.ok_or(BackendError::Rejected)?;

        match cmd {
            Command::Enable => {
                self.set_port_power(hub_id, hub_port, true).await?;
                port.mark_enabled();
                Ok(UpdateOutcome::Done)
            }
            Command::Disable => {
                self.set_port_power(hub_id, hub_port, false).await?;
                port.mark_disabled();
                Ok(UpdateOutcome::Done)
            }
            Command::Restart => {
                if !port.enabled {
                    return Ok(UpdateOutcome::Done);
                }
                port.msg_mode = MsgMode::Reset;
                let want_on = port.power_state == PowerState::Off;

                match self.set_port_power(hub_id, hub_port, want_on).await {
                    Ok(()) => {
                        port.power_state = if want_on { PowerState::On } else { PowerState::Off };
                        if want_on {
                            port.msg_mode = MsgMode::Idle;
                            Ok(UpdateOutcome::Done)
                        } else {
                            Ok(UpdateOutcome::RetryAfter(RESET_RETRY_DELAY))
                        }
                    }
                    Err(err) => {
                        warn!(port = port.id.0, "generic hub transfer failed, retrying reset");
                        let _ = err;
                        Ok(UpdateOutcome::RetryAfter(RESET_RETRY_DELAY))
                    }
                }
            }
        }
    }

    async fn timeout(&mut self, port: &mut Port) -> UpdateOutcome {
        match self.update(port, Command::Restart).await {
            Ok(outcome) => outcome,
            Err(_) => UpdateOutcome::RetryAfter(RESET_RETRY_DELAY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ykush_hub_is_blacklisted_by_constant() {
        assert_eq!(YKUSH_HUB_VID_PID, (0x0424, 0x2514));
    }

    #[tokio::test]
    async fn update_on_unregistered_hub_is_rejected() {
        let mut backend = GenericHubBackend::new();
        let mut port = Port::new(
            crate::model::port::PortId(1),
            vec!["1-2".parse().unwrap()],
            crate::model::port::PortKind::GenericHub,
            BackendRef::GenericHub { hub_port: 2 },
        );
        port.parent_hub = Some(HubId(1));
        let result = backend.update(&mut port, Command::Enable).await;
        assert_eq!(result, Err(BackendError::Rejected));
    }
}
