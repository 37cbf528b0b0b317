//! Yepkit YKUSH power-control backend.
//!
//! Grounded in `ykush_handler.c`: each port is switched by sending a one- or
//! two-byte command (mirrored into both buffer bytes, like the original's
//! `yport->buf[0] = yport->buf[1] = port_cmd`) as an interrupt OUT transfer
//! to endpoint `0x01` on the hub's HID communication interface. Firmware
//! predating `YKUSH_OLD_FW` wants a 6-byte buffer; newer firmware wants a
//! zero-padded 64-byte buffer.

use std::collections::HashMap;
use std::time::Duration;

use nusb::transfer::{Interrupt, Out};
use nusb::Interface;
use tracing::warn;

use crate::backends::{Backend, Command, UpdateOutcome};
use crate::error::BackendError;
use crate::model::hub::HubId;
use crate::model::port::{BackendRef, MsgMode, Port, PowerState};

/// Communication endpoint all YKUSH hubs speak on.
const COMM_ENDPOINT: u8 = 0x01;
/// Port-select command base values, one per physical port.
const CMD_PORT: [u8; 3] = [0x01, 0x02, 0x03];
/// OR'd into the port command to request "enable"/"power on".
const CMD_ENABLE_BIT: u8 = 0x10;
/// Every in-flight transfer carries this library-level timeout.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);
/// Retry delay after a reset transfer fails to submit.
pub const RESET_RETRY_DELAY: Duration = Duration::from_secs(5);

struct HubHandle {
    interface: Interface,
    old_firmware: bool,
}

/// Holds the claimed communication interface for every managed YKUSH hub.
/// Ports only carry a `(hub_id, port_num)` pair in [`BackendRef::Ykush`]; the
/// actual USB handle lives here, registered by the hotplug layer when a hub
/// is configured.
#[derive(Default)]
pub struct YkushBackend {
    hubs: HashMap<HubId, HubHandle>,
}

impl std::fmt::Debug for YkushBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YkushBackend")
            .field("hubs", &self.hubs.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl YkushBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly configured hub's communication interface. Called
    /// by the USB hotplug layer once `ykush_configure_hub`'s Rust
    /// counterpart has claimed the interface and determined firmware age.
    pub fn register_hub(&mut self, hub_id: HubId, interface: Interface, old_firmware: bool) {
        self.hubs.insert(hub_id, HubHandle { interface, old_firmware });
    }

    pub fn unregister_hub(&mut self, hub_id: HubId) {
        self.hubs.remove(&hub_id);
    }

    fn port_cmd(port_num: u8) -> Result<u8, BackendError> {
        CMD_PORT.get((port_num as usize).wrapping_sub(1)).copied().ok_or(BackendError::Rejected)
    }

    async fn send(&self, hub_id: HubId, port_cmd: u8) -> Result<(), BackendError> {
        let hub = self.hubs.get(&hub_id).ok_or(BackendError::Rejected)?;
        let buf_len = if hub.old_firmware { 6 } else { 64 };
        let mut buf = vec![0u8; buf_len];
        buf[0] = port_cmd;
        buf[1] = port_cmd;

        let mut endpoint = hub
            .interface
            .endpoint::<Interrupt, Out>(COMM_ENDPOINT)
            .map_err(|_| BackendError::Rejected)?;
        endpoint.submit(buf.into());
        let completion = tokio::time::timeout(TRANSFER_TIMEOUT, endpoint.next_complete())
            .await
            .map_err(|_| BackendError::Busy)?;
        completion.status.map_err(|_| BackendError::Rejected)
    }
}

#[async_trait::async_trait(?Send)]
impl Backend for YkushBackend {
    fn print(&self, port: &Port) -> String {
        format!(
            "Type YKUSH Path: {} State {:?} Pwr: {:?}",
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
        let BackendRef::Ykush { hub_id, port_num } = port.backend_ref.clone() else {
            unreachable!("YkushBackend invoked on a non-YKUSH port");
        };
        let base_cmd = Self::port_cmd(port_num)?;

        match cmd {
            Command::Enable => {
                self.send(hub_id, base_cmd | CMD_ENABLE_BIT).await?;
                port.mark_enabled();
                Ok(UpdateOutcome::Done)
            }
            Command::Disable => {
                self.send(hub_id, base_cmd).await?;
                port.mark_disabled();
                Ok(UpdateOutcome::Done)
            }
            Command::Restart => {
                if !port.enabled {
                    return Ok(UpdateOutcome::Done);
                }
                port.msg_mode = MsgMode::Reset;
                // `!pwr_state` in the original: request the opposite of the
                // port's currently recorded power state.
                let want_on = port.power_state == PowerState::Off;
                let cmd_byte = if want_on { base_cmd | CMD_ENABLE_BIT } else { base_cmd };

                match self.send(hub_id, cmd_byte).await {
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
                        warn!(port = port.id.0, "YKUSH transfer failed, retrying reset");
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
    fn port_cmd_maps_one_based_port_numbers() {
        assert_eq!(YkushBackend::port_cmd(1).unwrap(), 0x01);
        assert_eq!(YkushBackend::port_cmd(2).unwrap(), 0x02);
        assert_eq!(YkushBackend::port_cmd(3).unwrap(), 0x03);
        assert!(YkushBackend::port_cmd(4).is_err());
        assert!(YkushBackend::port_cmd(0).is_err());
    }

    #[tokio::test]
    async fn update_on_unregistered_hub_is_rejected() {
        let mut backend = YkushBackend::new();
        let mut port = Port::new(
            crate::model::port::PortId(1),
            vec!["1-1".parse().unwrap()],
            crate::model::port::PortKind::Ykush,
            BackendRef::Ykush { hub_id: HubId(1), port_num: 1 },
        );
        let result = backend.update(&mut port, Command::Enable).await;
        assert_eq!(result, Err(BackendError::Rejected));
    }
}
