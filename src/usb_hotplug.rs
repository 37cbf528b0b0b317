//! USB collaborator adapter: hotplug arrival/departure, hub configuration,
//! and the liveness-ping transfer.
//!
//! Grounded in `examples/original_source/src/usb_monitor_callbacks.c`
//! (`usb_monitor_cb`/`usb_device_added`/`usb_device_removed`) and
//! `ykush_handler.c`'s `ykush_configure_hub`, realized over `nusb` (the
//! teacher's vendor-USB dependency) instead of raw `libusb` hotplug
//! callbacks + fd-set bookkeeping: `nusb::watch_devices` already yields an
//! async stream of connect/disconnect events, so there is no caller-held
//! event lock or fd-set to multiplex (`spec.md` §5, resolved as an Open
//! Question in `DESIGN.md`).

use std::collections::HashMap;
use std::time::Duration;

use nusb::hotplug::HotplugEvent as NusbHotplugEvent;
use nusb::transfer::{ControlIn, ControlType, Recipient};
use nusb::{DeviceId, DeviceInfo, MaybeFuture};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::backends::generic_hub::{self, GenericHubBackend, YKUSH_HUB_VID_PID};
use crate::backends::ykush::YkushBackend;
use crate::model::hub::{Hub, HubId};
use crate::model::path::TopologyPath;
use crate::model::port::PortKind;
use crate::model::registry::PortRegistry;

/// YKUSH's own vendor ID and both known product IDs (`spec.md` §4.4).
const YKUSH_VID: u16 = 0x04d8;
const YKUSH_PIDS: [u16; 2] = [0x0042, 0xf2f7];

/// Firmware predating this numeric serial suffix wants 6-byte commands
/// instead of 64-byte ones (`spec.md` §4.4, `YKUSH_OLD_FW` upstream).
const YKUSH_OLD_FW_THRESHOLD: u32 = 129;

/// Every shipped YKUSH hub (YKUSH, YKUSH3, YKUSH XS) exposes exactly this
/// many ports; anything else is a hub we don't recognize.
const YKUSH_NUM_PORTS: u8 = 3;

/// Every liveness ping and control/interrupt transfer carries this
/// library-level timeout (`spec.md` §5).
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(5);

/// Events the supervisor reacts to every iteration. Plain arrivals/
/// departures drive the liveness state machine; the `*HubArrived` variants
/// drive backend (de)registration, mirroring the original's "called
/// manually when we detect a hub, since we risk devices being added before
/// we see the YKUSH HID device" comment. A hub's own departure arrives as a
/// plain `Departed` on its own path — the supervisor tells a hub departure
/// from a leaf port departure by checking the registry (`spec.md` §8
/// scenario 6).
pub enum HotplugEvent {
    /// `device` is the opened handle for the arrived device, cached by the
    /// supervisor and reused for liveness pings; `None` if opening it
    /// failed (the port is still tracked, pings simply fail immediately
    /// and count as retransmissions, matching a libusb open failure in
    /// the original).
    Arrived { path: TopologyPath, vid: u16, pid: u16, device: Option<nusb::Device> },
    Departed { path: TopologyPath },
    GenericHubArrived { device: nusb::Device, bcd_usb: u16, hub_path: TopologyPath },
    YkushHubArrived {
        hub_device: nusb::Device,
        hid_device: nusb::Device,
        old_firmware: bool,
        bcd_usb: u16,
        hub_path: TopologyPath,
    },
}

pub struct HotplugWatcher {
    rx: mpsc::UnboundedReceiver<HotplugEvent>,
}

impl HotplugWatcher {
    pub async fn recv(&mut self) -> Option<HotplugEvent> {
        self.rx.recv().await
    }
}

/// Builds the topology path for a device: bus number followed by its
/// hub-port chain, matching `usb_helpers_fill_port_array`.
fn device_path(info: &DeviceInfo) -> Option<TopologyPath> {
    let mut components = vec![info.bus_number()];
    components.extend_from_slice(info.port_chain());
    TopologyPath::new(components).ok()
}

/// Generic-hub and YKUSH ports do not have a known topology path until a
/// device actually arrives under them; each gets a unique placeholder
/// (reserved bus `0xFF`, followed by the owning hub id and port number) so
/// `PortRegistry::add_port` never sees two ports claim the same path.
fn placeholder_path(hub_id: HubId, port_num: u8) -> TopologyPath {
    let id = hub_id.0;
    TopologyPath::new(vec![0xFF, (id >> 8) as u8, id as u8, port_num])
        .expect("placeholder path components always fit MAX_PATH_LEN")
}

fn is_ykush_hub(info: &DeviceInfo) -> bool {
    info.vendor_id() == YKUSH_VID && YKUSH_PIDS.contains(&info.product_id())
}

fn is_candidate_generic_hub(info: &DeviceInfo) -> bool {
    info.class() == 0x09 // USB hub device class
        && (info.vendor_id(), info.product_id()) != YKUSH_HUB_VID_PID
}

/// Subscribes to `nusb`'s hotplug stream and translates each event into a
/// [`HotplugEvent`] the supervisor understands. Spawned once at startup;
/// the returned channel is read by [`crate::supervisor::Supervisor::run`].
pub fn watch() -> HotplugWatcher {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::task::spawn_local(async move {
        let mut stream = match nusb::watch_devices() {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%err, "failed to subscribe to USB hotplug events");
                return;
            }
        };

        // `nusb` only hands back the opaque device id on disconnect; this
        // remembers which path each id arrived under so a disconnect can
        // still be routed to the right port (or, if the departing device
        // was itself a registered hub, to the hub-departure teardown —
        // `spec.md` §8 scenario 6).
        let mut known: HashMap<DeviceId, TopologyPath> = HashMap::new();

        use futures_util::StreamExt;
        while let Some(event) = stream.next().await {
            match event {
                NusbHotplugEvent::Connected(info) => {
                    if let Some(path) = device_path(&info) {
                        known.insert(info.id(), path);
                    }
                    handle_arrival(&tx, info).await;
                }
                NusbHotplugEvent::Disconnected(id) => {
                    debug!(?id, "USB device disconnected");
                    if let Some(path) = known.remove(&id) {
                        let _ = tx.send(HotplugEvent::Departed { path });
                    }
                }
            }
        }
    });

    HotplugWatcher { rx }
}

async fn handle_arrival(tx: &mpsc::UnboundedSender<HotplugEvent>, info: DeviceInfo) {
    let Some(path) = device_path(&info) else { return };

    let device = info.open().wait().ok();
    let _ = tx.send(HotplugEvent::Arrived {
        path,
        vid: info.vendor_id(),
        pid: info.product_id(),
        device,
    });

    if is_ykush_hub(&info) {
        // The firmware-age cutoff is read from the serial string
        // descriptor's trailing digits (`YKUSH026428` -> `26428`);
        // devices without a parseable numeric suffix are treated as
        // current firmware.
        let old_firmware = info
            .serial_number()
            .and_then(|serial| serial.trim_start_matches(|c: char| !c.is_ascii_digit()).parse::<u32>().ok())
            .is_some_and(|suffix| suffix < YKUSH_OLD_FW_THRESHOLD);
        if let (Ok(device), Some(hub_path)) = (info.open().wait(), device_path(&info)) {
            let _ = tx.send(HotplugEvent::YkushHubArrived {
                hub_device: device.clone(),
                hid_device: device,
                old_firmware,
                bcd_usb: info.device_version(),
                hub_path,
            });
        }
        return;
    }

    if is_candidate_generic_hub(&info) {
        if let (Ok(device), Some(hub_path)) = (info.open().wait(), device_path(&info)) {
            let bcd_usb = info.device_version();
            let _ = tx.send(HotplugEvent::GenericHubArrived { device, bcd_usb, hub_path });
        }
    }
}

/// `ykush_configure_hub`: read the hub's own descriptor and reject it if it
/// doesn't advertise exactly `spec.md` §4.4's 3 ports, then open the HID
/// child, detach any kernel driver (ignoring "no driver bound"), and claim
/// interface 0 — mirroring `configure_generic_hub`'s validate-then-register
/// shape.
pub async fn configure_ykush_hub(
    registry: &mut PortRegistry,
    backend: &mut YkushBackend,
    hub_device: nusb::Device,
    hid_device: nusb::Device,
    old_firmware: bool,
    bcd_usb: u16,
    hub_path: TopologyPath,
) {
    let Some(descriptor) = generic_hub::read_hub_descriptor(&hub_device, bcd_usb).await else {
        warn!("failed to read YKUSH hub descriptor, ignoring hub");
        return;
    };
    if descriptor.num_ports != YKUSH_NUM_PORTS {
        warn!(num_ports = descriptor.num_ports, "YKUSH hub advertises an unexpected port count, ignoring hub");
        return;
    }

    let Ok(interface) = hid_device.detach_and_claim_interface(0).wait() else {
        warn!("failed to claim YKUSH HID interface");
        return;
    };

    let hub_id = registry.alloc_hub_id();
    // The hub's own device handle was only needed to read its descriptor above.
    drop(hub_device);
    registry.add_hub(Hub {
        id: hub_id,
        hub_device: crate::model::hub::DeviceRef { bus: 0, address: 0 },
        comm_device: Some(crate::model::hub::DeviceRef { bus: 0, address: 0 }),
        num_ports: YKUSH_NUM_PORTS,
        old_firmware,
        path: Some(hub_path),
    });

    backend.register_hub(hub_id, interface, old_firmware);

    for port_num in 1..=YKUSH_NUM_PORTS {
        let id = registry.alloc_port_id();
        let mut port = crate::model::port::Port::new(
            id,
            vec![placeholder_path(hub_id, port_num)],
            PortKind::Ykush,
            crate::model::port::BackendRef::Ykush { hub_id, port_num },
        );
        port.parent_hub = Some(hub_id);
        registry.add_port(port);
    }
}

/// Reads the hub class descriptor and, if it advertises per-port power
/// switching and is not the YKUSH's own internal hub, registers one port
/// per advertised `bNbrPorts` (`spec.md` §4.5).
pub async fn configure_generic_hub(
    registry: &mut PortRegistry,
    backend: &mut GenericHubBackend,
    device: nusb::Device,
    bcd_usb: u16,
    hub_path: TopologyPath,
) {
    let Some(descriptor) = generic_hub::read_hub_descriptor(&device, bcd_usb).await else {
        return;
    };
    if !descriptor.power_switching_per_port {
        debug!("hub does not advertise per-port power switching, ignoring");
        return;
    }

    let hub_id = registry.alloc_hub_id();
    registry.add_hub(Hub {
        id: hub_id,
        hub_device: crate::model::hub::DeviceRef { bus: 0, address: 0 },
        comm_device: None,
        num_ports: descriptor.num_ports,
        old_firmware: false,
        path: Some(hub_path),
    });
    backend.register_hub(hub_id, device);

    for hub_port in 1..=descriptor.num_ports {
        let id = registry.alloc_port_id();
        // The real topology path is unknown until a device actually
        // enumerates under this hub; the port stays addressable via
        // `parent_hub` and gets a placeholder path until the first
        // arrival rewrites it in place.
        let mut port = crate::model::port::Port::new(
            id,
            vec![placeholder_path(hub_id, hub_port)],
            PortKind::GenericHub,
            crate::model::port::BackendRef::GenericHub { hub_port },
        );
        port.parent_hub = Some(hub_id);
        registry.add_port(port);
    }
}

/// Sends the liveness ping transfer described in `spec.md` §6: an `80 00
/// 00 00 02 00` control setup (device-recipient `GET_STATUS`, 2-byte
/// reply). Returns whether the transfer completed without a timeout/stall.
pub async fn send_liveness_ping(device: &nusb::Device) -> bool {
    let control = ControlIn {
        control_type: ControlType::Standard,
        recipient: Recipient::Device,
        request: 0x00, // GET_STATUS
        value: 0x0000,
        index: 0x0000,
        length: 2,
    };
    device.control_in(control, TRANSFER_TIMEOUT).await.is_ok()
}

/// `usb_helpers_check_devices`: walks every currently attached device and
/// returns `(path, vid, pid, handle)` for each, so the supervisor can
/// re-run arrival handling for anything a hotplug event was missed for.
pub async fn enumerate_current(_registry: &PortRegistry) -> Vec<(TopologyPath, u16, u16, Option<nusb::Device>)> {
    let Ok(devices) = nusb::list_devices().wait() else {
        return Vec::new();
    };
    devices
        .filter_map(|info| {
            device_path(&info).map(|path| {
                let device = info.open().wait().ok();
                (path, info.vendor_id(), info.product_id(), device)
            })
        })
        .collect()
}
