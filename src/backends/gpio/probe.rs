//! GPIO path-discovery probe.
//!
//! Discovers which physical topology path each configured GPIO actually
//! controls, for hardware builds where that mapping is unknown at config
//! time. No counterpart exists in `gpio_handler.c` — the original predates
//! this feature — so the state machine below follows the seven-step
//! protocol directly: disable every GPIO port, settle, then light ports one
//! at a time and watch for the device that shows up.
//!
//! Driven by the supervisor: [`GpioProbe::start`] kicks things off,
//! [`GpioProbe::on_timer`] handles the single global probe timer, and
//! [`GpioProbe::on_device_arrived`] handles a USB arrival event while a
//! probe is in progress. Each returns a [`ProbeAction`] telling the
//! supervisor what timer to arm next, or that the probe has finished.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::backends::gpio::GpioBackend;
use crate::model::port::{BackendRef, MsgMode, Port, PortId, PortKind, PowerState};
use crate::model::registry::PortRegistry;

/// Settle delay after disabling all ports, and the `down_2` confirmation
/// delay (both named `5 s` in the protocol).
pub const PROBE_SETTLE_DELAY: Duration = Duration::from_secs(5);
/// How long a lit port waits for its device to arrive before giving up.
pub const PROBE_ARRIVAL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeState {
    Down,
    DownDone,
    Up,
    Down2,
    Done,
}

/// What the supervisor should do after driving the probe one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeAction {
    /// Arm (or re-arm) the single probe-global timer after `Duration`.
    ArmTimer(Duration),
    /// The mapping has been learned, persisted, and every GPIO port
    /// re-enabled; normal supervision resumes.
    Finished,
}

/// Tracks one in-progress probe run across every GPIO port in the registry.
#[derive(Debug)]
pub struct GpioProbe {
    persistence_path: PathBuf,
    states: HashMap<PortId, ProbeState>,
    pending: VecDeque<PortId>,
    current_up: Option<PortId>,
}

impl GpioProbe {
    /// Step 1: disable every GPIO port, mark it `down`, arm the settle timer.
    pub fn start(registry: &mut PortRegistry, persistence_path: PathBuf) -> (Self, ProbeAction) {
        let mut states = HashMap::new();
        for port in registry.iter_mut() {
            if port.kind != PortKind::Gpio {
                continue;
            }
            port.mark_disabled();
            Self::write_off(port);
            port.msg_mode = MsgMode::Probe;
            states.insert(port.id, ProbeState::Down);
        }
        (
            Self {
                persistence_path,
                states,
                pending: VecDeque::new(),
                current_up: None,
            },
            ProbeAction::ArmTimer(PROBE_SETTLE_DELAY),
        )
    }

    fn gpio_ids(registry: &PortRegistry) -> impl Iterator<Item = PortId> + '_ {
        registry.iter().filter(|p| p.kind == PortKind::Gpio).map(|p| p.id)
    }

    /// The single global probe timer fired. Dispatches to whichever phase
    /// is actually pending: the initial settle scan, or a lit/`down_2`
    /// port's own timeout.
    pub fn on_timer(&mut self, registry: &mut PortRegistry) -> ProbeAction {
        if self.current_up.is_some() {
            return self.on_phase_timeout(registry);
        }
        self.on_settle_timeout(registry)
    }

    /// Step 2: all ports should be powered down by now. If any still has a
    /// bound device, the host hasn't noticed the removal yet; re-arm and
    /// wait again. Otherwise move every port to `down_done` and start
    /// lighting them one at a time.
    fn on_settle_timeout(&mut self, registry: &mut PortRegistry) -> ProbeAction {
        let still_bound: Vec<PortId> = Self::gpio_ids(registry)
            .filter(|id| registry.get(*id).is_some_and(|p| p.device_identity.is_some()))
            .collect();

        if !still_bound.is_empty() {
            for id in &still_bound {
                warn!(port = id.0, "GPIO probe: device still bound after disable, waiting");
            }
            return ProbeAction::ArmTimer(PROBE_SETTLE_DELAY);
        }

        for state in self.states.values_mut() {
            *state = ProbeState::DownDone;
        }
        self.pending = Self::gpio_ids(registry).collect();

        self.advance(registry)
    }

    /// Steps 5/6: a lit (`up`) or just-disabled (`down_2`) port's own timer
    /// fired with no qualifying arrival.
    fn on_phase_timeout(&mut self, registry: &mut PortRegistry) -> ProbeAction {
        let Some(up_id) = self.current_up else {
            return self.advance(registry);
        };

        match self.states.get(&up_id).copied() {
            Some(ProbeState::Up) => {
                if let Some(port) = registry.get_mut(up_id) {
                    Self::write_off(port);
                }
                self.states.insert(up_id, ProbeState::Down2);
                ProbeAction::ArmTimer(PROBE_SETTLE_DELAY)
            }
            Some(ProbeState::Down2) => {
                self.states.insert(up_id, ProbeState::Done);
                self.current_up = None;
                self.advance(registry)
            }
            _ => self.advance(registry),
        }
    }

    /// Step 3: enable the next `down_done` port and arm its arrival timeout,
    /// or — if none remain — persist the learned mapping and finish.
    fn advance(&mut self, registry: &mut PortRegistry) -> ProbeAction {
        while let Some(id) = self.pending.pop_front() {
            if self.states.get(&id).copied() != Some(ProbeState::DownDone) {
                continue;
            }
            if let Some(port) = registry.get_mut(id) {
                Self::write_on(port);
            }
            self.states.insert(id, ProbeState::Up);
            self.current_up = Some(id);
            return ProbeAction::ArmTimer(PROBE_ARRIVAL_TIMEOUT);
        }

        match self.persist(registry) {
            Ok(()) => {
                self.reenable_all(registry);
                ProbeAction::Finished
            }
            Err(err) => {
                warn!(%err, "failed to persist GPIO probe mapping, retrying");
                ProbeAction::ArmTimer(PROBE_SETTLE_DELAY)
            }
        }
    }

    /// Step 4: a device arrived on `arrived` while a probe is in progress.
    /// Returns `None` if there is nothing lit to compare against, the lit
    /// port just transitioned to `down_2` (its arrivals are ignored, it is
    /// about to be marked `done` anyway), or `arrived` is not itself a GPIO
    /// port — a non-GPIO arrival is never a mismatch candidate for this
    /// probe and must take the normal liveness path instead.
    pub fn on_device_arrived(
        &mut self,
        registry: &mut PortRegistry,
        arrived: PortId,
        vid: u16,
        pid: u16,
    ) -> Option<ProbeAction> {
        let up_id = self.current_up?;

        if registry.get(arrived).map(|p| p.kind) != Some(PortKind::Gpio) {
            return None;
        }

        if self.states.get(&up_id) == Some(&ProbeState::Down2) {
            return None;
        }

        if arrived == up_id {
            if let Some(port) = registry.get_mut(up_id) {
                port.on_device_arrived(vid, pid);
            }
            self.states.insert(up_id, ProbeState::Done);
            self.current_up = None;
            return Some(self.advance(registry));
        }

        self.swap_mapping(registry, up_id, arrived, vid, pid);
        self.states.insert(up_id, ProbeState::Done);
        self.current_up = None;
        Some(self.advance(registry))
    }

    /// The mapping is wrong: the device meant for `up_id` actually sits on
    /// `arrived`'s path. Exchange the two ports' topology paths and bound
    /// device identity so each GPIO keeps the path it actually controls.
    /// Goes through [`PortRegistry::swap_port_paths`] rather than assigning
    /// `topology_paths` in place, so the registry's path index stays in sync
    /// with the swap.
    fn swap_mapping(&self, registry: &mut PortRegistry, up_id: PortId, arrived: PortId, vid: u16, pid: u16) {
        let up_identity = registry.get(up_id).and_then(|p| p.device_identity);

        registry.swap_port_paths(up_id, arrived);

        if let Some(arrived_port) = registry.get_mut(arrived) {
            arrived_port.on_device_arrived(vid, pid);
        }
        if let Some(up_port) = registry.get_mut(up_id) {
            up_port.device_identity = up_identity;
        }
    }

    fn write_on(port: &mut Port) {
        let BackendRef::Gpio { addr, on_val, .. } = port.backend_ref.clone() else {
            return;
        };
        if GpioBackend::write_value(&addr.sysfs_path(), on_val).is_ok() {
            port.power_state = PowerState::On;
        }
    }

    fn write_off(port: &mut Port) {
        let BackendRef::Gpio { addr, off_val, .. } = port.backend_ref.clone() else {
            return;
        };
        if GpioBackend::write_value(&addr.sysfs_path(), off_val).is_ok() {
            port.power_state = PowerState::Off;
        }
    }

    /// Step 7: once every port is `done`, turn them all back on so the now
    /// correctly-mapped devices can resume normal supervision.
    fn reenable_all(&self, registry: &mut PortRegistry) {
        for id in self.states.keys() {
            if let Some(port) = registry.get_mut(*id) {
                port.mark_enabled();
                Self::write_on(port);
                port.msg_mode = MsgMode::Idle;
            }
        }
    }

    /// Step 6: serialize the learned mapping and write it atomically
    /// (write to a sibling temp file, then rename over the target) so a
    /// crash mid-write never leaves a half-written mapping on disk.
    fn persist(&self, registry: &PortRegistry) -> std::io::Result<()> {
        #[derive(Serialize)]
        struct PersistedPort {
            gpio_path: String,
            path: Vec<String>,
            on_val: u8,
            off_val: u8,
        }
        #[derive(Serialize)]
        struct Persisted {
            name: &'static str,
            ports: Vec<PersistedPort>,
        }

        let mut ports = Vec::new();
        for id in self.states.keys() {
            let Some(port) = registry.get(*id) else { continue };
            let BackendRef::Gpio { addr, on_val, off_val } = &port.backend_ref else {
                continue;
            };
            ports.push(PersistedPort {
                gpio_path: addr.sysfs_path(),
                path: port.topology_paths.iter().map(ToString::to_string).collect(),
                on_val: *on_val,
                off_val: *off_val,
            });
        }

        let json = serde_json::to_string_pretty(&Persisted { name: "GPIO", ports })?;
        let tmp_path = self.persistence_path.with_extension("tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.persistence_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::port::GpioAddr;
    use tempfile::tempdir;

    fn gpio_port(id: u32, path: &str) -> Port {
        Port::new(
            PortId(id),
            vec![path.parse().unwrap()],
            PortKind::Gpio,
            BackendRef::Gpio {
                addr: GpioAddr::Path(format!("/nonexistent/probe-{id}")),
                on_val: b'1',
                off_val: b'0',
            },
        )
    }

    fn two_port_registry() -> PortRegistry {
        let mut reg = PortRegistry::new();
        let a = reg.alloc_port_id();
        reg.add_port(gpio_port(a.0, "1-1"));
        let b = reg.alloc_port_id();
        reg.add_port(gpio_port(b.0, "1-2"));
        reg
    }

    #[test]
    fn start_disables_all_gpio_ports_and_arms_settle_timer() {
        let mut reg = two_port_registry();
        let dir = tempdir().unwrap();
        let (_probe, action) = GpioProbe::start(&mut reg, dir.path().join("mapping.json"));
        assert_eq!(action, ProbeAction::ArmTimer(PROBE_SETTLE_DELAY));
        assert!(reg.iter().all(|p| !p.enabled));
    }

    #[test]
    fn correct_mapping_finishes_and_persists() {
        let mut reg = two_port_registry();
        let dir = tempdir().unwrap();
        let persistence_path = dir.path().join("mapping.json");
        let (mut probe, _) = GpioProbe::start(&mut reg, persistence_path.clone());

        let action = probe.on_timer(&mut reg); // settle -> light port 0
        let up_id = probe.current_up.expect("a port should be lit");
        assert_eq!(action, ProbeAction::ArmTimer(PROBE_ARRIVAL_TIMEOUT));

        let action = probe
            .on_device_arrived(&mut reg, up_id, 0x12d1, 0x1506)
            .expect("arrival should be handled");
        assert_eq!(action, ProbeAction::ArmTimer(PROBE_ARRIVAL_TIMEOUT));

        let second_up = probe.current_up.expect("second port should now be lit");
        let action = probe
            .on_device_arrived(&mut reg, second_up, 0x12d1, 0x1507)
            .expect("arrival should be handled");
        assert_eq!(action, ProbeAction::Finished);
        assert!(persistence_path.exists());
        assert!(reg.iter().all(|p| p.enabled));
    }

    #[test]
    fn swapped_mapping_exchanges_topology_paths() {
        let mut reg = two_port_registry();
        let dir = tempdir().unwrap();
        let (mut probe, _) = GpioProbe::start(&mut reg, dir.path().join("mapping.json"));

        probe.on_timer(&mut reg); // settle -> light port A (path "1-1")
        let up_id = probe.current_up.unwrap();
        let other_id = PortId(if up_id.0 == 0 { 1 } else { 0 });
        let up_path_before = reg.get(up_id).unwrap().topology_paths.clone();
        let other_path_before = reg.get(other_id).unwrap().topology_paths.clone();

        // Device shows up on the *other* port instead of the one we lit.
        probe.on_device_arrived(&mut reg, other_id, 0x0424, 0x2640);

        assert_eq!(reg.get(up_id).unwrap().topology_paths, other_path_before);
        assert_eq!(reg.get(other_id).unwrap().topology_paths, up_path_before);
    }

    #[test]
    fn arrival_while_down2_is_ignored() {
        let mut reg = two_port_registry();
        let dir = tempdir().unwrap();
        let (mut probe, _) = GpioProbe::start(&mut reg, dir.path().join("mapping.json"));
        probe.on_timer(&mut reg);
        let up_id = probe.current_up.unwrap();

        // Arrival timeout: nothing showed up, port transitions to down_2.
        let action = probe.on_timer(&mut reg);
        assert_eq!(action, ProbeAction::ArmTimer(PROBE_SETTLE_DELAY));
        assert_eq!(probe.states.get(&up_id), Some(&ProbeState::Down2));

        assert!(probe.on_device_arrived(&mut reg, up_id, 0x1, 0x1).is_none());
    }

    #[test]
    fn arrival_from_non_gpio_port_is_ignored() {
        let mut reg = two_port_registry();
        let lanner_id = reg.alloc_port_id();
        reg.add_port(Port::new(
            lanner_id,
            vec!["9-9".parse().unwrap()],
            PortKind::Lanner,
            BackendRef::Lanner { bitmask: 0x01 },
        ));

        let dir = tempdir().unwrap();
        let (mut probe, _) = GpioProbe::start(&mut reg, dir.path().join("mapping.json"));
        probe.on_timer(&mut reg); // settle -> light one GPIO port
        let up_id = probe.current_up.unwrap();
        let up_path_before = reg.get(up_id).unwrap().topology_paths.clone();
        let lanner_path_before = reg.get(lanner_id).unwrap().topology_paths.clone();

        assert!(probe.on_device_arrived(&mut reg, lanner_id, 0x1, 0x1).is_none());
        assert_eq!(reg.get(up_id).unwrap().topology_paths, up_path_before);
        assert_eq!(reg.get(lanner_id).unwrap().topology_paths, lanner_path_before);
        assert_eq!(reg.get(lanner_id).unwrap().device_identity, None);
    }
}
