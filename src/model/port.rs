//! The `Port` entity: one switchable USB power line.

use std::time::Duration;

use crate::event_loop::timers::TimerKey;
use crate::model::path::TopologyPath;

/// Consecutive liveness failures tolerated before a restart is triggered.
pub const RETRANS_LIMIT: u8 = 5;

/// Delay before the first liveness ping after device arrival.
pub const ARRIVAL_PING_DELAY: Duration = Duration::from_secs(10);

/// Which backend owns a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    GenericHub,
    Ykush,
    Gpio,
    Lanner,
}

/// Opaque, backend-specific handle identifying how to actually switch power
/// for a port. Kept as a tagged variant rather than a `void*`/union so each
/// backend's data stays typed end to end (see DESIGN.md, "untyped ownership
/// graphs").
#[derive(Debug, Clone)]
pub enum BackendRef {
    /// Hub port number (1-based) on a generic switchable hub.
    GenericHub { hub_port: u8 },
    /// Port number (1..=3) on a YKUSH hub, plus which hub owns the claimed
    /// communication interface the backend needs to reach it.
    Ykush {
        hub_id: crate::model::hub::HubId,
        port_num: u8,
    },
    /// sysfs GPIO addressing: either a numbered `/sys/class/gpio/gpioN` or a
    /// caller-supplied absolute path.
    Gpio {
        addr: GpioAddr,
        on_val: u8,
        off_val: u8,
    },
    /// Lanner MCU digital-output bit (already shifted: `1 << (bit - 1)`).
    Lanner { bitmask: u8 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GpioAddr {
    Num(u32),
    Path(String),
}

impl GpioAddr {
    pub fn sysfs_path(&self) -> String {
        match self {
            Self::Num(n) => format!("/sys/class/gpio/gpio{n}/value"),
            Self::Path(p) => p.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    NoDevice,
    DeviceConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Off,
    On,
}

/// The state machine's active phase (`spec.md` §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgMode {
    Idle,
    Ping,
    Reset,
    Probe,
}

/// A unique, stable identifier for a port within the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub u32);

#[derive(Debug, Clone)]
pub struct Port {
    pub id: PortId,
    pub topology_paths: Vec<TopologyPath>,
    pub kind: PortKind,
    pub backend_ref: BackendRef,
    pub parent_hub: Option<crate::model::hub::HubId>,
    pub device_identity: Option<(u16, u16)>,
    pub connection_status: ConnectionStatus,
    pub power_state: PowerState,
    pub enabled: bool,
    pub msg_mode: MsgMode,
    pub retrans_count: u8,
    pub timer: Option<TimerKey>,
}

impl Port {
    pub fn new(id: PortId, topology_paths: Vec<TopologyPath>, kind: PortKind, backend_ref: BackendRef) -> Self {
        Self {
            id,
            topology_paths,
            kind,
            backend_ref,
            parent_hub: None,
            device_identity: None,
            connection_status: ConnectionStatus::NoDevice,
            power_state: PowerState::On,
            enabled: true,
            msg_mode: MsgMode::Idle,
            retrans_count: 0,
            timer: None,
        }
    }

    pub fn matches_path(&self, path: &TopologyPath) -> bool {
        self.topology_paths.iter().any(|p| p == path)
    }

    /// This port's 1-based position under its parent hub, for
    /// `GenericHub`/`Ykush` ports only; `None` for backends addressed
    /// directly by topology path (GPIO, Lanner).
    pub fn hub_port_number(&self) -> Option<u8> {
        match &self.backend_ref {
            BackendRef::GenericHub { hub_port } => Some(*hub_port),
            BackendRef::Ykush { port_num, .. } => Some(*port_num),
            BackendRef::Gpio { .. } | BackendRef::Lanner { .. } => None,
        }
    }

    /// `enable; enable == enable` (`spec.md` §8 idempotence property).
    pub fn mark_enabled(&mut self) {
        self.enabled = true;
        self.power_state = PowerState::On;
        self.msg_mode = MsgMode::Idle;
    }

    /// `disable; disable == disable`.
    pub fn mark_disabled(&mut self) {
        self.enabled = false;
        self.power_state = PowerState::Off;
    }

    pub fn on_device_arrived(&mut self, vid: u16, pid: u16) {
        self.device_identity = Some((vid, pid));
        self.connection_status = ConnectionStatus::DeviceConnected;
        self.retrans_count = 0;
    }

    /// Clears the bound device identity on departure. Per `spec.md` §4.3,
    /// the timer is only cancelled by the caller if `msg_mode` is not
    /// `Reset`/`Probe` — that decision lives in the supervisor, not here.
    pub fn on_device_departed(&mut self) {
        self.device_identity = None;
        self.connection_status = ConnectionStatus::NoDevice;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_port() -> Port {
        Port::new(
            PortId(1),
            vec!["2-1".parse().unwrap()],
            PortKind::Gpio,
            BackendRef::Gpio {
                addr: GpioAddr::Num(4),
                on_val: b'1',
                off_val: b'0',
            },
        )
    }

    #[test]
    fn enable_is_idempotent() {
        let mut port = sample_port();
        port.mark_disabled();
        port.mark_enabled();
        let after_first = (port.enabled, port.power_state, port.msg_mode);
        port.mark_enabled();
        assert_eq!(after_first, (port.enabled, port.power_state, port.msg_mode));
        assert!(port.enabled);
    }

    #[test]
    fn disable_is_idempotent() {
        let mut port = sample_port();
        port.mark_disabled();
        let after_first = (port.enabled, port.power_state);
        port.mark_disabled();
        assert_eq!(after_first, (port.enabled, port.power_state));
        assert!(!port.enabled);
    }

    #[test]
    fn departure_clears_identity_only() {
        let mut port = sample_port();
        port.on_device_arrived(0x12d1, 0x1506);
        port.on_device_departed();
        assert_eq!(port.device_identity, None);
        assert_eq!(port.connection_status, ConnectionStatus::NoDevice);
    }
}
