//! sysfs GPIO power-control backend.
//!
//! Grounded in `gpio_handler.c`'s `gpio_update_port`: open the pin's `value`
//! file `O_WRONLY|O_CLOEXEC`, write a single ASCII character, close. The
//! original treats a failed open/write as transient and retries after
//! `GPIO_TIMEOUT_SLEEP_SEC`; there is no separate error path; the only
//! permanent failure is no failure at all.

pub mod probe;

use std::io::Write as _;
use std::os::unix::fs::OpenOptionsExt as _;
use std::time::Duration;

use tracing::warn;

use crate::backends::{Backend, Command, UpdateOutcome};
use crate::error::BackendError;
use crate::model::port::{BackendRef, MsgMode, Port, PowerState};

/// Retry delay after a failed sysfs open/write, named `GPIO_TIMEOUT_SLEEP_SEC`
/// in the original.
pub const GPIO_RETRY_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
pub struct GpioBackend;

impl GpioBackend {
    pub fn new() -> Self {
        Self
    }

    /// Opens `path` write-only with `O_CLOEXEC` and writes a single byte,
    /// matching `gpio_update_port`'s `open`/`write`/`close` sequence. Shared
    /// with [`probe`], which writes the same pins outside the `Backend`
    /// trait's per-command dispatch.
    pub(crate) fn write_value(path: &str, value: u8) -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .custom_flags(nix::fcntl::OFlag::O_CLOEXEC.bits())
            .open(path)?;
        file.write_all(&[value])
    }
}

#[async_trait::async_trait(?Send)]
impl Backend for GpioBackend {
    fn print(&self, port: &Port) -> String {
        let BackendRef::Gpio { addr, .. } = &port.backend_ref else {
            unreachable!("GpioBackend invoked on a non-GPIO port");
        };
        format!(
            "Type GPIO Path: {} State {:?} Pwr: {:?} GPIO: {}",
            port.topology_paths
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("/"),
            port.connection_status,
            port.power_state,
            addr.sysfs_path(),
        )
    }

    async fn update(&mut self, port: &mut Port, cmd: Command) -> Result<UpdateOutcome, BackendError> {
        let BackendRef::Gpio { addr, on_val, off_val } = port.backend_ref.clone() else {
            unreachable!("GpioBackend invoked on a non-GPIO port");
        };

        match cmd {
            Command::Enable => {
                port.mark_enabled();
                let path = addr.sysfs_path();
                if Self::write_value(&path, on_val).is_err() {
                    warn!(port = port.id.0, %path, "failed to write GPIO on-value");
                }
                return Ok(UpdateOutcome::Done);
            }
            Command::Disable => {
                port.mark_disabled();
                let path = addr.sysfs_path();
                if Self::write_value(&path, off_val).is_err() {
                    warn!(port = port.id.0, %path, "failed to write GPIO off-value");
                }
                return Ok(UpdateOutcome::Done);
            }
            Command::Restart => {}
        }

        port.msg_mode = MsgMode::Reset;

        // "POWER_OFF is 0, so then we should switch the port on" — the
        // restart/reset path always toggles towards the opposite of the
        // current state, matching the original's `!gport->pwr_state` check.
        let target_on = port.power_state == PowerState::Off;
        let value = if target_on { on_val } else { off_val };
        let path = addr.sysfs_path();

        match Self::write_value(&path, value) {
            Ok(()) => {
                port.power_state = if target_on { PowerState::On } else { PowerState::Off };
                if target_on {
                    port.msg_mode = MsgMode::Idle;
                    Ok(UpdateOutcome::Done)
                } else {
                    Ok(UpdateOutcome::RetryAfter(GPIO_RETRY_DELAY))
                }
            }
            Err(err) => {
                warn!(port = port.id.0, %path, %err, "failed to open/write GPIO value file");
                Ok(UpdateOutcome::RetryAfter(GPIO_RETRY_DELAY))
            }
        }
    }

    async fn timeout(&mut self, port: &mut Port) -> UpdateOutcome {
        match self.update(port, Command::Restart).await {
            Ok(outcome) => outcome,
            Err(_) => UpdateOutcome::RetryAfter(GPIO_RETRY_DELAY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::path::TopologyPath;
    use crate::model::port::{GpioAddr, PortId, PortKind};

    fn sample_port(path: &str) -> Port {
        Port::new(
            PortId(1),
            vec![path.parse::<TopologyPath>().unwrap()],
            PortKind::Gpio,
            BackendRef::Gpio {
                addr: GpioAddr::Path("/nonexistent/gpio/value".into()),
                on_val: b'1',
                off_val: b'0',
            },
        )
    }

    #[tokio::test]
    async fn disable_marks_power_off_even_if_write_fails() {
        let mut backend = GpioBackend::new();
        let mut port = sample_port("1-1");
        let outcome = backend.update(&mut port, Command::Disable).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Done);
        assert_eq!(port.power_state, PowerState::Off);
        assert!(!port.enabled);
    }

    #[tokio::test]
    async fn enable_marks_power_on_even_if_write_fails() {
        let mut backend = GpioBackend::new();
        let mut port = sample_port("1-1");
        port.mark_disabled();
        let outcome = backend.update(&mut port, Command::Enable).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Done);
        assert_eq!(port.power_state, PowerState::On);
        assert!(port.enabled);
    }

    #[tokio::test]
    async fn restart_on_missing_sysfs_path_retries() {
        let mut backend = GpioBackend::new();
        let mut port = sample_port("1-1");
        let outcome = backend.update(&mut port, Command::Restart).await.unwrap();
        assert_eq!(outcome, UpdateOutcome::RetryAfter(GPIO_RETRY_DELAY));
    }

    #[test]
    fn print_includes_sysfs_path() {
        let backend = GpioBackend::new();
        let port = sample_port("1-1");
        let line = backend.print(&port);
        assert!(line.contains("/nonexistent/gpio/value"));
    }
}
