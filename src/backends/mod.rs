//! Power-control backends.
//!
//! Each backend implements the same three-operation capability set the
//! original gives every port through function pointers (`output`, `update`,
//! `timeout`) — see the §9 design note on replacing `void*` callback data
//! with a typed capability set. Here that is the [`Backend`] trait,
//! implemented once per backend module and dispatched on
//! [`crate::model::port::PortKind`] by the supervisor.

pub mod generic_hub;
pub mod gpio;
pub mod lanner;
pub mod ykush;

pub use gpio::GpioBackend;

use std::time::Duration;

use crate::error::BackendError;
use crate::model::port::Port;

/// Commands a port can receive, either from the HTTP control surface or
/// from the liveness/restart state machine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Restart,
    Enable,
    Disable,
}

/// What the supervisor should do after a backend operation returns.
/// Replaces the original's pattern of each handler calling
/// `usb_helpers_start_timeout` directly on the shared timer list — here the
/// backend reports its wish and the supervisor (which owns the timer wheel)
/// carries it out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The operation reached a stable end state; any existing timer on this
    /// port should be left alone (or was already adjusted by the backend
    /// via the port's own fields).
    Done,
    /// The backend could not complete the operation (a sysfs write failed,
    /// an MCU reply is still pending) and should be retried after `Duration`.
    RetryAfter(Duration),
}

/// A backend's per-port update/timeout entry points, mirroring the
/// original's per-port `update`/`timeout` function pointers. Where the
/// original passed a `struct usb_port *` and let the callback reach into it
/// through an unsafe downcast, here the supervisor passes the concrete
/// [`Port`] by mutable reference and the backend mutates its
/// `power_state`/`msg_mode`/`retrans_count` fields directly.
#[async_trait::async_trait(?Send)]
pub trait Backend {
    /// Formats a one-line status string for this port, mirroring
    /// `usb_helpers_print_port`'s per-backend `output` callback.
    fn print(&self, port: &Port) -> String;

    /// Applies `cmd` to `port`. Returns the follow-up the supervisor should
    /// schedule, or a [`BackendError`] the HTTP surface maps to a status
    /// code.
    async fn update(&mut self, port: &mut Port, cmd: Command) -> Result<UpdateOutcome, BackendError>;

    /// Invoked when a port's armed timer fires while that timer was not
    /// claimed by the generic liveness-ping logic in the supervisor.
    async fn timeout(&mut self, port: &mut Port) -> UpdateOutcome;
}
