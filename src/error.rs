//! Crate-wide error taxonomy and the single fatal-exit funnel.
//!
//! `spec.md` §7 classifies failures as transient/administrative/structural/
//! unrecoverable/user-error. Transient and structural failures are handled
//! entirely inside the state machine and never surface as a Rust `Err` past
//! backend boundaries. Unrecoverable failures (Lanner's oversized reply,
//! an unparsable bitmask, a PID file already locked) go through [`fatal`]
//! instead of a scattered `std::process::exit` at each call site, per the
//! §9 design note.

use tracing::error;

/// Status returned by `Backend::update`, matching `spec.md` §7's "small
/// integer status" but typed.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendError {
    /// The backend rejected the command outright (HTTP maps this to 400).
    #[error("command rejected by backend")]
    Rejected,
    /// The backend is mid-transaction and the caller should retry (HTTP
    /// maps this to 503). Only the Lanner backend currently returns this.
    #[error("backend busy, retry")]
    Busy,
}

/// Logs `message` at error level and terminates the process. Used only for
/// the handful of conditions the original treats as unrecoverable: a
/// watchdog process is expected to restart the daemon, which re-derives
/// desired port state from config on the next sweep.
pub fn fatal(message: &str) -> ! {
    error!("{message}");
    std::process::exit(1);
}
