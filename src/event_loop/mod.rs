//! Cooperative, single-threaded event loop.
//!
//! `spec.md` §4.1 describes a hand-rolled reactor multiplexing descriptor
//! readiness and a monotonic timer list. This crate realizes that reactor
//! on top of a single-threaded Tokio runtime instead of a raw `epoll` loop:
//!
//! - [`timers::Timers`] wraps `tokio_util::time::DelayQueue` for the timer
//!   list (ordered by expiry, idempotent cancellation, interval re-arm).
//! - Readiness for the Lanner tty and HTTP control socket flows through
//!   ordinary `tokio::io`/`tokio::net` types.
//! - The vendor-USB collaborator (`nusb`) is itself future-native, so the
//!   "single dispatch per iteration regardless of fd-set fan-out" rule from
//!   `spec.md` §5 has no raw fd-set to fan out in the first place: `nusb`'s
//!   hotplug watch stream and per-transfer futures are driven by the same
//!   cooperative, single-threaded executor as everything else, so they are
//!   automatically serialized with timer and HTTP processing.
//!
//! All time values used here are `tokio::time::Instant`, which is sourced
//! from the same monotonic clock the kernel uses for `CLOCK_MONOTONIC` —
//! never wall-clock time, so NTP/system-time adjustments cannot retrigger
//! or skip timers.
//!
//! The actual iteration body (the orchestration tying timers, the HTTP
//! listener, the USB hotplug stream, and the Lanner MCU tty together) lives
//! in [`crate::supervisor::Supervisor::run`], since it is the component
//! with enough context about ports and backends to decide what a given
//! readiness event means.

pub mod timers;
