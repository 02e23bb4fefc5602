#![warn(clippy::all)]

//! Observe operating-system power-state transitions (sleep, wake, and the
//! decision window before idle sleep) and forward them to the application as
//! a small set of lifecycle callbacks.
//!
//! The subsystem never vetoes sleep. Messages that require an acknowledgment
//! are always answered with "allow" before the callback returns, so the
//! platform's 30-second grace timer never runs out on our account.

pub mod dispatch;
pub mod fanout;
#[cfg(any(test, target_os = "macos"))]
pub(crate) mod unwind;

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
pub use macos::PowerMonitor;

pub use dispatch::PowerMessage;
pub use fanout::{Broadcaster, PowerEvent};

/// Receives power lifecycle notifications.
///
/// `started`, `will_sleep` and `will_wake` are the lifecycle callbacks proper;
/// `can_sleep` and `powered_on` are informational hooks for the two message
/// kinds that carry no lifecycle meaning. Every method defaults to a no-op.
///
/// Callbacks run on the run-loop thread, one at a time. `will_sleep` is
/// invoked before the sleep message is acknowledged, so it should return
/// promptly: the system holds off sleep only until the acknowledgment, at
/// most 30 seconds.
pub trait PowerEventSink: Send + 'static {
  /// The registration is live and the run loop has started processing
  /// events. Fired exactly once per registration.
  fn started(&mut self) {}

  /// The system asked permission for idle sleep. Sleep is always allowed;
  /// this is a pure observation point.
  fn can_sleep(&mut self) {}

  /// The system is definitely going to sleep.
  fn will_sleep(&mut self) {}

  /// The system has begun waking up.
  fn will_wake(&mut self) {}

  /// The system has finished waking up.
  fn powered_on(&mut self) {}
}

/// The power authority refused to hand back a usable connection. Fatal to
/// the registration attempt; the run loop is never driven.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct RegistrationError(pub(crate) String);

/// An acknowledgment call against the power authority failed. Best-effort:
/// logged and swallowed, since the platform proceeds on its own after the
/// grace window anyway.
#[derive(Debug, thiserror::Error)]
#[error("power change acknowledgment failed. code={code:08x}")]
pub struct AckError {
  pub(crate) code: i32,
}

/// A single teardown step failed. Non-fatal: the unwind continues with the
/// remaining steps.
#[derive(Debug, thiserror::Error)]
#[error("{step} failed. code={code:08x}")]
pub struct TeardownStepError {
  pub(crate) step: &'static str,
  pub(crate) code: i32,
}
