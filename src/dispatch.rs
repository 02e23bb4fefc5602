#![allow(non_upper_case_globals)]

//! Power Event Dispatcher: classifies raw power-authority messages and maps
//! them onto [`PowerEventSink`] callbacks, issuing the mandatory "allow"
//! acknowledgment for the message kinds that require one.
//!
//! The classifier is a pure observer of the transition, never a policy gate:
//! it does not veto sleep, idle or mandatory. Denying `SystemWillSleep` would
//! not stop the sleep anyway, so "allow" is the only response ever issued.

use tracing::{debug, trace, warn};

use crate::{AckError, PowerEventSink};

// IOKit message codes are composed from a system/subsystem prefix, the same
// arithmetic IOKit/IOReturn.h uses.
const fn err_system(x: u32) -> u32 {
  (x & 0x3f) << 26
}
const fn err_sub(x: u32) -> u32 {
  (x & 0xfff) << 14
}
const fn iokit_common_msg(message: u32) -> u32 {
  err_system(0x38) | err_sub(0) | message
}

const kIOMessageCanSystemSleep: u32 = iokit_common_msg(0x270);
const kIOMessageSystemWillSleep: u32 = iokit_common_msg(0x280);
const kIOMessageSystemHasPoweredOn: u32 = iokit_common_msg(0x300);
const kIOMessageSystemWillPowerOn: u32 = iokit_common_msg(0x320);

/// A power-authority message, decoded from its raw wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMessage {
  /// Idle sleep wants to kick in; requires an acknowledgment within the
  /// platform's 30-second grace window. Not sent for forced sleep.
  CanSystemSleep,
  /// The system WILL go to sleep; same acknowledgment requirement. Denying
  /// it does not prevent the sleep, only delays it by the grace window.
  SystemWillSleep,
  /// The system has started the wake-up process.
  SystemWillPowerOn,
  /// The system has finished waking up.
  SystemHasPoweredOn,
  /// Anything else the authority might send; ignored.
  Other(u32),
}

impl PowerMessage {
  pub fn from_raw(raw: u32) -> Self {
    match raw {
      kIOMessageCanSystemSleep => PowerMessage::CanSystemSleep,
      kIOMessageSystemWillSleep => PowerMessage::SystemWillSleep,
      kIOMessageSystemWillPowerOn => PowerMessage::SystemWillPowerOn,
      kIOMessageSystemHasPoweredOn => PowerMessage::SystemHasPoweredOn,
      other => PowerMessage::Other(other),
    }
  }
}

/// Issues the "allow" acknowledgment for a pending power change. The token is
/// the opaque message argument the authority handed to the delivery callback
/// and must be passed back unchanged.
pub trait Acknowledger<T> {
  fn allow(&mut self, token: T) -> Result<(), AckError>;
}

/// State machine over message kinds. Runs on the loop's delivery
/// context, never concurrently with itself. Acknowledgments are issued before
/// returning, never deferred; a failed acknowledgment is logged and swallowed
/// since the platform proceeds on its own after the grace window.
///
/// Platform independent; useful on its own when the notification source is
/// attached to a loop driven by someone else.
pub fn classify<T, S, A>(msg: PowerMessage, token: T, sink: &mut S, ack: &mut A)
where
  T: Copy,
  S: PowerEventSink + ?Sized,
  A: Acknowledger<T>,
{
  trace!("power message: {:?}", msg);
  match msg {
    PowerMessage::CanSystemSleep => {
      // Never veto idle sleep. Observe, then allow.
      sink.can_sleep();
      if let Err(err) = ack.allow(token) {
        warn!("{err}");
      }
    }
    PowerMessage::SystemWillSleep => {
      // The callback must complete before the acknowledgment: once we
      // allow, the system is free to sleep out from under it.
      sink.will_sleep();
      if let Err(err) = ack.allow(token) {
        warn!("{err}");
      }
    }
    PowerMessage::SystemWillPowerOn => {
      sink.will_wake();
    }
    PowerMessage::SystemHasPoweredOn => {
      sink.powered_on();
    }
    PowerMessage::Other(raw) => {
      debug!("ignoring power message {:08x}", raw);
    }
  }
}

/// One-shot gate for the "loop is live" signal. The run-loop observer fires
/// on every pass through the before-sources phase, but `started` is a
/// one-time lifecycle signal, so the gate suppresses repeats itself rather
/// than pushing that burden onto the application.
#[derive(Default)]
pub struct StartGate {
  fired: bool,
}

impl StartGate {
  pub fn fire(&mut self, sink: &mut dyn PowerEventSink) {
    if !self.fired {
      self.fired = true;
      debug!("power notifications live");
      sink.started();
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::{Arc, Mutex};

  use super::*;

  // One shared log so callback/acknowledgment ordering is observable.
  type Log = Arc<Mutex<Vec<String>>>;

  struct RecordingSink {
    log: Log,
  }

  impl PowerEventSink for RecordingSink {
    fn started(&mut self) {
      self.log.lock().unwrap().push("started".into());
    }
    fn can_sleep(&mut self) {
      self.log.lock().unwrap().push("can_sleep".into());
    }
    fn will_sleep(&mut self) {
      self.log.lock().unwrap().push("will_sleep".into());
    }
    fn will_wake(&mut self) {
      self.log.lock().unwrap().push("will_wake".into());
    }
    fn powered_on(&mut self) {
      self.log.lock().unwrap().push("powered_on".into());
    }
  }

  struct RecordingAck {
    log: Log,
    fail: bool,
  }

  impl Acknowledger<u64> for RecordingAck {
    fn allow(&mut self, token: u64) -> Result<(), AckError> {
      self.log.lock().unwrap().push(format!("allow({token:#x})"));
      if self.fail {
        Err(AckError { code: -1 })
      } else {
        Ok(())
      }
    }
  }

  fn harness(fail_ack: bool) -> (RecordingSink, RecordingAck, Log) {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let sink = RecordingSink { log: log.clone() };
    let ack = RecordingAck {
      log: log.clone(),
      fail: fail_ack,
    };
    (sink, ack, log)
  }

  #[test]
  fn can_sleep_is_allowed_without_lifecycle_callback() {
    let (mut sink, mut ack, log) = harness(false);
    classify(PowerMessage::CanSystemSleep, 0x1u64, &mut sink, &mut ack);
    assert_eq!(*log.lock().unwrap(), vec!["can_sleep", "allow(0x1)"]);
  }

  #[test]
  fn will_sleep_fires_before_the_acknowledgment() {
    let (mut sink, mut ack, log) = harness(false);
    classify(PowerMessage::SystemWillSleep, 0x2u64, &mut sink, &mut ack);
    assert_eq!(*log.lock().unwrap(), vec!["will_sleep", "allow(0x2)"]);
  }

  #[test]
  fn will_power_on_fires_wake_and_nothing_else() {
    let (mut sink, mut ack, log) = harness(false);
    classify(PowerMessage::SystemWillPowerOn, 0u64, &mut sink, &mut ack);
    assert_eq!(*log.lock().unwrap(), vec!["will_wake"]);
  }

  #[test]
  fn has_powered_on_needs_no_acknowledgment() {
    let (mut sink, mut ack, log) = harness(false);
    classify(PowerMessage::SystemHasPoweredOn, 0u64, &mut sink, &mut ack);
    assert_eq!(*log.lock().unwrap(), vec!["powered_on"]);
  }

  #[test]
  fn unknown_messages_are_ignored() {
    let (mut sink, mut ack, log) = harness(false);
    classify(PowerMessage::Other(0xdead), 0u64, &mut sink, &mut ack);
    assert!(log.lock().unwrap().is_empty());
  }

  #[test]
  fn a_failed_acknowledgment_is_swallowed() {
    let (mut sink, mut ack, log) = harness(true);
    classify(PowerMessage::SystemWillSleep, 0x3u64, &mut sink, &mut ack);
    assert_eq!(*log.lock().unwrap(), vec!["will_sleep", "allow(0x3)"]);
  }

  #[test]
  fn start_gate_fires_exactly_once() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let mut sink = RecordingSink { log: log.clone() };
    let mut gate = StartGate::default();
    gate.fire(&mut sink);
    gate.fire(&mut sink);
    gate.fire(&mut sink);
    assert_eq!(*log.lock().unwrap(), vec!["started"]);
  }

  #[test]
  fn raw_codes_decode_to_the_right_kinds() {
    assert_eq!(
      PowerMessage::from_raw(0xe000_0270),
      PowerMessage::CanSystemSleep
    );
    assert_eq!(
      PowerMessage::from_raw(0xe000_0280),
      PowerMessage::SystemWillSleep
    );
    assert_eq!(
      PowerMessage::from_raw(0xe000_0320),
      PowerMessage::SystemWillPowerOn
    );
    assert_eq!(
      PowerMessage::from_raw(0xe000_0300),
      PowerMessage::SystemHasPoweredOn
    );
    assert_eq!(PowerMessage::from_raw(42), PowerMessage::Other(42));
  }
}
