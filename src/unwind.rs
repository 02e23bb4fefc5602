//! Teardown sequencing for a live registration.
//!
//! Unwinding mirrors registration in reverse: observer off the loop first,
//! then the notification source, then the deregistration with the power
//! authority, then the connection, then the port itself. Each step is
//! best-effort; a failure is logged and the unwind keeps going, because the
//! loop-stop at the end is what unblocks the thread driving the loop and it
//! must always be reached.

use tracing::{debug, warn};

use crate::TeardownStepError;

/// The five resource steps plus the final loop-stop, in attachment-reverse
/// order. Implemented by the platform registration context; implemented by a
/// recorder in tests.
pub(crate) trait UnwindSteps {
  fn remove_observer(&mut self) -> Result<(), TeardownStepError>;
  fn remove_source(&mut self) -> Result<(), TeardownStepError>;
  fn deregister(&mut self) -> Result<(), TeardownStepError>;
  fn close_connection(&mut self) -> Result<(), TeardownStepError>;
  fn destroy_port(&mut self) -> Result<(), TeardownStepError>;
  fn stop_loop(&mut self);
}

pub(crate) fn unwind<S: UnwindSteps + ?Sized>(steps: &mut S) {
  let sequence: [(&str, fn(&mut S) -> Result<(), TeardownStepError>); 5] = [
    ("remove observer", S::remove_observer),
    ("remove source", S::remove_source),
    ("deregister", S::deregister),
    ("close connection", S::close_connection),
    ("destroy port", S::destroy_port),
  ];
  for (name, step) in sequence {
    if let Err(err) = step(steps) {
      warn!("teardown step '{name}' failed: {err}");
    }
  }
  // Always last: the registering thread is blocked on the loop.
  debug!("stopping power notification run loop");
  steps.stop_loop();
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Recorder {
    calls: Vec<&'static str>,
    fail_everything: bool,
  }

  impl Recorder {
    fn step(&mut self, name: &'static str) -> Result<(), TeardownStepError> {
      self.calls.push(name);
      if self.fail_everything {
        Err(TeardownStepError { step: name, code: -1 })
      } else {
        Ok(())
      }
    }
  }

  impl UnwindSteps for Recorder {
    fn remove_observer(&mut self) -> Result<(), TeardownStepError> {
      self.step("remove_observer")
    }
    fn remove_source(&mut self) -> Result<(), TeardownStepError> {
      self.step("remove_source")
    }
    fn deregister(&mut self) -> Result<(), TeardownStepError> {
      self.step("deregister")
    }
    fn close_connection(&mut self) -> Result<(), TeardownStepError> {
      self.step("close_connection")
    }
    fn destroy_port(&mut self) -> Result<(), TeardownStepError> {
      self.step("destroy_port")
    }
    fn stop_loop(&mut self) {
      self.calls.push("stop_loop");
    }
  }

  const EXPECTED: [&str; 6] = [
    "remove_observer",
    "remove_source",
    "deregister",
    "close_connection",
    "destroy_port",
    "stop_loop",
  ];

  #[test]
  fn all_steps_run_in_reverse_attachment_order() {
    let mut recorder = Recorder {
      calls: Vec::new(),
      fail_everything: false,
    };
    unwind(&mut recorder);
    assert_eq!(recorder.calls, EXPECTED);
  }

  #[test]
  fn failures_never_short_circuit_and_the_loop_still_stops() {
    let mut recorder = Recorder {
      calls: Vec::new(),
      fail_everything: true,
    };
    unwind(&mut recorder);
    assert_eq!(recorder.calls, EXPECTED);
  }
}
