#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(non_upper_case_globals)]

//! Power Event Registrar for the macOS power authority.
//!
//! Registration opens the Root Power Domain service via
//! `IORegisterForSystemPower`, which also hands back the notification port
//! and the notifier handle. The port's run-loop source and a before-sources
//! observer are attached to a run loop on a dedicated thread, and the thread
//! then drives that loop until teardown stops it. Driving a dedicated loop
//! sidesteps the usual caveat about `CFRunLoopRun`: the main thread's loop
//! may already be owned by an application framework, and this subsystem must
//! never try to drive that one.

use std::{
  ffi::{c_int, c_long, c_ulong, c_void},
  marker::{PhantomData, PhantomPinned},
  ptr::{null, null_mut},
  sync::{mpsc, Arc, Barrier},
  thread::JoinHandle,
};

use tracing::{trace, warn};

use crate::{
  dispatch::{classify, Acknowledger, PowerMessage, StartGate},
  unwind::{unwind, UnwindSteps},
  AckError, PowerEventSink, RegistrationError, TeardownStepError,
};

/// A live registration with the power authority.
///
/// Construction registers for sleep/wake notifications and starts delivering
/// them to the sink; dropping the monitor deregisters, detaches everything
/// from the run loop in reverse attachment order, stops the loop, and joins
/// the loop thread. There is no partial teardown.
pub struct PowerMonitor {
  ctx: Option<RegistrationCtx>,
  run_loop_thread: Option<JoinHandle<()>>,
}

impl PowerMonitor {
  pub fn new<S>(sink: S) -> Result<Self, RegistrationError>
  where
    S: PowerEventSink,
  {
    let sink = Box::new(sink);

    // Registration happens on the thread that will own the run loop; the
    // channel reports whether it fully succeeded before the loop starts.
    let (tx, rx) = mpsc::channel();
    let barrier = Arc::new(Barrier::new(2));
    let thread_barrier = barrier.clone();
    let run_loop_thread = std::thread::spawn(move || run_loop_proc(sink, tx, thread_barrier));

    let ctx = rx.recv().unwrap()?;
    barrier.wait();

    Ok(Self {
      ctx: Some(ctx),
      run_loop_thread: Some(run_loop_thread),
    })
  }
}

impl Drop for PowerMonitor {
  fn drop(&mut self) {
    if let Some(mut ctx) = self.ctx.take() {
      unwind(&mut ctx);

      // The loop has been told to stop; wait for the thread to drain out
      // before releasing our interest in its run loop.
      if let Some(thread) = self.run_loop_thread.take() {
        if thread.join().is_err() {
          warn!("run loop thread panicked during shutdown");
        }
      }
    }
  }
}

/// Everything registration attached, bundled so teardown can unwind it from
/// another thread without reaching for process-wide globals.
struct RegistrationCtx {
  // Identity of the loop the observer and source are attached to. Retained
  // so the pointer stays valid until we are done unwinding.
  run_loop: CFRunLoopRef,
  observer: CFRunLoopObserverRef,
  notify_port: IONotificationPortRef,
  notifier: io_object_t,
  root_port: io_connect_t,
}

// SAFETY: the context is built on the run-loop thread and handed to the
// monitor, which is the only other place that touches it. CFRunLoop is
// documented as thread safe:
// <https://developer.apple.com/library/archive/documentation/Cocoa/Conceptual/Multithreading/RunLoopManagement/RunLoopManagement.html#//apple_ref/doc/uid/10000057i-CH16-SW26>
// and the IOKit handles are process-wide mach ports.
unsafe impl Send for RegistrationCtx {}

impl UnwindSteps for RegistrationCtx {
  fn remove_observer(&mut self) -> Result<(), TeardownStepError> {
    unsafe {
      CFRunLoopRemoveObserver(self.run_loop, self.observer, kCFRunLoopCommonModes);
      CFRelease(self.observer as *const c_void);
    }
    Ok(())
  }

  fn remove_source(&mut self) -> Result<(), TeardownStepError> {
    unsafe {
      CFRunLoopRemoveSource(
        self.run_loop,
        IONotificationPortGetRunLoopSource(self.notify_port),
        kCFRunLoopCommonModes,
      );
    }
    Ok(())
  }

  fn deregister(&mut self) -> Result<(), TeardownStepError> {
    let ret = unsafe { IODeregisterForSystemPower(&mut self.notifier) };
    if ret != kIOReturnSuccess {
      return Err(TeardownStepError {
        step: "IODeregisterForSystemPower",
        code: ret,
      });
    }
    Ok(())
  }

  fn close_connection(&mut self) -> Result<(), TeardownStepError> {
    // IORegisterForSystemPower implicitly opened the Root Power Domain
    // service, so it is closed here.
    let ret = unsafe { IOServiceClose(self.root_port) };
    if ret != kIOReturnSuccess {
      return Err(TeardownStepError {
        step: "IOServiceClose",
        code: ret,
      });
    }
    Ok(())
  }

  fn destroy_port(&mut self) -> Result<(), TeardownStepError> {
    unsafe { IONotificationPortDestroy(self.notify_port) };
    Ok(())
  }

  fn stop_loop(&mut self) {
    unsafe { CFRunLoopStop(self.run_loop) };
  }
}

impl Drop for RegistrationCtx {
  fn drop(&mut self) {
    // SAFETY: releases the retain taken by run_loop_proc when the context
    // was built.
    unsafe { CFRelease(self.run_loop as *const c_void) };
  }
}

/// State shared between the two run-loop callbacks, threaded through the
/// platform's user-data pointers instead of living in globals.
struct LoopState {
  sink: Box<dyn PowerEventSink>,
  gate: StartGate,
  root_port: io_connect_t,
}

fn run_loop_proc(
  sink: Box<dyn PowerEventSink>,
  tx: mpsc::Sender<Result<RegistrationCtx, RegistrationError>>,
  barrier: Arc<Barrier>,
) {
  // SAFETY: retain this thread's run loop; the RegistrationCtx owns the
  // retain and releases it once teardown is complete.
  let run_loop = unsafe {
    let run_loop = CFRunLoopGetCurrent();
    CFRetain(run_loop as *const c_void);
    run_loop
  };

  let mut state = Box::new(LoopState {
    sink,
    gate: StartGate::default(),
    root_port: 0,
  });
  let state_ptr = &mut *state as *mut LoopState;

  // SAFETY: the delivery callback cannot fire before CFRunLoopAddSource, so
  // capturing the connection into the state after the call returns is fine.
  let mut notify_port: IONotificationPortRef = null_mut();
  let mut notifier: io_object_t = 0;
  let root_port = unsafe {
    IORegisterForSystemPower(
      state_ptr as *mut c_void,
      &mut notify_port,
      power_message_callback,
      &mut notifier,
    )
  };
  if root_port == 0 {
    // SAFETY: registration failed before anything was attached; drop our
    // interest in the run loop again.
    unsafe { CFRelease(run_loop as *const c_void) };

    let _ = tx.send(Err(RegistrationError(
      "IORegisterForSystemPower returned a null connection".into(),
    )));
    return;
  }
  state.root_port = root_port;

  // Observer for the before-sources phase of every loop pass; the gate in
  // LoopState collapses it into the one-time started() signal.
  let mut observer_context = CFRunLoopObserverContext {
    version: 0,
    info: state_ptr as *mut c_void,
    retain: None,
    release: None,
    copyDescription: None,
  };
  let observer = unsafe {
    CFRunLoopObserverCreate(
      null(),
      kCFRunLoopBeforeSources,
      1, // repeats
      0,
      loop_phase_callback,
      &mut observer_context,
    )
  };
  if observer.is_null() {
    // Registration must fully succeed or leave nothing attached, so roll
    // back what IORegisterForSystemPower set up.
    unsafe {
      IODeregisterForSystemPower(&mut notifier);
      IOServiceClose(root_port);
      IONotificationPortDestroy(notify_port);
      CFRelease(run_loop as *const c_void);
    }

    let _ = tx.send(Err(RegistrationError(
      "CFRunLoopObserverCreate failed".into(),
    )));
    return;
  }

  unsafe {
    CFRunLoopAddObserver(run_loop, observer, kCFRunLoopCommonModes);
    CFRunLoopAddSource(
      run_loop,
      IONotificationPortGetRunLoopSource(notify_port),
      kCFRunLoopCommonModes,
    );
  }

  // Hand the fully-assembled registration to the monitor and wait for it to
  // take ownership before the loop starts.
  let ctx = RegistrationCtx {
    run_loop,
    observer,
    notify_port,
    notifier,
    root_port,
  };
  if tx.send(Ok(ctx)).is_err() {
    // The monitor is gone; nothing will ever stop the loop, so bail out.
    return;
  }
  drop(tx);
  barrier.wait();
  drop(barrier);

  // Drive the loop. This only returns after teardown has detached
  // everything and called CFRunLoopStop.
  unsafe { CFRunLoopRun() };

  trace!("run loop thread exiting");
}

extern "C" fn power_message_callback(
  refcon: *mut c_void,
  _service: io_service_t,
  messageType: u32,
  messageArgument: *mut c_void,
) {
  // SAFETY: refcon is the LoopState boxed in run_loop_proc, which outlives
  // every callback the loop delivers.
  let state = unsafe { &mut *(refcon as *mut LoopState) };

  let mut ack = PortAck {
    root_port: state.root_port,
  };
  classify(
    PowerMessage::from_raw(messageType),
    messageArgument,
    &mut *state.sink,
    &mut ack,
  );
}

extern "C" fn loop_phase_callback(
  _observer: CFRunLoopObserverRef,
  activity: CFRunLoopActivity,
  info: *mut c_void,
) {
  if activity & kCFRunLoopBeforeSources == 0 {
    return;
  }

  // SAFETY: info is the same LoopState as the delivery callback's refcon;
  // both run serialized on the loop thread.
  let state = unsafe { &mut *(info as *mut LoopState) };
  let LoopState { sink, gate, .. } = state;
  gate.fire(sink.as_mut());
}

/// Acknowledges pending power changes against the Root Power Domain
/// connection. Allow only: denying sleep is not part of this subsystem's
/// contract, and for a will-sleep message it would not work anyway.
struct PortAck {
  root_port: io_connect_t,
}

impl Acknowledger<*mut c_void> for PortAck {
  fn allow(&mut self, token: *mut c_void) -> Result<(), AckError> {
    let ret = unsafe { IOAllowPowerChange(self.root_port, token as *const c_void) };
    if ret != kIOReturnSuccess {
      return Err(AckError { code: ret });
    }
    Ok(())
  }
}

type natural_t = u32;
type mach_port_t = natural_t;
type io_object_t = mach_port_t;
type io_connect_t = io_object_t;
type io_service_t = io_object_t;
type kern_return_t = c_int;

//
// Core Foundation
//

type CFTypeRef = *const c_void;
type CFAllocatorRef = *const c_void;
type CFIndex = c_long;
type CFOptionFlags = c_ulong;
type Boolean = u8;

#[repr(C)]
struct __CFString(c_void);
type CFStringRef = *const __CFString;

#[repr(C)]
struct __CFRunLoop {
  _data: [u8; 0],
  _marker: PhantomData<(*mut u8, PhantomPinned)>,
}
type CFRunLoopRef = *mut __CFRunLoop;

#[repr(C)]
struct __CFRunLoopSource {
  _data: [u8; 0],
  _marker: PhantomData<(*mut u8, PhantomPinned)>,
}
type CFRunLoopSourceRef = *mut __CFRunLoopSource;

#[repr(C)]
struct __CFRunLoopObserver {
  _data: [u8; 0],
  _marker: PhantomData<(*mut u8, PhantomPinned)>,
}
type CFRunLoopObserverRef = *mut __CFRunLoopObserver;

type CFRunLoopMode = CFStringRef;
type CFRunLoopActivity = CFOptionFlags;

const kCFRunLoopBeforeSources: CFRunLoopActivity = 1 << 2;

#[repr(C)]
struct CFRunLoopObserverContext {
  version: CFIndex,
  info: *mut c_void,
  retain: Option<extern "C" fn(*const c_void) -> *const c_void>,
  release: Option<extern "C" fn(*const c_void)>,
  copyDescription: Option<extern "C" fn(*const c_void) -> CFTypeRef>,
}

type CFRunLoopObserverCallBack =
  extern "C" fn(observer: CFRunLoopObserverRef, activity: CFRunLoopActivity, info: *mut c_void);

#[cfg_attr(target_os = "macos", link(name = "CoreFoundation", kind = "framework"))]
extern "C" {
  static kCFRunLoopCommonModes: CFStringRef;

  fn CFRunLoopAddSource(rl: CFRunLoopRef, source: CFRunLoopSourceRef, mode: CFRunLoopMode);
  fn CFRunLoopRemoveSource(rl: CFRunLoopRef, source: CFRunLoopSourceRef, mode: CFRunLoopMode);
  fn CFRunLoopGetCurrent() -> CFRunLoopRef;
  fn CFRunLoopRun();
  fn CFRunLoopStop(rl: CFRunLoopRef);

  fn CFRunLoopObserverCreate(
    allocator: CFAllocatorRef,
    activities: CFOptionFlags,
    repeats: Boolean,
    order: CFIndex,
    callout: CFRunLoopObserverCallBack,
    context: *mut CFRunLoopObserverContext,
  ) -> CFRunLoopObserverRef;
  fn CFRunLoopAddObserver(rl: CFRunLoopRef, observer: CFRunLoopObserverRef, mode: CFRunLoopMode);
  fn CFRunLoopRemoveObserver(rl: CFRunLoopRef, observer: CFRunLoopObserverRef, mode: CFRunLoopMode);

  fn CFRetain(cf: CFTypeRef) -> CFTypeRef;
  fn CFRelease(cf: CFTypeRef);
}

//
// IOKit
//

const kIOReturnSuccess: i32 = 0;

type IOReturn = kern_return_t;

#[repr(C)]
struct IONotificationPort {
  _data: [u8; 0],
  _marker: PhantomData<(*mut u8, PhantomPinned)>,
}
type IONotificationPortRef = *mut IONotificationPort;

type IOServiceInterestCallback = unsafe extern "C" fn(
  refcon: *mut c_void,
  service: io_service_t,
  messageType: u32,
  messageArgument: *mut c_void,
);

#[cfg_attr(target_os = "macos", link(name = "IOKit", kind = "framework"))]
extern "C" {
  fn IORegisterForSystemPower(
    refcon: *mut c_void,
    thePortRef: *mut IONotificationPortRef,
    callback: IOServiceInterestCallback,
    notifier: *mut io_object_t,
  ) -> io_connect_t;
  fn IODeregisterForSystemPower(notifier: *mut io_object_t) -> IOReturn;

  fn IONotificationPortGetRunLoopSource(notify: IONotificationPortRef) -> CFRunLoopSourceRef;
  fn IONotificationPortDestroy(notify: IONotificationPortRef);

  fn IOAllowPowerChange(kernelPort: io_connect_t, notificationID: *const c_void) -> IOReturn;

  fn IOServiceClose(connect: io_connect_t) -> kern_return_t;
}
