#![forbid(unsafe_code)]
#![warn(clippy::all)]

//! Prints sleep/wake transitions until interrupted. macOS only.

#[cfg(target_os = "macos")]
#[tokio::main]
async fn main() {
  use sleepwatch::{PowerEventSink, PowerMonitor};
  use tracing::info;

  struct Printer {}
  impl PowerEventSink for Printer {
    fn started(&mut self) {
      info!("listening for power events");
    }

    fn can_sleep(&mut self) {
      info!("idle sleep requested, allowing");
    }

    fn will_sleep(&mut self) {
      info!("going to sleep");
    }

    fn will_wake(&mut self) {
      info!("waking up");
    }

    fn powered_on(&mut self) {
      info!("awake");
    }
  }

  tracing_subscriber::fmt().init();

  let monitor = PowerMonitor::new(Printer {}).expect("failed to register for power notifications");

  info!("watching. Ctrl-C to stop");
  tokio::signal::ctrl_c().await.unwrap();
  info!("unregistering");
  drop(monitor);
}

#[cfg(not(target_os = "macos"))]
fn main() {
  eprintln!("this demo only runs on macOS");
}
