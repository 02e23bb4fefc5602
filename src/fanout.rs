//! Multi-subscriber fan-out over the lifecycle callbacks.
//!
//! A [`Broadcaster`] is a [`PowerEventSink`] that republishes each lifecycle
//! callback to every subscriber over a bounded channel. Delivery never blocks
//! the run loop: a subscriber whose buffer is full is skipped with a warning,
//! and a subscriber whose receiver was dropped is pruned.

use std::sync::{
  mpsc::{sync_channel, Receiver, SyncSender, TrySendError},
  Arc, Mutex,
};

use tracing::{debug, warn};

use crate::PowerEventSink;

/// A lifecycle event as seen by subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
  /// The notification subsystem is live.
  Started,
  /// The system is about to sleep.
  WillSleep,
  /// The system is waking up.
  WillWake,
}

/// Per-subscriber buffer depth. A subscriber this far behind is skipped for
/// the event rather than stalling delivery to everyone else.
const SUBSCRIBER_BUFFER: usize = 8;

/// Fans lifecycle events out to any number of subscribers. Cheap to clone;
/// clones share the subscriber list, so one clone can be handed to the
/// monitor as its sink while others keep accepting subscriptions.
#[derive(Clone, Default)]
pub struct Broadcaster {
  subscribers: Arc<Mutex<Vec<SyncSender<PowerEvent>>>>,
}

impl Broadcaster {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers a new subscriber and returns its event channel. The channel
  /// ends when the broadcaster (every clone of it) is dropped; dropping the
  /// receiver is the way to unsubscribe.
  pub fn subscribe(&self) -> Receiver<PowerEvent> {
    let (tx, rx) = sync_channel(SUBSCRIBER_BUFFER);
    let mut subscribers = self.subscribers.lock().unwrap();
    subscribers.push(tx);
    debug!("power event subscriber added, now {}", subscribers.len());
    rx
  }

  fn publish(&self, event: PowerEvent) {
    let mut subscribers = self.subscribers.lock().unwrap();
    subscribers.retain(|tx| match tx.try_send(event) {
      Ok(()) => true,
      Err(TrySendError::Full(_)) => {
        warn!("slow power event subscriber skipped for {:?}", event);
        true
      }
      Err(TrySendError::Disconnected(_)) => {
        debug!("power event subscriber gone, pruning");
        false
      }
    });
  }
}

impl PowerEventSink for Broadcaster {
  fn started(&mut self) {
    self.publish(PowerEvent::Started);
  }

  fn will_sleep(&mut self) {
    self.publish(PowerEvent::WillSleep);
  }

  fn will_wake(&mut self) {
    self.publish(PowerEvent::WillWake);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn every_subscriber_receives_every_event() {
    let mut broadcaster = Broadcaster::new();
    let a = broadcaster.subscribe();
    let b = broadcaster.subscribe();

    broadcaster.started();
    broadcaster.will_sleep();
    broadcaster.will_wake();

    for rx in [a, b] {
      assert_eq!(rx.try_recv(), Ok(PowerEvent::Started));
      assert_eq!(rx.try_recv(), Ok(PowerEvent::WillSleep));
      assert_eq!(rx.try_recv(), Ok(PowerEvent::WillWake));
    }
  }

  #[test]
  fn a_full_subscriber_is_skipped_without_blocking() {
    let mut broadcaster = Broadcaster::new();
    let rx = broadcaster.subscribe();

    // One more than the buffer holds; the last publish must not block.
    for _ in 0..SUBSCRIBER_BUFFER + 1 {
      broadcaster.will_wake();
    }

    let received = rx.try_iter().count();
    assert_eq!(received, SUBSCRIBER_BUFFER);
    // Still subscribed: skipping is not eviction.
    assert_eq!(broadcaster.subscribers.lock().unwrap().len(), 1);
  }

  #[test]
  fn a_dropped_receiver_is_pruned() {
    let mut broadcaster = Broadcaster::new();
    drop(broadcaster.subscribe());
    let kept = broadcaster.subscribe();

    broadcaster.will_sleep();

    assert_eq!(kept.try_recv(), Ok(PowerEvent::WillSleep));
    assert_eq!(broadcaster.subscribers.lock().unwrap().len(), 1);
  }

  #[test]
  fn clones_share_the_subscriber_list() {
    let broadcaster = Broadcaster::new();
    let mut sink = broadcaster.clone();
    let rx = broadcaster.subscribe();

    sink.started();

    assert_eq!(rx.try_recv(), Ok(PowerEvent::Started));
  }
}
