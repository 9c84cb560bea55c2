//! Event handling for Bluetooth connection changes.
//!
//! This module provides the notification bus that carries
//! connect/disconnect notifications to the refresh coordinator, and the
//! listener registry shared with the published state store.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smallvec::SmallVec;

/// Notifications delivered by the Bluetooth stack.
///
/// They carry no device identity: a receiver only learns that the set of
/// connected devices may have changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum DeviceNotification {
   Connected,
   Disconnected,
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits a notification to all registered listeners.
   fn emit(&self, event: DeviceNotification);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct ListenerSet<T> {
   next_id: u64,
   entries: Vec<(u64, Listener<T>)>,
}

/// A list of callbacks that can be notified with a value of type `T`.
///
/// Registration hands back a [`Subscription`]; dropping it removes the
/// callback.
pub struct Listeners<T> {
   inner: Arc<Mutex<ListenerSet<T>>>,
}

impl<T> Default for Listeners<T> {
   fn default() -> Self {
      Self {
         inner: Arc::new(Mutex::new(ListenerSet {
            next_id: 0,
            entries: Vec::new(),
         })),
      }
   }
}

impl<T: 'static> Listeners<T> {
   pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
      let id = {
         let mut set = self.inner.lock();
         let id = set.next_id;
         set.next_id += 1;
         set.entries.push((id, Arc::new(listener)));
         id
      };

      let weak: Weak<Mutex<ListenerSet<T>>> = Arc::downgrade(&self.inner);
      Subscription {
         release: Some(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
               inner.lock().entries.retain(|(entry_id, _)| *entry_id != id);
            }
         })),
      }
   }

   /// Invokes every registered listener.
   ///
   /// The lock is released before the callbacks run, so a listener may
   /// subscribe or unsubscribe without deadlocking.
   pub fn notify(&self, value: &T) {
      let listeners: SmallVec<[Listener<T>; 4]> = self
         .inner
         .lock()
         .entries
         .iter()
         .map(|(_, listener)| listener.clone())
         .collect();
      for listener in listeners {
         listener(value);
      }
   }

   #[cfg(test)]
   pub fn count(&self) -> usize {
      self.inner.lock().entries.len()
   }
}

/// Registration handle; the listener is removed when this is dropped.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
   release: Option<Box<dyn FnOnce() + Send>>,
}

impl Drop for Subscription {
   fn drop(&mut self) {
      if let Some(release) = self.release.take() {
         release();
      }
   }
}

/// In-process bus for [`DeviceNotification`]s.
#[derive(Default)]
pub struct NotificationBus {
   listeners: Listeners<DeviceNotification>,
}

impl NotificationBus {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn subscribe(
      &self,
      listener: impl Fn(&DeviceNotification) + Send + Sync + 'static,
   ) -> Subscription {
      self.listeners.subscribe(listener)
   }

   #[cfg(test)]
   pub fn subscriber_count(&self) -> usize {
      self.listeners.count()
   }
}

impl EventBus for NotificationBus {
   fn emit(&self, event: DeviceNotification) {
      self.listeners.notify(&event);
   }
}
