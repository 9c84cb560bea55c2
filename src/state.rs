//! Published audio state.
//!
//! The store holds exactly one complete [`AudioState`] at a time. A new
//! snapshot replaces the old one in a single swap and listeners are handed
//! the whole snapshot, never individual fields.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::json;
use smol_str::SmolStr;

use crate::{
   codec::CodecLabel,
   event::{Listeners, Subscription},
};

/// Result of one completed scan.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AudioState {
   /// Display names of connected audio devices, in enumeration order.
   pub connected_devices: Vec<SmolStr>,
   pub current_codec: CodecLabel,
}

impl AudioState {
   /// Copy of this state with the codec replaced.
   pub fn with_codec(&self, current_codec: CodecLabel) -> Self {
      Self {
         connected_devices: self.connected_devices.clone(),
         current_codec,
      }
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "connected_devices": self
             .connected_devices
             .iter()
             .map(SmolStr::as_str)
             .collect::<Vec<_>>(),
          "current_codec": self.current_codec.to_string(),
      })
   }
}

/// Holder of the live snapshot plus the listeners interested in it.
#[derive(Default)]
pub struct StateStore {
   current: RwLock<Arc<AudioState>>,
   listeners: Listeners<Arc<AudioState>>,
}

impl StateStore {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   pub fn snapshot(&self) -> Arc<AudioState> {
      self.current.read().clone()
   }

   /// Registers a listener called with every newly published snapshot.
   pub fn subscribe(
      &self,
      listener: impl Fn(&Arc<AudioState>) + Send + Sync + 'static,
   ) -> Subscription {
      self.listeners.subscribe(listener)
   }

   /// Installs `state` as the live snapshot and notifies listeners.
   pub(crate) fn publish(&self, state: AudioState) -> Arc<AudioState> {
      let state = Arc::new(state);
      *self.current.write() = state.clone();
      self.listeners.notify(&state);
      state
   }
}
