use std::str::FromStr;

use log::info;
use serde_json::json;
use zbus::{interface, object_server::SignalEmitter};

use crate::{codec::CodecLabel, coordinator::RefreshCoordinator};

pub const SERVICE_NAME: &str = "org.cocho";
pub const OBJECT_PATH: &str = "/org/cocho/manager";

pub struct CodecService {
   coordinator: RefreshCoordinator,
}

impl CodecService {
   pub const fn new(coordinator: RefreshCoordinator) -> Self {
      Self { coordinator }
   }
}

#[interface(name = "org.cocho.Manager")]
impl CodecService {
   async fn refresh(&self) -> zbus::fdo::Result<bool> {
      self
         .coordinator
         .request_refresh()
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
      Ok(true)
   }

   /// Display-only: the shown codec changes, the negotiated one does not.
   async fn switch_codec(&self, label: String) -> zbus::fdo::Result<bool> {
      if label.trim().is_empty() {
         return Err(zbus::fdo::Error::InvalidArgs(
            "Codec label must not be empty".into(),
         ));
      }
      let Ok(codec) = CodecLabel::from_str(&label);

      self
         .coordinator
         .request_codec_switch(codec.clone())
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      info!("Requested display-only codec switch to {codec}");
      Ok(true)
   }

   async fn get_state(&self) -> String {
      self.coordinator.state().to_json().to_string()
   }

   async fn get_status(&self) -> zbus::fdo::Result<String> {
      let status = self
         .coordinator
         .status()
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
      Ok(json!({
          "phase": status.phase.to_string(),
          "pending_rerun": status.pending_rerun,
          "scans_completed": status.scans_completed,
      })
      .to_string())
   }

   // Signals
   #[zbus(signal)]
   pub async fn state_changed(emitter: &SignalEmitter<'_>, state: &str) -> zbus::Result<()>;

   // Properties
   #[zbus(property)]
   async fn connected_devices(&self) -> Vec<String> {
      self
         .coordinator
         .state()
         .connected_devices
         .iter()
         .map(ToString::to_string)
         .collect()
   }

   #[zbus(property)]
   async fn current_codec(&self) -> String {
      self.coordinator.state().current_codec.to_string()
   }

   #[zbus(property)]
   async fn available_codecs(&self) -> Vec<String> {
      RefreshCoordinator::available_codecs()
         .iter()
         .map(ToString::to_string)
         .collect()
   }
}
