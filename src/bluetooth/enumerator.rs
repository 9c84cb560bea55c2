//! Paired device enumeration.
//!
//! Each call asks BlueZ for the adapter's current view; nothing is cached
//! between calls.

use std::future::Future;

use bluer::{Adapter, Session};
use log::{debug, warn};
use smol_str::{SmolStr, ToSmolStr};

use super::device::{BluetoothDevice, ServiceNames, service_name};
use crate::error::Result;

/// Source of paired devices and their live connection state.
pub trait DeviceEnumerator: Send + Sync + 'static {
   /// Lists paired devices. An unavailable adapter yields an empty list.
   fn list_paired_devices(&self) -> impl Future<Output = Vec<BluetoothDevice>> + Send;
}

/// Enumerates paired devices through BlueZ.
pub struct BluezEnumerator {
   session: Session,
   adapter_name: Option<SmolStr>,
}

impl BluezEnumerator {
   pub const fn new(session: Session, adapter_name: Option<SmolStr>) -> Self {
      Self {
         session,
         adapter_name,
      }
   }

   async fn adapter(&self) -> Result<Adapter> {
      match &self.adapter_name {
         Some(name) => Ok(self.session.adapter(name)?),
         None => Ok(self.session.default_adapter().await?),
      }
   }

   async fn collect_paired(&self) -> Result<Vec<BluetoothDevice>> {
      let adapter = self.adapter().await?;
      let mut devices = Vec::new();

      for addr in adapter.device_addresses().await? {
         let Ok(device) = adapter.device(addr) else {
            continue;
         };
         if !device.is_paired().await.unwrap_or(false) {
            continue;
         }
         devices.push(snapshot_device(&device).await);
      }

      debug!(
         "Adapter {} reports {} paired devices",
         adapter.name(),
         devices.len()
      );
      Ok(devices)
   }
}

async fn snapshot_device(device: &bluer::Device) -> BluetoothDevice {
   let name = match device.alias().await {
      Ok(alias) if !alias.is_empty() => Some(SmolStr::from(alias)),
      _ => device.name().await.ok().flatten().map(SmolStr::from),
   };

   let mut service_names: ServiceNames = device
      .uuids()
      .await
      .ok()
      .flatten()
      .unwrap_or_default()
      .iter()
      .map(service_name)
      .collect();
   service_names.sort_unstable();
   service_names.dedup();

   BluetoothDevice {
      address: device.address().to_smolstr(),
      name,
      class_of_device: device.class().await.ok().flatten().unwrap_or(0),
      is_connected: device.is_connected().await.unwrap_or(false),
      service_names,
   }
}

impl DeviceEnumerator for BluezEnumerator {
   async fn list_paired_devices(&self) -> Vec<BluetoothDevice> {
      match self.collect_paired().await {
         Ok(devices) => devices,
         Err(e) => {
            warn!("Bluetooth adapter unavailable, reporting no devices: {e}");
            Vec::new()
         },
      }
   }
}
