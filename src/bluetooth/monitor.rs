//! Connection change notifications from BlueZ.
//!
//! Watches the `Connected` property of every device on the adapter and
//! turns changes into [`DeviceNotification`]s. Adapter loss is retried
//! with exponential backoff.

use std::{collections::HashMap, pin::pin, time::Duration};

use bluer::{
   Adapter, AdapterEvent, AdapterProperty, Address, DeviceEvent, DeviceProperty, Session,
};
use futures::stream::StreamExt;
use log::{debug, info, warn};
use rand::Rng;
use smol_str::SmolStr;
use tokio::{task::JoinHandle, time};

use crate::{
   error::Result,
   event::{DeviceNotification, EventSender},
};

/// Maximum delay between adapter recovery attempts
const MAX_RETRY_DELAY: Duration = Duration::from_secs(120);

/// Per-device watcher tasks, aborted when dropped.
#[derive(Default)]
struct DeviceWatchers(HashMap<Address, JoinHandle<()>>);

impl DeviceWatchers {
   fn remove(&mut self, addr: Address) {
      if let Some(handle) = self.0.remove(&addr) {
         handle.abort();
      }
   }
}

impl Drop for DeviceWatchers {
   fn drop(&mut self) {
      for handle in self.0.values() {
         handle.abort();
      }
   }
}

pub struct ConnectionMonitor {
   session: Session,
   adapter_name: Option<SmolStr>,
   event_tx: EventSender,
   retry_delay: Duration,
}

impl ConnectionMonitor {
   pub const fn new(
      session: Session,
      adapter_name: Option<SmolStr>,
      event_tx: EventSender,
      retry_delay: Duration,
   ) -> Self {
      Self {
         session,
         adapter_name,
         event_tx,
         retry_delay,
      }
   }

   pub fn spawn(self) -> JoinHandle<()> {
      tokio::spawn(self.run())
   }

   async fn run(self) {
      let mut retry_count = 0u32;
      loop {
         match self.watch_adapter().await {
            Ok(()) => {
               warn!("Adapter event stream ended");
               retry_count = 0;
               // Whatever was connected through this adapter is gone now
               self.event_tx.emit(DeviceNotification::Disconnected);
            },
            Err(e) => {
               warn!("Adapter monitoring failed: {e}");
               retry_count += 1;
            },
         }

         let delay = calc_retry_delay(self.retry_delay, retry_count);
         info!("Retrying adapter monitoring in {delay:?}");
         time::sleep(delay).await;
      }
   }

   async fn adapter(&self) -> Result<Adapter> {
      match &self.adapter_name {
         Some(name) => Ok(self.session.adapter(name)?),
         None => Ok(self.session.default_adapter().await?),
      }
   }

   async fn watch_adapter(&self) -> Result<()> {
      let adapter = self.adapter().await?;
      let events = adapter.events().await?;
      let mut events = pin!(events);

      let mut watchers = DeviceWatchers::default();
      for addr in adapter.device_addresses().await? {
         self.watch_device(&adapter, addr, &mut watchers);
      }
      info!(
         "Monitoring connections on {} ({} devices)",
         adapter.name(),
         watchers.0.len()
      );

      // Connections made before the watchers existed were not observed
      self.event_tx.emit(DeviceNotification::Connected);

      while let Some(event) = events.next().await {
         match &event {
            AdapterEvent::DeviceAdded(addr) => {
               debug!("Device added: {addr}");
               self.watch_device(&adapter, *addr, &mut watchers);
            },
            AdapterEvent::DeviceRemoved(addr) => {
               debug!("Device removed: {addr}");
               watchers.remove(*addr);
            },
            AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) => {
               info!("Adapter {} powered: {powered}", adapter.name());
            },
            _ => {},
         }
         if let Some(notification) = adapter_event_notification(&event) {
            self.event_tx.emit(notification);
         }
      }
      Ok(())
   }

   fn watch_device(&self, adapter: &Adapter, addr: Address, watchers: &mut DeviceWatchers) {
      if watchers.0.contains_key(&addr) {
         return;
      }
      let device = match adapter.device(addr) {
         Ok(device) => device,
         Err(e) => {
            debug!("Cannot watch {addr}: {e}");
            return;
         },
      };

      let event_tx = self.event_tx.clone();
      let handle = tokio::spawn(async move {
         let events = match device.events().await {
            Ok(events) => events,
            Err(e) => {
               debug!("No property events for {addr}: {e}");
               return;
            },
         };
         let mut events = pin!(events);

         // A change between enumeration and subscription produced no event
         match device.is_connected().await {
            Ok(connected) => event_tx.emit(connection_notification(connected)),
            Err(e) => debug!("Cannot read connection state of {addr}: {e}"),
         }

         while let Some(event) = events.next().await {
            if let Some(notification) = device_event_notification(&event) {
               debug!("Device {addr}: {notification}");
               event_tx.emit(notification);
            }
         }
      });
      watchers.0.insert(addr, handle);
   }
}

const fn connection_notification(connected: bool) -> DeviceNotification {
   if connected {
      DeviceNotification::Connected
   } else {
      DeviceNotification::Disconnected
   }
}

/// Maps an adapter event to the notification it implies, if any.
///
/// A newly added device may already be connected, so it counts as a
/// connection.
fn adapter_event_notification(event: &AdapterEvent) -> Option<DeviceNotification> {
   match event {
      AdapterEvent::DeviceAdded(_) => Some(DeviceNotification::Connected),
      AdapterEvent::DeviceRemoved(_) => Some(DeviceNotification::Disconnected),
      AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) => {
         Some(connection_notification(*powered))
      },
      _ => None,
   }
}

fn device_event_notification(event: &DeviceEvent) -> Option<DeviceNotification> {
   match event {
      DeviceEvent::PropertyChanged(DeviceProperty::Connected(connected)) => {
         Some(connection_notification(*connected))
      },
      _ => None,
   }
}

fn calc_retry_delay(base_delay: Duration, retry_count: u32) -> Duration {
   let exponential = base_delay.saturating_mul(1 << retry_count.min(4));
   let delay = exponential.min(MAX_RETRY_DELAY);
   let jitter = rand::thread_rng().gen_range(0..1000);
   delay + Duration::from_millis(jitter)
}
