//! Bluetooth audio codec D-Bus service
//!
//! This service tracks which paired Bluetooth audio devices are connected
//! and which A2DP codec they negotiated, and publishes the result on the
//! session bus for desktop front-ends.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use smol_str::SmolStr;
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use bluetooth::{enumerator::BluezEnumerator, monitor::ConnectionMonitor};
use codec::LogCodecDetector;
use coordinator::{CoordinatorOptions, RefreshCoordinator};
use dbus::{CodecService, OBJECT_PATH, SERVICE_NAME};
use event::NotificationBus;
use state::AudioState;

mod bluetooth;
mod codec;
mod config;
mod coordinator;
mod dbus;
mod error;
mod event;
mod state;

use crate::{dbus::CodecServiceSignals, error::Result};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting CoCho codec service...");

   let config = config::Config::load()?;
   info!(
      "Loaded configuration (adapter: {}, log command: {})",
      config.adapter.as_deref().unwrap_or("default"),
      config.log_command.display()
   );

   let session = bluer::Session::new().await?;
   let adapter_name = config.adapter.as_deref().map(SmolStr::from);
   let notifications = NotificationBus::new();

   // Coordinator subscribes to notifications before the monitor starts emitting
   let coordinator = RefreshCoordinator::new(
      Arc::new(BluezEnumerator::new(session.clone(), adapter_name.clone())),
      Arc::new(LogCodecDetector::from_config(&config)),
      &notifications,
      CoordinatorOptions::from(&config),
   );

   let monitor = ConnectionMonitor::new(
      session,
      adapter_name,
      notifications.clone(),
      config.monitor_retry_delay(),
   )
   .spawn();

   let dispatcher = StateDispatcher::new();
   let state_subscription = coordinator.subscribe({
      let dispatcher = dispatcher.clone();
      move |state| dispatcher.push(state.clone())
   });

   let connection = connection::Builder::session()?
      .name(SERVICE_NAME)?
      .serve_at(OBJECT_PATH, CodecService::new(coordinator))?
      .build()
      .await?;

   info!("CoCho D-Bus service started at {SERVICE_NAME}");

   dispatcher.spawn_dispatcher(connection).await?;

   signal::ctrl_c().await?;
   info!("Shutting down CoCho service...");

   monitor.abort();
   drop(state_subscription);
   Ok(())
}

/// Forwards published snapshots to D-Bus signals.
struct StateDispatcher {
   queue: SegQueue<Arc<AudioState>>,
   notifier: Notify,
}

impl StateDispatcher {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }

   fn push(&self, state: Arc<AudioState>) {
      self.queue.push(state);
      self.notifier.notify_waiters();
   }

   /// Waits for the next snapshot, skipping any that were superseded.
   async fn recv(self: &Arc<Self>) -> Option<Arc<AudioState>> {
      loop {
         if let Some(state) = self.drain_latest() {
            return Some(state);
         }
         let notify = self.notifier.notified();
         if let Some(state) = self.drain_latest() {
            return Some(state);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   fn drain_latest(&self) -> Option<Arc<AudioState>> {
      let mut latest = None;
      while let Some(state) = self.queue.pop() {
         latest = Some(state);
      }
      latest
   }

   async fn dispatch(&self, iface: &InterfaceRef<CodecService>, state: &AudioState) -> Result<()> {
      iface.state_changed(&state.to_json().to_string()).await?;

      let emitter = iface.signal_emitter();
      let service = iface.get().await;
      service.connected_devices_changed(emitter).await?;
      service.current_codec_changed(emitter).await?;
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, CodecService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(state) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, &state).await {
               warn!("Error dispatching state change: {e}");
            }
         }
      });

      Ok(())
   }
}
