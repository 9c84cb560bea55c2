//! Refresh coordination.
//!
//! A single actor owns the scan phase, the pending-rerun flag and the
//! right to publish. Triggers (manual refreshes and connection
//! notifications) that arrive while a scan is running are coalesced into
//! at most one follow-up scan. Scans run on worker tasks; their results
//! come back through the actor, which installs them in one swap.

use std::{fmt, sync::Arc, time::Duration};

use log::{debug, info, warn};
use strum::VariantArray;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   time,
};

use crate::{
   bluetooth::{classifier::is_audio_device, device::BluetoothDevice, enumerator::DeviceEnumerator},
   codec::{self, CodecDetector, CodecLabel, KnownCodec},
   config::Config,
   error::{CodecError, Result},
   event::{DeviceNotification, NotificationBus, Subscription},
   state::{AudioState, StateStore},
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Phase {
   Idle,
   Scanning,
}

/// What caused a scan request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
   Manual,
   Notification(DeviceNotification),
}

impl fmt::Display for Trigger {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::Manual => f.write_str("manual refresh"),
         Self::Notification(notification) => write!(f, "device {notification} notification"),
      }
   }
}

/// Point-in-time view of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorStatus {
   pub phase: Phase,
   pub pending_rerun: bool,
   pub scans_completed: u64,
}

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
   /// Delay before a display-only codec switch is shown.
   pub codec_switch_delay: Duration,
   /// Fall back to a service-based guess when the log query finds nothing.
   pub service_codec_fallback: bool,
}

impl Default for CoordinatorOptions {
   fn default() -> Self {
      Self::from(&Config::default())
   }
}

impl From<&Config> for CoordinatorOptions {
   fn from(config: &Config) -> Self {
      Self {
         codec_switch_delay: config.codec_switch_delay(),
         service_codec_fallback: config.service_codec_fallback,
      }
   }
}

// === Commands ===

#[derive(Debug)]
enum CoordinatorCommand {
   Trigger(Trigger),
   ScanCompleted(AudioState),
   ScanAborted(CodecError),
   SwitchCodec(CodecLabel),
   ApplyCodecOverride { label: CodecLabel, scans_completed: u64 },
   GetStatus(oneshot::Sender<CoordinatorStatus>),
}

// === Handle ===

/// Handle to the refresh coordinator.
///
/// Cheap to clone. The coordinator stops, and unsubscribes from the
/// notification bus, once every handle is dropped.
#[derive(Clone)]
pub struct RefreshCoordinator {
   inbox: mpsc::Sender<CoordinatorCommand>,
   store: Arc<StateStore>,
}

impl RefreshCoordinator {
   /// Starts the coordinator and runs the initial scan.
   ///
   /// Must be called from within a Tokio runtime.
   pub fn new<E, D>(
      enumerator: Arc<E>,
      detector: Arc<D>,
      bus: &NotificationBus,
      options: CoordinatorOptions,
   ) -> Self
   where
      E: DeviceEnumerator,
      D: CodecDetector,
   {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let store = StateStore::new();

      let weak_inbox = command_tx.downgrade();
      let subscription = bus.subscribe(move |event| {
         let Some(inbox) = weak_inbox.upgrade() else {
            return;
         };
         let cmd = CoordinatorCommand::Trigger(Trigger::Notification(*event));
         if let Err(e) = inbox.try_send(cmd) {
            warn!("Dropped {event} notification: {e}");
         }
      });

      tokio::spawn(
         CoordinatorActor {
            enumerator,
            detector,
            options,
            store: store.clone(),
            command_rx,
            loopback_rx,
            loopback_tx,
            _subscription: subscription,
            phase: Phase::Idle,
            pending_rerun: false,
            scans_completed: 0,
         }
         .run(),
      );
      Self {
         inbox: command_tx,
         store,
      }
   }

   async fn send(&self, command: CoordinatorCommand) -> Result<()> {
      self
         .inbox
         .send(command)
         .await
         .map_err(|_| CodecError::CoordinatorShutdown)
   }

   /// Requests a scan; coalesced with any scan already running.
   pub async fn request_refresh(&self) -> Result<()> {
      self.send(CoordinatorCommand::Trigger(Trigger::Manual)).await
   }

   /// Shows `label` as the current codec after a short delay.
   ///
   /// This is a display-only override. Nothing is sent to the device and
   /// the next completed scan replaces it with the detected codec.
   pub async fn request_codec_switch(&self, label: CodecLabel) -> Result<()> {
      self.send(CoordinatorCommand::SwitchCodec(label)).await
   }

   pub async fn status(&self) -> Result<CoordinatorStatus> {
      let (tx, rx) = oneshot::channel();
      self.send(CoordinatorCommand::GetStatus(tx)).await?;
      rx.await.map_err(|_| CodecError::CoordinatorShutdown)
   }

   /// The live snapshot.
   pub fn state(&self) -> Arc<AudioState> {
      self.store.snapshot()
   }

   pub fn subscribe(
      &self,
      listener: impl Fn(&Arc<AudioState>) + Send + Sync + 'static,
   ) -> Subscription {
      self.store.subscribe(listener)
   }

   /// Codecs offered for a display-only switch.
   pub const fn available_codecs() -> &'static [KnownCodec] {
      KnownCodec::VARIANTS
   }
}

// === Actor ===

struct CoordinatorActor<E, D> {
   enumerator: Arc<E>,
   detector: Arc<D>,
   options: CoordinatorOptions,
   store: Arc<StateStore>,
   command_rx: mpsc::Receiver<CoordinatorCommand>,
   loopback_rx: mpsc::Receiver<CoordinatorCommand>,
   loopback_tx: mpsc::Sender<CoordinatorCommand>,
   _subscription: Subscription,

   // State
   phase: Phase,
   pending_rerun: bool,
   scans_completed: u64, // also tags codec overrides
}

impl<E: DeviceEnumerator, D: CodecDetector> CoordinatorActor<E, D> {
   async fn run(mut self) {
      info!("Refresh coordinator starting up");
      self.start_scan();

      loop {
         select! {
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Refresh coordinator shutting down");
                     break;
                 };
                 self.handle_command(cmd);
             }
             Some(cmd) = self.loopback_rx.recv() => {
                 self.handle_command(cmd);
             }
         }
      }
   }

   fn handle_command(&mut self, cmd: CoordinatorCommand) {
      match cmd {
         CoordinatorCommand::Trigger(trigger) => self.handle_trigger(trigger),
         CoordinatorCommand::ScanCompleted(state) => {
            self.scans_completed += 1;
            let state = self.store.publish(state);
            info!(
               "Published state: devices={:?} codec={}",
               state.connected_devices, state.current_codec
            );
            self.finish_scan();
         },
         CoordinatorCommand::ScanAborted(e) => {
            warn!("Scan did not complete, keeping previous state: {e}");
            self.finish_scan();
         },
         CoordinatorCommand::SwitchCodec(label) => self.schedule_codec_override(label),
         CoordinatorCommand::ApplyCodecOverride {
            label,
            scans_completed,
         } => {
            if scans_completed == self.scans_completed {
               info!("Showing codec {label} (display only)");
               let state = self.store.snapshot().with_codec(label);
               self.store.publish(state);
            } else {
               debug!("Codec override {label} superseded by a newer scan");
            }
         },
         CoordinatorCommand::GetStatus(reply) => {
            let _ = reply.send(CoordinatorStatus {
               phase: self.phase,
               pending_rerun: self.pending_rerun,
               scans_completed: self.scans_completed,
            });
         },
      }
   }

   fn handle_trigger(&mut self, trigger: Trigger) {
      match self.phase {
         Phase::Idle => {
            debug!("Scan triggered by {trigger}");
            self.start_scan();
         },
         Phase::Scanning => {
            debug!("Scan in progress, coalescing {trigger}");
            self.pending_rerun = true;
         },
      }
   }

   fn finish_scan(&mut self) {
      if self.pending_rerun {
         self.pending_rerun = false;
         self.start_scan();
      } else {
         self.phase = Phase::Idle;
      }
   }

   fn start_scan(&mut self) {
      self.phase = Phase::Scanning;

      let handle = tokio::spawn(scan(
         self.enumerator.clone(),
         self.detector.clone(),
         self.options.service_codec_fallback,
      ));
      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         let cmd = match handle.await {
            Ok(state) => CoordinatorCommand::ScanCompleted(state),
            Err(e) => CoordinatorCommand::ScanAborted(CodecError::ScanAborted(e)),
         };
         if loopback.send(cmd).await.is_err() {
            debug!("Coordinator gone before scan finished");
         }
      });
   }

   fn schedule_codec_override(&self, label: CodecLabel) {
      info!("Codec switch to {label} requested (display only, no device control)");
      let loopback = self.loopback_tx.clone();
      let delay = self.options.codec_switch_delay;
      let scans_completed = self.scans_completed;
      tokio::spawn(async move {
         time::sleep(delay).await;
         let _ = loopback
            .send(CoordinatorCommand::ApplyCodecOverride {
               label,
               scans_completed,
            })
            .await;
      });
   }
}

/// Runs one complete scan and returns the state to publish.
async fn scan<E: DeviceEnumerator, D: CodecDetector>(
   enumerator: Arc<E>,
   detector: Arc<D>,
   service_codec_fallback: bool,
) -> AudioState {
   let audio_devices: Vec<BluetoothDevice> = enumerator
      .list_paired_devices()
      .await
      .into_iter()
      .filter(|device| device.is_connected && is_audio_device(device))
      .collect();

   let current_codec = if audio_devices.is_empty() {
      CodecLabel::NoDevice
   } else {
      match detector.detect_codec().await {
         CodecLabel::Unknown if service_codec_fallback => {
            codec::guess_codec_from_services(&audio_devices)
         },
         detected => detected,
      }
   };

   AudioState {
      connected_devices: audio_devices
         .iter()
         .map(BluetoothDevice::display_name)
         .collect(),
      current_codec,
   }
}

#[cfg(test)]
mod tests {
   use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

   use parking_lot::Mutex;
   use smol_str::SmolStr;
   use tokio::sync::Semaphore;

   use super::*;
   use crate::{bluetooth::device::ServiceNames, event::EventBus};

   const HEADPHONES_COD: u32 = 0x0024_0418;
   const KEYBOARD_COD: u32 = 0x0000_2540;

   fn device(name: &'static str, class_of_device: u32, is_connected: bool) -> BluetoothDevice {
      BluetoothDevice {
         address: SmolStr::new_static("AA:BB:CC:DD:EE:FF"),
         name: Some(SmolStr::new_static(name)),
         class_of_device,
         is_connected,
         service_names: ServiceNames::new(),
      }
   }

   #[derive(Default)]
   struct MockEnumerator {
      devices: Mutex<Vec<BluetoothDevice>>,
      calls: AtomicUsize,
      gate: Option<Semaphore>,
      panic_on_call: AtomicBool,
   }

   impl MockEnumerator {
      fn with_devices(devices: Vec<BluetoothDevice>) -> Self {
         Self {
            devices: Mutex::new(devices),
            ..Default::default()
         }
      }

      fn gated(mut self) -> Self {
         self.gate = Some(Semaphore::new(0));
         self
      }

      fn calls(&self) -> usize {
         self.calls.load(Ordering::SeqCst)
      }
   }

   impl DeviceEnumerator for MockEnumerator {
      async fn list_paired_devices(&self) -> Vec<BluetoothDevice> {
         self.calls.fetch_add(1, Ordering::SeqCst);
         if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
         }
         if self.panic_on_call.load(Ordering::SeqCst) {
            panic!("adapter exploded");
         }
         self.devices.lock().clone()
      }
   }

   struct MockDetector {
      codec: CodecLabel,
      calls: AtomicUsize,
   }

   impl MockDetector {
      fn new(codec: impl Into<CodecLabel>) -> Self {
         Self {
            codec: codec.into(),
            calls: AtomicUsize::new(0),
         }
      }

      fn calls(&self) -> usize {
         self.calls.load(Ordering::SeqCst)
      }
   }

   impl CodecDetector for MockDetector {
      async fn detect_codec(&self) -> CodecLabel {
         self.calls.fetch_add(1, Ordering::SeqCst);
         self.codec.clone()
      }
   }

   fn options(service_codec_fallback: bool) -> CoordinatorOptions {
      CoordinatorOptions {
         codec_switch_delay: Duration::from_millis(50),
         service_codec_fallback,
      }
   }

   async fn wait_until_settled(coordinator: &RefreshCoordinator, scans: u64) -> CoordinatorStatus {
      time::timeout(Duration::from_secs(5), async {
         loop {
            let status = coordinator.status().await.unwrap();
            if status.phase == Phase::Idle && status.scans_completed >= scans {
               return status;
            }
            time::sleep(Duration::from_millis(5)).await;
         }
      })
      .await
      .expect("coordinator did not settle")
   }

   #[tokio::test]
   async fn test_initial_scan_publishes_audio_devices() {
      let enumerator = Arc::new(MockEnumerator::with_devices(vec![
         device("Headphones", HEADPHONES_COD, true),
         device("Keyboard", KEYBOARD_COD, true),
         device("Speaker", HEADPHONES_COD, false),
      ]));
      let detector = Arc::new(MockDetector::new(KnownCodec::Ldac));
      let bus = NotificationBus::new();

      let coordinator =
         RefreshCoordinator::new(enumerator.clone(), detector.clone(), &bus, options(false));
      let status = wait_until_settled(&coordinator, 1).await;

      assert_eq!(status.scans_completed, 1);
      assert!(!status.pending_rerun);
      let state = coordinator.state();
      assert_eq!(state.connected_devices, vec![SmolStr::new_static("Headphones")]);
      assert_eq!(state.current_codec, KnownCodec::Ldac.into());
      assert_eq!(detector.calls(), 1);
   }

   #[tokio::test]
   async fn test_no_audio_device_skips_log_query() {
      let enumerator = Arc::new(MockEnumerator::with_devices(vec![
         device("Keyboard", KEYBOARD_COD, true),
         device("Headphones", HEADPHONES_COD, false),
      ]));
      let detector = Arc::new(MockDetector::new(KnownCodec::Aac));
      let bus = NotificationBus::new();

      let coordinator =
         RefreshCoordinator::new(enumerator.clone(), detector.clone(), &bus, options(false));
      wait_until_settled(&coordinator, 1).await;

      let state = coordinator.state();
      assert!(state.connected_devices.is_empty());
      assert_eq!(state.current_codec, CodecLabel::NoDevice);
      assert_eq!(detector.calls(), 0);
   }

   #[tokio::test]
   async fn test_triggers_during_scan_coalesce_into_one_rerun() {
      let enumerator = Arc::new(
         MockEnumerator::with_devices(vec![device("Headphones", HEADPHONES_COD, true)]).gated(),
      );
      let detector = Arc::new(MockDetector::new(KnownCodec::Sbc));
      let bus = NotificationBus::new();

      let coordinator =
         RefreshCoordinator::new(enumerator.clone(), detector.clone(), &bus, options(false));

      // Initial scan is blocked on the gate
      coordinator.request_refresh().await.unwrap();
      bus.emit(DeviceNotification::Connected);
      bus.emit(DeviceNotification::Disconnected);

      let status = coordinator.status().await.unwrap();
      assert_eq!(status.phase, Phase::Scanning);
      assert!(status.pending_rerun);
      assert_eq!(status.scans_completed, 0);

      enumerator.gate.as_ref().unwrap().add_permits(10);
      let status = wait_until_settled(&coordinator, 2).await;
      assert_eq!(status.scans_completed, 2);

      time::sleep(Duration::from_millis(50)).await;
      assert_eq!(enumerator.calls(), 2);
      assert_eq!(detector.calls(), 2);
      assert_eq!(coordinator.status().await.unwrap().scans_completed, 2);
   }

   #[tokio::test]
   async fn test_trigger_while_idle_starts_scan() {
      let enumerator = Arc::new(MockEnumerator::default());
      let detector = Arc::new(MockDetector::new(KnownCodec::Sbc));
      let bus = NotificationBus::new();

      let coordinator =
         RefreshCoordinator::new(enumerator.clone(), detector.clone(), &bus, options(false));
      wait_until_settled(&coordinator, 1).await;

      enumerator
         .devices
         .lock()
         .push(device("Headphones", HEADPHONES_COD, true));
      bus.emit(DeviceNotification::Connected);
      wait_until_settled(&coordinator, 2).await;

      assert_eq!(enumerator.calls(), 2);
      assert_eq!(coordinator.state().current_codec, KnownCodec::Sbc.into());
   }

   #[tokio::test]
   async fn test_codec_switch_is_display_only_override() {
      let enumerator = Arc::new(MockEnumerator::with_devices(vec![device(
         "Headphones",
         HEADPHONES_COD,
         true,
      )]));
      let detector = Arc::new(MockDetector::new(KnownCodec::Ldac));
      let bus = NotificationBus::new();

      let coordinator =
         RefreshCoordinator::new(enumerator.clone(), detector.clone(), &bus, options(false));
      wait_until_settled(&coordinator, 1).await;

      coordinator
         .request_codec_switch(KnownCodec::AptX.into())
         .await
         .unwrap();
      // Not applied before the delay
      assert_eq!(coordinator.state().current_codec, KnownCodec::Ldac.into());

      time::sleep(Duration::from_millis(200)).await;
      let state = coordinator.state();
      assert_eq!(state.current_codec, KnownCodec::AptX.into());
      assert_eq!(state.connected_devices, vec![SmolStr::new_static("Headphones")]);
      assert_eq!(enumerator.calls(), 1);
      assert_eq!(detector.calls(), 1);
   }

   #[tokio::test]
   async fn test_refresh_after_codec_switch_wins() {
      let enumerator = Arc::new(MockEnumerator::with_devices(vec![device(
         "Headphones",
         HEADPHONES_COD,
         true,
      )]));
      let detector = Arc::new(MockDetector::new(KnownCodec::Ldac));
      let bus = NotificationBus::new();

      let coordinator =
         RefreshCoordinator::new(enumerator.clone(), detector.clone(), &bus, options(false));
      wait_until_settled(&coordinator, 1).await;

      coordinator
         .request_codec_switch(KnownCodec::Aac.into())
         .await
         .unwrap();
      coordinator.request_refresh().await.unwrap();
      wait_until_settled(&coordinator, 2).await;

      time::sleep(Duration::from_millis(200)).await;
      assert_eq!(coordinator.state().current_codec, KnownCodec::Ldac.into());
   }

   #[tokio::test]
   async fn test_service_fallback_when_logs_are_silent() {
      let mut headphones = device("Headphones", HEADPHONES_COD, true);
      headphones
         .service_names
         .push(SmolStr::new_static("Advanced Audio Distribution (A2DP)"));
      let bus = NotificationBus::new();

      let coordinator = RefreshCoordinator::new(
         Arc::new(MockEnumerator::with_devices(vec![headphones.clone()])),
         Arc::new(MockDetector::new(CodecLabel::Unknown)),
         &bus,
         options(true),
      );
      wait_until_settled(&coordinator, 1).await;
      assert_eq!(coordinator.state().current_codec, KnownCodec::Aac.into());

      let strict = RefreshCoordinator::new(
         Arc::new(MockEnumerator::with_devices(vec![headphones])),
         Arc::new(MockDetector::new(CodecLabel::Unknown)),
         &bus,
         options(false),
      );
      wait_until_settled(&strict, 1).await;
      assert_eq!(strict.state().current_codec, CodecLabel::Unknown);
   }

   #[tokio::test]
   async fn test_aborted_scan_keeps_previous_state() {
      let enumerator = Arc::new(MockEnumerator::with_devices(vec![device(
         "Headphones",
         HEADPHONES_COD,
         true,
      )]));
      let detector = Arc::new(MockDetector::new(KnownCodec::Aac));
      let bus = NotificationBus::new();

      let coordinator =
         RefreshCoordinator::new(enumerator.clone(), detector.clone(), &bus, options(false));
      wait_until_settled(&coordinator, 1).await;
      let before = coordinator.state();

      enumerator.panic_on_call.store(true, Ordering::SeqCst);
      coordinator.request_refresh().await.unwrap();

      time::timeout(Duration::from_secs(5), async {
         while enumerator.calls() < 2 {
            time::sleep(Duration::from_millis(5)).await;
         }
      })
      .await
      .unwrap();
      let status = wait_until_settled(&coordinator, 1).await;

      assert_eq!(status.scans_completed, 1);
      assert!(Arc::ptr_eq(&before, &coordinator.state()));
   }

   #[tokio::test]
   async fn test_listeners_see_every_publish() {
      let bus = NotificationBus::new();
      let coordinator = RefreshCoordinator::new(
         Arc::new(MockEnumerator::default()),
         Arc::new(MockDetector::new(KnownCodec::Sbc)),
         &bus,
         options(false),
      );
      wait_until_settled(&coordinator, 1).await;

      let seen = Arc::new(Mutex::new(Vec::new()));
      let sink = seen.clone();
      let _sub = coordinator.subscribe(move |state| sink.lock().push(state.clone()));

      coordinator.request_refresh().await.unwrap();
      wait_until_settled(&coordinator, 2).await;

      let seen = seen.lock();
      assert_eq!(seen.len(), 1);
      assert_eq!(seen[0].current_codec, CodecLabel::NoDevice);
   }

   #[tokio::test]
   async fn test_dropping_handles_unsubscribes_from_bus() {
      let bus = NotificationBus::new();
      let coordinator = RefreshCoordinator::new(
         Arc::new(MockEnumerator::default()),
         Arc::new(MockDetector::new(KnownCodec::Sbc)),
         &bus,
         options(false),
      );
      assert_eq!(bus.subscriber_count(), 1);
      wait_until_settled(&coordinator, 1).await;

      drop(coordinator);
      time::timeout(Duration::from_secs(5), async {
         while bus.subscriber_count() != 0 {
            time::sleep(Duration::from_millis(5)).await;
         }
      })
      .await
      .expect("subscription was not released");

      // Notifications after teardown are ignored
      bus.emit(DeviceNotification::Connected);
   }

   #[test]
   fn test_available_codecs() {
      let names: Vec<_> = RefreshCoordinator::available_codecs()
         .iter()
         .map(ToString::to_string)
         .collect();
      assert_eq!(names, ["SBC", "AAC", "aptX", "aptX HD", "LDAC"]);
   }

   #[test]
   fn test_trigger_display_names_the_cause() {
      assert_eq!(Trigger::Manual.to_string(), "manual refresh");
      assert_eq!(
         Trigger::Notification(DeviceNotification::Disconnected).to_string(),
         "device Disconnected notification"
      );
   }
}
