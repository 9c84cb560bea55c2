//! Audio device recognition.
//!
//! Decides whether a paired device is an audio peripheral, first from its
//! Class of Device bitfield and then, when that is inconclusive, from the
//! names of the services it advertises.

use super::device::BluetoothDevice;

/// Mask and shift of the major service class bits.
const MAJOR_SERVICE_MASK: u32 = 0x00FF_E000;
const MAJOR_SERVICE_SHIFT: u32 = 13;

/// Mask and shift of the major device class bits.
const MAJOR_DEVICE_MASK: u32 = 0x0000_1F00;
const MAJOR_DEVICE_SHIFT: u32 = 8;

/// Audio bit inside the major service class.
const SERVICE_AUDIO: u32 = 0x08;

/// Audio/Video major device class.
const DEVICE_AUDIO_VIDEO: u32 = 0x04;

/// Service name fragments that mark an audio device (case-sensitive).
const AUDIO_SERVICE_PATTERNS: &[&str] = &["Audio", "A2DP", "Headset", "Handsfree"];

pub const fn major_service_class(class_of_device: u32) -> u32 {
   (class_of_device & MAJOR_SERVICE_MASK) >> MAJOR_SERVICE_SHIFT
}

pub const fn major_device_class(class_of_device: u32) -> u32 {
   (class_of_device & MAJOR_DEVICE_MASK) >> MAJOR_DEVICE_SHIFT
}

/// Class of Device check: audio service bit or Audio/Video major class.
pub const fn class_indicates_audio(class_of_device: u32) -> bool {
   major_service_class(class_of_device) & SERVICE_AUDIO != 0
      || major_device_class(class_of_device) == DEVICE_AUDIO_VIDEO
}

/// Checks whether any advertised service name looks like an audio profile.
pub fn services_indicate_audio<S: AsRef<str>>(service_names: &[S]) -> bool {
   service_names.iter().any(|name| {
      let name = name.as_ref();
      AUDIO_SERVICE_PATTERNS
         .iter()
         .any(|pattern| name.contains(pattern))
   })
}

/// Returns true if the device is an audio peripheral.
///
/// The service-name check only widens the Class of Device result; a device
/// is rejected only when both checks fail.
pub fn is_audio_device(device: &BluetoothDevice) -> bool {
   if class_indicates_audio(device.class_of_device) {
      log::debug!(
         "Audio device via class of device: {} cod={:#08x}",
         device.address,
         device.class_of_device
      );
      return true;
   }

   if services_indicate_audio(&device.service_names) {
      log::debug!(
         "Audio device via service records: {} {:?}",
         device.address,
         device.service_names
      );
      return true;
   }
   false
}
