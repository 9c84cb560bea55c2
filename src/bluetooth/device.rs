//! Snapshot of a paired Bluetooth device.

use smallvec::SmallVec;
use smol_str::SmolStr;
use uuid::Uuid;

/// Service names advertised by a device.
pub type ServiceNames = SmallVec<[SmolStr; 8]>;

/// A paired device as reported by one enumeration call.
///
/// Values are owned by the caller of the enumeration and never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BluetoothDevice {
   pub address: SmolStr,
   pub name: Option<SmolStr>,
   pub class_of_device: u32,
   pub is_connected: bool,
   pub service_names: ServiceNames,
}

impl BluetoothDevice {
   /// Name shown to the user; falls back to the address for unnamed devices.
   pub fn display_name(&self) -> SmolStr {
      self.name.clone().unwrap_or_else(|| self.address.clone())
   }
}

/// Base UUID for 16-bit Bluetooth SIG assigned numbers.
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Service class identifiers and the names their SDP records carry.
const SERVICE_CLASSES: &[(u16, &str)] = &[
   (0x1101, "Serial Port"),
   (0x1105, "OBEX Object Push"),
   (0x1108, "Headset"),
   (0x110A, "Audio Source"),
   (0x110B, "Audio Sink"),
   (0x110C, "A/V Remote Control Target"),
   (0x110D, "Advanced Audio Distribution (A2DP)"),
   (0x110E, "A/V Remote Control"),
   (0x110F, "A/V Remote Control Controller"),
   (0x1112, "Headset Audio Gateway"),
   (0x111E, "Handsfree"),
   (0x111F, "Handsfree Audio Gateway"),
   (0x1124, "Human Interface Device"),
   (0x112F, "Phonebook Access Server"),
   (0x1131, "Headset HS"),
   (0x1200, "PnP Information"),
   (0x1203, "Generic Audio"),
   (0x184E, "Audio Stream Control"),
   (0x184F, "Broadcast Audio Scan"),
   (0x1850, "Published Audio Capabilities"),
];

fn short_service_id(uuid: &Uuid) -> Option<u16> {
   let value = uuid.as_u128();
   let short = (value >> 96) as u32;
   (value & !(0xFFFF_FFFFu128 << 96) == BASE_UUID && short <= 0xFFFF).then_some(short as u16)
}

/// Maps an advertised service UUID to its service name.
///
/// Unrecognised UUIDs keep their textual form so nothing is lost.
pub fn service_name(uuid: &Uuid) -> SmolStr {
   short_service_id(uuid)
      .and_then(|id| SERVICE_CLASSES.iter().find(|(known, _)| *known == id))
      .map_or_else(
         || SmolStr::from(uuid.to_string()),
         |(_, name)| SmolStr::new_static(name),
      )
}
