//! Bluetooth layer for audio device tracking.
//!
//! This module provides paired-device enumeration, audio device
//! classification and connection change monitoring on top of BlueZ.

pub mod classifier;
pub mod device;
pub mod enumerator;
pub mod monitor;
