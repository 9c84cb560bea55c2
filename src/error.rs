//! Error types for the codec service.
//!
//! Only startup paths (configuration, D-Bus registration) surface these to
//! the caller. Scan paths log them and degrade to a representable state.

use std::process::ExitStatus;

use thiserror::Error;
use tokio::task::JoinError;

/// Main error type for the codec service.
#[derive(Error, Debug)]
pub enum CodecError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Log query exited with {0}")]
   LogQueryFailed(ExitStatus),

   #[error("Scan task aborted: {0}")]
   ScanAborted(JoinError),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Refresh coordinator has been shut down")]
   CoordinatorShutdown,
}

/// Convenience type alias for Results with `CodecError`.
pub type Result<T> = std::result::Result<T, CodecError>;
