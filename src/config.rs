//! Configuration management for the codec service.
//!
//! This module handles loading and saving configuration from disk,
//! including the adapter selection and log-query parameters.

use std::{env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{CodecError, Result};

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
   /// Adapter to enumerate; the BlueZ default adapter when unset.
   #[serde(default)]
   pub adapter: Option<String>,

   #[serde(default = "default_log_command")]
   pub log_command: PathBuf,

   #[serde(default = "default_log_window")]
   pub log_window: String,

   #[serde(default = "default_codec_switch_delay")]
   pub codec_switch_delay_ms: u64,

   /// Guess the codec from advertised services when the log query finds nothing.
   #[serde(default)]
   pub service_codec_fallback: bool,

   #[serde(default = "default_monitor_retry_delay")]
   pub monitor_retry_delay_sec: u64,
}

fn default_log_command() -> PathBuf {
   PathBuf::from("/usr/bin/log")
}

fn default_log_window() -> String {
   "1h".to_string()
}

const fn default_codec_switch_delay() -> u64 {
   500
}

const fn default_monitor_retry_delay() -> u64 {
   5
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: None,
         log_command: default_log_command(),
         log_window: default_log_window(),
         codec_switch_delay_ms: default_codec_switch_delay(),
         service_codec_fallback: false,
         monitor_retry_delay_sec: default_monitor_retry_delay(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(cocho_home) = env::var("COCHO_HOME") {
         PathBuf::from(cocho_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else {
         dirs::config_dir().ok_or(CodecError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("cocho").join("config.toml"))
   }

   pub const fn codec_switch_delay(&self) -> Duration {
      Duration::from_millis(self.codec_switch_delay_ms)
   }

   pub const fn monitor_retry_delay(&self) -> Duration {
      Duration::from_secs(self.monitor_retry_delay_sec)
   }
}
