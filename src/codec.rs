//! Codec labels and best-effort codec detection.
//!
//! The active A2DP codec is not exposed by any documented interface, so it
//! is recovered from the system log: the query below lists recent
//! "A2DP configured" events and the first `Codec: <token>` occurrence wins.
//! Every failure degrades to [`CodecLabel::Unknown`].

use std::{
   fmt,
   future::Future,
   path::PathBuf,
   process::Stdio,
   str::FromStr,
};

use log::{debug, warn};
use smol_str::SmolStr;
use tokio::process::Command;

use crate::{
   bluetooth::device::BluetoothDevice,
   config::Config,
   error::{CodecError, Result},
};

/// Codecs a user can pick from.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
   strum::VariantArray,
)]
#[strum(ascii_case_insensitive)]
pub enum KnownCodec {
   #[strum(to_string = "SBC")]
   Sbc,
   #[strum(to_string = "AAC")]
   Aac,
   #[strum(to_string = "aptX")]
   AptX,
   #[strum(to_string = "aptX HD", serialize = "aptXHD", serialize = "aptX-HD")]
   AptXHd,
   #[strum(to_string = "LDAC")]
   Ldac,
}

impl KnownCodec {
   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// The codec shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CodecLabel {
   Known(KnownCodec),
   /// Token found in the log that matches no known codec, kept verbatim.
   Other(SmolStr),
   #[default]
   Unknown,
   /// No connected audio device.
   NoDevice,
}

impl From<KnownCodec> for CodecLabel {
   fn from(codec: KnownCodec) -> Self {
      Self::Known(codec)
   }
}

impl fmt::Display for CodecLabel {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::Known(codec) => f.write_str(codec.to_str()),
         Self::Other(token) => f.write_str(token),
         Self::Unknown => f.write_str("Unknown"),
         Self::NoDevice => f.write_str("No device"),
      }
   }
}

impl FromStr for CodecLabel {
   type Err = std::convert::Infallible;

   /// Parses a user-supplied label; anything unrecognised becomes `Other`.
   fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
      let s = s.trim();
      Ok(KnownCodec::from_str(s).map_or_else(|_| Self::Other(s.into()), Self::Known))
   }
}

// === Log parsing ===

const CODEC_MARKER: &str = "Codec: ";

/// Finds the first `Codec: <token>` where the token is one or more ASCII
/// alphanumerics or hyphens.
pub fn find_codec_token(output: &str) -> Option<&str> {
   output.match_indices(CODEC_MARKER).find_map(|(idx, _)| {
      let rest = &output[idx + CODEC_MARKER.len()..];
      let end = rest
         .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-'))
         .unwrap_or(rest.len());
      (end > 0).then(|| &rest[..end])
   })
}

/// Collapses a raw codec token to a label. Order matters: "AAC-LC" is AAC.
pub fn normalize_codec(token: &str) -> CodecLabel {
   let codec = if token.contains("AAC") {
      KnownCodec::Aac
   } else if token.contains("aptX HD") {
      KnownCodec::AptXHd
   } else if token.contains("aptX") {
      KnownCodec::AptX
   } else if token.contains("LDAC") {
      KnownCodec::Ldac
   } else if token.contains("SBC") {
      KnownCodec::Sbc
   } else {
      return CodecLabel::Other(token.into());
   };
   codec.into()
}

pub fn parse_codec_from_log(output: &str) -> CodecLabel {
   find_codec_token(output).map_or(CodecLabel::Unknown, normalize_codec)
}

/// Guesses the codec from the services a connected device advertises.
///
/// A device with an A2DP or audio service is assumed to negotiate AAC;
/// anything else gets SBC, the codec every A2DP sink must support.
pub fn guess_codec_from_services(devices: &[BluetoothDevice]) -> CodecLabel {
   let Some(device) = devices.first() else {
      return CodecLabel::NoDevice;
   };
   let advertises_audio = device
      .service_names
      .iter()
      .any(|name| name.contains("A2DP") || name.contains("Audio"));
   if advertises_audio {
      KnownCodec::Aac.into()
   } else {
      KnownCodec::Sbc.into()
   }
}

// === Detection ===

/// Source of the currently negotiated codec.
pub trait CodecDetector: Send + Sync + 'static {
   /// Detects the active codec. Never fails; problems yield `Unknown`.
   fn detect_codec(&self) -> impl Future<Output = CodecLabel> + Send;
}

/// Log predicate selecting A2DP configuration events.
pub const LOG_PREDICATE: &str =
   "subsystem contains 'bluetooth' AND eventMessage contains 'A2DP configured'";

/// Detects the codec by running the system log query tool.
#[derive(Debug, Clone)]
pub struct LogCodecDetector {
   program: PathBuf,
   window: String,
}

impl LogCodecDetector {
   pub fn new(program: impl Into<PathBuf>, window: impl Into<String>) -> Self {
      Self {
         program: program.into(),
         window: window.into(),
      }
   }

   pub fn from_config(config: &Config) -> Self {
      Self::new(&config.log_command, &config.log_window)
   }

   fn command(&self) -> Command {
      let mut cmd = Command::new(&self.program);
      cmd.args([
         "show",
         "--predicate",
         LOG_PREDICATE,
         "--last",
         &self.window,
         "--style",
         "compact",
      ])
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::null())
      .kill_on_drop(true);
      cmd
   }

   async fn query_logs(&self) -> Result<String> {
      let output = self.command().output().await?;
      if !output.status.success() {
         return Err(CodecError::LogQueryFailed(output.status));
      }
      Ok(String::from_utf8_lossy(&output.stdout).into_owned())
   }
}

impl CodecDetector for LogCodecDetector {
   async fn detect_codec(&self) -> CodecLabel {
      match self.query_logs().await {
         Ok(output) => {
            debug!("A2DP log output:\n{output}");
            let codec = parse_codec_from_log(&output);
            debug!("Detected codec: {codec}");
            codec
         },
         Err(e) => {
            warn!("Log query via {} failed: {e}", self.program.display());
            CodecLabel::Unknown
         },
      }
   }
}
