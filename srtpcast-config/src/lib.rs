//! Configuration management for srtpcast services
//!
//! Values are layered: built-in defaults, then an optional config file
//! (`srtpcast.toml` unless `SRTPCAST_CONFIG` names another), then
//! `SRTPCAST_*` environment variables. A `.env` file is read first if present.

use config::{Config, Environment, File};
use serde::Deserialize;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Environment prefix for every setting
pub const ENV_PREFIX: &str = "SRTPCAST";

/// Config file used when `SRTPCAST_CONFIG` is unset
pub const DEFAULT_CONFIG_FILE: &str = "srtpcast";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigLoadError {
    /// Source could not be read or deserialized
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// Values were read but are inconsistent
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Streamer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StreamerConfig {
    /// UDP address the DTLS/SRTP socket binds to
    pub listen_addr: SocketAddr,
    /// PEM certificate chain; a self-signed certificate is generated when unset
    pub certificate_path: Option<PathBuf>,
    /// PEM private key matching `certificate_path`
    pub private_key_path: Option<PathBuf>,
    /// ICE password shared with the client; enables STUN binding responses
    pub ice_password: Option<String>,
    /// Frame bytes carried per RTP packet
    pub max_payload_size: usize,
    /// RTP payload type agreed out of band (a=rtpmap)
    pub payload_type: u8,
    /// Media clock rate in Hz
    pub clock_rate: u32,
    /// Upper bound for a handshake to reach the established state
    pub handshake_timeout_secs: u64,
    /// Maximum number of concurrent peers (pending or established)
    pub max_sessions: usize,
    /// MTU handed to the DTLS layer for handshake records
    pub dtls_mtu: u32,
    /// H.264 Annex-B file replayed as the encoded frame source
    pub frame_source_path: Option<PathBuf>,
    /// Frames per second of the frame source
    pub frame_rate: u32,
    /// Default log level, overridden by RUST_LOG
    pub log_level: String,
    /// `json` or `console`
    pub log_format: String,
}

impl StreamerConfig {
    /// Load configuration from `.env`, the config file and the environment
    pub fn load() -> Result<Self, ConfigLoadError> {
        let _ = dotenvy::dotenv();

        let file = env::var(format!("{}_CONFIG", ENV_PREFIX))
            .unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());

        Self::load_from(Some(&file))
    }

    /// Load configuration from an optional file plus the environment
    pub fn load_from(file: Option<&str>) -> Result<Self, ConfigLoadError> {
        let mut builder = Config::builder()
            .set_default("listen_addr", "127.0.0.1:8888")?
            .set_default("max_payload_size", 1400_i64)?
            .set_default("payload_type", 96_i64)?
            .set_default("clock_rate", 90_000_i64)?
            .set_default("handshake_timeout_secs", 10_i64)?
            .set_default("max_sessions", 16_i64)?
            .set_default("dtls_mtu", 1200_i64)?
            .set_default("frame_rate", 30_i64)?
            .set_default("log_level", "info")?
            .set_default("log_format", "console")?;

        if let Some(path) = file {
            builder = builder.add_source(File::with_name(path).required(false));
        }

        let config: StreamerConfig = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the streamer cannot run with
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.certificate_path.is_some() != self.private_key_path.is_some() {
            return Err(ConfigLoadError::Invalid(
                "certificate_path and private_key_path must be set together".to_string(),
            ));
        }
        if self.max_payload_size == 0 {
            return Err(ConfigLoadError::Invalid(
                "max_payload_size must be greater than zero".to_string(),
            ));
        }
        if self.payload_type > 127 {
            return Err(ConfigLoadError::Invalid(format!(
                "payload_type {} does not fit in 7 bits",
                self.payload_type
            )));
        }
        if self.clock_rate == 0 || self.frame_rate == 0 {
            return Err(ConfigLoadError::Invalid(
                "clock_rate and frame_rate must be greater than zero".to_string(),
            ));
        }
        if self.handshake_timeout_secs == 0 {
            return Err(ConfigLoadError::Invalid(
                "handshake_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.max_sessions == 0 {
            return Err(ConfigLoadError::Invalid(
                "max_sessions must be greater than zero".to_string(),
            ));
        }
        if self.dtls_mtu < 256 {
            return Err(ConfigLoadError::Invalid(format!(
                "dtls_mtu {} is too small for a DTLS handshake",
                self.dtls_mtu
            )));
        }
        Ok(())
    }

    /// Handshake timeout as a duration
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Media clock ticks between two frames
    pub fn ticks_per_frame(&self) -> u32 {
        self.clock_rate / self.frame_rate
    }

    /// Get log level, defaulting to "info"
    pub fn log_level(&self) -> &str {
        if self.log_level.is_empty() {
            "info"
        } else {
            &self.log_level
        }
    }
}
