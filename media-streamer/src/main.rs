//! Media Streamer
//!
//! Serves DTLS-SRTP on a UDP port and streams an H.264 Annex-B file to every
//! peer that completes the handshake.

use anyhow::{Context, Result};
use media_streamer::{pump, AnnexBFileSource, MediaStreamer, StreamerSettings};
use srtpcast_config::StreamerConfig;
use srtpcast_logging::LogFormat;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = StreamerConfig::load().context("Failed to load configuration")?;

    // Initialize logging
    let format: LogFormat = config
        .log_format
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid log_format: {}", e))?;
    srtpcast_logging::init("media-streamer", format, config.log_level());

    info!(listen_addr = %config.listen_addr, "Starting Media Streamer");

    let streamer = MediaStreamer::bind(StreamerSettings::from(&config))
        .await
        .context("Failed to start streamer")?;

    info!(
        fingerprint = streamer.fingerprint(),
        "Advertise as a=fingerprint:sha-256"
    );

    // Start the frame source
    let source_handle = match &config.frame_source_path {
        Some(path) => {
            let source = AnnexBFileSource::open(path, config.clock_rate, config.frame_rate)
                .await
                .context("Failed to open frame source")?
                .looping(true);
            let frames = streamer.frame_sender();
            Some(tokio::spawn(async move {
                match pump(source, frames).await {
                    Ok(count) => info!(frames = count, "Frame source finished"),
                    Err(e) => error!(error = %e, "Frame source error"),
                }
            }))
        }
        None => {
            warn!("No frame_source_path configured, sessions will carry no media");
            None
        }
    };

    info!("Media Streamer running. Press Ctrl+C to stop.");
    let shutdown = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(err) => error!(error = %err, "Unable to listen for shutdown signal"),
        }
    };

    let stats = streamer.run(shutdown).await?;

    if let Some(handle) = source_handle {
        handle.abort();
    }
    info!(?stats, "Media Streamer stopped");

    Ok(())
}
