// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use crate::error::CliError;
use crate::metrics::MetricsCollector;
use crate::utils;
use clap::Args as ClapArgs;
use std::sync::atomic::Ordering;
use videostream::{
    client::{Client, Reconnect},
    timestamp, Error,
};

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// VSL socket path to connect to
    socket: String,

    /// Number of frames to receive (0=unlimited)
    #[arg(short, long, default_value = "100")]
    frames: u64,

    /// Receive timeout in seconds
    #[arg(short, long, default_value = "5.0")]
    timeout: f32,

    /// Skip queued frames and only report the latest
    #[arg(long)]
    latest: bool,

    /// Lock each frame and checksum its contents
    #[arg(long)]
    checksum: bool,
}

pub fn execute(args: Args, json: bool) -> Result<(), CliError> {
    log::info!("Connecting to socket: {}", args.socket);
    log::debug!("Receive parameters: {:?}", args);

    // Install signal handler for graceful shutdown
    let term = utils::install_signal_handler()?;

    // Create VSL client with auto-reconnect
    let client = Client::new(&args.socket, Reconnect::Yes)?;
    client.set_timeout(args.timeout)?;
    log::debug!("Set timeout to {:.1} seconds", args.timeout);

    let mut collector = MetricsCollector::new();
    let mut frame_count = 0u64;
    let max_frames = if args.frames == 0 {
        u64::MAX
    } else {
        args.frames
    };

    log::info!(
        "Receiving {} frames (Ctrl+C to stop)...",
        if max_frames == u64::MAX {
            "unlimited".to_string()
        } else {
            max_frames.to_string()
        }
    );

    while frame_count < max_frames && !term.load(Ordering::Relaxed) {
        let until = if args.latest { timestamp() } else { 0 };
        let mut frame = match client.get_frame(until) {
            Ok(f) => f,
            Err(Error::Timeout) => {
                log::warn!("Timeout waiting for frame");
                return Err(CliError::Timeout(format!(
                    "Timeout after {:.1}s waiting for frame",
                    args.timeout
                )));
            }
            Err(e) => return Err(e.into()),
        };

        // Delivery latency against the sender's post timestamp
        let latency_ns = timestamp() - frame.timestamp();
        collector.record_frame(latency_ns, frame.size() as u64);

        // Track serial for dropped frames
        let serial = frame.serial();
        let drops = collector.track_serial(serial);
        if drops > 0 {
            log::warn!("Detected {} dropped frame(s)", drops);
        }

        if args.checksum {
            // Lock the frame so it cannot expire while mapped
            frame.trylock()?;
            let sum: u64 = frame.mmap()?.iter().map(|b| *b as u64).sum();
            frame.unlock()?;
            log::trace!("Frame {} checksum {:#x}", serial, sum);
        }

        frame_count += 1;

        // Log progress periodically
        if frame_count.is_multiple_of(30) {
            log::debug!("Received {} frames", frame_count);
        }
    }

    if term.load(Ordering::Relaxed) {
        log::info!("Interrupted, received {} frames", frame_count);
    }
    crate::metrics::report(&collector.finalize(), json);
    Ok(())
}
