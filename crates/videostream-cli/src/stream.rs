// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use crate::error::CliError;
use crate::utils;
use clap::Args as ClapArgs;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use videostream::{frame::Frame, host::Host, timestamp};

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// VSL socket path
    socket: String,

    /// Resolution in WxH format
    #[arg(short, long, default_value = "1920x1080")]
    resolution: String,

    /// Pixel format FOURCC
    #[arg(long, default_value = "YUYV")]
    format: String,

    /// Target frame rate
    #[arg(short = 'F', long, default_value = "30")]
    fps: u32,

    /// Frame lifetime in milliseconds (0 = never expires)
    #[arg(short, long, default_value = "100")]
    expiry: u64,

    /// Number of frames to post (0=unlimited)
    #[arg(short, long, default_value = "0")]
    frames: u64,
}

pub fn execute(args: Args, json: bool) -> Result<(), CliError> {
    log::info!("Starting test-pattern stream to {}", args.socket);
    log::debug!("Stream parameters: {:?}", args);

    let (width, height) = utils::parse_resolution(&args.resolution)?;
    let fourcc = utils::validate_fourcc(&args.format)?;
    if args.fps == 0 {
        return Err(CliError::InvalidArgs("fps must be positive".to_string()));
    }

    // Install signal handler for graceful shutdown
    let term = utils::install_signal_handler()?;

    let host = Host::new(&args.socket)?;
    log::info!("Host listening on {}", args.socket);

    let interval = Duration::from_secs(1) / args.fps;
    let max_frames = if args.frames == 0 {
        u64::MAX
    } else {
        args.frames
    };

    let mut collector = crate::metrics::MetricsCollector::new();
    let mut count = 0u64;
    let mut next_frame = Instant::now();

    while count < max_frames && !term.load(Ordering::Relaxed) {
        // Service client connections and control requests while pacing.
        loop {
            let budget = next_frame.saturating_duration_since(Instant::now());
            if host.poll(budget.as_millis() as i64)? > 0 {
                host.process()?;
            }
            if Instant::now() >= next_frame {
                break;
            }
        }
        next_frame += interval;

        let mut frame = Frame::new(width, height, 0, fourcc)?;
        frame.alloc(None)?;
        fill_pattern(frame.mmap_mut()?, count);
        let size = frame.size() as u64;

        let now = timestamp();
        let expires = if args.expiry == 0 {
            0
        } else {
            now + args.expiry as i64 * 1_000_000
        };
        let before = Instant::now();
        let serial = host.post(frame, expires, interval.as_nanos() as i64, -1, -1)?;
        collector.record_frame(before.elapsed().as_nanos() as i64, size);

        count += 1;
        if count.is_multiple_of(30) {
            log::debug!("Posted {} frames (serial {})", count, serial);
        }
    }

    if term.load(Ordering::Relaxed) {
        log::info!("Interrupted, posted {} frames", count);
    }
    crate::metrics::report(&collector.finalize(), json);
    Ok(())
}

/// Moving diagonal gradient so consecutive frames differ visibly.
fn fill_pattern(data: &mut [u8], tick: u64) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = ((i as u64).wrapping_add(tick * 7) & 0xff) as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_pattern_moves() {
        let mut a = vec![0u8; 64];
        let mut b = vec![0u8; 64];
        fill_pattern(&mut a, 0);
        fill_pattern(&mut b, 1);
        assert_ne!(a, b);
        assert_eq!(a[0], 0);
        assert_eq!(b[0], 7);
    }
}
