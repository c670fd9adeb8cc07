// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use crate::error::CliError;
use crate::metrics::MetricsCollector;
use crate::utils;
use clap::Args as ClapArgs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use videostream::{
    client::{Client, Reconnect},
    frame::Frame,
    host::Host,
    timestamp,
};

#[derive(ClapArgs, Debug)]
pub struct Args {
    /// Number of frames to push through the loopback
    #[arg(short, long, default_value = "300")]
    frames: u64,

    /// Resolution in WxH format
    #[arg(short, long, default_value = "640x480")]
    resolution: String,

    /// Pixel format FOURCC
    #[arg(long, default_value = "RGB3")]
    format: String,

    /// Producer frame rate (0 = as fast as possible)
    #[arg(short = 'F', long, default_value = "0")]
    fps: u32,
}

/// Host and client in one process over a private socket; measures the
/// post-to-receive latency of the full fd-passing path.
pub fn execute(args: Args, json: bool) -> Result<(), CliError> {
    let (width, height) = utils::parse_resolution(&args.resolution)?;
    let fourcc = utils::validate_fourcc(&args.format)?.to_string();
    if args.frames == 0 {
        return Err(CliError::InvalidArgs("frames must be positive".to_string()));
    }

    let socket = format!("/tmp/vsl_bench_{}.sock", std::process::id());
    log::info!(
        "Benchmarking {} frames of {}x{} {} over {}",
        args.frames,
        width,
        height,
        fourcc,
        socket
    );

    let host = Arc::new(Host::new(&socket)?);
    let client = Client::new(&socket, Reconnect::No)?;
    client.set_timeout(5.0)?;

    // Accept the client before the producer starts so no frame is broadcast
    // into the void.
    host.poll(100)?;
    host.process()?;

    let stop = Arc::new(AtomicBool::new(false));
    let producer = {
        let host = Arc::clone(&host);
        let stop = Arc::clone(&stop);
        let frames = args.frames;
        let fps = args.fps;
        thread::spawn(move || -> Result<(), videostream::Error> {
            let interval = if fps > 0 {
                Some(Duration::from_secs(1) / fps)
            } else {
                None
            };
            for tick in 0..frames {
                if stop.load(Ordering::Relaxed) {
                    break;
                }
                if host.poll(0)? > 0 {
                    host.process()?;
                }
                let mut frame = Frame::new(width, height, 0, &fourcc)?;
                frame.alloc(None)?;
                frame.mmap_mut()?[0] = tick as u8;
                let expires = timestamp() + 1_000_000_000;
                host.post(frame, expires, -1, -1, -1)?;
                if let Some(interval) = interval {
                    thread::sleep(interval);
                }
            }
            Ok(())
        })
    };

    let mut collector = MetricsCollector::new();
    let mut received = 0u64;
    let result = loop {
        if received >= args.frames {
            break Ok(());
        }
        match client.get_frame(0) {
            Ok(frame) => {
                collector.record_frame(timestamp() - frame.timestamp(), frame.size() as u64);
                collector.track_serial(frame.serial());
                received += 1;
            }
            Err(err) => break Err(CliError::from(err)),
        }
    };

    stop.store(true, Ordering::Relaxed);
    match producer.join() {
        Ok(Ok(())) => {}
        Ok(Err(err)) => log::warn!("producer stopped early: {}", err),
        Err(_) => log::warn!("producer thread panicked"),
    }

    result?;
    log::info!("Received {} frames", received);
    crate::metrics::report(&collector.finalize(), json);
    Ok(())
}
