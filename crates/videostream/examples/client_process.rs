// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Standalone client process consuming frames from the `host_process`
//! example. See that example for usage.

use std::time::Instant;
use videostream::{
    client::{Client, Reconnect},
    timestamp,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let socket_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/tmp/vsl_demo.sock".to_string());
    let frame_count: usize = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(100);

    println!("[CLIENT] Connecting to {}", socket_path);
    let client = Client::new(&socket_path, Reconnect::Yes)?;
    client.set_timeout(5.0)?;

    let start = Instant::now();
    let mut received = 0usize;
    let mut last_serial = 0i64;

    while received < frame_count {
        let mut frame = client.get_frame(0)?;
        let latency_us = (timestamp() - frame.timestamp()) / 1000;

        if frame.serial() != last_serial + 1 && last_serial != 0 {
            println!(
                "[CLIENT] Serial jump {} -> {} ({} dropped)",
                last_serial,
                frame.serial(),
                frame.serial() - last_serial - 1
            );
        }
        last_serial = frame.serial();

        // Lock while reading so the frame cannot expire under us
        frame.trylock()?;
        let checksum: u64 = frame.mmap()?.iter().map(|b| *b as u64).sum();
        frame.unlock()?;

        if received < 5 || received % 20 == 0 {
            println!(
                "[CLIENT] Frame serial={} latency={}us checksum={:#x}",
                last_serial, latency_us, checksum
            );
        }
        received += 1;
    }

    let elapsed = start.elapsed();
    println!(
        "[CLIENT] Received {} frames in {:.1}s ({:.1} fps)",
        received,
        elapsed.as_secs_f64(),
        received as f64 / elapsed.as_secs_f64()
    );

    Ok(())
}
