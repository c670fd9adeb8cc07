// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Standalone host process posting test-pattern frames. Pair with the
//! `client_process` example in a second terminal:
//!
//! ```sh
//! cargo run --example host_process /tmp/vsl_demo.sock 100
//! cargo run --example client_process /tmp/vsl_demo.sock 100
//! ```

use std::time::{Duration, Instant};
use videostream::{frame::Frame, host::Host, timestamp};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let socket_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/tmp/vsl_demo.sock".to_string());
    let frame_count: usize = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(100);

    println!("[HOST] Starting host process");
    println!("[HOST] Socket: {}", socket_path);
    println!("[HOST] Frame count: {}", frame_count);

    let host = Host::new(&socket_path)?;
    println!("[HOST] Host created at {}", socket_path);

    // Give a client time to connect
    host.poll(1000)?;
    host.process()?;

    let start = Instant::now();
    for i in 0..frame_count {
        let before_fill = Instant::now();
        let mut frame = Frame::new(1280, 720, 0, "YUYV")?;
        frame.alloc(None)?;
        for (j, byte) in frame.mmap_mut()?.iter_mut().enumerate() {
            *byte = ((i + j) & 0xff) as u8;
        }
        let fill_time = before_fill.elapsed();

        let before_post = Instant::now();
        let now = timestamp();
        let expires = now + 5_000_000_000; // 5 second expiration
        let serial = host.post(frame, expires, -1, -1, -1)?;
        let post_time = before_post.elapsed();

        host.poll(0)?;
        host.process()?;

        if i < 5 || i % 20 == 0 {
            println!(
                "[HOST] Frame {} (serial {}): fill={}ms, post={}us",
                i,
                serial,
                fill_time.as_millis(),
                post_time.as_micros()
            );
        }

        std::thread::sleep(Duration::from_millis(33));
    }

    let elapsed = start.elapsed();
    println!(
        "[HOST] Posted {} frames in {:.1}s ({:.1} fps)",
        frame_count,
        elapsed.as_secs_f64(),
        frame_count as f64 / elapsed.as_secs_f64()
    );

    // Keep servicing until the remaining frames expire
    let drain_until = Instant::now() + Duration::from_secs(5);
    while Instant::now() < drain_until && host.frame_count()? > 0 {
        host.poll(100)?;
        host.process()?;
    }

    Ok(())
}
