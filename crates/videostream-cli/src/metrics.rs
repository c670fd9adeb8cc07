// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use serde::Serialize;
use std::time::Instant;

/// Performance metrics collected during operation
#[derive(Debug, Clone, Serialize)]
pub struct FrameMetrics {
    /// Total number of frames processed
    pub frames_processed: u64,
    /// Total bytes processed
    pub bytes_processed: u64,
    /// Total duration in milliseconds
    pub duration_ms: u64,
    /// Average throughput in frames per second
    pub throughput_fps: f64,
    /// Average bandwidth in megabits per second
    pub bandwidth_mbps: f64,
    /// Minimum latency in microseconds
    pub latency_min_us: u64,
    /// Maximum latency in microseconds
    pub latency_max_us: u64,
    /// Average latency in microseconds
    pub latency_avg_us: u64,
    /// 50th percentile (median) latency in microseconds
    pub latency_p50_us: u64,
    /// 95th percentile latency in microseconds
    pub latency_p95_us: u64,
    /// 99th percentile latency in microseconds
    pub latency_p99_us: u64,
    /// Number of dropped frames detected
    pub dropped_frames: u64,
}

/// Metrics collector for tracking frame processing performance
pub struct MetricsCollector {
    start_time: Instant,
    latencies_us: Vec<u64>,
    bytes: u64,
    frames: u64,
    prev_serial: Option<i64>,
    dropped_frames: u64,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            latencies_us: Vec::new(),
            bytes: 0,
            frames: 0,
            prev_serial: None,
            dropped_frames: 0,
        }
    }

    /// Record one processed frame with its latency in nanoseconds and size
    /// in bytes.
    pub fn record_frame(&mut self, latency_ns: i64, bytes: u64) {
        self.latencies_us.push((latency_ns.max(0) / 1000) as u64);
        self.bytes += bytes;
        self.frames += 1;
    }

    /// Track frame serial number to detect drops
    /// Returns the number of dropped frames detected (0 or N)
    pub fn track_serial(&mut self, serial: i64) -> u64 {
        let drops = if let Some(prev) = self.prev_serial {
            let expected = prev + 1;
            if serial > expected {
                (serial - expected) as u64
            } else if serial < expected {
                // Serial went backwards - a host restart, not a drop
                log::warn!("Frame serial number decreased: {} -> {}", prev, serial);
                0
            } else {
                0
            }
        } else {
            0
        };
        self.prev_serial = Some(serial);
        self.dropped_frames += drops;
        drops
    }

    /// Finalize the collection into a metrics report.
    pub fn finalize(mut self) -> FrameMetrics {
        let duration = self.start_time.elapsed();
        let duration_ms = duration.as_millis() as u64;
        let secs = duration.as_secs_f64().max(f64::EPSILON);

        self.latencies_us.sort_unstable();
        let percentile = |p: f64| -> u64 {
            if self.latencies_us.is_empty() {
                return 0;
            }
            let idx = ((self.latencies_us.len() - 1) as f64 * p).round() as usize;
            self.latencies_us[idx]
        };
        let sum: u64 = self.latencies_us.iter().sum();
        let avg = if self.latencies_us.is_empty() {
            0
        } else {
            sum / self.latencies_us.len() as u64
        };

        FrameMetrics {
            frames_processed: self.frames,
            bytes_processed: self.bytes,
            duration_ms,
            throughput_fps: self.frames as f64 / secs,
            bandwidth_mbps: (self.bytes as f64 * 8.0) / (secs * 1_000_000.0),
            latency_min_us: self.latencies_us.first().copied().unwrap_or(0),
            latency_max_us: self.latencies_us.last().copied().unwrap_or(0),
            latency_avg_us: avg,
            latency_p50_us: percentile(0.50),
            latency_p95_us: percentile(0.95),
            latency_p99_us: percentile(0.99),
            dropped_frames: self.dropped_frames,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Print a metrics report, as JSON or human-readable text.
pub fn report(metrics: &FrameMetrics, json: bool) {
    if json {
        match serde_json::to_string_pretty(metrics) {
            Ok(out) => println!("{}", out),
            Err(e) => log::error!("failed to serialize metrics: {}", e),
        }
        return;
    }

    println!("Frames:     {}", metrics.frames_processed);
    println!("Duration:   {} ms", metrics.duration_ms);
    println!("Throughput: {:.1} fps", metrics.throughput_fps);
    println!("Bandwidth:  {:.1} Mbps", metrics.bandwidth_mbps);
    println!(
        "Latency:    min {} us / avg {} us / max {} us",
        metrics.latency_min_us, metrics.latency_avg_us, metrics.latency_max_us
    );
    println!(
        "Percentile: p50 {} us / p95 {} us / p99 {} us",
        metrics.latency_p50_us, metrics.latency_p95_us, metrics.latency_p99_us
    );
    println!("Dropped:    {}", metrics.dropped_frames);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_collector() {
        let metrics = MetricsCollector::new().finalize();
        assert_eq!(metrics.frames_processed, 0);
        assert_eq!(metrics.latency_p99_us, 0);
        assert_eq!(metrics.dropped_frames, 0);
    }

    #[test]
    fn test_latency_percentiles() {
        let mut collector = MetricsCollector::new();
        for i in 1..=100u64 {
            collector.record_frame(i as i64 * 1000, 100);
        }
        let metrics = collector.finalize();
        assert_eq!(metrics.frames_processed, 100);
        assert_eq!(metrics.bytes_processed, 10_000);
        assert_eq!(metrics.latency_min_us, 1);
        assert_eq!(metrics.latency_max_us, 100);
        assert_eq!(metrics.latency_p50_us, 50);
        assert!(metrics.latency_p95_us >= 94 && metrics.latency_p95_us <= 96);
    }

    #[test]
    fn test_serial_drop_detection() {
        let mut collector = MetricsCollector::new();
        assert_eq!(collector.track_serial(1), 0);
        assert_eq!(collector.track_serial(2), 0);
        // Serials 3 and 4 were missed
        assert_eq!(collector.track_serial(5), 2);
        // A restart resets the counter without counting drops
        assert_eq!(collector.track_serial(1), 0);
        let metrics = collector.finalize();
        assert_eq!(metrics.dropped_frames, 2);
    }

    #[test]
    fn test_negative_latency_clamped() {
        let mut collector = MetricsCollector::new();
        collector.record_frame(-5000, 10);
        let metrics = collector.finalize();
        assert_eq!(metrics.latency_min_us, 0);
    }
}
