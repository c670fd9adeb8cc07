// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use crate::error::CliError;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Parse resolution string in format "WxH" or "W*H"
pub fn parse_resolution(s: &str) -> Result<(i32, i32), CliError> {
    let parts = s
        .split_once('x')
        .or_else(|| s.split_once('*'))
        .ok_or_else(|| {
            CliError::InvalidArgs(format!(
                "Invalid resolution format (expected WxH or W*H): {}",
                s
            ))
        })?;

    let width = parts
        .0
        .parse::<i32>()
        .map_err(|_| CliError::InvalidArgs(format!("Invalid width in resolution: {}", s)))?;
    let height = parts
        .1
        .parse::<i32>()
        .map_err(|_| CliError::InvalidArgs(format!("Invalid height in resolution: {}", s)))?;

    if width <= 0 || height <= 0 {
        return Err(CliError::InvalidArgs(format!(
            "Resolution dimensions must be positive: {}",
            s
        )));
    }

    Ok((width, height))
}

/// Validate a FOURCC string (exactly four ASCII characters)
pub fn validate_fourcc(s: &str) -> Result<&str, CliError> {
    if s.len() != 4 || !s.is_ascii() {
        return Err(CliError::InvalidArgs(format!(
            "FOURCC must be exactly 4 ASCII characters: {}",
            s
        )));
    }
    Ok(s)
}

/// Install SIGINT/SIGTERM handlers that set a shared flag for graceful
/// shutdown of streaming loops.
pub fn install_signal_handler() -> Result<Arc<AtomicBool>, CliError> {
    let term = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        flag::register(signal, Arc::clone(&term))
            .map_err(|e| CliError::General(format!("Failed to install signal handler: {}", e)))?;
    }
    Ok(term)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resolution() {
        assert_eq!(parse_resolution("1920x1080").unwrap(), (1920, 1080));
        assert_eq!(parse_resolution("1280*720").unwrap(), (1280, 720));
        assert!(parse_resolution("1920").is_err());
        assert!(parse_resolution("0x1080").is_err());
        assert!(parse_resolution("-640x480").is_err());
        assert!(parse_resolution("axb").is_err());
    }

    #[test]
    fn test_validate_fourcc() {
        assert!(validate_fourcc("YUYV").is_ok());
        assert!(validate_fourcc("RGB3").is_ok());
        assert!(validate_fourcc("RGB").is_err());
        assert!(validate_fourcc("TOOLONG").is_err());
    }
}
