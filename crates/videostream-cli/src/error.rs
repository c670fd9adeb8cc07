// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

use std::fmt;
use std::process::ExitCode;

/// CLI-specific error type with exit code mapping
#[derive(Debug)]
pub enum CliError {
    /// Invalid command-line arguments
    InvalidArgs(String),
    /// Socket error (connection, binding, etc.)
    SocketError(String),
    /// Operation timed out
    Timeout(String),
    /// General error from VideoStream library
    General(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::InvalidArgs(msg) => write!(f, "Invalid arguments: {}", msg),
            CliError::SocketError(msg) => write!(f, "Socket error: {}", msg),
            CliError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            CliError::General(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for CliError {}

impl CliError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> ExitCode {
        match self {
            CliError::InvalidArgs(_) => ExitCode::from(2),
            CliError::SocketError(_) => ExitCode::from(5),
            CliError::Timeout(_) => ExitCode::from(6),
            CliError::General(_) => ExitCode::from(1),
        }
    }
}

/// Map videostream::Error to CliError with appropriate exit codes
impl From<videostream::Error> for CliError {
    fn from(err: videostream::Error) -> Self {
        use videostream::Error;

        match err {
            Error::Timeout => CliError::Timeout("operation timed out".to_string()),

            Error::Closed | Error::NotConnected => {
                CliError::SocketError(format!("connection failed: {}", err))
            }

            // IO errors - map connection-flavored kinds to SocketError
            Error::Io(io_err) => match io_err.kind() {
                std::io::ErrorKind::TimedOut => {
                    CliError::Timeout(format!("Operation timed out: {}", io_err))
                }
                std::io::ErrorKind::NotFound
                | std::io::ErrorKind::AddrInUse
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe => {
                    CliError::SocketError(format!("Socket error: {}", io_err))
                }
                _ => CliError::General(format!("I/O error: {}", io_err)),
            },

            Error::BadArg | Error::Unsupported => {
                CliError::InvalidArgs(format!("{}", err))
            }

            // Catch-all for any future error variants (non-exhaustive enum)
            other => CliError::General(format!("{}", other)),
        }
    }
}

/// Helper function to convert result to exit code
pub fn result_to_exit_code<T>(result: Result<T, CliError>) -> ExitCode {
    match result {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            e.exit_code()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            CliError::InvalidArgs("test".into()).exit_code(),
            ExitCode::from(2)
        );
        assert_eq!(
            CliError::SocketError("test".into()).exit_code(),
            ExitCode::from(5)
        );
        assert_eq!(
            CliError::Timeout("test".into()).exit_code(),
            ExitCode::from(6)
        );
        assert_eq!(
            CliError::General("test".into()).exit_code(),
            ExitCode::from(1)
        );
    }

    #[test]
    fn test_error_display() {
        let err = CliError::SocketError("/tmp/video.sock".to_string());
        assert_eq!(format!("{}", err), "Socket error: /tmp/video.sock");
    }

    #[test]
    fn test_from_library_timeout() {
        let err: CliError = videostream::Error::Timeout.into();
        assert!(matches!(err, CliError::Timeout(_)));
    }

    #[test]
    fn test_from_library_closed() {
        let err: CliError = videostream::Error::Closed.into();
        assert!(matches!(err, CliError::SocketError(_)));
    }
}
