//! # Error Types
//!
//! Central error type used throughout the crate. Recoverable parse failures
//! and resource pressure are represented as distinct variants so callers can
//! decide whether to resume at the next sync boundary or treat the failure
//! as fatal.
//!
//! ## Example Usage
//!
//! ```rust
//! use mpegts_probe::error::{Result, TsError};
//!
//! fn check_sync_byte(b: u8) -> Result<()> {
//!     if b != 0x47 {
//!         return Err(TsError::InvalidData("bad sync byte".to_string()));
//!     }
//!     Ok(())
//! }
//! ```

use thiserror::Error;

/// Primary error type for transport-stream analysis operations.
#[derive(Error, Debug)]
pub enum TsError {
    /// I/O errors on an optional sink (e.g. the TR 101 290 log file).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A structural parse failed: malformed PSI section, PES header, etc.
    #[error("parse error: {0}")]
    Parse(String),

    /// Input bytes were structurally invalid (bad sync byte, out-of-range PID, ...).
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// A constructor received an invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The bitstream reader/writer ran past the end of its buffer. Sticky
    /// until the context is reset; callers must check for this after each
    /// structural unit and must not commit partial output when it is set.
    #[error("bitstream overrun")]
    Overrun,
}

/// A specialized `Result` type for this crate's operations.
pub type Result<T> = std::result::Result<T, TsError>;
