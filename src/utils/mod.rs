//! # Utility Functions and Types
//!
//! Bit-level reader/writer and MPEG-2 CRC32, shared by the TS/PES/PSI
//! parsers in the rest of the crate.
//!
//! ## Bit Operations
//!
//! ```rust
//! use mpegts_probe::utils::BitReader;
//!
//! let data = vec![0b10110011u8];
//! let mut reader = BitReader::new(&data);
//! let value = reader.read_bits(3).unwrap(); // first 3 bits (101)
//! assert_eq!(value, 0b101);
//! ```
//!
//! ## CRC Calculation
//!
//! ```rust
//! use mpegts_probe::utils::Crc32Mpeg2;
//!
//! let crc = Crc32Mpeg2::new();
//! let checksum = crc.calculate(b"Hello, world!");
//! println!("CRC32: {:08x}", checksum);
//! ```

/// Bit manipulation and bitstream reading utilities
pub mod bits;

/// CRC calculation implementations
pub mod crc;

// Re-export commonly used types
pub use bits::*;
pub use crc::Crc32Mpeg2;
