#![doc(html_root_url = "https://docs.rs/mpegts-probe/0.1.0")]
#![deny(missing_docs)]
#![deny(rustdoc::missing_crate_level_docs)]

//! # mpegts-probe
//!
//! `mpegts-probe` is a library for MPEG-2 Transport Stream analysis and
//! conditioning. It ingests a byte stream of 188-byte TS packets and
//! provides:
//!
//! - stream structure discovery (PAT/PMT modelling), see [`model`]
//! - elementary-stream demultiplexing into reassembled PES packets, see
//!   [`pes`]
//! - a PCR-paced output smoother that converts bursty input into a
//!   jitter-minimised output stream, see [`smoother`]
//! - an ETSI TR 101 290 priority-1/2 quality monitor, see [`monitor`]
//!
//! Socket I/O, file segment writing, CLI surfaces, and codec-level
//! audio/video decoding are deliberately out of scope: this crate is a
//! library consumed by tools that own those concerns.
//!
//! ## Quick Start
//!
//! ```rust
//! use mpegts_probe::ts::{find_sync_offset, TS_PACKET_SIZE};
//!
//! let mut buf = vec![0xFFu8; TS_PACKET_SIZE * 3 + 5];
//! for k in 0..3 {
//!     buf[5 + k * TS_PACKET_SIZE] = 0x47;
//! }
//! assert_eq!(find_sync_offset(&buf), Some(5));
//! ```

/// Error types and the crate-wide `Result` alias.
pub mod error;

/// Tuning constants shared by every component.
pub mod config;

/// Bit-accurate reader/writer and MPEG-2 CRC32.
pub mod utils;

/// Core TS packet, adaptation field, and PCR types shared by every
/// component.
pub mod ts;

/// Per-PID PES reassembly (§4.2).
pub mod pes;

/// Double-buffered PAT/PMT stream model (§4.3).
pub mod model;

/// PCR-paced output smoother (§4.4).
pub mod smoother;

/// ETSI TR 101 290 priority-1/2 quality monitor (§4.5).
pub mod monitor;

pub use error::{Result, TsError};
