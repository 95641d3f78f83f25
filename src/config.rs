//! # Tuning Constants
//!
//! This library has no global or file-backed configuration of its own (it is
//! a set of components wired together by the embedding application); each
//! component takes its configuration surface as an explicit struct passed to
//! its constructor (`pes::ExtractorConfig`, `smoother::SmootherConfig`,
//! `monitor::MonitorConfig`). This module only centralizes the numeric
//! defaults the spec pins down, so they have one authoritative home instead
//! of being scattered as magic numbers across modules.

use std::time::Duration;

/// Default soft cap on a PES extractor's ring buffer before a loss event is
/// signalled but collection continues.
pub const PES_RING_SOFT_CAP: usize = 4 * 1024 * 1024;

/// Default hard cap on a PES extractor's ring buffer; past this the ring is
/// reset and the in-progress PES is discarded.
pub const PES_RING_HARD_CAP: usize = 32 * 1024 * 1024;

/// Depth of the PES extractor's PTS-ordered reorder list.
pub const PES_ORDERED_LIST_DEPTH: usize = 10;

/// PTS gap used to detect a 33-bit PTS wrap when reordering PES output.
pub const PES_PTS_WRAP_GUARD: u64 = 10 * 90_000;

/// Default max payload size for a smoother queue item (7 TS packets).
pub const SMOOTHER_ITEM_BYTES: usize = 7 * 188;

/// Batch size the smoother's freelist grows by once exhausted.
pub const SMOOTHER_FREELIST_GROWTH: usize = 64;

/// Chunk size (in TS packets) a PCR interval is broken into before enqueue.
pub const SMOOTHER_CHUNK_PACKETS: usize = 7;

/// Scheduler wake cadence while idle.
pub const SMOOTHER_WAKE_INTERVAL: Duration = Duration::from_micros(50);

/// A PCR jump larger than this (either direction) is treated as a reset.
pub const SMOOTHER_PCR_RESET_THRESHOLD: Duration = Duration::from_secs(15);

/// The smoother re-anchors periodically even with no detected reset, to bound drift.
pub const SMOOTHER_ANCHOR_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// TR 101 290 event loop poll cadence.
pub const MONITOR_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// TR 101 290 PAT/PMT timer cadence (per ETSI TR 101 290 5.2.1).
pub const MONITOR_PSI_TIMER_INTERVAL: Duration = Duration::from_millis(500);

/// How often a full alarm-table summary line is appended to the log file.
pub const MONITOR_SUMMARY_INTERVAL: Duration = Duration::from_secs(60);

/// Interval the stream model gates writes to `next` after a ROM promotion,
/// to avoid a flapping PAT producing a torn intermediate model.
pub const MODEL_WRITE_GATE_INTERVAL: Duration = Duration::from_millis(500);

/// Maximum time `next` may remain an incomplete PAT/PMT tree before it is
/// force-reset and collection restarts from scratch.
pub const MODEL_PMT_COLLECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// No packets written at all for this long is treated as P1.1 TS sync loss.
pub const MONITOR_SYNC_LOSS_TIMEOUT: Duration = Duration::from_secs(5);

/// An expected elementary PID not observed for this long raises P1.6.
pub const MONITOR_PID_ERROR_TIMEOUT: Duration = Duration::from_secs(5);

/// A stream declaring PTS without one for this long raises P2.5.
pub const MONITOR_PTS_ERROR_TIMEOUT: Duration = Duration::from_millis(700);
