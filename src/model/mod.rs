//! # Stream model
//!
//! A continuously-fed, double-buffered PAT/PMT model of a transport stream.
//! Ported from `streammodel.c`'s two-ROM-slot design: a complete, internally
//! consistent snapshot (`current`) is swapped in only once a new PAT and all
//! of the PMTs it references have been collected (`next`/`building`), so a
//! reader never observes a PAT referencing a PMT that hasn't parsed yet.
//!
//! This generalizes the teacher's `format::ts::demuxer::TSDemuxer`, which
//! parses the first PAT/PMT it sees once and never re-arms; here a PAT
//! version change restarts collection and the model re-synchronizes.

use crate::config::{MODEL_PMT_COLLECTION_TIMEOUT, MODEL_WRITE_GATE_INTERVAL};
use crate::ts::{Pat, Pmt, TsPacket, PID_PAT, TABLE_ID_PAT};
use crate::Result;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

/// A complete, consistent snapshot of a transport stream's structure.
#[derive(Debug, Clone)]
pub struct Model {
    /// The PAT section that drove this snapshot's collection.
    pub pat: Pat,
    /// PMTs keyed by program_number, one per non-zero PAT entry.
    pub pmts: HashMap<u16, Pmt>,
}

impl Model {
    /// Whether more than one program is present (a multi-program TS).
    pub fn is_mpts(&self) -> bool {
        self.pat.entries.iter().filter(|e| e.program_number != 0).count() > 1
    }

    /// The PCR PID of the first program listed in the PAT, if its PMT has
    /// been collected.
    pub fn first_program_pcr_pid(&self) -> Option<u16> {
        self.pat
            .entries
            .iter()
            .find(|e| e.program_number != 0)
            .and_then(|e| self.pmts.get(&e.program_number))
            .map(|pmt| pmt.pcr_pid)
    }
}

struct Building {
    pat: Option<Pat>,
    pmts: HashMap<u16, Pmt>,
    /// PID -> set of program_numbers still expected on that PID. Usually
    /// one program per PID, but spec.md §4.3 "PMT inventory" allows several
    /// PMTs to share one PID for distinct program numbers, so this tracks
    /// per-program rather than per-PID completion.
    pending_pmts_by_pid: HashMap<u16, HashSet<u16>>,
    started_at: Instant,
}

impl Building {
    fn new() -> Self {
        Self {
            pat: None,
            pmts: HashMap::new(),
            pending_pmts_by_pid: HashMap::new(),
            started_at: Instant::now(),
        }
    }

    fn is_complete(&self) -> bool {
        self.pat.is_some() && self.pending_pmts_by_pid.is_empty()
    }

    fn timed_out(&self) -> bool {
        self.started_at.elapsed() > MODEL_PMT_COLLECTION_TIMEOUT
    }
}

/// A continuously-updated PAT/PMT model, safe to read from one thread while
/// being fed from another.
pub struct StreamModel {
    current: RwLock<Option<Arc<Model>>>,
    building: RwLock<Building>,
    section_callback: Option<Box<dyn Fn(SectionEvent) + Send + Sync>>,
    /// Set the instant a ROM promotes; writes to `building` are silently
    /// discarded until this elapses, so a flapping PAT can't produce a
    /// torn intermediate model (spec.md §4.3 "Write gating").
    gated_until: RwLock<Option<Instant>>,
}

/// Delivered to an optional callback so the TR 101 290 monitor can derive
/// PAT_ERROR/PMT_ERROR (and their CRC-failure variants) without the stream
/// model needing to know anything about alarms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionEvent {
    /// A PAT section was parsed and its CRC32 checked out.
    PatValid,
    /// A PAT section's CRC32 did not match.
    PatInvalid,
    /// A PMT section was parsed and its CRC32 checked out.
    PmtValid {
        /// The program number this PMT describes.
        program_number: u16,
    },
    /// A PMT section's CRC32 did not match.
    PmtInvalid {
        /// The PID the bad section arrived on.
        pid: u16,
    },
}

impl StreamModel {
    /// Creates an empty model with no section-event callback.
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
            building: RwLock::new(Building::new()),
            section_callback: None,
            gated_until: RwLock::new(None),
        }
    }

    /// Creates a model that reports PAT/PMT CRC validity to `callback`, the
    /// hook `streammodel.h` calls
    /// `ltntstools_streammodel_enable_tr101290_section_checks`.
    pub fn with_section_callback<F>(callback: F) -> Self
    where
        F: Fn(SectionEvent) + Send + Sync + 'static,
    {
        Self {
            current: RwLock::new(None),
            building: RwLock::new(Building::new()),
            section_callback: Some(Box::new(callback)),
            gated_until: RwLock::new(None),
        }
    }

    fn notify(&self, event: SectionEvent) {
        if let Some(cb) = &self.section_callback {
            cb(event);
        }
    }

    /// The most recently promoted, internally consistent snapshot.
    pub fn snapshot(&self) -> Option<Arc<Model>> {
        self.current.read().clone()
    }

    fn section_payload<'a>(pkt: &TsPacket<'a>) -> Option<&'a [u8]> {
        if !pkt.header.payload_unit_start {
            return None;
        }
        let payload = pkt.payload();
        let pointer = *payload.first()? as usize;
        payload.get(1 + pointer..)
    }

    /// Feeds one TS packet into the model. Returns `true` exactly when this
    /// packet completed a new snapshot (a PAT plus every PMT it lists).
    pub fn write(&self, pkt: &TsPacket) -> Result<bool> {
        if let Some(gate) = *self.gated_until.read() {
            if Instant::now() < gate {
                return Ok(false);
            }
        }

        if pkt.pid() == PID_PAT {
            return self.handle_pat_packet(pkt);
        }

        let (pending, needs_reset) = {
            let building = self.building.read();
            (
                building.pending_pmts_by_pid.contains_key(&pkt.pid()),
                building.pat.is_some() && !building.is_complete() && building.timed_out(),
            )
        };
        if pending {
            return self.handle_pmt_packet(pkt);
        }
        if needs_reset {
            *self.building.write() = Building::new();
        }
        Ok(false)
    }

    fn handle_pat_packet(&self, pkt: &TsPacket) -> Result<bool> {
        let Some(section) = Self::section_payload(pkt) else {
            return Ok(false);
        };
        if section.is_empty() || section[0] != TABLE_ID_PAT {
            return Ok(false);
        }
        let pat = match Pat::parse(section) {
            Ok(pat) => pat,
            Err(_) => {
                self.notify(SectionEvent::PatInvalid);
                return Ok(false);
            }
        };
        self.notify(SectionEvent::PatValid);

        let mut building = self.building.write();
        let is_new_version = building
            .pat
            .as_ref()
            .map(|existing| existing.version != pat.version)
            .unwrap_or(true);
        if !is_new_version {
            return Ok(false);
        }

        let mut pending_pmts_by_pid: HashMap<u16, HashSet<u16>> = HashMap::new();
        for entry in pat.entries.iter().filter(|e| e.program_number != 0) {
            pending_pmts_by_pid
                .entry(entry.pid)
                .or_default()
                .insert(entry.program_number);
        }
        *building = Building {
            pat: Some(pat),
            pmts: HashMap::new(),
            pending_pmts_by_pid,
            started_at: Instant::now(),
        };
        self.maybe_promote(building)
    }

    fn handle_pmt_packet(&self, pkt: &TsPacket) -> Result<bool> {
        let Some(section) = Self::section_payload(pkt) else {
            return Ok(false);
        };
        let pmt = match Pmt::parse(section) {
            Ok(pmt) => pmt,
            Err(_) => {
                self.notify(SectionEvent::PmtInvalid { pid: pkt.pid() });
                return Ok(false);
            }
        };
        self.notify(SectionEvent::PmtValid {
            program_number: pmt.program_number,
        });

        let mut building = self.building.write();
        let was_pending = match building.pending_pmts_by_pid.get_mut(&pkt.pid()) {
            Some(set) => {
                let removed = set.remove(&pmt.program_number);
                if set.is_empty() {
                    building.pending_pmts_by_pid.remove(&pkt.pid());
                }
                removed
            }
            None => false,
        };
        if !was_pending {
            return Ok(false);
        }
        building.pmts.insert(pmt.program_number, pmt);
        self.maybe_promote(building)
    }

    fn maybe_promote(
        &self,
        mut building: parking_lot::RwLockWriteGuard<Building>,
    ) -> Result<bool> {
        if !building.is_complete() {
            return Ok(false);
        }
        let model = Arc::new(Model {
            pat: building.pat.take().unwrap(),
            pmts: std::mem::take(&mut building.pmts),
        });
        log::info!(
            "stream model promoted: {} program(s), transport_stream_id={}",
            model.pat.entries.len(),
            model.pat.transport_stream_id
        );
        *self.current.write() = Some(model);
        *building = Building::new();
        *self.gated_until.write() = Some(Instant::now() + MODEL_WRITE_GATE_INTERVAL);
        Ok(true)
    }
}

impl Default for StreamModel {
    fn default() -> Self {
        Self::new()
    }
}
