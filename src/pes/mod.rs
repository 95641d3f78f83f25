//! # PES extractor
//!
//! Reassembles Packetized Elementary Stream packets for a single PID from a
//! sequence of TS packets. Ported from `pes-extractor.c`'s ring-buffer state
//! machine (`ctx->appending` 0/1/2), generalized from the teacher's
//! `format::ts::demuxer::PESBuilder` (which only accumulates until
//! `take_data` is called once, with no reassembly of subsequent PES packets
//! or trimming).
//!
//! State machine, per TS packet on the extractor's PID:
//!
//! - Idle, packet carries `payload_unit_start`: start collecting (Collecting).
//! - Collecting, packet carries `payload_unit_start`: this is the *next*
//!   PES's first packet; append its payload to the ring (so the boundary
//!   between the two PES packets is findable from the end of the ring),
//!   then process and trim the ring, and stay in Collecting for the new PES.
//! - Any other packet while not Idle: append its payload to the ring.

use crate::config::{
    PES_ORDERED_LIST_DEPTH, PES_PTS_WRAP_GUARD, PES_RING_HARD_CAP, PES_RING_SOFT_CAP,
};
use crate::error::TsError;
use crate::ts::TsPacket;
use crate::utils::BitReader;
use crate::Result;
use bytes::{Bytes, BytesMut};

const MAX_PTS_VALUE: u64 = 1 << 33;

/// A reassembled PES packet.
#[derive(Debug, Clone)]
pub struct PesPacket {
    /// The PES stream_id byte (e.g. 0xE0 for video, 0xC0-0xDF for audio).
    pub stream_id: u8,
    /// Presentation Time Stamp, if one was present in the header.
    pub pts: Option<u64>,
    /// Decoding Time Stamp, if one was present in the header.
    pub dts: Option<u64>,
    /// The reassembled elementary-stream payload bytes.
    pub payload: Bytes,
}

/// Configuration for a [`PesExtractor`].
#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// PID this extractor reassembles. Packets on other PIDs are ignored by
    /// [`PesExtractor::write`].
    pub pid: u16,
    /// Expected PES `stream_id` byte on this PID. [`PesExtractor::write`]
    /// only recognizes a `{00,00,01,stream_id}` signature matching this
    /// value exactly.
    pub stream_id: u8,
    /// When set, delivered PES packets are reordered into ascending PTS
    /// order (with 33-bit wraparound correction) before being returned,
    /// at the cost of up to [`PES_ORDERED_LIST_DEPTH`] packets of latency.
    pub ordered_output: bool,
    /// Ring size past which a non-fatal loss event is signalled (via
    /// [`PesExtractor::loss_events`]) but collection continues.
    pub ring_min: usize,
    /// Ring size past which the in-progress PES is discarded and the ring
    /// reset (a fatal-for-that-PES overflow, not for the extractor).
    pub ring_max: usize,
    /// When set, the elementary-stream payload is not copied into
    /// delivered [`PesPacket`]s (`payload` is left empty); only the parsed
    /// header fields (`stream_id`, `pts`, `dts`) are populated. Useful when
    /// only timing information is needed and copying the payload would be
    /// wasted work.
    pub skip_payload_copy: bool,
}

impl ExtractorConfig {
    /// Creates a config for `pid`/`stream_id` with ordered output disabled
    /// and the default soft/hard ring caps.
    pub fn new(pid: u16, stream_id: u8) -> Self {
        Self {
            pid,
            stream_id,
            ordered_output: false,
            ring_min: PES_RING_SOFT_CAP,
            ring_max: PES_RING_HARD_CAP,
            skip_payload_copy: false,
        }
    }

    /// Enables PTS-ordered output.
    pub fn with_ordered_output(mut self, ordered: bool) -> Self {
        self.ordered_output = ordered;
        self
    }

    /// Overrides the soft/hard ring caps.
    pub fn with_ring_caps(mut self, ring_min: usize, ring_max: usize) -> Self {
        self.ring_min = ring_min;
        self.ring_max = ring_max;
        self
    }

    /// Enables skip-payload-copy mode (see [`ExtractorConfig::skip_payload_copy`]).
    pub fn with_skip_payload_copy(mut self, skip: bool) -> Self {
        self.skip_payload_copy = skip;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Collecting,
}

struct OrderedItem {
    corrected_pts: u64,
    pes: PesPacket,
}

/// Reassembles PES packets for one PID.
pub struct PesExtractor {
    config: ExtractorConfig,
    ring: BytesMut,
    state: State,
    ordered_list: Vec<OrderedItem>,
    ordered_base_time: u64,
    last_delivered_pts: u64,
    last_processed_offset: usize,
    loss_events: u64,
    soft_cap_tripped: bool,
}

impl PesExtractor {
    /// Creates an extractor for `config.pid`.
    pub fn new(config: ExtractorConfig) -> Self {
        Self {
            config,
            ring: BytesMut::new(),
            state: State::Idle,
            ordered_list: Vec::new(),
            ordered_base_time: 0,
            last_delivered_pts: 0,
            last_processed_offset: 0,
            loss_events: 0,
            soft_cap_tripped: false,
        }
    }

    /// Count of times the ring has crossed `ring_min` since construction
    /// (or since the last hard-cap reset). Each crossing is a non-fatal
    /// signal that this PID's PES packets are unusually large; collection
    /// is not interrupted.
    pub fn loss_events(&self) -> u64 {
        self.loss_events
    }

    /// Feeds one TS packet. Packets not on this extractor's PID are a no-op.
    /// Returns any PES packets that became ready to deliver as a result.
    pub fn write(&mut self, pkt: &TsPacket) -> Result<Vec<PesPacket>> {
        if pkt.pid() != self.config.pid {
            return Ok(Vec::new());
        }

        let mut process_now = false;
        if pkt.header.payload_unit_start {
            match self.state {
                State::Idle => self.state = State::Collecting,
                State::Collecting => process_now = true,
            }
        }

        if self.state != State::Idle {
            if self.ring.len() + pkt.payload().len() > self.config.ring_max {
                log::warn!(
                    "PES ring for PID 0x{:x} hit hard cap ({} bytes), discarding in-progress PES",
                    self.config.pid,
                    self.config.ring_max
                );
                self.ring.clear();
                self.state = State::Idle;
                self.soft_cap_tripped = false;
                return Err(TsError::InvalidData(
                    "PES ring exceeded hard cap, resetting".into(),
                ));
            }
            self.ring.extend_from_slice(pkt.payload());
            if !self.soft_cap_tripped && self.ring.len() > self.config.ring_min {
                self.soft_cap_tripped = true;
                self.loss_events += 1;
                log::debug!(
                    "PES ring for PID 0x{:x} crossed soft cap ({} bytes)",
                    self.config.pid,
                    self.config.ring_min
                );
            }
        }

        if process_now {
            if let Some(pes) = self.process_ring()? {
                self.trim_ring();
                self.state = State::Collecting;
                return Ok(self.deliver(pes));
            }
            self.state = State::Collecting;
        }

        Ok(Vec::new())
    }

    fn search_reverse(&self) -> Option<usize> {
        let ring = &self.ring[..];
        if ring.len() < 4 {
            return None;
        }
        for offset in (0..=ring.len() - 4).rev() {
            if ring[offset] == 0x00
                && ring[offset + 1] == 0x00
                && ring[offset + 2] == 0x01
                && ring[offset + 3] == self.config.stream_id
            {
                return Some(offset);
            }
        }
        None
    }

    /// Looks for the start of the newly-appended PES inside the ring and,
    /// if found far enough in to leave a complete prior PES, parses and
    /// returns that prior PES. Returns `Ok(None)` when more data is needed,
    /// mirroring `_processRing`'s `-1` ("need more data") return.
    fn process_ring(&mut self) -> Result<Option<PesPacket>> {
        if self.ring.len() < 16 {
            return Ok(None);
        }
        let offset = match self.search_reverse() {
            Some(o) if o >= 16 => o,
            _ => return Ok(None),
        };

        let mut candidate = self.ring[..offset].to_vec();
        self.last_processed_offset = offset;
        apply_audio_length_correction(&mut candidate, self.config.stream_id);
        parse_pes(&candidate, self.config.skip_payload_copy).map(Some)
    }

    /// Discards everything up to (not including) the start of the next
    /// PES's `{00,00,01,stream_id}` signature found by [`Self::search_reverse`].
    /// Bytes preceding that signature belong to the PES just parsed and
    /// must not be retained; retaining any of them would make the next
    /// `parse_pes` call fail its start-code check.
    fn trim_ring(&mut self) {
        let keep_from = self.last_processed_offset;
        let _ = self.ring.split_to(keep_from);
        self.soft_cap_tripped = false;
    }

    fn deliver(&mut self, pes: PesPacket) -> Vec<PesPacket> {
        if !self.config.ordered_output {
            if let Some(pts) = pes.pts {
                self.last_delivered_pts = pts;
            }
            return vec![pes];
        }

        let mut out = Vec::new();
        if self.ordered_list.len() >= PES_ORDERED_LIST_DEPTH {
            out.push(self.ordered_list.remove(0).pes);
        }

        let raw_pts = pes.pts.unwrap_or(self.last_delivered_pts);
        if raw_pts + PES_PTS_WRAP_GUARD < self.last_delivered_pts {
            self.ordered_base_time += MAX_PTS_VALUE;
        }
        self.last_delivered_pts = raw_pts;
        let corrected_pts = self.ordered_base_time + raw_pts;

        let insert_at = self
            .ordered_list
            .iter()
            .position(|item| item.corrected_pts > corrected_pts)
            .unwrap_or(self.ordered_list.len());
        self.ordered_list.insert(
            insert_at,
            OrderedItem {
                corrected_pts,
                pes,
            },
        );

        out
    }

    /// Drains any PES packets still held in the ordered-output reorder
    /// list, oldest first. Call when the input stream has ended.
    pub fn flush(&mut self) -> Vec<PesPacket> {
        self.ordered_list.drain(..).map(|item| item.pes).collect()
    }
}

fn read_timestamp(bs: &mut BitReader) -> Result<u64> {
    bs.skip_bits(4)?;
    let high = bs.read_bits(3)?;
    bs.skip_bits(1)?;
    let mid = bs.read_bits(15)?;
    bs.skip_bits(1)?;
    let low = bs.read_bits(15)?;
    bs.skip_bits(1)?;
    Ok((high << 30) | (mid << 15) | low)
}

/// Private-stream/audio declared-length correction (§4.2). When the PES
/// header's declared `PES_packet_length` claims more bytes than the ring
/// actually holds for this PES, the ring only contains a partial frame.
/// For AC-3 (`stream_id == 0xBD`) and MPEG/AAC audio (`0xC0..=0xDF`) we
/// rewrite the declared length in place to end at the last complete sync
/// word found after the header, or to zero (header-only) if none is
/// found, so the parser never reads past what was actually collected.
fn apply_audio_length_correction(data: &mut [u8], stream_id: u8) {
    let is_ac3 = stream_id == 0xBD;
    let is_mpeg_audio = (0xC0..=0xDF).contains(&stream_id);
    if !is_ac3 && !is_mpeg_audio {
        return;
    }
    if data.len() < 6 {
        return;
    }

    let declared_length = ((data[4] as usize) << 8) | data[5] as usize;
    let have = data.len();
    let needed = declared_length + 6;
    if needed <= have {
        return;
    }

    let mut last_complete_frame = 6;
    let mut found_frame = false;
    if data.len() >= 8 {
        if is_ac3 {
            for i in 6..data.len() - 1 {
                if data[i] == 0x0B && data[i + 1] == 0x77 {
                    last_complete_frame = i;
                    found_frame = true;
                }
            }
        } else {
            for i in 6..data.len() - 1 {
                if data[i] == 0xFF && (data[i + 1] & 0xF0 == 0xF0 || data[i + 1] & 0xF0 == 0xE0) {
                    last_complete_frame = i;
                    found_frame = true;
                }
            }
        }
    }

    if found_frame {
        let adjusted_len = (last_complete_frame - 6) as u16;
        if adjusted_len > 0 {
            data[4] = (adjusted_len >> 8) as u8;
            data[5] = (adjusted_len & 0xFF) as u8;
        }
    } else {
        data[4] = 0x00;
        data[5] = 0x00;
    }
}

fn parse_pes(data: &[u8], skip_payload_copy: bool) -> Result<PesPacket> {
    if data.len() < 9 || data[0] != 0x00 || data[1] != 0x00 || data[2] != 0x01 {
        return Err(TsError::Parse("missing PES start code".into()));
    }
    let stream_id = data[3];
    let declared_length = ((data[4] as usize) << 8) | data[5] as usize;

    let mut bs = BitReader::new(&data[6..]);
    bs.skip_bits(2)?; // '10'
    bs.skip_bits(2)?; // scrambling control
    bs.skip_bits(1)?; // priority
    bs.skip_bits(1)?; // data alignment indicator
    bs.skip_bits(1)?; // copyright
    bs.skip_bits(1)?; // original or copy
    let pts_dts_flags = bs.read_bits(2)?;
    bs.skip_bits(6)?; // remaining flag byte (escr/es_rate/dsm_trick/copy_info/crc/extension)
    let header_data_length = bs.read_bits(8)? as usize;

    let mut pts = None;
    let mut dts = None;
    let header_start = 9;
    if pts_dts_flags == 0b10 {
        pts = Some(read_timestamp(&mut bs)?);
    } else if pts_dts_flags == 0b11 {
        pts = Some(read_timestamp(&mut bs)?);
        dts = Some(read_timestamp(&mut bs)?);
    }

    let payload_start = header_start + header_data_length;
    if payload_start > data.len() {
        return Err(TsError::Parse("PES header_data_length past buffer".into()));
    }
    if bs.is_overrun() {
        return Err(TsError::Overrun);
    }

    let declared_payload_end = if declared_length > 0 {
        (6 + declared_length).min(data.len())
    } else {
        data.len()
    };
    let end = declared_payload_end.max(payload_start);

    let payload = if skip_payload_copy {
        Bytes::new()
    } else {
        Bytes::copy_from_slice(&data[payload_start..end])
    };

    Ok(PesPacket {
        stream_id,
        pts,
        dts,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ts::TS_PACKET_SIZE;

    fn build_pes(stream_id: u8, pts: Option<u64>, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0x00, 0x00, 0x01, stream_id];
        let pts_dts_flags: u8 = if pts.is_some() { 0b10 } else { 0 };
        let header_data_length: u8 = if pts.is_some() { 5 } else { 0 };
        let mut header = Vec::new();
        header.push(0x80); // '10' + flags
        header.push(pts_dts_flags << 6);
        header.push(header_data_length);
        if let Some(pts) = pts {
            header.extend_from_slice(&encode_timestamp(0b0010, pts));
        }
        let total_len = (header.len() + payload.len()) as u16;
        out.push((total_len >> 8) as u8);
        out.push((total_len & 0xFF) as u8);
        out.extend_from_slice(&header);
        out.extend_from_slice(payload);
        out
    }

    fn encode_timestamp(marker: u8, pts: u64) -> [u8; 5] {
        let b0 = (marker << 4) | (((pts >> 30) & 0x07) as u8) << 1 | 1;
        let mid = ((pts >> 15) & 0x7FFF) as u16;
        let b1 = (mid >> 7) as u8;
        let b2 = (((mid & 0x7F) as u8) << 1) | 1;
        let low = (pts & 0x7FFF) as u16;
        let b3 = (low >> 7) as u8;
        let b4 = (((low & 0x7F) as u8) << 1) | 1;
        [b0, b1, b2, b3, b4]
    }

    fn ts_packets_for(pid: u16, pes_bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();
        let mut remaining = pes_bytes;
        let mut first = true;
        while !remaining.is_empty() || first {
            let mut buf = vec![0xFFu8; TS_PACKET_SIZE];
            buf[0] = crate::ts::SYNC_BYTE;
            buf[1] = (if first { 0x40 } else { 0 }) | ((pid >> 8) as u8 & 0x1F);
            buf[2] = (pid & 0xFF) as u8;
            buf[3] = 0x10;
            let space = TS_PACKET_SIZE - 4;
            let take = remaining.len().min(space);
            buf[4..4 + take].copy_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
            packets.push(buf);
            first = false;
            if remaining.is_empty() {
                break;
            }
        }
        packets
    }

    #[test]
    fn reassembles_single_pes_on_next_pusi() {
        let mut extractor = PesExtractor::new(ExtractorConfig::new(0x101, 0xE0));
        let first = build_pes(0xE0, Some(90_000), &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        let second = build_pes(0xE0, Some(93_000), &[9, 9, 9]);

        for pkt in ts_packets_for(0x101, &first) {
            let delivered = extractor.write(&TsPacket::parse(&pkt).unwrap()).unwrap();
            assert!(delivered.is_empty());
        }

        let mut delivered = Vec::new();
        for pkt in ts_packets_for(0x101, &second) {
            delivered.extend(extractor.write(&TsPacket::parse(&pkt).unwrap()).unwrap());
        }

        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].pts, Some(90_000));
        assert_eq!(&delivered[0].payload[..], &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10][..]);
    }

    /// Regression test for a `trim_ring` bug where trimming 3 bytes short
    /// of `last_processed_offset` left junk ahead of the next PES's start
    /// code, so only the first PES on a PID was ever delivered. Feeding a
    /// 3rd PES must still deliver the 2nd PES correctly.
    #[test]
    fn reassembles_three_consecutive_pes_on_one_pid() {
        let mut extractor = PesExtractor::new(ExtractorConfig::new(0x101, 0xE0));
        let first = build_pes(0xE0, Some(90_000), &[1, 2, 3, 4, 5]);
        let second = build_pes(0xE0, Some(93_000), &[6, 7, 8, 9, 10]);
        let third = build_pes(0xE0, Some(96_000), &[11, 12, 13]);

        let mut delivered = Vec::new();
        for pes in [&first, &second, &third] {
            for pkt in ts_packets_for(0x101, pes) {
                delivered.extend(extractor.write(&TsPacket::parse(&pkt).unwrap()).unwrap());
            }
        }

        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].pts, Some(90_000));
        assert_eq!(&delivered[0].payload[..], &[1, 2, 3, 4, 5][..]);
        assert_eq!(delivered[1].pts, Some(93_000));
        assert_eq!(&delivered[1].payload[..], &[6, 7, 8, 9, 10][..]);

        let flushed = extractor.flush();
        assert!(flushed.is_empty());
    }

    #[test]
    fn ring_soft_cap_counts_a_loss_event_without_dropping_data() {
        let config = ExtractorConfig::new(0x101, 0xE0).with_ring_caps(32, 1_000_000);
        let mut extractor = PesExtractor::new(config);

        let big_payload = vec![0xABu8; 200];
        let first = build_pes(0xE0, Some(90_000), &big_payload);
        let second = build_pes(0xE0, Some(93_000), &[1]);

        for pkt in ts_packets_for(0x101, &first) {
            extractor.write(&TsPacket::parse(&pkt).unwrap()).unwrap();
        }
        assert!(extractor.loss_events() >= 1);

        let mut delivered = Vec::new();
        for pkt in ts_packets_for(0x101, &second) {
            delivered.extend(extractor.write(&TsPacket::parse(&pkt).unwrap()).unwrap());
        }
        assert_eq!(delivered.len(), 1);
        assert_eq!(&delivered[0].payload[..], &big_payload[..]);
    }

    #[test]
    fn ring_hard_cap_discards_the_in_progress_pes() {
        let config = ExtractorConfig::new(0x101, 0xE0).with_ring_caps(64, 100);
        let mut extractor = PesExtractor::new(config);

        let too_big = build_pes(0xE0, Some(90_000), &[0xAAu8; 500]);
        let mut saw_error = false;
        for pkt in ts_packets_for(0x101, &too_big) {
            if extractor.write(&TsPacket::parse(&pkt).unwrap()).is_err() {
                saw_error = true;
                break;
            }
        }
        assert!(saw_error);
    }

    #[test]
    fn ordered_output_reorders_by_pts() {
        let config = ExtractorConfig::new(0x101, 0xE0).with_ordered_output(true);
        let mut extractor = PesExtractor::new(config);

        let pes_a = build_pes(0xE0, Some(200_000), &[0xAA]);
        let pes_b = build_pes(0xE0, Some(100_000), &[0xBB]);
        let pes_c = build_pes(0xE0, Some(300_000), &[0xCC]);

        for pes in [&pes_a, &pes_b, &pes_c] {
            for pkt in ts_packets_for(0x101, pes) {
                extractor.write(&TsPacket::parse(&pkt).unwrap()).unwrap();
            }
        }
        let remaining = extractor.flush();
        let ptss: Vec<_> = remaining.iter().map(|p| p.pts).collect();
        let mut sorted = ptss.clone();
        sorted.sort();
        assert_eq!(ptss, sorted);
    }
}
