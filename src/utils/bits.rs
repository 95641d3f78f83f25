//! # Bit-accurate reader and writer
//!
//! MSB-first bitstream primitives used by every parser and serializer in
//! this crate: PES headers, PSI sections, and adaptation-field PCR fields
//! all pack fields across byte boundaries with widths up to 42 bits.
//!
//! The overrun flag is sticky (per `klbs_context_s.overrun` in the reference
//! C bitstream library this is ported from): once a read or write runs past
//! its buffer, every subsequent operation fails immediately without
//! mutating position state further, and the flag stays set until the
//! reader/writer is rebuilt. Callers parsing a multi-field structure should
//! finish the structure, then check [`BitReader::is_overrun`] once rather
//! than unwrapping every individual field read.

use crate::error::TsError;
use crate::Result;
use bytes::{BufMut, Bytes, BytesMut};

/// Reads an MSB-first bitstream of 1..=64 bits per call.
pub struct BitReader<'a> {
    data: &'a [u8],
    byte_pos: usize,
    bit_pos: u8,
    overrun: bool,
}

impl<'a> BitReader<'a> {
    /// Wraps `data` for bit-level reading starting at its first bit.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            byte_pos: 0,
            bit_pos: 0,
            overrun: false,
        }
    }

    /// Whether a prior read ran past the end of the buffer. Sticky until
    /// the reader is rebuilt; callers must not trust partial results
    /// produced after this becomes `true`.
    pub fn is_overrun(&self) -> bool {
        self.overrun
    }

    /// Number of whole bits remaining in the buffer.
    pub fn bits_remaining(&self) -> usize {
        (self.data.len() * 8).saturating_sub(self.byte_pos * 8 + self.bit_pos as usize)
    }

    /// Reads `count` bits (1..=64) and advances the position.
    pub fn read_bits(&mut self, count: u32) -> Result<u64> {
        if self.overrun {
            return Err(TsError::Overrun);
        }
        if count == 0 || count > 64 {
            return Err(TsError::InvalidData(format!(
                "read_bits: count {} out of range 1..=64",
                count
            )));
        }
        if count as usize > self.bits_remaining() {
            self.overrun = true;
            return Err(TsError::Overrun);
        }

        let mut result: u64 = 0;
        let mut bits_left = count;
        while bits_left > 0 {
            let byte = self.data[self.byte_pos];
            let bits_in_byte = 8 - self.bit_pos;
            let bits_to_read = bits_in_byte.min(bits_left as u8);

            let mask = ((1u16 << bits_to_read) - 1) as u8;
            let shifted = (byte >> (8 - self.bit_pos - bits_to_read)) & mask;

            result = (result << bits_to_read) | shifted as u64;

            self.bit_pos += bits_to_read;
            if self.bit_pos >= 8 {
                self.byte_pos += 1;
                self.bit_pos = 0;
            }
            bits_left -= bits_to_read as u32;
        }
        Ok(result)
    }

    /// Reads `count` bits without advancing the position, by snapshotting
    /// and restoring the reader's (byte, bit) cursor. Mirrors
    /// `klbs_peek_bits`'s implicit struct copy.
    pub fn peek_bits(&mut self, count: u32) -> Result<u64> {
        let byte_pos = self.byte_pos;
        let bit_pos = self.bit_pos;
        let overrun = self.overrun;
        let result = self.read_bits(count);
        self.byte_pos = byte_pos;
        self.bit_pos = bit_pos;
        self.overrun = overrun;
        result
    }

    /// Advances the cursor by `count` bits without returning them.
    pub fn skip_bits(&mut self, count: u32) -> Result<()> {
        if self.overrun {
            return Err(TsError::Overrun);
        }
        if count as usize > self.bits_remaining() {
            self.overrun = true;
            return Err(TsError::Overrun);
        }
        let new_pos = self.byte_pos * 8 + self.bit_pos as usize + count as usize;
        self.byte_pos = new_pos / 8;
        self.bit_pos = (new_pos % 8) as u8;
        Ok(())
    }

    /// Advances to the next byte boundary, discarding any stuffing bits.
    pub fn align_to_byte(&mut self) {
        if self.bit_pos > 0 {
            self.byte_pos += 1;
            self.bit_pos = 0;
        }
    }

    /// Drains `count` bits from `self` into `dst`, used by code that
    /// rewrites a field in place while copying the rest of a structure
    /// through unchanged. Ported from `klbs_bitmove`.
    pub fn bit_move(&mut self, dst: &mut BitWriter, count: u32) -> Result<()> {
        let mut remaining = count;
        while remaining > 0 {
            let chunk = remaining.min(32);
            let bits = self.read_bits(chunk)?;
            dst.write_bits(bits, chunk)?;
            remaining -= chunk;
        }
        Ok(())
    }
}

/// Writes an MSB-first bitstream of 1..=64 bits per call into a growable
/// buffer, with an optional hard capacity.
pub struct BitWriter {
    buf: BytesMut,
    reg: u8,
    reg_bits: u8,
    overrun: bool,
    max_bytes: Option<usize>,
}

impl BitWriter {
    /// Creates an empty writer with no capacity limit.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            reg: 0,
            reg_bits: 0,
            overrun: false,
            max_bytes: None,
        }
    }

    /// Creates a writer that fails with [`TsError::Overrun`] once `max_bytes`
    /// of output would be produced.
    pub fn with_capacity_limit(max_bytes: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(max_bytes),
            reg: 0,
            reg_bits: 0,
            overrun: false,
            max_bytes: Some(max_bytes),
        }
    }

    /// Whether a prior write ran past the configured capacity limit.
    pub fn is_overrun(&self) -> bool {
        self.overrun
    }

    fn push_byte(&mut self, byte: u8) -> Result<()> {
        if let Some(max) = self.max_bytes {
            if self.buf.len() >= max {
                self.overrun = true;
                return Err(TsError::Overrun);
            }
        }
        self.buf.put_u8(byte);
        Ok(())
    }

    /// Writes the low `count` bits (1..=64) of `value`, most-significant
    /// bit first.
    pub fn write_bits(&mut self, value: u64, count: u32) -> Result<()> {
        if self.overrun {
            return Err(TsError::Overrun);
        }
        if count == 0 || count > 64 {
            return Err(TsError::InvalidData(format!(
                "write_bits: count {} out of range 1..=64",
                count
            )));
        }

        let mut bits_left = count;
        while bits_left > 0 {
            let room = 8 - self.reg_bits;
            let take = room.min(bits_left as u8);
            let shift = bits_left - take as u32;
            let chunk = ((value >> shift) & ((1u64 << take) - 1)) as u8;

            // `take` can be 8 when the register is empty (`reg_bits == 0`,
            // so `reg` is already 0); `u8 << 8` would panic as an overflowing
            // shift even though the value is zero.
            self.reg = if take >= 8 { chunk } else { (self.reg << take) | chunk };
            self.reg_bits += take;
            bits_left -= take as u32;

            if self.reg_bits == 8 {
                let byte = self.reg;
                self.reg = 0;
                self.reg_bits = 0;
                self.push_byte(byte)?;
            }
        }
        Ok(())
    }

    /// Pads the in-progress byte with `1` bits up to the next byte
    /// boundary, per the stuffing convention PES/PSI streams use between
    /// structural units.
    pub fn byte_stuff(&mut self) -> Result<()> {
        if self.reg_bits > 0 {
            let pad = 8 - self.reg_bits;
            self.write_bits((1u64 << pad) - 1, pad as u32)?;
        }
        Ok(())
    }

    /// Pads the in-progress byte with `0` bits up to the next byte
    /// boundary, for formats that require zero alignment rather than
    /// one-stuffing.
    pub fn align_to_byte(&mut self) -> Result<()> {
        if self.reg_bits > 0 {
            let pad = 8 - self.reg_bits;
            self.write_bits(0, pad as u32)?;
        }
        Ok(())
    }

    /// Zero-pads any partial trailing byte and returns the accumulated
    /// output, consuming the writer. Mirrors `klbs_write_buffer_complete`.
    pub fn flush(mut self) -> Result<Bytes> {
        self.align_to_byte()?;
        Ok(self.buf.freeze())
    }
}

impl Default for BitWriter {
    fn default() -> Self {
        Self::new()
    }
}
