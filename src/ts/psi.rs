//! Program Specific Information section parsing: PAT and PMT.
//!
//! Byte layout ported from the teacher crate's
//! `format::ts::parser::TSPacketParser::{parse_pat, parse_pmt}`, generalized
//! to validate the trailing CRC32 (the teacher's parser ignored it) since
//! the stream model and the TR 101 290 monitor both need CRC validity to
//! decide whether a section is safe to promote.

use crate::error::TsError;
use crate::utils::Crc32Mpeg2;
use crate::Result;

use super::{TABLE_ID_PAT, TABLE_ID_PMT};

/// One program_number -> PID mapping inside a PAT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatEntry {
    /// Program number; 0 is reserved for the Network PID.
    pub program_number: u16,
    /// PID of the program's PMT (or, when `program_number == 0`, the NIT).
    pub pid: u16,
}

/// A parsed Program Association Table section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pat {
    /// Transport stream ID this PAT describes.
    pub transport_stream_id: u16,
    /// Section version number.
    pub version: u8,
    /// Program-number -> PID mappings this PAT carries.
    pub entries: Vec<PatEntry>,
}

/// A descriptor found in a PMT's program-level or ES-level descriptor loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Descriptor tag byte identifying its type.
    pub tag: u8,
    /// Raw descriptor payload, excluding the tag/length bytes.
    pub data: Vec<u8>,
}

/// One elementary stream entry inside a PMT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementaryStreamInfo {
    /// Stream type byte (e.g. 0x1B = H.264, 0x0F = AAC ADTS).
    pub stream_type: u8,
    /// PID carrying this elementary stream.
    pub elementary_pid: u16,
    /// ES-level descriptor loop for this elementary stream.
    pub descriptors: Vec<Descriptor>,
}

/// A parsed Program Map Table section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pmt {
    /// Program number this PMT describes.
    pub program_number: u16,
    /// Section version number.
    pub version: u8,
    /// PID carrying this program's PCR.
    pub pcr_pid: u16,
    /// Program-level descriptor loop.
    pub program_descriptors: Vec<Descriptor>,
    /// This program's elementary streams.
    pub elementary_stream_infos: Vec<ElementaryStreamInfo>,
}

fn verify_crc(data: &[u8]) -> Result<()> {
    if data.len() < 4 {
        return Err(TsError::InvalidData("section too short for CRC".into()));
    }
    let (body, crc_bytes) = data.split_at(data.len() - 4);
    let expected = u32::from_be_bytes(crc_bytes.try_into().unwrap());
    let actual = Crc32Mpeg2::new().calculate(body);
    if actual != expected {
        return Err(TsError::InvalidData(format!(
            "CRC mismatch: section says 0x{:08x}, computed 0x{:08x}",
            expected, actual
        )));
    }
    Ok(())
}

fn parse_descriptors(data: &[u8]) -> Result<Vec<Descriptor>> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos + 2 <= data.len() {
        let tag = data[pos];
        let len = data[pos + 1] as usize;
        pos += 2;
        if pos + len > data.len() {
            return Err(TsError::Parse("descriptor runs past its loop".into()));
        }
        out.push(Descriptor {
            tag,
            data: data[pos..pos + len].to_vec(),
        });
        pos += len;
    }
    Ok(out)
}

impl Pat {
    /// Parses a PAT section, including the trailing CRC32. `data` must
    /// start at the table_id byte and include the 4-byte CRC.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 8 + 4 {
            return Err(TsError::Parse("PAT section too short".into()));
        }
        if data[0] != TABLE_ID_PAT {
            return Err(TsError::Parse(format!(
                "expected PAT table_id 0x00, got 0x{:02x}",
                data[0]
            )));
        }
        let section_length = (((data[1] & 0x0F) as usize) << 8) | data[2] as usize;
        let total_length = 3 + section_length;
        if data.len() < total_length {
            return Err(TsError::Parse("PAT shorter than section_length".into()));
        }
        verify_crc(&data[..total_length])?;

        let transport_stream_id = ((data[3] as u16) << 8) | data[4] as u16;
        let version = (data[5] >> 1) & 0x1F;

        let mut entries = Vec::new();
        let mut pos = 8;
        while pos + 4 <= total_length - 4 {
            let program_number = ((data[pos] as u16) << 8) | data[pos + 1] as u16;
            let pid = (((data[pos + 2] & 0x1F) as u16) << 8) | data[pos + 3] as u16;
            entries.push(PatEntry { program_number, pid });
            pos += 4;
        }

        Ok(Self {
            transport_stream_id,
            version,
            entries,
        })
    }
}

impl Pmt {
    /// Parses a PMT section, including the trailing CRC32. `data` must
    /// start at the table_id byte and include the 4-byte CRC.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 12 + 4 {
            return Err(TsError::Parse("PMT section too short".into()));
        }
        if data[0] != TABLE_ID_PMT {
            return Err(TsError::Parse(format!(
                "expected PMT table_id 0x02, got 0x{:02x}",
                data[0]
            )));
        }
        let section_length = (((data[1] & 0x0F) as usize) << 8) | data[2] as usize;
        let total_length = 3 + section_length;
        if data.len() < total_length {
            return Err(TsError::Parse("PMT shorter than section_length".into()));
        }
        verify_crc(&data[..total_length])?;

        let program_number = ((data[3] as u16) << 8) | data[4] as u16;
        let version = (data[5] >> 1) & 0x1F;

        let mut pos = 8;
        let pcr_pid = (((data[pos] & 0x1F) as u16) << 8) | data[pos + 1] as u16;
        pos += 2;

        let program_info_length = (((data[pos] & 0x0F) as usize) << 8) | data[pos + 1] as usize;
        pos += 2;
        if pos + program_info_length > total_length - 4 {
            return Err(TsError::Parse("program_info_length runs past section".into()));
        }
        let program_descriptors = parse_descriptors(&data[pos..pos + program_info_length])?;
        pos += program_info_length;

        let mut elementary_stream_infos = Vec::new();
        while pos + 5 <= total_length - 4 {
            let stream_type = data[pos];
            let elementary_pid = (((data[pos + 1] & 0x1F) as u16) << 8) | data[pos + 2] as u16;
            let es_info_length = (((data[pos + 3] & 0x0F) as usize) << 8) | data[pos + 4] as usize;
            pos += 5;
            if pos + es_info_length > total_length - 4 {
                return Err(TsError::Parse("ES_info_length runs past section".into()));
            }
            let descriptors = parse_descriptors(&data[pos..pos + es_info_length])?;
            pos += es_info_length;
            elementary_stream_infos.push(ElementaryStreamInfo {
                stream_type,
                elementary_pid,
                descriptors,
            });
        }

        Ok(Self {
            program_number,
            version,
            pcr_pid,
            program_descriptors,
            elementary_stream_infos,
        })
    }
}
