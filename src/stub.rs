//! Stub container format.
//!
//! A stub file carries a Starch program as a set of sections behind a fixed
//! header and a random-access section directory:
//!
//! ```text
//! offset  size         field
//! 0       4            magic = 's','t','b',0x01
//! 4       4            maxnsec (u32 LE)
//! 8       4            nsec (u32 LE)
//! 12      25*maxnsec   section directory (unused slots zero-filled)
//!                      each slot: addr u64 | flags u8 | bfo u64 | efo u64
//! ...                  concatenated section data
//! ```
//!
//! The writer is two-pass: section bytes are streamed to the current file
//! position first, then [`save_section`] back-fills the directory entry from
//! the observed begin/end offsets. This lets the assembler emit a section
//! whose size is unknown when the section opens.

use std::io::{Read, Seek, SeekFrom, Write};

use serde::{Deserialize, Serialize};

pub use crate::isa::SectionKind;

const STUB_MAGIC: [u8; 4] = [b's', b't', b'b', 0x01];
const STUB_HEADER_SIZE: u64 = 4;
const SECTION_HEADER_SIZE: u64 = 25;

/// Enumerated stub format errors, surfaced verbatim by the CLIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubError {
    PrematureEof,
    InvalidHeader,
    InvalidSectionCount,
    InvalidFileOffset,
    GapData,
    SeekError,
    InvalidSectionIndex,
    WriteFailure,
}

impl std::fmt::Display for StubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let desc = match self {
            StubError::PrematureEof => "premature end of file",
            StubError::InvalidHeader => "invalid stub header",
            StubError::InvalidSectionCount => "invalid section count",
            StubError::InvalidFileOffset => "invalid section file offset",
            StubError::GapData => "non-zero data in unused directory slot",
            StubError::SeekError => "seek failed",
            StubError::InvalidSectionIndex => "invalid section index",
            StubError::WriteFailure => "write failed",
        };
        f.write_str(desc)
    }
}

impl std::error::Error for StubError {}

/// A section as seen by callers: where it loads, what it is, and how many
/// bytes it spans. For `STACK` sections no bytes live in the file and `size`
/// describes the runtime extent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Section {
    pub addr: u64,
    pub flags: u8,
    pub size: u64,
}

impl Section {
    pub fn new(addr: u64, flags: u8, size: u64) -> Self {
        Section { addr, flags, size }
    }

    pub fn kind(&self) -> Option<SectionKind> {
        SectionKind::try_from(self.flags).ok()
    }
}

/// On-disk directory entry. bincode with fixed-width integers lays this out
/// as exactly 25 little-endian bytes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct RawSection {
    addr: u64,
    flags: u8,
    bfo: u64,
    efo: u64,
}

fn directory_end(maxnsec: u32) -> u64 {
    STUB_HEADER_SIZE + 8 + SECTION_HEADER_SIZE * u64::from(maxnsec)
}

fn slot_offset(index: u32) -> u64 {
    STUB_HEADER_SIZE + 8 + SECTION_HEADER_SIZE * u64::from(index)
}

fn read_u32(file: &mut impl Read) -> Result<u32, StubError> {
    bincode::deserialize_from(file).map_err(|_| StubError::PrematureEof)
}

fn read_raw_section(file: &mut impl Read) -> Result<RawSection, StubError> {
    bincode::deserialize_from(file).map_err(|_| StubError::PrematureEof)
}

// Checks the file header and leaves the stream at the section counts.
fn check_header<F: Read + Seek>(file: &mut F) -> Result<(), StubError> {
    file.seek(SeekFrom::Start(0))
        .map_err(|_| StubError::SeekError)?;
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)
        .map_err(|_| StubError::PrematureEof)?;
    if magic != STUB_MAGIC {
        return Err(StubError::InvalidHeader);
    }
    Ok(())
}

/// Reads and validates the section counts `(maxnsec, nsec)`, leaving the
/// stream at the beginning of the section directory.
pub fn section_counts<F: Read + Seek>(
    file: &mut F,
) -> Result<(u32, u32), StubError> {
    check_header(file)?;
    let maxnsec = read_u32(file)?;
    if maxnsec == 0 {
        return Err(StubError::InvalidSectionCount);
    }
    let nsec = read_u32(file)?;
    if nsec > maxnsec {
        return Err(StubError::InvalidSectionCount);
    }
    Ok((maxnsec, nsec))
}

/// Verifies the whole container: header, counts, directory contiguity
/// (`bfo_i == efo_{i-1}`, starting at the directory end), zero-filled unused
/// slots, and that the last section's `efo` is exactly the file length.
pub fn verify<F: Read + Seek>(file: &mut F) -> Result<(), StubError> {
    let (maxnsec, nsec) = section_counts(file)?;

    let mut last_efo = directory_end(maxnsec);
    for _ in 0..nsec {
        let raw = read_raw_section(file)?;
        if raw.bfo != last_efo || raw.efo < raw.bfo {
            return Err(StubError::InvalidFileOffset);
        }
        last_efo = raw.efo;
    }

    // Unused slots must be zero-filled.
    let mut slot = [0u8; SECTION_HEADER_SIZE as usize];
    for _ in nsec..maxnsec {
        file.read_exact(&mut slot)
            .map_err(|_| StubError::PrematureEof)?;
        if slot.iter().any(|b| *b != 0) {
            return Err(StubError::GapData);
        }
    }

    let end = file
        .seek(SeekFrom::End(0))
        .map_err(|_| StubError::SeekError)?;
    if end != last_efo {
        return Err(StubError::InvalidFileOffset);
    }
    Ok(())
}

/// Loads the directory entry for `section`, then seeks to the beginning of
/// that section's data so the caller can stream its bytes.
pub fn load_section<F: Read + Seek>(
    file: &mut F,
    section: u32,
) -> Result<Section, StubError> {
    let (_maxnsec, nsec) = section_counts(file)?;
    if section >= nsec {
        return Err(StubError::InvalidSectionIndex);
    }

    file.seek(SeekFrom::Start(slot_offset(section)))
        .map_err(|_| StubError::SeekError)?;
    let raw = read_raw_section(file)?;
    if raw.bfo > raw.efo {
        return Err(StubError::InvalidFileOffset);
    }

    file.seek(SeekFrom::Start(raw.bfo))
        .map_err(|_| StubError::SeekError)?;
    Ok(Section {
        addr: raw.addr,
        flags: raw.flags,
        size: raw.efo - raw.bfo,
    })
}

/// Backing stores the stub writer can shrink. The init protocol truncates
/// before laying down a fresh header, so leftover bytes from a previous
/// file never survive.
pub trait Truncate {
    fn truncate(&mut self, len: u64) -> std::io::Result<()>;
}

impl Truncate for std::fs::File {
    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)
    }
}

impl Truncate for std::io::Cursor<Vec<u8>> {
    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.get_mut().truncate(len as usize);
        Ok(())
    }
}

/// Initializes `file` as an empty stub with room for `maxnsec` sections:
/// truncates, writes the header and counts (`nsec = 0`), zero-fills the
/// directory, and leaves the stream at the end (the beginning of section
/// data).
pub fn init<F: Write + Seek + Truncate>(
    file: &mut F,
    maxnsec: u32,
) -> Result<(), StubError> {
    if maxnsec == 0 {
        return Err(StubError::InvalidSectionCount);
    }

    file.truncate(0).map_err(|_| StubError::WriteFailure)?;
    file.seek(SeekFrom::Start(0))
        .map_err(|_| StubError::SeekError)?;

    file.write_all(&STUB_MAGIC)
        .map_err(|_| StubError::WriteFailure)?;
    bincode::serialize_into(&mut *file, &maxnsec)
        .map_err(|_| StubError::WriteFailure)?;
    bincode::serialize_into(&mut *file, &0u32)
        .map_err(|_| StubError::WriteFailure)?;

    let zeros = vec![0u8; (SECTION_HEADER_SIZE * u64::from(maxnsec)) as usize];
    file.write_all(&zeros).map_err(|_| StubError::WriteFailure)?;
    Ok(())
}

/// Finalizes section `index` at the current file position.
///
/// The caller has just streamed the section's bytes; this records the
/// current position as the section's `efo`, derives `bfo` from the previous
/// section's `efo` (the directory end for section 0), writes the directory
/// entry, bumps the on-disk `nsec` when a fresh slot is written, updates
/// `sec.size`, and restores the file position.
pub fn save_section<F: Read + Write + Seek>(
    file: &mut F,
    index: u32,
    sec: &mut Section,
) -> Result<(), StubError> {
    let fpos = file.stream_position().map_err(|_| StubError::SeekError)?;

    let (maxnsec, nsec) = section_counts(file)?;
    if index > nsec || index >= maxnsec {
        return Err(StubError::InvalidSectionIndex);
    }

    let prev_efo = if index == 0 {
        directory_end(maxnsec)
    } else {
        // The efo field lives 17 bytes into the previous slot.
        file.seek(SeekFrom::Start(slot_offset(index - 1) + 17))
            .map_err(|_| StubError::SeekError)?;
        bincode::deserialize_from::<_, u64>(&mut *file)
            .map_err(|_| StubError::PrematureEof)?
    };
    if prev_efo > fpos {
        return Err(StubError::InvalidFileOffset);
    }

    file.seek(SeekFrom::Start(slot_offset(index)))
        .map_err(|_| StubError::SeekError)?;
    let raw = RawSection {
        addr: sec.addr,
        flags: sec.flags,
        bfo: prev_efo,
        efo: fpos,
    };
    bincode::serialize_into(&mut *file, &raw)
        .map_err(|_| StubError::WriteFailure)?;
    sec.size = fpos - prev_efo;

    if index == nsec {
        // Saving a fresh slot grows the section count by one.
        file.seek(SeekFrom::Start(STUB_HEADER_SIZE + 4))
            .map_err(|_| StubError::SeekError)?;
        bincode::serialize_into(&mut *file, &(index + 1))
            .map_err(|_| StubError::WriteFailure)?;
    }

    file.seek(SeekFrom::Start(fpos))
        .map_err(|_| StubError::SeekError)?;
    Ok(())
}
