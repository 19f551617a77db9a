//! Versioned, tagged-section binary container.
//!
//! The shim only locates raw byte ranges: a fixed magic identifying the
//! container version, a section table of (kind, offset, size) triples, and
//! two decoded tables (memory topology, connectivity) that drive
//! per-instance streaming-argument routing. Payload formats beyond those
//! are opaque and forwarded to the device process untouched.

use crate::error::{ShimError, ShimResult};
use std::collections::BTreeMap;

/// Magic of the current container version.
pub const MAGIC: &[u8; 8] = b"swbin2\0\0";
/// Legacy magics: recognized only to be rejected with a clear message.
const LEGACY_MAGICS: [&[u8; 8]; 2] = [b"swbin0\0\0", b"swbin1\0\0"];

const HEADER_LEN: usize = 12; // magic + section count
const SECTION_HEADER_LEN: usize = 20; // kind u32 + offset u64 + size u64

/// Typed section selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    /// The loadable image handed to the device process.
    Bitstream,
    /// Embedded platform metadata (opaque here).
    Metadata,
    /// Argument-to-memory connectivity table.
    Connectivity,
    /// Memory topology table.
    MemTopology,
    /// Presence gates launching the device process with debug arguments.
    DebugData,
    /// Extra emulation payload, dumped next to the bitstream.
    EmulationData,
}

impl SectionKind {
    const fn code(self) -> u32 {
        match self {
            Self::Bitstream => 0,
            Self::Metadata => 1,
            Self::Connectivity => 2,
            Self::MemTopology => 3,
            Self::DebugData => 4,
            Self::EmulationData => 5,
        }
    }

    const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Bitstream),
            1 => Some(Self::Metadata),
            2 => Some(Self::Connectivity),
            3 => Some(Self::MemTopology),
            4 => Some(Self::DebugData),
            5 => Some(Self::EmulationData),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct SectionHeader {
    kind: u32,
    offset: u64,
    size: u64,
}

/// A parsed view over a container image. Borrows the caller's bytes.
#[derive(Debug)]
pub struct Container<'a> {
    data: &'a [u8],
    sections: Vec<SectionHeader>,
}

impl<'a> Container<'a> {
    /// Validates the magic and the section table.
    ///
    /// # Errors
    /// `InvalidContainer` for a legacy or unrecognized magic, or for a
    /// section extending past the end of the image. Nothing else is
    /// touched before this check passes; in particular no device process
    /// interaction happens for a rejected image.
    pub fn parse(data: &'a [u8]) -> ShimResult<Self> {
        let magic = data
            .get(..8)
            .ok_or_else(|| ShimError::InvalidContainer("image shorter than magic".into()))?;
        if LEGACY_MAGICS.iter().any(|m| magic == *m as &[u8]) {
            return Err(ShimError::InvalidContainer(
                "unsupported legacy container version".into(),
            ));
        }
        if magic != MAGIC {
            return Err(ShimError::InvalidContainer("unrecognized magic".into()));
        }

        let count = read_u32(data, 8)? as usize;
        let mut sections = Vec::with_capacity(count);
        for i in 0..count {
            let at = HEADER_LEN + i * SECTION_HEADER_LEN;
            let header = SectionHeader {
                kind: read_u32(data, at)?,
                offset: read_u64(data, at + 4)?,
                size: read_u64(data, at + 12)?,
            };
            let end = header
                .offset
                .checked_add(header.size)
                .ok_or_else(|| ShimError::InvalidContainer("section range overflow".into()))?;
            if end > data.len() as u64 {
                return Err(ShimError::InvalidContainer(format!(
                    "section {i} extends past end of image"
                )));
            }
            sections.push(header);
        }
        Ok(Self { data, sections })
    }

    /// Raw bytes of the first section of `kind`, if present.
    #[must_use]
    pub fn section(&self, kind: SectionKind) -> Option<&'a [u8]> {
        self.sections
            .iter()
            .find(|s| s.kind == kind.code())
            .map(|s| &self.data[s.offset as usize..(s.offset + s.size) as usize])
    }
}

fn read_u32(data: &[u8], at: usize) -> ShimResult<u32> {
    data.get(at..at + 4)
        .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
        .ok_or_else(|| ShimError::InvalidContainer("truncated header".into()))
}

fn read_u64(data: &[u8], at: usize) -> ShimResult<u64> {
    data.get(at..at + 8)
        .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
        .ok_or_else(|| ShimError::InvalidContainer("truncated header".into()))
}

// ===============================================================================================
// Memory topology and connectivity tables
// ===============================================================================================

const MEM_ENTRY_LEN: usize = 36; // kind u32 + tag [16] + route u64 + flow u64
const CONNECTION_LEN: usize = 8; // arg u32 + mem index u32
const TAG_LEN: usize = 16;

/// Kind of one memory-topology entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemKind {
    Ddr,
    Streaming,
}

/// One memory-topology record.
#[derive(Debug, Clone)]
pub struct MemEntry {
    pub kind: MemKind,
    /// NUL-padded port tag, e.g. "axis0".
    pub tag: String,
    pub route_id: u64,
    /// Instance base address and flow combined; the upper half selects
    /// the owning kernel instance.
    pub flow_id: u64,
}

/// One connectivity record binding a kernel argument to a memory entry.
#[derive(Debug, Clone, Copy)]
pub struct Connection {
    pub arg_index: u64,
    pub mem_index: u32,
}

/// Streaming-argument routing for one kernel instance:
/// argument index -> (flow id, port tag).
pub type ArgFlowMap = BTreeMap<u64, (u64, String)>;

/// Decodes a memory-topology section.
///
/// # Errors
/// `InvalidContainer` when the record count disagrees with the payload
/// length or a record carries an unknown kind code.
pub fn parse_mem_topology(bytes: &[u8]) -> ShimResult<Vec<MemEntry>> {
    let count = read_u32(bytes, 0)? as usize;
    if bytes.len() < 4 + count * MEM_ENTRY_LEN {
        return Err(ShimError::InvalidContainer(
            "memory topology shorter than its count".into(),
        ));
    }
    let mut entries = Vec::with_capacity(count);
    for i in 0..count {
        let at = 4 + i * MEM_ENTRY_LEN;
        let kind = match read_u32(bytes, at)? {
            0 => MemKind::Ddr,
            1 => MemKind::Streaming,
            other => {
                return Err(ShimError::InvalidContainer(format!(
                    "unknown memory kind {other}"
                )));
            }
        };
        let raw_tag = &bytes[at + 4..at + 4 + TAG_LEN];
        let tag_end = raw_tag.iter().position(|&b| b == 0).unwrap_or(TAG_LEN);
        entries.push(MemEntry {
            kind,
            tag: String::from_utf8_lossy(&raw_tag[..tag_end]).into_owned(),
            route_id: read_u64(bytes, at + 4 + TAG_LEN)?,
            flow_id: read_u64(bytes, at + 12 + TAG_LEN)?,
        });
    }
    Ok(entries)
}

/// Decodes a connectivity section.
///
/// # Errors
/// `InvalidContainer` when the record count disagrees with the payload
/// length.
pub fn parse_connectivity(bytes: &[u8]) -> ShimResult<Vec<Connection>> {
    let count = read_u32(bytes, 0)? as usize;
    if bytes.len() < 4 + count * CONNECTION_LEN {
        return Err(ShimError::InvalidContainer(
            "connectivity shorter than its count".into(),
        ));
    }
    let mut connections = Vec::with_capacity(count);
    for i in 0..count {
        let at = 4 + i * CONNECTION_LEN;
        connections.push(Connection {
            arg_index: u64::from(read_u32(bytes, at)?),
            mem_index: read_u32(bytes, at + 4)?,
        });
    }
    Ok(connections)
}

// ===============================================================================================
// Writer side
// ===============================================================================================

/// Assembles a container image. Used by tooling and the test-suite; the
/// shim itself only reads containers.
#[derive(Default)]
pub struct ContainerBuilder {
    sections: Vec<(SectionKind, Vec<u8>)>,
}

impl ContainerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn section(mut self, kind: SectionKind, payload: impl Into<Vec<u8>>) -> Self {
        self.sections.push((kind, payload.into()));
        self
    }

    #[must_use]
    pub fn build(self) -> Vec<u8> {
        let table_len = self.sections.len() * SECTION_HEADER_LEN;
        let mut out = Vec::with_capacity(HEADER_LEN + table_len);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&(self.sections.len() as u32).to_le_bytes());

        let mut offset = (HEADER_LEN + table_len) as u64;
        for (kind, payload) in &self.sections {
            out.extend_from_slice(&kind.code().to_le_bytes());
            out.extend_from_slice(&offset.to_le_bytes());
            out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
            offset += payload.len() as u64;
        }
        for (_, payload) in &self.sections {
            out.extend_from_slice(payload);
        }
        out
    }
}

/// Encodes memory-topology records, the inverse of [`parse_mem_topology`].
#[must_use]
pub fn encode_mem_topology(entries: &[(MemKind, &str, u64, u64)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + entries.len() * MEM_ENTRY_LEN);
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for (kind, tag, route_id, flow_id) in entries {
        let code: u32 = match kind {
            MemKind::Ddr => 0,
            MemKind::Streaming => 1,
        };
        out.extend_from_slice(&code.to_le_bytes());
        let mut tag_bytes = [0u8; TAG_LEN];
        let n = tag.len().min(TAG_LEN);
        tag_bytes[..n].copy_from_slice(&tag.as_bytes()[..n]);
        out.extend_from_slice(&tag_bytes);
        out.extend_from_slice(&route_id.to_le_bytes());
        out.extend_from_slice(&flow_id.to_le_bytes());
    }
    out
}

/// Encodes connectivity records, the inverse of [`parse_connectivity`].
#[must_use]
pub fn encode_connectivity(connections: &[(u32, u32)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + connections.len() * CONNECTION_LEN);
    out.extend_from_slice(&(connections.len() as u32).to_le_bytes());
    for (arg, mem) in connections {
        out.extend_from_slice(&arg.to_le_bytes());
        out.extend_from_slice(&mem.to_le_bytes());
    }
    out
}
