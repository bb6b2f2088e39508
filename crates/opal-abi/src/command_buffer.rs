//! Command-buffer wire layout.
//!
//! Clients build this layout inside an ordinary buffer and submit it by id;
//! the driver core decodes it only far enough to resolve the referenced
//! resources for the execution backend. Little-endian, packed in declaration
//! order:
//!
//! - header
//! - `num_resources` exec-resource records
//! - for each resource, `num_relocations` relocation records

use core::fmt;

/// Defensive bound on a decoded command buffer; anything larger is rejected
/// before any per-record allocation happens.
pub const MAX_COMMAND_BUFFER_BYTES: usize = 1 << 20; // 1 MiB

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBufferHeader {
    /// Index into the resource array of the batch (entry-point) buffer.
    pub batch_buffer_resource_index: u32,
    /// Byte offset of the first instruction inside the batch buffer.
    pub batch_start_offset: u32,
    pub num_resources: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecResource {
    pub buffer_id: u64,
    pub num_relocations: u32,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub offset: u32,
    pub target_resource_index: u32,
    pub target_offset: u32,
    pub read_domains: u32,
    pub write_domains: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBufferLayout {
    pub header: CommandBufferHeader,
    pub resources: Vec<ExecResource>,
    /// Relocations per resource, same order as `resources`.
    pub relocations: Vec<Vec<Relocation>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedEof,
    OversizedPayload,
    /// The batch buffer index does not name one of the resources.
    BadBatchIndex { index: u32, num_resources: u32 },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnexpectedEof => write!(f, "unexpected end of command buffer"),
            DecodeError::OversizedPayload => write!(f, "command buffer too large"),
            DecodeError::BadBatchIndex {
                index,
                num_resources,
            } => write!(
                f,
                "batch buffer index {index} out of range ({num_resources} resources)"
            ),
        }
    }
}

impl std::error::Error for DecodeError {}

impl CommandBufferLayout {
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() > MAX_COMMAND_BUFFER_BYTES {
            return Err(DecodeError::OversizedPayload);
        }
        let mut r = Reader::new(bytes);

        let header = CommandBufferHeader {
            batch_buffer_resource_index: r.read_u32()?,
            batch_start_offset: r.read_u32()?,
            num_resources: r.read_u32()?,
        };

        // The remaining length bounds the record count, so a huge
        // `num_resources` in a truncated message fails fast instead of
        // reserving memory for records that cannot exist.
        let mut resources = Vec::new();
        for _ in 0..header.num_resources {
            resources.push(ExecResource {
                buffer_id: r.read_u64()?,
                num_relocations: r.read_u32()?,
                offset: r.read_u64()?,
                length: r.read_u64()?,
            });
        }

        let mut relocations = Vec::with_capacity(resources.len());
        for resource in &resources {
            let mut relocs = Vec::new();
            for _ in 0..resource.num_relocations {
                relocs.push(Relocation {
                    offset: r.read_u32()?,
                    target_resource_index: r.read_u32()?,
                    target_offset: r.read_u32()?,
                    read_domains: r.read_u32()?,
                    write_domains: r.read_u32()?,
                });
            }
            relocations.push(relocs);
        }

        if header.num_resources > 0 && header.batch_buffer_resource_index >= header.num_resources {
            return Err(DecodeError::BadBatchIndex {
                index: header.batch_buffer_resource_index,
                num_resources: header.num_resources,
            });
        }

        Ok(CommandBufferLayout {
            header,
            resources,
            relocations,
        })
    }

    /// Serializes the layout; used by clients and tests to build submissions.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_u32(&mut out, self.header.batch_buffer_resource_index);
        push_u32(&mut out, self.header.batch_start_offset);
        push_u32(&mut out, self.resources.len() as u32);
        for resource in &self.resources {
            push_u64(&mut out, resource.buffer_id);
            push_u32(&mut out, resource.num_relocations);
            push_u64(&mut out, resource.offset);
            push_u64(&mut out, resource.length);
        }
        for relocs in &self.relocations {
            for reloc in relocs {
                push_u32(&mut out, reloc.offset);
                push_u32(&mut out, reloc.target_resource_index);
                push_u32(&mut out, reloc.target_offset);
                push_u32(&mut out, reloc.read_domains);
                push_u32(&mut out, reloc.write_domains);
            }
        }
        out
    }
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or(DecodeError::UnexpectedEof)?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.read_bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}
