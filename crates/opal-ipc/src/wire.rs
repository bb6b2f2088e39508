//! Request/response wire codec.
//!
//! Little-endian, tag-prefixed records framed by the channel. Handles are
//! never encoded here; they travel as message attachments, and each request
//! kind declares how many attachments it expects.

use core::fmt;

use opal_abi::{ImageDescriptor, ObjectType, Status, TilingMode};

/// Defensive maximum payload size for decode.
pub const MAX_MESSAGE_BYTES: usize = 1 << 16; // 64 KiB

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Import the attached buffer handle into the connection.
    ImportBuffer,
    ReleaseBuffer {
        buffer_id: u64,
    },
    /// Import the attached handle as a secondary object of the given type.
    ImportObject {
        object_type: ObjectType,
    },
    ReleaseObject {
        object_id: u64,
        object_type: ObjectType,
    },
    CreateContext {
        context_id: u32,
    },
    DestroyContext {
        context_id: u32,
    },
    ExecuteCommandBuffer {
        buffer_id: u64,
        context_id: u32,
    },
    WaitRendering {
        buffer_id: u64,
    },
    /// The presented-callback semaphore rides as the attached handle.
    PageFlip {
        buffer_id: u64,
        image: ImageDescriptor,
        wait_semaphore_ids: Vec<u64>,
        signal_semaphore_ids: Vec<u64>,
    },
    GetError,
}

impl Request {
    /// Number of handle attachments this request must carry.
    pub fn expected_handles(&self) -> usize {
        match self {
            Request::ImportBuffer | Request::ImportObject { .. } | Request::PageFlip { .. } => 1,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// Reply to [`Request::GetError`]: the latched status.
    Error { status: Status },
    /// Reply to [`Request::WaitRendering`], sent once outstanding work has
    /// completed.
    WaitRenderingDone { status: Status },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedEof,
    UnknownTag,
    TrailingBytes,
    InvalidEnum,
    OversizedPayload,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnexpectedEof => write!(f, "unexpected EOF"),
            DecodeError::UnknownTag => write!(f, "unknown tag"),
            DecodeError::TrailingBytes => write!(f, "trailing bytes"),
            DecodeError::InvalidEnum => write!(f, "invalid enum value"),
            DecodeError::OversizedPayload => write!(f, "payload too large"),
        }
    }
}

impl std::error::Error for DecodeError {}

const REQ_TAG_IMPORT_BUFFER: u16 = 0x0100;
const REQ_TAG_RELEASE_BUFFER: u16 = 0x0101;
const REQ_TAG_IMPORT_OBJECT: u16 = 0x0110;
const REQ_TAG_RELEASE_OBJECT: u16 = 0x0111;
const REQ_TAG_CREATE_CONTEXT: u16 = 0x0200;
const REQ_TAG_DESTROY_CONTEXT: u16 = 0x0201;
const REQ_TAG_EXECUTE_COMMAND_BUFFER: u16 = 0x0300;
const REQ_TAG_WAIT_RENDERING: u16 = 0x0301;
const REQ_TAG_PAGE_FLIP: u16 = 0x0400;
const REQ_TAG_GET_ERROR: u16 = 0x0500;

const RESP_TAG_ERROR: u16 = 0x1000;
const RESP_TAG_WAIT_RENDERING_DONE: u16 = 0x1001;

pub fn encode_request(request: &Request) -> Vec<u8> {
    let mut out = Vec::new();
    match request {
        Request::ImportBuffer => push_u16(&mut out, REQ_TAG_IMPORT_BUFFER),
        Request::ReleaseBuffer { buffer_id } => {
            push_u16(&mut out, REQ_TAG_RELEASE_BUFFER);
            push_u64(&mut out, *buffer_id);
        }
        Request::ImportObject { object_type } => {
            push_u16(&mut out, REQ_TAG_IMPORT_OBJECT);
            push_u32(&mut out, *object_type as u32);
        }
        Request::ReleaseObject {
            object_id,
            object_type,
        } => {
            push_u16(&mut out, REQ_TAG_RELEASE_OBJECT);
            push_u64(&mut out, *object_id);
            push_u32(&mut out, *object_type as u32);
        }
        Request::CreateContext { context_id } => {
            push_u16(&mut out, REQ_TAG_CREATE_CONTEXT);
            push_u32(&mut out, *context_id);
        }
        Request::DestroyContext { context_id } => {
            push_u16(&mut out, REQ_TAG_DESTROY_CONTEXT);
            push_u32(&mut out, *context_id);
        }
        Request::ExecuteCommandBuffer {
            buffer_id,
            context_id,
        } => {
            push_u16(&mut out, REQ_TAG_EXECUTE_COMMAND_BUFFER);
            push_u64(&mut out, *buffer_id);
            push_u32(&mut out, *context_id);
        }
        Request::WaitRendering { buffer_id } => {
            push_u16(&mut out, REQ_TAG_WAIT_RENDERING);
            push_u64(&mut out, *buffer_id);
        }
        Request::PageFlip {
            buffer_id,
            image,
            wait_semaphore_ids,
            signal_semaphore_ids,
        } => {
            push_u16(&mut out, REQ_TAG_PAGE_FLIP);
            push_u64(&mut out, *buffer_id);
            push_u32(&mut out, image.tiling as u32);
            push_u32(&mut out, wait_semaphore_ids.len() as u32);
            push_u32(&mut out, signal_semaphore_ids.len() as u32);
            for id in wait_semaphore_ids {
                push_u64(&mut out, *id);
            }
            for id in signal_semaphore_ids {
                push_u64(&mut out, *id);
            }
        }
        Request::GetError => push_u16(&mut out, REQ_TAG_GET_ERROR),
    }
    out
}

pub fn decode_request(bytes: &[u8]) -> Result<Request, DecodeError> {
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(DecodeError::OversizedPayload);
    }
    let mut r = Reader::new(bytes);
    let tag = r.read_u16()?;
    let request = match tag {
        REQ_TAG_IMPORT_BUFFER => Request::ImportBuffer,
        REQ_TAG_RELEASE_BUFFER => Request::ReleaseBuffer {
            buffer_id: r.read_u64()?,
        },
        REQ_TAG_IMPORT_OBJECT => Request::ImportObject {
            object_type: read_object_type(&mut r)?,
        },
        REQ_TAG_RELEASE_OBJECT => Request::ReleaseObject {
            object_id: r.read_u64()?,
            object_type: read_object_type(&mut r)?,
        },
        REQ_TAG_CREATE_CONTEXT => Request::CreateContext {
            context_id: r.read_u32()?,
        },
        REQ_TAG_DESTROY_CONTEXT => Request::DestroyContext {
            context_id: r.read_u32()?,
        },
        REQ_TAG_EXECUTE_COMMAND_BUFFER => Request::ExecuteCommandBuffer {
            buffer_id: r.read_u64()?,
            context_id: r.read_u32()?,
        },
        REQ_TAG_WAIT_RENDERING => Request::WaitRendering {
            buffer_id: r.read_u64()?,
        },
        REQ_TAG_PAGE_FLIP => {
            let buffer_id = r.read_u64()?;
            let tiling =
                TilingMode::from_u32(r.read_u32()?).ok_or(DecodeError::InvalidEnum)?;
            let wait_count = r.read_u32()? as usize;
            let signal_count = r.read_u32()? as usize;
            // Counts are bounded by the remaining payload; reject before
            // reserving anything.
            if wait_count
                .checked_add(signal_count)
                .and_then(|total| total.checked_mul(8))
                .map(|total_bytes| total_bytes > r.remaining())
                .unwrap_or(true)
            {
                return Err(DecodeError::UnexpectedEof);
            }
            let mut wait_semaphore_ids = Vec::with_capacity(wait_count);
            for _ in 0..wait_count {
                wait_semaphore_ids.push(r.read_u64()?);
            }
            let mut signal_semaphore_ids = Vec::with_capacity(signal_count);
            for _ in 0..signal_count {
                signal_semaphore_ids.push(r.read_u64()?);
            }
            Request::PageFlip {
                buffer_id,
                image: ImageDescriptor { tiling },
                wait_semaphore_ids,
                signal_semaphore_ids,
            }
        }
        REQ_TAG_GET_ERROR => Request::GetError,
        _ => return Err(DecodeError::UnknownTag),
    };
    if r.remaining() != 0 {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(request)
}

pub fn encode_response(response: &Response) -> Vec<u8> {
    let mut out = Vec::new();
    match response {
        Response::Error { status } => {
            push_u16(&mut out, RESP_TAG_ERROR);
            push_i32(&mut out, status.to_code());
        }
        Response::WaitRenderingDone { status } => {
            push_u16(&mut out, RESP_TAG_WAIT_RENDERING_DONE);
            push_i32(&mut out, status.to_code());
        }
    }
    out
}

pub fn decode_response(bytes: &[u8]) -> Result<Response, DecodeError> {
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(DecodeError::OversizedPayload);
    }
    let mut r = Reader::new(bytes);
    let tag = r.read_u16()?;
    let response = match tag {
        RESP_TAG_ERROR => Response::Error {
            status: Status::from_code(r.read_i32()?),
        },
        RESP_TAG_WAIT_RENDERING_DONE => Response::WaitRenderingDone {
            status: Status::from_code(r.read_i32()?),
        },
        _ => return Err(DecodeError::UnknownTag),
    };
    if r.remaining() != 0 {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(response)
}

fn read_object_type(r: &mut Reader<'_>) -> Result<ObjectType, DecodeError> {
    ObjectType::from_u32(r.read_u32()?).ok_or(DecodeError::InvalidEnum)
}

fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_i32(out: &mut Vec<u8>, v: i32) {
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

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEof);
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.bytes[start..start + len])
    }

    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i32(&mut self) -> Result<i32, DecodeError> {
        let b = self.read_bytes(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.read_bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}
