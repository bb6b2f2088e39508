//! Shared wire-level definitions for the opal driver stack.
//!
//! Everything in this crate crosses a boundary: status codes and capability
//! bits are visible to clients, the command-buffer layout is produced by
//! clients and consumed by the execution backend, and the image descriptor
//! rides along with page-flip requests. Keeping these in one small crate lets
//! the platform, IPC, and device crates agree on them without depending on
//! each other.

pub mod caps;
pub mod command_buffer;
pub mod status;

pub use caps::Capabilities;
pub use command_buffer::{
    CommandBufferHeader, CommandBufferLayout, DecodeError, ExecResource, Relocation,
};
pub use status::Status;

/// Secondary resource kinds transferable over a connection.
///
/// Buffers have their own dedicated import path; the generic object
/// import/release requests carry one of these tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ObjectType {
    Semaphore = 1,
}

impl ObjectType {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(ObjectType::Semaphore),
            _ => None,
        }
    }
}

/// Scanout layout of a buffer handed to the display on page flip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageDescriptor {
    pub tiling: TilingMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum TilingMode {
    #[default]
    Linear = 0,
    Tiled = 1,
}

impl TilingMode {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(TilingMode::Linear),
            1 => Some(TilingMode::Tiled),
            _ => None,
        }
    }
}
