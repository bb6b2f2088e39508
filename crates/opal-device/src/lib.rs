//! System device: the multiplexing core of the driver stack.
//!
//! [`SystemDevice`] owns the execution backend, validates and opens client
//! connections (one dispatch thread each), deduplicates buffer imports
//! across connections through a weak-reference registry, serializes display
//! page-flip state, and coordinates shutdown of every connection thread.
//!
//! The vendor execution backend is consumed through the [`backend`] trait
//! set; [`backend::TestBackend`] is the in-process implementation used by
//! tests and headless builds.
#![forbid(unsafe_code)]

pub mod backend;
pub mod buffer;
pub mod connection;
pub mod device;

pub use backend::{
    BackendBuffer, BackendConnection, BackendContext, BackendSemaphore, DeviceBackend, TestBackend,
    TestBackendStats,
};
pub use buffer::{SystemBuffer, SystemSemaphore};
pub use connection::SystemConnection;
pub use device::{DeviceError, SystemDevice};
