//! Boundary between the driver core and the vendor execution backend.
//!
//! The trait set mirrors the vendor ABI: every fallible operation reports a
//! [`Status`] (zero/success sentinel, nonzero error). Implementations decide
//! their own threading model; the driver core only requires `Send + Sync`
//! where objects cross connection threads.
//!
//! [`TestBackend`] executes immediately and deterministically so the
//! connection and device layers can be exercised without real hardware.

use std::sync::{Arc, Mutex};

use opal_abi::{CommandBufferLayout, ImageDescriptor, Status};
use opal_platform::{AddressSpace, MemoryObject, Semaphore};
use tracing::debug;

pub type BackendResult<T> = Result<T, Status>;

/// A buffer as the backend sees it: imported from a duplicated handle and
/// placed in the GPU address space.
pub trait BackendBuffer: Send + Sync {
    fn gpu_addr(&self) -> u64;
    fn size(&self) -> u64;
}

/// A semaphore as the backend sees it.
pub trait BackendSemaphore: Send + Sync {
    fn signal(&self);
    fn reset(&self);
}

/// An execution context scoping command-buffer submission.
pub trait BackendContext: Send {}

/// Per-client backend connection.
pub trait BackendConnection: Send {
    fn create_context(&mut self) -> BackendResult<Box<dyn BackendContext>>;

    fn execute_command_buffer(
        &mut self,
        context: &mut dyn BackendContext,
        command: &CommandBufferLayout,
        resources: &[&dyn BackendBuffer],
        wait_semaphores: &[&dyn BackendSemaphore],
        signal_semaphores: &[&dyn BackendSemaphore],
    ) -> Status;

    /// Blocks until all currently outstanding work referencing `buffer`
    /// completes. Work queued afterward may still be in flight on return.
    fn wait_rendering(&mut self, buffer: &dyn BackendBuffer) -> Status;
}

/// Device-level backend entry points.
pub trait DeviceBackend: Send + Sync {
    /// Device id; zero is invalid.
    fn device_id(&self) -> u32;

    fn open(&self, client_id: u64) -> BackendResult<Box<dyn BackendConnection>>;

    fn import_buffer(&self, handle: MemoryObject) -> BackendResult<Box<dyn BackendBuffer>>;

    fn import_semaphore(&self, semaphore: Semaphore) -> BackendResult<Box<dyn BackendSemaphore>>;

    /// Scans out `buffer` on the next flip. The first `wait_count` entries
    /// of `semaphores` gate the flip; the remaining `signal_count` entries
    /// fire when the buffer is reusable.
    fn page_flip(
        &self,
        buffer: &dyn BackendBuffer,
        image: &ImageDescriptor,
        wait_count: usize,
        signal_count: usize,
        semaphores: &[&dyn BackendSemaphore],
    ) -> Status;
}

/// Operation counters tests assert on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestBackendStats {
    pub opens: u32,
    pub buffers_imported: u32,
    pub semaphores_imported: u32,
    pub contexts_created: u32,
    pub executes: u32,
    pub waits: u32,
    pub flips: u32,
}

/// Deterministic in-process backend.
///
/// Buffers get GPU addresses from a first-fit address space; submissions
/// complete immediately; page flips signal their signal-set synchronously.
pub struct TestBackend {
    device_id: u32,
    gpu_space: Arc<Mutex<AddressSpace>>,
    stats: Arc<Mutex<TestBackendStats>>,
}

const GPU_SPACE_BASE: u64 = 0x1_0000_0000;
const GPU_SPACE_SIZE: u64 = 1 << 32;

impl TestBackend {
    pub fn new() -> Self {
        Self {
            device_id: 0x1916,
            gpu_space: Arc::new(Mutex::new(AddressSpace::new(GPU_SPACE_BASE, GPU_SPACE_SIZE))),
            stats: Arc::new(Mutex::new(TestBackendStats::default())),
        }
    }

    pub fn stats(&self) -> TestBackendStats {
        *self.stats.lock().unwrap()
    }
}

impl Default for TestBackend {
    fn default() -> Self {
        Self::new()
    }
}

struct TestBackendBuffer {
    handle: MemoryObject,
    gpu_addr: u64,
    gpu_space: Arc<Mutex<AddressSpace>>,
}

impl BackendBuffer for TestBackendBuffer {
    fn gpu_addr(&self) -> u64 {
        self.gpu_addr
    }

    fn size(&self) -> u64 {
        self.handle.size()
    }
}

impl Drop for TestBackendBuffer {
    fn drop(&mut self) {
        let _ = self.gpu_space.lock().unwrap().free(self.gpu_addr);
    }
}

struct TestBackendSemaphore {
    semaphore: Semaphore,
}

impl BackendSemaphore for TestBackendSemaphore {
    fn signal(&self) {
        self.semaphore.signal();
    }

    fn reset(&self) {
        self.semaphore.reset();
    }
}

struct TestBackendContext {
    #[allow(dead_code)]
    id: u32,
}

impl BackendContext for TestBackendContext {}

struct TestBackendConnection {
    client_id: u64,
    next_context_id: u32,
    stats: Arc<Mutex<TestBackendStats>>,
}

impl DeviceBackend for TestBackend {
    fn device_id(&self) -> u32 {
        self.device_id
    }

    fn open(&self, client_id: u64) -> BackendResult<Box<dyn BackendConnection>> {
        self.stats.lock().unwrap().opens += 1;
        debug!(client_id, "backend connection opened");
        Ok(Box::new(TestBackendConnection {
            client_id,
            next_context_id: 1,
            stats: Arc::clone(&self.stats),
        }))
    }

    fn import_buffer(&self, handle: MemoryObject) -> BackendResult<Box<dyn BackendBuffer>> {
        let gpu_addr = self
            .gpu_space
            .lock()
            .unwrap()
            .alloc(handle.size(), 0)
            .map_err(|_| Status::MemoryError)?;
        self.stats.lock().unwrap().buffers_imported += 1;
        Ok(Box::new(TestBackendBuffer {
            handle,
            gpu_addr,
            gpu_space: Arc::clone(&self.gpu_space),
        }))
    }

    fn import_semaphore(&self, semaphore: Semaphore) -> BackendResult<Box<dyn BackendSemaphore>> {
        self.stats.lock().unwrap().semaphores_imported += 1;
        Ok(Box::new(TestBackendSemaphore { semaphore }))
    }

    fn page_flip(
        &self,
        _buffer: &dyn BackendBuffer,
        _image: &ImageDescriptor,
        wait_count: usize,
        signal_count: usize,
        semaphores: &[&dyn BackendSemaphore],
    ) -> Status {
        if wait_count + signal_count != semaphores.len() {
            return Status::InvalidArgs;
        }
        self.stats.lock().unwrap().flips += 1;
        // No real vblank: the flip retires immediately, releasing the
        // signal set.
        for semaphore in &semaphores[wait_count..] {
            semaphore.signal();
        }
        Status::Ok
    }
}

impl BackendConnection for TestBackendConnection {
    fn create_context(&mut self) -> BackendResult<Box<dyn BackendContext>> {
        let id = self.next_context_id;
        self.next_context_id = self.next_context_id.wrapping_add(1);
        self.stats.lock().unwrap().contexts_created += 1;
        debug!(client_id = self.client_id, context_id = id, "context created");
        Ok(Box::new(TestBackendContext { id }))
    }

    fn execute_command_buffer(
        &mut self,
        _context: &mut dyn BackendContext,
        command: &CommandBufferLayout,
        resources: &[&dyn BackendBuffer],
        _wait_semaphores: &[&dyn BackendSemaphore],
        signal_semaphores: &[&dyn BackendSemaphore],
    ) -> Status {
        if resources.len() != command.resources.len() {
            return Status::InvalidArgs;
        }
        self.stats.lock().unwrap().executes += 1;
        // Immediate completion.
        for semaphore in signal_semaphores {
            semaphore.signal();
        }
        Status::Ok
    }

    fn wait_rendering(&mut self, _buffer: &dyn BackendBuffer) -> Status {
        self.stats.lock().unwrap().waits += 1;
        Status::Ok
    }
}
