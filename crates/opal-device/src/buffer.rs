//! Device-level wrappers pairing a platform object with its backend import.

use std::sync::Arc;

use opal_abi::Status;
use opal_platform::{MemoryObject, PlatformBuffer, Semaphore};
use tracing::warn;

use crate::backend::{BackendBuffer, BackendSemaphore, DeviceBackend};

/// One buffer as the device tracks it: the platform buffer plus the backend's
/// view of the same memory object.
pub struct SystemBuffer {
    platform: PlatformBuffer,
    backend: Box<dyn BackendBuffer>,
}

impl SystemBuffer {
    pub fn create(
        backend: &dyn DeviceBackend,
        handle: MemoryObject,
    ) -> Result<Arc<Self>, Status> {
        let platform = PlatformBuffer::import(handle).map_err(|err| {
            warn!(%err, "buffer import rejected");
            Status::InvalidArgs
        })?;
        let backend_buffer = backend.import_buffer(platform.duplicate_handle())?;
        Ok(Arc::new(Self {
            platform,
            backend: backend_buffer,
        }))
    }

    pub fn id(&self) -> u64 {
        self.platform.id()
    }

    pub fn size(&self) -> u64 {
        self.platform.size()
    }

    pub fn platform(&self) -> &PlatformBuffer {
        &self.platform
    }

    pub fn backend(&self) -> &dyn BackendBuffer {
        self.backend.as_ref()
    }
}

impl std::fmt::Debug for SystemBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemBuffer")
            .field("id", &self.id())
            .field("size", &self.size())
            .finish()
    }
}

/// One semaphore as the device tracks it.
pub struct SystemSemaphore {
    semaphore: Semaphore,
    backend: Box<dyn BackendSemaphore>,
}

impl SystemSemaphore {
    pub fn create(
        backend: &dyn DeviceBackend,
        semaphore: Semaphore,
    ) -> Result<Arc<Self>, Status> {
        let backend_semaphore = backend.import_semaphore(semaphore.duplicate())?;
        Ok(Arc::new(Self {
            semaphore,
            backend: backend_semaphore,
        }))
    }

    pub fn id(&self) -> u64 {
        self.semaphore.id()
    }

    pub fn platform(&self) -> &Semaphore {
        &self.semaphore
    }

    pub fn backend(&self) -> &dyn BackendSemaphore {
        self.backend.as_ref()
    }
}

impl std::fmt::Debug for SystemSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemSemaphore")
            .field("id", &self.id())
            .finish()
    }
}
