//! Per-client connection state: the [`Delegate`] the dispatch loop drives.

use std::collections::HashMap;
use std::sync::Arc;

use opal_abi::{
    Capabilities, CommandBufferLayout, ImageDescriptor, ObjectType, Status,
    command_buffer::MAX_COMMAND_BUFFER_BYTES,
};
use opal_ipc::{Delegate, TransferHandle};
use opal_platform::{MemoryObject, Semaphore};
use tracing::warn;

use crate::backend::{BackendBuffer, BackendConnection, BackendContext};
use crate::buffer::{SystemBuffer, SystemSemaphore};
use crate::device::SystemDevice;

/// All client-visible state for one connection: imported buffers and
/// semaphores, created contexts, and the capability set granted at open.
pub struct SystemConnection {
    device: Arc<SystemDevice>,
    backend: Box<dyn BackendConnection>,
    capabilities: Capabilities,
    buffers: HashMap<u64, Arc<SystemBuffer>>,
    semaphores: HashMap<u64, Arc<SystemSemaphore>>,
    contexts: HashMap<u32, Box<dyn BackendContext>>,
}

impl SystemConnection {
    pub fn new(
        device: Arc<SystemDevice>,
        backend: Box<dyn BackendConnection>,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            device,
            backend,
            capabilities,
            buffers: HashMap::new(),
            semaphores: HashMap::new(),
            contexts: HashMap::new(),
        }
    }

    fn require(&self, needed: Capabilities) -> Status {
        if self.capabilities.contains(needed) {
            Status::Ok
        } else {
            warn!(
                granted = ?self.capabilities,
                ?needed,
                "operation outside granted capabilities"
            );
            Status::AccessDenied
        }
    }

    /// Reads and decodes the command-buffer layout stored in `buffer`.
    fn read_command_buffer(buffer: &SystemBuffer) -> Result<CommandBufferLayout, Status> {
        let size = buffer.size();
        if size > MAX_COMMAND_BUFFER_BYTES as u64 {
            warn!(buffer_id = buffer.id(), size, "command buffer too large");
            return Err(Status::InvalidArgs);
        }

        let mut bytes = vec![0u8; size as usize];
        buffer.platform().map_cpu();
        let read = buffer.platform().read_at(0, &mut bytes);
        let _ = buffer.platform().unmap_cpu();
        if let Err(err) = read {
            warn!(buffer_id = buffer.id(), %err, "command buffer read failed");
            return Err(Status::InternalError);
        }

        CommandBufferLayout::decode(&bytes).map_err(|err| {
            warn!(buffer_id = buffer.id(), %err, "malformed command buffer");
            Status::InvalidArgs
        })
    }

    fn import_semaphore(&mut self, semaphore: Semaphore) -> Status {
        let id = semaphore.id();
        if self.semaphores.contains_key(&id) {
            return Status::Ok;
        }
        match SystemSemaphore::create(self.device.backend(), semaphore) {
            Ok(semaphore) => {
                self.semaphores.insert(id, semaphore);
                Status::Ok
            }
            Err(status) => status,
        }
    }
}

impl Delegate for SystemConnection {
    fn import_buffer(&mut self, handle: MemoryObject) -> Result<u64, Status> {
        let buffer = self.device.get_buffer_for_handle(handle)?;
        let id = buffer.id();
        // Re-importing an already-imported object is idempotent.
        self.buffers.entry(id).or_insert(buffer);
        Ok(id)
    }

    fn release_buffer(&mut self, buffer_id: u64) -> Status {
        if self.buffers.remove(&buffer_id).is_none() {
            warn!(buffer_id, "release of unimported buffer");
            return Status::InvalidArgs;
        }
        self.device.release_buffer(buffer_id);
        Status::Ok
    }

    fn import_object(&mut self, handle: TransferHandle) -> Status {
        match handle {
            TransferHandle::Semaphore(semaphore) => self.import_semaphore(semaphore),
            TransferHandle::Buffer(_) => {
                warn!("buffer handle sent through the object import path");
                Status::InvalidArgs
            }
        }
    }

    fn release_object(&mut self, object_id: u64, object_type: ObjectType) -> Status {
        match object_type {
            ObjectType::Semaphore => {
                if self.semaphores.remove(&object_id).is_none() {
                    warn!(object_id, "release of unimported semaphore");
                    return Status::InvalidArgs;
                }
                Status::Ok
            }
        }
    }

    fn create_context(&mut self, context_id: u32) -> Status {
        let status = self.require(Capabilities::RENDERING);
        if !status.is_ok() {
            return status;
        }
        if self.contexts.contains_key(&context_id) {
            warn!(context_id, "context id already in use");
            return Status::InvalidArgs;
        }
        match self.backend.create_context() {
            Ok(context) => {
                self.contexts.insert(context_id, context);
                Status::Ok
            }
            Err(status) => status,
        }
    }

    fn destroy_context(&mut self, context_id: u32) -> Status {
        let status = self.require(Capabilities::RENDERING);
        if !status.is_ok() {
            return status;
        }
        if self.contexts.remove(&context_id).is_none() {
            warn!(context_id, "destroy of unknown context");
            return Status::InvalidArgs;
        }
        Status::Ok
    }

    fn execute_command_buffer(&mut self, buffer_id: u64, context_id: u32) -> Status {
        let status = self.require(Capabilities::RENDERING);
        if !status.is_ok() {
            return status;
        }
        let Some(buffer) = self.buffers.get(&buffer_id) else {
            warn!(buffer_id, "execute with unimported command buffer");
            return Status::InvalidArgs;
        };

        let command = match Self::read_command_buffer(buffer) {
            Ok(command) => command,
            Err(status) => return status,
        };

        let mut resources: Vec<&dyn BackendBuffer> = Vec::with_capacity(command.resources.len());
        for resource in &command.resources {
            match self.buffers.get(&resource.buffer_id) {
                Some(buffer) => resources.push(buffer.backend()),
                None => {
                    warn!(
                        resource_id = resource.buffer_id,
                        "command references unimported buffer"
                    );
                    return Status::InvalidArgs;
                }
            }
        }

        let Some(context) = self.contexts.get_mut(&context_id) else {
            warn!(context_id, "execute with unknown context");
            return Status::InvalidArgs;
        };

        self.backend
            .execute_command_buffer(context.as_mut(), &command, &resources, &[], &[])
    }

    fn wait_rendering(&mut self, buffer_id: u64) -> Status {
        let status = self.require(Capabilities::RENDERING);
        if !status.is_ok() {
            return status;
        }
        let Some(buffer) = self.buffers.get(&buffer_id) else {
            warn!(buffer_id, "wait on unimported buffer");
            return Status::InvalidArgs;
        };
        self.backend.wait_rendering(buffer.backend())
    }

    fn page_flip(
        &mut self,
        buffer_id: u64,
        image: ImageDescriptor,
        wait_semaphore_ids: &[u64],
        signal_semaphore_ids: &[u64],
        presented: Semaphore,
    ) -> Status {
        let status = self.require(Capabilities::DISPLAY);
        if !status.is_ok() {
            return status;
        }
        let Some(buffer) = self.buffers.get(&buffer_id) else {
            warn!(buffer_id, "flip of unimported buffer");
            return Status::InvalidArgs;
        };

        let mut semaphores =
            Vec::with_capacity(wait_semaphore_ids.len() + signal_semaphore_ids.len() + 1);
        for id in wait_semaphore_ids.iter().chain(signal_semaphore_ids) {
            match self.semaphores.get(id) {
                Some(semaphore) => semaphores.push(Arc::clone(semaphore)),
                None => {
                    warn!(semaphore_id = id, "flip references unimported semaphore");
                    return Status::InvalidArgs;
                }
            }
        }

        // The presented-callback semaphore fires when the flip completes;
        // it joins the signal set.
        let presented = match SystemSemaphore::create(self.device.backend(), presented) {
            Ok(semaphore) => semaphore,
            Err(status) => return status,
        };
        semaphores.push(presented);

        self.device.page_flip(
            Arc::clone(buffer),
            &image,
            wait_semaphore_ids.len(),
            signal_semaphore_ids.len() + 1,
            semaphores,
        )
    }
}
