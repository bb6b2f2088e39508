//! Device core: connection lifecycle, buffer deduplication, display state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use opal_abi::{Capabilities, ImageDescriptor, Status};
use opal_ipc::{channel, Connection, IpcConnection, ShutdownSignal};
use opal_platform::MemoryObject;
use thiserror::Error;
use tracing::{debug, warn};

use crate::backend::DeviceBackend;
use crate::buffer::{SystemBuffer, SystemSemaphore};
use crate::connection::SystemConnection;

pub type DeviceResult<T> = Result<T, DeviceError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("capability mask {raw:#x} is zero or carries unknown bits")]
    InvalidCapabilities { raw: u32 },

    #[error("device is shutting down")]
    ShuttingDown,

    #[error("failed to spawn connection thread")]
    ThreadSpawn,

    #[error("backend failure: {0}")]
    Backend(Status),
}

struct ConnectionEntry {
    thread: JoinHandle<()>,
    shutdown: ShutdownSignal,
}

struct FlipState {
    enabled: bool,
    /// Semaphores captured while display output was disabled, keyed by id.
    deferred_wait: HashMap<u64, Arc<SystemSemaphore>>,
    deferred_signal: HashMap<u64, Arc<SystemSemaphore>>,
    /// Kept alive so the backend may keep referencing the scanout source
    /// after the flip call returns.
    last_flipped: Option<Arc<SystemBuffer>>,
}

/// The system device: owns the backend, the buffer registry, the connection
/// registry, and the display flip state. Always handled as an `Arc`.
pub struct SystemDevice {
    backend: Arc<dyn DeviceBackend>,
    /// Object id -> live buffer. Entries only stay meaningful while a strong
    /// owner exists elsewhere; expired entries are evicted lazily.
    buffers: Mutex<HashMap<u64, Weak<SystemBuffer>>>,
    /// `None` once shutdown has begun.
    connections: Mutex<Option<HashMap<ThreadId, ConnectionEntry>>>,
    flip: Mutex<FlipState>,
}

impl SystemDevice {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            buffers: Mutex::new(HashMap::new()),
            connections: Mutex::new(Some(HashMap::new())),
            flip: Mutex::new(FlipState {
                enabled: false,
                deferred_wait: HashMap::new(),
                deferred_signal: HashMap::new(),
                last_flipped: None,
            }),
        })
    }

    pub fn device_id(&self) -> u32 {
        self.backend.device_id()
    }

    pub fn backend(&self) -> &dyn DeviceBackend {
        self.backend.as_ref()
    }

    /// Opens a connection for `client_id` with the requested capability
    /// mask. Returns the client proxy plus the not-yet-running server half;
    /// hand the latter to [`start_connection_thread`].
    ///
    /// [`start_connection_thread`]: SystemDevice::start_connection_thread
    pub fn open(
        self: &Arc<Self>,
        client_id: u64,
        raw_capabilities: u32,
    ) -> DeviceResult<(IpcConnection, Connection)> {
        let capabilities = Capabilities::validate(raw_capabilities).ok_or_else(|| {
            warn!(raw_capabilities, "rejecting open with invalid capabilities");
            DeviceError::InvalidCapabilities {
                raw: raw_capabilities,
            }
        })?;

        let backend_connection = self.backend.open(client_id).map_err(DeviceError::Backend)?;

        let (client_end, server_end) = channel();
        let delegate =
            SystemConnection::new(Arc::clone(self), backend_connection, capabilities);
        let connection = Connection::new(Box::new(delegate), server_end);
        debug!(client_id, ?capabilities, "connection opened");
        Ok((IpcConnection::new(client_end), connection))
    }

    /// Spawns the dispatch thread for `connection` and records it in the
    /// connection registry under its thread id.
    pub fn start_connection_thread(
        self: &Arc<Self>,
        connection: Connection,
    ) -> DeviceResult<()> {
        let mut registry = self.connections.lock().unwrap();
        let Some(registry) = registry.as_mut() else {
            return Err(DeviceError::ShuttingDown);
        };

        let shutdown = connection.shutdown_signal();
        let device = Arc::clone(self);
        let thread = thread::Builder::new()
            .name("opal-connection".into())
            .spawn(move || {
                Connection::run_loop(connection);
                device.connection_closed(thread::current().id());
            })
            .map_err(|err| {
                warn!(%err, "connection thread spawn failed");
                DeviceError::ThreadSpawn
            })?;

        // The new thread cannot reach connection_closed until this lock is
        // released, so the insert always happens first.
        registry.insert(thread.thread().id(), ConnectionEntry { thread, shutdown });
        Ok(())
    }

    /// Convenience open-and-run: returns the ready client proxy.
    pub fn connect(
        self: &Arc<Self>,
        client_id: u64,
        raw_capabilities: u32,
    ) -> DeviceResult<IpcConnection> {
        let (ipc, connection) = self.open(client_id, raw_capabilities)?;
        self.start_connection_thread(connection)?;
        Ok(ipc)
    }

    /// Removes the registry entry for an exited dispatch loop. The entry may
    /// already be gone if shutdown detached the registry first.
    fn connection_closed(&self, thread_id: ThreadId) {
        let mut registry = self.connections.lock().unwrap();
        if let Some(registry) = registry.as_mut() {
            // Dropping the handle detaches the exiting thread.
            registry.remove(&thread_id);
        }
    }

    /// Resolves `handle` to the one live buffer for its underlying object,
    /// importing it if no live buffer exists. At most one live
    /// [`SystemBuffer`] exists per object id at any time, even under
    /// concurrent imports.
    pub fn get_buffer_for_handle(&self, handle: MemoryObject) -> Result<Arc<SystemBuffer>, Status> {
        let id = handle.id();
        let mut buffers = self.buffers.lock().unwrap();

        if let Some(existing) = buffers.get(&id).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let buffer = SystemBuffer::create(self.backend.as_ref(), handle)?;
        buffers.insert(id, Arc::downgrade(&buffer));
        Ok(buffer)
    }

    /// Lazy registry cleanup: drops the entry for `id` if it has expired.
    /// Destruction itself is owner-count-driven, never forced from here.
    pub fn release_buffer(&self, id: u64) {
        let mut buffers = self.buffers.lock().unwrap();
        if let Some(entry) = buffers.get(&id) {
            if entry.upgrade().is_none() {
                buffers.remove(&id);
            }
        }
    }

    /// Evicts every expired entry and returns the number of live ones.
    pub fn sweep_buffer_registry(&self) -> usize {
        let mut buffers = self.buffers.lock().unwrap();
        buffers.retain(|_, entry| entry.upgrade().is_some());
        buffers.len()
    }

    /// Queues `buffer` for scanout. While display output is disabled the
    /// semaphores are deferred instead of forwarded: waits and signals are
    /// stashed by id and resolved when output is enabled.
    ///
    /// `semaphores` carries the waits first (`wait_count` of them) and the
    /// signals after.
    pub fn page_flip(
        &self,
        buffer: Arc<SystemBuffer>,
        image: &ImageDescriptor,
        wait_count: usize,
        signal_count: usize,
        semaphores: Vec<Arc<SystemSemaphore>>,
    ) -> Status {
        if wait_count + signal_count != semaphores.len() {
            return Status::InvalidArgs;
        }

        let mut flip = self.flip.lock().unwrap();

        if !flip.enabled {
            for semaphore in &semaphores[..wait_count] {
                debug!(
                    buffer_id = buffer.id(),
                    semaphore_id = semaphore.id(),
                    "display disabled, deferring wait semaphore"
                );
                flip.deferred_wait
                    .insert(semaphore.id(), Arc::clone(semaphore));
            }
            for semaphore in &semaphores[wait_count..] {
                debug!(
                    buffer_id = buffer.id(),
                    semaphore_id = semaphore.id(),
                    "display disabled, deferring signal semaphore"
                );
                flip.deferred_signal
                    .insert(semaphore.id(), Arc::clone(semaphore));
            }
            return Status::Ok;
        }

        let backend_semaphores: Vec<_> = semaphores.iter().map(|s| s.backend()).collect();
        let status = self.backend.page_flip(
            buffer.backend(),
            image,
            wait_count,
            signal_count,
            &backend_semaphores,
        );
        if status.is_ok() {
            flip.last_flipped = Some(buffer);
        }
        status
    }

    /// Driver-thread flip that can also toggle display output. The flip is
    /// always forwarded; enabling resolves every deferred semaphore exactly
    /// once (waits reset, signals signaled) and clears both maps.
    ///
    /// Returns the buffer most recently flipped through [`page_flip`].
    ///
    /// [`page_flip`]: SystemDevice::page_flip
    pub fn page_flip_and_enable(
        &self,
        buffer: &Arc<SystemBuffer>,
        image: &ImageDescriptor,
        enable: bool,
    ) -> Option<Arc<SystemBuffer>> {
        let mut flip = self.flip.lock().unwrap();

        let status = self
            .backend
            .page_flip(buffer.backend(), image, 0, 0, &[]);
        if !status.is_ok() {
            warn!(%status, "backend flip failed during enable toggle");
        }

        debug!(enable, "display output toggled");
        flip.enabled = enable;

        if enable {
            debug!(
                waits = flip.deferred_wait.len(),
                signals = flip.deferred_signal.len(),
                "resolving deferred flip semaphores"
            );
            for semaphore in flip.deferred_wait.values() {
                semaphore.platform().reset();
            }
            for semaphore in flip.deferred_signal.values() {
                semaphore.platform().signal();
            }
            flip.deferred_wait.clear();
            flip.deferred_signal.clear();
        }

        flip.last_flipped.clone()
    }

    /// Signals every connection's shutdown event, joins every dispatch
    /// thread, and reports elapsed time. Idempotent; no new connections can
    /// be opened once it has begun.
    pub fn shutdown(&self) {
        let registry = {
            let mut registry = self.connections.lock().unwrap();
            match registry.take() {
                Some(registry) => registry,
                None => return,
            }
        };

        for entry in registry.values() {
            entry.shutdown.signal();
        }

        let start = Instant::now();
        let count = registry.len();
        for (_, entry) in registry {
            if entry.thread.join().is_err() {
                warn!("connection thread panicked before join");
            }
        }
        debug!(
            connections = count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "shutdown complete"
        );
    }
}

impl Drop for SystemDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}
