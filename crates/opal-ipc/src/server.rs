//! Server-side dispatch loop.

use opal_abi::{ImageDescriptor, ObjectType, Status};
use opal_platform::{MemoryObject, Semaphore};
use tracing::{debug, warn};

use crate::channel::{Message, RecvError, ServerEnd, ShutdownSignal, TransferHandle};
use crate::wire::{decode_request, encode_response, Request, Response};

/// Capability set a connection's dispatch loop invokes per decoded request.
///
/// Implementations hold all client-visible state (buffers, contexts,
/// semaphores); the connection itself only routes.
pub trait Delegate: Send {
    fn import_buffer(&mut self, handle: MemoryObject) -> Result<u64, Status>;
    fn release_buffer(&mut self, buffer_id: u64) -> Status;

    fn import_object(&mut self, handle: TransferHandle) -> Status;
    fn release_object(&mut self, object_id: u64, object_type: ObjectType) -> Status;

    fn create_context(&mut self, context_id: u32) -> Status;
    fn destroy_context(&mut self, context_id: u32) -> Status;

    fn execute_command_buffer(&mut self, buffer_id: u64, context_id: u32) -> Status;

    /// Blocks until all GPU work referencing the buffer at call time has
    /// completed.
    fn wait_rendering(&mut self, buffer_id: u64) -> Status;

    fn page_flip(
        &mut self,
        buffer_id: u64,
        image: ImageDescriptor,
        wait_semaphore_ids: &[u64],
        signal_semaphore_ids: &[u64],
        presented: Semaphore,
    ) -> Status;
}

/// Server half of one connection.
///
/// Lifecycle: created `Open`, `Running` while a thread sits in
/// [`run_loop`], `Closing` once the remote closes, shutdown is signaled, or
/// a malformed request arrives, and `Terminated` when the thread is joined
/// and the connection dropped.
///
/// [`run_loop`]: Connection::run_loop
pub struct Connection {
    delegate: Box<dyn Delegate>,
    end: ServerEnd,
    /// Single-slot error latch: the first delegate failure since the last
    /// `GetError` fetch; later failures before the fetch are discarded.
    error: Option<Status>,
}

impl Connection {
    pub fn new(delegate: Box<dyn Delegate>, end: ServerEnd) -> Self {
        Self {
            delegate,
            end,
            error: None,
        }
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.end.shutdown_signal()
    }

    /// Dispatch loop body: runs until the connection leaves the running
    /// state for any reason.
    pub fn run_loop(mut connection: Connection) {
        while connection.handle_request() {}
        debug!("dispatch loop exited");
    }

    /// Handles a single request. Returns `false` when the remote has closed,
    /// shutdown was signaled, or a request put the connection in an
    /// unrecoverable state.
    pub fn handle_request(&mut self) -> bool {
        let message = match self.end.recv() {
            Ok(message) => message,
            Err(RecvError::Shutdown) => {
                debug!("shutdown signaled");
                return false;
            }
            Err(RecvError::Closed) => {
                debug!("remote closed");
                return false;
            }
        };

        let request = match decode_request(&message.bytes) {
            Ok(request) => request,
            Err(err) => {
                warn!(%err, "malformed request, closing connection");
                return false;
            }
        };

        if message.handles.len() != request.expected_handles() {
            warn!(
                got = message.handles.len(),
                expected = request.expected_handles(),
                "handle count mismatch, closing connection"
            );
            return false;
        }

        self.dispatch(request, message.handles)
    }

    fn dispatch(&mut self, request: Request, mut handles: Vec<TransferHandle>) -> bool {
        match request {
            Request::ImportBuffer => {
                let status = match handles.pop() {
                    Some(TransferHandle::Buffer(handle)) => {
                        match self.delegate.import_buffer(handle) {
                            Ok(_id) => Status::Ok,
                            Err(status) => status,
                        }
                    }
                    _ => Status::InvalidArgs,
                };
                self.latch(status);
            }
            Request::ReleaseBuffer { buffer_id } => {
                let status = self.delegate.release_buffer(buffer_id);
                self.latch(status);
            }
            Request::ImportObject { object_type } => {
                // The attached handle must be of the declared type.
                let status = match (object_type, handles.pop()) {
                    (ObjectType::Semaphore, Some(handle @ TransferHandle::Semaphore(_))) => {
                        self.delegate.import_object(handle)
                    }
                    _ => Status::InvalidArgs,
                };
                self.latch(status);
            }
            Request::ReleaseObject {
                object_id,
                object_type,
            } => {
                let status = self.delegate.release_object(object_id, object_type);
                self.latch(status);
            }
            Request::CreateContext { context_id } => {
                let status = self.delegate.create_context(context_id);
                self.latch(status);
            }
            Request::DestroyContext { context_id } => {
                let status = self.delegate.destroy_context(context_id);
                self.latch(status);
            }
            Request::ExecuteCommandBuffer {
                buffer_id,
                context_id,
            } => {
                let status = self.delegate.execute_command_buffer(buffer_id, context_id);
                self.latch(status);
            }
            Request::WaitRendering { buffer_id } => {
                let status = self.delegate.wait_rendering(buffer_id);
                self.latch(status);
                return self.reply(Response::WaitRenderingDone { status });
            }
            Request::PageFlip {
                buffer_id,
                image,
                wait_semaphore_ids,
                signal_semaphore_ids,
            } => {
                let status = match handles.pop() {
                    Some(TransferHandle::Semaphore(presented)) => self.delegate.page_flip(
                        buffer_id,
                        image,
                        &wait_semaphore_ids,
                        &signal_semaphore_ids,
                        presented,
                    ),
                    _ => Status::InvalidArgs,
                };
                self.latch(status);
            }
            Request::GetError => {
                let status = self.error.take().unwrap_or(Status::Ok);
                return self.reply(Response::Error { status });
            }
        }
        true
    }

    fn latch(&mut self, status: Status) {
        if !status.is_ok() && self.error.is_none() {
            debug!(%status, "latching error");
            self.error = Some(status);
        }
    }

    fn reply(&mut self, response: Response) -> bool {
        if self.end.send(Message::new(encode_response(&response))).is_err() {
            debug!("remote closed before reply");
            return false;
        }
        true
    }
}
