//! Client-side synchronous proxy.

use std::sync::Mutex;

use opal_abi::{ImageDescriptor, ObjectType, Status};
use opal_platform::{PlatformBuffer, Semaphore};
use tracing::warn;

use crate::channel::{ClientEnd, Message, TransferHandle};
use crate::wire::{decode_response, encode_request, Request, Response};

struct ClientState {
    end: ClientEnd,
    next_context_id: u32,
}

/// Synchronous proxy for one connection.
///
/// All calls are thread-safe with respect to each other on one instance: an
/// internal lock serializes requests, so a round trip (send plus reply)
/// never interleaves with another call's traffic.
///
/// Most requests are fire-and-forget; failures are latched server-side and
/// surfaced by [`get_error`], which returns the first error recorded since
/// the previous call and clears it.
///
/// [`get_error`]: IpcConnection::get_error
pub struct IpcConnection {
    state: Mutex<ClientState>,
}

impl IpcConnection {
    pub fn new(end: ClientEnd) -> Self {
        Self {
            state: Mutex::new(ClientState {
                end,
                next_context_id: 1,
            }),
        }
    }

    /// Imports `buffer` into the server side of the connection by handing
    /// over a duplicated handle.
    pub fn import_buffer(&self, buffer: &PlatformBuffer) -> Result<(), Status> {
        let state = self.state.lock().unwrap();
        send(
            &state.end,
            &Request::ImportBuffer,
            vec![TransferHandle::Buffer(buffer.duplicate_handle())],
        )
    }

    pub fn release_buffer(&self, buffer_id: u64) -> Result<(), Status> {
        let state = self.state.lock().unwrap();
        send(&state.end, &Request::ReleaseBuffer { buffer_id }, vec![])
    }

    /// Imports a secondary object (currently semaphores).
    pub fn import_object(&self, semaphore: &Semaphore) -> Result<(), Status> {
        let state = self.state.lock().unwrap();
        send(
            &state.end,
            &Request::ImportObject {
                object_type: ObjectType::Semaphore,
            },
            vec![TransferHandle::Semaphore(semaphore.duplicate())],
        )
    }

    pub fn release_object(&self, object_id: u64, object_type: ObjectType) -> Result<(), Status> {
        let state = self.state.lock().unwrap();
        send(
            &state.end,
            &Request::ReleaseObject {
                object_id,
                object_type,
            },
            vec![],
        )
    }

    /// Creates a context and returns its id. Context ids are allocated on
    /// the client; the server learns them from the request.
    pub fn create_context(&self) -> Result<u32, Status> {
        let mut state = self.state.lock().unwrap();
        let context_id = state.next_context_id;
        state.next_context_id = state.next_context_id.wrapping_add(1);
        send(&state.end, &Request::CreateContext { context_id }, vec![])?;
        Ok(context_id)
    }

    pub fn destroy_context(&self, context_id: u32) -> Result<(), Status> {
        let state = self.state.lock().unwrap();
        send(&state.end, &Request::DestroyContext { context_id }, vec![])
    }

    pub fn execute_command_buffer(&self, buffer_id: u64, context_id: u32) -> Result<(), Status> {
        let state = self.state.lock().unwrap();
        send(
            &state.end,
            &Request::ExecuteCommandBuffer {
                buffer_id,
                context_id,
            },
            vec![],
        )
    }

    /// Blocks until all GPU work referencing the buffer at call time has
    /// completed. Work queued afterward is not waited on.
    pub fn wait_rendering(&self, buffer_id: u64) -> Status {
        let state = self.state.lock().unwrap();
        if send(&state.end, &Request::WaitRendering { buffer_id }, vec![]).is_err() {
            return Status::ConnectionLost;
        }
        match recv_response(&state.end) {
            Ok(Response::WaitRenderingDone { status }) => status,
            Ok(other) => {
                warn!(?other, "unexpected reply to wait_rendering");
                Status::InternalError
            }
            Err(status) => status,
        }
    }

    /// Queues `buffer_id` for display scanout. `wait_semaphore_ids` gate the
    /// flip, `signal_semaphore_ids` fire when the buffer is reusable, and
    /// `presented` fires when the buffer becomes visible.
    pub fn page_flip(
        &self,
        buffer_id: u64,
        image: ImageDescriptor,
        wait_semaphore_ids: &[u64],
        signal_semaphore_ids: &[u64],
        presented: &Semaphore,
    ) -> Result<(), Status> {
        let state = self.state.lock().unwrap();
        send(
            &state.end,
            &Request::PageFlip {
                buffer_id,
                image,
                wait_semaphore_ids: wait_semaphore_ids.to_vec(),
                signal_semaphore_ids: signal_semaphore_ids.to_vec(),
            },
            vec![TransferHandle::Semaphore(presented.duplicate())],
        )
    }

    /// Returns the first error recorded since the previous call, clearing
    /// the latch. `Status::Ok` means no error was recorded.
    pub fn get_error(&self) -> Status {
        let state = self.state.lock().unwrap();
        if send(&state.end, &Request::GetError, vec![]).is_err() {
            return Status::ConnectionLost;
        }
        match recv_response(&state.end) {
            Ok(Response::Error { status }) => status,
            Ok(other) => {
                warn!(?other, "unexpected reply to get_error");
                Status::InternalError
            }
            Err(status) => status,
        }
    }
}

fn send(end: &ClientEnd, request: &Request, handles: Vec<TransferHandle>) -> Result<(), Status> {
    debug_assert_eq!(handles.len(), request.expected_handles());
    end.send(Message::with_handles(encode_request(request), handles))
        .map_err(|_| Status::ConnectionLost)
}

fn recv_response(end: &ClientEnd) -> Result<Response, Status> {
    let message = end.recv().map_err(|_| Status::ConnectionLost)?;
    decode_response(&message.bytes).map_err(|err| {
        warn!(%err, "malformed reply");
        Status::InternalError
    })
}
