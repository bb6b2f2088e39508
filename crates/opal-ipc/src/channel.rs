//! In-process duplex channel with out-of-band handle transfer.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use opal_platform::{MemoryObject, Semaphore};

/// A kernel-style handle attached to a message.
#[derive(Debug, Clone)]
pub enum TransferHandle {
    Buffer(MemoryObject),
    Semaphore(Semaphore),
}

/// One framed message: an opaque payload plus its attached handles.
#[derive(Debug)]
pub struct Message {
    pub bytes: Vec<u8>,
    pub handles: Vec<TransferHandle>,
}

impl Message {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            handles: Vec::new(),
        }
    }

    pub fn with_handles(bytes: Vec<u8>, handles: Vec<TransferHandle>) -> Self {
        Self { bytes, handles }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    /// The remote end was dropped; no further messages will arrive.
    Closed,
    /// The connection's shutdown signal was raised.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendError;

struct QueueState {
    messages: VecDeque<Message>,
    closed: bool,
    shutdown: bool,
}

struct Queue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

impl Queue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                messages: VecDeque::new(),
                closed: false,
                shutdown: false,
            }),
            cv: Condvar::new(),
        })
    }

    fn send(&self, message: Message) -> Result<(), SendError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(SendError);
        }
        state.messages.push_back(message);
        self.cv.notify_one();
        Ok(())
    }

    /// Blocks until a message, close, or (when armed) shutdown. Shutdown
    /// takes priority over queued messages: the dispatch loop must exit even
    /// with requests pending.
    fn recv(&self) -> Result<Message, RecvError> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.shutdown {
                return Err(RecvError::Shutdown);
            }
            if let Some(message) = state.messages.pop_front() {
                return Ok(message);
            }
            if state.closed {
                return Err(RecvError::Closed);
            }
            state = self.cv.wait(state).unwrap();
        }
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.cv.notify_all();
    }

    fn raise_shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        self.cv.notify_all();
    }
}

/// Cancellation token for a server half's blocking receive.
///
/// Raising it wakes the current (or next) blocking wait with
/// [`RecvError::Shutdown`]. Raising an already-raised signal is a no-op.
#[derive(Clone)]
pub struct ShutdownSignal {
    queue: Arc<Queue>,
}

impl ShutdownSignal {
    pub fn signal(&self) {
        self.queue.raise_shutdown();
    }

    pub fn is_signaled(&self) -> bool {
        self.queue.state.lock().unwrap().shutdown
    }
}

impl std::fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownSignal")
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

/// Client half of a duplex channel.
pub struct ClientEnd {
    tx: Arc<Queue>,
    rx: Arc<Queue>,
}

/// Server half of a duplex channel.
pub struct ServerEnd {
    tx: Arc<Queue>,
    rx: Arc<Queue>,
}

/// Creates a connected channel pair.
pub fn channel() -> (ClientEnd, ServerEnd) {
    let to_server = Queue::new();
    let to_client = Queue::new();
    (
        ClientEnd {
            tx: Arc::clone(&to_server),
            rx: Arc::clone(&to_client),
        },
        ServerEnd {
            tx: to_client,
            rx: to_server,
        },
    )
}

impl ClientEnd {
    pub fn send(&self, message: Message) -> Result<(), SendError> {
        self.tx.send(message)
    }

    /// Blocks for the next reply.
    pub fn recv(&self) -> Result<Message, RecvError> {
        self.rx.recv()
    }
}

impl ServerEnd {
    pub fn send(&self, message: Message) -> Result<(), SendError> {
        self.tx.send(message)
    }

    /// Blocks for the next request, the remote close, or shutdown.
    pub fn recv(&self) -> Result<Message, RecvError> {
        self.rx.recv()
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            queue: Arc::clone(&self.rx),
        }
    }
}

impl Drop for ClientEnd {
    fn drop(&mut self) {
        self.tx.close();
        self.rx.close();
    }
}

impl Drop for ServerEnd {
    fn drop(&mut self) {
        self.tx.close();
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn messages_arrive_in_order_with_handles() {
        let (client, server) = channel();

        let sem = Semaphore::new();
        client.send(Message::new(vec![1])).unwrap();
        client
            .send(Message::with_handles(
                vec![2],
                vec![TransferHandle::Semaphore(sem.duplicate())],
            ))
            .unwrap();

        let first = server.recv().unwrap();
        assert_eq!(first.bytes, vec![1]);
        assert!(first.handles.is_empty());

        let second = server.recv().unwrap();
        assert_eq!(second.bytes, vec![2]);
        match &second.handles[..] {
            [TransferHandle::Semaphore(received)] => assert_eq!(received.id(), sem.id()),
            other => panic!("unexpected handles: {other:?}"),
        }
    }

    #[test]
    fn dropping_client_closes_server_recv() {
        let (client, server) = channel();
        client.send(Message::new(vec![9])).unwrap();
        drop(client);

        // Queued data drains before the close is observed.
        assert_eq!(server.recv().unwrap().bytes, vec![9]);
        assert!(matches!(server.recv(), Err(RecvError::Closed)));
        assert_eq!(server.send(Message::new(vec![0])), Err(SendError));
    }

    #[test]
    fn shutdown_wakes_blocked_recv() {
        let (_client, server) = channel();
        let signal = server.shutdown_signal();

        let waiter = thread::spawn(move || server.recv());
        thread::sleep(Duration::from_millis(20));
        signal.signal();
        assert!(matches!(waiter.join().unwrap(), Err(RecvError::Shutdown)));
    }

    #[test]
    fn shutdown_is_idempotent_and_beats_pending_messages() {
        let (client, server) = channel();
        let signal = server.shutdown_signal();

        client.send(Message::new(vec![1])).unwrap();
        signal.signal();
        signal.signal();
        assert!(signal.is_signaled());
        assert!(matches!(server.recv(), Err(RecvError::Shutdown)));
    }

    #[test]
    fn buffer_handle_transfer_preserves_identity() {
        let (client, server) = channel();
        let object = MemoryObject::create(4096).unwrap();

        client
            .send(Message::with_handles(
                vec![],
                vec![TransferHandle::Buffer(object.duplicate())],
            ))
            .unwrap();

        let message = server.recv().unwrap();
        match &message.handles[..] {
            [TransferHandle::Buffer(received)] => {
                assert_eq!(received.id(), object.id());
                assert!(received.same_object(&object));
            }
            other => panic!("unexpected handles: {other:?}"),
        }
    }
}
