//! Duplex request/response connection between a client and the driver core.
//!
//! One connection is a pair of halves over one duplex channel:
//! - [`IpcConnection`]: the client-side synchronous proxy. Thread-safe;
//!   serializes requests onto the channel and blocks where a reply is part
//!   of the call's contract.
//! - [`Connection`]: the server half. Runs a dispatch loop on a dedicated
//!   thread, decoding each request and invoking a [`Delegate`].
//!
//! Messages carry their payload as bytes plus zero or more transferable
//! handles riding out-of-band; handles never appear in the byte stream.

pub mod channel;
pub mod client;
pub mod server;
pub mod wire;

pub use channel::{channel, ClientEnd, Message, RecvError, ServerEnd, ShutdownSignal, TransferHandle};
pub use client::IpcConnection;
pub use server::{Connection, Delegate};
pub use wire::{DecodeError, Request, Response};
