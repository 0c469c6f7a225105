//! Cross-process named locks over a local stream socket.
//!
//! A single long-lived daemon (the `quarry-syncd` binary, or an in-process
//! instance in `no_fork` mode) arbitrates shared/exclusive locks on string
//! keys for any number of client processes. Clients open a [`SyncContext`]
//! per lock-ownership scope, acquire a sorted set of keys in one blocking
//! call, and release everything at once by closing the context; a dropped
//! connection releases implicitly. The daemon queues conflicting requests
//! FIFO per key and shuts itself down after a configurable idle period.

mod client;
mod net;
mod server;
mod wire;

pub use client::{parse_idle_timeout, SyncClient, SyncClientConfig, SyncContext, SyncError};
pub use net::{ParseSocketFamilyError, SocketFamily};
pub use server::{Server, ServerConfig};
pub use wire::ProtocolError;
