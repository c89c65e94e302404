//! Backhaul control plane primitives
//!
//! Shared by the server broker and the agent linker:
//! - [`LocalSocket`]: handle to a locally-owned TCP connection
//! - [`RequestRegistry`]: request id to socket table with optional deadlines
//! - [`RequestGate`]: per-key FIFO mutual exclusion

pub mod gate;
pub mod registry;
pub mod socket;

pub use gate::{GateGuard, GateTicket, RequestGate};
pub use registry::{ExpiryHook, RegistryError, RequestRegistry};
pub use socket::{LocalSocket, SocketClosed};
