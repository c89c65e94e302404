//! Backhaul Protocol Definitions
//!
//! This crate defines the control-channel frame format shared by the server
//! broker and the agent linker, plus the static tunnel and agent records both
//! sides are configured with.

pub mod frame;
pub mod records;
pub mod request_id;

pub use frame::{Frame, FrameCodec, FrameError, Opcode};
pub use records::{Agent, Tunnel};
pub use request_id::RequestId;

/// Frame header width: 1 byte opcode + 16 bytes request id
pub const HEADER_LEN: usize = 17;

/// Default maximum size of one control-channel message (header included)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 65536;
