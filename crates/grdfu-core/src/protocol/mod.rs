//! Protocol module - GR5xxx DFU wire formats.

pub mod constants;
pub mod fast;
pub mod frame;
pub mod opcode;

pub use constants::*;
pub use fast::FastCmd;
pub use frame::{FrameError, FrameHeader, decode_frame, encode_frame};
pub use opcode::{EraseState, FastOpcode, Opcode};
