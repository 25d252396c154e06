//! GRDFU-Core: Goodix GR5xxx BLE firmware update in Rust.
//!
//! This crate implements the over-the-air DFU protocols of GR5xxx devices:
//! the legacy single-firmware protocol (v1), the AppBootloader protocol (v2)
//! and FastDfu.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Codec**: Little-endian cursor over byte buffers
//! - **Image**: Image trailer, boot info and DFU file model
//! - **Protocol**: UUIDs, opcodes and frame layout
//! - **Transport**: Blocking facade over callback-driven GATT stacks (mock, btleplug)
//! - **Engine**: Legacy/AppBootloader and FastDfu state machines
//! - **Events**: Listener pattern for UI decoupling
//! - **Session**: High-level orchestrator running updates on a worker thread
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use grdfu_core::session::{DfuSession, SessionConfig};
//! use grdfu_core::transport::MockPlatform;
//!
//! let platform = Arc::new(MockPlatform::new());
//! let session = DfuSession::new(SessionConfig::default(), platform);
//! let firmware = std::fs::read("app_fw.bin").expect("read firmware");
//! let target = "C0:11:22:33:44:55".parse().expect("address");
//! session.start_firmware(target, firmware).join().expect("DFU failed");
//! ```

pub mod cancel;
pub mod codec;
pub mod engine;
pub mod error;
pub mod events;
pub mod image;
pub mod protocol;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testkit;

// Re-exports for convenience
pub use cancel::CancelToken;
pub use codec::{CodecError, HexCursor};
pub use engine::{EngineTiming, FastDfu, FastTarget, LegacyDfu, ProtocolVersion};
pub use error::{DfuError, Region};
pub use events::{ChannelListener, DfuEvent, DfuListener, NullListener, TracingListener};
pub use image::{BootInfo, DfuFile, FileError, ImgInfo};
pub use session::{DfuSession, DfuTask, SessionConfig, UpdateRequest};
pub use transport::{BdAddr, BleConfig, BlePlatform, BlockingBle, TransportError};
