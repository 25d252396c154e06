//! BLE transport layer abstraction.
//!
//! [`GattBackend`] is the contract with the platform BLE stack: every request
//! returns immediately and completes later through the [`GattEventSink`] it
//! was attached to. [`BlePlatform`] creates backends and scans for
//! advertisements. Production backends and the in-crate mock both implement
//! these traits.

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use super::addr::BdAddr;
use super::blocking::GattEventSink;

/// GATT status reporting success; any other value is a failure.
pub const GATT_SUCCESS: i32 = 0;
/// Generic failure status used when the platform gives no code.
pub const GATT_FAILURE: i32 = 0x101;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection is not established, can't {op} {target}")]
    NotConnected { op: &'static str, target: String },

    #[error("Timeout to {op} {target} after {timeout_ms}ms")]
    Timeout {
        op: &'static str,
        target: String,
        timeout_ms: u64,
    },

    #[error("Connection is lost while waiting to {op} {target}")]
    ConnectionLost { op: &'static str, target: String },

    #[error("Failed to establish connection with {target}: {reason}")]
    ConnectionFailed { target: String, reason: String },

    #[error("Failed to write {target}: {reason}")]
    WriteFailed { target: String, reason: String },

    #[error("Failed to read {target}: {reason}")]
    ReadFailed { target: String, reason: String },

    #[error("Failed to {op} {target}: {reason}")]
    RequestFailed {
        op: &'static str,
        target: String,
        reason: String,
    },

    #[error("Characteristic not found: {0}")]
    CharacteristicNotFound(Uuid),

    #[error("Neither notify nor indicate is supported by {0}")]
    NotificationUnsupported(Uuid),

    #[error("Characteristic {0} is not writable")]
    NotWritable(Uuid),

    #[error("Device not found: {0}")]
    DeviceNotFound(BdAddr),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("BLE backend error: {0}")]
    Backend(String),
}

/// Link state as tracked from connection-changed completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Characteristic property bits as defined by the Core Specification.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct CharProps(u8);

impl CharProps {
    pub const BROADCAST: Self = Self(0x01);
    pub const READ: Self = Self(0x02);
    pub const WRITE_NO_RESPONSE: Self = Self(0x04);
    pub const WRITE: Self = Self(0x08);
    pub const NOTIFY: Self = Self(0x10);
    pub const INDICATE: Self = Self(0x20);
    pub const SIGNED_WRITE: Self = Self(0x40);
    pub const EXTENDED: Self = Self(0x80);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(&self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for CharProps {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for CharProps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const LETTERS: [char; 8] = ['B', 'R', 'w', 'W', 'N', 'I', 'S', 'E'];
        for (bit, letter) in LETTERS.iter().enumerate() {
            let c = if self.0 & (1 << bit) != 0 { *letter } else { '-' };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl fmt::Debug for CharProps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CharProps({})", self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub properties: CharProps,
    /// Whether a Client Characteristic Configuration Descriptor is present.
    pub has_cccd: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

impl ServiceInfo {
    pub fn characteristic(&self, uuid: &Uuid) -> Option<&CharacteristicInfo> {
        self.characteristics.iter().find(|c| c.uuid == *uuid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

/// Platform GATT client for one peer.
///
/// Requests return `Err` only when the stack refuses them outright. Accepted
/// requests complete exactly once through the attached sink, carrying a
/// status. Implementations must not call the sink from inside a request.
pub trait GattBackend: Send + Sync {
    fn address(&self) -> BdAddr;

    /// Registers the completion sink; called once before any request.
    fn attach(&self, sink: GattEventSink);

    fn connect(&self) -> Result<(), TransportError>;

    fn disconnect(&self);

    /// Releases the native handle. Further requests fail until the next `connect`.
    fn close(&self);

    fn discover_services(&self) -> Result<(), TransportError>;

    /// Services found by the last discovery.
    fn services(&self) -> Vec<ServiceInfo>;

    fn request_mtu(&self, mtu: u16) -> Result<(), TransportError>;

    fn read_characteristic(&self, chr: Uuid) -> Result<(), TransportError>;

    fn write_characteristic(
        &self,
        chr: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), TransportError>;

    fn write_descriptor(&self, chr: Uuid, descriptor: Uuid, value: &[u8])
    -> Result<(), TransportError>;

    /// Local routing of value notifications; completes synchronously.
    fn set_characteristic_notification(&self, chr: Uuid, enable: bool)
    -> Result<(), TransportError>;
}

/// One advertisement seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub address: BdAddr,
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// Entry point into a platform BLE stack.
pub trait BlePlatform: Send + Sync {
    /// Creates a GATT client for `address`. No connection is made yet.
    fn open(&self, address: &BdAddr) -> Result<Arc<dyn GattBackend>, TransportError>;

    /// Blocks until `address` advertises or `timeout` elapses.
    fn scan_for_device(
        &self,
        address: &BdAddr,
        timeout: Duration,
    ) -> Result<Option<ScanReport>, TransportError>;
}
