//! Transport layer module.

pub mod addr;
pub mod blocking;
#[cfg(feature = "btleplug")]
pub mod btleplug;
pub mod event;
pub mod mock;
pub mod notify;
pub mod traits;

pub use addr::{BdAddr, ParseAddrError};
pub use blocking::{BleConfig, BlockingBle, GattEventSink, LinkInfo};
#[cfg(feature = "btleplug")]
pub use btleplug::BtleplugPlatform;
pub use event::{EVENT_QUEUE_CAPACITY, GattEvent};
pub use mock::{
    ConnectMode, LINK_LOSS_STATUS, MockGatt, MockPeripheral, MockPlatform, MockReaction,
    dfu_service, fast_dfu_service,
};
pub use traits::{
    BlePlatform, CharProps, CharacteristicInfo, ConnectionState, GATT_FAILURE, GATT_SUCCESS,
    GattBackend, ScanReport, ServiceInfo, TransportError, WriteType,
};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, recovering the data of a poisoned lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
