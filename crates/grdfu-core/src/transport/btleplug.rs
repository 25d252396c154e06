//! Platform BLE stack backed by `btleplug`.
//!
//! btleplug exposes an async API; every [`GattBackend`] request is spawned on
//! a private tokio runtime and its outcome is reported through the attached
//! [`GattEventSink`], which keeps the callback contract of the blocking layer.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType as BtWriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::addr::BdAddr;
use super::blocking::GattEventSink;
use super::lock;
use super::traits::{
    BlePlatform, CharProps, CharacteristicInfo, ConnectionState, GATT_FAILURE, GATT_SUCCESS,
    GattBackend, ScanReport, ServiceInfo, TransportError, WriteType,
};
use crate::protocol::constants::{CCCD_UUID, DFU_MAX_MTU};

/// Lookup window when a peer is opened without a prior scan.
const OPEN_SCAN_TIMEOUT: Duration = Duration::from_secs(10);

fn backend_error(e: btleplug::Error) -> TransportError {
    TransportError::Backend(e.to_string())
}

fn to_bt_addr(addr: &BdAddr) -> BDAddr {
    BDAddr::from(addr.octets())
}

/// First adapter of the host, driven by a private runtime.
pub struct BtleplugPlatform {
    runtime: Arc<Runtime>,
    adapter: Adapter,
}

impl BtleplugPlatform {
    pub fn new() -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("grdfu-ble")
            .build()
            .map_err(|e| TransportError::Backend(e.to_string()))?;
        let adapter = runtime.block_on(async {
            let manager = Manager::new().await.map_err(backend_error)?;
            let adapters = manager.adapters().await.map_err(backend_error)?;
            adapters
                .into_iter()
                .next()
                .ok_or_else(|| TransportError::Backend("No Bluetooth adapter found".into()))
        })?;
        Ok(Self {
            runtime: Arc::new(runtime),
            adapter,
        })
    }

    async fn find(adapter: &Adapter, address: BDAddr) -> Result<Option<Peripheral>, TransportError> {
        for peripheral in adapter.peripherals().await.map_err(backend_error)? {
            if peripheral.address() == address {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }

    async fn scan(
        adapter: &Adapter,
        address: BDAddr,
    ) -> Result<Option<(Peripheral, ScanReport)>, TransportError> {
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(backend_error)?;
        let mut events = adapter.events().await.map_err(backend_error)?;
        while let Some(event) = events.next().await {
            let id = match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                _ => continue,
            };
            let peripheral = adapter.peripheral(&id).await.map_err(backend_error)?;
            let Some(props) = peripheral.properties().await.map_err(backend_error)? else {
                continue;
            };
            if props.address != address {
                continue;
            }
            adapter.stop_scan().await.map_err(backend_error)?;
            let report = ScanReport {
                address: BdAddr::new(props.address.into_inner()),
                name: props.local_name,
                rssi: props.rssi,
            };
            return Ok(Some((peripheral, report)));
        }
        Ok(None)
    }
}

impl BlePlatform for BtleplugPlatform {
    fn open(&self, address: &BdAddr) -> Result<Arc<dyn GattBackend>, TransportError> {
        let target = to_bt_addr(address);
        let adapter = self.adapter.clone();
        let peripheral = self.runtime.block_on(async move {
            if let Some(p) = Self::find(&adapter, target).await? {
                return Ok(Some(p));
            }
            match tokio::time::timeout(OPEN_SCAN_TIMEOUT, Self::scan(&adapter, target)).await {
                Ok(found) => Ok(found?.map(|(p, _)| p)),
                Err(_) => {
                    let _ = adapter.stop_scan().await;
                    Ok(None)
                }
            }
        })?;
        let peripheral = peripheral.ok_or(TransportError::DeviceNotFound(*address))?;
        Ok(Arc::new(BtleplugGatt {
            runtime: Arc::clone(&self.runtime),
            adapter: self.adapter.clone(),
            address: *address,
            peripheral,
            sink: Mutex::new(None),
            services: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    fn scan_for_device(
        &self,
        address: &BdAddr,
        timeout: Duration,
    ) -> Result<Option<ScanReport>, TransportError> {
        let target = to_bt_addr(address);
        let adapter = self.adapter.clone();
        info!(addr = %address, timeout_ms = timeout.as_millis() as u64, "Scanning");
        self.runtime.block_on(async move {
            match tokio::time::timeout(timeout, Self::scan(&adapter, target)).await {
                Ok(found) => Ok(found?.map(|(_, report)| report)),
                Err(_) => {
                    let _ = adapter.stop_scan().await;
                    Ok(None)
                }
            }
        })
    }
}

/// GATT client of one btleplug peripheral.
pub struct BtleplugGatt {
    runtime: Arc<Runtime>,
    adapter: Adapter,
    address: BdAddr,
    peripheral: Peripheral,
    sink: Mutex<Option<GattEventSink>>,
    services: Mutex<Vec<ServiceInfo>>,
    /// Notification pump and disconnect watcher of the current connection.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BtleplugGatt {
    fn sink(&self) -> Result<GattEventSink, TransportError> {
        lock(&self.sink)
            .clone()
            .ok_or_else(|| TransportError::Backend("no event sink attached".into()))
    }

    fn characteristic(&self, chr: &Uuid) -> Result<Characteristic, TransportError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == *chr)
            .ok_or(TransportError::CharacteristicNotFound(*chr))
    }

    fn collect_services(&self) -> Vec<ServiceInfo> {
        self.peripheral
            .services()
            .into_iter()
            .map(|service| ServiceInfo {
                uuid: service.uuid,
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| {
                        let properties = CharProps::from_bits(c.properties.bits());
                        CharacteristicInfo {
                            uuid: c.uuid,
                            properties,
                            // Some hosts hide the CCCD and manage it themselves.
                            has_cccd: c.descriptors.iter().any(|d| d.uuid == CCCD_UUID)
                                || properties.intersects(CharProps::NOTIFY | CharProps::INDICATE),
                        }
                    })
                    .collect(),
            })
            .collect()
    }

    fn start_link_tasks(&self, sink: GattEventSink) {
        let peripheral = self.peripheral.clone();
        let ntf_sink = sink.clone();
        let pump = self.runtime.spawn(async move {
            match peripheral.notifications().await {
                Ok(mut stream) => {
                    while let Some(ntf) = stream.next().await {
                        ntf_sink.on_characteristic_changed(ntf.uuid, ntf.value);
                    }
                }
                Err(e) => warn!(error = %e, "Notification stream unavailable"),
            }
        });

        let adapter = self.adapter.clone();
        let id = self.peripheral.id();
        let watcher = self.runtime.spawn(async move {
            let Ok(mut events) = adapter.events().await else {
                return;
            };
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event
                    && gone == id
                {
                    sink.on_connection_state_changed(GATT_SUCCESS, ConnectionState::Disconnected);
                    return;
                }
            }
        });

        let mut tasks = lock(&self.tasks);
        tasks.push(pump);
        tasks.push(watcher);
    }

    fn stop_link_tasks(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

impl GattBackend for BtleplugGatt {
    fn address(&self) -> BdAddr {
        self.address
    }

    fn attach(&self, sink: GattEventSink) {
        *lock(&self.sink) = Some(sink);
    }

    fn connect(&self) -> Result<(), TransportError> {
        let sink = self.sink()?;
        let peripheral = self.peripheral.clone();
        self.stop_link_tasks();
        self.start_link_tasks(sink.clone());
        self.runtime.spawn(async move {
            match peripheral.connect().await {
                Ok(()) => sink.on_connection_state_changed(GATT_SUCCESS, ConnectionState::Connected),
                Err(e) => {
                    warn!(error = %e, "Connect attempt failed");
                    sink.on_connection_state_changed(GATT_FAILURE, ConnectionState::Disconnected);
                }
            }
        });
        Ok(())
    }

    fn disconnect(&self) {
        let Ok(sink) = self.sink() else { return };
        let peripheral = self.peripheral.clone();
        self.runtime.spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                debug!(error = %e, "Disconnect request failed");
            }
            sink.on_connection_state_changed(GATT_SUCCESS, ConnectionState::Disconnected);
        });
    }

    fn close(&self) {
        self.stop_link_tasks();
        lock(&self.services).clear();
    }

    fn discover_services(&self) -> Result<(), TransportError> {
        let sink = self.sink()?;
        let peripheral = self.peripheral.clone();
        self.runtime.spawn(async move {
            let status = match peripheral.discover_services().await {
                Ok(()) => GATT_SUCCESS,
                Err(e) => {
                    warn!(error = %e, "Service discovery failed");
                    GATT_FAILURE
                }
            };
            sink.on_services_discovered(status);
        });
        Ok(())
    }

    fn services(&self) -> Vec<ServiceInfo> {
        let mut cached = lock(&self.services);
        if cached.is_empty() {
            *cached = self.collect_services();
        }
        cached.clone()
    }

    /// btleplug negotiates the ATT MTU inside the host stack.
    fn request_mtu(&self, mtu: u16) -> Result<(), TransportError> {
        let sink = self.sink()?;
        self.runtime.spawn(async move {
            sink.on_mtu_changed(GATT_SUCCESS, mtu.min(DFU_MAX_MTU));
        });
        Ok(())
    }

    fn read_characteristic(&self, chr: Uuid) -> Result<(), TransportError> {
        let sink = self.sink()?;
        let characteristic = self.characteristic(&chr)?;
        let peripheral = self.peripheral.clone();
        self.runtime.spawn(async move {
            match peripheral.read(&characteristic).await {
                Ok(value) => sink.on_characteristic_read(chr, GATT_SUCCESS, value),
                Err(e) => {
                    warn!(chr = %chr, error = %e, "Read failed");
                    sink.on_characteristic_read(chr, GATT_FAILURE, Vec::new());
                }
            }
        });
        Ok(())
    }

    fn write_characteristic(
        &self,
        chr: Uuid,
        value: &[u8],
        write_type: WriteType,
    ) -> Result<(), TransportError> {
        let sink = self.sink()?;
        let characteristic = self.characteristic(&chr)?;
        let peripheral = self.peripheral.clone();
        let value = value.to_vec();
        let write_type = match write_type {
            WriteType::WithResponse => BtWriteType::WithResponse,
            WriteType::WithoutResponse => BtWriteType::WithoutResponse,
        };
        self.runtime.spawn(async move {
            let status = match peripheral.write(&characteristic, &value, write_type).await {
                Ok(()) => GATT_SUCCESS,
                Err(e) => {
                    warn!(chr = %chr, error = %e, "Write failed");
                    GATT_FAILURE
                }
            };
            sink.on_characteristic_written(chr, status);
        });
        Ok(())
    }

    /// Only the CCCD is supported; it maps onto subscribe / unsubscribe.
    fn write_descriptor(
        &self,
        chr: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        if descriptor != CCCD_UUID {
            return Err(TransportError::NotWritable(descriptor));
        }
        let sink = self.sink()?;
        let characteristic = self.characteristic(&chr)?;
        let peripheral = self.peripheral.clone();
        let enable = value.iter().any(|b| *b != 0);
        self.runtime.spawn(async move {
            let result = if enable {
                peripheral.subscribe(&characteristic).await
            } else {
                peripheral.unsubscribe(&characteristic).await
            };
            let status = match result {
                Ok(()) => GATT_SUCCESS,
                Err(e) => {
                    warn!(chr = %chr, error = %e, "Subscription change failed");
                    GATT_FAILURE
                }
            };
            sink.on_descriptor_written(chr, descriptor, status);
        });
        Ok(())
    }

    fn set_characteristic_notification(
        &self,
        chr: Uuid,
        _enable: bool,
    ) -> Result<(), TransportError> {
        self.characteristic(&chr).map(|_| ())
    }
}

impl Drop for BtleplugGatt {
    fn drop(&mut self) {
        self.stop_link_tasks();
    }
}
