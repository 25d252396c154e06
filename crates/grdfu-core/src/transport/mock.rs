//! Mock BLE stack for testing.
//!
//! [`MockGatt`] behaves like a platform GATT client: requests are queued to a
//! private callback thread and completed later through the attached
//! [`GattEventSink`]. What the remote device does with written data is
//! decided by a [`MockPeripheral`].

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, trace};
use uuid::Uuid;

use super::addr::BdAddr;
use super::blocking::GattEventSink;
use super::lock;
use super::traits::{
    BlePlatform, CharProps, CharacteristicInfo, ConnectionState, GATT_FAILURE, GATT_SUCCESS,
    GattBackend, ScanReport, ServiceInfo, TransportError, WriteType,
};
use crate::protocol::constants::{
    ATT_WRITE_OVERHEAD, CCCD_UUID, DEFAULT_MTU, DFU_CTRL_CHR_UUID, DFU_MAX_MTU,
    DFU_NOTIFY_CHR_UUID, DFU_SERVICE_UUID, DFU_WRITE_CHR_UUID, FAST_DFU_CMD_CHR_UUID,
    FAST_DFU_DAT_CHR_UUID, FAST_DFU_SERVICE_UUID,
};

/// Status reported when the peer vanishes (supervision timeout).
pub const LINK_LOSS_STATUS: i32 = 0x08;

/// What the simulated device does in response to a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockReaction {
    /// Send a notification or indication on a characteristic.
    Notify(Uuid, Vec<u8>),
    /// Complete the write with this status instead of success.
    Reject(i32),
    /// Drop the link; the write is never confirmed.
    Disconnect,
}

/// Remote side of a [`MockGatt`] link.
pub trait MockPeripheral: Send {
    /// Called once per received write segment.
    fn on_write(&mut self, chr: Uuid, data: &[u8]) -> Vec<MockReaction>;

    fn on_read(&mut self, _chr: Uuid) -> Vec<u8> {
        Vec::new()
    }

    /// Called when the link goes down for any reason.
    fn on_disconnect(&mut self) {}
}

/// How the mock answers connection requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    Accept,
    /// Never report a connection.
    Ignore,
    /// Fail this many attempts, then accept.
    FailThenAccept(u32),
}

enum Request {
    Connect,
    Disconnect,
    Discover,
    Mtu(u16),
    Read(Uuid),
    Write(Uuid, Vec<u8>),
    Descriptor(Uuid, Uuid, Vec<u8>),
    Notify(Uuid, Vec<u8>),
    DropLink,
}

struct LinkState {
    opened: bool,
    connected: bool,
    connect_mode: ConnectMode,
    mtu: u16,
}

struct Inner {
    address: BdAddr,
    services: Vec<ServiceInfo>,
    sink: Mutex<Option<GattEventSink>>,
    peripheral: Mutex<Option<Box<dyn MockPeripheral>>>,
    link: Mutex<LinkState>,
    subscribed: Mutex<HashSet<Uuid>>,
    writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
    connect_attempts: Mutex<u32>,
}

impl Inner {
    fn sink(&self) -> Option<GattEventSink> {
        lock(&self.sink).clone()
    }

    fn drop_link(&self, status: i32) {
        let was_connected = {
            let mut link = lock(&self.link);
            std::mem::replace(&mut link.connected, false)
        };
        if !was_connected {
            return;
        }
        lock(&self.subscribed).clear();
        if let Some(peripheral) = lock(&self.peripheral).as_mut() {
            peripheral.on_disconnect();
        }
        if let Some(sink) = self.sink() {
            sink.on_connection_state_changed(status, ConnectionState::Disconnected);
        }
    }

    fn notify(&self, chr: Uuid, data: &[u8]) {
        if !lock(&self.link).connected || !lock(&self.subscribed).contains(&chr) {
            trace!(chr = %chr, "Mock notification dropped, not subscribed");
            return;
        }
        let Some(sink) = self.sink() else { return };
        let chunk_size = usize::from(lock(&self.link).mtu - ATT_WRITE_OVERHEAD);
        for chunk in data.chunks(chunk_size) {
            sink.on_characteristic_changed(chr, chunk.to_vec());
        }
    }

    fn handle(&self, request: Request) {
        let Some(sink) = self.sink() else { return };
        match request {
            Request::Connect => {
                let mode = lock(&self.link).connect_mode;
                *lock(&self.connect_attempts) += 1;
                match mode {
                    ConnectMode::Ignore => {}
                    ConnectMode::FailThenAccept(n) if n > 0 => {
                        lock(&self.link).connect_mode = ConnectMode::FailThenAccept(n - 1);
                        sink.on_connection_state_changed(
                            GATT_FAILURE,
                            ConnectionState::Disconnected,
                        );
                    }
                    _ => {
                        {
                            let mut link = lock(&self.link);
                            link.connected = true;
                            link.mtu = DEFAULT_MTU;
                        }
                        sink.on_connection_state_changed(GATT_SUCCESS, ConnectionState::Connected);
                    }
                }
            }
            Request::Disconnect => self.drop_link(GATT_SUCCESS),
            Request::DropLink => self.drop_link(LINK_LOSS_STATUS),
            Request::Discover => sink.on_services_discovered(GATT_SUCCESS),
            Request::Mtu(mtu) => {
                let mtu = mtu.clamp(DEFAULT_MTU, DFU_MAX_MTU);
                lock(&self.link).mtu = mtu;
                sink.on_mtu_changed(GATT_SUCCESS, mtu);
            }
            Request::Read(chr) => {
                let value = lock(&self.peripheral)
                    .as_mut()
                    .map(|p| p.on_read(chr))
                    .unwrap_or_default();
                sink.on_characteristic_read(chr, GATT_SUCCESS, value);
            }
            Request::Write(chr, data) => {
                lock(&self.writes).push((chr, data.clone()));
                let reactions = lock(&self.peripheral)
                    .as_mut()
                    .map(|p| p.on_write(chr, &data))
                    .unwrap_or_default();
                let mut status = GATT_SUCCESS;
                for reaction in reactions {
                    match reaction {
                        MockReaction::Notify(target, value) => self.notify(target, &value),
                        MockReaction::Reject(s) => status = s,
                        MockReaction::Disconnect => self.drop_link(LINK_LOSS_STATUS),
                    }
                }
                if lock(&self.link).connected {
                    sink.on_characteristic_written(chr, status);
                }
            }
            Request::Descriptor(chr, descriptor, value) => {
                if descriptor == CCCD_UUID {
                    let mut subscribed = lock(&self.subscribed);
                    if value.iter().any(|b| *b != 0) {
                        subscribed.insert(chr);
                    } else {
                        subscribed.remove(&chr);
                    }
                }
                sink.on_descriptor_written(chr, descriptor, GATT_SUCCESS);
            }
            Request::Notify(chr, value) => self.notify(chr, &value),
        }
    }
}

fn run_callbacks(inner: Arc<Inner>, requests: Receiver<Request>) {
    while let Ok(request) = requests.recv() {
        inner.handle(request);
    }
    trace!(addr = %inner.address, "Mock callback thread finished");
}

/// Simulated GATT client for one peer.
pub struct MockGatt {
    inner: Arc<Inner>,
    requests: Mutex<Sender<Request>>,
}

impl MockGatt {
    pub fn new(address: BdAddr, services: Vec<ServiceInfo>) -> Self {
        let inner = Arc::new(Inner {
            address,
            services,
            sink: Mutex::new(None),
            peripheral: Mutex::new(None),
            link: Mutex::new(LinkState {
                opened: false,
                connected: false,
                connect_mode: ConnectMode::Accept,
                mtu: DEFAULT_MTU,
            }),
            subscribed: Mutex::new(HashSet::new()),
            writes: Mutex::new(Vec::new()),
            connect_attempts: Mutex::new(0),
        });
        let (tx, rx) = mpsc::channel();
        let worker = Arc::clone(&inner);
        thread::spawn(move || run_callbacks(worker, rx));
        Self {
            inner,
            requests: Mutex::new(tx),
        }
    }

    pub fn with_peripheral(self, peripheral: impl MockPeripheral + 'static) -> Self {
        *lock(&self.inner.peripheral) = Some(Box::new(peripheral));
        self
    }

    pub fn set_connect_mode(&self, mode: ConnectMode) {
        lock(&self.inner.link).connect_mode = mode;
    }

    pub fn connect_attempts(&self) -> u32 {
        *lock(&self.inner.connect_attempts)
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.link).connected
    }

    pub fn is_opened(&self) -> bool {
        lock(&self.inner.link).opened
    }

    /// All write segments received so far.
    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        lock(&self.inner.writes).clone()
    }

    pub fn clear_writes(&self) {
        lock(&self.inner.writes).clear();
    }

    /// Sends an unsolicited notification from the peer.
    pub fn inject_notification(&self, chr: Uuid, data: Vec<u8>) {
        self.post(Request::Notify(chr, data));
    }

    /// Simulates the peer going out of range.
    pub fn drop_link(&self) {
        self.post(Request::DropLink);
    }

    /// Reports the link lost after `delay`, from another thread.
    pub fn drop_link_after(self: &Arc<Self>, delay: Duration) {
        let gatt = Arc::clone(self);
        thread::spawn(move || {
            thread::sleep(delay);
            gatt.drop_link();
        });
    }

    fn post(&self, request: Request) {
        // The receiver lives as long as `inner`, which outlives `self`.
        let _ = lock(&self.requests).send(request);
    }

    fn submit(&self, op: &'static str, request: Request) -> Result<(), TransportError> {
        if !lock(&self.inner.link).opened {
            return Err(TransportError::NotConnected {
                op,
                target: self.inner.address.to_string(),
            });
        }
        self.post(request);
        Ok(())
    }
}

impl GattBackend for MockGatt {
    fn address(&self) -> BdAddr {
        self.inner.address
    }

    fn attach(&self, sink: GattEventSink) {
        *lock(&self.inner.sink) = Some(sink);
    }

    fn connect(&self) -> Result<(), TransportError> {
        lock(&self.inner.link).opened = true;
        debug!(addr = %self.inner.address, "Mock connect requested");
        self.post(Request::Connect);
        Ok(())
    }

    fn disconnect(&self) {
        self.post(Request::Disconnect);
    }

    fn close(&self) {
        let mut link = lock(&self.inner.link);
        link.opened = false;
        if link.connected {
            link.connected = false;
            drop(link);
            lock(&self.inner.subscribed).clear();
            if let Some(peripheral) = lock(&self.inner.peripheral).as_mut() {
                peripheral.on_disconnect();
            }
        }
    }

    fn discover_services(&self) -> Result<(), TransportError> {
        self.submit("discover services of", Request::Discover)
    }

    fn services(&self) -> Vec<ServiceInfo> {
        self.inner.services.clone()
    }

    fn request_mtu(&self, mtu: u16) -> Result<(), TransportError> {
        self.submit("set MTU of", Request::Mtu(mtu))
    }

    fn read_characteristic(&self, chr: Uuid) -> Result<(), TransportError> {
        self.submit("read", Request::Read(chr))
    }

    fn write_characteristic(
        &self,
        chr: Uuid,
        value: &[u8],
        _write_type: WriteType,
    ) -> Result<(), TransportError> {
        self.submit("write", Request::Write(chr, value.to_vec()))
    }

    fn write_descriptor(
        &self,
        chr: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        self.submit(
            "write descriptor of",
            Request::Descriptor(chr, descriptor, value.to_vec()),
        )
    }

    fn set_characteristic_notification(
        &self,
        _chr: Uuid,
        _enable: bool,
    ) -> Result<(), TransportError> {
        Ok(())
    }
}

fn chr(uuid: Uuid, properties: CharProps) -> CharacteristicInfo {
    CharacteristicInfo {
        uuid,
        properties,
        has_cccd: properties.intersects(CharProps::NOTIFY | CharProps::INDICATE),
    }
}

/// Legacy DFU service; `app_bootloader` selects the indicating control point.
pub fn dfu_service(app_bootloader: bool) -> ServiceInfo {
    let ctrl = if app_bootloader {
        CharProps::WRITE | CharProps::INDICATE
    } else {
        CharProps::WRITE
    };
    ServiceInfo {
        uuid: DFU_SERVICE_UUID,
        characteristics: vec![
            chr(DFU_NOTIFY_CHR_UUID, CharProps::NOTIFY),
            chr(
                DFU_WRITE_CHR_UUID,
                CharProps::WRITE | CharProps::WRITE_NO_RESPONSE,
            ),
            chr(DFU_CTRL_CHR_UUID, ctrl),
        ],
    }
}

pub fn fast_dfu_service() -> ServiceInfo {
    ServiceInfo {
        uuid: FAST_DFU_SERVICE_UUID,
        characteristics: vec![
            chr(FAST_DFU_CMD_CHR_UUID, CharProps::WRITE | CharProps::NOTIFY),
            chr(FAST_DFU_DAT_CHR_UUID, CharProps::WRITE_NO_RESPONSE),
        ],
    }
}

/// Simulated radio environment holding a set of peers.
#[derive(Default)]
pub struct MockPlatform {
    devices: Mutex<HashMap<BdAddr, Arc<MockGatt>>>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, gatt: Arc<MockGatt>) {
        lock(&self.devices).insert(gatt.address(), gatt);
    }

    pub fn remove(&self, address: &BdAddr) -> Option<Arc<MockGatt>> {
        lock(&self.devices).remove(address)
    }

    pub fn device(&self, address: &BdAddr) -> Option<Arc<MockGatt>> {
        lock(&self.devices).get(address).cloned()
    }
}

impl BlePlatform for MockPlatform {
    fn open(&self, address: &BdAddr) -> Result<Arc<dyn GattBackend>, TransportError> {
        self.device(address)
            .map(|gatt| gatt as Arc<dyn GattBackend>)
            .ok_or(TransportError::DeviceNotFound(*address))
    }

    fn scan_for_device(
        &self,
        address: &BdAddr,
        _timeout: Duration,
    ) -> Result<Option<ScanReport>, TransportError> {
        Ok(self.device(address).map(|gatt| ScanReport {
            address: gatt.address(),
            name: Some("GR5xxx".to_string()),
            rssi: Some(-50),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::transport::blocking::{BleConfig, BlockingBle};
    use std::time::Instant;

    const ADDR: BdAddr = BdAddr::new([0xC0, 0x00, 0x00, 0x00, 0x00, 0x01]);

    /// Echoes every write back as a notification on the notify characteristic.
    struct Echo;

    impl MockPeripheral for Echo {
        fn on_write(&mut self, _chr: Uuid, data: &[u8]) -> Vec<MockReaction> {
            vec![MockReaction::Notify(DFU_NOTIFY_CHR_UUID, data.to_vec())]
        }
    }

    /// Never confirms and drops the link on the first write.
    struct Vanish;

    impl MockPeripheral for Vanish {
        fn on_write(&mut self, _chr: Uuid, _data: &[u8]) -> Vec<MockReaction> {
            vec![MockReaction::Disconnect]
        }
    }

    fn config() -> BleConfig {
        BleConfig {
            gatt_timeout: Duration::from_secs(2),
            poll_slice: Duration::from_millis(50),
            connect_retry_delay: Duration::from_millis(10),
            ..BleConfig::default()
        }
    }

    fn link(gatt: MockGatt) -> (Arc<MockGatt>, BlockingBle) {
        let gatt = Arc::new(gatt);
        let ble = BlockingBle::new(gatt.clone(), config(), CancelToken::new());
        (gatt, ble)
    }

    fn connected(gatt: MockGatt) -> (Arc<MockGatt>, BlockingBle) {
        let (gatt, ble) = link(gatt);
        ble.connect().unwrap();
        ble.discover_services().unwrap();
        (gatt, ble)
    }

    #[test]
    fn test_connect_and_disconnect() {
        let (gatt, ble) = link(MockGatt::new(ADDR, vec![dfu_service(false)]));
        ble.connect().unwrap();
        assert!(ble.is_connected());
        assert_eq!(ble.mtu(), DEFAULT_MTU);
        // Idempotent.
        ble.connect().unwrap();
        assert_eq!(gatt.connect_attempts(), 1);

        ble.disconnect().unwrap();
        assert!(!ble.is_connected());
        assert!(!gatt.is_opened());
        // Nothing left to release.
        ble.disconnect().unwrap();
    }

    #[test]
    fn test_connect_retries_failed_attempts() {
        let gatt = MockGatt::new(ADDR, vec![dfu_service(false)]);
        gatt.set_connect_mode(ConnectMode::FailThenAccept(2));
        let (gatt, ble) = link(gatt);
        ble.connect().unwrap();
        assert_eq!(gatt.connect_attempts(), 3);
    }

    #[test]
    fn test_connect_timeout_releases_handle() {
        let gatt = MockGatt::new(ADDR, vec![dfu_service(false)]);
        gatt.set_connect_mode(ConnectMode::Ignore);
        let (gatt, ble) = link(gatt);

        let start = Instant::now();
        let err = ble
            .connect_with_timeout(Duration::from_millis(300))
            .unwrap_err();
        let elapsed = start.elapsed();
        assert!(matches!(err, TransportError::Timeout { op: "connect", .. }));
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(300) + Duration::from_millis(500));
        assert!(!gatt.is_opened());
    }

    #[test]
    fn test_requests_need_connection() {
        let (_gatt, ble) = link(MockGatt::new(ADDR, vec![dfu_service(false)]));
        assert!(matches!(
            ble.set_mtu(247),
            Err(TransportError::NotConnected { .. })
        ));
        assert!(matches!(
            ble.write_chr(
                &DFU_WRITE_CHR_UUID,
                &[1],
                WriteType::WithResponse,
                Duration::from_millis(100)
            ),
            Err(TransportError::NotConnected { .. })
        ));
    }

    #[test]
    fn test_mtu_negotiation_is_clamped() {
        let (_gatt, ble) = connected(MockGatt::new(ADDR, vec![dfu_service(false)]));
        assert_eq!(ble.set_mtu(512).unwrap(), DFU_MAX_MTU);
        assert_eq!(ble.link_info().mtu, DFU_MAX_MTU);
    }

    #[test]
    fn test_write_is_segmented_by_mtu() {
        let (gatt, ble) = connected(MockGatt::new(ADDR, vec![dfu_service(false)]));
        let data: Vec<u8> = (0..50).collect();
        let mut reports = Vec::new();
        ble.write_chr_with_progress(
            &DFU_WRITE_CHR_UUID,
            &data,
            WriteType::WithResponse,
            Duration::from_secs(1),
            |done, total| reports.push((done, total)),
        )
        .unwrap();

        let writes = gatt.writes();
        let sizes: Vec<usize> = writes.iter().map(|(_, d)| d.len()).collect();
        assert_eq!(sizes, vec![20, 20, 10]);
        let joined: Vec<u8> = writes.into_iter().flat_map(|(_, d)| d).collect();
        assert_eq!(joined, data);
        assert_eq!(reports, vec![(20, 50), (40, 50), (50, 50)]);
    }

    #[test]
    fn test_rejected_write_fails() {
        struct Reject;
        impl MockPeripheral for Reject {
            fn on_write(&mut self, _chr: Uuid, _data: &[u8]) -> Vec<MockReaction> {
                vec![MockReaction::Reject(GATT_FAILURE)]
            }
        }
        let gatt = MockGatt::new(ADDR, vec![dfu_service(false)]).with_peripheral(Reject);
        let (_gatt, ble) = connected(gatt);
        let err = ble
            .write_chr(
                &DFU_WRITE_CHR_UUID,
                &[1, 2, 3],
                WriteType::WithResponse,
                Duration::from_secs(1),
            )
            .unwrap_err();
        assert!(matches!(err, TransportError::WriteFailed { .. }));
    }

    #[test]
    fn test_notifications_exact_and_chunked() {
        let gatt = MockGatt::new(ADDR, vec![dfu_service(false)]).with_peripheral(Echo);
        let (_gatt, ble) = connected(gatt);
        ble.enable_notification(&DFU_NOTIFY_CHR_UUID, true).unwrap();

        let data: Vec<u8> = (0..30).collect();
        ble.write_chr(
            &DFU_WRITE_CHR_UUID,
            &data,
            WriteType::WithResponse,
            Duration::from_secs(1),
        )
        .unwrap();

        let head = ble
            .read_ntf(&DFU_NOTIFY_CHR_UUID, 6, Duration::from_secs(1))
            .unwrap();
        assert_eq!(head, (0..6).collect::<Vec<u8>>());
        let rest = ble
            .read_ntf(&DFU_NOTIFY_CHR_UUID, 24, Duration::from_secs(1))
            .unwrap();
        assert_eq!(rest, (6..30).collect::<Vec<u8>>());
    }

    #[test]
    fn test_read_ntf_timeout_and_auto_enable() {
        let (_gatt, ble) = connected(MockGatt::new(ADDR, vec![dfu_service(false)]));
        let err = ble
            .read_ntf_chunk(&DFU_NOTIFY_CHR_UUID, Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));
    }

    #[test]
    fn test_enable_notification_rejects_plain_characteristic() {
        let (_gatt, ble) = connected(MockGatt::new(ADDR, vec![dfu_service(false)]));
        assert!(matches!(
            ble.enable_notification(&DFU_WRITE_CHR_UUID, true),
            Err(TransportError::NotificationUnsupported(_))
        ));
        assert!(matches!(
            ble.enable_notification(&FAST_DFU_CMD_CHR_UUID, true),
            Err(TransportError::CharacteristicNotFound(_))
        ));
    }

    #[test]
    fn test_link_loss_unblocks_notification_reader() {
        let (gatt, ble) = connected(MockGatt::new(ADDR, vec![dfu_service(false)]));
        ble.enable_notification(&DFU_NOTIFY_CHR_UUID, true).unwrap();
        gatt.drop_link_after(Duration::from_millis(100));

        let start = Instant::now();
        let err = ble
            .read_ntf(&DFU_NOTIFY_CHR_UUID, 6, Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionLost { .. }));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_link_loss_during_write() {
        let gatt = MockGatt::new(ADDR, vec![dfu_service(false)]).with_peripheral(Vanish);
        let (_gatt, ble) = connected(gatt);
        let err = ble
            .write_chr(
                &DFU_WRITE_CHR_UUID,
                &[1, 2, 3],
                WriteType::WithResponse,
                Duration::from_secs(5),
            )
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionLost { .. }));
    }

    #[test]
    fn test_cancel_releases_link() {
        let gatt = Arc::new(MockGatt::new(ADDR, vec![dfu_service(false)]));
        let cancel = CancelToken::new();
        let ble = BlockingBle::new(gatt.clone(), config(), cancel.clone());
        ble.connect().unwrap();
        ble.discover_services().unwrap();
        ble.enable_notification(&DFU_NOTIFY_CHR_UUID, true).unwrap();

        let canceller = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            canceller.cancel();
        });
        let err = ble
            .read_ntf(&DFU_NOTIFY_CHR_UUID, 6, Duration::from_secs(5))
            .unwrap_err();
        assert_eq!(err, TransportError::Cancelled);
        assert!(!gatt.is_opened());
        assert!(!ble.is_connected());
    }

    #[test]
    fn test_platform_open_and_scan() {
        let platform = MockPlatform::new();
        platform.add(Arc::new(MockGatt::new(ADDR, vec![fast_dfu_service()])));
        assert!(platform.open(&ADDR).is_ok());
        let other = ADDR.with_last_octet_offset(1);
        assert!(matches!(
            platform.open(&other),
            Err(TransportError::DeviceNotFound(_))
        ));
        let report = platform
            .scan_for_device(&ADDR, Duration::from_millis(10))
            .unwrap()
            .unwrap();
        assert_eq!(report.address, ADDR);
        assert!(
            platform
                .scan_for_device(&other, Duration::from_millis(10))
                .unwrap()
                .is_none()
        );
    }
}
