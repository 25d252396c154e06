//! Blocking facade over an asynchronous GATT client.
//!
//! [`BlockingBle`] turns each request/completion pair of a [`GattBackend`] into
//! one blocking call with a deadline. The backend reports completions through
//! a [`GattEventSink`], which only updates link state, feeds notification
//! buffers and pushes [`GattEvent`]s into a bounded queue. Blocked callers
//! poll that queue in short slices so that expiry, cancellation and link loss
//! are all noticed within one slice.
//!
//! Operations on one session are serialized by a single lock held for the
//! whole request and its wait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use super::addr::BdAddr;
use super::event::{EVENT_QUEUE_CAPACITY, EventQueue, GattEvent};
use super::lock;
use super::notify::NotificationBuffer;
use super::traits::{
    CharProps, CharacteristicInfo, ConnectionState, GATT_SUCCESS, GattBackend, ServiceInfo,
    TransportError, WriteType,
};
use crate::cancel::CancelToken;
use crate::protocol::constants::{
    ATT_WRITE_OVERHEAD, CCCD_DISABLE, CCCD_INDICATE, CCCD_NOTIFY, CCCD_UUID, DEFAULT_MTU,
    DFU_MAX_MTU,
};

/// Timing and sizing of one blocking session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BleConfig {
    /// Default deadline of every GATT operation.
    pub gatt_timeout: Duration,
    /// Longest single wait on the event queue.
    pub poll_slice: Duration,
    /// Upper bound applied to negotiated MTUs.
    pub max_mtu: u16,
    /// Pause before retrying a failed connection attempt.
    pub connect_retry_delay: Duration,
    pub event_queue_capacity: usize,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            gatt_timeout: Duration::from_millis(31_000),
            poll_slice: Duration::from_millis(2_000),
            max_mtu: DFU_MAX_MTU,
            connect_retry_delay: Duration::from_millis(200),
            event_queue_capacity: EVENT_QUEUE_CAPACITY,
        }
    }
}

/// Snapshot of the link parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    pub state: ConnectionState,
    pub mtu: u16,
    pub tx_phy: u8,
    pub rx_phy: u8,
    pub rssi: Option<i16>,
}

impl Default for LinkInfo {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            mtu: DEFAULT_MTU,
            tx_phy: 1,
            rx_phy: 1,
            rssi: None,
        }
    }
}

struct WriteTask {
    chr: Uuid,
    data: Vec<u8>,
    /// Bytes handed to the backend so far.
    pos: usize,
    write_type: WriteType,
}

/// State shared between the blocking side and the callback side.
struct Shared {
    address: BdAddr,
    backend: Arc<dyn GattBackend>,
    max_mtu: u16,
    events: EventQueue,
    link: Mutex<LinkInfo>,
    connected: AtomicBool,
    notifications: Mutex<HashMap<Uuid, Arc<NotificationBuffer>>>,
    write_task: Mutex<Option<WriteTask>>,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnectionState) {
        self.connected
            .store(state == ConnectionState::Connected, Ordering::SeqCst);
        lock(&self.link).state = state;
    }

    fn record_error(&self, message: String) {
        *lock(&self.last_error) = Some(message);
    }

    fn clear_notifications(&self) {
        let buffers: Vec<_> = lock(&self.notifications).drain().collect();
        for (chr, buffer) in buffers {
            trace!(chr = %chr, "Notification buffer cleared");
            buffer.clear();
        }
    }

    /// Takes the next segment of the running write and advances the task.
    fn next_segment(&self, chr: &Uuid) -> Option<(Vec<u8>, WriteType)> {
        let segment_size = usize::from(lock(&self.link).mtu.saturating_sub(ATT_WRITE_OVERHEAD)).max(1);
        let mut task = lock(&self.write_task);
        let task = task.as_mut().filter(|t| t.chr == *chr)?;
        if task.pos >= task.data.len() {
            return None;
        }
        let end = (task.pos + segment_size).min(task.data.len());
        let segment = task.data[task.pos..end].to_vec();
        task.pos = end;
        Some((segment, task.write_type))
    }
}

/// Completion handle given to a [`GattBackend`].
///
/// Every method returns quickly; none of them blocks on a pending operation.
#[derive(Clone)]
pub struct GattEventSink {
    shared: Weak<Shared>,
}

impl GattEventSink {
    fn with_shared(&self, f: impl FnOnce(&Shared)) {
        if let Some(shared) = self.shared.upgrade() {
            f(&shared);
        }
    }

    pub fn on_connection_state_changed(&self, status: i32, state: ConnectionState) {
        self.with_shared(|s| {
            info!(addr = %s.address, status, state = %state, "Connection state changed");
            let state = if status == GATT_SUCCESS {
                state
            } else {
                s.record_error(format!("Connection state changed with status {}", status));
                ConnectionState::Disconnected
            };
            s.set_state(state);
            s.clear_notifications();
            s.events.push(GattEvent::ConnectionChanged { status, state });
        });
    }

    pub fn on_mtu_changed(&self, status: i32, mtu: u16) {
        self.with_shared(|s| {
            let mtu = mtu.min(s.max_mtu);
            debug!(addr = %s.address, status, mtu, "MTU changed");
            if status == GATT_SUCCESS {
                lock(&s.link).mtu = mtu;
            }
            s.events.push(GattEvent::MtuChanged { status, mtu });
        });
    }

    pub fn on_services_discovered(&self, status: i32) {
        self.with_shared(|s| {
            s.events.push(GattEvent::ServicesDiscovered { status });
        });
    }

    pub fn on_characteristic_read(&self, chr: Uuid, status: i32, value: Vec<u8>) {
        self.with_shared(|s| {
            s.events
                .push(GattEvent::CharacteristicRead { status, chr, value });
        });
    }

    /// Confirms one segment and immediately issues the next one, if any.
    pub fn on_characteristic_written(&self, chr: Uuid, status: i32) {
        self.with_shared(|s| {
            let (written, total) = match lock(&s.write_task).as_ref() {
                Some(task) if task.chr == chr => (task.pos, task.data.len()),
                _ => (0, 0),
            };
            let mut next_accepted = true;
            if status == GATT_SUCCESS {
                if let Some((segment, write_type)) = s.next_segment(&chr) {
                    if let Err(e) = s.backend.write_characteristic(chr, &segment, write_type) {
                        warn!(chr = %chr, error = %e, "Next segment rejected");
                        s.record_error(e.to_string());
                        next_accepted = false;
                    }
                }
            }
            s.events.push(GattEvent::CharacteristicWritten {
                status,
                chr,
                written,
                total,
                next_accepted,
            });
        });
    }

    pub fn on_descriptor_written(&self, chr: Uuid, descriptor: Uuid, status: i32) {
        self.with_shared(|s| {
            s.events.push(GattEvent::DescriptorWritten {
                status,
                chr,
                descriptor,
            });
        });
    }

    /// Unsolicited value notification or indication.
    pub fn on_characteristic_changed(&self, chr: Uuid, value: Vec<u8>) {
        self.with_shared(|s| {
            let buffer = lock(&s.notifications).get(&chr).cloned();
            match buffer {
                Some(buffer) => {
                    trace!(chr = %chr, len = value.len(), "Notification");
                    buffer.push(value);
                }
                None => trace!(chr = %chr, "Notification without subscriber dropped"),
            }
        });
    }

    pub fn on_service_changed(&self) {
        self.with_shared(|s| {
            s.events.push(GattEvent::ServiceChanged);
        });
    }

    pub fn on_rssi_read(&self, status: i32, rssi: i16) {
        self.with_shared(|s| {
            if status == GATT_SUCCESS {
                lock(&s.link).rssi = Some(rssi);
            }
            s.events.push(GattEvent::RssiRead { status, rssi });
        });
    }

    pub fn on_phy_updated(&self, status: i32, tx_phy: u8, rx_phy: u8) {
        self.with_shared(|s| {
            if status == GATT_SUCCESS {
                let mut link = lock(&s.link);
                link.tx_phy = tx_phy;
                link.rx_phy = rx_phy;
            }
            s.events.push(GattEvent::PhyUpdated {
                status,
                tx_phy,
                rx_phy,
            });
        });
    }
}

/// Clears the pipelined write task on every exit path.
struct WriteTaskGuard<'a>(&'a Shared);

impl Drop for WriteTaskGuard<'_> {
    fn drop(&mut self) {
        *lock(&self.0.write_task) = None;
    }
}

/// One physical link driven through blocking calls.
pub struct BlockingBle {
    shared: Arc<Shared>,
    config: BleConfig,
    cancel: CancelToken,
    op_lock: Mutex<()>,
    /// A native handle exists and must be closed.
    opened: AtomicBool,
}

impl BlockingBle {
    pub fn new(backend: Arc<dyn GattBackend>, config: BleConfig, cancel: CancelToken) -> Self {
        let shared = Arc::new(Shared {
            address: backend.address(),
            backend: Arc::clone(&backend),
            max_mtu: config.max_mtu,
            events: EventQueue::new(config.event_queue_capacity),
            link: Mutex::new(LinkInfo::default()),
            connected: AtomicBool::new(false),
            notifications: Mutex::new(HashMap::new()),
            write_task: Mutex::new(None),
            last_error: Mutex::new(None),
        });
        backend.attach(GattEventSink {
            shared: Arc::downgrade(&shared),
        });
        Self {
            shared,
            config,
            cancel,
            op_lock: Mutex::new(()),
            opened: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> BdAddr {
        self.shared.address
    }

    pub fn config(&self) -> &BleConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.shared.link).state
    }

    pub fn mtu(&self) -> u16 {
        lock(&self.shared.link).mtu
    }

    pub fn link_info(&self) -> LinkInfo {
        *lock(&self.shared.link)
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.shared.last_error).clone()
    }

    /// Services found by the last discovery.
    pub fn services(&self) -> Vec<ServiceInfo> {
        self.shared.backend.services()
    }

    pub fn find_characteristic(&self, service: &Uuid, chr: &Uuid) -> Option<CharacteristicInfo> {
        self.services()
            .iter()
            .find(|s| s.uuid == *service)
            .and_then(|s| s.characteristic(chr).cloned())
    }

    fn characteristic(&self, chr: &Uuid) -> Option<CharacteristicInfo> {
        self.services()
            .iter()
            .find_map(|s| s.characteristic(chr).cloned())
    }

    fn require_connected(&self, op: &'static str, target: &str) -> Result<(), TransportError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(TransportError::NotConnected {
                op,
                target: target.to_string(),
            })
        }
    }

    /// Closes the native handle and forgets all link state.
    fn release(&self) {
        self.shared.backend.close();
        self.opened.store(false, Ordering::SeqCst);
        self.shared.set_state(ConnectionState::Disconnected);
        self.shared.clear_notifications();
    }

    /// Tears the link down after a cancellation request.
    fn abort_link(&self, op: &'static str) -> TransportError {
        warn!(addr = %self.address(), op, "Cancelled, releasing link");
        if self.opened.load(Ordering::SeqCst) {
            self.shared.backend.disconnect();
            thread::sleep(self.config.connect_retry_delay);
            self.release();
        }
        TransportError::Cancelled
    }

    /// Waits for the first event accepted by `matches`.
    ///
    /// Other events are discarded. Fails with `ConnectionLost` as soon as the
    /// link is seen down while waiting.
    fn wait_event(
        &self,
        op: &'static str,
        target: &str,
        timeout: Duration,
        mut matches: impl FnMut(&GattEvent) -> bool,
    ) -> Result<GattEvent, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.cancel.is_cancelled() {
                return Err(self.abort_link(op));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout {
                    op,
                    target: target.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            if let Some(event) = self.shared.events.poll(remaining.min(self.config.poll_slice)) {
                if matches(&event) {
                    return Ok(event);
                }
                trace!(?event, op, "Unrelated event skipped");
            }
            if !self.is_connected() {
                return Err(TransportError::ConnectionLost {
                    op,
                    target: target.to_string(),
                });
            }
        }
    }

    pub fn connect(&self) -> Result<(), TransportError> {
        self.connect_with_timeout(self.config.gatt_timeout)
    }

    /// Connects, retrying failed attempts until `timeout` elapses.
    #[instrument(level = "debug", skip(self), fields(addr = %self.address()))]
    pub fn connect_with_timeout(&self, timeout: Duration) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }
        let _guard = lock(&self.op_lock);
        if self.is_connected() {
            return Ok(());
        }
        let target = self.address().to_string();
        info!(addr = %target, timeout_ms = timeout.as_millis() as u64, "Connecting");

        self.shared.events.clear();
        self.shared.set_state(ConnectionState::Connecting);
        self.opened.store(true, Ordering::SeqCst);
        if let Err(e) = self.shared.backend.connect() {
            self.release();
            return Err(TransportError::ConnectionFailed {
                target,
                reason: e.to_string(),
            });
        }

        let deadline = Instant::now() + timeout;
        loop {
            if self.cancel.is_cancelled() {
                return Err(self.abort_link("connect"));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(addr = %target, "Connect timed out");
                self.release();
                return Err(TransportError::Timeout {
                    op: "connect",
                    target,
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            let Some(event) = self.shared.events.poll(remaining.min(self.config.poll_slice)) else {
                continue;
            };
            let GattEvent::ConnectionChanged { status, state } = event else {
                trace!(?event, "Unrelated event skipped while connecting");
                continue;
            };
            if status != GATT_SUCCESS {
                warn!(addr = %target, status, "Connection attempt failed, retrying");
                if self.cancel.sleep(self.config.connect_retry_delay).is_err() {
                    return Err(self.abort_link("connect"));
                }
                self.shared.set_state(ConnectionState::Connecting);
                if let Err(e) = self.shared.backend.connect() {
                    self.release();
                    return Err(TransportError::ConnectionFailed {
                        target,
                        reason: e.to_string(),
                    });
                }
                continue;
            }
            if state == ConnectionState::Connected {
                lock(&self.shared.link).mtu = DEFAULT_MTU;
                info!(addr = %target, "Connected");
                return Ok(());
            }
            self.release();
            return Err(TransportError::ConnectionFailed {
                target,
                reason: format!("Failed to establish connection, state: {}", state),
            });
        }
    }

    /// Disconnects and always releases the native handle.
    #[instrument(level = "debug", skip(self), fields(addr = %self.address()))]
    pub fn disconnect(&self) -> Result<(), TransportError> {
        if !self.opened.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = lock(&self.op_lock);
        if !self.opened.load(Ordering::SeqCst) {
            return Ok(());
        }
        let state = self.connection_state();
        self.shared.events.clear();
        let result = match state {
            ConnectionState::Disconnected | ConnectionState::Disconnecting => {
                self.shared.backend.disconnect();
                Ok(())
            }
            _ => {
                info!(addr = %self.address(), "Disconnecting");
                lock(&self.shared.link).state = ConnectionState::Disconnecting;
                self.shared.backend.disconnect();
                self.wait_disconnected()
            }
        };
        self.release();
        result
    }

    fn wait_disconnected(&self) -> Result<(), TransportError> {
        let timeout = self.config.gatt_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            if self.connection_state() == ConnectionState::Disconnected {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout {
                    op: "disconnect",
                    target: self.address().to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            if let Some(GattEvent::ConnectionChanged {
                state: ConnectionState::Disconnected,
                ..
            }) = self.shared.events.poll(remaining)
            {
                return Ok(());
            }
        }
    }

    #[instrument(level = "debug", skip(self), fields(addr = %self.address()))]
    pub fn discover_services(&self) -> Result<Vec<ServiceInfo>, TransportError> {
        let _guard = lock(&self.op_lock);
        let target = self.address().to_string();
        self.require_connected("discover services of", &target)?;
        self.shared.events.clear();
        self.shared
            .backend
            .discover_services()
            .map_err(|e| TransportError::RequestFailed {
                op: "discover services of",
                target: target.clone(),
                reason: e.to_string(),
            })?;
        let event = self.wait_event(
            "discover services of",
            &target,
            self.config.gatt_timeout,
            |e| matches!(e, GattEvent::ServicesDiscovered { .. }),
        )?;
        if let GattEvent::ServicesDiscovered { status } = event
            && status != GATT_SUCCESS
        {
            return Err(TransportError::RequestFailed {
                op: "discover services of",
                target,
                reason: format!("status={}", status),
            });
        }

        let services = self.shared.backend.services();
        for service in &services {
            debug!(service = %service.uuid, "Service");
            for chr in &service.characteristics {
                debug!(chr = %chr.uuid, props = %chr.properties, "  Characteristic");
            }
        }
        Ok(services)
    }

    /// Requests `mtu` and returns the negotiated value.
    #[instrument(level = "debug", skip(self), fields(addr = %self.address()))]
    pub fn set_mtu(&self, mtu: u16) -> Result<u16, TransportError> {
        let _guard = lock(&self.op_lock);
        let target = self.address().to_string();
        self.require_connected("set MTU of", &target)?;
        self.shared.events.clear();
        self.shared
            .backend
            .request_mtu(mtu)
            .map_err(|e| TransportError::RequestFailed {
                op: "set MTU of",
                target: target.clone(),
                reason: e.to_string(),
            })?;
        let event = self.wait_event("set MTU of", &target, self.config.gatt_timeout, |e| {
            matches!(e, GattEvent::MtuChanged { .. })
        })?;
        if let GattEvent::MtuChanged { status, mtu } = event
            && status != GATT_SUCCESS
        {
            warn!(status, mtu, "MTU request failed");
        }
        let mtu = self.mtu();
        info!(mtu, "MTU negotiated");
        Ok(mtu)
    }

    /// Subscribes to (or unsubscribes from) a characteristic.
    ///
    /// Indications are preferred when the characteristic supports both.
    #[instrument(level = "debug", skip(self), fields(addr = %self.address()))]
    pub fn enable_notification(&self, chr: &Uuid, enable: bool) -> Result<(), TransportError> {
        let _guard = lock(&self.op_lock);
        let target = chr.to_string();
        self.require_connected("enable notification of", &target)?;
        let info = self
            .characteristic(chr)
            .ok_or(TransportError::CharacteristicNotFound(*chr))?;
        if !info
            .properties
            .intersects(CharProps::NOTIFY | CharProps::INDICATE)
        {
            return Err(TransportError::NotificationUnsupported(*chr));
        }
        self.shared
            .backend
            .set_characteristic_notification(*chr, enable)
            .map_err(|e| TransportError::RequestFailed {
                op: "enable notification of",
                target: target.clone(),
                reason: e.to_string(),
            })?;
        if !info.has_cccd {
            return Err(TransportError::RequestFailed {
                op: "enable notification of",
                target,
                reason: "CCCD not found".to_string(),
            });
        }

        let value = if !enable {
            CCCD_DISABLE
        } else if info.properties.contains(CharProps::INDICATE) {
            CCCD_INDICATE
        } else {
            CCCD_NOTIFY
        };
        self.shared.events.clear();
        self.shared
            .backend
            .write_descriptor(*chr, CCCD_UUID, &value)
            .map_err(|e| TransportError::WriteFailed {
                target: format!("CCCD of {}", chr),
                reason: e.to_string(),
            })?;
        let event = self.wait_event(
            "enable notification of",
            &target,
            self.config.gatt_timeout,
            |e| {
                matches!(e, GattEvent::DescriptorWritten { chr: c, descriptor, .. }
                    if c == chr && *descriptor == CCCD_UUID)
            },
        )?;
        if let GattEvent::DescriptorWritten { status, .. } = event
            && status != GATT_SUCCESS
        {
            return Err(TransportError::WriteFailed {
                target: format!("CCCD of {}", chr),
                reason: format!("status={}", status),
            });
        }

        let mut buffers = lock(&self.shared.notifications);
        if enable {
            buffers
                .entry(*chr)
                .or_insert_with(|| Arc::new(NotificationBuffer::new(*chr)));
        } else if let Some(buffer) = buffers.remove(chr) {
            buffer.clear();
        }
        debug!(chr = %chr, enable, cccd = ?value, "Notification configured");
        Ok(())
    }

    pub fn write_chr(
        &self,
        chr: &Uuid,
        data: &[u8],
        write_type: WriteType,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        self.write_chr_with_progress(chr, data, write_type, timeout, |_, _| {})
    }

    /// Writes `data` in MTU-sized segments, one confirmed segment at a time.
    ///
    /// `progress` receives `(written, total)` after every confirmed segment.
    /// `timeout` bounds the wait for each confirmation.
    pub fn write_chr_with_progress(
        &self,
        chr: &Uuid,
        data: &[u8],
        write_type: WriteType,
        timeout: Duration,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<(), TransportError> {
        if data.is_empty() {
            return Ok(());
        }
        let _guard = lock(&self.op_lock);
        let target = chr.to_string();
        self.require_connected("write", &target)?;

        self.shared.events.clear();
        *lock(&self.shared.write_task) = Some(WriteTask {
            chr: *chr,
            data: data.to_vec(),
            pos: 0,
            write_type,
        });
        let _task = WriteTaskGuard(&self.shared);

        let Some((segment, write_type)) = self.shared.next_segment(chr) else {
            return Ok(());
        };
        trace!(chr = %chr, total = data.len(), mtu = self.mtu(), "Write started");
        self.shared
            .backend
            .write_characteristic(*chr, &segment, write_type)
            .map_err(|e| TransportError::WriteFailed {
                target: target.clone(),
                reason: e.to_string(),
            })?;

        loop {
            let event = self
                .wait_event("write", &target, timeout, |e| {
                    matches!(e, GattEvent::CharacteristicWritten { chr: c, .. } if c == chr)
                })
                .map_err(|e| match e {
                    TransportError::Timeout { timeout_ms, .. } => TransportError::WriteFailed {
                        target: target.clone(),
                        reason: format!("no confirmation within {}ms", timeout_ms),
                    },
                    other => other,
                })?;
            let GattEvent::CharacteristicWritten {
                status,
                written,
                total,
                next_accepted,
                ..
            } = event
            else {
                continue;
            };
            if status != GATT_SUCCESS {
                return Err(TransportError::WriteFailed {
                    target,
                    reason: format!("status={}", status),
                });
            }
            if !next_accepted {
                return Err(TransportError::WriteFailed {
                    target,
                    reason: format!("segment after {} bytes rejected", written),
                });
            }
            progress(written, total);
            if written >= total {
                return Ok(());
            }
        }
    }

    pub fn read_chr(&self, chr: &Uuid, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let _guard = lock(&self.op_lock);
        let target = chr.to_string();
        self.require_connected("read", &target)?;
        self.shared.events.clear();
        self.shared
            .backend
            .read_characteristic(*chr)
            .map_err(|e| TransportError::ReadFailed {
                target: target.clone(),
                reason: e.to_string(),
            })?;
        let event = self.wait_event("read", &target, timeout, |e| {
            matches!(e, GattEvent::CharacteristicRead { chr: c, .. } if c == chr)
        })?;
        match event {
            GattEvent::CharacteristicRead { status, value, .. } if status == GATT_SUCCESS => {
                Ok(value)
            }
            GattEvent::CharacteristicRead { status, .. } => Err(TransportError::ReadFailed {
                target,
                reason: format!("status={}", status),
            }),
            _ => Err(TransportError::ReadFailed {
                target,
                reason: "unexpected event".to_string(),
            }),
        }
    }

    /// Buffer of `chr`, subscribing first if needed.
    fn notification_buffer(&self, chr: &Uuid) -> Result<Arc<NotificationBuffer>, TransportError> {
        if let Some(buffer) = lock(&self.shared.notifications).get(chr).cloned() {
            return Ok(buffer);
        }
        let target = chr.to_string();
        if !self.is_connected() && self.opened.load(Ordering::SeqCst) {
            // The link was up in this session and dropped before the read.
            return Err(TransportError::ConnectionLost {
                op: "read notification of",
                target,
            });
        }
        self.require_connected("read notification of", &target)?;
        self.enable_notification(chr, true)?;
        lock(&self.shared.notifications)
            .get(chr)
            .cloned()
            .ok_or(TransportError::ConnectionLost {
                op: "read notification of",
                target,
            })
    }

    /// Reads exactly `size` notified bytes of `chr`.
    ///
    /// `timeout` bounds the wait for each chunk. Returns fewer bytes when the
    /// stream stalls or the link drops after some data arrived.
    pub fn read_ntf(
        &self,
        chr: &Uuid,
        size: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let buffer = self.notification_buffer(chr)?;
        let _guard = lock(&self.op_lock);
        let mut out = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            let n = self.read_buffer(&buffer, timeout, |b, slice| b.read(&mut out[filled..], slice))?;
            if n == 0 {
                if filled == 0 {
                    return Err(self.stalled_read_error(chr, timeout));
                }
                break;
            }
            filled += n;
        }
        out.truncate(filled);
        Ok(out)
    }

    /// Reads the next notification chunk of `chr`.
    pub fn read_ntf_chunk(&self, chr: &Uuid, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let buffer = self.notification_buffer(chr)?;
        let _guard = lock(&self.op_lock);
        let chunk = self.read_buffer(&buffer, timeout, |b, slice| {
            b.read_chunk(slice).unwrap_or_default()
        })?;
        if chunk.is_empty() {
            return Err(self.stalled_read_error(chr, timeout));
        }
        Ok(chunk)
    }

    fn stalled_read_error(&self, chr: &Uuid, timeout: Duration) -> TransportError {
        if self.is_connected() {
            TransportError::Timeout {
                op: "read notification of",
                target: chr.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }
        } else {
            TransportError::ConnectionLost {
                op: "read notification of",
                target: chr.to_string(),
            }
        }
    }

    /// Polls `buffer` in slices until `read` yields data, the deadline
    /// passes, or the buffer is cleared. Empty results mean "nothing".
    fn read_buffer<T: Default + IsEmpty>(
        &self,
        buffer: &NotificationBuffer,
        timeout: Duration,
        mut read: impl FnMut(&NotificationBuffer, Duration) -> T,
    ) -> Result<T, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.cancel.is_cancelled() {
                return Err(self.abort_link("read notification of"));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(T::default());
            }
            let data = read(buffer, remaining.min(self.config.poll_slice));
            if !data.is_nothing() {
                return Ok(data);
            }
            if buffer.is_cleared() || !self.is_connected() {
                return Ok(T::default());
            }
        }
    }
}

/// Distinguishes "no data" results of the two buffer read modes.
trait IsEmpty {
    fn is_nothing(&self) -> bool;
}

impl IsEmpty for usize {
    fn is_nothing(&self) -> bool {
        *self == 0
    }
}

impl IsEmpty for Vec<u8> {
    fn is_nothing(&self) -> bool {
        self.is_empty()
    }
}

impl Drop for BlockingBle {
    fn drop(&mut self) {
        if self.opened.load(Ordering::SeqCst) {
            debug!(addr = %self.address(), "Closing link on drop");
            self.shared.backend.disconnect();
            self.shared.backend.close();
        }
    }
}
