//! DFU Session - High-level orchestrator for one update run.
//!
//! A session connects to the target, binds the right engine, runs the update
//! and reports the lifecycle to a [`DfuListener`]. Runs happen either on the
//! caller's thread ([`DfuSession::run_blocking`]) or on a worker thread
//! ([`DfuSession::start`]) controlled through a [`DfuTask`].

use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::engine::{EngineTiming, FastDfu, FastTarget, LegacyDfu};
use crate::error::{DfuError, Result};
use crate::events::{DfuListener, TracingListener};
use crate::image::{DfuFile, FileError};
use crate::protocol::constants::CTRL_JUMP_PATTERN;
use crate::transport::{BdAddr, BleConfig, BlePlatform, BlockingBle, TransportError};

/// Configuration for a DFU session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Target device address, e.g. "C0:11:22:33:44:55".
    pub address: Option<String>,
    /// Use the fast programming path of AppBootloader devices.
    pub fast_mode: bool,
    /// Raw bytes written to the control point before a v1 update.
    pub ctrl_cmd: Option<Vec<u8>>,
    /// MTU requested after connecting.
    pub mtu: u16,
    pub gatt_timeout_ms: u64,
    /// Longest single wait on the event queue.
    pub poll_slice_ms: u64,
    pub legacy_cmd_timeout_ms: u64,
    pub fast_cmd_timeout_ms: u64,
    pub scan_timeout_ms: u64,
    pub connect_retry_delay_ms: u64,
    /// Pause between the last write and reporting completion.
    pub settle_delay_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            address: None,
            fast_mode: false,
            ctrl_cmd: None,
            mtu: 247,
            gatt_timeout_ms: 31_000,
            poll_slice_ms: 2_000,
            legacy_cmd_timeout_ms: 10_000,
            fast_cmd_timeout_ms: 3_000,
            scan_timeout_ms: 31_000,
            connect_retry_delay_ms: 200,
            settle_delay_ms: 200,
        }
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SessionConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn ble_config(&self) -> BleConfig {
        BleConfig {
            gatt_timeout: Duration::from_millis(self.gatt_timeout_ms),
            poll_slice: Duration::from_millis(self.poll_slice_ms.max(1)),
            connect_retry_delay: Duration::from_millis(self.connect_retry_delay_ms),
            ..BleConfig::default()
        }
    }

    pub fn engine_timing(&self) -> EngineTiming {
        EngineTiming {
            legacy_cmd_timeout: Duration::from_millis(self.legacy_cmd_timeout_ms),
            fast_cmd_timeout: Duration::from_millis(self.fast_cmd_timeout_ms),
            scan_timeout: Duration::from_millis(self.scan_timeout_ms),
            mtu: self.mtu,
            ..EngineTiming::default()
        }
    }

    fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// What a session run writes to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateRequest {
    /// Firmware written at the image's own load address.
    Firmware,
    /// Firmware written to a copy slot. AppBootloader devices pick their
    /// recommended slot when `copy_addr` is `None`.
    FirmwareCopy { copy_addr: Option<u32> },
    Resource { ext_flash: bool, addr: u32 },
    /// Firmware written through a separate DFU boot firmware advertising at
    /// `boot_addr`, entered by writing the jump pattern to the application.
    FirmwareViaDfuBoot { boot_addr: BdAddr },
    FastFirmware,
    FastFirmwareCopy { copy_addr: u32 },
    FastResource { ext_flash: bool, addr: u32 },
}

impl UpdateRequest {
    pub fn is_resource(&self) -> bool {
        matches!(
            self,
            UpdateRequest::Resource { .. } | UpdateRequest::FastResource { .. }
        )
    }

    fn load_file(&self, data: Vec<u8>) -> Result<DfuFile> {
        if self.is_resource() {
            if data.is_empty() {
                return Err(DfuError::InvalidArgument("Empty resource file.".into()));
            }
            Ok(DfuFile::resource(data)?)
        } else {
            Ok(DfuFile::firmware(data)?)
        }
    }
}

/// Handle of a run executing on a worker thread.
pub struct DfuTask {
    handle: JoinHandle<Result<()>>,
    cancel: CancelToken,
}

impl DfuTask {
    /// Asks the worker to stop; the run ends with a cancellation error.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the worker and returns the outcome of the run.
    pub fn join(self) -> Result<()> {
        self.handle
            .join()
            .unwrap_or_else(|_| Err(DfuError::protocol("DFU worker panicked")))
    }
}

/// DFU Session - orchestrates a complete update of one device.
pub struct DfuSession<L: DfuListener> {
    config: SessionConfig,
    platform: Arc<dyn BlePlatform>,
    listener: Arc<L>,
}

impl<L: DfuListener> Clone for DfuSession<L> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            platform: self.platform.clone(),
            listener: self.listener.clone(),
        }
    }
}

impl DfuSession<TracingListener> {
    /// Create a new session with the default tracing listener.
    pub fn new(config: SessionConfig, platform: Arc<dyn BlePlatform>) -> Self {
        Self::with_listener(config, platform, Arc::new(TracingListener))
    }
}

impl<L: DfuListener + 'static> DfuSession<L> {
    /// Create a new session with a custom listener.
    pub fn with_listener(
        config: SessionConfig,
        platform: Arc<dyn BlePlatform>,
        listener: Arc<L>,
    ) -> Self {
        Self {
            config,
            platform,
            listener,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn listener(&self) -> &Arc<L> {
        &self.listener
    }

    /// Runs `request` against `target` on a new worker thread.
    pub fn start(&self, target: BdAddr, request: UpdateRequest, data: Vec<u8>) -> DfuTask {
        let cancel = CancelToken::new();
        let session = self.clone();
        let token = cancel.clone();
        let handle = thread::spawn(move || session.run_blocking(target, request, data, &token));
        DfuTask { handle, cancel }
    }

    pub fn start_firmware(&self, target: BdAddr, data: Vec<u8>) -> DfuTask {
        self.start(target, UpdateRequest::Firmware, data)
    }

    pub fn start_firmware_copy(
        &self,
        target: BdAddr,
        data: Vec<u8>,
        copy_addr: Option<u32>,
    ) -> DfuTask {
        self.start(target, UpdateRequest::FirmwareCopy { copy_addr }, data)
    }

    pub fn start_resource(
        &self,
        target: BdAddr,
        data: Vec<u8>,
        ext_flash: bool,
        addr: u32,
    ) -> DfuTask {
        self.start(target, UpdateRequest::Resource { ext_flash, addr }, data)
    }

    /// `target` runs the application, `boot_addr` is where the DFU boot
    /// firmware advertises once jumped to.
    pub fn start_firmware_via_dfu_boot(
        &self,
        target: BdAddr,
        boot_addr: BdAddr,
        data: Vec<u8>,
    ) -> DfuTask {
        self.start(target, UpdateRequest::FirmwareViaDfuBoot { boot_addr }, data)
    }

    pub fn start_fast_firmware(&self, target: BdAddr, data: Vec<u8>) -> DfuTask {
        self.start(target, UpdateRequest::FastFirmware, data)
    }

    pub fn start_fast_firmware_copy(&self, target: BdAddr, data: Vec<u8>, copy_addr: u32) -> DfuTask {
        self.start(target, UpdateRequest::FastFirmwareCopy { copy_addr }, data)
    }

    pub fn start_fast_resource(
        &self,
        target: BdAddr,
        data: Vec<u8>,
        ext_flash: bool,
        addr: u32,
    ) -> DfuTask {
        self.start(target, UpdateRequest::FastResource { ext_flash, addr }, data)
    }

    /// Runs `request` against `target` on the caller's thread.
    ///
    /// The listener sees `on_dfu_start` first and exactly one of
    /// `on_dfu_complete` or `on_dfu_error` last. The link the engine ended up
    /// bound to is disconnected in every case.
    #[instrument(skip(self, data, cancel), fields(target = %target))]
    pub fn run_blocking(
        &self,
        target: BdAddr,
        request: UpdateRequest,
        data: Vec<u8>,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.listener.on_dfu_start();
        info!(request = ?request, size = data.len(), "Starting DFU");

        let mut bound = None;
        let result = self.execute(target, request, data, cancel, &mut bound);
        match &result {
            Ok(()) => {
                info!("DFU finished");
                self.listener.on_dfu_complete();
            }
            Err(e) => {
                error!(error = %e, "DFU aborted");
                self.listener.on_dfu_error(&e.to_string(), e);
            }
        }

        if let Some(ble) = bound {
            if let Err(e) = ble.disconnect() {
                warn!(addr = %ble.address(), error = %e, "Failed to disconnect after DFU");
            }
        }
        result
    }

    fn execute(
        &self,
        target: BdAddr,
        request: UpdateRequest,
        data: Vec<u8>,
        cancel: &CancelToken,
        bound: &mut Option<Arc<BlockingBle>>,
    ) -> Result<()> {
        let file = request.load_file(data)?;
        let timing = self.config.engine_timing();
        let fast = self.config.fast_mode;
        let ctrl_cmd = self.config.ctrl_cmd.as_deref();
        let listener = self.listener.as_ref();

        match request {
            UpdateRequest::FirmwareViaDfuBoot { boot_addr } => {
                self.update_via_dfu_boot(target, boot_addr, &file, cancel, bound)?;
            }
            UpdateRequest::Firmware
            | UpdateRequest::FirmwareCopy { .. }
            | UpdateRequest::Resource { .. } => {
                let ble = self.open_link(target, cancel)?;
                *bound = Some(ble.clone());
                let mut dfu = LegacyDfu::bind(ble, timing)?.with_platform(self.platform.clone());
                let result = match request {
                    UpdateRequest::Resource { ext_flash, addr } => {
                        dfu.update_resource(ext_flash, fast, &file, addr, ctrl_cmd, listener)
                    }
                    UpdateRequest::FirmwareCopy { copy_addr } => {
                        dfu.update_firmware(fast, &file, copy_addr, ctrl_cmd, listener)
                    }
                    _ => {
                        let load_addr = file
                            .img_info()
                            .ok_or(FileError::TrailerNotFound)?
                            .boot_info
                            .load_addr;
                        dfu.update_firmware(fast, &file, Some(load_addr), ctrl_cmd, listener)
                    }
                };
                // A bootloader jump moves the engine onto a new link.
                *bound = Some(dfu.ble().clone());
                result?;
            }
            UpdateRequest::FastFirmware
            | UpdateRequest::FastFirmwareCopy { .. }
            | UpdateRequest::FastResource { .. } => {
                let target_kind = match request {
                    UpdateRequest::FastFirmwareCopy { copy_addr } => {
                        FastTarget::FirmwareCopy { copy_addr }
                    }
                    UpdateRequest::FastResource { ext_flash, addr } => {
                        FastTarget::Resource { ext_flash, addr }
                    }
                    _ => FastTarget::Firmware,
                };
                let ble = self.open_link(target, cancel)?;
                *bound = Some(ble.clone());
                FastDfu::bind(ble, timing)?.update(target_kind, &file, listener)?;
            }
        }

        cancel.sleep(self.config.settle_delay())?;
        Ok(())
    }

    fn update_via_dfu_boot(
        &self,
        target: BdAddr,
        boot_addr: BdAddr,
        file: &DfuFile,
        cancel: &CancelToken,
        bound: &mut Option<Arc<BlockingBle>>,
    ) -> Result<()> {
        let timing = self.config.engine_timing();
        let listener = self.listener.as_ref();
        let load_addr = file
            .img_info()
            .ok_or(FileError::TrailerNotFound)?
            .boot_info
            .load_addr;

        listener.on_dfu_progress(0, 0, "Connect to APP firmware.");
        let app = self.open_link(target, cancel)?;
        *bound = Some(app.clone());
        let dfu = LegacyDfu::bind(app.clone(), timing.clone())?;

        listener.on_dfu_progress(0, 0, "Jump to boot firmware.");
        dfu.profile().write_ctrl_point(&CTRL_JUMP_PATTERN)?;
        cancel.sleep(timing.before_jump_disconnect)?;
        app.disconnect()?;
        drop(dfu);

        let status = format!("Scan for boot firmware: {}", boot_addr);
        listener.on_dfu_progress(0, 0, &status);
        let report = self
            .platform
            .scan_for_device(&boot_addr, timing.scan_timeout)?;
        if report.is_none() {
            return Err(TransportError::DeviceNotFound(boot_addr).into());
        }

        listener.on_dfu_progress(0, 0, "Connect boot firmware.");
        let boot = self.open_link(boot_addr, cancel)?;
        *bound = Some(boot.clone());
        let mut dfu = LegacyDfu::bind(boot, timing)?.with_platform(self.platform.clone());
        let result = dfu.update_firmware(
            self.config.fast_mode,
            file,
            Some(load_addr),
            self.config.ctrl_cmd.as_deref(),
            listener,
        );
        *bound = Some(dfu.ble().clone());
        result
    }

    /// Opens, connects and prepares a link for DFU traffic.
    fn open_link(&self, addr: BdAddr, cancel: &CancelToken) -> Result<Arc<BlockingBle>> {
        let backend = self.platform.open(&addr)?;
        let ble = Arc::new(BlockingBle::new(
            backend,
            self.config.ble_config(),
            cancel.clone(),
        ));
        ble.connect()?;
        ble.discover_services()?;
        let mtu = ble.set_mtu(self.config.mtu)?;
        info!(addr = %addr, mtu, "Link ready");
        Ok(ble)
    }
}
