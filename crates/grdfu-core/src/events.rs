//! Progress reporting for UI decoupling.
//!
//! Front-ends implement [`DfuListener`] or receive [`DfuEvent`]s through a
//! [`ChannelListener`] and handle them on a thread of their choice.

use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Instant;

use crate::error::DfuError;
use crate::transport::lock;

/// Receives the lifecycle of one DFU run, in order.
///
/// `on_dfu_start` is called exactly once, followed by any number of
/// progress reports and then exactly one of `on_dfu_complete` or
/// `on_dfu_error`. Calls come from the worker thread.
pub trait DfuListener: Send + Sync {
    fn on_dfu_start(&self) {}

    /// `percent` is 0..=100, `speed` is in bytes per second.
    fn on_dfu_progress(&self, _percent: u8, _speed: u32, _status: &str) {}

    fn on_dfu_complete(&self) {}

    fn on_dfu_error(&self, _message: &str, _cause: &DfuError) {}
}

/// No-op listener.
pub struct NullListener;

impl DfuListener for NullListener {}

/// Listener that logs using tracing.
pub struct TracingListener;

impl DfuListener for TracingListener {
    fn on_dfu_start(&self) {
        tracing::info!("DFU started");
    }

    fn on_dfu_progress(&self, percent: u8, speed: u32, status: &str) {
        tracing::info!(progress = %format!("{}%", percent), speed, "{}", status);
    }

    fn on_dfu_complete(&self) {
        tracing::info!("DFU complete");
    }

    fn on_dfu_error(&self, message: &str, cause: &DfuError) {
        tracing::error!(cause = ?cause, "DFU failed: {}", message);
    }
}

/// Owned form of the listener callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DfuEvent {
    Started,
    Progress {
        percent: u8,
        speed: u32,
        status: String,
    },
    Completed,
    Failed {
        message: String,
        timeout: bool,
        connection_lost: bool,
        cancelled: bool,
    },
}

impl DfuEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DfuEvent::Completed | DfuEvent::Failed { .. })
    }
}

/// Forwards every callback as a [`DfuEvent`] over a channel.
pub struct ChannelListener {
    tx: Mutex<Sender<DfuEvent>>,
}

impl ChannelListener {
    pub fn new() -> (Self, Receiver<DfuEvent>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx: Mutex::new(tx) }, rx)
    }

    fn send(&self, event: DfuEvent) {
        // The receiver may already be gone; nobody is left to notify.
        let _ = lock(&self.tx).send(event);
    }
}

impl DfuListener for ChannelListener {
    fn on_dfu_start(&self) {
        self.send(DfuEvent::Started);
    }

    fn on_dfu_progress(&self, percent: u8, speed: u32, status: &str) {
        self.send(DfuEvent::Progress {
            percent,
            speed,
            status: status.to_string(),
        });
    }

    fn on_dfu_complete(&self) {
        self.send(DfuEvent::Completed);
    }

    fn on_dfu_error(&self, message: &str, cause: &DfuError) {
        self.send(DfuEvent::Failed {
            message: message.to_string(),
            timeout: cause.is_timeout(),
            connection_lost: cause.is_connection_lost(),
            cancelled: cause.is_cancelled(),
        });
    }
}

/// Maps transferred bytes onto the upper part of the percentage scale.
///
/// With `base = 50` the transfer covers 50..=100; repeated percentages are
/// suppressed.
pub(crate) struct TransferProgress<'a> {
    listener: &'a dyn DfuListener,
    base: u32,
    status: &'a str,
    started: Instant,
    last_percent: Option<u8>,
}

impl<'a> TransferProgress<'a> {
    pub(crate) fn new(listener: &'a dyn DfuListener, base: u32, status: &'a str) -> Self {
        Self {
            listener,
            base,
            status,
            started: Instant::now(),
            last_percent: None,
        }
    }

    pub(crate) fn update(&mut self, done: usize, total: usize) {
        if total == 0 {
            return;
        }
        let scaled = (100 - self.base) as u64 * done as u64 / total as u64;
        let percent = (u64::from(self.base) + scaled).min(100) as u8;
        if self.last_percent == Some(percent) {
            return;
        }
        self.last_percent = Some(percent);
        let elapsed_ms = self.started.elapsed().as_millis().max(1) as u64;
        let speed = (done as u64 * 1000 / elapsed_ms).min(u64::from(u32::MAX)) as u32;
        self.listener.on_dfu_progress(percent, speed, self.status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_listener_order() {
        let (listener, rx) = ChannelListener::new();
        listener.on_dfu_start();
        listener.on_dfu_progress(10, 100, "Programming...");
        listener.on_dfu_error("boom", &DfuError::Cancelled);

        let events: Vec<DfuEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], DfuEvent::Started);
        assert!(matches!(&events[1], DfuEvent::Progress { percent: 10, status, .. } if status == "Programming..."));
        assert!(matches!(&events[2], DfuEvent::Failed { cancelled: true, .. }));
        assert!(events[2].is_terminal());
    }

    #[test]
    fn test_transfer_progress_scaling() {
        let (listener, rx) = ChannelListener::new();
        let mut progress = TransferProgress::new(&listener, 50, "Programming...");
        progress.update(0, 100);
        progress.update(1, 100);
        progress.update(50, 100);
        progress.update(100, 100);

        let percents: Vec<u8> = rx
            .try_iter()
            .filter_map(|e| match e {
                DfuEvent::Progress { percent, .. } => Some(percent),
                _ => None,
            })
            .collect();
        // 1/100 of the upper half rounds down to 50 and is suppressed.
        assert_eq!(percents, vec![50, 75, 100]);
    }
}
