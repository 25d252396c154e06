//! Completion events and the bounded queue connecting the callback side to waiters.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;
use uuid::Uuid;

use super::lock;
use super::traits::ConnectionState;

/// Pending events kept before new ones are rejected.
///
/// Operations are serialized and each waits for a single completion, so the
/// queue only ever holds that completion plus unsolicited link events.
pub const EVENT_QUEUE_CAPACITY: usize = 16;

/// One asynchronous completion reported by the platform stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattEvent {
    ConnectionChanged {
        status: i32,
        state: ConnectionState,
    },
    MtuChanged {
        status: i32,
        mtu: u16,
    },
    ServicesDiscovered {
        status: i32,
    },
    CharacteristicRead {
        status: i32,
        chr: Uuid,
        value: Vec<u8>,
    },
    /// A segment of the current write pipeline was confirmed.
    CharacteristicWritten {
        status: i32,
        chr: Uuid,
        /// Bytes confirmed so far.
        written: usize,
        total: usize,
        /// False when the stack refused the following segment.
        next_accepted: bool,
    },
    DescriptorWritten {
        status: i32,
        chr: Uuid,
        descriptor: Uuid,
    },
    ServiceChanged,
    RssiRead {
        status: i32,
        rssi: i16,
    },
    PhyUpdated {
        status: i32,
        tx_phy: u8,
        rx_phy: u8,
    },
}

/// Bounded multi-producer queue with a timed blocking poll.
pub struct EventQueue {
    events: Mutex<VecDeque<GattEvent>>,
    ready: Condvar,
    capacity: usize,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Condvar::new(),
            capacity,
        }
    }

    /// Never blocks. Returns false if the queue is full and `event` was dropped.
    pub fn push(&self, event: GattEvent) -> bool {
        let mut events = lock(&self.events);
        if events.len() >= self.capacity {
            warn!(?event, capacity = self.capacity, "Event queue full, event dropped");
            return false;
        }
        events.push_back(event);
        self.ready.notify_one();
        true
    }

    /// Waits up to `timeout` for the oldest event.
    pub fn poll(&self, timeout: Duration) -> Option<GattEvent> {
        let deadline = Instant::now() + timeout;
        let mut events = lock(&self.events);
        loop {
            if let Some(event) = events.pop_front() {
                return Some(event);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            events = match self.ready.wait_timeout(events, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    pub fn clear(&self) {
        lock(&self.events).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
