//! Per-characteristic buffer of received notifications.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;
use uuid::Uuid;

use super::lock;

/// Chunks kept before further notifications are dropped.
pub const NOTIFICATION_QUEUE_CAPACITY: usize = 128;

#[derive(Default)]
struct State {
    chunks: VecDeque<Vec<u8>>,
    /// Partially consumed chunk and the read offset inside it.
    current: Vec<u8>,
    offset: usize,
    cleared: bool,
}

impl State {
    fn has_current(&self) -> bool {
        self.offset < self.current.len()
    }
}

/// Byte stream assembled from the notifications of one characteristic.
///
/// Once cleared the buffer stays empty and releases every blocked reader.
pub struct NotificationBuffer {
    chr: Uuid,
    state: Mutex<State>,
    ready: Condvar,
}

impl NotificationBuffer {
    pub fn new(chr: Uuid) -> Self {
        Self {
            chr,
            state: Mutex::new(State::default()),
            ready: Condvar::new(),
        }
    }

    pub fn characteristic(&self) -> Uuid {
        self.chr
    }

    /// Called from the callback side; never blocks.
    pub fn push(&self, chunk: Vec<u8>) -> bool {
        if chunk.is_empty() {
            return true;
        }
        let mut state = lock(&self.state);
        if state.cleared {
            return false;
        }
        if state.chunks.len() >= NOTIFICATION_QUEUE_CAPACITY {
            warn!(chr = %self.chr, len = chunk.len(), "Notification buffer full, chunk dropped");
            return false;
        }
        state.chunks.push_back(chunk);
        self.ready.notify_all();
        true
    }

    /// Drops all data and wakes blocked readers.
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.cleared = true;
        state.chunks.clear();
        state.current.clear();
        state.offset = 0;
        self.ready.notify_all();
    }

    pub fn is_cleared(&self) -> bool {
        lock(&self.state).cleared
    }

    /// Bytes available without waiting.
    pub fn available(&self) -> usize {
        let state = lock(&self.state);
        state.current.len() - state.offset + state.chunks.iter().map(Vec::len).sum::<usize>()
    }

    /// Copies bytes of the current chunk into `out`.
    ///
    /// Returns the number of bytes copied; `0` on timeout or once cleared.
    pub fn read(&self, out: &mut [u8], timeout: Duration) -> usize {
        if out.is_empty() {
            return 0;
        }
        let Some(mut state) = self.wait_for_data(timeout) else {
            return 0;
        };
        if !state.has_current() {
            if let Some(next) = state.chunks.pop_front() {
                state.current = next;
                state.offset = 0;
            }
        }
        let start = state.offset;
        let n = out.len().min(state.current.len() - start);
        out[..n].copy_from_slice(&state.current[start..start + n]);
        state.offset += n;
        n
    }

    /// Returns the rest of the current chunk, or the next whole chunk.
    pub fn read_chunk(&self, timeout: Duration) -> Option<Vec<u8>> {
        let mut state = self.wait_for_data(timeout)?;
        if state.has_current() {
            let rest = state.current[state.offset..].to_vec();
            state.current.clear();
            state.offset = 0;
            return Some(rest);
        }
        state.chunks.pop_front()
    }

    fn wait_for_data(&self, timeout: Duration) -> Option<std::sync::MutexGuard<'_, State>> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        loop {
            if state.cleared {
                return None;
            }
            if state.has_current() || !state.chunks.is_empty() {
                return Some(state);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = match self.ready.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const CHR: Uuid = Uuid::from_u128(0x1234);

    #[test]
    fn test_exact_reads_span_chunks() {
        let buf = NotificationBuffer::new(CHR);
        buf.push(vec![1, 2, 3]);
        buf.push(vec![4, 5]);
        assert_eq!(buf.available(), 5);

        let mut out = [0u8; 4];
        let n = buf.read(&mut out, Duration::ZERO);
        assert_eq!(n, 3);
        let m = buf.read(&mut out[n..], Duration::ZERO);
        assert_eq!(m, 1);
        assert_eq!(out, [1, 2, 3, 4]);

        assert_eq!(buf.read_chunk(Duration::ZERO), Some(vec![5]));
        assert_eq!(buf.read_chunk(Duration::ZERO), None);
    }

    #[test]
    fn test_chunk_read_returns_whole_chunks() {
        let buf = NotificationBuffer::new(CHR);
        buf.push(vec![9, 8]);
        buf.push(vec![7]);
        assert_eq!(buf.read_chunk(Duration::ZERO), Some(vec![9, 8]));
        assert_eq!(buf.read_chunk(Duration::ZERO), Some(vec![7]));
    }

    #[test]
    fn test_read_times_out() {
        let buf = NotificationBuffer::new(CHR);
        let mut out = [0u8; 1];
        let start = Instant::now();
        assert_eq!(buf.read(&mut out, Duration::from_millis(30)), 0);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_clear_releases_blocked_reader() {
        let buf = Arc::new(NotificationBuffer::new(CHR));
        let reader = Arc::clone(&buf);
        let handle = thread::spawn(move || {
            let mut out = [0u8; 8];
            reader.read(&mut out, Duration::from_secs(10))
        });
        thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        buf.clear();
        assert_eq!(handle.join().unwrap(), 0);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(buf.is_cleared());
        assert!(!buf.push(vec![1]));
    }

    #[test]
    fn test_capacity_limit() {
        let buf = NotificationBuffer::new(CHR);
        for i in 0..NOTIFICATION_QUEUE_CAPACITY {
            assert!(buf.push(vec![i as u8]));
        }
        assert!(!buf.push(vec![0]));
    }
}
