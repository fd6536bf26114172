use std::time::Duration;

use tokio::time::Instant;

use crate::tracer::event::ConnectionEvent;

/// Default number of buffered events that forces a flush.
pub const DEFAULT_MAX_EVENTS: usize = 50;

/// Default time between flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound on the up-front allocation; larger thresholds grow on demand.
const MAX_PREALLOC: usize = 1024;

/// Batch buffer owned by the agent loop.
///
/// Events are kept in arrival order. The buffer never times itself: the
/// loop asks [`BatchBuffer::push`] about the count trigger and
/// [`BatchBuffer::is_due`] about the time trigger. There is no hard cap, the
/// loop is expected to drain on every `true` returned by `push`.
#[derive(Debug)]
pub struct BatchBuffer {
    events: Vec<ConnectionEvent>,
    max_events: usize,
    flush_interval: Duration,
    last_flush: Instant,
}

impl BatchBuffer {
    /// Creates an empty buffer that fills at `max_events` (minimum 1).
    pub fn new(max_events: usize, flush_interval: Duration) -> Self {
        let max_events = max_events.max(1);
        Self {
            events: Vec::with_capacity(max_events.min(MAX_PREALLOC)),
            max_events,
            flush_interval,
            last_flush: Instant::now(),
        }
    }

    /// Appends an event. Returns `true` once the buffer holds at least
    /// `max_events` events and must be flushed.
    pub fn push(&mut self, event: ConnectionEvent) -> bool {
        self.events.push(event);
        self.events.len() >= self.max_events
    }

    /// Reports whether `flush_interval` has elapsed since the last drain.
    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_flush) >= self.flush_interval
    }

    /// Takes every buffered event, leaving the buffer empty with its
    /// allocation intact, and restarts the flush interval.
    pub fn drain(&mut self) -> Vec<ConnectionEvent> {
        self.last_flush = Instant::now();
        let mut batch = Vec::with_capacity(self.events.len());
        batch.append(&mut self.events);
        batch
    }

    /// Drops every buffered event, returning how many were dropped.
    pub fn discard(&mut self) -> usize {
        let n = self.events.len();
        self.events.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn max_events(&self) -> usize {
        self.max_events
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }
}

impl Default for BatchBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_EVENTS, DEFAULT_FLUSH_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::event::{process_label, SyscallKind, IPPROTO_TCP};

    fn event(pid: u32) -> ConnectionEvent {
        ConnectionEvent {
            node_id: "node-a".to_string(),
            timestamp_ns: u64::from(pid) * 1_000,
            pid,
            uid: 0,
            kind: SyscallKind::Connect,
            process_name: "curl".to_string(),
            process_label: process_label("curl", SyscallKind::Connect),
            src_addr: 0,
            dst_addr: 0,
            src_port: 0,
            dst_port: 443,
            family: 2,
            protocol: IPPROTO_TCP,
        }
    }

    #[test]
    fn test_push_signals_full_at_threshold() {
        let mut buf = BatchBuffer::default();
        for pid in 0..49 {
            assert!(!buf.push(event(pid)), "pid {pid} should not fill");
        }
        assert!(buf.push(event(49)));
        assert_eq!(buf.len(), 50);
    }

    #[test]
    fn test_drain_preserves_order_and_empties() {
        let mut buf = BatchBuffer::default();
        for pid in 0..50 {
            buf.push(event(pid));
        }

        let batch = buf.drain();
        assert_eq!(batch.len(), 50);
        let pids: Vec<u32> = batch.iter().map(|e| e.pid).collect();
        assert_eq!(pids, (0..50).collect::<Vec<_>>());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_drain_empty_buffer() {
        let mut buf = BatchBuffer::new(3, DEFAULT_FLUSH_INTERVAL);
        assert!(buf.drain().is_empty());
    }

    #[test]
    fn test_refills_after_drain() {
        let mut buf = BatchBuffer::new(2, DEFAULT_FLUSH_INTERVAL);
        buf.push(event(1));
        assert!(buf.push(event(2)));
        buf.drain();
        assert!(!buf.push(event(3)));
        assert!(buf.push(event(4)));
    }

    #[test]
    fn test_discard_counts() {
        let mut buf = BatchBuffer::new(10, DEFAULT_FLUSH_INTERVAL);
        buf.push(event(1));
        buf.push(event(2));
        buf.push(event(3));
        assert_eq!(buf.discard(), 3);
        assert!(buf.is_empty());
        assert_eq!(buf.discard(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_due_after_interval() {
        let buf = BatchBuffer::new(50, Duration::from_secs(5));
        assert!(!buf.is_due(Instant::now()));

        tokio::time::advance(Duration::from_millis(4_999)).await;
        assert!(!buf.is_due(Instant::now()));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(buf.is_due(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_restarts_interval() {
        let mut buf = BatchBuffer::new(50, Duration::from_secs(5));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(buf.is_due(Instant::now()));

        buf.drain();
        assert!(!buf.is_due(Instant::now()));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(buf.is_due(Instant::now()));
    }

    #[test]
    fn test_zero_threshold_is_clamped() {
        let mut buf = BatchBuffer::new(0, DEFAULT_FLUSH_INTERVAL);
        assert_eq!(buf.max_events(), 1);
        assert!(buf.push(event(1)));
    }

    #[test]
    fn test_huge_threshold_does_not_preallocate() {
        let mut buf = BatchBuffer::new(usize::MAX, DEFAULT_FLUSH_INTERVAL);
        assert_eq!(buf.max_events(), usize::MAX);
        assert!(!buf.push(event(1)));
        assert_eq!(buf.len(), 1);
    }
}
