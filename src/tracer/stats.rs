use std::sync::atomic::{AtomicU64, Ordering};

use super::event::{SyscallKind, MAX_SYSCALL_KIND};

/// Lock-free per-SyscallKind counters.
///
/// `snapshot()` reads and resets all counters, so each flush can report
/// what arrived since the previous one.
pub struct KindStats {
    counts: [AtomicU64; MAX_SYSCALL_KIND + 1],
}

impl KindStats {
    /// Create a new zeroed KindStats.
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Increment the counter for the given kind by one.
    pub fn record(&self, kind: SyscallKind) {
        if let Some(counter) = self.counts.get(kind as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Atomically read and reset all counters, returning only non-zero entries.
    pub fn snapshot(&self) -> Vec<(SyscallKind, u64)> {
        let mut result = Vec::new();

        for (i, counter) in self.counts.iter().enumerate() {
            let v = counter.swap(0, Ordering::Relaxed);
            if v > 0 {
                if let Some(kind) = u8::try_from(i).ok().and_then(SyscallKind::from_u8) {
                    result.push((kind, v));
                }
            }
        }

        result
    }
}

impl Default for KindStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders a snapshot as `connect=3 accept=1` for log lines.
pub fn format_snapshot(snapshot: &[(SyscallKind, u64)]) -> String {
    snapshot
        .iter()
        .map(|(kind, n)| format!("{kind}={n}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = KindStats::new();
        stats.record(SyscallKind::Connect);
        stats.record(SyscallKind::Connect);
        stats.record(SyscallKind::Accept4);

        let snap = stats.snapshot();
        assert_eq!(snap.len(), 2);

        let connect = snap
            .iter()
            .find(|(k, _)| *k == SyscallKind::Connect)
            .map(|(_, v)| *v);
        assert_eq!(connect, Some(2));

        let accept4 = snap
            .iter()
            .find(|(k, _)| *k == SyscallKind::Accept4)
            .map(|(_, v)| *v);
        assert_eq!(accept4, Some(1));
    }

    #[test]
    fn test_snapshot_resets_counters() {
        let stats = KindStats::new();
        stats.record(SyscallKind::Unknown);

        assert_eq!(stats.snapshot().len(), 1);
        assert!(stats.snapshot().is_empty());
    }

    #[test]
    fn test_format_snapshot() {
        let snap = vec![(SyscallKind::Connect, 3), (SyscallKind::TcpConnect, 1)];
        assert_eq!(format_snapshot(&snap), "connect=3 tcp_connect=1");
        assert_eq!(format_snapshot(&[]), "");
    }
}
