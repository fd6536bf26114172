use std::fmt;

/// Size of `struct connection_event` as laid out by the BPF program,
/// including alignment padding.
pub const CONNECTION_EVENT_SIZE: usize = 56;

/// Length of the kernel `comm` field.
pub const TASK_COMM_LEN: usize = 16;

/// IP protocol number for TCP. Every captured event is a TCP connection.
pub const IPPROTO_TCP: u8 = 6;

/// SyscallKind classifies the kernel operation that produced an event.
/// Numeric ids must match the `syscall_id` values written by the BPF program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SyscallKind {
    Unknown = 0,
    Connect = 1,
    Accept = 2,
    Accept4 = 3,
    TcpConnect = 4,
}

/// Maximum SyscallKind discriminant, used for array sizing.
pub const MAX_SYSCALL_KIND: usize = 4;

impl SyscallKind {
    /// Maps the raw `syscall_id` from the ring buffer. Unmapped ids are
    /// `Unknown`, never an error.
    pub const fn from_id(id: u16) -> Self {
        match id {
            42 => Self::Connect,
            43 => Self::Accept,
            288 => Self::Accept4,
            142 => Self::TcpConnect,
            _ => Self::Unknown,
        }
    }

    /// Returns the canonical log/metric label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Connect => "connect",
            Self::Accept => "accept",
            Self::Accept4 => "accept4",
            Self::TcpConnect => "tcp_connect",
        }
    }

    /// Convert from the enum discriminant.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Unknown),
            1 => Some(Self::Connect),
            2 => Some(Self::Accept),
            3 => Some(Self::Accept4),
            4 => Some(Self::TcpConnect),
            _ => None,
        }
    }

    /// Return all kinds in discriminant order.
    pub fn all() -> &'static [Self] {
        &[
            Self::Unknown,
            Self::Connect,
            Self::Accept,
            Self::Accept4,
            Self::TcpConnect,
        ]
    }
}

impl fmt::Display for SyscallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A connection event normalized from one ring buffer record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// Identity of the producing host. Never empty.
    pub node_id: String,
    /// Producer-supplied timestamp in nanoseconds.
    pub timestamp_ns: u64,
    pub pid: u32,
    pub uid: u32,
    pub kind: SyscallKind,
    /// Task name, cut at the first NUL byte.
    pub process_name: String,
    /// Display label: `"<process_name> [<kind>]"`.
    pub process_label: String,
    /// IPv4 addresses in host byte order.
    pub src_addr: u32,
    pub dst_addr: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub family: u16,
    /// Always [`IPPROTO_TCP`].
    pub protocol: u8,
}

/// Builds the display label carried on the wire in place of the bare name.
pub fn process_label(process_name: &str, kind: SyscallKind) -> String {
    format!("{process_name} [{kind}]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_id_known_ids() {
        assert_eq!(SyscallKind::from_id(42), SyscallKind::Connect);
        assert_eq!(SyscallKind::from_id(43), SyscallKind::Accept);
        assert_eq!(SyscallKind::from_id(288), SyscallKind::Accept4);
        assert_eq!(SyscallKind::from_id(142), SyscallKind::TcpConnect);
    }

    #[test]
    fn test_from_id_unmapped_is_unknown() {
        for id in [0u16, 1, 41, 44, 141, 287, 999, u16::MAX] {
            assert_eq!(SyscallKind::from_id(id), SyscallKind::Unknown, "id {id}");
        }
    }

    #[test]
    fn test_discriminant_roundtrip() {
        for kind in SyscallKind::all() {
            assert_eq!(SyscallKind::from_u8(*kind as u8), Some(*kind));
        }
        assert_eq!(SyscallKind::from_u8(MAX_SYSCALL_KIND as u8 + 1), None);
    }

    #[test]
    fn test_process_label() {
        assert_eq!(process_label("curl", SyscallKind::Connect), "curl [connect]");
        assert_eq!(process_label("", SyscallKind::Unknown), " [unknown]");
    }
}
