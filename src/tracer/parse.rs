//! Decoding of raw ring buffer records into [`ConnectionEvent`] values.
//!
//! Records are read field by field at fixed offsets with explicit
//! little-endian conversion. Every read is bounds-checked, so a short or
//! corrupted record produces a [`ParseError`] instead of a panic.

use thiserror::Error;

use super::event::{
    process_label, ConnectionEvent, SyscallKind, CONNECTION_EVENT_SIZE, IPPROTO_TCP,
    TASK_COMM_LEN,
};

// Field offsets in `struct connection_event` (natural C alignment).
const OFF_TIMESTAMP: usize = 0;
const OFF_PID: usize = 8;
const OFF_UID: usize = 12;
const OFF_SYSCALL_ID: usize = 16;
const OFF_COMM: usize = 18;
// pad[2] at 34-35
const OFF_SADDR: usize = 36;
const OFF_DADDR: usize = 40;
const OFF_SPORT: usize = 44;
const OFF_DPORT: usize = 46;
const OFF_FAMILY: usize = 48;
// tail pad[6] at 50-55

/// Errors that can occur while decoding a record.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("event too short: {size} bytes, need {}", CONNECTION_EVENT_SIZE)]
    Truncated { size: usize },

    /// Raised by the field readers. `parse_event` checks the full length
    /// first, so this only surfaces if an offset is moved past the layout.
    #[error("reading {field}: unexpected end of data")]
    FieldOutOfBounds { field: &'static str },
}

/// Decode one raw record, attaching `node_id` to the result.
///
/// Records shorter than [`CONNECTION_EVENT_SIZE`] are rejected before any
/// field is read. Bytes past the fixed layout are ignored.
pub fn parse_event(data: &[u8], node_id: &str) -> Result<ConnectionEvent, ParseError> {
    if data.len() < CONNECTION_EVENT_SIZE {
        return Err(ParseError::Truncated { size: data.len() });
    }

    let kind = SyscallKind::from_id(read_u16_le(data, OFF_SYSCALL_ID, "syscall_id")?);
    let comm = read_fixed::<TASK_COMM_LEN>(data, OFF_COMM, "comm")?;
    let process_name = comm_to_string(&comm);

    Ok(ConnectionEvent {
        node_id: node_id.to_owned(),
        timestamp_ns: read_u64_le(data, OFF_TIMESTAMP, "timestamp")?,
        pid: read_u32_le(data, OFF_PID, "pid")?,
        uid: read_u32_le(data, OFF_UID, "uid")?,
        kind,
        process_label: process_label(&process_name, kind),
        process_name,
        src_addr: read_u32_le(data, OFF_SADDR, "saddr")?,
        dst_addr: read_u32_le(data, OFF_DADDR, "daddr")?,
        src_port: read_u16_le(data, OFF_SPORT, "sport")?,
        dst_port: read_u16_le(data, OFF_DPORT, "dport")?,
        family: read_u16_le(data, OFF_FAMILY, "family")?,
        protocol: IPPROTO_TCP,
    })
}

/// Cut a fixed-width task name at its first NUL. A field with no NUL is
/// used whole.
pub fn comm_to_string(comm: &[u8]) -> String {
    let end = comm.iter().position(|&b| b == 0).unwrap_or(comm.len());
    let trimmed = comm.get(..end).unwrap_or(&[]);

    match std::str::from_utf8(trimmed) {
        Ok(s) => s.to_owned(),
        Err(_) => String::from_utf8_lossy(trimmed).into_owned(),
    }
}

// ---------------------------------------------------------------------------
// Bounds-checked byte readers
// ---------------------------------------------------------------------------

fn read_fixed<const N: usize>(
    data: &[u8],
    offset: usize,
    field: &'static str,
) -> Result<[u8; N], ParseError> {
    offset
        .checked_add(N)
        .and_then(|end| data.get(offset..end))
        .and_then(|bytes| <[u8; N]>::try_from(bytes).ok())
        .ok_or(ParseError::FieldOutOfBounds { field })
}

fn read_u16_le(data: &[u8], offset: usize, field: &'static str) -> Result<u16, ParseError> {
    read_fixed::<2>(data, offset, field).map(u16::from_le_bytes)
}

fn read_u32_le(data: &[u8], offset: usize, field: &'static str) -> Result<u32, ParseError> {
    read_fixed::<4>(data, offset, field).map(u32::from_le_bytes)
}

fn read_u64_le(data: &[u8], offset: usize, field: &'static str) -> Result<u64, ParseError> {
    read_fixed::<8>(data, offset, field).map(u64::from_le_bytes)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    /// Build a record with the same layout the BPF program writes.
    #[allow(clippy::too_many_arguments)]
    fn record(
        ts: u64,
        pid: u32,
        uid: u32,
        syscall_id: u16,
        comm: &[u8],
        saddr: u32,
        daddr: u32,
        sport: u16,
        dport: u16,
        family: u16,
    ) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CONNECTION_EVENT_SIZE);
        buf.extend_from_slice(&ts.to_le_bytes());
        buf.extend_from_slice(&pid.to_le_bytes());
        buf.extend_from_slice(&uid.to_le_bytes());
        buf.extend_from_slice(&syscall_id.to_le_bytes());
        let mut name = [0u8; TASK_COMM_LEN];
        name[..comm.len()].copy_from_slice(comm);
        buf.extend_from_slice(&name);
        buf.extend_from_slice(&[0u8; 2]); // pad
        buf.extend_from_slice(&saddr.to_le_bytes());
        buf.extend_from_slice(&daddr.to_le_bytes());
        buf.extend_from_slice(&sport.to_le_bytes());
        buf.extend_from_slice(&dport.to_le_bytes());
        buf.extend_from_slice(&family.to_le_bytes());
        buf.extend_from_slice(&[0u8; 6]); // tail pad
        buf
    }

    // -- Error cases --

    #[test]
    fn test_empty_data() {
        assert_eq!(
            parse_event(&[], "node-a").unwrap_err(),
            ParseError::Truncated { size: 0 }
        );
    }

    #[test]
    fn test_every_short_length_is_truncated() {
        let full = record(1, 2, 3, 42, b"curl", 4, 5, 6, 7, 2);
        for len in 0..CONNECTION_EVENT_SIZE {
            assert_eq!(
                parse_event(&full[..len], "node-a").unwrap_err(),
                ParseError::Truncated { size: len },
                "length {len}"
            );
        }
    }

    #[test]
    fn test_exact_size_parses() {
        let data = record(1, 2, 3, 42, b"curl", 4, 5, 6, 7, 2);
        assert_eq!(data.len(), CONNECTION_EVENT_SIZE);
        assert!(parse_event(&data, "node-a").is_ok());
    }

    #[test]
    fn test_extra_trailing_data_ignored() {
        let mut data = record(1, 2, 3, 43, b"nginx", 4, 5, 6, 7, 2);
        data.extend_from_slice(&[0xFF; 64]);
        let e = parse_event(&data, "node-a").unwrap();
        assert_eq!(e.family, 2);
        assert_eq!(e.kind, SyscallKind::Accept);
    }

    // -- Field decoding --

    #[test]
    fn test_numeric_fields_preserved() {
        let data = record(
            1_700_000_000_123_456_789,
            u32::MAX - 1,
            1000,
            42,
            b"curl",
            0xDEAD_BEEF,
            0x0102_0304,
            65535,
            1,
            2,
        );
        let e = parse_event(&data, "node-a").unwrap();
        assert_eq!(e.timestamp_ns, 1_700_000_000_123_456_789);
        assert_eq!(e.pid, u32::MAX - 1);
        assert_eq!(e.uid, 1000);
        assert_eq!(e.src_addr, 0xDEAD_BEEF);
        assert_eq!(e.dst_addr, 0x0102_0304);
        assert_eq!(e.src_port, 65535);
        assert_eq!(e.dst_port, 1);
        assert_eq!(e.family, 2);
        assert_eq!(e.node_id, "node-a");
    }

    #[test]
    fn test_protocol_is_always_tcp() {
        for id in [42u16, 43, 288, 142, 999] {
            let data = record(1, 1, 1, id, b"x", 0, 0, 0, 0, 2);
            assert_eq!(parse_event(&data, "n").unwrap().protocol, 6);
        }
    }

    #[test]
    fn test_syscall_mapping() {
        let cases = [
            (42u16, SyscallKind::Connect),
            (43, SyscallKind::Accept),
            (288, SyscallKind::Accept4),
            (142, SyscallKind::TcpConnect),
            (999, SyscallKind::Unknown),
        ];
        for (id, expected) in cases {
            let data = record(1, 1, 1, id, b"x", 0, 0, 0, 0, 2);
            assert_eq!(parse_event(&data, "n").unwrap().kind, expected, "id {id}");
        }
    }

    // -- Process name --

    #[test]
    fn test_comm_truncated_at_null() {
        let data = record(1, 1, 1, 42, b"nginx", 0, 0, 0, 0, 2);
        let e = parse_event(&data, "n").unwrap();
        assert_eq!(e.process_name, "nginx");
        assert_eq!(e.process_label, "nginx [connect]");
    }

    #[test]
    fn test_comm_without_null_uses_full_field() {
        let data = record(1, 1, 1, 43, b"abcdefghijklmnop", 0, 0, 0, 0, 2);
        let e = parse_event(&data, "n").unwrap();
        assert_eq!(e.process_name, "abcdefghijklmnop");
        assert_eq!(e.process_name.len(), TASK_COMM_LEN);
    }

    #[test]
    fn test_comm_bytes_after_null_ignored() {
        let mut comm = [0u8; TASK_COMM_LEN];
        comm[..2].copy_from_slice(b"ab");
        comm[3] = b'c';
        assert_eq!(comm_to_string(&comm), "ab");
    }

    #[test]
    fn test_empty_comm() {
        let data = record(1, 1, 1, 999, b"", 0, 0, 0, 0, 2);
        let e = parse_event(&data, "n").unwrap();
        assert_eq!(e.process_name, "");
        assert_eq!(e.process_label, " [unknown]");
    }

    #[test]
    fn test_invalid_utf8_comm_is_lossy() {
        assert_eq!(comm_to_string(&[b'a', 0xFF, b'b', 0]), "a\u{FFFD}b");
    }

    // -- End-to-end record --

    #[test]
    fn test_curl_connect_record() {
        let data = record(
            5_000,
            1234,
            0,
            42,
            b"curl",
            u32::from_be_bytes([10, 0, 0, 1]),
            u32::from_be_bytes([93, 184, 216, 34]),
            5000,
            443,
            2,
        );
        let e = parse_event(&data, "node-a").unwrap();
        assert_eq!(e.kind, SyscallKind::Connect);
        assert_eq!(e.pid, 1234);
        assert_eq!(e.process_label, "curl [connect]");
        assert_eq!(std::net::Ipv4Addr::from(e.src_addr).to_string(), "10.0.0.1");
        assert_eq!(
            std::net::Ipv4Addr::from(e.dst_addr).to_string(),
            "93.184.216.34"
        );
        assert_eq!(e.src_port, 5000);
        assert_eq!(e.dst_port, 443);
        assert_eq!(e.protocol, 6);
    }

    #[test]
    fn test_field_reader_guards_offset() {
        assert_eq!(
            read_u32_le(&[0u8; 3], 0, "pid"),
            Err(ParseError::FieldOutOfBounds { field: "pid" })
        );
        assert_eq!(
            read_u16_le(&[0u8; CONNECTION_EVENT_SIZE], CONNECTION_EVENT_SIZE - 1, "dport"),
            Err(ParseError::FieldOutOfBounds { field: "dport" })
        );
        assert_eq!(read_u32_le(&[1, 0, 0, 0], 0, "pid"), Ok(1));
    }

    #[test]
    fn test_parse_error_display() {
        let e = ParseError::Truncated { size: 5 };
        assert_eq!(e.to_string(), "event too short: 5 bytes, need 56");

        let e = ParseError::FieldOutOfBounds { field: "comm" };
        assert_eq!(e.to_string(), "reading comm: unexpected end of data");
    }
}
