use std::borrow::Cow;
use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Local, TimeZone};

use crate::proto::ConnectionEvent;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Maps an IP protocol number to its display name.
pub fn protocol_name(protocol: u32) -> Cow<'static, str> {
    match protocol {
        6 => Cow::Borrowed("TCP"),
        17 => Cow::Borrowed("UDP"),
        1 => Cow::Borrowed("ICMP"),
        n => Cow::Owned(format!("UNKNOWN({n})")),
    }
}

/// Formats a nanosecond timestamp as local `HH:MM:SS`.
pub fn format_timestamp(timestamp_ns: u64) -> String {
    format_timestamp_in(timestamp_ns, &Local)
}

fn format_timestamp_in<Tz>(timestamp_ns: u64, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    let secs = i64::try_from(timestamp_ns / NANOS_PER_SEC).unwrap_or(i64::MAX);
    let nanos = u32::try_from(timestamp_ns % NANOS_PER_SEC).unwrap_or(0);

    match DateTime::from_timestamp(secs, nanos) {
        Some(utc) => utc.with_timezone(tz).format("%H:%M:%S").to_string(),
        None => "--:--:--".to_string(),
    }
}

/// Sink-assigned identifier for a batch acknowledged at `now`.
pub fn batch_id<Tz>(now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    format!("batch_{}", now.format("%Y%m%d%H%M%S"))
}

/// One log line per received event:
/// `HH:MM:SS | src:port → dst:port | PID:n | label | PROTO`.
pub struct EventLine<'a>(pub &'a ConnectionEvent);

impl fmt::Display for EventLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let e = self.0;
        write!(
            f,
            "{} | {}:{} → {}:{} | PID:{} | {} | {}",
            format_timestamp(e.timestamp),
            Ipv4Addr::from(e.saddr),
            e.sport,
            Ipv4Addr::from(e.daddr),
            e.dport,
            e.pid,
            e.process_name,
            protocol_name(e.protocol),
        )
    }
}
