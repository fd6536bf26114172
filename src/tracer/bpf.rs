//! BPF program loading, attachment, and ring buffer reading.
//!
//! Implements [`EventSource`] on top of aya. The compiled object is loaded
//! from a filesystem path at startup. All code is gated behind
//! `#[cfg(feature = "bpf")]`.

use std::path::Path;

use anyhow::{bail, Context, Result};
use aya::maps::{MapData, RingBuf};
use aya::programs::{KProbe, TracePoint};
use aya::{Ebpf, EbpfLoader};

use super::{EventSource, SourceError};

/// Name of the ring buffer map declared by the BPF object.
const EVENTS_MAP: &str = "events";

/// Where a program is attached.
#[derive(Debug, Clone, Copy)]
enum Hook {
    Tracepoint {
        category: &'static str,
        name: &'static str,
    },
    Kprobe {
        symbol: &'static str,
    },
}

/// Programs the pump knows how to attach. Each one is optional; startup
/// fails only when none of them attach.
const PROBES: &[(&str, Hook)] = &[
    (
        "trace_connect",
        Hook::Tracepoint {
            category: "syscalls",
            name: "sys_enter_connect",
        },
    ),
    (
        "trace_accept",
        Hook::Tracepoint {
            category: "syscalls",
            name: "sys_enter_accept",
        },
    ),
    (
        "trace_accept4",
        Hook::Tracepoint {
            category: "syscalls",
            name: "sys_enter_accept4",
        },
    ),
    (
        "kprobe_tcp_v4_connect",
        Hook::Kprobe {
            symbol: "tcp_v4_connect",
        },
    ),
];

/// BPF program attachment statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttachmentStats {
    pub tracepoints_attached: u32,
    pub tracepoints_failed: u32,
    pub kprobes_attached: u32,
    pub kprobes_failed: u32,
    pub missing: u32,
}

impl AttachmentStats {
    pub fn attached(&self) -> u32 {
        self.tracepoints_attached + self.kprobes_attached
    }
}

/// Ring-buffer-backed event source.
pub struct BpfSource {
    // Dropping `Ebpf` detaches every program and closes the maps.
    ebpf: Option<Ebpf>,
    ring_buf: Option<RingBuf<MapData>>,
    attach_stats: AttachmentStats,
}

impl BpfSource {
    /// Load the object at `path`, attach every known program present in it,
    /// and open the events ring buffer.
    pub fn open(path: &Path) -> Result<Self> {
        ensure_root()?;
        remove_memlock_limit();

        let mut ebpf = EbpfLoader::new()
            .load_file(path)
            .with_context(|| format!("loading BPF object {}", path.display()))?;

        let attach_stats = attach_programs(&mut ebpf);
        log_attachment_stats(&attach_stats);

        if attach_stats.attached() == 0 {
            bail!("no BPF programs could be attached");
        }

        let events_map = ebpf
            .take_map(EVENTS_MAP)
            .ok_or_else(|| anyhow::anyhow!("{EVENTS_MAP} map not found"))?;
        let ring_buf =
            RingBuf::try_from(events_map).context("creating ring buffer from events map")?;

        tracing::info!(object = %path.display(), "BPF source started");

        Ok(Self {
            ebpf: Some(ebpf),
            ring_buf: Some(ring_buf),
            attach_stats,
        })
    }

    /// Return a copy of the attachment statistics.
    pub fn attachment_stats(&self) -> AttachmentStats {
        self.attach_stats
    }
}

impl EventSource for BpfSource {
    fn read(&mut self) -> Result<Vec<u8>, SourceError> {
        let ring_buf = self.ring_buf.as_mut().ok_or(SourceError::Empty)?;
        match ring_buf.next() {
            Some(item) => Ok(item.to_vec()),
            None => Err(SourceError::Empty),
        }
    }

    fn close(&mut self) {
        self.ring_buf = None;
        if self.ebpf.take().is_some() {
            tracing::info!("BPF programs detached");
        }
    }
}

/// Fails unless the process runs with effective uid 0.
pub fn ensure_root() -> Result<()> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        bail!("must run as root to load BPF programs (euid={euid})");
    }
    Ok(())
}

/// Lift RLIMIT_MEMLOCK for kernels that still charge BPF maps against it.
fn remove_memlock_limit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    // SAFETY: `rlim` is a valid, initialized rlimit for the duration of the call.
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        tracing::debug!(ret, "failed to remove limit on locked memory");
    }
}

// ---------------------------------------------------------------------------
// BPF program attachment
// ---------------------------------------------------------------------------

fn attach_programs(ebpf: &mut Ebpf) -> AttachmentStats {
    let mut stats = AttachmentStats::default();

    for (prog_name, hook) in PROBES {
        if ebpf.program(prog_name).is_none() {
            stats.missing += 1;
            tracing::debug!(program = prog_name, "program not in object, skipping");
            continue;
        }

        match *hook {
            Hook::Tracepoint { category, name } => {
                attach_tracepoint(ebpf, prog_name, category, name, &mut stats)
            }
            Hook::Kprobe { symbol } => attach_kprobe(ebpf, prog_name, symbol, &mut stats),
        }
    }

    stats
}

fn attach_tracepoint(
    ebpf: &mut Ebpf,
    prog_name: &str,
    category: &str,
    name: &str,
    stats: &mut AttachmentStats,
) {
    let result: Result<()> = (|| {
        let prog: &mut TracePoint = ebpf
            .program_mut(prog_name)
            .ok_or_else(|| anyhow::anyhow!("program '{prog_name}' not found"))?
            .try_into()?;
        prog.load()?;
        prog.attach(category, name)?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            stats.tracepoints_attached += 1;
            tracing::info!(category, name, "attached tracepoint");
        }
        Err(e) => {
            stats.tracepoints_failed += 1;
            tracing::warn!(category, name, error = %e, "tracepoint attach failed");
        }
    }
}

fn attach_kprobe(ebpf: &mut Ebpf, prog_name: &str, symbol: &str, stats: &mut AttachmentStats) {
    let result: Result<()> = (|| {
        let prog: &mut KProbe = ebpf
            .program_mut(prog_name)
            .ok_or_else(|| anyhow::anyhow!("program '{prog_name}' not found"))?
            .try_into()?;
        prog.load()?;
        prog.attach(symbol, 0)?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            stats.kprobes_attached += 1;
            tracing::info!(symbol, "attached kprobe");
        }
        Err(e) => {
            stats.kprobes_failed += 1;
            tracing::warn!(symbol, error = %e, "kprobe attach failed");
        }
    }
}

fn log_attachment_stats(stats: &AttachmentStats) {
    tracing::info!(
        tracepoints_attached = stats.tracepoints_attached,
        tracepoints_failed = stats.tracepoints_failed,
        kprobes_attached = stats.kprobes_attached,
        kprobes_failed = stats.kprobes_failed,
        missing = stats.missing,
        "BPF program attachment summary"
    );
}
