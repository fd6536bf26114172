use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use prometheus::Counter;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::sink::buffer::BatchBuffer;
use crate::sink::{Dispatcher, FailureKind};
use crate::tracer::event::{SyscallKind, MAX_SYSCALL_KIND};
use crate::tracer::parse::parse_event;
use crate::tracer::stats::{format_snapshot, KindStats};
use crate::tracer::{EventSource, SourceError};

/// Loop settings taken from [`Config`].
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub node_id: String,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub poll_backoff: Duration,
}

impl From<&Config> for AgentOptions {
    fn from(cfg: &Config) -> Self {
        Self {
            node_id: cfg.node_id.clone(),
            batch_size: cfg.batch_size,
            flush_interval: cfg.flush_interval,
            poll_backoff: cfg.poll_backoff,
        }
    }
}

/// Why a flush happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// The buffer reached the batch size.
    Count,
    /// The flush interval elapsed.
    Interval,
}

impl FlushReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Interval => "interval",
        }
    }
}

/// Totals for one run of the loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub events_received: u64,
    pub events_dropped: u64,
    pub batches_sent: u64,
    pub batches_failed: u64,
    pub events_lost: u64,
    pub events_discarded: u64,
}

/// Outcome of one `select!` round.
enum Step {
    Shutdown,
    Tick,
    Polled(Option<Vec<u8>>),
}

/// Agent is the pump's single producer loop: it polls the event source,
/// decodes and buffers events, and flushes batches to the dispatcher.
///
/// Flushes run inline. While a dispatch is in flight nothing is polled;
/// the source's ring buffer absorbs the gap.
pub struct Agent<S, D> {
    opts: AgentOptions,
    source: S,
    dispatcher: D,
    buffer: BatchBuffer,
    stats: KindStats,
    summary: RunSummary,
    health: Option<Arc<HealthMetrics>>,
    kind_counters: Vec<Option<Counter>>,
}

impl<S, D> Agent<S, D>
where
    S: EventSource,
    D: Dispatcher,
{
    pub fn new(opts: AgentOptions, source: S, dispatcher: D) -> Self {
        let buffer = BatchBuffer::new(opts.batch_size, opts.flush_interval);
        Self {
            opts,
            source,
            dispatcher,
            buffer,
            stats: KindStats::new(),
            summary: RunSummary::default(),
            health: None,
            kind_counters: Vec::new(),
        }
    }

    /// Report progress on `health` as well as in the log.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.kind_counters = build_kind_counters(&health);
        self.health = Some(health);
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    /// Number of events waiting for the next flush.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Runs until `cancel` fires, then discards whatever is still buffered
    /// and closes the source. Fails without polling if the flush interval
    /// cannot be scheduled on the clock; the source is closed either way.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<RunSummary> {
        info!(
            node_id = %self.opts.node_id,
            batch_size = self.buffer.max_events(),
            flush_interval = ?self.opts.flush_interval,
            dispatcher = self.dispatcher.name(),
            "agent started",
        );

        let period = self.opts.flush_interval;
        let Some(first_tick) = Instant::now().checked_add(period) else {
            self.source.close();
            bail!("flush interval {period:?} is out of range");
        };
        let mut ticker = tokio::time::interval_at(first_tick, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Shutdown,
                _ = ticker.tick() => Step::Tick,
                raw = poll_once(&mut self.source, self.opts.poll_backoff) => Step::Polled(raw),
            };

            match step {
                Step::Shutdown => break,
                Step::Tick => {
                    if self.buffer.is_due(Instant::now()) {
                        self.flush(FlushReason::Interval).await;
                    }
                    ticker.reset();
                }
                Step::Polled(Some(raw)) => {
                    if self.ingest(&raw) {
                        self.flush(FlushReason::Count).await;
                        ticker.reset();
                    }
                }
                Step::Polled(None) => {}
            }
        }

        Ok(self.shutdown())
    }

    /// Decodes and buffers one raw record. Returns `true` when the buffer
    /// is full.
    fn ingest(&mut self, raw: &[u8]) -> bool {
        self.summary.events_received += 1;
        if let Some(h) = &self.health {
            h.events_received.inc();
        }

        let event = match parse_event(raw, &self.opts.node_id) {
            Ok(event) => event,
            Err(e) => {
                self.summary.events_dropped += 1;
                if let Some(h) = &self.health {
                    h.events_dropped.inc();
                }
                debug!(error = %e, "dropping malformed event");
                return false;
            }
        };

        self.stats.record(event.kind);
        if let Some(Some(counter)) = self.kind_counters.get(event.kind as usize) {
            counter.inc();
        }

        let full = self.buffer.push(event);
        if let Some(h) = &self.health {
            h.buffer_length.set(self.buffer.len() as f64);
        }
        full
    }

    /// Drains the buffer and dispatches it. The batch is gone afterwards
    /// whatever the outcome.
    async fn flush(&mut self, reason: FlushReason) {
        let batch = self.buffer.drain();
        if let Some(h) = &self.health {
            h.buffer_length.set(0.0);
        }
        if batch.is_empty() {
            return;
        }

        let count = batch.len();
        let kinds = format_snapshot(&self.stats.snapshot());
        let started = Instant::now();
        let result = self.dispatcher.dispatch(batch).await;
        let elapsed = started.elapsed();

        if let Some(h) = &self.health {
            h.dispatch_duration.observe(elapsed.as_secs_f64());
            h.batch_size.observe(count as f64);
        }

        match result {
            Ok(receipt) => {
                self.summary.batches_sent += 1;
                if let Some(h) = &self.health {
                    h.batches_sent.inc();
                }
                info!(
                    count,
                    reason = reason.as_str(),
                    kinds = %kinds,
                    batch_id = %receipt.batch_id,
                    message = %receipt.message,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "sent batch",
                );
            }
            Err(e) => {
                let kind = e.kind();
                self.summary.batches_failed += 1;
                self.summary.events_lost += count as u64;
                if let Some(h) = &self.health {
                    h.dispatch_failures.with_label_values(&[kind.as_str()]).inc();
                    h.events_lost.inc_by(count as f64);
                }
                match kind {
                    FailureKind::Transient => {
                        warn!(count, reason = reason.as_str(), error = %e, "dropping batch")
                    }
                    FailureKind::Fatal => {
                        error!(count, reason = reason.as_str(), error = %e, "sink refused batch")
                    }
                    FailureKind::Malformed => {
                        error!(count, reason = reason.as_str(), error = %e, "dropping rejected batch")
                    }
                }
            }
        }
    }

    fn shutdown(&mut self) -> RunSummary {
        let discarded = self.buffer.discard();
        self.summary.events_discarded += discarded as u64;
        if let Some(h) = &self.health {
            h.events_discarded.inc_by(discarded as f64);
            h.buffer_length.set(0.0);
        }
        info!(discarded, "discarded buffered events");

        self.source.close();

        let s = self.summary;
        info!(
            received = s.events_received,
            dropped = s.events_dropped,
            batches_sent = s.batches_sent,
            batches_failed = s.batches_failed,
            lost = s.events_lost,
            "agent stopped",
        );

        s
    }
}

/// One poll step: a record if one was ready, otherwise `None` after
/// sleeping `backoff`.
async fn poll_once<S: EventSource>(source: &mut S, backoff: Duration) -> Option<Vec<u8>> {
    match source.read() {
        Ok(raw) => Some(raw),
        Err(SourceError::Empty) => {
            tokio::time::sleep(backoff).await;
            None
        }
        Err(e) => {
            warn!(error = %e, "reading event source");
            tokio::time::sleep(backoff).await;
            None
        }
    }
}

fn build_kind_counters(health: &HealthMetrics) -> Vec<Option<Counter>> {
    let mut counters = vec![None; MAX_SYSCALL_KIND + 1];
    for kind in SyscallKind::all() {
        if let Some(slot) = counters.get_mut(*kind as usize) {
            *slot = Some(health.events_by_kind.with_label_values(&[kind.as_str()]));
        }
    }
    counters
}
