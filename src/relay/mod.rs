use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::{SystemClock, TimeSource};
use crate::config::Config;
use crate::downstream::UdpForwarder;
use crate::elide::Elider;
use crate::proto::{self, MetricType, ParsedLine};
use crate::sampler::{Sampler, Verdict};
use crate::stats::{Counter, Scope};

/// Counters for the relay hot path.
struct RelayCounters {
    lines: Counter,
    invalid: Counter,
    absorbed: Counter,
    forwarded: Counter,
    flagged: Counter,
    elided: Counter,
    flushed: Counter,
}

impl RelayCounters {
    fn new(stats: &Scope) -> Result<Self> {
        Ok(Self {
            lines: stats.counter("lines")?,
            invalid: stats.counter("invalid_lines")?,
            absorbed: stats.counter("absorbed")?,
            forwarded: stats.counter("forwarded")?,
            flagged: stats.counter("flagged")?,
            elided: stats.counter("elided")?,
            flushed: stats.counter("flushed_lines")?,
        })
    }
}

/// The event loop joining parser, sampler, elider and forwarder.
///
/// All keyed state lives in this one task: ingest, flush, expiry and GC
/// never run concurrently with each other, so none of it is synchronized.
pub struct Relay {
    sampler: Sampler,
    elider: Elider,
    forwarder: UdpForwarder,
    clock: Box<dyn TimeSource + Send>,
    counters: RelayCounters,
    elide_ttl: u64,
    gc_frequency: i64,
    forward_interval: Duration,
}

impl Relay {
    pub fn new(cfg: &Config, forwarder: UdpForwarder, stats: &Scope) -> Result<Self> {
        let sampler = Sampler::new(&cfg.sampler, Box::new(SystemClock))?;
        Ok(Self {
            sampler,
            elider: Elider::new(cfg.elide.skip),
            forwarder,
            clock: Box::new(SystemClock),
            counters: RelayCounters::new(stats)?,
            elide_ttl: cfg.elide.ttl,
            gc_frequency: cfg.elide.gc_frequency,
            forward_interval: cfg.downstream.flush_interval,
        })
    }

    /// Runs until the channel closes or the token fires, then drains.
    pub async fn run(mut self, mut lines: mpsc::Receiver<Bytes>, cancel: CancellationToken) {
        let mut flush_tick = tick(Duration::from_secs(self.sampler.window_secs().max(1)));
        let mut expiry_tick = optional_tick(self.sampler.expiry_frequency());
        let mut gc_tick = optional_tick(self.gc_frequency);
        let mut forward_tick = tick(self.forward_interval);

        info!(
            window_secs = self.sampler.window_secs(),
            expiry_frequency = self.sampler.expiry_frequency(),
            gc_frequency = self.gc_frequency,
            "relay running",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe_line = lines.recv() => match maybe_line {
                    Some(line) => self.ingest(&line).await,
                    None => break,
                },
                _ = flush_tick.tick() => self.flush().await,
                _ = tick_opt(&mut expiry_tick) => self.sampler.expire(),
                _ = tick_opt(&mut gc_tick) => self.gc(),
                _ = forward_tick.tick() => {
                    if let Err(e) = self.forwarder.flush().await {
                        warn!(error = %e, "downstream flush failed");
                    }
                }
            }
        }

        // Drain on the way out so nothing already absorbed is lost.
        self.flush().await;
        info!("relay stopped");
    }

    async fn ingest(&mut self, raw: &[u8]) {
        if raw.is_empty() {
            return;
        }
        self.counters.lines.inc();

        let parsed = match proto::parse(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.counters.invalid.inc();
                warn!(
                    error = %e,
                    line = %String::from_utf8_lossy(&raw[..raw.len().min(128)]),
                    "dropping invalid line",
                );
                return;
            }
        };

        let verdict = match parsed.kind {
            MetricType::Counter => self.sampler.consider_counter(&parsed),
            MetricType::Timer => self.sampler.consider_timer(&parsed),
            MetricType::Gauge => self.sampler.consider_gauge(&parsed),
            // kv, hist and set types pass through untouched.
            _ => Verdict::NotSampling,
        };

        match verdict {
            Verdict::Sampling => self.counters.absorbed.inc(),
            Verdict::Flagged => {
                // Over-cardinality keys bypass the sampler but still flow.
                self.counters.flagged.inc();
                self.forward(raw).await;
            }
            Verdict::NotSampling => {
                let now = self.clock.now_secs();
                if should_elide(&mut self.elider, &parsed, now) {
                    self.counters.elided.inc();
                    return;
                }
                self.forward(raw).await;
            }
        }
    }

    async fn forward(&mut self, line: &[u8]) {
        self.counters.forwarded.inc();
        if let Err(e) = self.forwarder.push(line).await {
            warn!(error = %e, "downstream send failed");
        }
    }

    async fn flush(&mut self) {
        let mut out: Vec<Vec<u8>> = Vec::new();
        self.sampler
            .flush(&mut |_key: &[u8], line: &[u8]| out.push(line.to_vec()));

        for line in &out {
            self.counters.flushed.inc();
            if let Err(e) = self.forwarder.push(line).await {
                warn!(error = %e, "downstream send failed");
            }
        }
        if let Err(e) = self.forwarder.flush().await {
            warn!(error = %e, "downstream flush failed");
        }
    }

    fn gc(&mut self) {
        let now = self.clock.now_secs();
        let cutoff = now.saturating_sub(self.elide_ttl);
        self.elider.throttled_gc(cutoff);
    }
}

/// Ingest-side zero elision: zero-valued counters and gauges the sampler
/// declined are forwarded once every `skip` generations; a nonzero value
/// resets the run.
fn should_elide(elider: &mut Elider, parsed: &ParsedLine<'_>, now: u64) -> bool {
    if !matches!(parsed.kind, MetricType::Counter | MetricType::Gauge) {
        return false;
    }
    if parsed.value != 0.0 {
        elider.unmark(parsed.key, now);
        return false;
    }
    elider.mark(parsed.key, now) % elider.skip() != 0
}

fn tick(period: Duration) -> Interval {
    // interval() fires immediately; the first real tick belongs one full
    // period out.
    interval_at(Instant::now() + period, period)
}

fn optional_tick(frequency_secs: i64) -> Option<Interval> {
    (frequency_secs > 0).then(|| tick(Duration::from_secs(frequency_secs as u64)))
}

async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
