pub mod bucket;
pub mod gformat;
pub mod reservoir;
pub mod rng;

use std::collections::HashMap;

use anyhow::{bail, Result};
use tracing::{debug, warn};

use crate::clock::TimeSource;
use crate::config::SamplerConfig;
use crate::proto::{MetricType, ParsedLine, MAX_LINE_LENGTH};

use self::bucket::{Bucket, BucketKind, TimerState, LOWER_SENTINEL, UPPER_SENTINEL};
use self::gformat::format_g;
use self::rng::Lcg48;

/// Initial capacity of the key map.
const MAP_CAPACITY: usize = 32768;

/// Outcome of offering an observation to the sampler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The bucket is below threshold; the caller relays the line as-is.
    NotSampling,
    /// The observation was absorbed into the bucket.
    Sampling,
    /// New key over the cardinality limit; the caller applies its
    /// bypass-or-drop policy, the sampler tracks nothing.
    Flagged,
}

/// Receives reconstructed lines during a flush.
///
/// The line slice points into a scratch buffer that is overwritten on the
/// next emission; implementations must copy or forward it before returning.
pub trait LineSink {
    fn accept(&mut self, key: &[u8], line: &[u8]);
}

impl<F: FnMut(&[u8], &[u8])> LineSink for F {
    fn accept(&mut self, key: &[u8], line: &[u8]) {
        self(key, line)
    }
}

/// Adaptive per-key sampling engine.
///
/// Keys are admitted on first sight, circuit-break into the sampling state
/// once a window exceeds the threshold, and drop back out via the
/// post-flush update. All state is confined to the relay task; nothing
/// here is synchronized.
pub struct Sampler {
    threshold: u64,
    window_secs: u64,
    cardinality: usize,
    reservoir_size: usize,
    timer_flush_min_max: bool,
    expiry_frequency: i64,
    ttl: i64,
    map: HashMap<Vec<u8>, Bucket>,
    rng: Lcg48,
    clock: Box<dyn TimeSource + Send>,
    /// Reusable flush scratch, bounded by the datagram budget.
    line: Vec<u8>,
}

impl Sampler {
    /// Builds a sampler seeded from the wall clock.
    pub fn new(cfg: &SamplerConfig, clock: Box<dyn TimeSource + Send>) -> Result<Self> {
        let seed = clock.now_secs() as u32;
        Self::with_seed(cfg, clock, seed)
    }

    /// Builds a sampler with a pinned PRNG seed, for deterministic
    /// reservoir behavior in tests.
    pub fn with_seed(
        cfg: &SamplerConfig,
        clock: Box<dyn TimeSource + Send>,
        seed: u32,
    ) -> Result<Self> {
        if cfg.threshold < 0 {
            bail!("sampler threshold must be non-negative");
        }
        if cfg.reservoir_size < cfg.threshold as usize {
            bail!("sampler reservoir_size must be at least the threshold");
        }

        Ok(Self {
            threshold: cfg.threshold as u64,
            window_secs: cfg.window.as_secs(),
            cardinality: cfg.cardinality,
            reservoir_size: cfg.reservoir_size,
            timer_flush_min_max: cfg.timer_flush_min_max,
            expiry_frequency: cfg.expiry_frequency,
            ttl: cfg.ttl,
            map: HashMap::with_capacity(MAP_CAPACITY),
            rng: Lcg48::new(seed),
            clock,
            line: Vec::with_capacity(MAX_LINE_LENGTH),
        })
    }

    /// Seconds between flushes, for the owning event loop.
    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }

    /// Seconds between expiry passes; -1 disables the timer.
    pub fn expiry_frequency(&self) -> i64 {
        self.expiry_frequency
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// True only if the key exists with a matching type and is currently
    /// in the sampling state.
    pub fn is_sampling(&self, key: &[u8], kind: MetricType) -> bool {
        self.map
            .get(key)
            .map_or(false, |b| b.sampling && b.metric_type() == kind)
    }

    /// Offers a counter observation.
    pub fn consider_counter(&mut self, parsed: &ParsedLine<'_>) -> Verdict {
        if parsed.kind != MetricType::Counter {
            return Verdict::NotSampling;
        }
        let now = self.clock.now_secs();
        match self.map.get_mut(parsed.key) {
            None => self.admit(parsed, Bucket::counter(now)),
            Some(bucket) => {
                Self::touch(self.threshold, parsed, bucket, now);
                if !bucket.sampling {
                    return Verdict::NotSampling;
                }
                let (value, count) = compensate(parsed.value, parsed.presample);
                bucket.sum += value;
                bucket.count += count;
                Verdict::Sampling
            }
        }
    }

    /// Offers a gauge observation. Admission and threshold behave exactly
    /// like counters; accumulation is uncompensated because gauges carry
    /// instantaneous state.
    pub fn consider_gauge(&mut self, parsed: &ParsedLine<'_>) -> Verdict {
        if parsed.kind != MetricType::Gauge {
            return Verdict::NotSampling;
        }
        let now = self.clock.now_secs();
        match self.map.get_mut(parsed.key) {
            None => self.admit(parsed, Bucket::gauge(now)),
            Some(bucket) => {
                Self::touch(self.threshold, parsed, bucket, now);
                if !bucket.sampling {
                    return Verdict::NotSampling;
                }
                bucket.sum += parsed.value;
                bucket.count += 1.0;
                Verdict::Sampling
            }
        }
    }

    /// Offers a timer observation. On top of the counter path, sampled
    /// values feed the window extrema and the reservoir.
    pub fn consider_timer(&mut self, parsed: &ParsedLine<'_>) -> Verdict {
        if parsed.kind != MetricType::Timer {
            return Verdict::NotSampling;
        }
        let now = self.clock.now_secs();
        let threshold = self.threshold;
        match self.map.get_mut(parsed.key) {
            None => {
                let bucket = Bucket::timer(now, self.reservoir_size, threshold as usize);
                self.admit(parsed, bucket)
            }
            Some(bucket) => {
                Self::touch(threshold, parsed, bucket, now);
                if !bucket.sampling {
                    return Verdict::NotSampling;
                }
                let window = bucket.last_window_count;
                let BucketKind::Timer(ref mut timer) = bucket.kind else {
                    return Verdict::NotSampling;
                };

                // A value that sets a fresh extremum is held out of the
                // reservoir; displacing an existing extremum pushes the
                // old one through instead.
                let mut passthrough = Some(parsed.value);
                if parsed.value > timer.upper {
                    timer.upper_sample_rate = parsed.presample;
                    if timer.upper == UPPER_SENTINEL {
                        timer.upper = parsed.value;
                        passthrough = None;
                    } else {
                        passthrough = Some(timer.upper);
                        timer.upper = parsed.value;
                    }
                }
                if let Some(value) = passthrough {
                    if value < timer.lower {
                        timer.lower_sample_rate = parsed.presample;
                        if timer.lower == LOWER_SENTINEL {
                            timer.lower = value;
                            passthrough = None;
                        } else {
                            passthrough = Some(timer.lower);
                            timer.lower = value;
                        }
                    }
                }
                if let Some(value) = passthrough {
                    timer.reservoir.offer(value, window, &mut self.rng);
                    let (_, count) = compensate(value, parsed.presample);
                    bucket.sum += value;
                    bucket.count += count;
                }
                Verdict::Sampling
            }
        }
    }

    /// Emits the reconstructed lines for every sampling bucket, then runs
    /// the per-key window update.
    pub fn flush(&mut self, sink: &mut dyn LineSink) {
        let Self {
            threshold,
            timer_flush_min_max,
            map,
            line,
            ..
        } = self;
        let threshold = *threshold;
        let flush_min_max = *timer_flush_min_max;

        for (key, bucket) in map.iter_mut() {
            if bucket.sampling {
                match bucket.kind {
                    BucketKind::Counter if bucket.count > 0.0 => {
                        let mean = bucket.sum / bucket.count;
                        let rate = 1.0 / bucket.count;
                        emit(sink, line, key, mean, "c", Some(rate));
                    }
                    BucketKind::Gauge if bucket.count > 0.0 => {
                        let mean = bucket.sum / bucket.count;
                        emit(sink, line, key, mean, "g", None);
                    }
                    BucketKind::Timer(ref mut timer) => {
                        flush_timer(sink, line, key, timer, bucket.count, flush_min_max);
                    }
                    BucketKind::Counter | BucketKind::Gauge => {}
                }
                bucket.sum = 0.0;
                bucket.count = 0.0;
            }

            update(threshold, key, bucket);
        }
    }

    /// Removes buckets idle longer than the TTL. Buckets currently in the
    /// sampling state never expire; they must leave it through the
    /// post-flush update first.
    pub fn expire(&mut self) {
        if self.ttl < 0 {
            return;
        }
        let now = self.clock.now_secs();
        let ttl = self.ttl as u64;
        let before = self.map.len();
        self.map
            .retain(|_, bucket| bucket.sampling || now.saturating_sub(bucket.last_modified_at) <= ttl);
        let dropped = before - self.map.len();
        if dropped > 0 {
            debug!(dropped, tracked = self.map.len(), "expired idle buckets");
        }
    }

    fn admit(&mut self, parsed: &ParsedLine<'_>, bucket: Bucket) -> Verdict {
        if self.map.len() >= self.cardinality {
            warn!(
                key = %String::from_utf8_lossy(parsed.key),
                kind = parsed.kind.name(),
                "flagging metric over cardinality",
            );
            return Verdict::Flagged;
        }
        self.map.insert(parsed.key.to_vec(), bucket);
        Verdict::NotSampling
    }

    fn touch(threshold: u64, parsed: &ParsedLine<'_>, bucket: &mut Bucket, now: u64) {
        bucket.last_window_count += 1;
        bucket.last_modified_at = now;
        if !bucket.sampling && bucket.last_window_count > threshold {
            debug!(
                key = %String::from_utf8_lossy(parsed.key),
                kind = parsed.kind.name(),
                "started sampling",
            );
            bucket.sampling = true;
        }
    }
}

/// Applies the client's pre-sample rate so totals stay reconstructable.
fn compensate(value: f64, presample: f64) -> (f64, f64) {
    if presample > 0.0 && presample < 1.0 {
        (value / presample, 1.0 / presample)
    } else {
        (value, 1.0)
    }
}

/// Post-flush window tick for one bucket.
fn update(threshold: u64, key: &[u8], bucket: &mut Bucket) {
    if bucket.last_window_count > threshold {
        bucket.sampling = true;
    } else if bucket.sampling {
        bucket.sampling = false;
        if let BucketKind::Timer(ref mut timer) = bucket.kind {
            timer.reservoir.reset_fill();
        }
        debug!(
            key = %String::from_utf8_lossy(key),
            kind = bucket.metric_type().name(),
            "stopped sampling",
        );
    }
    bucket.last_window_count = 0;
}

fn flush_timer(
    sink: &mut dyn LineSink,
    line: &mut Vec<u8>,
    key: &[u8],
    timer: &mut TimerState,
    count: f64,
    flush_min_max: bool,
) {
    // Extremum lines precede reservoir lines and carry the pre-sample
    // rate that arrived with the extremum.
    if flush_min_max {
        if timer.upper > UPPER_SENTINEL {
            emit(sink, line, key, timer.upper, "ms", Some(timer.upper_sample_rate));
            timer.upper = UPPER_SENTINEL;
        }
        if timer.lower < LOWER_SENTINEL {
            emit(sink, line, key, timer.lower, "ms", Some(timer.lower_sample_rate));
            timer.lower = LOWER_SENTINEL;
        }
    }

    if count > 0.0 {
        let num_samples = timer.reservoir.len();
        if num_samples > 0 {
            let sample_rate = num_samples as f64 / count;
            for value in timer.reservoir.samples() {
                emit(sink, line, key, value, "ms", Some(sample_rate));
            }
            timer.reservoir.clear();
        }
    }
}

/// Formats one output line into the shared scratch and hands it to the
/// sink. An oversized line is dropped with a log; the rest of the flush
/// proceeds.
fn emit(
    sink: &mut dyn LineSink,
    scratch: &mut Vec<u8>,
    key: &[u8],
    value: f64,
    tag: &str,
    rate: Option<f64>,
) {
    scratch.clear();
    scratch.extend_from_slice(key);
    scratch.push(b':');
    scratch.extend_from_slice(format_g(value).as_bytes());
    scratch.push(b'|');
    scratch.extend_from_slice(tag.as_bytes());
    if let Some(rate) = rate {
        scratch.push(b'@');
        scratch.extend_from_slice(format_g(rate).as_bytes());
    }
    if scratch.len() > MAX_LINE_LENGTH {
        warn!(
            key = %String::from_utf8_lossy(key),
            len = scratch.len(),
            "flush line exceeds datagram budget, skipping",
        );
        return;
    }
    sink.accept(key, scratch);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::proto::parse;

    fn test_sampler(threshold: i64) -> (Sampler, ManualClock) {
        let cfg = SamplerConfig {
            threshold,
            reservoir_size: threshold.max(0) as usize,
            ..SamplerConfig::default()
        };
        sampler_with(cfg)
    }

    fn sampler_with(cfg: SamplerConfig) -> (Sampler, ManualClock) {
        let clock = ManualClock::new(1_000);
        let sampler = Sampler::with_seed(&cfg, Box::new(clock.clone()), 42)
            .expect("valid settings");
        (sampler, clock)
    }

    fn collect_flush(sampler: &mut Sampler) -> Vec<String> {
        let mut lines = Vec::new();
        let mut sink = |_key: &[u8], line: &[u8]| {
            lines.push(String::from_utf8_lossy(line).into_owned());
        };
        sampler.flush(&mut sink);
        lines
    }

    #[test]
    fn test_negative_threshold_rejected() {
        let cfg = SamplerConfig {
            threshold: -1,
            ..SamplerConfig::default()
        };
        let clock = ManualClock::new(0);
        assert!(Sampler::with_seed(&cfg, Box::new(clock), 1).is_err());
    }

    #[test]
    fn test_counter_threshold_transition_and_flush() {
        let (mut sampler, _clock) = test_sampler(2);
        let line = parse(b"foo:1|c").expect("valid");

        assert_eq!(sampler.consider_counter(&line), Verdict::NotSampling);
        assert_eq!(sampler.consider_counter(&line), Verdict::NotSampling);
        assert_eq!(sampler.consider_counter(&line), Verdict::Sampling);
        assert!(sampler.is_sampling(b"foo", MetricType::Counter));

        let lines = collect_flush(&mut sampler);
        assert_eq!(lines, vec!["foo:1|c@1".to_string()]);

        // Three observations this window kept the bucket sampling; a
        // quiet window drops it back out through the update.
        assert!(sampler.is_sampling(b"foo", MetricType::Counter));
        assert!(collect_flush(&mut sampler).is_empty());
        assert!(!sampler.is_sampling(b"foo", MetricType::Counter));
    }

    #[test]
    fn test_single_observation_window_reenters_observing() {
        let (mut sampler, _clock) = test_sampler(2);
        let line = parse(b"foo:1|c").expect("valid");
        for _ in 0..3 {
            sampler.consider_counter(&line);
        }
        collect_flush(&mut sampler);

        // One observation, then a flush: the update zeroes the window and
        // the bucket leaves the sampling state.
        assert_eq!(sampler.consider_counter(&line), Verdict::Sampling);
        let lines = collect_flush(&mut sampler);
        assert_eq!(lines, vec!["foo:1|c@1".to_string()]);
        assert!(!sampler.is_sampling(b"foo", MetricType::Counter));
    }

    #[test]
    fn test_counter_presample_compensation() {
        let (mut sampler, _clock) = test_sampler(0);
        let warm = parse(b"req:1|c").expect("valid");
        sampler.consider_counter(&warm);

        let line = parse(b"req:2|c|@0.5").expect("valid");
        assert_eq!(sampler.consider_counter(&line), Verdict::Sampling);
        assert_eq!(sampler.consider_counter(&line), Verdict::Sampling);

        // Two events at rate 0.5 reconstruct to sum 8 over count 4.
        let lines = collect_flush(&mut sampler);
        assert_eq!(lines, vec!["req:2|c@0.25".to_string()]);
    }

    #[test]
    fn test_cardinality_flags_new_keys_only() {
        let cfg = SamplerConfig {
            threshold: 2,
            cardinality: 1,
            reservoir_size: 2,
            ..SamplerConfig::default()
        };
        let (mut sampler, _clock) = sampler_with(cfg);

        let a = parse(b"a:1|c").expect("valid");
        let b = parse(b"b:1|c").expect("valid");
        assert_eq!(sampler.consider_counter(&a), Verdict::NotSampling);
        assert_eq!(sampler.consider_counter(&b), Verdict::Flagged);
        assert_eq!(sampler.len(), 1);

        // Established keys keep working at the limit.
        assert_eq!(sampler.consider_counter(&a), Verdict::NotSampling);
    }

    #[test]
    fn test_gauge_emits_mean_without_rate() {
        let (mut sampler, _clock) = test_sampler(1);
        let g1 = parse(b"temp:10|g").expect("valid");
        let g2 = parse(b"temp:20|g").expect("valid");

        sampler.consider_gauge(&g1);
        assert_eq!(sampler.consider_gauge(&g2), Verdict::Sampling);
        assert_eq!(sampler.consider_gauge(&g1), Verdict::Sampling);

        // Sampled values 20 and 10 average to 15.
        let lines = collect_flush(&mut sampler);
        assert_eq!(lines, vec!["temp:15|g".to_string()]);
    }

    #[test]
    fn test_gauge_ignores_presample_rate() {
        let (mut sampler, _clock) = test_sampler(0);
        let warm = parse(b"q:1|g").expect("valid");
        sampler.consider_gauge(&warm);

        let line = parse(b"q:4|g|@0.5").expect("valid");
        sampler.consider_gauge(&line);
        let lines = collect_flush(&mut sampler);
        assert_eq!(lines, vec!["q:4|g".to_string()]);
    }

    #[test]
    fn test_timer_min_max_flush() {
        let cfg = SamplerConfig {
            threshold: 2,
            reservoir_size: 2,
            timer_flush_min_max: true,
            ..SamplerConfig::default()
        };
        let (mut sampler, _clock) = sampler_with(cfg);

        for raw in [&b"lat:10|ms"[..], b"lat:20|ms", b"lat:30|ms", b"lat:5|ms"] {
            let line = parse(raw).expect("valid");
            sampler.consider_timer(&line);
        }
        assert!(sampler.is_sampling(b"lat", MetricType::Timer));

        // 30 became the held upper, 5 the held lower; both flush with
        // their retained rate and reset to the sentinels.
        let lines = collect_flush(&mut sampler);
        assert_eq!(
            lines,
            vec!["lat:30|ms@1".to_string(), "lat:5|ms@1".to_string()]
        );
        assert!(collect_flush(&mut sampler).is_empty());
    }

    #[test]
    fn test_timer_displaced_extrema_reach_the_reservoir() {
        let cfg = SamplerConfig {
            threshold: 1,
            reservoir_size: 4,
            timer_flush_min_max: true,
            ..SamplerConfig::default()
        };
        let (mut sampler, _clock) = sampler_with(cfg);

        for raw in [&b"lat:10|ms"[..], b"lat:20|ms", b"lat:30|ms", b"lat:40|ms"] {
            let line = parse(raw).expect("valid");
            sampler.consider_timer(&line);
        }

        let lines = collect_flush(&mut sampler);
        // Upper ends at 40; 20 was held as the first lower. The values 20
        // and 30 were displaced out of the upper slot in turn, but only
        // one reservoir slot is active at threshold 1.
        assert!(lines.contains(&"lat:40|ms@1".to_string()));
        assert!(lines.contains(&"lat:20|ms@1".to_string()));
        assert_eq!(lines.len(), 3);
        assert!(lines[2].starts_with("lat:30|ms@"));
    }

    #[test]
    fn test_timer_reservoir_rate_reflects_count() {
        let cfg = SamplerConfig {
            threshold: 2,
            reservoir_size: 2,
            timer_flush_min_max: false,
            ..SamplerConfig::default()
        };
        let (mut sampler, _clock) = sampler_with(cfg);

        // Warm past the threshold, then land values between the extrema
        // so they flow into the reservoir.
        for raw in [
            &b"lat:50|ms"[..],
            b"lat:1|ms",
            b"lat:30|ms",
            b"lat:20|ms",
            b"lat:25|ms",
        ] {
            let line = parse(raw).expect("valid");
            sampler.consider_timer(&line);
        }

        // Observations 3..5 were sampled: 30 held as upper then displaced
        // by nothing (30 stays), 20 held as lower, 25 passed through.
        let lines = collect_flush(&mut sampler);
        // min/max flushing is off: only reservoir lines appear.
        assert!(!lines.is_empty());
        for line in &lines {
            assert!(line.starts_with("lat:"), "unexpected line {line}");
            assert!(line.contains("|ms@"), "unexpected line {line}");
        }
    }

    #[test]
    fn test_flush_resets_accumulators() {
        let (mut sampler, _clock) = test_sampler(0);
        let warm = parse(b"k:1|c").expect("valid");
        sampler.consider_counter(&warm);
        let line = parse(b"k:5|c").expect("valid");
        sampler.consider_counter(&line);
        collect_flush(&mut sampler);

        // A second flush with no new observations emits nothing.
        assert!(collect_flush(&mut sampler).is_empty());
    }

    #[test]
    fn test_is_sampling_requires_matching_type() {
        let (mut sampler, _clock) = test_sampler(0);
        let warm = parse(b"k:1|c").expect("valid");
        sampler.consider_counter(&warm);
        let line = parse(b"k:1|c").expect("valid");
        sampler.consider_counter(&line);
        assert!(sampler.is_sampling(b"k", MetricType::Counter));
        assert!(!sampler.is_sampling(b"k", MetricType::Timer));
        assert!(!sampler.is_sampling(b"other", MetricType::Counter));
    }

    #[test]
    fn test_expiry_skips_sampling_buckets() {
        let cfg = SamplerConfig {
            threshold: 0,
            reservoir_size: 0,
            ttl: 60,
            ..SamplerConfig::default()
        };
        let (mut sampler, clock) = sampler_with(cfg);

        let idle = parse(b"idle:1|c").expect("valid");
        let hot = parse(b"hot:1|c").expect("valid");
        sampler.consider_counter(&idle);
        sampler.consider_counter(&hot);
        sampler.consider_counter(&hot);
        assert!(sampler.is_sampling(b"hot", MetricType::Counter));

        clock.advance(61);
        sampler.expire();
        assert_eq!(sampler.len(), 1);
        assert!(sampler.is_sampling(b"hot", MetricType::Counter));

        // Once the update drops it out of sampling, the TTL applies.
        collect_flush(&mut sampler);
        collect_flush(&mut sampler);
        clock.advance(61);
        sampler.expire();
        assert!(sampler.is_empty());
    }

    #[test]
    fn test_expiry_disabled_with_negative_ttl() {
        let cfg = SamplerConfig {
            threshold: 0,
            reservoir_size: 0,
            ttl: -1,
            ..SamplerConfig::default()
        };
        let (mut sampler, clock) = sampler_with(cfg);
        let line = parse(b"k:1|c").expect("valid");
        sampler.consider_counter(&line);
        clock.advance(1_000_000);
        sampler.expire();
        assert_eq!(sampler.len(), 1);
    }

    #[test]
    fn test_expired_key_readmits_as_new() {
        let cfg = SamplerConfig {
            threshold: 0,
            reservoir_size: 0,
            ttl: 10,
            ..SamplerConfig::default()
        };
        let (mut sampler, clock) = sampler_with(cfg);
        let line = parse(b"k:1|c").expect("valid");
        sampler.consider_counter(&line);
        clock.advance(11);
        sampler.expire();
        assert!(sampler.is_empty());
        assert_eq!(sampler.consider_counter(&line), Verdict::NotSampling);
        assert_eq!(sampler.len(), 1);
    }

    #[test]
    fn test_type_mismatch_guard() {
        let (mut sampler, _clock) = test_sampler(0);
        let counter = parse(b"k:1|c").expect("valid");
        assert_eq!(sampler.consider_timer(&counter), Verdict::NotSampling);
        assert_eq!(sampler.consider_gauge(&counter), Verdict::NotSampling);
        assert!(sampler.is_empty());
    }
}
