use crate::proto::MetricType;

use super::reservoir::Reservoir;

/// Initial value of a timer's running maximum. Any positive observation
/// replaces it; the sentinel doubles as the "never set" marker at flush.
pub const UPPER_SENTINEL: f64 = f64::MIN_POSITIVE;

/// Initial value of a timer's running minimum.
pub const LOWER_SENTINEL: f64 = f64::MAX;

/// Extremum and reservoir state carried only by timer buckets.
#[derive(Debug)]
pub struct TimerState {
    /// Largest value seen in the current window.
    pub upper: f64,
    /// Smallest value seen in the current window.
    pub lower: f64,
    /// Client pre-sample rate retained alongside `upper` so the relayed
    /// extremum keeps its original weight.
    pub upper_sample_rate: f64,
    pub lower_sample_rate: f64,
    pub reservoir: Reservoir,
}

impl TimerState {
    fn new(capacity: usize, active: usize) -> Self {
        Self {
            upper: UPPER_SENTINEL,
            lower: LOWER_SENTINEL,
            upper_sample_rate: 1.0,
            lower_sample_rate: 1.0,
            reservoir: Reservoir::new(capacity, active),
        }
    }

    /// Whether either extremum has been set since the last flush.
    pub fn has_extrema(&self) -> bool {
        self.upper > UPPER_SENTINEL || self.lower < LOWER_SENTINEL
    }
}

/// Kind-specific state. The variant never changes after admission.
#[derive(Debug)]
pub enum BucketKind {
    Counter,
    Gauge,
    Timer(TimerState),
}

/// Per-key aggregation and sampling state.
#[derive(Debug)]
pub struct Bucket {
    pub kind: BucketKind,
    /// Circuit state: while false the bucket accumulates nothing.
    pub sampling: bool,
    /// Observations since the last window tick.
    pub last_window_count: u64,
    /// Pre-sample-compensated accumulated value.
    pub sum: f64,
    /// Pre-sample-compensated event count.
    pub count: f64,
    /// Seconds since epoch of the last touch, for TTL expiry.
    pub last_modified_at: u64,
}

impl Bucket {
    pub fn counter(now: u64) -> Self {
        Self::new(BucketKind::Counter, now)
    }

    pub fn gauge(now: u64) -> Self {
        Self::new(BucketKind::Gauge, now)
    }

    pub fn timer(now: u64, capacity: usize, active: usize) -> Self {
        Self::new(BucketKind::Timer(TimerState::new(capacity, active)), now)
    }

    fn new(kind: BucketKind, now: u64) -> Self {
        Self {
            kind,
            sampling: false,
            last_window_count: 1,
            sum: 0.0,
            count: 0.0,
            last_modified_at: now,
        }
    }

    pub fn metric_type(&self) -> MetricType {
        match self.kind {
            BucketKind::Counter => MetricType::Counter,
            BucketKind::Gauge => MetricType::Gauge,
            BucketKind::Timer(_) => MetricType::Timer,
        }
    }
}
