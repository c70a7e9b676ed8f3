use memchr::{memchr, memrchr};
use thiserror::Error;

/// Largest line accepted on ingest and emitted on flush, in bytes.
///
/// Matches the datagram budget of the downstream forwarder, so any line the
/// parser accepts can always be relayed unmodified.
pub const MAX_LINE_LENGTH: usize = 1432;

/// Metric type tag of a statsd line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricType {
    Counter,
    Timer,
    Kv,
    Gauge,
    Hist,
    Set,
}

impl MetricType {
    /// Maps a wire tag to its type. Tags outside the closed set are invalid.
    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"c" => Some(Self::Counter),
            b"ms" => Some(Self::Timer),
            b"kv" => Some(Self::Kv),
            b"g" => Some(Self::Gauge),
            b"h" => Some(Self::Hist),
            b"s" => Some(Self::Set),
            _ => None,
        }
    }

    /// Human-readable name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Timer => "timer",
            Self::Kv => "kv",
            Self::Gauge => "gauge",
            Self::Hist => "histogram",
            Self::Set => "set",
        }
    }
}

/// Why a line failed validation. All variants map to the same caller
/// policy: drop the line and count it.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("line exceeds {MAX_LINE_LENGTH} bytes")]
    LineTooLong,
    #[error("missing ':' delimiter")]
    MissingColon,
    #[error("zero length key")]
    EmptyKey,
    #[error("value is not a finite double")]
    InvalidValue,
    #[error("missing '|' delimiter")]
    MissingPipe,
    #[error("unknown type tag")]
    UnknownType,
    #[error("trailing segment without '@' rate marker")]
    MissingRateMarker,
    #[error("invalid sample rate")]
    InvalidSampleRate,
}

/// A validated statsd line. Borrows its key from the input buffer; parsing
/// allocates nothing and never mutates the input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParsedLine<'a> {
    pub key: &'a [u8],
    pub value: f64,
    /// Sampling probability already applied by the client, in (0, 1].
    pub presample: f64,
    pub kind: MetricType,
}

/// Parses one line of the form `<key>:<value>|<type>[|@<rate>]`.
///
/// Keys may embed tag syntax containing ':' (`ns.__tag=k:v:42|ms`), so the
/// key/value delimiter is the rightmost ':' in the line; scanning forward
/// would split tagged keys in the wrong place.
pub fn parse(line: &[u8]) -> Result<ParsedLine<'_>, ParseError> {
    if line.len() > MAX_LINE_LENGTH {
        return Err(ParseError::LineTooLong);
    }

    let colon = memrchr(b':', line).ok_or(ParseError::MissingColon)?;
    if colon == 0 {
        return Err(ParseError::EmptyKey);
    }
    let key = &line[..colon];
    let rest = &line[colon + 1..];

    let pipe = memchr(b'|', rest).ok_or(ParseError::MissingPipe)?;
    let value: f64 =
        lexical::parse(&rest[..pipe]).map_err(|_| ParseError::InvalidValue)?;
    if !value.is_finite() {
        return Err(ParseError::InvalidValue);
    }

    let tail = &rest[pipe + 1..];
    let (tag, rate_segment) = match memchr(b'|', tail) {
        Some(i) => (&tail[..i], Some(&tail[i + 1..])),
        None => (tail, None),
    };
    let kind = MetricType::from_tag(tag).ok_or(ParseError::UnknownType)?;

    let presample = match rate_segment {
        None => 1.0,
        Some(segment) => {
            if segment.first() != Some(&b'@') {
                return Err(ParseError::MissingRateMarker);
            }
            let raw = &segment[1..];
            if raw.is_empty() {
                return Err(ParseError::InvalidSampleRate);
            }
            let rate: f64 =
                lexical::parse(raw).map_err(|_| ParseError::InvalidSampleRate)?;
            if !rate.is_finite() || rate <= 0.0 || rate > 1.0 {
                return Err(ParseError::InvalidSampleRate);
            }
            rate
        }
    };

    Ok(ParsedLine {
        key,
        value,
        presample,
        kind,
    })
}
