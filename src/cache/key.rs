//! Cache key derivation.
//!
//! A [`CacheKey`] is `orrery:v1:<operation>:<sha256-hex>`. The digest covers
//! the canonical form of every request field that can change the result.
//!
//! # Canonicalization
//!
//! | field | rule |
//! |---|---|
//! | free text (name, city, chart type, house system, planet names) | whitespace runs collapsed, trimmed, lowercased |
//! | nation | trimmed, uppercased |
//! | timezone | trimmed, lowercased; absent == empty |
//! | latitude / longitude | fixed-point, 4 decimal places; `-0` == `0` |
//! | orb limit | fixed-point, 2 decimal places |
//! | planet filter | canonical names, sorted, deduplicated; absent == empty |
//!
//! Fields are written as tagged, length-prefixed records, so `("ab", "c")`
//! and `("a", "bc")` can never hash alike.

use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::types::{BirthData, ChartOptions, ComputeRequest, Moment, Operation, TransitOptions};

/// Decimal places kept for coordinates (1e-4 degrees is about 11 metres).
const COORDINATE_SCALE: f64 = 1e4;

/// Decimal places kept for orb limits.
const ORB_SCALE: f64 = 1e2;

/// Stable identity of a computation result.
///
/// Cheap to clone; usable directly as a key in the L1 map and as the key
/// string in the shared store.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Leading text shared by every key. The version segment is bumped
    /// whenever the canonical form changes, orphaning old shared entries.
    pub const PREFIX: &'static str = "orrery:v1:";

    /// Derive a key from an operation and its canonical fields.
    pub fn derive(operation: Operation, canonical: &CanonicalHasher) -> Self {
        let digest = canonical.digest();
        Self(format!("{}{}:{}", Self::PREFIX, operation.as_str(), hex::encode(digest)).into())
    }

    /// Derive the key for a request.
    pub fn for_request(request: &ComputeRequest) -> Self {
        let mut hasher = CanonicalHasher::new();
        match request {
            ComputeRequest::Subject(subject) => {
                write_birth_data(&mut hasher, subject);
            }
            ComputeRequest::NatalChart { subject, options } => {
                write_birth_data(&mut hasher, subject);
                write_chart_options(&mut hasher, options);
            }
            ComputeRequest::Transits { natal, options } => {
                write_birth_data(&mut hasher, natal);
                write_transit_options(&mut hasher, options);
            }
        }
        Self::derive(request.operation(), &hasher)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Incremental SHA-256 over tagged, length-prefixed canonical fields.
#[derive(Clone)]
pub struct CanonicalHasher {
    hasher: Sha256,
}

impl CanonicalHasher {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    /// Write a string as-is (callers canonicalize first).
    pub fn write_str(&mut self, tag: &str, value: &str) -> &mut Self {
        self.record(tag, b's', value.as_bytes())
    }

    pub fn write_i64(&mut self, tag: &str, value: i64) -> &mut Self {
        self.record(tag, b'i', &value.to_be_bytes())
    }

    pub fn write_bool(&mut self, tag: &str, value: bool) -> &mut Self {
        self.record(tag, b'b', &[u8::from(value)])
    }

    /// Write an optional integer; `None` is distinct from every `Some`.
    pub fn write_opt_i64(&mut self, tag: &str, value: Option<i64>) -> &mut Self {
        match value {
            Some(v) => self.write_i64(tag, v),
            None => self.record(tag, b'n', &[]),
        }
    }

    fn record(&mut self, tag: &str, kind: u8, bytes: &[u8]) -> &mut Self {
        self.hasher.update((tag.len() as u64).to_be_bytes());
        self.hasher.update(tag.as_bytes());
        self.hasher.update([kind]);
        self.hasher.update((bytes.len() as u64).to_be_bytes());
        self.hasher.update(bytes);
        self
    }

    fn digest(&self) -> [u8; 32] {
        self.hasher.clone().finalize().into()
    }
}

impl Default for CanonicalHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Collapse whitespace runs, trim and lowercase.
pub fn canonical_text(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Round to a fixed number of decimals and return the scaled integer.
///
/// Total: NaN maps to 0 and infinities saturate.
pub fn quantize(value: f64, scale: f64) -> i64 {
    let scaled = (value * scale).round();
    // `-0.0 as i64` is already 0; NaN casts to 0 as well.
    scaled as i64
}

fn write_moment(hasher: &mut CanonicalHasher, prefix: &str, moment: &Moment) {
    hasher
        .write_i64(&format!("{prefix}.year"), i64::from(moment.year))
        .write_i64(&format!("{prefix}.month"), i64::from(moment.month))
        .write_i64(&format!("{prefix}.day"), i64::from(moment.day))
        .write_i64(&format!("{prefix}.hour"), i64::from(moment.hour))
        .write_i64(&format!("{prefix}.minute"), i64::from(moment.minute));
}

fn write_birth_data(hasher: &mut CanonicalHasher, subject: &BirthData) {
    let timezone = subject
        .timezone
        .as_deref()
        .map(|tz| tz.trim().to_lowercase())
        .unwrap_or_default();

    hasher.write_str("subject.name", &canonical_text(&subject.name));
    write_moment(hasher, "subject", &subject.moment());
    hasher
        .write_str("subject.city", &canonical_text(&subject.city))
        .write_str("subject.nation", &subject.nation.trim().to_uppercase())
        .write_str("subject.timezone", &timezone)
        .write_opt_i64(
            "subject.latitude",
            subject.latitude.map(|v| quantize(v, COORDINATE_SCALE)),
        )
        .write_opt_i64(
            "subject.longitude",
            subject.longitude.map(|v| quantize(v, COORDINATE_SCALE)),
        );
}

fn write_chart_options(hasher: &mut CanonicalHasher, options: &ChartOptions) {
    hasher
        .write_str("chart.type", &canonical_text(&options.chart_type))
        .write_str("chart.house_system", &canonical_text(&options.house_system))
        .write_bool("chart.include_aspects", options.include_aspects);
}

fn write_transit_options(hasher: &mut CanonicalHasher, options: &TransitOptions) {
    write_moment(hasher, "transit", &options.moment);
    hasher.write_i64("transit.orb_limit", quantize(options.orb_limit, ORB_SCALE));

    let mut planets: Vec<String> = options
        .planets
        .iter()
        .flatten()
        .map(|p| canonical_text(p))
        .filter(|p| !p.is_empty())
        .collect();
    planets.sort();
    planets.dedup();
    hasher.write_i64("transit.planets.len", planets.len() as i64);
    for planet in &planets {
        hasher.write_str("transit.planet", planet);
    }
}
