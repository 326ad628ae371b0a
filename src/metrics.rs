//! Violation Potential (VP): how far measured behavior falls from the
//! accepted operating envelope.
//!
//! VP is a pure function of its inputs. Traits are visited in key order
//! (all maps here are `BTreeMap`), so the floating-point sum is
//! bit-reproducible for identical inputs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Tolerance under which two trait values are considered equal.
pub const EPSILON: f64 = 1e-10;

/// Measured trait values keyed by trait name (`speed_ms`, `memory_mb`, ...).
pub type TraitVector = BTreeMap<String, f64>;

/// Ideal value per trait.
pub type StabilityCenter = BTreeMap<String, f64>;

/// Per-trait weight applied to the overflow ratio. Missing traits weigh 1.0.
pub type Weights = BTreeMap<String, f64>;

/// Errors produced when building an envelope.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EnvelopeError {
    /// Lower bound exceeds upper bound.
    #[error("envelope for trait '{name}' is inverted: low {low} > high {high}")]
    Inverted {
        /// Trait name.
        name: String,
        /// Lower bound.
        low: f64,
        /// Upper bound.
        high: f64,
    },
    /// A bound is NaN or infinite.
    #[error("envelope for trait '{name}' has a non-finite bound")]
    NonFinite {
        /// Trait name.
        name: String,
    },
}

/// Inclusive tolerance interval for one trait. `low == high` means the
/// trait must hit its ideal exactly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bound {
    low: f64,
    high: f64,
}

impl Bound {
    /// Build a bound, rejecting inverted or non-finite intervals.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError`] when `low > high` or either bound is not finite.
    pub fn new(name: &str, low: f64, high: f64) -> Result<Self, EnvelopeError> {
        if !low.is_finite() || !high.is_finite() {
            return Err(EnvelopeError::NonFinite {
                name: name.to_owned(),
            });
        }
        if low > high {
            return Err(EnvelopeError::Inverted {
                name: name.to_owned(),
                low,
                high,
            });
        }
        Ok(Self { low, high })
    }

    /// Lower bound.
    pub fn low(&self) -> f64 {
        self.low
    }

    /// Upper bound.
    pub fn high(&self) -> f64 {
        self.high
    }

    /// Whether this is a zero-tolerance (exact value) trait.
    pub fn is_exact(&self) -> bool {
        (self.high - self.low).abs() < EPSILON
    }
}

/// Tolerance envelope: trait name to inclusive `(low, high)` bound.
///
/// Serialized as a map of two-element arrays, e.g.
/// `{"speed_ms": [0.0, 10.0], "reliability": [1.0, 1.0]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, (f64, f64)>",
    into = "BTreeMap<String, (f64, f64)>"
)]
pub struct StabilityEnvelope {
    bounds: BTreeMap<String, Bound>,
}

impl StabilityEnvelope {
    /// Build an envelope from `(trait, low, high)` triples.
    ///
    /// # Errors
    ///
    /// Returns the first invalid bound encountered.
    pub fn from_bounds<'a, I>(bounds: I) -> Result<Self, EnvelopeError>
    where
        I: IntoIterator<Item = (&'a str, f64, f64)>,
    {
        let mut envelope = Self::default();
        for (name, low, high) in bounds {
            envelope.insert(name, low, high)?;
        }
        Ok(envelope)
    }

    /// Insert or replace the bound for one trait.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError`] if the bound is invalid; the envelope is
    /// left unchanged in that case.
    pub fn insert(&mut self, name: &str, low: f64, high: f64) -> Result<(), EnvelopeError> {
        let bound = Bound::new(name, low, high)?;
        self.bounds.insert(name.to_owned(), bound);
        Ok(())
    }

    /// Bound for a trait, if the envelope covers it.
    pub fn get(&self, name: &str) -> Option<&Bound> {
        self.bounds.get(name)
    }

    /// Iterate bounds in trait-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bound)> {
        self.bounds.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of traits covered.
    pub fn len(&self) -> usize {
        self.bounds.len()
    }

    /// Whether the envelope covers no traits.
    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }
}

impl TryFrom<BTreeMap<String, (f64, f64)>> for StabilityEnvelope {
    type Error = EnvelopeError;

    fn try_from(raw: BTreeMap<String, (f64, f64)>) -> Result<Self, Self::Error> {
        let mut bounds = BTreeMap::new();
        for (name, (low, high)) in raw {
            let bound = Bound::new(&name, low, high)?;
            bounds.insert(name, bound);
        }
        Ok(Self { bounds })
    }
}

impl From<StabilityEnvelope> for BTreeMap<String, (f64, f64)> {
    fn from(envelope: StabilityEnvelope) -> Self {
        envelope
            .bounds
            .into_iter()
            .map(|(name, b)| (name, (b.low, b.high)))
            .collect()
    }
}

/// Per-trait deviation ratio.
///
/// For an exact trait (`hi - lo` within [`EPSILON`]) this is 0 at the ideal
/// and 1 for any deviation. Otherwise it is the distance from the ideal
/// scaled by the envelope width, plus the overflow beyond the envelope
/// scaled the same way.
pub fn overflow_ratio(actual: f64, ideal: f64, lo: f64, hi: f64) -> f64 {
    let width = hi - lo;
    if width.abs() < EPSILON {
        return if (actual - ideal).abs() < EPSILON {
            0.0
        } else {
            1.0
        };
    }

    let base = (actual - ideal).abs() / width;
    let extra = if actual < lo {
        (lo - actual) / width
    } else if actual > hi {
        (actual - hi) / width
    } else {
        0.0
    };
    base + extra
}

/// One trait's share of a VP total.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraitContribution {
    /// Trait name.
    pub name: String,
    /// Measured value.
    pub actual: f64,
    /// Ideal value from the center (0.0 when the center omits the trait).
    pub ideal: f64,
    /// Envelope lower bound.
    pub low: f64,
    /// Envelope upper bound.
    pub high: f64,
    /// Weighted overflow ratio.
    pub part: f64,
}

/// A VP total with its per-trait breakdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VpBreakdown {
    /// Sum of all contributions.
    pub total: f64,
    /// Contributions in trait-name order.
    pub parts: Vec<TraitContribution>,
}

/// Compute VP with its per-trait breakdown.
///
/// Only traits present in both the envelope and `actual` contribute;
/// missing telemetry is not penalized. A trait absent from `center` has
/// ideal 0.0. Traits absent from `weights` weigh 1.0.
pub fn vp_breakdown(
    actual: &TraitVector,
    center: &StabilityCenter,
    envelope: &StabilityEnvelope,
    weights: Option<&Weights>,
) -> VpBreakdown {
    let mut total = 0.0;
    let mut parts = Vec::with_capacity(envelope.len());

    for (name, bound) in envelope.iter() {
        let Some(&value) = actual.get(name) else {
            continue;
        };
        let ideal = center.get(name).copied().unwrap_or(0.0);
        let weight = weights
            .and_then(|w| w.get(name).copied())
            .unwrap_or(1.0);
        let part = overflow_ratio(value, ideal, bound.low(), bound.high()) * weight;
        total += part;
        parts.push(TraitContribution {
            name: name.to_owned(),
            actual: value,
            ideal,
            low: bound.low(),
            high: bound.high(),
            part,
        });
    }

    VpBreakdown { total, parts }
}

/// Compute the Violation Potential of a trait vector.
pub fn calculate_vp(
    actual: &TraitVector,
    center: &StabilityCenter,
    envelope: &StabilityEnvelope,
    weights: Option<&Weights>,
) -> f64 {
    vp_breakdown(actual, center, envelope, weights).total
}
