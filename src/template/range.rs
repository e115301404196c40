// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Range descriptors and value synthesis.
//!
//! A template attribute declares its value space as text:
//!
//! - `"37"`: a fixed value, returned unchanged
//! - `"-10~40"`: an interval, sampled uniformly and rounded by span width
//!
//! Anything else degrades to a uniform value in `[0, 100)`.

use std::fmt;

use rand::Rng;
use serde_json::Value;

use crate::error::ParseError;

/// Upper bound (exclusive) of the fallback value space.
const FALLBACK_SPAN: f64 = 100.0;

/// A parsed range descriptor.
///
/// # Examples
///
/// ```
/// use sensim_lib::template::RangeSpec;
///
/// let spec = RangeSpec::parse("-10 ~ 40")?;
/// assert_eq!(spec, RangeSpec::Interval { min: -10.0, max: 40.0 });
/// assert_eq!(spec.decimals(), Some(2));
///
/// let fixed = RangeSpec::parse("37")?;
/// assert_eq!(fixed.sample(), 37.0);
/// # Ok::<(), sensim_lib::ParseError>(())
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RangeSpec {
    /// A single fixed value.
    Fixed(f64),
    /// An interval sampled as `[min, max)`.
    Interval {
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },
}

impl RangeSpec {
    /// Parses range text.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidRange`] if the text is not a finite
    /// number or a `min~max` pair of finite numbers.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        if !text.contains('~') {
            return parse_bound(text, text).map(Self::Fixed);
        }

        let mut parts = text.split('~');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(min), Some(max), None) => Ok(Self::Interval {
                min: parse_bound(text, min)?,
                max: parse_bound(text, max)?,
            }),
            _ => Err(ParseError::InvalidRange {
                range: text.to_string(),
                message: "expected exactly one '~'".to_string(),
            }),
        }
    }

    /// Parses the `range` field of a template node.
    ///
    /// Strings are parsed as range text and numbers are taken as fixed
    /// values. Returns `Ok(None)` for an absent or null field.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidRange`] for any other shape.
    pub fn from_value(value: Option<&Value>) -> Result<Option<Self>, ParseError> {
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(text)) => Self::parse(text).map(Some),
            Some(Value::Number(n)) => Self::parse(&n.to_string()).map(Some),
            Some(other) => Err(ParseError::InvalidRange {
                range: other.to_string(),
                message: "range must be a string or a number".to_string(),
            }),
        }
    }

    /// Returns the number of decimals interval samples are rounded to.
    ///
    /// Spans wider than 100 keep one decimal, spans wider than 10 keep two,
    /// narrower spans keep three. Fixed values are not rounded.
    #[must_use]
    pub fn decimals(&self) -> Option<i32> {
        match *self {
            Self::Fixed(_) => None,
            Self::Interval { min, max } => {
                let width = (max - min).abs();
                Some(if width > 100.0 {
                    1
                } else if width > 10.0 {
                    2
                } else {
                    3
                })
            }
        }
    }

    /// Draws a value using the thread-local generator.
    #[must_use]
    pub fn sample(&self) -> f64 {
        self.sample_with(&mut rand::rng())
    }

    /// Draws a value using the given generator.
    ///
    /// The result always lies within the declared bounds, inclusive.
    pub fn sample_with<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match *self {
            Self::Fixed(value) => value,
            Self::Interval { min, max } => {
                let r = rng.random::<f64>();
                let raw = min * (1.0 - r) + max * r;
                let decimals = self.decimals().unwrap_or(3);
                let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
                round_half_up(raw, decimals).clamp(lo, hi)
            }
        }
    }
}

impl fmt::Display for RangeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(value) => write!(f, "{value}"),
            Self::Interval { min, max } => write!(f, "{min}~{max}"),
        }
    }
}

/// Synthesizes a reading from a template `range` field.
///
/// See [`synthesize_with`].
#[must_use]
pub fn synthesize(range: Option<&Value>) -> f64 {
    synthesize_with(range, &mut rand::rng())
}

/// Synthesizes a reading from a template `range` field using `rng`.
///
/// Absent or null ranges yield a uniform value in `[0, 100)`. Ranges that
/// cannot be parsed are logged and yield the same fallback.
pub fn synthesize_with<R: Rng + ?Sized>(range: Option<&Value>, rng: &mut R) -> f64 {
    match RangeSpec::from_value(range) {
        Ok(Some(spec)) => spec.sample_with(rng),
        Ok(None) => fallback_value(rng),
        Err(e) => {
            tracing::warn!(error = %e, "Invalid range format, using random value");
            fallback_value(rng)
        }
    }
}

/// Uniform value in `[0, 100)`.
pub fn fallback_value<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    rng.random::<f64>() * FALLBACK_SPAN
}

fn parse_bound(range: &str, part: &str) -> Result<f64, ParseError> {
    let trimmed = part.trim();
    match trimmed.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        Ok(_) => Err(ParseError::InvalidRange {
            range: range.to_string(),
            message: format!("{trimmed:?} is not finite"),
        }),
        Err(e) => Err(ParseError::InvalidRange {
            range: range.to_string(),
            message: format!("{trimmed:?}: {e}"),
        }),
    }
}

fn round_half_up(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    let scaled = value * factor;
    if !scaled.is_finite() {
        return value;
    }
    (scaled + 0.5).floor() / factor
}
