use std::cmp::Ordering;
use std::fmt;
use std::ops::Mul;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

pub const PROTON: f64 = 1.00727646677;
/// Spacing between successive isotope peaks of a singly charged ion
pub const NEUTRON: f64 = 1.00335;

const ONE_PPM: f64 = 1e-6;

/// Symmetric matching window, either relative (ppm) or absolute (Da)
#[derive(Copy, Clone, Serialize, Deserialize, Debug, PartialEq, PartialOrd)]
#[serde(rename_all = "lowercase")]
pub enum Tolerance {
    Ppm(f64),
    #[serde(alias = "mz", alias = "m/z")]
    Da(f64),
}

impl Tolerance {
    /// Create a tolerance from a value and a unit name (`ppm`, `da`, `mz`, `m/z`)
    pub fn new(value: f64, unit: &str) -> Result<Self, Error> {
        if !value.is_finite() || value < 0.0 {
            return Err(Error::InvalidTolerance(value.to_string()));
        }
        match unit.trim().to_ascii_lowercase().as_str() {
            "ppm" => Ok(Tolerance::Ppm(value)),
            "da" | "mz" | "m/z" => Ok(Tolerance::Da(value)),
            _ => Err(Error::UnknownUnit(unit.trim().into())),
        }
    }

    pub fn is_relative(&self) -> bool {
        matches!(self, Tolerance::Ppm(_))
    }

    pub fn value(&self) -> f64 {
        match self {
            Tolerance::Ppm(v) | Tolerance::Da(v) => *v,
        }
    }

    /// Half-width of the window (in Da) around `v`
    pub fn absolute_error(&self, v: f64) -> f64 {
        match self {
            Tolerance::Ppm(ppm) => v * ONE_PPM * ppm,
            Tolerance::Da(da) => *da,
        }
    }

    /// Compute the (`lower`, `upper`) window (in Da) for a mass
    pub fn bounds(&self, center: f64) -> (f64, f64) {
        self.bounds_with_reference(center, center)
    }

    /// Window centered on `center`, but sized as if `reference` was measured.
    /// Only relevant for ppm tolerances.
    pub fn bounds_with_reference(&self, center: f64, reference: f64) -> (f64, f64) {
        (
            self.min_range_with_reference(center, reference),
            self.max_range_with_reference(center, reference),
        )
    }

    pub fn min_range(&self, v: f64) -> f64 {
        v - self.absolute_error(v)
    }

    pub fn max_range(&self, v: f64) -> f64 {
        v + self.absolute_error(v)
    }

    pub fn min_range_with_reference(&self, center: f64, reference: f64) -> f64 {
        center - self.absolute_error(reference)
    }

    pub fn max_range_with_reference(&self, center: f64, reference: f64) -> f64 {
        center + self.absolute_error(reference)
    }

    /// Full width of the window at `v`
    pub fn range_size(&self, v: f64) -> f64 {
        2.0 * self.absolute_error(v)
    }

    pub fn contains(&self, center: f64, rhs: f64) -> bool {
        let (lo, hi) = self.bounds(center);
        rhs >= lo && rhs <= hi
    }

    /// Compare two values under this tolerance. [`Ordering::Equal`] means
    /// that they are within tolerance of each other.
    ///
    /// Relative windows are computed from the larger of the two values, so
    /// `compare(a, b) == compare(b, a).reverse()` always holds.
    pub fn compare(&self, a: f64, b: f64) -> Ordering {
        match self {
            Tolerance::Ppm(_) => {
                if a > b {
                    if a - self.absolute_error(a) > b {
                        Ordering::Greater
                    } else {
                        Ordering::Equal
                    }
                } else if b - self.absolute_error(b) > a {
                    Ordering::Less
                } else {
                    Ordering::Equal
                }
            }
            Tolerance::Da(da) => {
                if a + da < b {
                    Ordering::Less
                } else if a - da > b {
                    Ordering::Greater
                } else {
                    Ordering::Equal
                }
            }
        }
    }

    /// Compare two values, where both of them carry an error. [`Ordering::Equal`]
    /// means that their windows overlap.
    pub fn compare_double_error(&self, a: f64, b: f64) -> Ordering {
        let (a_lo, a_hi) = self.bounds(a);
        let (b_lo, b_hi) = self.bounds(b);
        if a_hi < b_lo {
            Ordering::Less
        } else if b_hi < a_lo {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }

    /// Smallest distance between `a` and `b` that is still consistent with
    /// the tolerance, never below 0 and never above `|a - b|`
    pub fn min_diff(&self, a: f64, b: f64) -> f64 {
        let raw = (b - a).abs();
        let diff = match self {
            Tolerance::Ppm(_) => {
                let (hi, lo) = if a > b { (a, b) } else { (b, a) };
                let err = self.absolute_error(hi);
                (hi - err) - (lo + err)
            }
            Tolerance::Da(da) => raw - da,
        };
        diff.max(0.0).min(raw)
    }

    /// Signed error of `experimental` against `reference`, in the unit of
    /// this tolerance (ppm or Da)
    pub fn error(&self, experimental: f64, reference: f64) -> f64 {
        match self {
            Tolerance::Ppm(_) => (reference - experimental) / reference * 1_000_000.0,
            Tolerance::Da(_) => reference - experimental,
        }
    }
}

impl Mul<f64> for Tolerance {
    type Output = Tolerance;

    fn mul(self, rhs: f64) -> Self::Output {
        match self {
            Tolerance::Ppm(v) => Tolerance::Ppm(v * rhs),
            Tolerance::Da(v) => Tolerance::Da(v * rhs),
        }
    }
}

impl FromStr for Tolerance {
    type Err = Error;

    /// Parse strings like `10 ppm`, `0.02da` or `0.5 m/z`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.')
            .collect::<String>();
        let unit = s
            .chars()
            .filter(|c| !(c.is_ascii_digit() || *c == '.' || *c == ',' || c.is_whitespace()))
            .collect::<String>();
        let value = value
            .parse::<f64>()
            .map_err(|_| Error::InvalidTolerance(s.trim().into()))?;
        Tolerance::new(value, &unit)
    }
}

impl fmt::Display for Tolerance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tolerance::Ppm(v) => write!(f, "{} ppm", v),
            Tolerance::Da(v) => write!(f, "{} da", v),
        }
    }
}

/// Convert a neutral mass into the m/z of the `charge`-times protonated ion
pub fn mass_to_mz(mass: f64, charge: u8) -> f64 {
    (mass + charge as f64 * PROTON) / charge as f64
}

/// Convert the m/z of a `charge`-times protonated ion into its neutral mass
pub fn mz_to_mass(mz: f64, charge: u8) -> f64 {
    (mz - PROTON) * charge as f64
}
