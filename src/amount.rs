//! Fixed-point amount arithmetic.
//!
//! Every price and size in the engine is an [`Amount`]: a decimal normalized
//! to eight fractional digits with exact comparison and arithmetic. Scaling
//! by a float factor (`ratio`) is the only lossy operation and rounds toward
//! zero deterministically.

use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, Mul, Neg, Sub, SubAssign};

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Fractional digits retained by every `Amount`.
pub const AMOUNT_SCALE: u32 = 8;

/// A fixed-point decimal with eight fractional digits.
///
/// Construction normalizes the value: extra decimals are truncated toward
/// zero and the scale is padded to exactly eight digits, so `Display` output
/// is stable (`1.5` renders as `1.50000000`). Callers that must detect
/// truncation compare the rendered length against their input literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(Decimal);

impl Amount {
    pub const ZERO: Amount = Amount(Decimal::ZERO);

    /// One smallest representable unit (1e-8).
    pub const SATOSHI: Amount = Amount(Decimal::from_parts(1, 0, 0, false, AMOUNT_SCALE));

    /// Parse a decimal literal. Returns `None` for unparseable input.
    pub fn parse(s: &str) -> Option<Amount> {
        s.trim().parse::<Decimal>().ok().map(Amount::from_decimal)
    }

    /// Normalize an arbitrary `Decimal` into an `Amount`.
    pub fn from_decimal(d: Decimal) -> Amount {
        let mut d = d.round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::ToZero);
        d.rescale(AMOUNT_SCALE);
        Amount(d)
    }

    pub fn from_int(v: i64) -> Amount {
        Amount::from_decimal(Decimal::from(v))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_zero_or_less(&self) -> bool {
        self.0 <= Decimal::ZERO
    }

    pub fn is_positive(&self) -> bool {
        self.0 > Decimal::ZERO
    }

    /// Scale by a floating-point factor, truncating the product toward zero.
    ///
    /// Lossy by contract, but monotonic: for fixed `r > 0`, a larger amount
    /// never yields a smaller result. Non-finite factors yield zero.
    pub fn ratio(&self, r: f64) -> Amount {
        match Decimal::from_f64(r) {
            Some(factor) => Amount::from_decimal(self.0 * factor),
            None => Amount::ZERO,
        }
    }

    /// Round down to an integer multiple of `tick`.
    ///
    /// A nonpositive ticksize silently yields zero.
    pub fn truncated_by_ticksize(&self, tick: Amount) -> Amount {
        if tick.is_zero_or_less() {
            return Amount::ZERO;
        }
        let steps = (self.0 / tick.0).floor();
        Amount::from_decimal(steps * tick.0)
    }

    pub fn min(self, other: Amount) -> Amount {
        if self <= other {
            self
        } else {
            other
        }
    }

    pub fn max(self, other: Amount) -> Amount {
        if self >= other {
            self
        } else {
            other
        }
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add for Amount {
    type Output = Amount;
    fn add(self, rhs: Amount) -> Amount {
        Amount::from_decimal(self.0 + rhs.0)
    }
}

impl Sub for Amount {
    type Output = Amount;
    fn sub(self, rhs: Amount) -> Amount {
        Amount::from_decimal(self.0 - rhs.0)
    }
}

impl Mul for Amount {
    type Output = Amount;
    fn mul(self, rhs: Amount) -> Amount {
        Amount::from_decimal(self.0 * rhs.0)
    }
}

impl Div for Amount {
    type Output = Amount;
    fn div(self, rhs: Amount) -> Amount {
        if rhs.0.is_zero() {
            return Amount::ZERO;
        }
        Amount::from_decimal(self.0 / rhs.0)
    }
}

impl Neg for Amount {
    type Output = Amount;
    fn neg(self) -> Amount {
        Amount::from_decimal(-self.0)
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, rhs: Amount) {
        *self = *self + rhs;
    }
}

impl SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Amount) {
        *self = *self - rhs;
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        iter.fold(Amount::ZERO, |acc, a| acc + a)
    }
}
