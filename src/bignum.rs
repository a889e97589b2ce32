//! Arbitrary-precision rational numbers for constant arithmetic
//!
//! `BigNum` stores a rational in canonical form (numerator and denominator
//! coprime, denominator positive). The semantic analyzer folds literals with
//! it and the optimizer uses it for constant propagation, so conversions to
//! machine types must be exact or explicitly rejected: `representable_as`
//! answers whether a lossless conversion to a target integer or float type
//! exists.

use std::fmt;
use std::ops::{Add, AddAssign, Div, DivAssign, Mul, MulAssign, Neg, Sub, SubAssign};
use std::str::FromStr;

use num_bigint::{BigInt, Sign};
use num_rational::BigRational;
use num_traits::{One, Signed, ToPrimitive, Zero};

/// An arbitrary-precision rational number in canonical form
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BigNum {
    value: BigRational,
}

/// Target types that `BigNum` can be losslessly converted to
pub trait Representable: Sized {
    /// `true` if `num` converts to `Self` without loss
    fn representable(num: &BigNum) -> bool;
}

macro_rules! int_representable {
    ($($ty:ty),*) => {$(
        impl Representable for $ty {
            fn representable(num: &BigNum) -> bool {
                if !num.is_integral() {
                    return false;
                }
                let n = num.value.numer();
                &BigInt::from(<$ty>::MIN) <= n && n <= &BigInt::from(<$ty>::MAX)
            }
        }
    )*};
}

int_representable!(i8, i16, i32, i64, u8, u16, u32, u64);

impl Representable for f64 {
    fn representable(num: &BigNum) -> bool {
        let Some(approx) = num.value.to_f64() else {
            return false;
        };
        if !approx.is_finite() {
            return false;
        }
        // Exact iff the value round-trips through the target precision
        BigRational::from_float(approx).as_ref() == Some(&num.value)
    }
}

impl Representable for f32 {
    fn representable(num: &BigNum) -> bool {
        let Some(approx) = num.value.to_f64() else {
            return false;
        };
        let narrowed = approx as f32;
        if !narrowed.is_finite() {
            return false;
        }
        BigRational::from_float(f64::from(narrowed)).as_ref() == Some(&num.value)
    }
}

impl BigNum {
    /// The rational zero
    pub fn zero() -> Self {
        BigNum {
            value: BigRational::zero(),
        }
    }

    /// Construct from numerator and denominator; panics on zero denominator
    pub fn from_ratio(numer: impl Into<BigInt>, denom: impl Into<BigInt>) -> Self {
        BigNum {
            value: BigRational::new(numer.into(), denom.into()),
        }
    }

    /// Parse a string.
    ///
    /// Whitespace is trimmed. If `value` contains a dot it must not carry a
    /// base prefix and is parsed as a decimal fraction. A `/` separates
    /// numerator and denominator. `base` must be 0 or in `2..=16`; base 0
    /// disambiguates by prefix: `0x`/`0X` hex, `0b`/`0B` binary, leading `0`
    /// octal, decimal otherwise.
    pub fn from_string(value: &str, base: u32) -> Option<Self> {
        let value = value.trim();
        if value.is_empty() {
            return None;
        }
        if let Some((numer, denom)) = value.split_once('/') {
            let n = Self::parse_integer(numer.trim(), base)?;
            let d = Self::parse_integer(denom.trim(), base)?;
            if d.is_zero() {
                return None;
            }
            return Some(Self::from_ratio(n, d));
        }
        if value.contains('.') {
            return Self::parse_decimal(value);
        }
        Self::parse_integer(value, base).map(|n| BigNum { value: n.into() })
    }

    fn parse_integer(value: &str, base: u32) -> Option<BigInt> {
        let (negative, digits) = match value.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, value.strip_prefix('+').unwrap_or(value)),
        };
        let (radix, digits) = if base == 0 {
            if let Some(rest) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
                (16, rest)
            } else if let Some(rest) =
                digits.strip_prefix("0b").or_else(|| digits.strip_prefix("0B"))
            {
                (2, rest)
            } else if digits.len() > 1 && digits.starts_with('0') {
                (8, &digits[1..])
            } else {
                (10, digits)
            }
        } else if (2..=16).contains(&base) {
            (base, digits)
        } else {
            return None;
        };
        let magnitude = BigInt::parse_bytes(digits.as_bytes(), radix)?;
        Some(if negative { -magnitude } else { magnitude })
    }

    fn parse_decimal(value: &str) -> Option<Self> {
        let (negative, digits) = match value.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, value.strip_prefix('+').unwrap_or(value)),
        };
        let (int_part, frac_part) = digits.split_once('.')?;
        if int_part.is_empty() && frac_part.is_empty() {
            return None;
        }
        let valid = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
        if !valid(int_part) || !valid(frac_part) {
            return None;
        }
        let int_val = if int_part.is_empty() {
            BigInt::zero()
        } else {
            BigInt::parse_bytes(int_part.as_bytes(), 10)?
        };
        let frac_val = if frac_part.is_empty() {
            BigInt::zero()
        } else {
            BigInt::parse_bytes(frac_part.as_bytes(), 10)?
        };
        let scale = BigInt::from(10u32).pow(frac_part.len() as u32);
        let numer = int_val * &scale + frac_val;
        let value = BigRational::new(numer, scale);
        Some(BigNum {
            value: if negative { -value } else { value },
        })
    }

    /// `true` if the denominator is one
    pub fn is_integral(&self) -> bool {
        self.value.is_integer()
    }

    /// `true` if the value is negative
    pub fn is_negative(&self) -> bool {
        self.value.is_negative()
    }

    /// Lossless-conversion test for the target type `T`
    pub fn representable_as<T: Representable>(&self) -> bool {
        T::representable(self)
    }

    /// The numerator of the canonical form
    pub fn numer(&self) -> &BigInt {
        self.value.numer()
    }

    /// The denominator of the canonical form
    pub fn denom(&self) -> &BigInt {
        self.value.denom()
    }

    /// Truncate toward zero to a signed 64-bit integer
    pub fn to_i64(&self) -> Option<i64> {
        self.value.trunc().numer().to_i64()
    }

    /// Truncate toward zero to an unsigned 64-bit integer
    pub fn to_u64(&self) -> Option<u64> {
        self.value.trunc().numer().to_u64()
    }

    /// Round to the nearest double (ties to even)
    pub fn to_f64(&self) -> f64 {
        self.value.to_f64().unwrap_or(f64::NAN)
    }

    /// Truncate toward zero to the low `width * 8` bits, wrapping
    pub fn truncated_bits(&self, width: u32) -> u64 {
        let trunc = self.value.trunc();
        let numer = trunc.numer();
        let mask = if width >= 8 {
            u64::MAX
        } else {
            (1u64 << (8 * width)) - 1
        };
        let (sign, digits) = numer.to_u64_digits();
        let low = digits.first().copied().unwrap_or(0);
        let bits = match sign {
            Sign::Minus => low.wrapping_neg(),
            _ => low,
        };
        bits & mask
    }
}

impl fmt::Display for BigNum {
    /// Integral values print as plain integers and fractions with a
    /// power-of-ten-compatible denominator print as exact decimals;
    /// everything else falls back to `numer/denom`, which `from_string`
    /// accepts, so formatting round-trips for every value.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_integral() {
            return write!(f, "{}", self.value.numer());
        }
        if let Some((digits, scale)) = self.decimal_expansion() {
            return write!(f, "{}", format_decimal(&digits, scale));
        }
        write!(f, "{}/{}", self.value.numer(), self.value.denom())
    }
}

impl BigNum {
    /// If the denominator is of the form 2^a * 5^b, returns the scaled
    /// numerator and the number of fractional decimal digits
    fn decimal_expansion(&self) -> Option<(BigInt, usize)> {
        let mut denom = self.value.denom().clone();
        let two = BigInt::from(2u32);
        let five = BigInt::from(5u32);
        let mut twos = 0usize;
        let mut fives = 0usize;
        while (&denom % &two).is_zero() {
            denom /= &two;
            twos += 1;
        }
        while (&denom % &five).is_zero() {
            denom /= &five;
            fives += 1;
        }
        if !denom.is_one() {
            return None;
        }
        let scale = twos.max(fives);
        let mut numer = self.value.numer().clone();
        // Scale to 10^scale by multiplying with the missing factors
        for _ in twos..scale {
            numer *= &two;
        }
        for _ in fives..scale {
            numer *= &five;
        }
        Some((numer, scale))
    }
}

fn format_decimal(digits: &BigInt, scale: usize) -> String {
    let negative = digits.is_negative();
    let mut s = digits.magnitude().to_string();
    if s.len() <= scale {
        let pad = scale - s.len() + 1;
        s = format!("{}{}", "0".repeat(pad), s);
    }
    s.insert(s.len() - scale, '.');
    // Trim trailing zeros but keep at least one fractional digit
    while s.ends_with('0') && !s.ends_with(".0") {
        s.pop();
    }
    if negative {
        s.insert(0, '-');
    }
    s
}

impl FromStr for BigNum {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BigNum::from_string(s, 0).ok_or(())
    }
}

macro_rules! from_int {
    ($($ty:ty),*) => {$(
        impl From<$ty> for BigNum {
            fn from(value: $ty) -> Self {
                BigNum { value: BigRational::from(BigInt::from(value)) }
            }
        }
    )*};
}

from_int!(i8, i16, i32, i64, u8, u16, u32, u64, usize);

impl From<f64> for BigNum {
    fn from(value: f64) -> Self {
        BigNum {
            value: BigRational::from_float(value).unwrap_or_else(BigRational::zero),
        }
    }
}

impl From<f32> for BigNum {
    fn from(value: f32) -> Self {
        BigNum::from(f64::from(value))
    }
}

macro_rules! binop {
    ($trait:ident, $method:ident, $assign_trait:ident, $assign_method:ident) => {
        impl $trait for BigNum {
            type Output = BigNum;
            fn $method(self, rhs: BigNum) -> BigNum {
                BigNum {
                    value: self.value.$method(rhs.value),
                }
            }
        }

        impl $trait for &BigNum {
            type Output = BigNum;
            fn $method(self, rhs: &BigNum) -> BigNum {
                BigNum {
                    value: (&self.value).$method(&rhs.value),
                }
            }
        }

        impl $assign_trait for BigNum {
            fn $assign_method(&mut self, rhs: BigNum) {
                self.value.$assign_method(rhs.value);
            }
        }
    };
}

binop!(Add, add, AddAssign, add_assign);
binop!(Sub, sub, SubAssign, sub_assign);
binop!(Mul, mul, MulAssign, mul_assign);
binop!(Div, div, DivAssign, div_assign);

impl Neg for BigNum {
    type Output = BigNum;
    fn neg(self) -> BigNum {
        BigNum { value: -self.value }
    }
}

impl Zero for BigNum {
    fn zero() -> Self {
        BigNum::zero()
    }

    fn is_zero(&self) -> bool {
        self.value.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparison() {
        let n = BigNum::from(300i64);
        assert!(n.is_integral());
        assert_eq!(n, BigNum::from(300i64));
        assert!(n > BigNum::zero());
        assert!(n < BigNum::from(1000i64));
    }

    #[test]
    fn integral_representable() {
        let n = BigNum::from(300i64);
        assert!(n.representable_as::<i32>());
        assert!(n.representable_as::<u32>());
        assert!(n.representable_as::<i64>());
        assert!(!n.representable_as::<i8>());
        assert!(!n.representable_as::<u8>());
        assert!(n.representable_as::<f32>());
        assert!(n.representable_as::<f64>());
    }

    #[test]
    fn negative_representable() {
        let n = BigNum::from(-200i64);
        assert!(n.representable_as::<i32>());
        assert!(!n.representable_as::<u32>());
        assert!(!n.representable_as::<u64>());
        assert!(n.representable_as::<f64>());
        assert_eq!(n.to_i64(), Some(-200));
    }

    #[test]
    fn huge_integral_not_representable() {
        let n = BigNum::from_string("FFffFFffFFffFFffFFffFFffFFffFFff", 16).unwrap();
        assert!(n.is_integral());
        assert!(!n.representable_as::<i64>());
        assert!(!n.representable_as::<u64>());
    }

    #[test]
    fn float_representable() {
        let n = BigNum::from(f64::MAX);
        assert!(!n.representable_as::<f32>());
        assert!(n.representable_as::<f64>());
        assert_eq!(n.to_f64(), f64::MAX);

        let half = BigNum::from(0.5f64);
        assert!(!half.is_integral());
        assert!(!half.representable_as::<i32>());
        assert_eq!(half.to_f64(), 0.5);
    }

    #[test]
    fn from_string() {
        assert_eq!(BigNum::from_string("123", 0).unwrap(), BigNum::from(123i64));
        assert_eq!(
            BigNum::from_string("123", 16).unwrap(),
            BigNum::from(0x123i64)
        );
        assert_eq!(
            BigNum::from_string("0x123", 0).unwrap(),
            BigNum::from(0x123i64)
        );
        assert_eq!(
            BigNum::from_string("0.5", 0).unwrap(),
            BigNum::from(0.5f64)
        );
        assert_eq!(
            BigNum::from_string("1.3", 0).unwrap(),
            BigNum::from_ratio(13, 10)
        );
        assert!(BigNum::from_string("", 0).is_none());
        assert!(BigNum::from_string("1/0", 0).is_none());
    }

    #[test]
    fn arithmetic() {
        let mut n = BigNum::from(100i64);
        n += BigNum::from(0.5f64);
        assert_eq!(n, BigNum::from_ratio(201, 2));

        let mut n = BigNum::from(u64::MAX);
        n += BigNum::from(1i64);
        assert_eq!(n, BigNum::from_string("0x10000000000000000", 0).unwrap());

        let n = BigNum::from(2i64) * BigNum::from_ratio(1, 4);
        assert_eq!(n, BigNum::from_ratio(1, 2));

        let n = BigNum::from(1i64) / BigNum::from(2i64);
        assert_eq!(n, BigNum::from_ratio(1, 2));
    }

    #[test]
    fn formatting() {
        assert_eq!(BigNum::from(100i64).to_string(), "100");
        assert_eq!(BigNum::from(-100i64).to_string(), "-100");
        assert_eq!(BigNum::from(12.5f64).to_string(), "12.5");
        assert_eq!(BigNum::from(-12.5f64).to_string(), "-12.5");
        assert_eq!(BigNum::from_ratio(1, 3).to_string(), "1/3");
    }

    #[test]
    fn string_round_trip() {
        for n in [
            BigNum::from(0i64),
            BigNum::from(-7i64),
            BigNum::from(12.5f64),
            BigNum::from_ratio(22, 7),
            BigNum::from_ratio(-1, 3),
        ] {
            let s = n.to_string();
            assert_eq!(BigNum::from_string(&s, 0).unwrap(), n, "round trip of {s}");
        }
    }

    #[test]
    fn truncation() {
        assert_eq!(BigNum::from_ratio(7, 2).to_i64(), Some(3));
        assert_eq!(BigNum::from_ratio(-7, 2).to_i64(), Some(-3));
        assert_eq!(BigNum::from(300i64).truncated_bits(1), 0x2C);
    }
}
