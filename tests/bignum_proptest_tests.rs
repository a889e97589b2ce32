//! Property-based tests for the arbitrary-precision rationals

use proptest::prelude::*;
use scatha::BigNum;

fn bignum() -> impl Strategy<Value = BigNum> {
    (any::<i64>(), 1i64..=i64::MAX).prop_map(|(n, d)| BigNum::from_ratio(n, d))
}

fn nonzero_bignum() -> impl Strategy<Value = BigNum> {
    bignum().prop_filter("nonzero", |n| n != &BigNum::zero())
}

proptest! {
    #[test]
    fn addition_subtraction_cancel(a in bignum(), b in bignum()) {
        prop_assert_eq!((a.clone() + b.clone()) - b, a);
    }

    #[test]
    fn multiplication_division_cancel(a in bignum(), b in nonzero_bignum()) {
        prop_assert_eq!((a.clone() * b.clone()) / b, a);
    }

    #[test]
    fn string_round_trip(a in bignum()) {
        let text = a.to_string();
        prop_assert_eq!(BigNum::from_string(&text, 0).unwrap(), a);
    }

    #[test]
    fn integer_round_trip(v in any::<i64>()) {
        let n = BigNum::from(v);
        prop_assert!(n.is_integral());
        prop_assert!(n.representable_as::<i64>());
        prop_assert_eq!(n.to_i64(), Some(v));
    }

    #[test]
    fn double_round_trip(v in any::<i32>()) {
        // Every i32 is exactly representable as f64
        let n = BigNum::from(f64::from(v));
        prop_assert!(n.representable_as::<f64>());
        prop_assert_eq!(n.to_f64(), f64::from(v));
    }

    #[test]
    fn truncation_moves_toward_zero(n in any::<i64>(), d in 2i64..1000) {
        let q = BigNum::from_ratio(n, d);
        let truncated = q.to_i64().unwrap();
        prop_assert_eq!(truncated, n / d);
    }
}
