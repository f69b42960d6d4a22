//! Exact arithmetic over Kubernetes resource quantities
//!
//! Quantities are held as a signed count of nano-units, which represents
//! every value the API server accepts without loss. Sums are rendered back
//! in the canonical form of the resource they measure.

use crate::apis::management::ResourceList;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::fmt::Write;

const NANOS: i128 = 1_000_000_000;

/// How a resource's quantities are rendered.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Format {
    /// Powers of 1000, e.g. `1500m` or `2k`.
    DecimalSI,
    /// Powers of 1024, e.g. `512Mi`.
    BinarySI,
}

/// A parsed quantity, in nano-units.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Amount(i128);

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("quantity {0:?} is empty")]
    Empty(String),

    #[error("quantity {0:?} is not a number")]
    Number(String),

    #[error("quantity {0:?} has an unknown suffix")]
    Suffix(String),

    #[error("quantity {0:?} is out of range")]
    Overflow(String),
}

// === impl Format ===

impl Format {
    /// The canonical format for a resource name.
    ///
    /// Only byte-sized resources are binary. Quota keys such as
    /// `requests.memory` are formatted by the resource they prefix.
    pub fn for_resource(name: &str) -> Self {
        let base = name
            .strip_prefix("requests.")
            .or_else(|| name.strip_prefix("limits."))
            .unwrap_or(name);
        match base {
            "memory" | "storage" | "ephemeral-storage" => Format::BinarySI,
            _ => Format::DecimalSI,
        }
    }
}

// === impl Amount ===

impl Amount {
    pub const ZERO: Self = Self(0);

    pub fn from_nanos(nanos: i128) -> Self {
        Self(nanos)
    }

    pub fn nanos(&self) -> i128 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_mul(self, factor: i64) -> Option<Self> {
        self.0.checked_mul(i128::from(factor)).map(Self)
    }

    pub fn parse(q: &str) -> Result<Self, ParseError> {
        let s = q.trim();
        if s.is_empty() {
            return Err(ParseError::Empty(q.to_string()));
        }

        let (negative, s) = match s.as_bytes()[0] {
            b'-' => (true, &s[1..]),
            b'+' => (false, &s[1..]),
            _ => (false, s),
        };

        let end = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (number, suffix) = s.split_at(end);
        let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
        if (whole.is_empty() && frac.is_empty()) || frac.contains('.') {
            return Err(ParseError::Number(q.to_string()));
        }

        let overflow = || ParseError::Overflow(q.to_string());

        // The number as an integer mantissa scaled by 10^-frac_digits.
        let mut mantissa: i128 = 0;
        for d in whole.bytes().chain(frac.bytes()) {
            mantissa = mantissa
                .checked_mul(10)
                .and_then(|m| m.checked_add(i128::from(d - b'0')))
                .ok_or_else(overflow)?;
        }
        let mut exp10 = -i32::try_from(frac.len()).map_err(|_| overflow())?;

        let mut multiplier: i128 = 1;
        match suffix {
            "" => {}
            "Ki" => multiplier = 1 << 10,
            "Mi" => multiplier = 1 << 20,
            "Gi" => multiplier = 1 << 30,
            "Ti" => multiplier = 1 << 40,
            "Pi" => multiplier = 1 << 50,
            "Ei" => multiplier = 1 << 60,
            "n" => exp10 -= 9,
            "u" => exp10 -= 6,
            "m" => exp10 -= 3,
            "k" => exp10 += 3,
            "M" => exp10 += 6,
            "G" => exp10 += 9,
            "T" => exp10 += 12,
            "P" => exp10 += 15,
            "E" => exp10 += 18,
            s if s.starts_with(['e', 'E']) => {
                let e: i32 = s[1..]
                    .parse()
                    .map_err(|_| ParseError::Suffix(q.to_string()))?;
                exp10 = exp10.checked_add(e).ok_or_else(overflow)?;
            }
            _ => return Err(ParseError::Suffix(q.to_string())),
        }

        // Scale to nano-units, rounding any finer precision up.
        let scale = exp10.checked_add(9).ok_or_else(overflow)?;
        let mut nanos = mantissa.checked_mul(multiplier).ok_or_else(overflow)?;
        if scale >= 0 {
            let factor = 10i128
                .checked_pow(u32::try_from(scale).map_err(|_| overflow())?)
                .ok_or_else(overflow)?;
            nanos = nanos.checked_mul(factor).ok_or_else(overflow)?;
        } else {
            let divisor = match 10i128.checked_pow(scale.unsigned_abs()) {
                Some(divisor) => divisor,
                // Smaller than a nano-unit.
                None if nanos == 0 => return Ok(Self::ZERO),
                None if negative => return Ok(Self(-1)),
                None => return Ok(Self(1)),
            };
            let rem = nanos % divisor;
            nanos = nanos / divisor + i128::from(rem != 0);
        }

        Ok(Self(if negative { -nanos } else { nanos }))
    }

    /// Renders the amount with the largest suffix that keeps it exact.
    pub fn format(&self, format: Format) -> String {
        let mut out = String::new();
        if self.0 < 0 {
            out.push('-');
        }
        let nanos = self.0.unsigned_abs();

        if format == Format::BinarySI && nanos % NANOS as u128 == 0 {
            let units = nanos / NANOS as u128;
            const BINARY: [(u32, &str); 6] = [
                (60, "Ei"),
                (50, "Pi"),
                (40, "Ti"),
                (30, "Gi"),
                (20, "Mi"),
                (10, "Ki"),
            ];
            for (shift, suffix) in BINARY {
                let size = 1u128 << shift;
                if units != 0 && units % size == 0 {
                    let _ = write!(out, "{}{suffix}", units / size);
                    return out;
                }
            }
            let _ = write!(out, "{units}");
            return out;
        }

        const DECIMAL: [(u32, &str); 10] = [
            (27, "E"),
            (24, "P"),
            (21, "T"),
            (18, "G"),
            (15, "M"),
            (12, "k"),
            (9, ""),
            (6, "m"),
            (3, "u"),
            (0, "n"),
        ];
        if nanos == 0 {
            out.push('0');
            return out;
        }
        let (exp, suffix) = DECIMAL
            .into_iter()
            .find(|(exp, _)| nanos % 10u128.pow(*exp) == 0)
            .unwrap_or((0, "n"));
        let _ = write!(out, "{}{suffix}", nanos / 10u128.pow(exp));
        out
    }

    pub fn to_quantity(&self, format: Format) -> Quantity {
        Quantity(self.format(format))
    }
}

impl TryFrom<&Quantity> for Amount {
    type Error = ParseError;

    fn try_from(q: &Quantity) -> Result<Self, Self::Error> {
        Self::parse(&q.0)
    }
}

/// Sums two resource lists key by key.
///
/// Each sum is rendered in its resource's canonical format, and keys whose
/// sum is zero are omitted.
pub fn add_resource_list(x: &ResourceList, y: &ResourceList) -> Result<ResourceList, ParseError> {
    let mut sums = std::collections::BTreeMap::<&str, Amount>::new();
    for (name, q) in x.iter().chain(y.iter()) {
        let amount = Amount::try_from(q)?;
        let sum = sums.entry(name.as_str()).or_default();
        *sum = sum
            .checked_add(amount)
            .ok_or_else(|| ParseError::Overflow(q.0.clone()))?;
    }

    Ok(sums
        .into_iter()
        .filter(|(_, sum)| !sum.is_zero())
        .map(|(name, sum)| {
            let q = sum.to_quantity(Format::for_resource(name));
            (name.to_string(), q)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;

    fn q(s: &str) -> Quantity {
        Quantity(s.to_string())
    }

    #[test]
    fn parses_suffixes() {
        let cases = [
            ("1", NANOS),
            ("250m", NANOS / 4),
            ("1.5", NANOS * 3 / 2),
            ("2k", 2_000 * NANOS),
            ("1Ki", 1024 * NANOS),
            ("1.5Gi", 3 * (1 << 29) * NANOS),
            ("5e3", 5_000 * NANOS),
            ("-100Mi", -100 * (1 << 20) * NANOS),
            ("10n", 10),
            (".5", NANOS / 2),
        ];
        for (input, nanos) in cases {
            assert_eq!(Amount::parse(input), Ok(Amount(nanos)), "{input}");
        }
    }

    #[test]
    fn rounds_sub_nano_precision_up() {
        assert_eq!(Amount::parse("0.1n"), Ok(Amount(1)));
        assert_eq!(Amount::parse("1e-30"), Ok(Amount(1)));
    }

    #[test]
    fn rejects_malformed_quantities() {
        assert!(matches!(Amount::parse(""), Err(ParseError::Empty(_))));
        assert!(matches!(Amount::parse("Mi"), Err(ParseError::Number(_))));
        assert!(matches!(Amount::parse("1.2.3"), Err(ParseError::Number(_))));
        assert!(matches!(Amount::parse("12XB"), Err(ParseError::Suffix(_))));
        assert!(matches!(Amount::parse("1e99"), Err(ParseError::Overflow(_))));
    }

    #[test]
    fn formats_canonically() {
        let cases = [
            ("1500m", Format::DecimalSI, "1500m"),
            ("2000m", Format::DecimalSI, "2"),
            ("3000", Format::DecimalSI, "3k"),
            ("0", Format::DecimalSI, "0"),
            ("1536Mi", Format::BinarySI, "1536Mi"),
            ("2048Mi", Format::BinarySI, "2Gi"),
            ("1000", Format::BinarySI, "1000"),
            ("500m", Format::BinarySI, "500m"),
            ("-1Ki", Format::BinarySI, "-1Ki"),
        ];
        for (input, format, expected) in cases {
            let amount = Amount::parse(input).expect("must parse");
            assert_eq!(amount.format(format), expected, "{input}");
        }
    }

    #[test]
    fn formats_by_resource_name() {
        assert_eq!(Format::for_resource("cpu"), Format::DecimalSI);
        assert_eq!(Format::for_resource("requests.cpu"), Format::DecimalSI);
        assert_eq!(Format::for_resource("limits.pods"), Format::DecimalSI);
        assert_eq!(Format::for_resource("requests.memory"), Format::BinarySI);
        assert_eq!(Format::for_resource("ephemeral-storage"), Format::BinarySI);
        assert_eq!(Format::for_resource("requests.storage"), Format::BinarySI);
        assert_eq!(Format::for_resource("nvidia.com/gpu"), Format::DecimalSI);
        assert_eq!(Format::for_resource("requests.nvidia.com/gpu"), Format::DecimalSI);
        assert_eq!(Format::for_resource("count/deployments.apps"), Format::DecimalSI);
        assert_eq!(Format::for_resource("services"), Format::DecimalSI);
    }

    #[test]
    fn adds_resource_lists() {
        let x = btreemap! {
            "requests.cpu".to_string() => q("500m"),
            "requests.memory".to_string() => q("512Mi"),
            "limits.cpu".to_string() => q("1"),
        };
        let y = btreemap! {
            "requests.cpu".to_string() => q("1.5"),
            "requests.memory".to_string() => q("512Mi"),
            "limits.cpu".to_string() => q("-1000m"),
        };
        assert_eq!(
            add_resource_list(&x, &y).expect("must add"),
            btreemap! {
                "requests.cpu".to_string() => q("2"),
                "requests.memory".to_string() => q("1Gi"),
            }
        );
    }

    #[derive(Clone, Debug)]
    struct List(ResourceList);

    impl Arbitrary for List {
        fn arbitrary(g: &mut Gen) -> Self {
            const NAMES: [&str; 5] = [
                "requests.cpu",
                "limits.cpu",
                "requests.memory",
                "requests.storage",
                "pods",
            ];
            const SUFFIXES: [&str; 6] = ["", "m", "k", "Ki", "Mi", "n"];
            let mut list = ResourceList::new();
            for _ in 0..usize::arbitrary(g) % NAMES.len() {
                let name = *g.choose(&NAMES).expect("names");
                let suffix = *g.choose(&SUFFIXES).expect("suffixes");
                let value = i32::arbitrary(g) % 10_000;
                list.insert(name.to_string(), Quantity(format!("{value}{suffix}")));
            }
            List(list)
        }
    }

    #[quickcheck]
    fn addition_is_associative(a: List, b: List, c: List) -> bool {
        let ab_c = add_resource_list(&add_resource_list(&a.0, &b.0).unwrap(), &c.0).unwrap();
        let a_bc = add_resource_list(&a.0, &add_resource_list(&b.0, &c.0).unwrap()).unwrap();
        ab_c == a_bc
    }

    #[quickcheck]
    fn addition_is_commutative(a: List, b: List) -> bool {
        add_resource_list(&a.0, &b.0).unwrap() == add_resource_list(&b.0, &a.0).unwrap()
    }

    #[quickcheck]
    fn sums_never_hold_zeros(a: List, b: List) -> bool {
        add_resource_list(&a.0, &b.0)
            .unwrap()
            .values()
            .all(|q| !Amount::try_from(q).unwrap().is_zero())
    }

    #[quickcheck]
    fn a_list_minus_itself_is_empty(a: List) -> bool {
        let negated = a
            .0
            .iter()
            .map(|(k, v)| {
                let neg = Amount::from_nanos(-Amount::try_from(v).unwrap().nanos());
                (k.clone(), neg.to_quantity(Format::for_resource(k)))
            })
            .collect();
        add_resource_list(&a.0, &negated).unwrap().is_empty()
    }
}
