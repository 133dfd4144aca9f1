//! Value transforms applied between a linked record and its links.

use std::str::FromStr;

use crate::{
    dbr::{DbrBasicType, DbrValue},
    holder::ValueHolder,
    utils::split_escaped,
};

use super::ConfigError;

const NEWTON_ITERATIONS: usize = 50;
const NEWTON_TOLERANCE: f64 = 1e-12;

/// A polynomial `a0 + a1*x + ... + an*x^n`
#[derive(Debug, Clone, PartialEq)]
pub struct Transform {
    coefficients: Vec<f64>,
}

impl Transform {
    pub fn polynomial(coefficients: Vec<f64>) -> Self {
        Transform { coefficients }
    }

    /// `offset + scale * x`
    pub fn linear(offset: f64, scale: f64) -> Self {
        Transform::polynomial(vec![offset, scale])
    }

    pub fn apply(&self, x: f64) -> f64 {
        self.coefficients.iter().rev().fold(0.0, |acc, a| acc * x + a)
    }

    fn derivative(&self, x: f64) -> f64 {
        self.coefficients
            .iter()
            .enumerate()
            .skip(1)
            .rev()
            .fold(0.0, |acc, (n, a)| acc * x + a * n as f64)
    }

    /// Solve `apply(x) == y`. Returns `None` if no solution was found.
    pub fn inverse(&self, y: f64) -> Option<f64> {
        match self.coefficients.as_slice() {
            [] => None,
            [a0] => (*a0 == y).then_some(y),
            [a0, a1] => (*a1 != 0.0).then(|| (y - a0) / a1),
            _ => {
                // Start from the linear approximation
                let a1 = self.coefficients[1];
                let mut x = if a1 == 0.0 {
                    y
                } else {
                    (y - self.coefficients[0]) / a1
                };
                for _ in 0..NEWTON_ITERATIONS {
                    let slope = self.derivative(x);
                    if slope == 0.0 || !slope.is_finite() {
                        return None;
                    }
                    let step = (self.apply(x) - y) / slope;
                    x -= step;
                    if step.abs() <= NEWTON_TOLERANCE * x.abs().max(1.0) {
                        return Some(x);
                    }
                }
                None
            }
        }
    }

    /// Map every element of a numeric value. Non-numeric values pass through.
    pub fn forward_value(&self, value: &DbrValue) -> DbrValue {
        self.map_value(value, |x| Some(self.apply(x)))
            .unwrap_or_else(|| value.clone())
    }

    /// Map every element through the inverse, or `None` if any has no solution
    pub fn inverse_value(&self, value: &DbrValue) -> Option<DbrValue> {
        self.map_value(value, |y| self.inverse(y))
    }

    fn map_value(&self, value: &DbrValue, f: impl Fn(f64) -> Option<f64>) -> Option<DbrValue> {
        let DbrValue::Double(items) = value.convert_to(DbrBasicType::Double).ok()? else {
            return None;
        };
        items
            .into_iter()
            .map(f)
            .collect::<Option<Vec<f64>>>()
            .map(DbrValue::Double)
    }
}

impl FromStr for Transform {
    type Err = ConfigError;

    /// Comma-separated coefficients, lowest order first
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let coefficients = split_escaped(s)
            .iter()
            .map(|c| {
                c.trim().parse::<f64>().map_err(|_| ConfigError::InvalidProperty {
                    key: "transform".to_string(),
                    value: s.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if coefficients.is_empty() {
            return Err(ConfigError::InvalidProperty {
                key: "transform".to_string(),
                value: s.to_string(),
            });
        }
        Ok(Transform::polynomial(coefficients))
    }
}

/// How the snapshots of several links are folded into one value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Combine {
    /// The first link's value
    #[default]
    First,
    /// True if every link is truthy
    And,
    /// True if any link is truthy
    Or,
    /// Link truthiness packed into an integer, bit i for link i
    Bits,
    /// A single bit of the first link's integer value
    Bit(u8),
}

impl Combine {
    /// Fold the snapshots. `None` if a needed value is missing.
    pub fn combine(&self, holders: &[Option<ValueHolder>]) -> Option<DbrValue> {
        match self {
            Combine::First => holders.first()?.as_ref()?.value.clone(),
            Combine::And => Some(DbrValue::from(
                holders.iter().all(|h| h.as_ref().is_some_and(ValueHolder::as_bool)),
            )),
            Combine::Or => Some(DbrValue::from(
                holders.iter().any(|h| h.as_ref().is_some_and(ValueHolder::as_bool)),
            )),
            Combine::Bits => {
                let bits = holders
                    .iter()
                    .enumerate()
                    .take(32)
                    .filter(|(_, h)| h.as_ref().is_some_and(ValueHolder::as_bool))
                    .fold(0u32, |acc, (i, _)| acc | (1 << i));
                Some(DbrValue::Long(vec![bits as i32]))
            }
            Combine::Bit(n) => {
                let raw = holders.first()?.as_ref()?.value.as_ref()?.as_i64()?;
                Some(DbrValue::from((raw >> n) & 1 != 0))
            }
        }
    }
}

impl FromStr for Combine {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidProperty {
            key: "combine".to_string(),
            value: s.to_string(),
        };
        let lower = s.trim().to_lowercase();
        Ok(match lower.as_str() {
            "first" | "" => Combine::First,
            "and" => Combine::And,
            "or" => Combine::Or,
            "bits" => Combine::Bits,
            other => match other.strip_prefix("bit:") {
                Some(n) => Combine::Bit(
                    n.trim()
                        .parse()
                        .ok()
                        .filter(|n| *n < 64)
                        .ok_or_else(invalid)?,
                ),
                None => return Err(invalid()),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use super::*;
    use crate::alarm::Alarm;

    fn holder(value: DbrValue) -> Option<ValueHolder> {
        Some(ValueHolder::new("L", value, Alarm::NONE, SystemTime::now()))
    }

    #[test]
    fn linear_inverse() {
        let t = Transform::linear(1.0, 2.0);
        assert_eq!(t.apply(3.0), 7.0);
        assert_eq!(t.inverse(7.0), Some(3.0));
        assert_eq!(Transform::linear(1.0, 0.0).inverse(1.0), None);
    }

    #[test]
    fn cubic_inverse_converges() {
        let t: Transform = "0, 1, 0, 0.5".parse().unwrap();
        for x in [-2.0, -0.5, 0.0, 0.75, 3.0] {
            let y = t.apply(x);
            let back = t.inverse(y).unwrap();
            assert!((back - x).abs() < 1e-9, "{x} -> {y} -> {back}");
        }
    }

    #[test]
    fn bad_transform_text() {
        assert!("1,two".parse::<Transform>().is_err());
    }

    #[test]
    fn maps_arrays() {
        let t = Transform::linear(0.0, 10.0);
        assert_eq!(
            t.forward_value(&DbrValue::Long(vec![1, 2])),
            DbrValue::Double(vec![10.0, 20.0])
        );
        assert_eq!(
            t.inverse_value(&DbrValue::Double(vec![5.0])),
            Some(DbrValue::Double(vec![0.5]))
        );
    }

    #[test]
    fn combine_variants() {
        let holders = vec![
            holder(DbrValue::Long(vec![6])),
            holder(DbrValue::Enum(0)),
            holder(DbrValue::Double(vec![0.5])),
        ];
        assert_eq!(Combine::First.combine(&holders), Some(DbrValue::Long(vec![6])));
        assert_eq!(Combine::And.combine(&holders), Some(DbrValue::Enum(0)));
        assert_eq!(Combine::Or.combine(&holders), Some(DbrValue::Enum(1)));
        assert_eq!(Combine::Bits.combine(&holders), Some(DbrValue::Long(vec![0b101])));
        assert_eq!(Combine::Bit(1).combine(&holders), Some(DbrValue::Enum(1)));
        assert_eq!(Combine::Bit(0).combine(&holders), Some(DbrValue::Enum(0)));
        assert_eq!(Combine::First.combine(&[None]), None);
    }

    #[test]
    fn parse_combine() {
        assert_eq!("AND".parse::<Combine>().unwrap(), Combine::And);
        assert_eq!("bit:3".parse::<Combine>().unwrap(), Combine::Bit(3));
        assert!("bit:x".parse::<Combine>().is_err());
        assert!("xor".parse::<Combine>().is_err());
    }
}
