//! Represent PV values and the metadata that travels with them.
//!
//! Every value held by a [`Record`](crate::record::Record) is a [`DbrValue`]: one of
//! seven basic array types, named after the EPICS "DBR" kinds they mirror. All
//! numeric types are signed, and every variant except [`DbrValue::Enum`] can hold an
//! array. The options, and the native type used to represent, are:
//! - [`DbrValue::Char`] ([`Vec<i8>`]), configured as `BYTE` or `CHAR`
//! - [`DbrValue::Int`] ([`Vec<i16>`]), configured as `SHORT`
//! - [`DbrValue::Long`] ([`Vec<i32>`]), configured as `INT` or `LONG`
//! - [`DbrValue::Float`] ([`Vec<f32>`])
//! - [`DbrValue::Double`] ([`Vec<f64>`])
//! - [`DbrValue::Enum`] ([`u16`]), an index into the record's enumeration labels
//! - [`DbrValue::String`] ([`Vec<String>`])
//!
//! Values are converted between types with [`DbrValue::convert_to`], which refuses
//! any conversion that would not be representable in the target type, and to and
//! from text with [`DbrValue::to_display_string`] and [`DbrValue::parse_into`].
//!
//! Display, alarm, warning and control limits, units and precision are carried
//! separately in [`Metadata`], since they change far less often than the value.

use num::{NumCast, ToPrimitive};
use std::{convert::TryFrom, str::FromStr};
use thiserror::Error;

use crate::utils::{escape_separators, split_escaped};

/// Errors raised when a value cannot be coerced into another representation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConversionError {
    #[error("value cannot be represented as {0:?}")]
    NoConvert(DbrBasicType),
    #[error("could not parse '{0}'")]
    CannotParse(String),
    #[error("'{0}' is not a known data type")]
    UnknownType(String),
}

/// Represent the actual value stored by a PV
#[derive(Clone, Debug, PartialEq)]
pub enum DbrValue {
    Enum(u16),
    String(Vec<String>),
    Char(Vec<i8>),
    Int(Vec<i16>),
    Long(Vec<i32>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

impl DbrValue {
    /// A zero-filled value of the given type and element count
    pub fn default_for(basic_type: DbrBasicType, count: usize) -> DbrValue {
        let count = count.max(1);
        match basic_type {
            DbrBasicType::Enum => DbrValue::Enum(0),
            DbrBasicType::String => DbrValue::String(vec![String::new(); count]),
            DbrBasicType::Char => DbrValue::Char(vec![0; count]),
            DbrBasicType::Int => DbrValue::Int(vec![0; count]),
            DbrBasicType::Long => DbrValue::Long(vec![0; count]),
            DbrBasicType::Float => DbrValue::Float(vec![0.0; count]),
            DbrBasicType::Double => DbrValue::Double(vec![0.0; count]),
        }
    }

    pub fn get_count(&self) -> usize {
        match self {
            DbrValue::Enum(_) => 1,
            DbrValue::String(val) => val.len(),
            DbrValue::Char(val) => val.len(),
            DbrValue::Int(val) => val.len(),
            DbrValue::Long(val) => val.len(),
            DbrValue::Float(val) => val.len(),
            DbrValue::Double(val) => val.len(),
        }
    }

    pub fn get_type(&self) -> DbrBasicType {
        match self {
            DbrValue::Enum(_) => DbrBasicType::Enum,
            DbrValue::String(_) => DbrBasicType::String,
            DbrValue::Char(_) => DbrBasicType::Char,
            DbrValue::Int(_) => DbrBasicType::Int,
            DbrValue::Long(_) => DbrBasicType::Long,
            DbrValue::Float(_) => DbrBasicType::Float,
            DbrValue::Double(_) => DbrBasicType::Double,
        }
    }

    /// The first element as a double, if the value is numeric (or parses as one)
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DbrValue::Enum(val) => Some(*val as f64),
            DbrValue::String(val) => val.first().and_then(|s| s.trim().parse().ok()),
            DbrValue::Char(val) => val.first().map(|v| *v as f64),
            DbrValue::Int(val) => val.first().map(|v| *v as f64),
            DbrValue::Long(val) => val.first().map(|v| *v as f64),
            DbrValue::Float(val) => val.first().map(|v| *v as f64),
            DbrValue::Double(val) => val.first().copied(),
        }
    }

    /// The first element as an integer, truncating any fractional part
    pub fn as_i64(&self) -> Option<i64> {
        self.as_f64().and_then(|v| v.to_i64())
    }

    /// Interpret the first element as a boolean: any non-zero number is `true`
    pub fn as_bool(&self) -> bool {
        match self {
            DbrValue::String(val) => val.first().is_some_and(|s| {
                let s = s.trim();
                s.eq_ignore_ascii_case("true") || s.parse::<f64>().is_ok_and(|v| v != 0.0)
            }),
            _ => self.as_f64().is_some_and(|v| v != 0.0),
        }
    }

    /// Parse string elements into `basic_type`
    ///
    /// Non-string values are converted instead. Enum values may be given either as
    /// an index or as one of `labels`.
    pub fn parse_into(
        &self,
        basic_type: DbrBasicType,
        labels: &[String],
    ) -> Result<DbrValue, ConversionError> {
        fn parse_all<T: FromStr>(val: &[String]) -> Result<Vec<T>, ConversionError> {
            val.iter()
                .map(|s| {
                    s.trim()
                        .parse()
                        .map_err(|_| ConversionError::CannotParse(s.clone()))
                })
                .collect()
        }
        let DbrValue::String(val) = self else {
            return self.convert_to(basic_type);
        };
        Ok(match basic_type {
            DbrBasicType::Enum => {
                let [label] = val.as_slice() else {
                    return Err(ConversionError::NoConvert(DbrBasicType::Enum));
                };
                let label = label.trim();
                match labels.iter().position(|l| l == label) {
                    Some(index) => DbrValue::Enum(index as u16),
                    None => DbrValue::Enum(
                        label
                            .parse()
                            .map_err(|_| ConversionError::CannotParse(label.to_string()))?,
                    ),
                }
            }
            DbrBasicType::String => self.clone(),
            DbrBasicType::Char => DbrValue::Char(parse_all(val)?),
            DbrBasicType::Int => DbrValue::Int(parse_all(val)?),
            DbrBasicType::Long => DbrValue::Long(parse_all(val)?),
            DbrBasicType::Float => DbrValue::Float(parse_all(val)?),
            DbrBasicType::Double => DbrValue::Double(parse_all(val)?),
        })
    }

    /// Parse a comma-separated text representation into the given type
    pub fn from_display_string(
        text: &str,
        basic_type: DbrBasicType,
        labels: &[String],
    ) -> Result<DbrValue, ConversionError> {
        DbrValue::String(split_escaped(text)).parse_into(basic_type, labels)
    }

    /// Render as text, with float precision and enumeration labels applied
    ///
    /// Array elements are separated by commas; commas and backslashes inside string
    /// elements are escaped so that [`DbrValue::from_display_string`] reverses this.
    pub fn to_display_string(&self, precision: Option<usize>, labels: &[String]) -> String {
        fn join<T: ToString>(val: &[T]) -> String {
            val.iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(",")
        }
        fn join_float<T: Into<f64> + Copy + ToString>(
            val: &[T],
            precision: Option<usize>,
        ) -> String {
            match precision {
                Some(prec) => val
                    .iter()
                    .map(|v| format!("{:.prec$}", (*v).into()))
                    .collect::<Vec<_>>()
                    .join(","),
                None => join(val),
            }
        }
        match self {
            DbrValue::Enum(val) => labels
                .get(*val as usize)
                .cloned()
                .unwrap_or_else(|| val.to_string()),
            DbrValue::String(val) => val
                .iter()
                .map(|s| escape_separators(s))
                .collect::<Vec<_>>()
                .join(","),
            DbrValue::Char(val) => join(val),
            DbrValue::Int(val) => join(val),
            DbrValue::Long(val) => join(val),
            DbrValue::Float(val) => join_float(val, precision),
            DbrValue::Double(val) => join_float(val, precision),
        }
    }

    /// Every element widened to a double, or `None` for strings
    fn numeric_elements(&self) -> Option<Vec<f64>> {
        fn widen<T: Copy + Into<f64>>(val: &[T]) -> Vec<f64> {
            val.iter().map(|v| (*v).into()).collect()
        }
        match self {
            DbrValue::String(_) => None,
            DbrValue::Enum(val) => Some(vec![*val as f64]),
            DbrValue::Char(val) => Some(widen(val)),
            DbrValue::Int(val) => Some(widen(val)),
            DbrValue::Long(val) => Some(widen(val)),
            DbrValue::Float(val) => Some(widen(val)),
            DbrValue::Double(val) => Some(val.clone()),
        }
    }

    /// Convert to another basic type, refusing anything not representable there
    ///
    /// Numeric values are truncated towards zero. A single string converts to and
    /// from `Char` as its bytes; other strings are parsed.
    pub fn convert_to(&self, basic_type: DbrBasicType) -> Result<DbrValue, ConversionError> {
        fn narrow<U: NumCast>(
            from: &[f64],
            target: DbrBasicType,
        ) -> Result<Vec<U>, ConversionError> {
            from.iter()
                .map(|n| NumCast::from(*n).ok_or(ConversionError::NoConvert(target)))
                .collect()
        }
        if self.get_type() == basic_type {
            return Ok(self.clone());
        }
        let numbers = match (self, basic_type) {
            (DbrValue::String(val), DbrBasicType::Char) => {
                return match val.as_slice() {
                    [] => Ok(DbrValue::Char(Vec::new())),
                    [text] => Ok(DbrValue::Char(
                        text.as_bytes().iter().map(|c| *c as i8).collect(),
                    )),
                    _ => Err(ConversionError::NoConvert(basic_type)),
                };
            }
            (DbrValue::String(_), _) => return self.parse_into(basic_type, &[]),
            (DbrValue::Char(val), DbrBasicType::String) => {
                let bytes: Vec<u8> = val
                    .iter()
                    .take_while(|c| **c != 0)
                    .map(|c| *c as u8)
                    .collect();
                return String::from_utf8(bytes)
                    .map(|text| DbrValue::String(vec![text]))
                    .map_err(|_| ConversionError::NoConvert(basic_type));
            }
            (DbrValue::Enum(val), DbrBasicType::String) => {
                return Ok(DbrValue::String(vec![val.to_string()]));
            }
            (_, DbrBasicType::String) => {
                return Ok(DbrValue::String(
                    self.to_display_string(None, &[])
                        .split(',')
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect(),
                ));
            }
            _ => self
                .numeric_elements()
                .ok_or(ConversionError::NoConvert(basic_type))?,
        };
        Ok(match basic_type {
            DbrBasicType::Enum => DbrValue::Enum(
                numbers
                    .first()
                    .and_then(|v| v.to_u16())
                    .ok_or(ConversionError::NoConvert(basic_type))?,
            ),
            DbrBasicType::Char => DbrValue::Char(narrow(&numbers, basic_type)?),
            DbrBasicType::Int => DbrValue::Int(narrow(&numbers, basic_type)?),
            DbrBasicType::Long => DbrValue::Long(narrow(&numbers, basic_type)?),
            DbrBasicType::Float => DbrValue::Float(narrow(&numbers, basic_type)?),
            DbrBasicType::Double => DbrValue::Double(numbers),
            DbrBasicType::String => DbrValue::String(numbers.iter().map(f64::to_string).collect()),
        })
    }

    /// Convert to a declared type and array shape
    ///
    /// A declared `count` of zero leaves the length alone; otherwise the array is
    /// truncated or zero-padded to exactly `count` elements.
    pub fn coerce(
        &self,
        basic_type: DbrBasicType,
        count: usize,
    ) -> Result<DbrValue, ConversionError> {
        let mut value = self.convert_to(basic_type)?;
        if count > 0 && value.get_count() != count {
            value.resize(count);
        }
        Ok(value)
    }

    /// Equality for change detection. Floats compare by bit pattern, so a NaN
    /// matches an identical NaN.
    pub fn same_as(&self, other: &DbrValue) -> bool {
        match (self, other) {
            (DbrValue::Float(a), DbrValue::Float(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (DbrValue::Double(a), DbrValue::Double(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            _ => self == other,
        }
    }

    /// Resize an array value. Enums always hold a single element.
    pub fn resize(&mut self, to_size: usize) {
        match self {
            DbrValue::Enum(_) => (),
            DbrValue::String(items) => items.resize(to_size, String::new()),
            DbrValue::Char(items) => items.resize(to_size, 0),
            DbrValue::Int(items) => items.resize(to_size, 0),
            DbrValue::Long(items) => items.resize(to_size, 0),
            DbrValue::Float(items) => items.resize(to_size, 0.0),
            DbrValue::Double(items) => items.resize(to_size, 0.0),
        };
    }
}

/// Wrap native scalars and vectors, and unwrap back with conversion
macro_rules! native_conversions {
    ($variant:ident, $typ:ty) => {
        impl From<Vec<$typ>> for DbrValue {
            fn from(value: Vec<$typ>) -> Self {
                DbrValue::$variant(value)
            }
        }
        impl From<$typ> for DbrValue {
            fn from(value: $typ) -> Self {
                DbrValue::$variant(vec![value])
            }
        }
        impl TryFrom<&DbrValue> for Vec<$typ> {
            type Error = ConversionError;
            fn try_from(value: &DbrValue) -> Result<Self, Self::Error> {
                match value.convert_to(DbrBasicType::$variant)? {
                    DbrValue::$variant(v) => Ok(v),
                    _ => Err(ConversionError::NoConvert(DbrBasicType::$variant)),
                }
            }
        }
    };
}
native_conversions!(Char, i8);
native_conversions!(Int, i16);
native_conversions!(Long, i32);
native_conversions!(Float, f32);
native_conversions!(Double, f64);
native_conversions!(String, String);

impl From<&str> for DbrValue {
    fn from(value: &str) -> Self {
        DbrValue::String(vec![value.to_string()])
    }
}

impl From<bool> for DbrValue {
    fn from(value: bool) -> Self {
        DbrValue::Enum(value as u16)
    }
}

/// Basic data types, independent of metadata
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DbrBasicType {
    String = 0,
    Int = 1,
    Float = 2,
    Enum = 3,
    Char = 4,
    Long = 5,
    Double = 6,
}

impl FromStr for DbrBasicType {
    type Err = ConversionError;

    /// Parse the type names used in record configuration
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        let s = upper.strip_prefix("DBR_").unwrap_or(&upper);
        Ok(match s {
            "STRING" => DbrBasicType::String,
            "SHORT" => DbrBasicType::Int,
            "FLOAT" => DbrBasicType::Float,
            "ENUM" | "BOOLEAN" => DbrBasicType::Enum,
            "CHAR" | "BYTE" => DbrBasicType::Char,
            "INT" | "LONG" => DbrBasicType::Long,
            "DOUBLE" => DbrBasicType::Double,
            _ => return Err(ConversionError::UnknownType(s.to_string())),
        })
    }
}

/// A lower/upper pair for each of the four limit kinds a record carries
#[derive(Clone, Debug, PartialEq)]
pub struct Limits {
    pub display: (f64, f64),
    pub warning: (f64, f64),
    pub alarm: (f64, f64),
    pub control: (f64, f64),
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            display: (f64::MIN, f64::MAX),
            warning: (f64::MIN, f64::MAX),
            alarm: (f64::MIN, f64::MAX),
            control: (f64::MIN, f64::MAX),
        }
    }
}

/// Descriptive information about a PV, independent of its current value
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Metadata {
    pub description: String,
    pub units: String,
    pub limits: Limits,
    /// Number of decimal places used when rendering floating point values
    pub precision: Option<usize>,
    pub enum_labels: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_conversions() {
        let v: DbrValue = vec![500i32].into();
        assert!(v.convert_to(DbrBasicType::Int).is_ok());
        assert_eq!(
            v.convert_to(DbrBasicType::Char),
            Err(ConversionError::NoConvert(DbrBasicType::Char))
        );

        let v: DbrValue = vec![500.23f32, 12.7f32].into();
        assert_eq!(v.get_count(), 2);
        // Truncation towards zero
        assert_eq!(
            v.convert_to(DbrBasicType::Int).unwrap(),
            DbrValue::Int(vec![500, 12])
        );
        assert_eq!(
            DbrValue::Double(vec![3.0]).convert_to(DbrBasicType::Enum).unwrap(),
            DbrValue::Enum(3)
        );
        assert!(DbrValue::Double(vec![-1.0]).convert_to(DbrBasicType::Enum).is_err());
    }

    #[test]
    fn coerce_to_shape() {
        let v = DbrValue::Double(vec![1.0, 2.0, 3.0]);
        assert_eq!(
            v.coerce(DbrBasicType::Long, 1).unwrap(),
            DbrValue::Long(vec![1])
        );
        assert_eq!(
            v.coerce(DbrBasicType::Double, 4).unwrap(),
            DbrValue::Double(vec![1.0, 2.0, 3.0, 0.0])
        );
        assert_eq!(v.coerce(DbrBasicType::Double, 0).unwrap(), v);
    }

    #[test]
    fn strings_travel_as_bytes() {
        let text = DbrValue::String(vec!["beam current".to_string()]);
        let bytes = text.convert_to(DbrBasicType::Char).unwrap();
        assert_eq!(bytes.get_count(), 12);
        assert_eq!(bytes.convert_to(DbrBasicType::String).unwrap(), text);
        assert_eq!(
            DbrValue::Long(vec![1, -2]).convert_to(DbrBasicType::String).unwrap(),
            DbrValue::String(vec!["1".into(), "-2".into()])
        );
    }

    #[test]
    fn display_string_round_trip() {
        let labels = vec!["OFF".to_string(), "ON".to_string()];
        let cases = [
            (DbrValue::Double(vec![1.2345]), DbrBasicType::Double, Some(3)),
            (DbrValue::Long(vec![-42]), DbrBasicType::Long, None),
            (DbrValue::Int(vec![7, 8]), DbrBasicType::Int, None),
            (DbrValue::Enum(1), DbrBasicType::Enum, None),
            (DbrValue::Char(vec![-3]), DbrBasicType::Char, None),
            (
                DbrValue::String(vec!["a,b\\c".to_string()]),
                DbrBasicType::String,
                None,
            ),
        ];
        for (value, kind, precision) in cases {
            let text = value.to_display_string(precision, &labels);
            let back = DbrValue::from_display_string(&text, kind, &labels).unwrap();
            match (&value, &back) {
                (DbrValue::Double(a), DbrValue::Double(b)) => {
                    assert!((a[0] - b[0]).abs() < 1e-3, "{a:?} vs {b:?}")
                }
                _ => assert_eq!(value, back),
            }
        }
        assert_eq!(DbrValue::Enum(1).to_display_string(None, &labels), "ON");
    }

    #[test]
    fn parse_type_names() {
        assert_eq!("double".parse::<DbrBasicType>().unwrap(), DbrBasicType::Double);
        assert_eq!("INT".parse::<DbrBasicType>().unwrap(), DbrBasicType::Long);
        assert_eq!("SHORT".parse::<DbrBasicType>().unwrap(), DbrBasicType::Int);
        assert_eq!("DBR_ENUM".parse::<DbrBasicType>().unwrap(), DbrBasicType::Enum);
        assert_eq!("BYTE".parse::<DbrBasicType>().unwrap(), DbrBasicType::Char);
        assert!("QUATERNION".parse::<DbrBasicType>().is_err());
    }

    #[test]
    fn truthiness() {
        assert!(DbrValue::Double(vec![0.5]).as_bool());
        assert!(!DbrValue::Long(vec![0]).as_bool());
        assert!(DbrValue::String(vec!["true".into()]).as_bool());
        assert!(!DbrValue::String(vec![]).as_bool());
    }
}
