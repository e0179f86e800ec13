//! Declared scalar kinds and coercion into them.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The declared type of an entity attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarKind {
    /// Boolean flag.
    Boolean,
    /// 16-bit signed integer.
    Integer16,
    /// 32-bit signed integer.
    Integer32,
    /// 64-bit signed integer.
    Integer64,
    /// Single precision float.
    Float,
    /// Double precision float.
    Double,
    /// Arbitrary precision decimal.
    Decimal,
    /// Point in time.
    Date,
    /// Raw bytes; the only kind that goes through a byte transform.
    Binary,
    /// UTF-8 string.
    String,
}

impl ScalarKind {
    /// Returns true for the kinds stored as numbers.
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ScalarKind::Boolean
                | ScalarKind::Integer16
                | ScalarKind::Integer32
                | ScalarKind::Integer64
                | ScalarKind::Float
                | ScalarKind::Double
                | ScalarKind::Decimal
        )
    }

    /// Coerces a value into this kind.
    ///
    /// Returns `None` for `Null` and for anything that cannot represent a
    /// value of this kind. Callers substitute the attribute default.
    pub fn coerce(&self, value: &Value) -> Option<Value> {
        match self {
            ScalarKind::Boolean => number_of(value).map(|n| Value::Bool(n != 0.0)),
            ScalarKind::Integer16 => {
                integer_of(value, i64::from(i16::MIN), i64::from(i16::MAX)).map(Value::Integer)
            }
            ScalarKind::Integer32 => {
                integer_of(value, i64::from(i32::MIN), i64::from(i32::MAX)).map(Value::Integer)
            }
            ScalarKind::Integer64 => integer_of(value, i64::MIN, i64::MAX).map(Value::Integer),
            ScalarKind::Float => {
                #[allow(clippy::cast_possible_truncation)]
                number_of(value).map(|n| Value::Double(f64::from(n as f32)))
            }
            ScalarKind::Double => number_of(value).map(Value::Double),
            ScalarKind::Decimal => match value {
                Value::Decimal(s) => Some(Value::Decimal(s.clone())),
                Value::Integer(n) => Some(Value::Decimal(n.to_string())),
                Value::Double(d) if d.is_finite() => Some(Value::Decimal(d.to_string())),
                Value::Bool(b) => Some(Value::Decimal(u8::from(*b).to_string())),
                _ => None,
            },
            ScalarKind::Date => value.as_date().map(Value::Date),
            ScalarKind::Binary => value.as_bytes().map(|b| Value::Bytes(b.to_vec())),
            ScalarKind::String => value.as_str().map(|s| Value::Text(s.to_string())),
        }
    }
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalarKind::Boolean => "boolean",
            ScalarKind::Integer16 => "integer16",
            ScalarKind::Integer32 => "integer32",
            ScalarKind::Integer64 => "integer64",
            ScalarKind::Float => "float",
            ScalarKind::Double => "double",
            ScalarKind::Decimal => "decimal",
            ScalarKind::Date => "date",
            ScalarKind::Binary => "binary",
            ScalarKind::String => "string",
        };
        f.write_str(name)
    }
}

fn number_of(value: &Value) -> Option<f64> {
    #[allow(clippy::cast_precision_loss)]
    match value {
        Value::Bool(b) => Some(f64::from(u8::from(*b))),
        Value::Integer(n) => Some(*n as f64),
        Value::Double(d) if d.is_finite() => Some(*d),
        Value::Decimal(s) => s.trim().parse::<f64>().ok().filter(|d| d.is_finite()),
        _ => None,
    }
}

fn integer_of(value: &Value, min: i64, max: i64) -> Option<i64> {
    let n = match value {
        Value::Integer(n) => *n,
        Value::Bool(b) => i64::from(*b),
        Value::Decimal(s) => match s.trim().parse::<i64>() {
            Ok(n) => n,
            Err(_) => truncate(number_of(value)?)?,
        },
        other => truncate(number_of(other)?)?,
    };
    (min..=max).contains(&n).then_some(n)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn truncate(d: f64) -> Option<i64> {
    let t = d.trunc();
    (t >= i64::MIN as f64 && t < i64::MAX as f64).then_some(t as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;

    #[test]
    fn null_is_never_coerced() {
        for kind in [
            ScalarKind::Boolean,
            ScalarKind::Integer64,
            ScalarKind::Double,
            ScalarKind::Decimal,
            ScalarKind::Date,
            ScalarKind::Binary,
            ScalarKind::String,
        ] {
            assert_eq!(kind.coerce(&Value::Null), None, "{kind}");
        }
    }

    #[test]
    fn integers_keep_integer_kind() {
        assert_eq!(
            ScalarKind::Integer16.coerce(&Value::Double(3.7)),
            Some(Value::Integer(3))
        );
        assert_eq!(
            ScalarKind::Integer64.coerce(&Value::Bool(true)),
            Some(Value::Integer(1))
        );
        assert_eq!(
            ScalarKind::Integer32.coerce(&Value::Decimal("42".into())),
            Some(Value::Integer(42))
        );
    }

    #[test]
    fn out_of_range_integer_is_rejected() {
        assert_eq!(ScalarKind::Integer16.coerce(&Value::Integer(70_000)), None);
        assert_eq!(
            ScalarKind::Integer32.coerce(&Value::Integer(70_000)),
            Some(Value::Integer(70_000))
        );
    }

    #[test]
    fn booleans_from_numbers() {
        assert_eq!(
            ScalarKind::Boolean.coerce(&Value::Integer(0)),
            Some(Value::Bool(false))
        );
        assert_eq!(
            ScalarKind::Boolean.coerce(&Value::Integer(5)),
            Some(Value::Bool(true))
        );
        assert_eq!(ScalarKind::Boolean.coerce(&Value::Text("true".into())), None);
    }

    #[test]
    fn float_is_narrowed() {
        let coerced = ScalarKind::Float.coerce(&Value::Double(0.1)).unwrap();
        assert_eq!(coerced, Value::Double(f64::from(0.1f32)));
    }

    #[test]
    fn decimal_from_integer() {
        assert_eq!(
            ScalarKind::Decimal.coerce(&Value::Integer(12)),
            Some(Value::Decimal("12".into()))
        );
    }

    #[test]
    fn non_numeric_kinds_pass_through() {
        let date = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            ScalarKind::Date.coerce(&Value::Date(date)),
            Some(Value::Date(date))
        );
        assert_eq!(
            ScalarKind::Binary.coerce(&Value::Bytes(vec![1, 2])),
            Some(Value::Bytes(vec![1, 2]))
        );
        assert_eq!(
            ScalarKind::String.coerce(&Value::Text("hi".into())),
            Some(Value::Text("hi".into()))
        );
        // No cross-kind conversion for these.
        assert_eq!(ScalarKind::String.coerce(&Value::Integer(1)), None);
        assert_eq!(ScalarKind::Binary.coerce(&Value::Text("ab".into())), None);
    }

    #[test]
    fn nan_is_rejected() {
        assert_eq!(ScalarKind::Double.coerce(&Value::Double(f64::NAN)), None);
        assert_eq!(ScalarKind::Integer64.coerce(&Value::Double(f64::INFINITY)), None);
    }

    proptest! {
        #[test]
        fn integer32_preserves_in_range(n in any::<i32>()) {
            let coerced = ScalarKind::Integer32.coerce(&Value::Integer(i64::from(n)));
            prop_assert_eq!(coerced, Some(Value::Integer(i64::from(n))));
        }

        #[test]
        fn double_preserves_finite(d in proptest::num::f64::NORMAL) {
            prop_assert_eq!(ScalarKind::Double.coerce(&Value::Double(d)), Some(Value::Double(d)));
        }

        #[test]
        fn coercion_is_idempotent(n in any::<i64>()) {
            let kinds = [ScalarKind::Boolean, ScalarKind::Integer16, ScalarKind::Integer64, ScalarKind::Double];
            for kind in kinds {
                if let Some(once) = kind.coerce(&Value::Integer(n)) {
                    prop_assert_eq!(kind.coerce(&once), Some(once.clone()));
                }
            }
        }
    }
}
