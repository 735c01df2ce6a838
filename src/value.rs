use half::f16;
use serde::{Deserialize, Serialize};
use std::convert::{TryFrom, TryInto};
use std::fmt;

use crate::Error;

// Numeric casts through f64, used by the lossy API
trait LossyF64: Sized {
    fn lossy_to_f64(self) -> f64;
    fn lossy_from_f64(value: f64) -> Self;
}

macro_rules! lossy_int {
    ($via:ty => $($ty:ty),*) => {
        $(impl LossyF64 for $ty {
            fn lossy_to_f64(self) -> f64 {
                self as f64
            }

            // Truncated to the width of the type: 257 gives 1 for a u8
            fn lossy_from_f64(value: f64) -> Self {
                (value as $via) as $ty
            }
        })*
    };
}

lossy_int!(u64 => u8, u16, u32, u64);
lossy_int!(i64 => i8, i16, i32, i64);

impl LossyF64 for f16 {
    fn lossy_to_f64(self) -> f64 {
        self.to_f64()
    }

    fn lossy_from_f64(value: f64) -> Self {
        f16::from_f64(value)
    }
}

impl LossyF64 for f32 {
    fn lossy_to_f64(self) -> f64 {
        self as f64
    }

    fn lossy_from_f64(value: f64) -> Self {
        value as f32
    }
}

impl LossyF64 for f64 {
    fn lossy_to_f64(self) -> f64 {
        self
    }

    fn lossy_from_f64(value: f64) -> Self {
        value
    }
}

macro_rules! value_types {
    ($($variant:ident: $ty:ident, $len:literal;)*) => {
        /// # Typed data value
        ///
        /// One variant per data type that can be exchanged with the Crazyflie by the
        /// [log](crate::subsystems::log) and [param](crate::subsystems::param) subsystems.
        ///
        /// Values are encoded in little endian: [Value::from_le_bytes] decodes them and
        /// `Vec<u8>::from(value)` encodes them.
        ///
        /// Conversion to and from Rust primitives only works for the exact matching
        /// type:
        /// ```
        /// # use std::convert::TryInto;
        /// # use crazyflie_crtp::Value;
        /// let v: u32 = Value::U32(42).try_into().unwrap();
        /// let w: Result<u32, _> = Value::U8(42).try_into();
        /// assert!(w.is_err());
        /// ```
        #[derive(Debug, Clone, Copy, PartialEq)]
        pub enum Value {
            $($variant($ty),)*
        }

        /// Type of a [Value]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub enum ValueType {
            $($variant,)*
        }

        impl ValueType {
            /// Size of the little-endian encoding of a value of this type
            pub fn byte_length(&self) -> usize {
                match self {
                    $(ValueType::$variant => $len,)*
                }
            }
        }

        impl From<Value> for ValueType {
            fn from(value: Value) -> Self {
                match value {
                    $(Value::$variant(_) => ValueType::$variant,)*
                }
            }
        }

        impl fmt::Display for Value {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $(Value::$variant(v) => fmt::Display::fmt(v, f),)*
                }
            }
        }

        impl From<Value> for Vec<u8> {
            fn from(value: Value) -> Self {
                match value {
                    $(Value::$variant(v) => v.to_le_bytes().to_vec(),)*
                }
            }
        }

        impl Value {
            /// Decode a little-endian buffer as `value_type`
            ///
            /// The buffer length must be exactly the length of the type.
            pub fn from_le_bytes(bytes: &[u8], value_type: ValueType) -> Result<Value, Error> {
                Ok(match value_type {
                    $(ValueType::$variant => Value::$variant($ty::from_le_bytes(bytes.try_into()?)),)*
                })
            }

            /// Numeric value as a [f64]
            ///
            /// Exact for every type except large `u64` and `i64` values.
            pub fn to_f64_lossy(&self) -> f64 {
                match *self {
                    $(Value::$variant(v) => v.lossy_to_f64(),)*
                }
            }

            /// Make a [Value] of `value_type` from a [f64]
            ///
            /// Integers are truncated to the width of the type (setting `257` to a `u8` gives
            /// `1`) and floats are rounded to the precision of the type. Values out of range
            /// of a float type are undefined.
            pub fn from_f64_lossy(value_type: ValueType, value: f64) -> Value {
                match value_type {
                    $(ValueType::$variant => Value::$variant(LossyF64::lossy_from_f64(value)),)*
                }
            }
        }

        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }

            impl TryFrom<Value> for $ty {
                type Error = Error;

                fn try_from(value: Value) -> Result<$ty, Self::Error> {
                    match value {
                        Value::$variant(v) => Ok(v),
                        other => Err(Error::ConversionError(format!(
                            "{:?} is not a {}",
                            other,
                            stringify!($ty)
                        ))),
                    }
                }
            }
        )*
    };
}

value_types! {
    U8: u8, 1;
    U16: u16, 2;
    U32: u32, 4;
    U64: u64, 8;
    I8: i8, 1;
    I16: i16, 2;
    I32: i32, 4;
    I64: i64, 8;
    F16: f16, 2;
    F32: f32, 4;
    F64: f64, 8;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn le_bytes_must_match_type_length() {
        let v = Value::from_le_bytes(&[0x34, 0x12], ValueType::U16).unwrap();
        assert_eq!(v, Value::U16(0x1234));

        assert!(Value::from_le_bytes(&[0x34], ValueType::U16).is_err());
    }

    #[test]
    fn lossy_conversion_truncates_integers() {
        assert_eq!(Value::from_f64_lossy(ValueType::U8, 257.0), Value::U8(1));
        assert_eq!(Value::from_f64_lossy(ValueType::I16, -3.7), Value::I16(-3));
        assert_eq!(Value::I8(-5).to_f64_lossy(), -5.0);
    }

    #[test]
    fn encoding_matches_type_length() {
        for value in [Value::U8(1), Value::F16(f16::from_f32(1.5)), Value::F64(2.0)] {
            let bytes: Vec<u8> = value.into();
            assert_eq!(bytes.len(), ValueType::from(value).byte_length());
        }
    }

    #[test]
    fn display_prints_the_number() {
        assert_eq!(Value::I32(-12).to_string(), "-12");
        assert_eq!(Value::F32(0.5).to_string(), "0.5");
    }

    #[test]
    fn conversion_needs_the_exact_type() {
        assert_eq!(u16::try_from(Value::U16(7)).unwrap(), 7);
        assert!(matches!(
            u16::try_from(Value::I16(7)),
            Err(Error::ConversionError(_))
        ));
    }
}
