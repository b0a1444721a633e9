//! Numeric values produced by the evaluator.

use std::fmt;

use num_bigint::BigInt;
use num_traits::ToPrimitive;

use super::EvalError;

/// Widest integer an evaluation may produce.
pub const MAX_INT_BITS: u64 = 1 << 16;

/// An evaluated number. Integers are unbounded up to [`MAX_INT_BITS`] and stay
/// integral until an operation (true division, a float operand, a
/// float-valued function) forces a float.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(BigInt),
    Float(f64),
}

impl Value {
    pub fn int(value: impl Into<BigInt>) -> Self {
        Self::Int(value.into())
    }

    /// The value as a float. Integers too wide for `f64` are an overflow.
    pub fn to_f64(&self) -> Result<f64, EvalError> {
        match self {
            Self::Int(v) => int_to_f64(v),
            Self::Float(v) => Ok(*v),
        }
    }

    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Float(_) => "float",
        }
    }
}

pub fn int_to_f64(value: &BigInt) -> Result<f64, EvalError> {
    value
        .to_f64()
        .filter(|x| x.is_finite())
        .ok_or_else(|| EvalError::Overflow("int too large to convert to float".into()))
}

/// Wrap `value`, rejecting integers wider than [`MAX_INT_BITS`].
pub fn bounded(value: BigInt) -> Result<Value, EvalError> {
    if value.bits() > MAX_INT_BITS {
        return Err(too_wide());
    }
    Ok(Value::Int(value))
}

pub fn too_wide() -> EvalError {
    EvalError::Overflow(format!("integer result exceeds {MAX_INT_BITS} bits"))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => f.write_str(&format_float(*v)),
        }
    }
}

/// Render a float the way a Python REPL does: shortest round-trip digits,
/// always with a decimal point or exponent, scientific notation outside
/// `1e-4 <= |x| < 1e16`.
pub fn format_float(value: f64) -> String {
    if value.is_nan() {
        return "nan".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if value == 0.0 {
        return if value.is_sign_negative() { "-0.0" } else { "0.0" }.to_string();
    }

    let scientific = format!("{value:e}");
    let (mantissa, exponent) = scientific
        .split_once('e')
        .unwrap_or((scientific.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);

    if (-4..16).contains(&exponent) {
        let plain = format!("{value}");
        if plain.contains('.') {
            plain
        } else {
            format!("{plain}.0")
        }
    } else {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exponent.unsigned_abs())
    }
}
