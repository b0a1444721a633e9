//! Tree-walking evaluator over the built-in table.

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{One, Signed, ToPrimitive, Zero};

use super::builtins::{self, Builtin, Function};
use super::parser::{BinaryOp, Expr, UnaryOp};
use super::value::{bounded, int_to_f64, too_wide, Value, MAX_INT_BITS};
use super::EvalError;

/// What a sub-expression evaluated to. Functions are first-class only so that
/// misuse (`sqrt + 1`, `pi(2)`) can be reported precisely.
#[derive(Debug, Clone)]
enum Operand {
    Number(Value),
    Function(&'static Function),
}

impl Operand {
    const fn type_name(&self) -> &'static str {
        match self {
            Self::Number(v) => v.type_name(),
            Self::Function(_) => "builtin_function_or_method",
        }
    }
}

pub fn evaluate(expr: &Expr) -> Result<Value, EvalError> {
    match eval(expr)? {
        Operand::Number(value) => Ok(value),
        Operand::Function(f) => Err(EvalError::Type(format!(
            "expression evaluates to the function '{}', not a number",
            f.name
        ))),
    }
}

fn eval(expr: &Expr) -> Result<Operand, EvalError> {
    match expr {
        Expr::Int(v) => Ok(Operand::Number(Value::Int(v.clone()))),
        Expr::Float(v) => Ok(Operand::Number(Value::Float(*v))),
        Expr::Str(_) => Err(EvalError::Unsupported("string literals")),
        Expr::Attribute { .. } => Err(EvalError::Unsupported("attribute lookups")),
        Expr::Name(name) => match builtins::lookup(name) {
            Some(Builtin::Constant(v)) => Ok(Operand::Number(Value::Float(v))),
            Some(Builtin::Function(f)) => Ok(Operand::Function(f)),
            None => Err(EvalError::UnknownName(name.clone())),
        },
        Expr::Unary { op, operand } => {
            let value = number(eval(operand)?, |t| {
                format!("bad operand type for unary {}: '{t}'", unary_symbol(*op))
            })?;
            Ok(Operand::Number(unary(*op, value)))
        }
        Expr::Binary { op, left, right } => {
            let left = eval(left)?;
            let right = eval(right)?;
            let (Operand::Number(l), Operand::Number(r)) = (&left, &right) else {
                return Err(EvalError::Type(format!(
                    "unsupported operand type(s) for {}: '{}' and '{}'",
                    op.symbol(),
                    left.type_name(),
                    right.type_name()
                )));
            };
            binary(*op, l, r).map(Operand::Number)
        }
        Expr::Call { callee, args } => {
            let callee = eval(callee)?;
            let Operand::Function(f) = callee else {
                return Err(EvalError::Type(format!(
                    "'{}' object is not callable",
                    callee.type_name()
                )));
            };
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(number(eval(arg)?, |t| {
                    format!("must be real number, not {t}")
                })?);
            }
            f.call(&values).map(Operand::Number)
        }
    }
}

fn number(operand: Operand, message: impl FnOnce(&str) -> String) -> Result<Value, EvalError> {
    match operand {
        Operand::Number(v) => Ok(v),
        Operand::Function(_) => Err(EvalError::Type(message(operand.type_name()))),
    }
}

const fn unary_symbol(op: UnaryOp) -> &'static str {
    match op {
        UnaryOp::Plus => "+",
        UnaryOp::Minus => "-",
    }
}

fn unary(op: UnaryOp, value: Value) -> Value {
    match (op, value) {
        (UnaryOp::Plus, v) => v,
        (UnaryOp::Minus, Value::Int(v)) => Value::Int(-v),
        (UnaryOp::Minus, Value::Float(v)) => Value::Float(-v),
    }
}

fn binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => int_binary(op, a, b),
        _ => float_binary(op, left.to_f64()?, right.to_f64()?),
    }
}

fn int_binary(op: BinaryOp, a: &BigInt, b: &BigInt) -> Result<Value, EvalError> {
    match op {
        BinaryOp::Add => bounded(a + b),
        BinaryOp::Sub => bounded(a - b),
        BinaryOp::Mul => bounded(a * b),
        BinaryOp::Div => {
            if b.is_zero() {
                return Err(EvalError::ZeroDivision("division by zero"));
            }
            true_divide(a, b)
        }
        BinaryOp::FloorDiv | BinaryOp::Mod => {
            if b.is_zero() {
                return Err(EvalError::ZeroDivision(
                    "integer division or modulo by zero",
                ));
            }
            let (q, r) = a.div_mod_floor(b);
            Ok(Value::Int(if op == BinaryOp::FloorDiv { q } else { r }))
        }
        BinaryOp::Pow => int_pow(a, b),
    }
}

/// `a / b` for integers. Operands that fit a float exactly divide as floats;
/// wider ones divide in integers first so the quotient can still be finite.
fn true_divide(a: &BigInt, b: &BigInt) -> Result<Value, EvalError> {
    let exact_bits = u64::from(f64::MANTISSA_DIGITS);
    if a.bits() <= exact_bits && b.bits() <= exact_bits {
        return Ok(Value::Float(int_to_f64(a)? / int_to_f64(b)?));
    }
    let (q, r) = a.div_rem(b);
    let quotient = int_to_f64(&q).map_err(|_| {
        EvalError::Overflow("integer division result too large for a float".into())
    })?;
    let shift = b.bits().saturating_sub(exact_bits);
    let fraction = int_to_f64(&(r >> shift))? / int_to_f64(&(b >> shift))?;
    Ok(Value::Float(quotient + fraction))
}

fn int_pow(base: &BigInt, exponent: &BigInt) -> Result<Value, EvalError> {
    if exponent.is_negative() {
        if base.is_zero() {
            return Err(EvalError::ZeroDivision(
                "0.0 cannot be raised to a negative power",
            ));
        }
        return float_binary(BinaryOp::Pow, int_to_f64(base)?, int_to_f64(exponent)?);
    }
    if base.is_zero() || base.is_one() {
        let result = if exponent.is_zero() {
            BigInt::one()
        } else {
            base.clone()
        };
        return Ok(Value::Int(result));
    }
    if (-base).is_one() {
        return Ok(Value::int(if exponent.is_even() { 1 } else { -1 }));
    }
    // |base| >= 2 here, so the result needs at least `exponent` bits.
    let exponent = exponent
        .to_u32()
        .filter(|e| (base.bits() - 1).saturating_mul(u64::from(*e)) < MAX_INT_BITS)
        .ok_or_else(too_wide)?;
    bounded(base.pow(exponent))
}

fn float_binary(op: BinaryOp, a: f64, b: f64) -> Result<Value, EvalError> {
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => {
            if b == 0.0 {
                return Err(EvalError::ZeroDivision("float division by zero"));
            }
            a / b
        }
        BinaryOp::FloorDiv => {
            if b == 0.0 {
                return Err(EvalError::ZeroDivision("float floor division by zero"));
            }
            (a / b).floor()
        }
        BinaryOp::Mod => {
            if b == 0.0 {
                return Err(EvalError::ZeroDivision("float modulo"));
            }
            let r = a % b;
            if r != 0.0 && ((r < 0.0) != (b < 0.0)) {
                r + b
            } else {
                r
            }
        }
        BinaryOp::Pow => {
            if a == 0.0 && b < 0.0 {
                return Err(EvalError::ZeroDivision(
                    "0.0 cannot be raised to a negative power",
                ));
            }
            if a < 0.0 && b.is_finite() && b.fract() != 0.0 {
                return Err(EvalError::Unsupported("complex results"));
            }
            let r = a.powf(b);
            if r.is_infinite() && a.is_finite() && b.is_finite() {
                return Err(EvalError::MathRange);
            }
            r
        }
    };
    Ok(Value::Float(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::lexer::tokenize;
    use crate::expr::parser::parse;

    fn eval_str(source: &str) -> Result<Value, EvalError> {
        let parsed = parse(&tokenize(source).unwrap()).unwrap();
        evaluate(&parsed.root)
    }

    #[test]
    fn integer_arithmetic_stays_integral() {
        assert_eq!(eval_str("((30+10)*5+1)"), Ok(Value::int(201)));
        assert_eq!(eval_str("2**10"), Ok(Value::int(1024)));
        assert_eq!(eval_str("-2**2"), Ok(Value::int(-4)));
        assert_eq!(eval_str("2**3**2"), Ok(Value::int(512)));
    }

    #[test]
    fn true_division_yields_float() {
        assert_eq!(eval_str("7/2"), Ok(Value::Float(3.5)));
        assert_eq!(eval_str("4/2"), Ok(Value::Float(2.0)));
        assert_eq!(eval_str("2**-1"), Ok(Value::Float(0.5)));
    }

    #[test]
    fn floor_division_and_modulo_follow_divisor_sign() {
        assert_eq!(eval_str("7//2"), Ok(Value::int(3)));
        assert_eq!(eval_str("-7//2"), Ok(Value::int(-4)));
        assert_eq!(eval_str("-7%3"), Ok(Value::int(2)));
        assert_eq!(eval_str("7%-3"), Ok(Value::int(-2)));
        assert_eq!(eval_str("-7.5%2"), Ok(Value::Float(0.5)));
        assert_eq!(eval_str("7.0//2"), Ok(Value::Float(3.0)));
    }

    #[test]
    fn mixed_operands_promote_to_float() {
        assert_eq!(eval_str("1 + 0.5"), Ok(Value::Float(1.5)));
        assert_eq!(eval_str("sqrt(16) * 2"), Ok(Value::Float(8.0)));
    }

    #[test]
    fn constants_and_calls() {
        assert_eq!(eval_str("floor(pi)"), Ok(Value::int(3)));
        assert_eq!(eval_str("cos(0)"), Ok(Value::Float(1.0)));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        assert_eq!(
            eval_str("1/0"),
            Err(EvalError::ZeroDivision("division by zero"))
        );
        assert!(eval_str("1//0").is_err());
        assert!(eval_str("1%0").is_err());
        assert!(eval_str("1.0/0").is_err());
        assert!(eval_str("0**-1").is_err());
    }

    #[test]
    fn integers_grow_past_machine_width() {
        let int = |digits: &str| -> Result<Value, EvalError> {
            Ok(Value::Int(digits.parse().unwrap()))
        };
        assert_eq!(eval_str("2**64"), int("18446744073709551616"));
        assert_eq!(eval_str("10**20"), int("100000000000000000000"));
        assert_eq!(
            eval_str("99999999999999999999 + 1"),
            int("100000000000000000000")
        );
        assert_eq!(
            eval_str("9223372036854775807 + 1"),
            int("9223372036854775808")
        );
        assert_eq!(eval_str("-(2**63) - 1"), int("-9223372036854775809"));
        assert_eq!(eval_str("(2**100) // 2**98"), Ok(Value::int(4)));
        assert_eq!(eval_str("-(2**70) % 3"), Ok(Value::int(2)));
        assert_eq!(eval_str("(-1)**(10**30 + 1)"), Ok(Value::int(-1)));
    }

    #[test]
    fn wide_integer_division_stays_finite() {
        assert_eq!(eval_str("2**64 / 2**62"), Ok(Value::Float(4.0)));
        assert_eq!(eval_str("10**400 / 10**399"), Ok(Value::Float(10.0)));
        assert!(matches!(eval_str("10**400 / 3"), Err(EvalError::Overflow(_))));
        assert!(matches!(eval_str("10**400 * 1.0"), Err(EvalError::Overflow(_))));
    }

    #[test]
    fn integer_size_is_capped() {
        assert!(matches!(eval_str("2**100000"), Err(EvalError::Overflow(_))));
        assert!(matches!(eval_str("7**(10**30)"), Err(EvalError::Overflow(_))));
        assert!(matches!(
            eval_str("(2**60000) * (2**60000)"),
            Err(EvalError::Overflow(_))
        ));
        assert_eq!(eval_str("10.0**400"), Err(EvalError::MathRange));
    }

    #[test]
    fn functions_are_not_numbers() {
        assert!(matches!(eval_str("sqrt + 1"), Err(EvalError::Type(_))));
        assert!(matches!(eval_str("sqrt"), Err(EvalError::Type(_))));
        assert!(matches!(eval_str("-sqrt"), Err(EvalError::Type(_))));
        assert!(matches!(eval_str("sqrt(sqrt)"), Err(EvalError::Type(_))));
    }

    #[test]
    fn constants_are_not_callable() {
        let err = eval_str("pi(2)").unwrap_err();
        assert_eq!(err.to_string(), "'float' object is not callable");
    }

    #[test]
    fn strings_and_attributes_never_evaluate() {
        assert!(matches!(eval_str("'os'"), Err(EvalError::Unsupported(_))));
        assert!(matches!(eval_str("(1).real"), Err(EvalError::Unsupported(_))));
    }

    #[test]
    fn negative_base_fractional_power_is_rejected() {
        assert!(matches!(eval_str("(-8)**0.5"), Err(EvalError::Unsupported(_))));
    }
}
