//! The fixed table of constants and functions an expression may reference.
//!
//! Anything outside this table is unreachable from an expression, whatever
//! the configured allow-list says.

use std::f64::consts::{E, PI, TAU};

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{FromPrimitive, One, Signed, ToPrimitive, Zero};

use super::value::{too_wide, Value, MAX_INT_BITS};
use super::EvalError;

type NativeFn = fn(&[Value]) -> Result<Value, EvalError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    Between(usize, usize),
    AtLeast(usize),
}

#[derive(Debug)]
pub struct Function {
    pub name: &'static str,
    pub arity: Arity,
    native: NativeFn,
}

impl Function {
    const fn new(name: &'static str, arity: Arity, native: NativeFn) -> Self {
        Self {
            name,
            arity,
            native,
        }
    }

    pub fn call(&self, args: &[Value]) -> Result<Value, EvalError> {
        self.check_arity(args.len())?;
        (self.native)(args)
    }

    fn check_arity(&self, given: usize) -> Result<(), EvalError> {
        let name = self.name;
        let plural = |n: usize| if n == 1 { "argument" } else { "arguments" };
        match self.arity {
            Arity::Exact(n) if n != given => Err(EvalError::Type(format!(
                "{name}() takes exactly {n} {} ({given} given)",
                plural(n)
            ))),
            Arity::Between(min, _) if given < min => Err(EvalError::Type(format!(
                "{name}() expected at least {min} {}, got {given}",
                plural(min)
            ))),
            Arity::Between(_, max) if given > max => Err(EvalError::Type(format!(
                "{name}() expected at most {max} {}, got {given}",
                plural(max)
            ))),
            Arity::AtLeast(min) if given < min => Err(EvalError::Type(format!(
                "{name}() expected at least {min} {}, got {given}",
                plural(min)
            ))),
            _ => Ok(()),
        }
    }
}

/// A resolved name.
#[derive(Debug, Clone, Copy)]
pub enum Builtin {
    Constant(f64),
    Function(&'static Function),
}

const CONSTANTS: &[(&str, f64)] = &[
    ("pi", PI),
    ("e", E),
    ("tau", TAU),
    ("inf", f64::INFINITY),
    ("nan", f64::NAN),
];

static FUNCTIONS: &[Function] = &[
    Function::new("acos", Arity::Exact(1), |a| float1(a, f64::acos)),
    Function::new("acosh", Arity::Exact(1), |a| float1(a, f64::acosh)),
    Function::new("asin", Arity::Exact(1), |a| float1(a, f64::asin)),
    Function::new("asinh", Arity::Exact(1), |a| float1(a, f64::asinh)),
    Function::new("atan", Arity::Exact(1), |a| float1(a, f64::atan)),
    Function::new("atan2", Arity::Exact(2), |a| float2(a, f64::atan2)),
    Function::new("atanh", Arity::Exact(1), atanh),
    Function::new("cbrt", Arity::Exact(1), |a| float1(a, f64::cbrt)),
    Function::new("ceil", Arity::Exact(1), |a| round_to_int(&a[0], f64::ceil)),
    Function::new("comb", Arity::Exact(2), comb),
    Function::new("copysign", Arity::Exact(2), |a| float2(a, f64::copysign)),
    Function::new("cos", Arity::Exact(1), |a| float1(a, f64::cos)),
    Function::new("cosh", Arity::Exact(1), |a| float1(a, f64::cosh)),
    Function::new("degrees", Arity::Exact(1), |a| float1(a, f64::to_degrees)),
    Function::new("erf", Arity::Exact(1), |a| float1(a, libm::erf)),
    Function::new("erfc", Arity::Exact(1), |a| float1(a, libm::erfc)),
    Function::new("exp", Arity::Exact(1), |a| float1(a, f64::exp)),
    Function::new("exp2", Arity::Exact(1), |a| float1(a, f64::exp2)),
    Function::new("expm1", Arity::Exact(1), |a| float1(a, f64::exp_m1)),
    Function::new("fabs", Arity::Exact(1), |a| float1(a, f64::abs)),
    Function::new("factorial", Arity::Exact(1), factorial),
    Function::new("floor", Arity::Exact(1), |a| round_to_int(&a[0], f64::floor)),
    Function::new("fmod", Arity::Exact(2), |a| float2(a, |x, y| x % y)),
    Function::new("gamma", Arity::Exact(1), |a| gamma_like(a, libm::tgamma)),
    Function::new("gcd", Arity::AtLeast(0), gcd),
    Function::new("hypot", Arity::AtLeast(0), hypot),
    Function::new("isqrt", Arity::Exact(1), isqrt),
    Function::new("lcm", Arity::AtLeast(0), lcm),
    Function::new("ldexp", Arity::Exact(2), ldexp),
    Function::new("lgamma", Arity::Exact(1), |a| gamma_like(a, libm::lgamma)),
    Function::new("log", Arity::Between(1, 2), log),
    Function::new("log10", Arity::Exact(1), |a| positive_log(a, f64::log10)),
    Function::new("log1p", Arity::Exact(1), log1p),
    Function::new("log2", Arity::Exact(1), |a| positive_log(a, f64::log2)),
    Function::new("perm", Arity::Between(1, 2), perm),
    Function::new("pow", Arity::Exact(2), pow),
    Function::new("radians", Arity::Exact(1), |a| float1(a, f64::to_radians)),
    Function::new("remainder", Arity::Exact(2), |a| float2(a, libm::remainder)),
    Function::new("sin", Arity::Exact(1), |a| float1(a, f64::sin)),
    Function::new("sinh", Arity::Exact(1), |a| float1(a, f64::sinh)),
    Function::new("sqrt", Arity::Exact(1), |a| float1(a, f64::sqrt)),
    Function::new("tan", Arity::Exact(1), |a| float1(a, f64::tan)),
    Function::new("tanh", Arity::Exact(1), |a| float1(a, f64::tanh)),
    Function::new("trunc", Arity::Exact(1), |a| round_to_int(&a[0], f64::trunc)),
];

/// Resolve `name` against the table.
pub fn lookup(name: &str) -> Option<Builtin> {
    if let Some((_, value)) = CONSTANTS.iter().find(|(n, _)| *n == name) {
        return Some(Builtin::Constant(*value));
    }
    FUNCTIONS
        .iter()
        .find(|f| f.name == name)
        .map(Builtin::Function)
}

/// Every name the evaluator can resolve.
pub fn names() -> impl Iterator<Item = &'static str> {
    CONSTANTS
        .iter()
        .map(|(name, _)| *name)
        .chain(FUNCTIONS.iter().map(|f| f.name))
}

/// Python reports NaN from non-NaN input as a domain error and an infinite
/// result from finite input as a range error.
fn float_result(result: f64, inputs: &[f64]) -> Result<Value, EvalError> {
    if result.is_nan() && !inputs.iter().any(|x| x.is_nan()) {
        return Err(EvalError::MathDomain);
    }
    if result.is_infinite() && inputs.iter().all(|x| x.is_finite()) {
        return Err(EvalError::MathRange);
    }
    Ok(Value::Float(result))
}

fn float1(args: &[Value], f: fn(f64) -> f64) -> Result<Value, EvalError> {
    let x = args[0].to_f64()?;
    float_result(f(x), &[x])
}

fn float2(args: &[Value], f: fn(f64, f64) -> f64) -> Result<Value, EvalError> {
    let (x, y) = (args[0].to_f64()?, args[1].to_f64()?);
    float_result(f(x, y), &[x, y])
}

fn positive_log(args: &[Value], f: fn(f64) -> f64) -> Result<Value, EvalError> {
    let x = args[0].to_f64()?;
    if x <= 0.0 {
        return Err(EvalError::MathDomain);
    }
    float_result(f(x), &[x])
}

fn log(args: &[Value]) -> Result<Value, EvalError> {
    let x = args[0].to_f64()?;
    if x <= 0.0 {
        return Err(EvalError::MathDomain);
    }
    let Some(base) = args.get(1).map(Value::to_f64).transpose()? else {
        return float_result(x.ln(), &[x]);
    };
    if base <= 0.0 {
        return Err(EvalError::MathDomain);
    }
    if base == 1.0 {
        return Err(EvalError::ZeroDivision("float division by zero"));
    }
    float_result(x.ln() / base.ln(), &[x, base])
}

fn log1p(args: &[Value]) -> Result<Value, EvalError> {
    let x = args[0].to_f64()?;
    if x <= -1.0 {
        return Err(EvalError::MathDomain);
    }
    float_result(x.ln_1p(), &[x])
}

fn atanh(args: &[Value]) -> Result<Value, EvalError> {
    let x = args[0].to_f64()?;
    if x.abs() >= 1.0 {
        return Err(EvalError::MathDomain);
    }
    float_result(x.atanh(), &[x])
}

/// `gamma` and `lgamma` have poles at zero and the negative integers.
fn gamma_like(args: &[Value], f: fn(f64) -> f64) -> Result<Value, EvalError> {
    let x = args[0].to_f64()?;
    if x <= 0.0 && x.fract() == 0.0 {
        return Err(EvalError::MathDomain);
    }
    float_result(f(x), &[x])
}

fn ldexp(args: &[Value]) -> Result<Value, EvalError> {
    let x = args[0].to_f64()?;
    let Value::Int(exp) = &args[1] else {
        return Err(EvalError::Type(
            "Expected an int as second argument to ldexp.".into(),
        ));
    };
    // Exponents past the i32 range saturate to zero or infinity either way.
    let exp = exp
        .to_i32()
        .unwrap_or(if exp.is_negative() { i32::MIN } else { i32::MAX });
    float_result(libm::ldexp(x, exp), &[x])
}

fn pow(args: &[Value]) -> Result<Value, EvalError> {
    let (x, y) = (args[0].to_f64()?, args[1].to_f64()?);
    if x == 0.0 && y < 0.0 {
        return Err(EvalError::MathDomain);
    }
    float_result(x.powf(y), &[x, y])
}

fn hypot(args: &[Value]) -> Result<Value, EvalError> {
    let coords = args
        .iter()
        .map(Value::to_f64)
        .collect::<Result<Vec<_>, _>>()?;
    let result = coords.iter().fold(0.0_f64, |acc, x| acc.hypot(*x));
    float_result(result, &coords)
}

/// Convert a float to an integer after rounding it with `round`.
fn round_to_int(value: &Value, round: fn(f64) -> f64) -> Result<Value, EvalError> {
    let x = match value {
        Value::Int(v) => return Ok(Value::Int(v.clone())),
        Value::Float(x) => round(*x),
    };
    if x.is_nan() {
        return Err(EvalError::Value("cannot convert float NaN to integer".into()));
    }
    BigInt::from_f64(x).map(Value::Int).ok_or_else(|| {
        EvalError::Overflow("cannot convert float infinity to integer".into())
    })
}

fn int_arg(value: &Value) -> Result<&BigInt, EvalError> {
    match value {
        Value::Int(v) => Ok(v),
        Value::Float(_) => Err(EvalError::Type(
            "'float' object cannot be interpreted as an integer".into(),
        )),
    }
}

/// Multiply `acc` by each factor, giving up once it outgrows the integer cap.
/// Every caller's product only grows, so stopping early is exact.
fn bounded_product(factors: impl Iterator<Item = BigInt>) -> Result<BigInt, EvalError> {
    let mut acc = BigInt::one();
    for factor in factors {
        acc *= factor;
        if acc.bits() > MAX_INT_BITS {
            return Err(too_wide());
        }
    }
    Ok(acc)
}

fn factorial(args: &[Value]) -> Result<Value, EvalError> {
    let n = int_arg(&args[0])?;
    if n.is_negative() {
        return Err(EvalError::Value(
            "factorial() not defined for negative values".into(),
        ));
    }
    let n = n.to_u64().ok_or_else(too_wide)?;
    bounded_product((2..=n).map(BigInt::from)).map(Value::Int)
}

fn isqrt(args: &[Value]) -> Result<Value, EvalError> {
    let n = int_arg(&args[0])?;
    if n.is_negative() {
        return Err(EvalError::Value(
            "isqrt() argument must be nonnegative".into(),
        ));
    }
    Ok(Value::Int(n.sqrt()))
}

fn gcd(args: &[Value]) -> Result<Value, EvalError> {
    let mut acc = BigInt::zero();
    for arg in args {
        acc = acc.gcd(int_arg(arg)?);
    }
    Ok(Value::Int(acc))
}

fn lcm(args: &[Value]) -> Result<Value, EvalError> {
    let mut acc = BigInt::one();
    for arg in args {
        let v = int_arg(arg)?;
        acc = if acc.is_zero() || v.is_zero() {
            BigInt::zero()
        } else {
            acc.lcm(v).abs()
        };
        if acc.bits() > MAX_INT_BITS {
            return Err(too_wide());
        }
    }
    Ok(Value::Int(acc))
}

fn non_negative(value: &Value, what: &str) -> Result<BigInt, EvalError> {
    let v = int_arg(value)?;
    if v.is_negative() {
        return Err(EvalError::Value(format!(
            "{what} must be a non-negative integer"
        )));
    }
    Ok(v.clone())
}

fn comb(args: &[Value]) -> Result<Value, EvalError> {
    let n = non_negative(&args[0], "n")?;
    let k = non_negative(&args[1], "k")?;
    if k > n {
        return Ok(Value::int(0));
    }
    let rest = &n - &k;
    let k = k.min(rest).to_u64().ok_or_else(too_wide)?;
    // C(n, i + 1) = C(n, i) * (n - i) / (i + 1), and it grows while i < k.
    let mut acc = BigInt::one();
    for i in 0..k {
        acc = acc * (&n - i) / (i + 1);
        if acc.bits() > MAX_INT_BITS {
            return Err(too_wide());
        }
    }
    Ok(Value::Int(acc))
}

fn perm(args: &[Value]) -> Result<Value, EvalError> {
    let n = non_negative(&args[0], "n")?;
    let k = match args.get(1) {
        Some(k) => non_negative(k, "k")?,
        None => n.clone(),
    };
    if k > n {
        return Ok(Value::int(0));
    }
    let k = k.to_u64().ok_or_else(too_wide)?;
    bounded_product((0..k).map(|i| &n - i)).map(Value::Int)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: &[Value]) -> Result<Value, EvalError> {
        match lookup(name) {
            Some(Builtin::Function(f)) => f.call(args),
            other => panic!("{name} is not a function: {other:?}"),
        }
    }

    #[test]
    fn table_names_are_unique() {
        let mut all: Vec<_> = names().collect();
        let len = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), len);
    }

    #[test]
    fn constants_resolve() {
        assert!(matches!(lookup("pi"), Some(Builtin::Constant(v)) if v == PI));
        assert!(lookup("__import__").is_none());
        assert!(lookup("system").is_none());
    }

    #[test]
    fn float_functions() {
        assert_eq!(call("sqrt", &[Value::int(16)]), Ok(Value::Float(4.0)));
        assert_eq!(call("fabs", &[Value::int(-3)]), Ok(Value::Float(3.0)));
        assert_eq!(call("pow", &[Value::int(2), Value::int(10)]), Ok(Value::Float(1024.0)));
        assert_eq!(call("log", &[Value::int(8), Value::int(2)]), Ok(Value::Float(3.0)));
    }

    #[test]
    fn domain_and_range_errors() {
        assert_eq!(call("sqrt", &[Value::int(-1)]), Err(EvalError::MathDomain));
        assert_eq!(call("log", &[Value::int(0)]), Err(EvalError::MathDomain));
        assert_eq!(call("acos", &[Value::int(2)]), Err(EvalError::MathDomain));
        assert_eq!(call("atanh", &[Value::int(1)]), Err(EvalError::MathDomain));
        assert_eq!(call("pow", &[Value::int(0), Value::int(-1)]), Err(EvalError::MathDomain));
        assert_eq!(call("exp", &[Value::int(1000)]), Err(EvalError::MathRange));
        assert_eq!(call("fmod", &[Value::int(1), Value::int(0)]), Err(EvalError::MathDomain));
    }

    #[test]
    fn integer_functions() {
        assert_eq!(call("factorial", &[Value::int(5)]), Ok(Value::int(120)));
        assert_eq!(call("floor", &[Value::Float(-2.5)]), Ok(Value::int(-3)));
        assert_eq!(call("ceil", &[Value::Float(2.1)]), Ok(Value::int(3)));
        assert_eq!(call("trunc", &[Value::Float(-2.9)]), Ok(Value::int(-2)));
        assert_eq!(call("isqrt", &[Value::int(17)]), Ok(Value::int(4)));
        assert_eq!(call("isqrt", &[Value::int(0)]), Ok(Value::int(0)));
        assert_eq!(call("gcd", &[Value::int(12), Value::int(-18)]), Ok(Value::int(6)));
        assert_eq!(call("gcd", &[]), Ok(Value::int(0)));
        assert_eq!(call("lcm", &[Value::int(4), Value::int(6)]), Ok(Value::int(12)));
        assert_eq!(call("lcm", &[]), Ok(Value::int(1)));
        assert_eq!(call("comb", &[Value::int(5), Value::int(2)]), Ok(Value::int(10)));
        assert_eq!(call("comb", &[Value::int(2), Value::int(5)]), Ok(Value::int(0)));
        assert_eq!(call("perm", &[Value::int(5), Value::int(2)]), Ok(Value::int(20)));
        assert_eq!(call("perm", &[Value::int(4)]), Ok(Value::int(24)));
    }

    #[test]
    fn integer_functions_are_exact_past_machine_width() {
        let int = |digits: &str| -> Result<Value, EvalError> {
            Ok(Value::Int(digits.parse().unwrap()))
        };
        assert_eq!(
            call("factorial", &[Value::int(25)]),
            int("15511210043330985984000000")
        );
        assert_eq!(
            call("comb", &[Value::int(100), Value::int(50)]),
            int("100891344545564193334812497256")
        );
        assert_eq!(
            call("perm", &[Value::int(30), Value::int(20)]),
            int("73096577329197271449600000")
        );
        assert_eq!(
            call("isqrt", &[Value::int(10u128.pow(30))]),
            int("1000000000000000")
        );
        assert_eq!(
            call("lcm", &[Value::int(u64::MAX), Value::int(u64::MAX - 1)]),
            int("340282366920938463408034375210639556610")
        );
        assert_eq!(call("floor", &[Value::Float(1e20)]), int("100000000000000000000"));
    }

    #[test]
    fn special_functions() {
        assert_eq!(call("gamma", &[Value::int(5)]), Ok(Value::Float(24.0)));
        assert_eq!(call("lgamma", &[Value::int(1)]), Ok(Value::Float(0.0)));
        assert_eq!(call("erf", &[Value::int(0)]), Ok(Value::Float(0.0)));
        assert_eq!(call("erfc", &[Value::int(0)]), Ok(Value::Float(1.0)));
        assert!(matches!(
            call("cbrt", &[Value::int(-27)]),
            Ok(Value::Float(v)) if (v + 3.0).abs() < 1e-12
        ));
        assert_eq!(call("exp2", &[Value::int(10)]), Ok(Value::Float(1024.0)));
        assert_eq!(
            call("remainder", &[Value::int(10), Value::int(3)]),
            Ok(Value::Float(1.0))
        );
        assert_eq!(
            call("remainder", &[Value::int(11), Value::int(3)]),
            Ok(Value::Float(-1.0))
        );
        assert_eq!(
            call("ldexp", &[Value::Float(0.75), Value::int(4)]),
            Ok(Value::Float(12.0))
        );
    }

    #[test]
    fn special_function_errors() {
        assert_eq!(call("gamma", &[Value::int(0)]), Err(EvalError::MathDomain));
        assert_eq!(call("gamma", &[Value::int(-2)]), Err(EvalError::MathDomain));
        assert_eq!(call("gamma", &[Value::int(200)]), Err(EvalError::MathRange));
        assert_eq!(call("lgamma", &[Value::int(-1)]), Err(EvalError::MathDomain));
        assert_eq!(
            call("remainder", &[Value::int(1), Value::int(0)]),
            Err(EvalError::MathDomain)
        );
        assert_eq!(
            call("ldexp", &[Value::Float(1.0), Value::int(5000)]),
            Err(EvalError::MathRange)
        );
        assert!(matches!(
            call("ldexp", &[Value::Float(1.0), Value::Float(2.0)]),
            Err(EvalError::Type(_))
        ));
        assert!(matches!(
            call("exp2", &[Value::Int(num_bigint::BigInt::from(1) << 2000)]),
            Err(EvalError::Overflow(_))
        ));
    }

    #[test]
    fn integer_function_errors() {
        assert!(matches!(call("factorial", &[Value::int(-1)]), Err(EvalError::Value(_))));
        assert!(matches!(call("factorial", &[Value::Float(3.0)]), Err(EvalError::Type(_))));
        assert!(matches!(
            call("factorial", &[Value::int(100_000)]),
            Err(EvalError::Overflow(_))
        ));
        assert!(matches!(
            call("floor", &[Value::Float(f64::INFINITY)]),
            Err(EvalError::Overflow(_))
        ));
        assert!(matches!(call("floor", &[Value::Float(f64::NAN)]), Err(EvalError::Value(_))));
    }

    #[test]
    fn arity_is_checked() {
        let err = call("sqrt", &[Value::int(1), Value::int(2)]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "sqrt() takes exactly 1 argument (2 given)"
        );
        assert!(call("log", &[]).is_err());
        assert!(call("log", &[Value::int(1), Value::int(2), Value::int(3)]).is_err());
    }
}
