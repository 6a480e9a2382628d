//! The numeric surface injected into reward code.
//!
//! Reward functions see a numpy-like `np` module, the `math` module and a
//! fixed set of builtins. Nothing else is reachable from sandboxed code.

use std::collections::BTreeMap;
use std::f64::consts::{E, PI, TAU};
use std::sync::Arc;

use super::value::{ModuleValue, Native, NativeFn, Value};
use super::EvalError;

/// Upper bound on the length of sequences created by `range`, `zeros` and
/// friends.
const MAX_SEQUENCE_LEN: usize = 1_000_000;

/// Modules and builtins available to reward code.
#[derive(Debug)]
pub struct NumericSurface {
    modules: BTreeMap<String, Arc<ModuleValue>>,
    builtins: BTreeMap<String, Value>,
    preloaded: Vec<(String, String)>,
}

impl NumericSurface {
    /// The standard surface: `numpy` (pre-bound as `np`), `numpy.linalg`,
    /// `math` and Python builtins.
    pub fn standard() -> Self {
        let linalg = Arc::new(ModuleValue {
            name: "numpy.linalg".to_string(),
            attrs: BTreeMap::from([("norm".to_string(), native("norm", np_norm))]),
        });
        let numpy = Arc::new(numpy_module(linalg.clone()));
        let math = Arc::new(math_module());

        let modules = BTreeMap::from([
            ("numpy".to_string(), numpy),
            ("numpy.linalg".to_string(), linalg),
            ("math".to_string(), math),
        ]);

        Self {
            modules,
            builtins: builtin_table(),
            preloaded: vec![("np".to_string(), "numpy".to_string())],
        }
    }

    /// Looks up a module by its dotted name.
    pub fn module(&self, name: &str) -> Option<&Arc<ModuleValue>> {
        self.modules.get(name)
    }

    pub fn module_names(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    pub fn builtin(&self, name: &str) -> Option<&Value> {
        self.builtins.get(name)
    }

    /// Names bound in every fresh namespace before user code runs.
    pub fn preloaded(&self) -> impl Iterator<Item = (&str, Value)> + '_ {
        self.preloaded.iter().filter_map(|(alias, module)| {
            self.modules
                .get(module)
                .map(|m| (alias.as_str(), Value::Module(m.clone())))
        })
    }
}

fn native(name: &'static str, func: NativeFn) -> Value {
    Value::Native(Native { name, func })
}

fn numpy_module(linalg: Arc<ModuleValue>) -> ModuleValue {
    let functions: &[(&'static str, NativeFn)] = &[
        ("abs", np_abs),
        ("absolute", np_abs),
        ("fabs", np_abs),
        ("sqrt", np_sqrt),
        ("exp", np_exp),
        ("log", np_log),
        ("log2", np_log2),
        ("log10", np_log10),
        ("log1p", np_log1p),
        ("tanh", np_tanh),
        ("sinh", np_sinh),
        ("cosh", np_cosh),
        ("sin", np_sin),
        ("cos", np_cos),
        ("tan", np_tan),
        ("arcsin", np_arcsin),
        ("arccos", np_arccos),
        ("arctan", np_arctan),
        ("sign", np_sign),
        ("square", np_square),
        ("floor", np_floor),
        ("ceil", np_ceil),
        ("round", np_round),
        ("radians", np_radians),
        ("deg2rad", np_radians),
        ("degrees", np_degrees),
        ("rad2deg", np_degrees),
        ("isnan", np_isnan),
        ("isfinite", np_isfinite),
        ("float32", np_float),
        ("float64", np_float),
        ("array", np_array),
        ("asarray", np_array),
        ("zeros", np_zeros),
        ("ones", np_ones),
        ("zeros_like", np_zeros_like),
        ("clip", np_clip),
        ("minimum", np_minimum),
        ("maximum", np_maximum),
        ("arctan2", np_arctan2),
        ("hypot", np_hypot),
        ("power", np_power),
        ("dot", np_dot),
        ("sum", np_sum),
        ("mean", np_mean),
        ("max", np_max),
        ("amax", np_max),
        ("min", np_min),
        ("amin", np_min),
        ("std", np_std),
        ("var", np_var),
        ("prod", np_prod),
        ("argmax", np_argmax),
        ("argmin", np_argmin),
    ];

    let mut attrs: BTreeMap<String, Value> = functions
        .iter()
        .map(|(name, func)| (name.to_string(), native(name, *func)))
        .collect();
    attrs.insert("pi".to_string(), Value::Number(PI));
    attrs.insert("e".to_string(), Value::Number(E));
    attrs.insert("inf".to_string(), Value::Number(f64::INFINITY));
    attrs.insert("nan".to_string(), Value::Number(f64::NAN));
    attrs.insert("linalg".to_string(), Value::Module(linalg));

    ModuleValue {
        name: "numpy".to_string(),
        attrs,
    }
}

fn math_module() -> ModuleValue {
    let functions: &[(&'static str, NativeFn)] = &[
        ("sqrt", math_sqrt),
        ("exp", math_exp),
        ("log", math_log),
        ("log10", math_log10),
        ("log2", math_log2),
        ("tanh", math_tanh),
        ("sin", math_sin),
        ("cos", math_cos),
        ("tan", math_tan),
        ("asin", math_asin),
        ("acos", math_acos),
        ("atan", math_atan),
        ("atan2", np_arctan2),
        ("hypot", np_hypot),
        ("fabs", math_fabs),
        ("floor", math_floor),
        ("ceil", math_ceil),
        ("pow", builtin_pow),
        ("radians", math_radians),
        ("degrees", math_degrees),
        ("isnan", np_isnan),
        ("isfinite", np_isfinite),
        ("copysign", math_copysign),
    ];

    let mut attrs: BTreeMap<String, Value> = functions
        .iter()
        .map(|(name, func)| (name.to_string(), native(name, *func)))
        .collect();
    attrs.insert("pi".to_string(), Value::Number(PI));
    attrs.insert("e".to_string(), Value::Number(E));
    attrs.insert("tau".to_string(), Value::Number(TAU));
    attrs.insert("inf".to_string(), Value::Number(f64::INFINITY));
    attrs.insert("nan".to_string(), Value::Number(f64::NAN));

    ModuleValue {
        name: "math".to_string(),
        attrs,
    }
}

fn builtin_table() -> BTreeMap<String, Value> {
    let functions: &[(&'static str, NativeFn)] = &[
        ("abs", builtin_abs),
        ("min", builtin_min),
        ("max", builtin_max),
        ("sum", builtin_sum),
        ("float", builtin_float),
        ("int", builtin_int),
        ("bool", builtin_bool),
        ("len", builtin_len),
        ("round", builtin_round),
        ("range", builtin_range),
        ("pow", builtin_pow),
        ("list", builtin_list),
        ("tuple", builtin_list),
        ("enumerate", builtin_enumerate),
        ("zip", builtin_zip),
        ("any", builtin_any),
        ("all", builtin_all),
        ("sorted", builtin_sorted),
        ("print", builtin_print),
    ];
    functions
        .iter()
        .map(|(name, func)| (name.to_string(), native(name, *func)))
        .collect()
}

// ----------------------------------------------------------------------
// Argument helpers
// ----------------------------------------------------------------------

fn arg<'a>(
    args: &'a [Value],
    kwargs: &'a [(String, Value)],
    position: usize,
    name: &str,
) -> Option<&'a Value> {
    args.get(position).or_else(|| {
        kwargs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    })
}

fn required<'a>(
    func: &str,
    args: &'a [Value],
    kwargs: &'a [(String, Value)],
    position: usize,
    name: &str,
) -> Result<&'a Value, EvalError> {
    arg(args, kwargs, position, name).ok_or_else(|| {
        EvalError::Type(format!("{}() missing required argument '{}'", func, name))
    })
}

fn scalar(func: &str, value: &Value) -> Result<f64, EvalError> {
    value.as_f64().ok_or_else(|| {
        EvalError::Type(format!(
            "{}() argument must be a real number, not '{}'",
            func,
            value.type_name()
        ))
    })
}

fn vector(func: &str, value: &Value) -> Result<Vec<f64>, EvalError> {
    value.to_vector().ok_or_else(|| {
        EvalError::Type(format!(
            "{}() expected numeric input, got '{}'",
            func,
            value.type_name()
        ))
    })
}

fn map_unary(func: &str, value: &Value, f: impl Fn(f64) -> f64) -> Result<Value, EvalError> {
    match value {
        Value::Number(_) | Value::Bool(_) => Ok(Value::Number(f(scalar(func, value)?))),
        Value::Array(_) | Value::List(_) => {
            Ok(Value::Array(vector(func, value)?.into_iter().map(f).collect()))
        }
        other => Err(EvalError::Type(format!(
            "{}() expected numeric input, got '{}'",
            func,
            other.type_name()
        ))),
    }
}

fn map_binary(
    func: &str,
    left: &Value,
    right: &Value,
    f: impl Fn(f64, f64) -> f64,
) -> Result<Value, EvalError> {
    let promote = |v: &Value| match v {
        Value::List(_) => vector(func, v).map(Value::Array),
        other => Ok(other.clone()),
    };
    super::value::broadcast(&promote(left)?, &promote(right)?, f)
}

fn non_empty(func: &str, values: Vec<f64>) -> Result<Vec<f64>, EvalError> {
    if values.is_empty() {
        return Err(EvalError::Value(format!(
            "{}() called on an empty sequence",
            func
        )));
    }
    Ok(values)
}

fn checked_len(func: &str, len: f64) -> Result<usize, EvalError> {
    if len < 0.0 || len.fract() != 0.0 || len as usize > MAX_SEQUENCE_LEN {
        return Err(EvalError::Value(format!("{}(): invalid length {}", func, len)));
    }
    Ok(len as usize)
}

// ----------------------------------------------------------------------
// numpy
// ----------------------------------------------------------------------

macro_rules! elementwise {
    ($($name:ident => $label:literal, $f:expr;)*) => {
        $(
            fn $name(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
                let x = required($label, args, kwargs, 0, "x")?;
                map_unary($label, x, $f)
            }
        )*
    };
}

elementwise! {
    np_abs => "abs", f64::abs;
    np_sqrt => "sqrt", f64::sqrt;
    np_exp => "exp", f64::exp;
    np_log => "log", f64::ln;
    np_log2 => "log2", f64::log2;
    np_log10 => "log10", f64::log10;
    np_log1p => "log1p", f64::ln_1p;
    np_tanh => "tanh", f64::tanh;
    np_sinh => "sinh", f64::sinh;
    np_cosh => "cosh", f64::cosh;
    np_sin => "sin", f64::sin;
    np_cos => "cos", f64::cos;
    np_tan => "tan", f64::tan;
    np_arcsin => "arcsin", f64::asin;
    np_arccos => "arccos", f64::acos;
    np_arctan => "arctan", f64::atan;
    np_square => "square", |x: f64| x * x;
    np_floor => "floor", f64::floor;
    np_ceil => "ceil", f64::ceil;
    np_radians => "radians", f64::to_radians;
    np_degrees => "degrees", f64::to_degrees;
    np_float => "float64", |x: f64| x;
    np_sign => "sign", |x: f64| if x > 0.0 { 1.0 } else if x < 0.0 { -1.0 } else { 0.0 };
    np_isnan => "isnan", |x: f64| if x.is_nan() { 1.0 } else { 0.0 };
    np_isfinite => "isfinite", |x: f64| if x.is_finite() { 1.0 } else { 0.0 };
}

fn round_half_even(x: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (x * scale).round_ties_even() / scale
}

fn np_round(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    let x = required("round", args, kwargs, 0, "a")?;
    let decimals = match arg(args, kwargs, 1, "decimals") {
        Some(d) => scalar("round", d)? as i32,
        None => 0,
    };
    map_unary("round", x, |v| round_half_even(v, decimals))
}

fn np_array(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    let x = required("array", args, kwargs, 0, "object")?;
    Ok(Value::Array(vector("array", x)?))
}

fn np_zeros(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    let n = scalar("zeros", required("zeros", args, kwargs, 0, "shape")?)?;
    Ok(Value::Array(vec![0.0; checked_len("zeros", n)?]))
}

fn np_ones(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    let n = scalar("ones", required("ones", args, kwargs, 0, "shape")?)?;
    Ok(Value::Array(vec![1.0; checked_len("ones", n)?]))
}

fn np_zeros_like(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    let x = required("zeros_like", args, kwargs, 0, "a")?;
    map_unary("zeros_like", x, |_| 0.0)
}

fn np_clip(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    let x = required("clip", args, kwargs, 0, "a")?;
    let low = required("clip", args, kwargs, 1, "a_min")?;
    let high = required("clip", args, kwargs, 2, "a_max")?;
    let lower = map_binary("clip", x, low, |v, lo| if lo.is_nan() { v } else { v.max(lo) })?;
    map_binary("clip", &lower, high, |v, hi| if hi.is_nan() { v } else { v.min(hi) })
}

fn np_minimum(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    let a = required("minimum", args, kwargs, 0, "x1")?;
    let b = required("minimum", args, kwargs, 1, "x2")?;
    map_binary("minimum", a, b, f64::min)
}

fn np_maximum(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    let a = required("maximum", args, kwargs, 0, "x1")?;
    let b = required("maximum", args, kwargs, 1, "x2")?;
    map_binary("maximum", a, b, f64::max)
}

fn np_arctan2(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    let y = required("arctan2", args, kwargs, 0, "y")?;
    let x = required("arctan2", args, kwargs, 1, "x")?;
    map_binary("arctan2", y, x, f64::atan2)
}

fn np_hypot(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    let a = required("hypot", args, kwargs, 0, "x1")?;
    let b = required("hypot", args, kwargs, 1, "x2")?;
    map_binary("hypot", a, b, f64::hypot)
}

fn np_power(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    let a = required("power", args, kwargs, 0, "x1")?;
    let b = required("power", args, kwargs, 1, "x2")?;
    map_binary("power", a, b, f64::powf)
}

fn np_dot(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    let a = required("dot", args, kwargs, 0, "a")?;
    let b = required("dot", args, kwargs, 1, "b")?;
    match (a, b) {
        (Value::Number(_) | Value::Bool(_), _) | (_, Value::Number(_) | Value::Bool(_)) => {
            map_binary("dot", a, b, |x, y| x * y)
        }
        _ => {
            let (a, b) = (vector("dot", a)?, vector("dot", b)?);
            if a.len() != b.len() {
                return Err(EvalError::Value(format!(
                    "shapes ({},) and ({},) not aligned",
                    a.len(),
                    b.len()
                )));
            }
            Ok(Value::Number(a.iter().zip(&b).map(|(x, y)| x * y).sum()))
        }
    }
}

fn np_norm(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    let values = vector("norm", required("norm", args, kwargs, 0, "x")?)?;
    let order = match arg(args, kwargs, 1, "ord") {
        Some(Value::None) | None => 2.0,
        Some(v) => scalar("norm", v)?,
    };
    let norm = if order.is_infinite() && order > 0.0 {
        values.iter().fold(0.0, |acc: f64, v| acc.max(v.abs()))
    } else if order == 1.0 {
        values.iter().map(|v| v.abs()).sum()
    } else {
        values.iter().map(|v| v.abs().powf(order)).sum::<f64>().powf(1.0 / order)
    };
    Ok(Value::Number(norm))
}

fn reduce(
    func: &str,
    args: &[Value],
    kwargs: &[(String, Value)],
    f: impl Fn(&[f64]) -> f64,
    allow_empty: bool,
) -> Result<Value, EvalError> {
    let values = vector(func, required(func, args, kwargs, 0, "a")?)?;
    let values = if allow_empty {
        values
    } else {
        non_empty(func, values)?
    };
    Ok(Value::Number(f(&values)))
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn variance(values: &[f64]) -> f64 {
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64
}

fn np_sum(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    reduce("sum", args, kwargs, |v| v.iter().sum(), true)
}

fn np_prod(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    reduce("prod", args, kwargs, |v| v.iter().product(), true)
}

fn np_mean(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    reduce("mean", args, kwargs, mean, false)
}

fn np_std(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    reduce("std", args, kwargs, |v| variance(v).sqrt(), false)
}

fn np_var(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    reduce("var", args, kwargs, variance, false)
}

fn np_max(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    reduce(
        "max",
        args,
        kwargs,
        |v| v.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        false,
    )
}

fn np_min(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    reduce(
        "min",
        args,
        kwargs,
        |v| v.iter().copied().fold(f64::INFINITY, f64::min),
        false,
    )
}

fn arg_extreme(values: &[f64], better: impl Fn(f64, f64) -> bool) -> f64 {
    let mut best = 0usize;
    for (i, v) in values.iter().enumerate() {
        if better(*v, values[best]) {
            best = i;
        }
    }
    best as f64
}

fn np_argmax(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    reduce("argmax", args, kwargs, |v| arg_extreme(v, |a, b| a > b), false)
}

fn np_argmin(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    reduce("argmin", args, kwargs, |v| arg_extreme(v, |a, b| a < b), false)
}

// ----------------------------------------------------------------------
// math: scalar only, domain errors raise like CPython.
// ----------------------------------------------------------------------

fn math_unary(
    func: &str,
    args: &[Value],
    kwargs: &[(String, Value)],
    f: impl Fn(f64) -> f64,
    domain: impl Fn(f64) -> bool,
) -> Result<Value, EvalError> {
    let x = scalar(func, required(func, args, kwargs, 0, "x")?)?;
    if !domain(x) {
        return Err(EvalError::Value("math domain error".to_string()));
    }
    Ok(Value::Number(f(x)))
}

macro_rules! math_functions {
    ($($name:ident => $label:literal, $f:expr, $domain:expr;)*) => {
        $(
            fn $name(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
                math_unary($label, args, kwargs, $f, $domain)
            }
        )*
    };
}

math_functions! {
    math_sqrt => "sqrt", f64::sqrt, |x: f64| x >= 0.0;
    math_exp => "exp", f64::exp, |_| true;
    math_log10 => "log10", f64::log10, |x: f64| x > 0.0;
    math_log2 => "log2", f64::log2, |x: f64| x > 0.0;
    math_tanh => "tanh", f64::tanh, |_| true;
    math_sin => "sin", f64::sin, |x: f64| x.is_finite();
    math_cos => "cos", f64::cos, |x: f64| x.is_finite();
    math_tan => "tan", f64::tan, |x: f64| x.is_finite();
    math_asin => "asin", f64::asin, |x: f64| (-1.0..=1.0).contains(&x);
    math_acos => "acos", f64::acos, |x: f64| (-1.0..=1.0).contains(&x);
    math_atan => "atan", f64::atan, |_| true;
    math_fabs => "fabs", f64::abs, |_| true;
    math_floor => "floor", f64::floor, |_| true;
    math_ceil => "ceil", f64::ceil, |_| true;
    math_radians => "radians", f64::to_radians, |_| true;
    math_degrees => "degrees", f64::to_degrees, |_| true;
}

fn math_log(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    let x = scalar("log", required("log", args, kwargs, 0, "x")?)?;
    if x <= 0.0 {
        return Err(EvalError::Value("math domain error".to_string()));
    }
    match arg(args, kwargs, 1, "base") {
        Some(base) => {
            let base = scalar("log", base)?;
            if base <= 0.0 || base == 1.0 {
                return Err(EvalError::Value("math domain error".to_string()));
            }
            Ok(Value::Number(x.ln() / base.ln()))
        }
        None => Ok(Value::Number(x.ln())),
    }
}

fn math_copysign(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    let x = scalar("copysign", required("copysign", args, kwargs, 0, "x")?)?;
    let y = scalar("copysign", required("copysign", args, kwargs, 1, "y")?)?;
    Ok(Value::Number(x.copysign(y)))
}

// ----------------------------------------------------------------------
// builtins
// ----------------------------------------------------------------------

fn builtin_abs(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    let x = required("abs", args, kwargs, 0, "x")?;
    match x {
        Value::Array(_) => map_unary("abs", x, f64::abs),
        _ => Ok(Value::Number(scalar("abs", x)?.abs())),
    }
}

fn extreme(
    func: &str,
    args: &[Value],
    better: impl Fn(f64, f64) -> bool,
) -> Result<Value, EvalError> {
    let candidates: Vec<Value> = match args {
        [] => {
            return Err(EvalError::Type(format!(
                "{} expected at least 1 argument, got 0",
                func
            )))
        }
        [single] => single.iter_values()?,
        many => many.to_vec(),
    };
    let mut best: Option<(f64, Value)> = None;
    for candidate in candidates {
        let x = scalar(func, &candidate)?;
        match &best {
            Some((current, _)) if !better(x, *current) => {}
            _ => best = Some((x, candidate)),
        }
    }
    best.map(|(_, v)| v)
        .ok_or_else(|| EvalError::Value(format!("{}() arg is an empty sequence", func)))
}

fn builtin_min(args: &[Value], _kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    extreme("min", args, |a, b| a < b)
}

fn builtin_max(args: &[Value], _kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    extreme("max", args, |a, b| a > b)
}

fn builtin_sum(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    let iterable = required("sum", args, kwargs, 0, "iterable")?;
    let mut total = match arg(args, kwargs, 1, "start") {
        Some(start) => start.clone(),
        None => Value::Number(0.0),
    };
    for item in iterable.iter_values()? {
        total = super::value::binary_op(super::ast::BinOp::Add, &total, &item)?;
    }
    Ok(total)
}

fn builtin_float(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    match arg(args, kwargs, 0, "x") {
        None => Ok(Value::Number(0.0)),
        Some(Value::Str(s)) => {
            let parsed = match s.trim().to_ascii_lowercase().as_str() {
                "inf" | "+inf" | "infinity" => Some(f64::INFINITY),
                "-inf" | "-infinity" => Some(f64::NEG_INFINITY),
                "nan" => Some(f64::NAN),
                other => other.parse::<f64>().ok(),
            };
            parsed.map(Value::Number).ok_or_else(|| {
                EvalError::Value(format!("could not convert string to float: '{}'", s))
            })
        }
        Some(v) => Ok(Value::Number(scalar("float", v)?)),
    }
}

fn builtin_int(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    match arg(args, kwargs, 0, "x") {
        None => Ok(Value::Number(0.0)),
        Some(v) => {
            let x = scalar("int", v)?;
            if !x.is_finite() {
                return Err(EvalError::Value(
                    "cannot convert float infinity or NaN to integer".to_string(),
                ));
            }
            Ok(Value::Number(x.trunc()))
        }
    }
}

fn builtin_bool(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    match arg(args, kwargs, 0, "x") {
        None => Ok(Value::Bool(false)),
        Some(v) => Ok(Value::Bool(v.truthy()?)),
    }
}

fn builtin_len(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    let x = required("len", args, kwargs, 0, "obj")?;
    Ok(Value::Number(x.len()? as f64))
}

fn builtin_round(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    let x = scalar("round", required("round", args, kwargs, 0, "number")?)?;
    let digits = match arg(args, kwargs, 1, "ndigits") {
        Some(Value::None) | None => 0,
        Some(d) => scalar("round", d)? as i32,
    };
    Ok(Value::Number(round_half_even(x, digits)))
}

fn builtin_range(args: &[Value], _kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    let ints = args
        .iter()
        .map(|a| a.as_index())
        .collect::<Result<Vec<_>, _>>()?;
    let (start, stop, step) = match ints.as_slice() {
        [stop] => (0, *stop, 1),
        [start, stop] => (*start, *stop, 1),
        [start, stop, step] => (*start, *stop, *step),
        _ => {
            return Err(EvalError::Type(format!(
                "range expected 1 to 3 arguments, got {}",
                ints.len()
            )))
        }
    };
    if step == 0 {
        return Err(EvalError::Value("range() arg 3 must not be zero".to_string()));
    }
    let count = if (step > 0 && start < stop) || (step < 0 && start > stop) {
        ((stop - start).abs() + step.abs() - 1) / step.abs()
    } else {
        0
    };
    if count as usize > MAX_SEQUENCE_LEN {
        return Err(EvalError::Value(format!("range of {} items is too large", count)));
    }
    Ok(Value::List(
        (0..count)
            .map(|i| Value::Number((start + i * step) as f64))
            .collect(),
    ))
}

fn builtin_pow(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    let base = required("pow", args, kwargs, 0, "base")?;
    let exp = required("pow", args, kwargs, 1, "exp")?;
    super::value::binary_op(super::ast::BinOp::Pow, base, exp)
}

fn builtin_list(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    match arg(args, kwargs, 0, "iterable") {
        None => Ok(Value::List(Vec::new())),
        Some(v) => Ok(Value::List(v.iter_values()?)),
    }
}

fn builtin_enumerate(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    let iterable = required("enumerate", args, kwargs, 0, "iterable")?;
    let start = match arg(args, kwargs, 1, "start") {
        Some(s) => s.as_index()?,
        None => 0,
    };
    Ok(Value::List(
        iterable
            .iter_values()?
            .into_iter()
            .enumerate()
            .map(|(i, v)| Value::List(vec![Value::Number((start + i as i64) as f64), v]))
            .collect(),
    ))
}

fn builtin_zip(args: &[Value], _kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    let columns = args
        .iter()
        .map(Value::iter_values)
        .collect::<Result<Vec<_>, _>>()?;
    let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
    Ok(Value::List(
        (0..rows)
            .map(|i| Value::List(columns.iter().map(|c| c[i].clone()).collect()))
            .collect(),
    ))
}

fn builtin_any(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    let iterable = required("any", args, kwargs, 0, "iterable")?;
    for item in iterable.iter_values()? {
        if item.truthy()? {
            return Ok(Value::Bool(true));
        }
    }
    Ok(Value::Bool(false))
}

fn builtin_all(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    let iterable = required("all", args, kwargs, 0, "iterable")?;
    for item in iterable.iter_values()? {
        if !item.truthy()? {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

fn builtin_sorted(args: &[Value], kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    let iterable = required("sorted", args, kwargs, 0, "iterable")?;
    let mut values = vector("sorted", &Value::List(iterable.iter_values()?))?;
    values.sort_by(f64::total_cmp);
    if matches!(arg(&[], kwargs, 0, "reverse"), Some(v) if v.truthy().unwrap_or(false)) {
        values.reverse();
    }
    Ok(Value::List(values.into_iter().map(Value::Number).collect()))
}

fn builtin_print(_args: &[Value], _kwargs: &[(String, Value)]) -> Result<Value, EvalError> {
    Ok(Value::None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(module: &str, name: &str, args: &[Value]) -> Result<Value, EvalError> {
        let surface = NumericSurface::standard();
        let value = surface
            .module(module)
            .and_then(|m| m.attrs.get(name))
            .cloned()
            .expect("function should exist");
        match value {
            Value::Native(native) => (native.func)(args, &[]),
            other => panic!("{} is not callable: {}", name, other),
        }
    }

    fn builtin(name: &str, args: &[Value]) -> Result<Value, EvalError> {
        let surface = NumericSurface::standard();
        match surface.builtin(name).cloned() {
            Some(Value::Native(native)) => (native.func)(args, &[]),
            _ => panic!("missing builtin {}", name),
        }
    }

    #[test]
    fn test_numpy_elementwise() {
        let result = call("numpy", "abs", &[Value::Array(vec![-1.0, 2.0])]).unwrap();
        assert_eq!(result.to_vector(), Some(vec![1.0, 2.0]));

        let clipped = call(
            "numpy",
            "clip",
            &[
                Value::Array(vec![-3.0, 0.5, 3.0]),
                Value::Number(-1.0),
                Value::Number(1.0),
            ],
        )
        .unwrap();
        assert_eq!(clipped.to_vector(), Some(vec![-1.0, 0.5, 1.0]));
    }

    #[test]
    fn test_numpy_reductions() {
        let obs = Value::Array(vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(call("numpy", "mean", &[obs.clone()]).unwrap().as_f64(), Some(2.5));
        assert_eq!(call("numpy", "sum", &[obs.clone()]).unwrap().as_f64(), Some(10.0));
        assert_eq!(call("numpy", "argmax", &[obs.clone()]).unwrap().as_f64(), Some(3.0));
        let norm = call("numpy.linalg", "norm", &[Value::Array(vec![3.0, 4.0])]).unwrap();
        assert_eq!(norm.as_f64(), Some(5.0));
        assert!(call("numpy", "max", &[Value::Array(vec![])]).is_err());
    }

    #[test]
    fn test_math_domain_errors() {
        assert!(call("math", "sqrt", &[Value::Number(-1.0)]).is_err());
        assert!(call("math", "log", &[Value::Number(0.0)]).is_err());
        let np_sqrt = call("numpy", "sqrt", &[Value::Number(-1.0)]).unwrap();
        assert!(np_sqrt.as_f64().is_some_and(f64::is_nan));
    }

    #[test]
    fn test_builtins() {
        let m = builtin("max", &[Value::Number(1.0), Value::Number(5.0)]).unwrap();
        assert_eq!(m.as_f64(), Some(5.0));
        let m = builtin("min", &[Value::Array(vec![4.0, -2.0])]).unwrap();
        assert_eq!(m.as_f64(), Some(-2.0));
        let r = builtin("round", &[Value::Number(2.5)]).unwrap();
        assert_eq!(r.as_f64(), Some(2.0));
        let range = builtin("range", &[Value::Number(1.0), Value::Number(7.0), Value::Number(2.0)])
            .unwrap();
        assert_eq!(range.to_vector(), Some(vec![1.0, 3.0, 5.0]));
        assert!(builtin("range", &[Value::Number(1e9)]).is_err());
        let f = builtin("float", &[Value::Str("-inf".into())]).unwrap();
        assert_eq!(f.as_f64(), Some(f64::NEG_INFINITY));
    }

    #[test]
    fn test_np_is_preloaded() {
        let surface = NumericSurface::standard();
        let names: Vec<&str> = surface.preloaded().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["np"]);
        assert!(surface.module("math").is_some());
        assert!(surface.module("os").is_none());
    }
}
