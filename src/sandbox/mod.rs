//! Restricted evaluator for generated reward functions.
//!
//! Reward functions arrive as Python-flavoured source text. Instead of
//! handing that text to a general-purpose runtime, this module parses a
//! small, loop-bounded subset of the language and evaluates it against an
//! injected [`NumericSurface`]. The only things reward code can reach are
//! the values passed in and the numeric modules the surface declares.
//!
//! ```ignore
//! use reward_forge::sandbox::{NumericSurface, RewardFunction};
//! use std::sync::Arc;
//!
//! let surface = Arc::new(NumericSurface::standard());
//! let source = "def reward(obs, is_success, is_failure):\n    return 1.0 - abs(obs[2])\n";
//! let func = RewardFunction::compile(source, "reward", surface)?;
//! let r = func.call(&[0.0, 0.0, 0.1, 0.0], false, false)?;
//! ```

pub mod ast;
mod interpreter;
pub mod lexer;
pub mod numeric;
pub mod parser;
pub mod value;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

pub use interpreter::{EvalLimits, Scope};
pub use numeric::NumericSurface;
pub use value::Value;

use ast::{FunctionDef, Stmt};
use interpreter::Interpreter;

/// Errors detected before a reward function can be called.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("SyntaxError (line {line}): {message}")]
    Lex { line: usize, message: String },

    #[error("SyntaxError (line {line}): {message}")]
    Parse { line: usize, message: String },

    #[error("SyntaxError (line {line}): '{construct}' is not allowed in reward functions")]
    Disallowed { line: usize, construct: String },

    #[error("ImportError (line {line}): no module named '{module}'")]
    UnknownModule { line: usize, module: String },

    #[error("ImportError (line {line}): cannot import name '{name}' from '{module}'")]
    UnknownImport {
        line: usize,
        module: String,
        name: String,
    },

    #[error("SyntaxError: '{statement}' outside {context}")]
    Misplaced { statement: String, context: String },

    #[error("NameError: function '{0}' is not defined")]
    FunctionNotFound(String),

    #[error("module initialisation failed: {0}")]
    Init(String),
}

/// Errors raised while evaluating reward code.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("NameError: name '{0}' is not defined")]
    Name(String),

    #[error("TypeError: {0}")]
    Type(String),

    #[error("ValueError: {0}")]
    Value(String),

    #[error("ZeroDivisionError: {0}")]
    ZeroDivision(String),

    #[error("IndexError: index {index} is out of bounds for length {len}")]
    Index { index: i64, len: usize },

    #[error("AttributeError: {0}")]
    Attribute(String),

    #[error("ImportError: {0}")]
    Import(String),

    #[error("AssertionError: {0}")]
    Assertion(String),

    #[error("evaluation budget of {0} steps exhausted")]
    FuelExhausted(u64),

    #[error("RecursionError: maximum call depth {0} exceeded")]
    RecursionLimit(usize),

    #[error("RecursionError: maximum nesting depth {0} exceeded")]
    NestingLimit(usize),

    #[error("reward must be a scalar, got {0}")]
    NonScalar(String),
}

/// A compiled reward function `(observation, is_success, is_failure) -> reward`.
///
/// Compilation runs the module body once; every call afterwards evaluates
/// the resolved function in a fresh local scope, so calls are independent
/// and the value is safe to share between training workers.
#[derive(Clone)]
pub struct RewardFunction {
    name: String,
    source: String,
    function: Arc<FunctionDef>,
    globals: Arc<Scope>,
    surface: Arc<NumericSurface>,
    limits: EvalLimits,
}

impl fmt::Debug for RewardFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RewardFunction")
            .field("name", &self.name)
            .field("params", &self.function.params.len())
            .field("limits", &self.limits)
            .finish()
    }
}

impl RewardFunction {
    /// Compiles `source` and resolves the function called `name`.
    pub fn compile(
        source: &str,
        name: &str,
        surface: Arc<NumericSurface>,
    ) -> Result<Self, CompileError> {
        Self::compile_with_limits(source, name, surface, EvalLimits::default())
    }

    pub fn compile_with_limits(
        source: &str,
        name: &str,
        surface: Arc<NumericSurface>,
        limits: EvalLimits,
    ) -> Result<Self, CompileError> {
        let module = parser::parse(source)?;
        check_statements(&module.body, &surface, false, false)?;

        let globals = Interpreter::new(&surface, limits)
            .run_module(&module.body)
            .map_err(|e| CompileError::Init(e.to_string()))?;

        let function = match globals.get(name) {
            Some(Value::Function(def)) => Arc::clone(def),
            _ => return Err(CompileError::FunctionNotFound(name.to_string())),
        };

        Ok(Self {
            name: name.to_string(),
            source: source.to_string(),
            function,
            globals: Arc::new(globals),
            surface,
            limits,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Canonical source the function was compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates the reward for one transition.
    pub fn call(
        &self,
        observation: &[f64],
        is_success: bool,
        is_failure: bool,
    ) -> Result<f64, EvalError> {
        let args = vec![
            Value::Array(observation.to_vec()),
            Value::Bool(is_success),
            Value::Bool(is_failure),
        ];
        let result = Interpreter::new(&self.surface, self.limits).call_function(
            &self.function,
            args,
            Vec::new(),
            &self.globals,
        )?;
        result
            .as_f64()
            .ok_or_else(|| EvalError::NonScalar(format!("{} ({})", result, result.type_name())))
    }
}

/// Static checks: imports resolve against the surface and control-flow
/// statements appear only where they are meaningful.
fn check_statements(
    body: &[Stmt],
    surface: &NumericSurface,
    in_function: bool,
    in_loop: bool,
) -> Result<(), CompileError> {
    for stmt in body {
        match stmt {
            Stmt::Import { module, line, .. } => {
                if surface.module(module).is_none() {
                    return Err(CompileError::UnknownModule {
                        line: *line,
                        module: module.clone(),
                    });
                }
            }
            Stmt::ImportFrom {
                module,
                names,
                line,
            } => {
                let Some(source) = surface.module(module) else {
                    return Err(CompileError::UnknownModule {
                        line: *line,
                        module: module.clone(),
                    });
                };
                for (name, _) in names {
                    let exists = source.attrs.contains_key(name)
                        || surface.module(&format!("{}.{}", module, name)).is_some();
                    if !exists {
                        return Err(CompileError::UnknownImport {
                            line: *line,
                            module: module.clone(),
                            name: name.clone(),
                        });
                    }
                }
            }
            Stmt::Return(_) if !in_function => {
                return Err(misplaced("return", "function"));
            }
            Stmt::Break if !in_loop => return Err(misplaced("break", "loop")),
            Stmt::Continue if !in_loop => return Err(misplaced("continue", "loop")),
            Stmt::If { body, orelse, .. } => {
                check_statements(body, surface, in_function, in_loop)?;
                check_statements(orelse, surface, in_function, in_loop)?;
            }
            Stmt::For { body, .. } => check_statements(body, surface, in_function, true)?,
            Stmt::FunctionDef(def) => check_statements(&def.body, surface, true, false)?,
            _ => {}
        }
    }
    Ok(())
}

fn misplaced(statement: &str, context: &str) -> CompileError {
    CompileError::Misplaced {
        statement: statement.to_string(),
        context: context.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface() -> Arc<NumericSurface> {
        Arc::new(NumericSurface::standard())
    }

    fn compile(source: &str) -> Result<RewardFunction, CompileError> {
        RewardFunction::compile(source, "reward", surface())
    }

    const CARTPOLE_REWARD: &str = r#"
import numpy as np
import math

ANGLE_LIMIT = math.radians(12)

def reward(observation, is_success, is_failure):
    """Reward an upright, centred pole."""
    x, x_dot, theta, theta_dot = observation
    if is_failure:
        return -10.0
    if is_success:
        return 10.0
    upright = 1.0 - min(abs(theta) / ANGLE_LIMIT, 1.0)
    centred = np.exp(-x ** 2)
    penalty = 0.01 * np.sum(np.square(observation[1::2]))
    return float(upright + 0.5 * centred - penalty)
"#;

    #[test]
    fn test_compile_and_call() {
        let func = compile(CARTPOLE_REWARD).unwrap();
        assert_eq!(func.name(), "reward");

        let centred = func.call(&[0.0, 0.0, 0.0, 0.0], false, false).unwrap();
        assert!((centred - 1.5).abs() < 1e-12);
        assert_eq!(func.call(&[0.0, 0.0, 0.0, 0.0], false, true).unwrap(), -10.0);
        assert_eq!(func.call(&[0.0, 0.0, 0.0, 0.0], true, false).unwrap(), 10.0);

        let tilted = func.call(&[0.5, 0.1, 0.1, -0.2], false, false).unwrap();
        assert!(tilted < centred);
    }

    #[test]
    fn test_recompiling_is_idempotent() {
        let first = compile(CARTPOLE_REWARD).unwrap();
        let second = compile(first.source()).unwrap();
        let obs = [0.3, -0.2, 0.05, 0.4];
        assert_eq!(
            first.call(&obs, false, false).unwrap(),
            second.call(&obs, false, false).unwrap()
        );
    }

    #[test]
    fn test_helper_functions_and_loops() {
        let source = r#"
def weight(i):
    return 1.0 / (i + 1)

def reward(obs, is_success, is_failure):
    total = 0.0
    for i, v in enumerate(obs):
        if i == 3:
            break
        total += weight(i) * v
    return total + (1.0 if is_success else 0.0)
"#;
        let func = compile(source).unwrap();
        let r = func.call(&[1.0, 2.0, 3.0, 100.0], true, false).unwrap();
        assert!((r - 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_only_np_is_preloaded() {
        let uses_np = "def reward(o, s, f):\n    return np.abs(o[0])\n";
        assert!(compile(uses_np).is_ok());

        let uses_math = "def reward(o, s, f):\n    return math.sqrt(2)\n";
        let func = compile(uses_math).unwrap();
        let err = func.call(&[0.0], false, false).unwrap_err();
        assert_eq!(err, EvalError::Name("math".to_string()));
    }

    #[test]
    fn test_disallowed_imports() {
        let err = compile("import os\ndef reward(o, s, f):\n    return 0.0\n").unwrap_err();
        assert!(matches!(err, CompileError::UnknownModule { .. }));

        let err = compile("from math import system\ndef reward(o, s, f):\n    return 0.0\n")
            .unwrap_err();
        assert!(matches!(err, CompileError::UnknownImport { .. }));

        assert!(compile("from numpy.linalg import norm\ndef reward(o, s, f):\n    return norm(o)\n").is_ok());
    }

    #[test]
    fn test_missing_function() {
        let err = RewardFunction::compile("def other(o, s, f):\n    return 0\n", "reward", surface())
            .unwrap_err();
        assert_eq!(err, CompileError::FunctionNotFound("reward".to_string()));
    }

    #[test]
    fn test_module_init_errors() {
        let err = compile("X = 1 / 0\ndef reward(o, s, f):\n    return X\n").unwrap_err();
        assert!(matches!(err, CompileError::Init(_)));
    }

    #[test]
    fn test_main_guard_is_skipped() {
        let source = "def reward(o, s, f):\n    return 1.0\n\nif __name__ == '__main__':\n    print(reward([0.0], False, False))\n    raise_error()\n";
        assert!(compile(source).is_ok());
    }

    #[test]
    fn test_misplaced_control_flow() {
        assert!(matches!(
            compile("def reward(o, s, f):\n    break\n"),
            Err(CompileError::Misplaced { .. })
        ));
        assert!(matches!(
            compile("return 1\n"),
            Err(CompileError::Misplaced { .. })
        ));
    }

    #[test]
    fn test_fuel_is_bounded() {
        let source = "def reward(o, s, f):\n    t = 0.0\n    for i in range(100000):\n        t += i\n    return t\n";
        let func = RewardFunction::compile_with_limits(
            source,
            "reward",
            surface(),
            EvalLimits {
                fuel: 1_000,
                max_depth: 8,
            },
        )
        .unwrap();
        assert_eq!(
            func.call(&[0.0], false, false).unwrap_err(),
            EvalError::FuelExhausted(1_000)
        );
    }

    #[test]
    fn test_item_assignment() {
        let source = "def reward(o, s, f):\n    w = np.zeros(2)\n    w[0] = o[0]\n    w[1] += 2.0\n    xs = [1.0, 2.0]\n    xs[-1] *= 3.0\n    return w.sum() + xs[1]\n";
        let func = compile(source).unwrap();
        assert_eq!(func.call(&[1.5], false, false).unwrap(), 9.5);
    }

    #[test]
    fn test_allocation_costs_fuel() {
        let source = "def reward(o, s, f):\n    return np.zeros(1000000).sum()\n";
        let func = compile(source).unwrap();
        assert_eq!(
            func.call(&[0.0], false, false).unwrap_err(),
            EvalError::FuelExhausted(100_000)
        );

        let small = compile("def reward(o, s, f):\n    return np.zeros(1000).sum() + np.ones(3).sum()\n")
            .unwrap();
        assert_eq!(small.call(&[0.0], false, false).unwrap(), 3.0);
    }

    #[test]
    fn test_deep_brackets_are_rejected() {
        for (open, close) in [("[", "]"), ("(", ")")] {
            let source = format!(
                "def reward(o, s, f):\n    return {}1.0{}\n",
                open.repeat(2_000),
                close.repeat(2_000)
            );
            assert!(matches!(compile(&source), Err(CompileError::Parse { .. })));
        }

        let unary = format!("def reward(o, s, f):\n    return {}1.0\n", "-".repeat(10_000));
        assert!(matches!(compile(&unary), Err(CompileError::Parse { .. })));

        let calls = format!(
            "def reward(o, s, f):\n    return {}1.0{}\n",
            "abs(".repeat(2_000),
            ")".repeat(2_000)
        );
        assert!(matches!(compile(&calls), Err(CompileError::Parse { .. })));
    }

    #[test]
    fn test_long_chains_are_rejected() {
        let terms = vec!["o[0]"; 5_000].join(" + ");
        let source = format!("def reward(o, s, f):\n    return {}\n", terms);
        assert!(matches!(compile(&source), Err(CompileError::Parse { .. })));

        let short = vec!["o[0]"; 20].join(" + ");
        let func = compile(&format!("def reward(o, s, f):\n    return {}\n", short)).unwrap();
        assert_eq!(func.call(&[0.5], false, false).unwrap(), 10.0);
    }

    #[test]
    fn test_deep_blocks_are_rejected() {
        let mut source = String::from("def reward(o, s, f):\n");
        for level in 1..=200 {
            source.push_str(&" ".repeat(level));
            source.push_str("if s:\n");
        }
        source.push_str(&" ".repeat(201));
        source.push_str("return 1.0\n");
        assert!(matches!(compile(&source), Err(CompileError::Parse { .. })));
    }

    #[test]
    fn test_long_elif_chain_is_rejected() {
        let mut source = String::from("def reward(o, s, f):\n    if o[0] < 0:\n        return 0.0\n");
        for k in 0..500 {
            source.push_str(&format!("    elif o[0] < {}:\n        return {}.0\n", k, k));
        }
        source.push_str("    return -1.0\n");
        assert!(matches!(compile(&source), Err(CompileError::Parse { .. })));
    }

    #[test]
    fn test_list_nesting_is_bounded() {
        let wrap = compile("def reward(o, s, f):\n    x = []\n    for i in range(100):\n        x = [x]\n    return 0.0\n")
            .unwrap();
        assert_eq!(
            wrap.call(&[0.0], false, false).unwrap_err(),
            EvalError::NestingLimit(super::interpreter::MAX_LIST_NESTING)
        );

        let append = compile("def reward(o, s, f):\n    x = []\n    for i in range(100):\n        y = []\n        y.append(x)\n        x = y\n    return 0.0\n")
            .unwrap();
        assert_eq!(
            append.call(&[0.0], false, false).unwrap_err(),
            EvalError::NestingLimit(super::interpreter::MAX_LIST_NESTING)
        );

        let shallow = compile("def reward(o, s, f):\n    x = [[o[0]], [1.0]]\n    return x[0][0] + x[1][0]\n")
            .unwrap();
        assert_eq!(shallow.call(&[2.0], false, false).unwrap(), 3.0);
    }

    #[test]
    fn test_nesting_is_bounded_across_calls() {
        let nested = format!(
            "0.0 + {}g(n - 1){}",
            "(0.0 + ".repeat(20),
            ")".repeat(20)
        );
        let source = format!(
            "def g(n):\n    return 0.0 if n <= 0 else {}\n\ndef reward(o, s, f):\n    return g(30)\n",
            nested
        );
        let func = compile(&source).unwrap();
        assert_eq!(
            func.call(&[0.0], false, false).unwrap_err(),
            EvalError::NestingLimit(super::interpreter::MAX_EVAL_NESTING)
        );
    }

    #[test]
    fn test_recursion_is_bounded() {
        let source = "def reward(o, s, f):\n    return reward(o, s, f)\n";
        let func = compile(source).unwrap();
        assert_eq!(
            func.call(&[0.0], false, false).unwrap_err(),
            EvalError::RecursionLimit(32)
        );
    }

    #[test]
    fn test_runtime_errors() {
        let zero = compile("def reward(o, s, f):\n    return 1.0 / o[0]\n").unwrap();
        assert!(matches!(
            zero.call(&[0.0], false, false),
            Err(EvalError::ZeroDivision(_))
        ));

        let vector = compile("def reward(o, s, f):\n    return o * 2\n").unwrap();
        assert!(matches!(
            vector.call(&[1.0, 2.0], false, false),
            Err(EvalError::NonScalar(_))
        ));

        let unpack = compile("def reward(o, s, f):\n    a, b = o\n    return a\n").unwrap();
        assert!(matches!(
            unpack.call(&[1.0, 2.0, 3.0], false, false),
            Err(EvalError::Value(_))
        ));
    }

    #[test]
    fn test_comprehension_scope_does_not_leak() {
        let source = "def reward(o, s, f):\n    v = 10.0\n    squares = [v * v for v in o]\n    return v + sum(squares)\n";
        let func = compile(source).unwrap();
        assert_eq!(func.call(&[1.0, 2.0], false, false).unwrap(), 15.0);
    }

    #[test]
    fn test_list_append_and_methods() {
        let source = "def reward(o, s, f):\n    xs = []\n    for v in o:\n        xs.append(v * 2)\n    return np.array(xs).mean() + o.max()\n";
        let func = compile(source).unwrap();
        assert_eq!(func.call(&[1.0, 3.0], false, false).unwrap(), 7.0);
    }

    #[test]
    fn test_reward_function_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RewardFunction>();
    }
}
