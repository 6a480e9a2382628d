//! Tree-walking evaluator with a fuel budget and a call-depth limit.

use std::collections::HashMap;
use std::sync::Arc;

use super::ast::{BinOp, BoolOp, Expr, FunctionDef, Index, Stmt, Target, UnaryOp};
use super::numeric::NumericSurface;
use super::value::{binary_op, compare, resolve_index, slice_indices, Value};
use super::EvalError;

/// A variable namespace.
pub type Scope = HashMap<String, Value>;

/// Budgets applied to a single evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvalLimits {
    /// Evaluation steps (statements, expressions and loop iterations).
    pub fuel: u64,
    /// Maximum depth of nested user-defined function calls.
    pub max_depth: usize,
}

impl Default for EvalLimits {
    fn default() -> Self {
        Self {
            fuel: 100_000,
            max_depth: 32,
        }
    }
}

/// Deepest combined statement and expression nesting during one
/// evaluation, counted across user function calls.
pub const MAX_EVAL_NESTING: usize = 256;

/// Deepest list-of-lists value reward code may build.
pub const MAX_LIST_NESTING: usize = 32;

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

struct Env<'g> {
    locals: Scope,
    globals: &'g Scope,
    module_level: bool,
}

/// Method names on arrays that forward to the numpy function of the same
/// name with the array as first argument.
const ARRAY_METHODS: &[&str] = &[
    "sum", "mean", "max", "min", "std", "var", "prod", "argmax", "argmin", "clip", "dot", "round",
];

pub(crate) struct Interpreter<'s> {
    surface: &'s NumericSurface,
    limits: EvalLimits,
    fuel: u64,
    depth: usize,
    nesting: usize,
}

impl<'s> Interpreter<'s> {
    pub(crate) fn new(surface: &'s NumericSurface, limits: EvalLimits) -> Self {
        Self {
            surface,
            limits,
            fuel: limits.fuel,
            depth: 0,
            nesting: 0,
        }
    }

    /// Runs module-level statements and returns the populated namespace.
    pub(crate) fn run_module(&mut self, body: &[Stmt]) -> Result<Scope, EvalError> {
        let empty = Scope::new();
        let mut locals: Scope = self
            .surface
            .preloaded()
            .map(|(name, value)| (name.to_string(), value))
            .collect();
        locals.insert("__name__".to_string(), Value::Str("reward_module".to_string()));

        let mut env = Env {
            locals,
            globals: &empty,
            module_level: true,
        };
        match self.exec_block(body, &mut env)? {
            Flow::Normal => Ok(env.locals),
            _ => Err(EvalError::Type(
                "control flow statement outside function".to_string(),
            )),
        }
    }

    /// Calls a user-defined function whose module namespace is `globals`.
    pub(crate) fn call_function(
        &mut self,
        def: &FunctionDef,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        globals: &Scope,
    ) -> Result<Value, EvalError> {
        if self.depth >= self.limits.max_depth {
            return Err(EvalError::RecursionLimit(self.limits.max_depth));
        }
        if args.len() > def.params.len() {
            return Err(EvalError::Type(format!(
                "{}() takes {} positional arguments but {} were given",
                def.name,
                def.params.len(),
                args.len()
            )));
        }

        let mut bound: Vec<Option<Value>> = args.into_iter().map(Some).collect();
        bound.resize(def.params.len(), None);
        for (key, value) in kwargs {
            let Some(position) = def.params.iter().position(|p| p.name == key) else {
                return Err(EvalError::Type(format!(
                    "{}() got an unexpected keyword argument '{}'",
                    def.name, key
                )));
            };
            if bound[position].is_some() {
                return Err(EvalError::Type(format!(
                    "{}() got multiple values for argument '{}'",
                    def.name, key
                )));
            }
            bound[position] = Some(value);
        }

        let mut env = Env {
            locals: Scope::new(),
            globals,
            module_level: false,
        };
        for (param, value) in def.params.iter().zip(bound) {
            let value = match (value, &param.default) {
                (Some(value), _) => value,
                (None, Some(default)) => self.eval(default, &mut env)?,
                (None, None) => {
                    return Err(EvalError::Type(format!(
                        "{}() missing required argument '{}'",
                        def.name, param.name
                    )))
                }
            };
            env.locals.insert(param.name.clone(), value);
        }

        self.depth += 1;
        let flow = self.exec_block(&def.body, &mut env);
        self.depth -= 1;

        match flow? {
            Flow::Return(value) => Ok(value),
            _ => Ok(Value::None),
        }
    }

    fn tick(&mut self) -> Result<(), EvalError> {
        if self.fuel == 0 {
            return Err(EvalError::FuelExhausted(self.limits.fuel));
        }
        self.fuel -= 1;
        Ok(())
    }

    /// Charges `units` of fuel at once, for work proportional to a size.
    fn charge(&mut self, units: u64) -> Result<(), EvalError> {
        if units > self.fuel {
            self.fuel = 0;
            return Err(EvalError::FuelExhausted(self.limits.fuel));
        }
        self.fuel -= units;
        Ok(())
    }

    fn enter(&mut self) -> Result<(), EvalError> {
        if self.nesting >= MAX_EVAL_NESTING {
            return Err(EvalError::NestingLimit(MAX_EVAL_NESTING));
        }
        self.nesting += 1;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn exec_block(&mut self, body: &[Stmt], env: &mut Env<'_>) -> Result<Flow, EvalError> {
        for stmt in body {
            match self.exec(stmt, env)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec(&mut self, stmt: &Stmt, env: &mut Env<'_>) -> Result<Flow, EvalError> {
        self.enter()?;
        let flow = self.exec_stmt(stmt, env);
        self.nesting -= 1;
        flow
    }

    fn exec_stmt(&mut self, stmt: &Stmt, env: &mut Env<'_>) -> Result<Flow, EvalError> {
        self.tick()?;
        match stmt {
            Stmt::Expr(expr) => {
                self.eval(expr, env)?;
            }
            Stmt::Assign { targets, value } => {
                let value = self.eval(value, env)?;
                for target in targets {
                    self.assign(target, value.clone(), env)?;
                }
            }
            Stmt::AugAssign { target, op, value } => {
                let current = match target {
                    Target::Name(name) => self.lookup(name, env)?,
                    Target::Subscript { name, index } => {
                        let base = self.lookup(name, env)?;
                        let index = self.eval(index, env)?;
                        self.index_value(&base, &index)?
                    }
                    Target::Tuple(_) => {
                        return Err(EvalError::Type(
                            "illegal target for augmented assignment".to_string(),
                        ))
                    }
                };
                let rhs = self.eval(value, env)?;
                let updated = binary_op(*op, &current, &rhs)?;
                self.assign(target, updated, env)?;
            }
            Stmt::If { cond, body, orelse } => {
                let branch = if self.eval(cond, env)?.truthy()? {
                    body
                } else {
                    orelse
                };
                return self.exec_block(branch, env);
            }
            Stmt::For { target, iter, body } => {
                let items = self.eval(iter, env)?.iter_values()?;
                for item in items {
                    self.tick()?;
                    self.assign(target, item, env)?;
                    match self.exec_block(body, env)? {
                        Flow::Break => break,
                        Flow::Continue | Flow::Normal => {}
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                }
            }
            Stmt::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr, env)?,
                    None => Value::None,
                };
                return Ok(Flow::Return(value));
            }
            Stmt::Assert { test, message } => {
                if !self.eval(test, env)?.truthy()? {
                    let message = match message {
                        Some(expr) => self.eval(expr, env)?.to_string(),
                        None => String::new(),
                    };
                    return Err(EvalError::Assertion(message));
                }
            }
            Stmt::Import { module, alias, .. } => {
                let (name, value) = self.import(module, alias.as_deref())?;
                env.locals.insert(name, value);
            }
            Stmt::ImportFrom { module, names, .. } => {
                let source = self
                    .surface
                    .module(module)
                    .ok_or_else(|| EvalError::Import(format!("no module named '{}'", module)))?
                    .clone();
                for (name, alias) in names {
                    let value = match source.attrs.get(name) {
                        Some(value) => value.clone(),
                        None => self
                            .surface
                            .module(&format!("{}.{}", module, name))
                            .map(|m| Value::Module(m.clone()))
                            .ok_or_else(|| {
                                EvalError::Import(format!(
                                    "cannot import name '{}' from '{}'",
                                    name, module
                                ))
                            })?,
                    };
                    env.locals
                        .insert(alias.clone().unwrap_or_else(|| name.clone()), value);
                }
            }
            Stmt::FunctionDef(def) => {
                env.locals
                    .insert(def.name.clone(), Value::Function(Arc::clone(def)));
            }
            Stmt::Pass => {}
            Stmt::Break => return Ok(Flow::Break),
            Stmt::Continue => return Ok(Flow::Continue),
        }
        Ok(Flow::Normal)
    }

    fn import(&self, module: &str, alias: Option<&str>) -> Result<(String, Value), EvalError> {
        let not_found = || EvalError::Import(format!("no module named '{}'", module));
        match alias {
            Some(alias) => {
                let m = self.surface.module(module).ok_or_else(not_found)?;
                Ok((alias.to_string(), Value::Module(m.clone())))
            }
            None => {
                self.surface.module(module).ok_or_else(not_found)?;
                let top = module.split('.').next().unwrap_or(module);
                let m = self.surface.module(top).ok_or_else(not_found)?;
                Ok((top.to_string(), Value::Module(m.clone())))
            }
        }
    }

    fn assign(&mut self, target: &Target, value: Value, env: &mut Env<'_>) -> Result<(), EvalError> {
        match target {
            Target::Name(name) => {
                env.locals.insert(name.clone(), value);
            }
            Target::Tuple(targets) => {
                let items = value.iter_values()?;
                if items.len() != targets.len() {
                    let message = if items.len() < targets.len() {
                        format!(
                            "not enough values to unpack (expected {}, got {})",
                            targets.len(),
                            items.len()
                        )
                    } else {
                        format!("too many values to unpack (expected {})", targets.len())
                    };
                    return Err(EvalError::Value(message));
                }
                for (target, item) in targets.iter().zip(items) {
                    self.assign(target, item, env)?;
                }
            }
            Target::Subscript { name, index } => {
                let index = self.eval(index, env)?.as_index()?;
                let mut container = self.lookup(name, env)?;
                match &mut container {
                    Value::Array(values) => {
                        let position = resolve_index(index, values.len())?;
                        values[position] = value.as_f64().ok_or_else(|| {
                            EvalError::Type(format!(
                                "array elements must be numbers, not '{}'",
                                value.type_name()
                            ))
                        })?;
                    }
                    Value::List(items) => {
                        let position = resolve_index(index, items.len())?;
                        if value.nesting() + 1 > MAX_LIST_NESTING {
                            return Err(EvalError::NestingLimit(MAX_LIST_NESTING));
                        }
                        items[position] = value;
                    }
                    other => {
                        return Err(EvalError::Type(format!(
                            "'{}' object does not support item assignment",
                            other.type_name()
                        )))
                    }
                }
                env.locals.insert(name.clone(), container);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn lookup(&self, name: &str, env: &Env<'_>) -> Result<Value, EvalError> {
        env.locals
            .get(name)
            .or_else(|| env.globals.get(name))
            .or_else(|| self.surface.builtin(name))
            .cloned()
            .ok_or_else(|| EvalError::Name(name.to_string()))
    }

    fn eval(&mut self, expr: &Expr, env: &mut Env<'_>) -> Result<Value, EvalError> {
        self.enter()?;
        let value = self.eval_expr(expr, env);
        self.nesting -= 1;
        value
    }

    fn eval_expr(&mut self, expr: &Expr, env: &mut Env<'_>) -> Result<Value, EvalError> {
        self.tick()?;
        match expr {
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::None => Ok(Value::None),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Name(name) => self.lookup(name, env),
            Expr::List(items) | Expr::Tuple(items) => nested_list(
                items
                    .iter()
                    .map(|item| self.eval(item, env))
                    .collect::<Result<_, _>>()?,
            ),
            Expr::Unary { op, operand } => {
                let value = self.eval(operand, env)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.truthy()?)),
                    UnaryOp::Neg => binary_op(BinOp::Mul, &value, &Value::Number(-1.0)),
                    UnaryOp::Pos => binary_op(BinOp::Mul, &value, &Value::Number(1.0)),
                }
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left, env)?;
                let right = self.eval(right, env)?;
                let result = binary_op(*op, &left, &right)?;
                self.charge(work(&result))?;
                Ok(result)
            }
            Expr::BoolOp { op, left, right } => {
                let left = self.eval(left, env)?;
                let short_circuit = match op {
                    BoolOp::And => !left.truthy()?,
                    BoolOp::Or => left.truthy()?,
                };
                if short_circuit {
                    Ok(left)
                } else {
                    self.eval(right, env)
                }
            }
            Expr::Compare { first, rest } => {
                let mut left = self.eval(first, env)?;
                let mut result = Value::Bool(true);
                for (i, (op, right)) in rest.iter().enumerate() {
                    let right = self.eval(right, env)?;
                    result = compare(*op, &left, &right)?;
                    if i + 1 < rest.len() && !result.truthy()? {
                        return Ok(result);
                    }
                    left = right;
                }
                Ok(result)
            }
            Expr::IfExp {
                cond,
                then,
                otherwise,
            } => {
                if self.eval(cond, env)?.truthy()? {
                    self.eval(then, env)
                } else {
                    self.eval(otherwise, env)
                }
            }
            Expr::Attribute { value, attr } => {
                let base = self.eval(value, env)?;
                self.attribute(&base, attr)
            }
            Expr::Subscript { value, index } => {
                let base = self.eval(value, env)?;
                match index.as_ref() {
                    Index::Single(expr) => {
                        let index = self.eval(expr, env)?;
                        self.index_value(&base, &index)
                    }
                    Index::Slice { lower, upper, step } => {
                        let lower = self.eval_slice_bound(lower, env)?;
                        let upper = self.eval_slice_bound(upper, env)?;
                        let step = self.eval_slice_bound(step, env)?;
                        let len = base.len()?;
                        let picked = slice_indices(lower, upper, step, len)?;
                        match &base {
                            Value::Array(values) => {
                                Ok(Value::Array(picked.iter().map(|i| values[*i]).collect()))
                            }
                            Value::List(items) => {
                                Ok(Value::List(picked.iter().map(|i| items[*i].clone()).collect()))
                            }
                            other => Err(EvalError::Type(format!(
                                "'{}' object is not sliceable",
                                other.type_name()
                            ))),
                        }
                    }
                }
            }
            Expr::Call { func, args, kwargs } => self.eval_call(func, args, kwargs, env),
            Expr::ListComp {
                element,
                target,
                iter,
                conditions,
            } => self.eval_comprehension(element, target, iter, conditions, env),
        }
    }

    fn eval_slice_bound(
        &mut self,
        bound: &Option<Expr>,
        env: &mut Env<'_>,
    ) -> Result<Option<i64>, EvalError> {
        match bound {
            Some(expr) => match self.eval(expr, env)? {
                Value::None => Ok(None),
                v => v.as_index().map(Some),
            },
            None => Ok(None),
        }
    }

    fn attribute(&self, base: &Value, attr: &str) -> Result<Value, EvalError> {
        match base {
            Value::Module(module) => module.attrs.get(attr).cloned().ok_or_else(|| {
                EvalError::Attribute(format!(
                    "module '{}' has no attribute '{}'",
                    module.name, attr
                ))
            }),
            Value::Array(values) => match attr {
                "shape" => Ok(Value::List(vec![Value::Number(values.len() as f64)])),
                "size" => Ok(Value::Number(values.len() as f64)),
                "ndim" => Ok(Value::Number(1.0)),
                "T" => Ok(base.clone()),
                _ => Err(EvalError::Attribute(format!(
                    "'ndarray' object has no attribute '{}'",
                    attr
                ))),
            },
            other => Err(EvalError::Attribute(format!(
                "'{}' object has no attribute '{}'",
                other.type_name(),
                attr
            ))),
        }
    }

    fn index_value(&self, base: &Value, index: &Value) -> Result<Value, EvalError> {
        let index = index.as_index()?;
        match base {
            Value::Array(values) => Ok(Value::Number(values[resolve_index(index, values.len())?])),
            Value::List(items) => Ok(items[resolve_index(index, items.len())?].clone()),
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                Ok(Value::Str(chars[resolve_index(index, chars.len())?].to_string()))
            }
            other => Err(EvalError::Type(format!(
                "'{}' object is not subscriptable",
                other.type_name()
            ))),
        }
    }

    fn eval_call(
        &mut self,
        func: &Expr,
        args: &[Expr],
        kwargs: &[(String, Expr)],
        env: &mut Env<'_>,
    ) -> Result<Value, EvalError> {
        // Methods on values rather than modules: `obs.sum()`, `xs.append(v)`.
        if let Expr::Attribute { value, attr } = func {
            let receiver = self.eval(value, env)?;
            if !matches!(receiver, Value::Module(_)) {
                return self.call_method(value, receiver, attr, args, kwargs, env);
            }
            let callee = self.attribute(&receiver, attr)?;
            let (args, kwargs) = self.eval_arguments(args, kwargs, env)?;
            return self.invoke(callee, args, kwargs, env);
        }

        let callee = self.eval(func, env)?;
        let (args, kwargs) = self.eval_arguments(args, kwargs, env)?;
        self.invoke(callee, args, kwargs, env)
    }

    fn eval_arguments(
        &mut self,
        args: &[Expr],
        kwargs: &[(String, Expr)],
        env: &mut Env<'_>,
    ) -> Result<(Vec<Value>, Vec<(String, Value)>), EvalError> {
        let args = args
            .iter()
            .map(|a| self.eval(a, env))
            .collect::<Result<Vec<_>, _>>()?;
        let kwargs = kwargs
            .iter()
            .map(|(k, v)| self.eval(v, env).map(|value| (k.clone(), value)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok((args, kwargs))
    }

    fn invoke(
        &mut self,
        callee: Value,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        env: &mut Env<'_>,
    ) -> Result<Value, EvalError> {
        match callee {
            Value::Native(native) => {
                let result = (native.func)(&args, &kwargs)?;
                let units = args
                    .iter()
                    .chain(kwargs.iter().map(|(_, v)| v))
                    .chain(std::iter::once(&result))
                    .map(work)
                    .sum();
                self.charge(units)?;
                Ok(result)
            }
            Value::Function(def) => {
                let globals: &Scope = if env.module_level {
                    &env.locals
                } else {
                    env.globals
                };
                self.call_function(&def, args, kwargs, globals)
            }
            other => Err(EvalError::Type(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_method(
        &mut self,
        receiver_expr: &Expr,
        receiver: Value,
        method: &str,
        args: &[Expr],
        kwargs: &[(String, Expr)],
        env: &mut Env<'_>,
    ) -> Result<Value, EvalError> {
        let (mut args, kwargs) = self.eval_arguments(args, kwargs, env)?;
        match (&receiver, method) {
            (Value::List(items), "append") => {
                let Expr::Name(name) = receiver_expr else {
                    return Err(EvalError::Type(
                        "append() is only supported on named lists".to_string(),
                    ));
                };
                let [item] = <[Value; 1]>::try_from(args).map_err(|_| {
                    EvalError::Type("append() takes exactly one argument".to_string())
                })?;
                self.charge(items.len() as u64)?;
                let mut items = items.clone();
                items.push(item);
                let items = nested_list(items)?;
                env.locals.insert(name.clone(), items);
                Ok(Value::None)
            }
            (Value::Array(values), "item") => match values.as_slice() {
                [single] => Ok(Value::Number(*single)),
                _ => Err(EvalError::Value(
                    "can only convert an array of size 1 to a Python scalar".to_string(),
                )),
            },
            (Value::Array(values), "tolist") => {
                self.charge(values.len() as u64)?;
                Ok(Value::List(values.iter().map(|v| Value::Number(*v)).collect()))
            }
            (Value::Array(_), "copy" | "flatten" | "ravel") => Ok(receiver.clone()),
            (Value::Array(_), name) if ARRAY_METHODS.contains(&name) => {
                let callee = self
                    .surface
                    .module("numpy")
                    .and_then(|np| np.attrs.get(name))
                    .cloned()
                    .ok_or_else(|| EvalError::Attribute(format!("no numpy function '{}'", name)))?;
                args.insert(0, receiver.clone());
                self.invoke(callee, args, kwargs, env)
            }
            (other, name) => Err(EvalError::Attribute(format!(
                "'{}' object has no attribute '{}'",
                other.type_name(),
                name
            ))),
        }
    }

    fn eval_comprehension(
        &mut self,
        element: &Expr,
        target: &Target,
        iter: &Expr,
        conditions: &[Expr],
        env: &mut Env<'_>,
    ) -> Result<Value, EvalError> {
        let items = self.eval(iter, env)?.iter_values()?;

        // Comprehension variables must not leak into the enclosing scope.
        let mut names = Vec::new();
        collect_names(target, &mut names);
        let saved: Vec<(String, Option<Value>)> = names
            .iter()
            .map(|n| (n.clone(), env.locals.get(n).cloned()))
            .collect();

        let result = (|| -> Result<Value, EvalError> {
            let mut out = Vec::with_capacity(items.len());
            'items: for item in items {
                self.tick()?;
                self.assign(target, item, env)?;
                for cond in conditions {
                    if !self.eval(cond, env)?.truthy()? {
                        continue 'items;
                    }
                }
                out.push(self.eval(element, env)?);
            }
            nested_list(out)
        })();

        for (name, previous) in saved {
            match previous {
                Some(value) => env.locals.insert(name, value),
                None => env.locals.remove(&name),
            };
        }
        result
    }
}

fn nested_list(items: Vec<Value>) -> Result<Value, EvalError> {
    let list = Value::List(items);
    if list.nesting() > MAX_LIST_NESTING {
        return Err(EvalError::NestingLimit(MAX_LIST_NESTING));
    }
    Ok(list)
}

/// Fuel owed for touching `value`, beyond the flat per-step charge.
fn work(value: &Value) -> u64 {
    match value {
        Value::Array(values) => values.len() as u64,
        Value::List(items) => items.len() as u64,
        _ => 0,
    }
}

fn collect_names(target: &Target, out: &mut Vec<String>) {
    match target {
        Target::Name(name) => out.push(name.clone()),
        Target::Tuple(items) => items.iter().for_each(|t| collect_names(t, out)),
        Target::Subscript { .. } => {}
    }
}
