//! Recursive-descent parser for reward function source.
//!
//! Accepts a small statement-oriented subset of Python. Constructs that
//! would let a reward function loop unboundedly, touch the host, or define
//! new types are rejected here, before anything runs.

use std::sync::Arc;

use super::ast::{
    BinOp, BoolOp, CmpOp, Expr, FunctionDef, Index, Module, Param, Stmt, Target, UnaryOp,
};
use super::lexer::{tokenize, Token, TokenKind};
use super::CompileError;

/// Keywords that are rejected outright.
const DISALLOWED: &[&str] = &[
    "while", "class", "try", "except", "finally", "with", "lambda", "global", "nonlocal", "del",
    "raise", "yield", "async", "await",
];

/// Keywords that may not be used as identifiers.
const RESERVED: &[&str] = &[
    "def", "if", "elif", "else", "for", "in", "return", "pass", "break", "continue", "import",
    "from", "as", "assert", "and", "or", "not", "is", "True", "False", "None",
];

/// Deepest expression or block nesting the parser accepts.
pub const MAX_NESTING: usize = 100;

/// Parse `source` into a module.
pub fn parse(source: &str) -> Result<Module, CompileError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        fn_depth: 0,
        nesting: 0,
    };
    parser.parse_module()
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    fn_depth: usize,
    nesting: usize,
}

impl Parser {
    // ------------------------------------------------------------------
    // Token helpers
    // ------------------------------------------------------------------

    fn peek(&self) -> &TokenKind {
        self.tokens
            .get(self.pos)
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::Eof)
    }

    fn peek_next(&self) -> &TokenKind {
        self.tokens
            .get(self.pos + 1)
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::Eof)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        kind
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::Parse {
            line: self.line(),
            message: message.into(),
        }
    }

    /// Enters one nesting level, released with `ascend`. Errors abandon the
    /// parse, so the count is not unwound.
    fn descend(&mut self) -> Result<(), CompileError> {
        if self.nesting >= MAX_NESTING {
            return Err(self.error(format!(
                "expression or block nested more than {} levels deep",
                MAX_NESTING
            )));
        }
        self.nesting += 1;
        Ok(())
    }

    fn ascend(&mut self, levels: usize) {
        self.nesting -= levels;
    }

    fn check_punct(&self, punct: &str) -> bool {
        matches!(self.peek(), TokenKind::Punct(p) if *p == punct)
    }

    fn eat_punct(&mut self, punct: &str) -> bool {
        if self.check_punct(punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, punct: &str) -> Result<(), CompileError> {
        if self.eat_punct(punct) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}', found {}", punct, describe(self.peek()))))
        }
    }

    fn check_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), TokenKind::Name(n) if n == keyword)
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.check_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> Result<(), CompileError> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(self.error(format!(
                "expected '{}', found {}",
                keyword,
                describe(self.peek())
            )))
        }
    }

    fn expect_name(&mut self) -> Result<String, CompileError> {
        match self.peek().clone() {
            TokenKind::Name(name) => {
                self.reject_disallowed(&name)?;
                if RESERVED.contains(&name.as_str()) {
                    return Err(self.error(format!("unexpected keyword '{}'", name)));
                }
                self.pos += 1;
                Ok(name)
            }
            other => Err(self.error(format!("expected a name, found {}", describe(&other)))),
        }
    }

    fn reject_disallowed(&self, name: &str) -> Result<(), CompileError> {
        if DISALLOWED.contains(&name) {
            return Err(CompileError::Disallowed {
                line: self.line(),
                construct: name.to_string(),
            });
        }
        Ok(())
    }

    fn at_expression_end(&self) -> bool {
        match self.peek() {
            TokenKind::Newline | TokenKind::Eof | TokenKind::Dedent => true,
            TokenKind::Punct(p) => matches!(
                *p,
                "=" | ")" | "]" | ":" | ";" | "+=" | "-=" | "*=" | "/=" | "//=" | "%=" | "**="
            ),
            TokenKind::Name(n) => n == "in",
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn parse_module(&mut self) -> Result<Module, CompileError> {
        let mut body = Vec::new();
        loop {
            match self.peek() {
                TokenKind::Eof => break,
                TokenKind::Newline => {
                    self.pos += 1;
                }
                _ => body.extend(self.parse_statement()?),
            }
        }
        Ok(Module { body })
    }

    fn parse_statement(&mut self) -> Result<Vec<Stmt>, CompileError> {
        if let TokenKind::Name(name) = self.peek().clone() {
            self.reject_disallowed(&name)?;
            match name.as_str() {
                "def" => return Ok(vec![self.parse_def()?]),
                "if" => {
                    self.pos += 1;
                    return Ok(vec![self.parse_if_tail()?]);
                }
                "for" => return Ok(vec![self.parse_for()?]),
                _ => {}
            }
        }
        if matches!(self.peek(), TokenKind::Indent) {
            return Err(self.error("unexpected indent"));
        }
        self.parse_simple_line()
    }

    fn parse_simple_line(&mut self) -> Result<Vec<Stmt>, CompileError> {
        let mut stmts = vec![self.parse_small_statement()?];
        while self.eat_punct(";") {
            if matches!(self.peek(), TokenKind::Newline | TokenKind::Eof) {
                break;
            }
            stmts.push(self.parse_small_statement()?);
        }
        match self.peek() {
            TokenKind::Newline => {
                self.pos += 1;
                Ok(stmts)
            }
            TokenKind::Eof | TokenKind::Dedent => Ok(stmts),
            other => Err(self.error(format!("unexpected {}", describe(other)))),
        }
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, CompileError> {
        self.descend()?;
        let body = self.parse_suite()?;
        self.ascend(1);
        Ok(body)
    }

    fn parse_suite(&mut self) -> Result<Vec<Stmt>, CompileError> {
        self.expect_punct(":")?;
        if !matches!(self.peek(), TokenKind::Newline) {
            return self.parse_simple_line();
        }
        self.pos += 1;
        if !matches!(self.peek(), TokenKind::Indent) {
            return Err(self.error("expected an indented block"));
        }
        self.pos += 1;

        let mut body = Vec::new();
        loop {
            match self.peek() {
                TokenKind::Dedent => {
                    self.pos += 1;
                    break;
                }
                TokenKind::Eof => break,
                TokenKind::Newline => {
                    self.pos += 1;
                }
                _ => body.extend(self.parse_statement()?),
            }
        }
        Ok(body)
    }

    fn parse_def(&mut self) -> Result<Stmt, CompileError> {
        let line = self.line();
        self.expect_keyword("def")?;
        if self.fn_depth > 0 {
            return Err(CompileError::Disallowed {
                line,
                construct: "nested def".to_string(),
            });
        }
        let name = self.expect_name()?;
        self.expect_punct("(")?;

        let mut params = Vec::new();
        while !self.check_punct(")") {
            if self.check_punct("*") || self.check_punct("**") {
                return Err(self.error("variadic parameters are not supported"));
            }
            let param_name = self.expect_name()?;
            if self.eat_punct(":") {
                self.parse_test()?;
            }
            let default = if self.eat_punct("=") {
                Some(self.parse_test()?)
            } else {
                None
            };
            params.push(Param {
                name: param_name,
                default,
            });
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct(")")?;
        if self.eat_punct("->") {
            self.parse_test()?;
        }

        self.fn_depth += 1;
        let body = self.parse_block();
        self.fn_depth -= 1;

        Ok(Stmt::FunctionDef(Arc::new(FunctionDef {
            name,
            params,
            body: body?,
            line,
        })))
    }

    /// Parses the remainder of an `if`/`elif` after its keyword.
    fn parse_if_tail(&mut self) -> Result<Stmt, CompileError> {
        let cond = self.parse_test()?;
        let body = self.parse_block()?;
        let orelse = if self.eat_keyword("elif") {
            self.descend()?;
            let tail = self.parse_if_tail()?;
            self.ascend(1);
            vec![tail]
        } else if self.eat_keyword("else") {
            self.parse_block()?
        } else {
            Vec::new()
        };
        Ok(Stmt::If { cond, body, orelse })
    }

    fn parse_for(&mut self) -> Result<Stmt, CompileError> {
        self.expect_keyword("for")?;
        let target = self.parse_target_list()?;
        self.expect_keyword("in")?;
        let iter = self.parse_testlist()?;
        let body = self.parse_block()?;
        if self.check_keyword("else") {
            return Err(self.error("for/else is not supported"));
        }
        Ok(Stmt::For { target, iter, body })
    }

    fn parse_small_statement(&mut self) -> Result<Stmt, CompileError> {
        let line = self.line();
        if let TokenKind::Name(name) = self.peek().clone() {
            self.reject_disallowed(&name)?;
            match name.as_str() {
                "pass" => {
                    self.pos += 1;
                    return Ok(Stmt::Pass);
                }
                "break" => {
                    self.pos += 1;
                    return Ok(Stmt::Break);
                }
                "continue" => {
                    self.pos += 1;
                    return Ok(Stmt::Continue);
                }
                "return" => {
                    self.pos += 1;
                    if self.at_expression_end() {
                        return Ok(Stmt::Return(None));
                    }
                    return Ok(Stmt::Return(Some(self.parse_testlist()?)));
                }
                "assert" => {
                    self.pos += 1;
                    let test = self.parse_test()?;
                    let message = if self.eat_punct(",") {
                        Some(self.parse_test()?)
                    } else {
                        None
                    };
                    return Ok(Stmt::Assert { test, message });
                }
                "import" => {
                    self.pos += 1;
                    let module = self.parse_dotted_name()?;
                    let alias = if self.eat_keyword("as") {
                        Some(self.expect_name()?)
                    } else {
                        None
                    };
                    if self.check_punct(",") {
                        return Err(self.error("import one module per statement"));
                    }
                    return Ok(Stmt::Import {
                        module,
                        alias,
                        line,
                    });
                }
                "from" => {
                    self.pos += 1;
                    return self.parse_import_from(line);
                }
                _ => {}
            }
        }
        self.parse_expression_statement()
    }

    fn parse_dotted_name(&mut self) -> Result<String, CompileError> {
        let mut name = self.expect_name()?;
        while self.eat_punct(".") {
            name.push('.');
            name.push_str(&self.expect_name()?);
        }
        Ok(name)
    }

    fn parse_import_from(&mut self, line: usize) -> Result<Stmt, CompileError> {
        let module = self.parse_dotted_name()?;
        self.expect_keyword("import")?;
        if self.check_punct("*") {
            return Err(CompileError::Disallowed {
                line,
                construct: "wildcard import".to_string(),
            });
        }
        let parenthesized = self.eat_punct("(");
        let mut names = Vec::new();
        loop {
            let name = self.expect_name()?;
            let alias = if self.eat_keyword("as") {
                Some(self.expect_name()?)
            } else {
                None
            };
            names.push((name, alias));
            if !self.eat_punct(",") {
                break;
            }
            if parenthesized && self.check_punct(")") {
                break;
            }
        }
        if parenthesized {
            self.expect_punct(")")?;
        }
        Ok(Stmt::ImportFrom {
            module,
            names,
            line,
        })
    }

    fn parse_expression_statement(&mut self) -> Result<Stmt, CompileError> {
        let first = self.parse_testlist()?;

        // Annotated assignment or bare declaration.
        if self.eat_punct(":") {
            self.parse_test()?;
            if self.eat_punct("=") {
                let value = self.parse_testlist()?;
                return Ok(Stmt::Assign {
                    targets: vec![self.to_target(first)?],
                    value,
                });
            }
            self.to_target(first)?;
            return Ok(Stmt::Pass);
        }

        let aug = match self.peek() {
            TokenKind::Punct("+=") => Some(BinOp::Add),
            TokenKind::Punct("-=") => Some(BinOp::Sub),
            TokenKind::Punct("*=") => Some(BinOp::Mul),
            TokenKind::Punct("/=") => Some(BinOp::Div),
            TokenKind::Punct("//=") => Some(BinOp::FloorDiv),
            TokenKind::Punct("%=") => Some(BinOp::Mod),
            TokenKind::Punct("**=") => Some(BinOp::Pow),
            _ => None,
        };
        if let Some(op) = aug {
            self.pos += 1;
            let target = self.to_target(first)?;
            if matches!(target, Target::Tuple(_)) {
                return Err(self.error("augmented assignment to a tuple"));
            }
            let value = self.parse_testlist()?;
            return Ok(Stmt::AugAssign { target, op, value });
        }

        if !self.check_punct("=") {
            return Ok(Stmt::Expr(first));
        }

        let mut pending = vec![first];
        let value = loop {
            self.expect_punct("=")?;
            let next = self.parse_testlist()?;
            if self.check_punct("=") {
                pending.push(next);
            } else {
                break next;
            }
        };
        let targets = pending
            .into_iter()
            .map(|e| self.to_target(e))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Stmt::Assign { targets, value })
    }

    fn to_target(&self, expr: Expr) -> Result<Target, CompileError> {
        match expr {
            Expr::Name(name) => Ok(Target::Name(name)),
            Expr::Tuple(items) | Expr::List(items) => Ok(Target::Tuple(
                items
                    .into_iter()
                    .map(|e| self.to_target(e))
                    .collect::<Result<_, _>>()?,
            )),
            Expr::Subscript { value, index } => match (*value, *index) {
                (Expr::Name(name), Index::Single(index)) => Ok(Target::Subscript {
                    name,
                    index: Box::new(index),
                }),
                _ => Err(self.error("only simple `name[index]` assignment is supported")),
            },
            _ => Err(self.error("cannot assign to expression")),
        }
    }

    fn parse_target_list(&mut self) -> Result<Target, CompileError> {
        let first = self.parse_target_atom()?;
        if !self.check_punct(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_punct(",") {
            if self.check_keyword("in") || self.check_punct(")") || self.check_punct("]") {
                break;
            }
            items.push(self.parse_target_atom()?);
        }
        Ok(Target::Tuple(items))
    }

    fn parse_target_atom(&mut self) -> Result<Target, CompileError> {
        if self.eat_punct("(") {
            let inner = self.parse_target_list()?;
            self.expect_punct(")")?;
            return Ok(inner);
        }
        if self.eat_punct("[") {
            let inner = self.parse_target_list()?;
            self.expect_punct("]")?;
            return Ok(inner);
        }
        Ok(Target::Name(self.expect_name()?))
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn parse_testlist(&mut self) -> Result<Expr, CompileError> {
        let first = self.parse_test()?;
        if !self.check_punct(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_punct(",") {
            if self.at_expression_end() {
                break;
            }
            items.push(self.parse_test()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn parse_test(&mut self) -> Result<Expr, CompileError> {
        self.descend()?;
        let expr = self.parse_conditional()?;
        self.ascend(1);
        Ok(expr)
    }

    fn parse_conditional(&mut self) -> Result<Expr, CompileError> {
        if self.check_keyword("lambda") {
            return Err(CompileError::Disallowed {
                line: self.line(),
                construct: "lambda".to_string(),
            });
        }
        let expr = self.parse_or()?;
        if self.eat_keyword("if") {
            let cond = self.parse_or()?;
            self.expect_keyword("else")?;
            let otherwise = self.parse_test()?;
            return Ok(Expr::IfExp {
                cond: Box::new(cond),
                then: Box::new(expr),
                otherwise: Box::new(otherwise),
            });
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_and()?;
        let mut chain = 0;
        while self.eat_keyword("or") {
            self.descend()?;
            chain += 1;
            let right = self.parse_and()?;
            left = Expr::BoolOp {
                op: BoolOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.ascend(chain);
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_not()?;
        let mut chain = 0;
        while self.eat_keyword("and") {
            self.descend()?;
            chain += 1;
            let right = self.parse_not()?;
            left = Expr::BoolOp {
                op: BoolOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        self.ascend(chain);
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, CompileError> {
        if self.eat_keyword("not") {
            self.descend()?;
            let operand = self.parse_not()?;
            self.ascend(1);
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, CompileError> {
        let first = self.parse_arith()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                TokenKind::Punct("<") => CmpOp::Lt,
                TokenKind::Punct(">") => CmpOp::Gt,
                TokenKind::Punct("==") => CmpOp::Eq,
                TokenKind::Punct("!=") => CmpOp::NotEq,
                TokenKind::Punct("<=") => CmpOp::LtE,
                TokenKind::Punct(">=") => CmpOp::GtE,
                TokenKind::Name(n) if n == "in" => CmpOp::In,
                TokenKind::Name(n) if n == "is" => CmpOp::Is,
                TokenKind::Name(n)
                    if n == "not" && matches!(self.peek_next(), TokenKind::Name(m) if m == "in") =>
                {
                    CmpOp::NotIn
                }
                _ => break,
            };
            self.pos += if op == CmpOp::NotIn { 2 } else { 1 };
            let op = if op == CmpOp::Is && self.eat_keyword("not") {
                CmpOp::IsNot
            } else {
                op
            };
            rest.push((op, self.parse_arith()?));
        }
        if rest.is_empty() {
            return Ok(first);
        }
        Ok(Expr::Compare {
            first: Box::new(first),
            rest,
        })
    }

    fn parse_arith(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_term()?;
        let mut chain = 0;
        loop {
            let op = match self.peek() {
                TokenKind::Punct("+") => BinOp::Add,
                TokenKind::Punct("-") => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            self.descend()?;
            chain += 1;
            let right = self.parse_term()?;
            left = binary(op, left, right);
        }
        self.ascend(chain);
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, CompileError> {
        let mut left = self.parse_factor()?;
        let mut chain = 0;
        loop {
            let op = match self.peek() {
                TokenKind::Punct("*") => BinOp::Mul,
                TokenKind::Punct("/") => BinOp::Div,
                TokenKind::Punct("//") => BinOp::FloorDiv,
                TokenKind::Punct("%") => BinOp::Mod,
                TokenKind::Punct("@") => BinOp::MatMul,
                _ => break,
            };
            self.pos += 1;
            self.descend()?;
            chain += 1;
            let right = self.parse_factor()?;
            left = binary(op, left, right);
        }
        self.ascend(chain);
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Expr, CompileError> {
        let op = match self.peek() {
            TokenKind::Punct("-") => Some(UnaryOp::Neg),
            TokenKind::Punct("+") => Some(UnaryOp::Pos),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            self.descend()?;
            let operand = self.parse_factor()?;
            self.ascend(1);
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
            });
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> Result<Expr, CompileError> {
        let base = self.parse_primary()?;
        if self.eat_punct("**") {
            self.descend()?;
            let exponent = self.parse_factor()?;
            self.ascend(1);
            return Ok(binary(BinOp::Pow, base, exponent));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr, CompileError> {
        let mut expr = self.parse_atom()?;
        let mut chain = 0;
        loop {
            if matches!(self.peek(), TokenKind::Punct("(" | "[" | ".")) {
                self.descend()?;
                chain += 1;
            }
            if self.eat_punct("(") {
                expr = self.parse_call(expr)?;
            } else if self.eat_punct("[") {
                let index = self.parse_index()?;
                self.expect_punct("]")?;
                expr = Expr::Subscript {
                    value: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.eat_punct(".") {
                let attr = self.expect_name()?;
                expr = Expr::Attribute {
                    value: Box::new(expr),
                    attr,
                };
            } else {
                break;
            }
        }
        self.ascend(chain);
        Ok(expr)
    }

    fn parse_call(&mut self, func: Expr) -> Result<Expr, CompileError> {
        let mut args = Vec::new();
        let mut kwargs = Vec::new();
        while !self.check_punct(")") {
            if self.check_punct("*") || self.check_punct("**") {
                return Err(self.error("argument unpacking is not supported"));
            }
            let is_kwarg = matches!(self.peek(), TokenKind::Name(_))
                && matches!(self.peek_next(), TokenKind::Punct("="));
            if is_kwarg {
                let name = self.expect_name()?;
                self.expect_punct("=")?;
                kwargs.push((name, self.parse_test()?));
            } else {
                if !kwargs.is_empty() {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                let arg = self.parse_test()?;
                if self.check_keyword("for") {
                    args.push(self.parse_comprehension(arg)?);
                } else {
                    args.push(arg);
                }
            }
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct(")")?;
        Ok(Expr::Call {
            func: Box::new(func),
            args,
            kwargs,
        })
    }

    fn parse_index(&mut self) -> Result<Index, CompileError> {
        let lower = if self.check_punct(":") {
            None
        } else {
            let single = self.parse_test()?;
            if !self.check_punct(":") {
                if self.check_punct(",") {
                    return Err(self.error("multi-dimensional indexing is not supported"));
                }
                return Ok(Index::Single(single));
            }
            Some(single)
        };
        self.expect_punct(":")?;
        let upper = if self.check_punct(":") || self.check_punct("]") {
            None
        } else {
            Some(self.parse_test()?)
        };
        let step = if self.eat_punct(":") && !self.check_punct("]") {
            Some(self.parse_test()?)
        } else {
            None
        };
        Ok(Index::Slice { lower, upper, step })
    }

    fn parse_comprehension(&mut self, element: Expr) -> Result<Expr, CompileError> {
        self.expect_keyword("for")?;
        let target = self.parse_target_list()?;
        self.expect_keyword("in")?;
        let iter = self.parse_or()?;
        let mut conditions = Vec::new();
        while self.eat_keyword("if") {
            conditions.push(self.parse_or()?);
        }
        if self.check_keyword("for") {
            return Err(self.error("nested comprehensions are not supported"));
        }
        Ok(Expr::ListComp {
            element: Box::new(element),
            target,
            iter: Box::new(iter),
            conditions,
        })
    }

    fn parse_atom(&mut self) -> Result<Expr, CompileError> {
        match self.peek().clone() {
            TokenKind::Number(value) => {
                self.pos += 1;
                Ok(Expr::Number(value))
            }
            TokenKind::Str(value) => {
                self.pos += 1;
                let mut value = value;
                while let TokenKind::Str(next) = self.peek().clone() {
                    self.pos += 1;
                    value.push_str(&next);
                }
                Ok(Expr::Str(value))
            }
            TokenKind::Name(name) => match name.as_str() {
                "True" => {
                    self.pos += 1;
                    Ok(Expr::Bool(true))
                }
                "False" => {
                    self.pos += 1;
                    Ok(Expr::Bool(false))
                }
                "None" => {
                    self.pos += 1;
                    Ok(Expr::None)
                }
                _ => Ok(Expr::Name(self.expect_name()?)),
            },
            TokenKind::Punct("(") => {
                self.pos += 1;
                if self.eat_punct(")") {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                let first = self.parse_test()?;
                if self.check_keyword("for") {
                    let comp = self.parse_comprehension(first)?;
                    self.expect_punct(")")?;
                    return Ok(comp);
                }
                if !self.check_punct(",") {
                    self.expect_punct(")")?;
                    return Ok(first);
                }
                let mut items = vec![first];
                while self.eat_punct(",") {
                    if self.check_punct(")") {
                        break;
                    }
                    items.push(self.parse_test()?);
                }
                self.expect_punct(")")?;
                Ok(Expr::Tuple(items))
            }
            TokenKind::Punct("[") => {
                self.pos += 1;
                if self.eat_punct("]") {
                    return Ok(Expr::List(Vec::new()));
                }
                let first = self.parse_test()?;
                if self.check_keyword("for") {
                    let comp = self.parse_comprehension(first)?;
                    self.expect_punct("]")?;
                    return Ok(comp);
                }
                let mut items = vec![first];
                while self.eat_punct(",") {
                    if self.check_punct("]") {
                        break;
                    }
                    items.push(self.parse_test()?);
                }
                self.expect_punct("]")?;
                Ok(Expr::List(items))
            }
            TokenKind::Punct("{") => Err(self.error("dict and set literals are not supported")),
            other => {
                let message = format!("unexpected {}", describe(&other));
                self.advance();
                Err(self.error(message))
            }
        }
    }
}

fn binary(op: BinOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Name(n) => format!("'{}'", n),
        TokenKind::Number(v) => format!("number {}", v),
        TokenKind::Str(_) => "string literal".to_string(),
        TokenKind::Punct(p) => format!("'{}'", p),
        TokenKind::Newline => "end of line".to_string(),
        TokenKind::Indent => "indent".to_string(),
        TokenKind::Dedent => "dedent".to_string(),
        TokenKind::Eof => "end of input".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(source: &str) -> Module {
        parse(source).expect("source should parse")
    }

    fn single_function(source: &str) -> Arc<FunctionDef> {
        let module = parse_ok(source);
        module
            .body
            .into_iter()
            .find_map(|s| match s {
                Stmt::FunctionDef(def) => Some(def),
                _ => None,
            })
            .expect("module should define a function")
    }

    #[test]
    fn test_parse_reward_function() {
        let def = single_function(
            r#"
import numpy as np

def reward(observation: np.ndarray, is_success: bool, is_failure: bool) -> float:
    """Keep the pole upright."""
    x, x_dot, theta, theta_dot = observation
    if is_success:
        return 10.0
    elif is_failure:
        return -10.0
    reward = 1.0 - abs(theta) / 0.2095
    reward -= 0.1 * x ** 2
    return float(reward)
"#,
        );
        assert_eq!(def.name, "reward");
        assert_eq!(def.params.len(), 3);
        assert_eq!(def.params[1].name, "is_success");
        assert_eq!(def.body.len(), 6);
    }

    #[test]
    fn test_parse_defaults_and_kwargs() {
        let def = single_function("def f(a, b=2.0):\n    return np.clip(a, a_min=-1, a_max=b)\n");
        assert!(def.params[1].default.is_some());
        match &def.body[0] {
            Stmt::Return(Some(Expr::Call { kwargs, .. })) => assert_eq!(kwargs.len(), 2),
            other => panic!("unexpected statement: {:?}", other),
        }
    }

    #[test]
    fn test_operator_precedence() {
        let module = parse_ok("x = -2 ** 2 + 3 * 4\n");
        match &module.body[0] {
            Stmt::Assign {
                value: Expr::Binary { op: BinOp::Add, left, .. },
                ..
            } => assert!(matches!(
                left.as_ref(),
                Expr::Unary {
                    op: UnaryOp::Neg,
                    ..
                }
            )),
            other => panic!("unexpected statement: {:?}", other),
        }
    }

    #[test]
    fn test_chained_comparison_and_not_in() {
        let module = parse_ok("ok = 0 < x <= 1 and y not in z\n");
        match &module.body[0] {
            Stmt::Assign {
                value: Expr::BoolOp { left, right, .. },
                ..
            } => {
                assert!(matches!(left.as_ref(), Expr::Compare { rest, .. } if rest.len() == 2));
                assert!(
                    matches!(right.as_ref(), Expr::Compare { rest, .. } if rest[0].0 == CmpOp::NotIn)
                );
            }
            other => panic!("unexpected statement: {:?}", other),
        }
    }

    #[test]
    fn test_comprehensions_and_slices() {
        parse_ok("s = sum([v * v for v in obs[:2] if v > 0])\n");
        parse_ok("s = sum(v * v for v in obs[::2])\n");
        parse_ok("t = obs[-1]\n");
    }

    #[test]
    fn test_single_line_blocks() {
        let def = single_function("def f(x):\n    if x > 0: return 1.0\n    else: return 0.0\n");
        assert!(matches!(def.body[0], Stmt::If { .. }));
    }

    #[test]
    fn test_disallowed_constructs() {
        for source in [
            "while True:\n    pass\n",
            "class A:\n    pass\n",
            "def f():\n    try:\n        pass\n    except:\n        pass\n",
            "f = lambda x: x\n",
            "def f():\n    global y\n",
            "with open('x') as fh:\n    pass\n",
            "def f():\n    def g():\n        return 1\n    return g()\n",
            "from os import *\n",
        ] {
            let err = parse(source).unwrap_err();
            assert!(
                matches!(err, CompileError::Disallowed { .. }),
                "{:?} for {:?}",
                err,
                source
            );
        }
    }

    #[test]
    fn test_syntax_errors() {
        for source in [
            "def f(x)\n    return x\n",
            "x = (1, 2\n",
            "x = {1: 2}\n",
            "def f(x):\nreturn x\n",
            "1 = x\n",
        ] {
            assert!(parse(source).is_err(), "{:?} should not parse", source);
        }
    }
}
