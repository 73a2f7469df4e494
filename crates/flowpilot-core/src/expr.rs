// Sandboxed expression evaluator
//
// Used by condition nodes, loop `for_each` / `break_if`, and templated
// `delay.until` values. Accepts a restricted Python-flavored grammar:
// literals, context identifiers, attribute access, subscripting, arithmetic,
// comparisons, boolean operators, `in`, single-clause list comprehensions,
// and a whitelist of builtins. Expressions are parsed first and every free
// identifier is screened against the whitelist and the supplied context
// before any evaluation happens; the forbidden-name set is rejected
// unconditionally.

use std::collections::HashSet;

use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Names that are never allowed, regardless of context.
const FORBIDDEN_NAMES: &[&str] = &[
    "__import__",
    "exec",
    "eval",
    "compile",
    "open",
    "input",
    "breakpoint",
    "globals",
    "locals",
    "vars",
    "dir",
    "getattr",
    "setattr",
    "delattr",
    "hasattr",
];

/// Whitelisted builtin functions.
const BUILTIN_NAMES: &[&str] = &[
    "len", "str", "int", "float", "bool", "list", "dict", "tuple", "set", "range", "enumerate",
    "zip", "map", "filter", "sorted", "reversed", "min", "max", "sum", "any", "all", "abs",
    "round",
];

/// Errors raised while compiling or evaluating an expression.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExprError {
    #[error("invalid syntax: {0}")]
    Syntax(String),

    #[error("name '{0}' is not allowed")]
    NameNotAllowed(String),

    #[error("use of '{0}' is forbidden")]
    Forbidden(String),

    #[error("evaluation failed: {0}")]
    Eval(String),
}

/// Evaluate an expression against a context mapping.
pub fn evaluate(source: &str, context: &Map<String, Value>) -> Result<Value, ExprError> {
    let expr = Parser::new(source)?.parse()?;
    screen_identifiers(&expr, context)?;
    eval_expr(&expr, &Scope::root(context))
}

/// Evaluate an expression and coerce the result to a boolean.
pub fn evaluate_bool(source: &str, context: &Map<String, Value>) -> Result<bool, ExprError> {
    Ok(truthy(&evaluate(source, context)?))
}

/// Python-style truthiness over JSON values.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    // keywords
    And,
    Or,
    Not,
    In,
    For,
    If,
    True,
    False,
    None,
    // punctuation
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Dot,
    Colon,
    LBrace,
    RBrace,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    End,
}

fn tokenize(source: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '{' => {
                tokens.push(Token::LBrace);
                i += 1;
            }
            '}' => {
                tokens.push(Token::RBrace);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(ExprError::Syntax("assignment is not supported".into()));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    return Err(ExprError::Syntax("unexpected '!'".into()));
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            match chars.get(i + 1) {
                                Some('n') => s.push('\n'),
                                Some('t') => s.push('\t'),
                                Some(&ch) => s.push(ch),
                                None => {
                                    return Err(ExprError::Syntax(
                                        "unterminated string literal".into(),
                                    ))
                                }
                            }
                            i += 2;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => {
                            return Err(ExprError::Syntax("unterminated string literal".into()))
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let mut is_float = false;
                if i < chars.len()
                    && chars[i] == '.'
                    && chars.get(i + 1).map(|c| c.is_ascii_digit()).unwrap_or(false)
                {
                    is_float = true;
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                if is_float {
                    let f: f64 = text
                        .parse()
                        .map_err(|_| ExprError::Syntax(format!("bad number '{text}'")))?;
                    tokens.push(Token::Float(f));
                } else {
                    let n: i64 = text
                        .parse()
                        .map_err(|_| ExprError::Syntax(format!("bad number '{text}'")))?;
                    tokens.push(Token::Int(n));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "for" => Token::For,
                    "if" => Token::If,
                    "True" | "true" => Token::True,
                    "False" | "false" => Token::False,
                    "None" | "null" => Token::None,
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(ExprError::Syntax(format!("unexpected character '{other}'")));
            }
        }
    }

    tokens.push(Token::End);
    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    And,
    Or,
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Ident(String),
    Attr(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    List(Vec<Expr>),
    Comprehension {
        element: Box<Expr>,
        var: String,
        iterable: Box<Expr>,
        condition: Option<Box<Expr>>,
    },
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(source: &str) -> Result<Self, ExprError> {
        Ok(Self {
            tokens: tokenize(source)?,
            pos: 0,
        })
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, token: Token) -> Result<(), ExprError> {
        if *self.peek() == token {
            self.advance();
            Ok(())
        } else {
            Err(ExprError::Syntax(format!(
                "expected {token:?}, found {:?}",
                self.peek()
            )))
        }
    }

    fn parse(&mut self) -> Result<Expr, ExprError> {
        let expr = self.parse_or()?;
        if *self.peek() != Token::End {
            return Err(ExprError::Syntax(format!(
                "unexpected trailing {:?}",
                self.peek()
            )));
        }
        Ok(expr)
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_and()?;
        while *self.peek() == Token::Or {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_not()?;
        while *self.peek() == Token::And {
            self.advance();
            let right = self.parse_not()?;
            left = Expr::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ExprError> {
        if *self.peek() == Token::Not {
            self.advance();
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            Token::Eq => BinOp::Eq,
            Token::Ne => BinOp::Ne,
            Token::Lt => BinOp::Lt,
            Token::Le => BinOp::Le,
            Token::Gt => BinOp::Gt,
            Token::Ge => BinOp::Ge,
            Token::In => BinOp::In,
            Token::Not => {
                // `not in`
                self.advance();
                self.expect(Token::In)?;
                let right = self.parse_additive()?;
                return Ok(Expr::Binary(BinOp::NotIn, Box::new(left), Box::new(right)));
            }
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_additive()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn parse_additive(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinOp::Add,
                Token::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinOp::Mul,
                Token::Slash => BinOp::Div,
                Token::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if *self.peek() == Token::Minus {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    let name = match self.advance() {
                        Token::Ident(name) => name,
                        other => {
                            return Err(ExprError::Syntax(format!(
                                "expected attribute name after '.', found {other:?}"
                            )))
                        }
                    };
                    if name.starts_with("__") {
                        return Err(ExprError::Forbidden(name));
                    }
                    expr = Expr::Attr(Box::new(expr), name);
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.parse_or()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                Token::LParen => {
                    let callee = match &expr {
                        Expr::Ident(name) => name.clone(),
                        _ => {
                            return Err(ExprError::Syntax(
                                "only builtin functions may be called".into(),
                            ))
                        }
                    };
                    self.advance();
                    let mut args = Vec::new();
                    if *self.peek() != Token::RParen {
                        loop {
                            args.push(self.parse_or()?);
                            if *self.peek() == Token::Comma {
                                self.advance();
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(Token::RParen)?;
                    expr = Expr::Call(callee, args);
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        match self.advance() {
            Token::Int(n) => Ok(Expr::Literal(Value::Number(n.into()))),
            Token::Float(f) => Ok(Expr::Literal(
                Number::from_f64(f)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::None => Ok(Expr::Literal(Value::Null)),
            Token::Ident(name) => {
                if FORBIDDEN_NAMES.contains(&name.as_str()) {
                    return Err(ExprError::Forbidden(name));
                }
                if name.starts_with("__") {
                    return Err(ExprError::Forbidden(name));
                }
                Ok(Expr::Ident(name))
            }
            Token::LParen => {
                let expr = self.parse_or()?;
                // tuple literal: (a, b) becomes a list
                if *self.peek() == Token::Comma {
                    let mut items = vec![expr];
                    while *self.peek() == Token::Comma {
                        self.advance();
                        if *self.peek() == Token::RParen {
                            break;
                        }
                        items.push(self.parse_or()?);
                    }
                    self.expect(Token::RParen)?;
                    return Ok(Expr::List(items));
                }
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Token::LBracket => self.parse_list_or_comprehension(),
            other => Err(ExprError::Syntax(format!("unexpected {other:?}"))),
        }
    }

    fn parse_list_or_comprehension(&mut self) -> Result<Expr, ExprError> {
        if *self.peek() == Token::RBracket {
            self.advance();
            return Ok(Expr::List(Vec::new()));
        }

        let first = self.parse_or()?;

        if *self.peek() == Token::For {
            // [element for var in iterable (if condition)?]
            self.advance();
            let var = match self.advance() {
                Token::Ident(name) => name,
                other => {
                    return Err(ExprError::Syntax(format!(
                        "expected loop variable, found {other:?}"
                    )))
                }
            };
            self.expect(Token::In)?;
            let iterable = self.parse_or()?;
            let condition = if *self.peek() == Token::If {
                self.advance();
                Some(Box::new(self.parse_or()?))
            } else {
                None
            };
            self.expect(Token::RBracket)?;
            return Ok(Expr::Comprehension {
                element: Box::new(first),
                var,
                iterable: Box::new(iterable),
                condition,
            });
        }

        let mut items = vec![first];
        while *self.peek() == Token::Comma {
            self.advance();
            if *self.peek() == Token::RBracket {
                break;
            }
            items.push(self.parse_or()?);
        }
        self.expect(Token::RBracket)?;
        Ok(Expr::List(items))
    }
}

// ---------------------------------------------------------------------------
// Identifier screening
// ---------------------------------------------------------------------------

/// Reject any free identifier that is neither a whitelisted builtin nor a
/// context key, without evaluating anything.
fn screen_identifiers(expr: &Expr, context: &Map<String, Value>) -> Result<(), ExprError> {
    fn walk(
        expr: &Expr,
        context: &Map<String, Value>,
        bound: &mut HashSet<String>,
    ) -> Result<(), ExprError> {
        match expr {
            Expr::Literal(_) => Ok(()),
            Expr::Ident(name) => {
                if bound.contains(name)
                    || context.contains_key(name)
                    || BUILTIN_NAMES.contains(&name.as_str())
                {
                    Ok(())
                } else {
                    Err(ExprError::NameNotAllowed(name.clone()))
                }
            }
            Expr::Attr(base, _) => walk(base, context, bound),
            Expr::Index(base, index) => {
                walk(base, context, bound)?;
                walk(index, context, bound)
            }
            Expr::Not(inner) | Expr::Neg(inner) => walk(inner, context, bound),
            Expr::Binary(_, left, right) => {
                walk(left, context, bound)?;
                walk(right, context, bound)
            }
            Expr::Call(name, args) => {
                if !BUILTIN_NAMES.contains(&name.as_str()) {
                    return Err(ExprError::NameNotAllowed(name.clone()));
                }
                for arg in args {
                    walk(arg, context, bound)?;
                }
                Ok(())
            }
            Expr::List(items) => {
                for item in items {
                    walk(item, context, bound)?;
                }
                Ok(())
            }
            Expr::Comprehension {
                element,
                var,
                iterable,
                condition,
            } => {
                walk(iterable, context, bound)?;
                let added = bound.insert(var.clone());
                walk(element, context, bound)?;
                if let Some(cond) = condition {
                    walk(cond, context, bound)?;
                }
                if added {
                    bound.remove(var);
                }
                Ok(())
            }
        }
    }

    walk(expr, context, &mut HashSet::new())
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

struct Scope<'a> {
    context: &'a Map<String, Value>,
    locals: Vec<(String, Value)>,
}

impl<'a> Scope<'a> {
    fn root(context: &'a Map<String, Value>) -> Self {
        Self {
            context,
            locals: Vec::new(),
        }
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        for (key, value) in self.locals.iter().rev() {
            if key == name {
                return Some(value.clone());
            }
        }
        self.context.get(name).cloned()
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "none",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn number(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        Value::Number((f as i64).into())
    } else {
        Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn compare(op: BinOp, a: &Value, b: &Value) -> Result<bool, ExprError> {
    let ordering = match (a, b) {
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => {
            let (x, y) = match (as_f64(a), as_f64(b)) {
                (Some(x), Some(y)) => (x, y),
                _ => {
                    return Err(ExprError::Eval(format!(
                        "cannot compare {} with {}",
                        type_name(a),
                        type_name(b)
                    )))
                }
            };
            x.partial_cmp(&y)
                .ok_or_else(|| ExprError::Eval("incomparable values".into()))?
        }
    };
    Ok(match op {
        BinOp::Lt => ordering.is_lt(),
        BinOp::Le => ordering.is_le(),
        BinOp::Gt => ordering.is_gt(),
        BinOp::Ge => ordering.is_ge(),
        _ => unreachable!(),
    })
}

fn contains(needle: &Value, haystack: &Value) -> Result<bool, ExprError> {
    match haystack {
        Value::String(s) => match needle {
            Value::String(sub) => Ok(s.contains(sub.as_str())),
            _ => Err(ExprError::Eval("'in <str>' requires a string".into())),
        },
        Value::Array(items) => Ok(items.iter().any(|item| values_equal(item, needle))),
        Value::Object(map) => match needle {
            Value::String(key) => Ok(map.contains_key(key)),
            _ => Err(ExprError::Eval("'in <dict>' requires a string key".into())),
        },
        other => Err(ExprError::Eval(format!(
            "'in' not supported over {}",
            type_name(other)
        ))),
    }
}

fn eval_expr(expr: &Expr, scope: &Scope<'_>) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Ident(name) => scope
            .lookup(name)
            .ok_or_else(|| ExprError::NameNotAllowed(name.clone())),
        Expr::Attr(base, name) => {
            let base = eval_expr(base, scope)?;
            match &base {
                Value::Object(map) => map.get(name).cloned().ok_or_else(|| {
                    ExprError::Eval(format!("no attribute '{name}' on object"))
                }),
                other => Err(ExprError::Eval(format!(
                    "{} has no attribute '{name}'",
                    type_name(other)
                ))),
            }
        }
        Expr::Index(base, index) => {
            let base = eval_expr(base, scope)?;
            let index = eval_expr(index, scope)?;
            match (&base, &index) {
                (Value::Array(items), Value::Number(n)) => {
                    let raw = n
                        .as_i64()
                        .ok_or_else(|| ExprError::Eval("list index must be an integer".into()))?;
                    let idx = if raw < 0 { items.len() as i64 + raw } else { raw };
                    items
                        .get(idx.max(0) as usize)
                        .cloned()
                        .filter(|_| idx >= 0)
                        .ok_or_else(|| ExprError::Eval(format!("list index {raw} out of range")))
                }
                (Value::Object(map), Value::String(key)) => map
                    .get(key)
                    .cloned()
                    .ok_or_else(|| ExprError::Eval(format!("key '{key}' not found"))),
                _ => Err(ExprError::Eval(format!(
                    "cannot index {} with {}",
                    type_name(&base),
                    type_name(&index)
                ))),
            }
        }
        Expr::Not(inner) => Ok(Value::Bool(!truthy(&eval_expr(inner, scope)?))),
        Expr::Neg(inner) => {
            let value = eval_expr(inner, scope)?;
            let f = as_f64(&value)
                .ok_or_else(|| ExprError::Eval("unary '-' requires a number".into()))?;
            Ok(number(-f))
        }
        Expr::Binary(op, left, right) => eval_binary(*op, left, right, scope),
        Expr::Call(name, args) => eval_call(name, args, scope),
        Expr::List(items) => items
            .iter()
            .map(|item| eval_expr(item, scope))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Comprehension {
            element,
            var,
            iterable,
            condition,
        } => {
            let iterable = eval_expr(iterable, scope)?;
            let items = iter_values(&iterable)?;
            let mut out = Vec::new();
            let mut inner = Scope {
                context: scope.context,
                locals: scope.locals.clone(),
            };
            for item in items {
                inner.locals.push((var.clone(), item));
                let keep = match condition {
                    Some(cond) => truthy(&eval_expr(cond, &inner)?),
                    None => true,
                };
                if keep {
                    out.push(eval_expr(element, &inner)?);
                }
                inner.locals.pop();
            }
            Ok(Value::Array(out))
        }
    }
}

fn eval_binary(op: BinOp, left: &Expr, right: &Expr, scope: &Scope<'_>) -> Result<Value, ExprError> {
    // short-circuit boolean operators keep Python semantics: return the
    // deciding operand, not a coerced bool
    match op {
        BinOp::And => {
            let lhs = eval_expr(left, scope)?;
            if !truthy(&lhs) {
                return Ok(lhs);
            }
            return eval_expr(right, scope);
        }
        BinOp::Or => {
            let lhs = eval_expr(left, scope)?;
            if truthy(&lhs) {
                return Ok(lhs);
            }
            return eval_expr(right, scope);
        }
        _ => {}
    }

    let lhs = eval_expr(left, scope)?;
    let rhs = eval_expr(right, scope)?;

    match op {
        BinOp::Eq => Ok(Value::Bool(values_equal(&lhs, &rhs))),
        BinOp::Ne => Ok(Value::Bool(!values_equal(&lhs, &rhs))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            compare(op, &lhs, &rhs).map(Value::Bool)
        }
        BinOp::In => contains(&lhs, &rhs).map(Value::Bool),
        BinOp::NotIn => contains(&lhs, &rhs).map(|b| Value::Bool(!b)),
        BinOp::Add => match (&lhs, &rhs) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            (Value::Array(a), Value::Array(b)) => {
                let mut out = a.clone();
                out.extend(b.clone());
                Ok(Value::Array(out))
            }
            _ => numeric_op(&lhs, &rhs, "+", |a, b| a + b),
        },
        BinOp::Sub => numeric_op(&lhs, &rhs, "-", |a, b| a - b),
        BinOp::Mul => numeric_op(&lhs, &rhs, "*", |a, b| a * b),
        BinOp::Div => {
            if as_f64(&rhs) == Some(0.0) {
                return Err(ExprError::Eval("division by zero".into()));
            }
            numeric_op(&lhs, &rhs, "/", |a, b| a / b)
        }
        BinOp::Mod => {
            if as_f64(&rhs) == Some(0.0) {
                return Err(ExprError::Eval("modulo by zero".into()));
            }
            numeric_op(&lhs, &rhs, "%", |a, b| a.rem_euclid(b))
        }
        BinOp::And | BinOp::Or => unreachable!(),
    }
}

fn numeric_op(
    lhs: &Value,
    rhs: &Value,
    symbol: &str,
    f: impl Fn(f64, f64) -> f64,
) -> Result<Value, ExprError> {
    match (as_f64(lhs), as_f64(rhs)) {
        (Some(a), Some(b)) if lhs.is_number() && rhs.is_number() => Ok(number(f(a, b))),
        _ => Err(ExprError::Eval(format!(
            "'{symbol}' not supported between {} and {}",
            type_name(lhs),
            type_name(rhs)
        ))),
    }
}

fn iter_values(value: &Value) -> Result<Vec<Value>, ExprError> {
    match value {
        Value::Array(items) => Ok(items.clone()),
        Value::String(s) => Ok(s.chars().map(|c| Value::String(c.to_string())).collect()),
        Value::Object(map) => Ok(map.keys().map(|k| Value::String(k.clone())).collect()),
        other => Err(ExprError::Eval(format!(
            "{} is not iterable",
            type_name(other)
        ))),
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Apply a builtin by name to a single value, for `map`/`filter`.
fn apply_builtin(name: &str, value: Value) -> Result<Value, ExprError> {
    match name {
        "str" => Ok(Value::String(stringify(&value))),
        "int" => builtin_int(&value),
        "float" => builtin_float(&value),
        "bool" => Ok(Value::Bool(truthy(&value))),
        "len" => builtin_len(&value),
        "abs" => {
            let f = as_f64(&value)
                .ok_or_else(|| ExprError::Eval("abs() requires a number".into()))?;
            Ok(number(f.abs()))
        }
        "round" => {
            let f = as_f64(&value)
                .ok_or_else(|| ExprError::Eval("round() requires a number".into()))?;
            Ok(number(f.round()))
        }
        other => Err(ExprError::Eval(format!(
            "'{other}' cannot be used as a mapping function"
        ))),
    }
}

fn builtin_len(value: &Value) -> Result<Value, ExprError> {
    let len = match value {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        other => {
            return Err(ExprError::Eval(format!(
                "object of type {} has no len()",
                type_name(other)
            )))
        }
    };
    Ok(Value::Number(len.into()))
}

fn builtin_int(value: &Value) -> Result<Value, ExprError> {
    match value {
        Value::Number(n) => Ok(Value::Number(
            (n.as_f64().unwrap_or(0.0).trunc() as i64).into(),
        )),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map(|n| Value::Number(n.into()))
            .map_err(|_| ExprError::Eval(format!("invalid literal for int(): '{s}'"))),
        Value::Bool(b) => Ok(Value::Number((*b as i64).into())),
        other => Err(ExprError::Eval(format!(
            "cannot convert {} to int",
            type_name(other)
        ))),
    }
}

fn builtin_float(value: &Value) -> Result<Value, ExprError> {
    match value {
        Value::Number(n) => Ok(Number::from_f64(n.as_f64().unwrap_or(0.0))
            .map(Value::Number)
            .unwrap_or(Value::Null)),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(|f| Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null))
            .map_err(|_| ExprError::Eval(format!("invalid literal for float(): '{s}'"))),
        Value::Bool(b) => Ok(number(*b as i64 as f64)),
        other => Err(ExprError::Eval(format!(
            "cannot convert {} to float",
            type_name(other)
        ))),
    }
}

fn sort_values(items: &mut [Value]) -> Result<(), ExprError> {
    let mut failed = false;
    items.sort_by(|a, b| match (a, b) {
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => match (as_f64(a), as_f64(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
            _ => {
                failed = true;
                std::cmp::Ordering::Equal
            }
        },
    });
    if failed {
        Err(ExprError::Eval(
            "sorted() requires all-numeric or all-string items".into(),
        ))
    } else {
        Ok(())
    }
}

fn eval_call(name: &str, args: &[Expr], scope: &Scope<'_>) -> Result<Value, ExprError> {
    // map/filter take a builtin name as their functional argument; everything
    // else evaluates its arguments eagerly
    if name == "map" || name == "filter" {
        if args.len() != 2 {
            return Err(ExprError::Eval(format!("{name}() takes exactly 2 arguments")));
        }
        let func = match &args[0] {
            Expr::Ident(func) if BUILTIN_NAMES.contains(&func.as_str()) => func.clone(),
            Expr::Literal(Value::Null) if name == "filter" => String::new(),
            _ => {
                return Err(ExprError::Eval(format!(
                    "{name}() requires a builtin function name as its first argument"
                )))
            }
        };
        let items = iter_values(&eval_expr(&args[1], scope)?)?;
        let mut out = Vec::new();
        for item in items {
            if name == "map" {
                out.push(apply_builtin(&func, item)?);
            } else {
                let keep = if func.is_empty() {
                    truthy(&item)
                } else {
                    truthy(&apply_builtin(&func, item.clone())?)
                };
                if keep {
                    out.push(item);
                }
            }
        }
        return Ok(Value::Array(out));
    }

    let values: Vec<Value> = args
        .iter()
        .map(|arg| eval_expr(arg, scope))
        .collect::<Result<_, _>>()?;

    let arity = |expected: usize| -> Result<(), ExprError> {
        if values.len() == expected {
            Ok(())
        } else {
            Err(ExprError::Eval(format!(
                "{name}() takes {expected} argument(s), got {}",
                values.len()
            )))
        }
    };

    match name {
        "len" => {
            arity(1)?;
            builtin_len(&values[0])
        }
        "str" => {
            arity(1)?;
            Ok(Value::String(stringify(&values[0])))
        }
        "int" => {
            arity(1)?;
            builtin_int(&values[0])
        }
        "float" => {
            arity(1)?;
            builtin_float(&values[0])
        }
        "bool" => {
            arity(1)?;
            Ok(Value::Bool(truthy(&values[0])))
        }
        "list" | "tuple" => {
            arity(1)?;
            iter_values(&values[0]).map(Value::Array)
        }
        "set" => {
            arity(1)?;
            let mut seen = Vec::new();
            for item in iter_values(&values[0])? {
                if !seen.iter().any(|s| values_equal(s, &item)) {
                    seen.push(item);
                }
            }
            Ok(Value::Array(seen))
        }
        "dict" => {
            arity(1)?;
            match &values[0] {
                Value::Object(_) => Ok(values[0].clone()),
                other => Err(ExprError::Eval(format!(
                    "cannot convert {} to dict",
                    type_name(other)
                ))),
            }
        }
        "range" => {
            let (start, stop, step) = match values.len() {
                1 => (0, int_arg(name, &values[0])?, 1),
                2 => (int_arg(name, &values[0])?, int_arg(name, &values[1])?, 1),
                3 => (
                    int_arg(name, &values[0])?,
                    int_arg(name, &values[1])?,
                    int_arg(name, &values[2])?,
                ),
                n => {
                    return Err(ExprError::Eval(format!(
                        "range() takes 1 to 3 arguments, got {n}"
                    )))
                }
            };
            if step == 0 {
                return Err(ExprError::Eval("range() step must not be zero".into()));
            }
            let mut out = Vec::new();
            let mut current = start;
            while (step > 0 && current < stop) || (step < 0 && current > stop) {
                out.push(Value::Number(current.into()));
                current += step;
            }
            Ok(Value::Array(out))
        }
        "enumerate" => {
            let start = match values.len() {
                1 => 0,
                2 => int_arg(name, &values[1])?,
                n => {
                    return Err(ExprError::Eval(format!(
                        "enumerate() takes 1 or 2 arguments, got {n}"
                    )))
                }
            };
            let items = iter_values(&values[0])?;
            Ok(Value::Array(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| {
                        Value::Array(vec![Value::Number((start + i as i64).into()), item])
                    })
                    .collect(),
            ))
        }
        "zip" => {
            let columns: Vec<Vec<Value>> = values
                .iter()
                .map(iter_values)
                .collect::<Result<_, _>>()?;
            let shortest = columns.iter().map(Vec::len).min().unwrap_or(0);
            Ok(Value::Array(
                (0..shortest)
                    .map(|i| Value::Array(columns.iter().map(|col| col[i].clone()).collect()))
                    .collect(),
            ))
        }
        "sorted" => {
            arity(1)?;
            let mut items = iter_values(&values[0])?;
            sort_values(&mut items)?;
            Ok(Value::Array(items))
        }
        "reversed" => {
            arity(1)?;
            let mut items = iter_values(&values[0])?;
            items.reverse();
            Ok(Value::Array(items))
        }
        "min" | "max" => {
            let items = if values.len() == 1 {
                iter_values(&values[0])?
            } else {
                values.clone()
            };
            if items.is_empty() {
                return Err(ExprError::Eval(format!("{name}() of empty sequence")));
            }
            let mut sorted = items;
            sort_values(&mut sorted)?;
            Ok(if name == "min" {
                sorted.first().cloned().unwrap()
            } else {
                sorted.last().cloned().unwrap()
            })
        }
        "sum" => {
            arity(1)?;
            let mut total = 0.0;
            for item in iter_values(&values[0])? {
                total += as_f64(&item)
                    .filter(|_| item.is_number())
                    .ok_or_else(|| ExprError::Eval("sum() requires numbers".into()))?;
            }
            Ok(number(total))
        }
        "any" => {
            arity(1)?;
            Ok(Value::Bool(iter_values(&values[0])?.iter().any(truthy)))
        }
        "all" => {
            arity(1)?;
            Ok(Value::Bool(iter_values(&values[0])?.iter().all(truthy)))
        }
        "abs" => {
            arity(1)?;
            apply_builtin("abs", values[0].clone())
        }
        "round" => match values.len() {
            1 => apply_builtin("round", values[0].clone()),
            2 => {
                let f = as_f64(&values[0])
                    .ok_or_else(|| ExprError::Eval("round() requires a number".into()))?;
                let digits = int_arg(name, &values[1])?;
                let factor = 10f64.powi(digits as i32);
                Ok(number((f * factor).round() / factor))
            }
            n => Err(ExprError::Eval(format!(
                "round() takes 1 or 2 arguments, got {n}"
            ))),
        },
        other => Err(ExprError::NameNotAllowed(other.to_string())),
    }
}

fn int_arg(func: &str, value: &Value) -> Result<i64, ExprError> {
    value
        .as_i64()
        .ok_or_else(|| ExprError::Eval(format!("{func}() requires an integer argument")))
}
