use anyhow::{anyhow, bail, Result};
use indexmap::IndexMap;

use crate::types::Value;

/// Evaluates expression text against a variable scope.
///
/// Expression steps and context-derived inputs are evaluated through this
/// contract; embedders may plug in a richer evaluator via the execution
/// context. Evaluation must not mutate the scope.
pub trait ExpressionEvaluator {
    fn eval(&self, expression: &str, scope: &IndexMap<String, Value>) -> Result<Value>;
}

/// Built-in restricted evaluator: literals, scope identifiers with dotted
/// traversal into objects, unary `-`/`!`/`not`, arithmetic, comparisons, and
/// `and`/`or`. No calls, no indexing, no assignment.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultEvaluator;

impl ExpressionEvaluator for DefaultEvaluator {
    fn eval(&self, expression: &str, scope: &IndexMap<String, Value>) -> Result<Value> {
        let tokens = tokenize(expression)?;
        let mut parser = Parser {
            tokens,
            pos: 0,
            scope,
        };
        let value = parser.parse_or()?;
        match parser.peek() {
            None => Ok(value),
            Some(token) => bail!("unexpected trailing token {token:?} in expression"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    Dot,
    LParen,
    RParen,
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
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
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    bail!("assignment is not allowed in expressions");
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
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
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    bail!("unexpected character '&' in expression");
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    bail!("unexpected character '|' in expression");
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut literal = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            literal.push(ch);
                            i += 1;
                        }
                        None => bail!("unterminated string literal in expression"),
                    }
                }
                tokens.push(Token::Str(literal));
            }
            _ if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let mut is_float = false;
                if i < chars.len()
                    && chars[i] == '.'
                    && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit())
                {
                    is_float = true;
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                if is_float {
                    tokens.push(Token::Float(text.parse()?));
                } else {
                    tokens.push(Token::Int(text.parse()?));
                }
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    "not" => tokens.push(Token::Not),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            other => bail!("unexpected character '{other}' in expression"),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    scope: &'a IndexMap<String, Value>,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn parse_or(&mut self) -> Result<Value> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Value::Bool(truthy(&left) || truthy(&right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Value> {
        let mut left = self.parse_comparison()?;
        while self.eat(&Token::And) {
            let right = self.parse_comparison()?;
            left = Value::Bool(truthy(&left) && truthy(&right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Value> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            Some(
                token @ (Token::EqEq | Token::NotEq | Token::Lt | Token::Le | Token::Gt | Token::Ge),
            ) => token.clone(),
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.parse_additive()?;

        let result = match op {
            Token::EqEq => left == right,
            Token::NotEq => left != right,
            ordering_op => {
                let ordering = left.compare(&right).ok_or_else(|| {
                    anyhow!(
                        "cannot order {} and {} values",
                        left.type_label(),
                        right.type_label()
                    )
                })?;
                match ordering_op {
                    Token::Lt => ordering.is_lt(),
                    Token::Le => ordering.is_le(),
                    Token::Gt => ordering.is_gt(),
                    Token::Ge => ordering.is_ge(),
                    _ => unreachable!(),
                }
            }
        };
        Ok(Value::Bool(result))
    }

    fn parse_additive(&mut self) -> Result<Value> {
        let mut left = self.parse_multiplicative()?;
        loop {
            if self.eat(&Token::Plus) {
                let right = self.parse_multiplicative()?;
                left = add(&left, &right)?;
            } else if self.eat(&Token::Minus) {
                let right = self.parse_multiplicative()?;
                left = numeric_op(&left, &right, "-")?;
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Value> {
        let mut left = self.parse_unary()?;
        loop {
            if self.eat(&Token::Star) {
                let right = self.parse_unary()?;
                left = numeric_op(&left, &right, "*")?;
            } else if self.eat(&Token::Slash) {
                let right = self.parse_unary()?;
                left = numeric_op(&left, &right, "/")?;
            } else if self.eat(&Token::Percent) {
                let right = self.parse_unary()?;
                left = numeric_op(&left, &right, "%")?;
            } else {
                return Ok(left);
            }
        }
    }

    fn parse_unary(&mut self) -> Result<Value> {
        if self.eat(&Token::Minus) {
            let value = self.parse_unary()?;
            return match value {
                Value::Int(v) => Ok(Value::Int(-v)),
                Value::Float(v) => Ok(Value::Float(-v)),
                other => bail!("cannot negate a {} value", other.type_label()),
            };
        }
        if self.eat(&Token::Not) {
            let value = self.parse_unary()?;
            return Ok(Value::Bool(!truthy(&value)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Value> {
        match self.advance() {
            Some(Token::Int(v)) => Ok(Value::Int(v)),
            Some(Token::Float(v)) => Ok(Value::Float(v)),
            Some(Token::Str(v)) => Ok(Value::Str(v)),
            Some(Token::LParen) => {
                let value = self.parse_or()?;
                if !self.eat(&Token::RParen) {
                    bail!("missing closing parenthesis in expression");
                }
                Ok(value)
            }
            Some(Token::Ident(name)) => {
                let mut value = match name.as_str() {
                    "null" | "None" => Value::Null,
                    "true" | "True" => Value::Bool(true),
                    "false" | "False" => Value::Bool(false),
                    _ => self
                        .scope
                        .get(&name)
                        .cloned()
                        .ok_or_else(|| anyhow!("name '{name}' is not defined"))?,
                };
                while self.eat(&Token::Dot) {
                    let field = match self.advance() {
                        Some(Token::Ident(field)) => field,
                        _ => bail!("expected attribute name after '.'"),
                    };
                    value = match value {
                        Value::Object(entries) => entries
                            .get(&field)
                            .cloned()
                            .ok_or_else(|| anyhow!("object has no attribute '{field}'"))?,
                        other => bail!(
                            "cannot access attribute '{field}' on a {} value",
                            other.type_label()
                        ),
                    };
                }
                Ok(value)
            }
            Some(token) => bail!("unexpected token {token:?} in expression"),
            None => bail!("expression is empty"),
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Undefined | Value::Null => false,
        Value::Bool(v) => *v,
        Value::Int(v) => *v != 0,
        Value::Float(v) => *v != 0.0,
        Value::Str(v) => !v.is_empty(),
        Value::List(v) => !v.is_empty(),
        Value::Object(v) => !v.is_empty(),
        Value::Opaque(_) => true,
    }
}

fn add(left: &Value, right: &Value) -> Result<Value> {
    if let (Value::Str(a), Value::Str(b)) = (left, right) {
        return Ok(Value::Str(format!("{a}{b}")));
    }
    numeric_op(left, right, "+")
}

fn numeric_op(left: &Value, right: &Value, op: &str) -> Result<Value> {
    if let (Value::Int(a), Value::Int(b)) = (left, right) {
        // Integer arithmetic stays integral except true division.
        return match op {
            "+" => Ok(Value::Int(a + b)),
            "-" => Ok(Value::Int(a - b)),
            "*" => Ok(Value::Int(a * b)),
            "/" => {
                if *b == 0 {
                    bail!("division by zero");
                }
                Ok(Value::Float(*a as f64 / *b as f64))
            }
            "%" => {
                if *b == 0 {
                    bail!("division by zero");
                }
                Ok(Value::Int(a % b))
            }
            _ => unreachable!(),
        };
    }

    let a = left
        .as_f64()
        .ok_or_else(|| anyhow!("cannot apply '{op}' to a {} value", left.type_label()))?;
    let b = right
        .as_f64()
        .ok_or_else(|| anyhow!("cannot apply '{op}' to a {} value", right.type_label()))?;
    match op {
        "+" => Ok(Value::Float(a + b)),
        "-" => Ok(Value::Float(a - b)),
        "*" => Ok(Value::Float(a * b)),
        "/" => {
            if b == 0.0 {
                bail!("division by zero");
            }
            Ok(Value::Float(a / b))
        }
        "%" => {
            if b == 0.0 {
                bail!("division by zero");
            }
            Ok(Value::Float(a % b))
        }
        _ => unreachable!(),
    }
}
