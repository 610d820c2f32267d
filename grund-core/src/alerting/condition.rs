//! Alert condition language.
//!
//! Conditions are small expressions over the metric and health stores,
//! for example:
//!
//! ```text
//! rate('trade_errors_total', 5) / rate('trade_api_requests_total', 5) > 0.05
//! not health('database')
//! metric('circuit_breaker_state', {'circuit': 'relational'}) == 2
//! ```
//!
//! The grammar admits exactly `metric(...)`, `rate(...)`, `avg(...)`,
//! `health(...)`, numeric and boolean literals, arithmetic, comparisons,
//! `and`/`or`/`not`, and parentheses. Any other identifier is rejected
//! at parse time, so a condition can never reach beyond the two stores.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::errors::ServiceError;
use crate::health::HealthStatus;
use crate::metrics::MetricsRegistry;

/// Parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Bool(bool),
    Metric {
        name: String,
        tags: Vec<(String, String)>,
    },
    Rate {
        name: String,
        window_minutes: f64,
        tags: Vec<(String, String)>,
    },
    Avg {
        name: String,
        window_minutes: f64,
        tags: Vec<(String, String)>,
    },
    Health {
        component: Option<String>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// Evaluation result of a sub-expression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Number(f64),
    Bool(bool),
}

impl Value {
    fn truthy(self) -> bool {
        match self {
            Value::Number(n) => n != 0.0,
            Value::Bool(b) => b,
        }
    }

    fn as_number(self) -> Result<f64, ServiceError> {
        match self {
            Value::Number(n) => Ok(n),
            Value::Bool(_) => Err(ServiceError::validation(
                "expected a number, found a boolean",
            )),
        }
    }

    fn as_bool(self) -> Result<bool, ServiceError> {
        match self {
            Value::Bool(b) => Ok(b),
            Value::Number(_) => Err(ServiceError::validation(
                "expected a boolean, found a number",
            )),
        }
    }
}

/// Read-only state a condition evaluates against.
pub struct EvalContext<'a> {
    pub metrics: &'a MetricsRegistry,
    pub health: HashMap<String, HealthStatus>,
    pub overall_health: HealthStatus,
    pub now: f64,
}

impl Expr {
    /// Parse a condition string into a typed expression.
    pub fn parse(input: &str) -> Result<Self, ServiceError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(ServiceError::validation(format!(
                "unexpected trailing input at token {:?}",
                parser.tokens[parser.pos]
            )));
        }
        Ok(expr)
    }

    /// Evaluate to a boolean, applying numeric truthiness at the top
    /// level.
    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> Result<bool, ServiceError> {
        Ok(self.eval(ctx)?.truthy())
    }

    fn eval(&self, ctx: &EvalContext<'_>) -> Result<Value, ServiceError> {
        match self {
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Metric { name, tags } => {
                let tags = borrow_tags(tags);
                Ok(Value::Number(ctx.metrics.latest(name, &tags).unwrap_or(0.0)))
            }
            Expr::Rate {
                name,
                window_minutes,
                tags,
            } => {
                let tags = borrow_tags(tags);
                let window = Duration::from_secs_f64(window_minutes * 60.0);
                Ok(Value::Number(ctx.metrics.rate_at(name, window, &tags, ctx.now)))
            }
            Expr::Avg {
                name,
                window_minutes,
                tags,
            } => {
                let tags = borrow_tags(tags);
                let window = Duration::from_secs_f64(window_minutes * 60.0);
                Ok(Value::Number(ctx.metrics.avg_at(name, window, &tags, ctx.now)))
            }
            Expr::Health { component } => {
                let healthy = match component {
                    Some(name) => ctx.health.get(name) == Some(&HealthStatus::Healthy),
                    None => ctx.overall_health == HealthStatus::Healthy,
                };
                Ok(Value::Bool(healthy))
            }
            Expr::Unary { op, operand } => {
                let value = operand.eval(ctx)?;
                match op {
                    UnaryOp::Neg => Ok(Value::Number(-value.as_number()?)),
                    UnaryOp::Not => Ok(Value::Bool(!value.as_bool()?)),
                }
            }
            Expr::Binary { op, left, right } => {
                // Short-circuit before evaluating the right side.
                match op {
                    BinaryOp::And => {
                        let l = left.eval(ctx)?.as_bool()?;
                        if !l {
                            return Ok(Value::Bool(false));
                        }
                        return Ok(Value::Bool(right.eval(ctx)?.as_bool()?));
                    }
                    BinaryOp::Or => {
                        let l = left.eval(ctx)?.as_bool()?;
                        if l {
                            return Ok(Value::Bool(true));
                        }
                        return Ok(Value::Bool(right.eval(ctx)?.as_bool()?));
                    }
                    _ => {}
                }

                let l = left.eval(ctx)?;
                let r = right.eval(ctx)?;
                match op {
                    BinaryOp::Add => Ok(Value::Number(l.as_number()? + r.as_number()?)),
                    BinaryOp::Sub => Ok(Value::Number(l.as_number()? - r.as_number()?)),
                    BinaryOp::Mul => Ok(Value::Number(l.as_number()? * r.as_number()?)),
                    BinaryOp::Div => {
                        let divisor = r.as_number()?;
                        if divisor == 0.0 {
                            return Err(ServiceError::validation("division by zero"));
                        }
                        Ok(Value::Number(l.as_number()? / divisor))
                    }
                    BinaryOp::Eq => Ok(Value::Bool(values_equal(l, r)?)),
                    BinaryOp::Ne => Ok(Value::Bool(!values_equal(l, r)?)),
                    BinaryOp::Lt => Ok(Value::Bool(l.as_number()? < r.as_number()?)),
                    BinaryOp::Le => Ok(Value::Bool(l.as_number()? <= r.as_number()?)),
                    BinaryOp::Gt => Ok(Value::Bool(l.as_number()? > r.as_number()?)),
                    BinaryOp::Ge => Ok(Value::Bool(l.as_number()? >= r.as_number()?)),
                    BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
                }
            }
        }
    }
}

fn values_equal(l: Value, r: Value) -> Result<bool, ServiceError> {
    match (l, r) {
        (Value::Number(a), Value::Number(b)) => Ok(a == b),
        (Value::Bool(a), Value::Bool(b)) => Ok(a == b),
        _ => Err(ServiceError::validation(
            "cannot compare a number with a boolean",
        )),
    }
}

fn borrow_tags(tags: &[(String, String)]) -> Vec<(&str, &str)> {
    tags.iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Plus,
    Minus,
    Star,
    Slash,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    Ne,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "{}", s),
            Token::Number(n) => write!(f, "{}", n),
            Token::Str(s) => write!(f, "'{}'", s),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::Comma => write!(f, ","),
            Token::Colon => write!(f, ":"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Lt => write!(f, "<"),
            Token::Le => write!(f, "<="),
            Token::Gt => write!(f, ">"),
            Token::Ge => write!(f, ">="),
            Token::EqEq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ServiceError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
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
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(ServiceError::validation(
                        "single '=' is not valid, use '==' for comparison",
                    ));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    return Err(ServiceError::validation(
                        "single '!' is not valid, use 'not' for negation",
                    ));
                }
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != quote {
                    end += 1;
                }
                if end == chars.len() {
                    return Err(ServiceError::validation("unterminated string literal"));
                }
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let value = literal.parse::<f64>().map_err(|_| {
                    ServiceError::validation(format!("invalid number literal '{}'", literal))
                })?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(ServiceError::validation(format!(
                    "unexpected character '{}'",
                    other
                )));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
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

    fn expect(&mut self, expected: Token) -> Result<(), ServiceError> {
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(ServiceError::validation(format!(
                "expected '{}', found '{}'",
                expected, token
            ))),
            None => Err(ServiceError::validation(format!(
                "expected '{}', found end of input",
                expected
            ))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ServiceError> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Token::Ident(id)) if id == "or") {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: BinaryOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ServiceError> {
        let mut left = self.parse_not()?;
        while matches!(self.peek(), Some(Token::Ident(id)) if id == "and") {
            self.advance();
            let right = self.parse_not()?;
            left = Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ServiceError> {
        if matches!(self.peek(), Some(Token::Ident(id)) if id == "not") {
            self.advance();
            let operand = self.parse_not()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ServiceError> {
        let left = self.parse_additive()?;
        let op = match self.peek() {
            Some(Token::EqEq) => Some(BinaryOp::Eq),
            Some(Token::Ne) => Some(BinaryOp::Ne),
            Some(Token::Lt) => Some(BinaryOp::Lt),
            Some(Token::Le) => Some(BinaryOp::Le),
            Some(Token::Gt) => Some(BinaryOp::Gt),
            Some(Token::Ge) => Some(BinaryOp::Ge),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let right = self.parse_additive()?;
            return Ok(Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            });
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ServiceError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ServiceError> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ServiceError> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ServiceError> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(id)) => match id.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "metric" => self.parse_metric_call(),
                "rate" => self.parse_windowed_call(true),
                "avg" => self.parse_windowed_call(false),
                "health" => self.parse_health_call(),
                other => Err(ServiceError::validation(format!(
                    "unknown identifier '{}', conditions may only use metric, rate, avg, health",
                    other
                ))),
            },
            Some(token) => Err(ServiceError::validation(format!(
                "unexpected token '{}'",
                token
            ))),
            None => Err(ServiceError::validation("unexpected end of input")),
        }
    }

    fn parse_metric_call(&mut self) -> Result<Expr, ServiceError> {
        self.expect(Token::LParen)?;
        let name = self.parse_string("metric name")?;
        let tags = self.parse_optional_tags()?;
        self.expect(Token::RParen)?;
        Ok(Expr::Metric { name, tags })
    }

    fn parse_windowed_call(&mut self, is_rate: bool) -> Result<Expr, ServiceError> {
        self.expect(Token::LParen)?;
        let name = self.parse_string("metric name")?;
        self.expect(Token::Comma)?;
        let window_minutes = match self.advance() {
            Some(Token::Number(n)) if n > 0.0 => n,
            Some(token) => {
                return Err(ServiceError::validation(format!(
                    "window must be a positive number of minutes, found '{}'",
                    token
                )))
            }
            None => {
                return Err(ServiceError::validation(
                    "window must be a positive number of minutes, found end of input",
                ))
            }
        };
        let tags = self.parse_optional_tags()?;
        self.expect(Token::RParen)?;
        if is_rate {
            Ok(Expr::Rate {
                name,
                window_minutes,
                tags,
            })
        } else {
            Ok(Expr::Avg {
                name,
                window_minutes,
                tags,
            })
        }
    }

    fn parse_health_call(&mut self) -> Result<Expr, ServiceError> {
        self.expect(Token::LParen)?;
        let component = if matches!(self.peek(), Some(Token::Str(_))) {
            Some(self.parse_string("component name")?)
        } else {
            None
        };
        self.expect(Token::RParen)?;
        Ok(Expr::Health { component })
    }

    fn parse_string(&mut self, what: &str) -> Result<String, ServiceError> {
        match self.advance() {
            Some(Token::Str(s)) => Ok(s),
            Some(token) => Err(ServiceError::validation(format!(
                "expected a quoted {}, found '{}'",
                what, token
            ))),
            None => Err(ServiceError::validation(format!(
                "expected a quoted {}, found end of input",
                what
            ))),
        }
    }

    /// Optional trailing `, {'key': 'value', ...}` argument.
    fn parse_optional_tags(&mut self) -> Result<Vec<(String, String)>, ServiceError> {
        if !matches!(self.peek(), Some(Token::Comma)) {
            return Ok(Vec::new());
        }
        self.advance();
        self.expect(Token::LBrace)?;

        let mut tags = Vec::new();
        if matches!(self.peek(), Some(Token::RBrace)) {
            self.advance();
            return Ok(tags);
        }
        loop {
            let key = self.parse_string("tag key")?;
            self.expect(Token::Colon)?;
            let value = self.parse_string("tag value")?;
            tags.push((key, value));
            match self.advance() {
                Some(Token::Comma) => continue,
                Some(Token::RBrace) => break,
                Some(token) => {
                    return Err(ServiceError::validation(format!(
                        "expected ',' or '}}' in tag map, found '{}'",
                        token
                    )))
                }
                None => {
                    return Err(ServiceError::validation(
                        "expected ',' or '}' in tag map, found end of input",
                    ))
                }
            }
        }
        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn context(metrics: &MetricsRegistry) -> EvalContext<'_> {
        EvalContext {
            metrics,
            health: HashMap::new(),
            overall_health: HealthStatus::Healthy,
            now: crate::utils::time::unix_secs_f64(),
        }
    }

    #[test]
    fn test_parse_comparison() {
        let expr = Expr::parse("metric('circuit_breaker_state') == 2").unwrap();
        match expr {
            Expr::Binary { op, left, .. } => {
                assert_eq!(op, BinaryOp::Eq);
                assert!(matches!(*left, Expr::Metric { .. }));
            }
            other => panic!("unexpected expr: {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_rate_condition() {
        let expr = Expr::parse(
            "rate('trade_errors_total', 5) / rate('trade_api_requests_total', 5) > 0.05",
        )
        .unwrap();
        assert!(matches!(expr, Expr::Binary { op: BinaryOp::Gt, .. }));
    }

    #[test]
    fn test_parse_not_health() {
        let expr = Expr::parse("not health('database')").unwrap();
        match expr {
            Expr::Unary { op, operand } => {
                assert_eq!(op, UnaryOp::Not);
                assert_eq!(
                    *operand,
                    Expr::Health {
                        component: Some("database".to_string())
                    }
                );
            }
            other => panic!("unexpected expr: {:?}", other),
        }
    }

    #[test]
    fn test_parse_tags() {
        let expr = Expr::parse("metric('circuit_breaker_state', {'circuit': 'relational'}) == 1")
            .unwrap();
        match expr {
            Expr::Binary { left, .. } => match *left {
                Expr::Metric { name, tags } => {
                    assert_eq!(name, "circuit_breaker_state");
                    assert_eq!(tags, vec![("circuit".to_string(), "relational".to_string())]);
                }
                other => panic!("unexpected expr: {:?}", other),
            },
            other => panic!("unexpected expr: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_identifier_rejected() {
        let err = Expr::parse("os_system('rm -rf /') > 0").unwrap_err();
        assert!(err.message.contains("unknown identifier"));

        assert!(Expr::parse("import('os')").is_err());
        assert!(Expr::parse("x + 1").is_err());
    }

    #[test]
    fn test_malformed_input_rejected() {
        assert!(Expr::parse("metric('a'").is_err());
        assert!(Expr::parse("metric(42)").is_err());
        assert!(Expr::parse("rate('a')").is_err());
        assert!(Expr::parse("rate('a', 0)").is_err());
        assert!(Expr::parse("1 = 1").is_err());
        assert!(Expr::parse("metric('a') == 1 extra").is_err());
        assert!(Expr::parse("'dangling'").is_err());
    }

    #[test]
    fn test_eval_metric_defaults_to_zero() {
        let metrics = MetricsRegistry::new();
        let ctx = context(&metrics);
        let expr = Expr::parse("metric('never_recorded') == 0").unwrap();
        assert!(expr.evaluate(&ctx).unwrap());
    }

    #[test]
    fn test_eval_arithmetic_and_precedence() {
        let metrics = MetricsRegistry::new();
        let ctx = context(&metrics);
        assert!(Expr::parse("1 + 2 * 3 == 7").unwrap().evaluate(&ctx).unwrap());
        assert!(Expr::parse("(1 + 2) * 3 == 9").unwrap().evaluate(&ctx).unwrap());
        assert!(Expr::parse("-2 < 1").unwrap().evaluate(&ctx).unwrap());
        assert!(Expr::parse("10 / 4 >= 2.5").unwrap().evaluate(&ctx).unwrap());
    }

    #[test]
    fn test_eval_boolean_operators() {
        let metrics = MetricsRegistry::new();
        let ctx = context(&metrics);
        assert!(Expr::parse("true and not false").unwrap().evaluate(&ctx).unwrap());
        assert!(Expr::parse("false or 1 < 2").unwrap().evaluate(&ctx).unwrap());
        assert!(!Expr::parse("false and true").unwrap().evaluate(&ctx).unwrap());
    }

    #[test]
    fn test_eval_health_lookup() {
        let metrics = MetricsRegistry::new();
        let mut ctx = context(&metrics);
        ctx.health
            .insert("database".to_string(), HealthStatus::Unhealthy);

        let expr = Expr::parse("not health('database')").unwrap();
        assert!(expr.evaluate(&ctx).unwrap());

        // Missing components count as not healthy.
        let expr = Expr::parse("health('nonexistent')").unwrap();
        assert!(!expr.evaluate(&ctx).unwrap());

        let expr = Expr::parse("health()").unwrap();
        assert!(expr.evaluate(&ctx).unwrap());
    }

    #[test]
    fn test_eval_metric_with_real_values() {
        let metrics = Arc::new(MetricsRegistry::new());
        metrics
            .gauge("circuit_breaker_state", &[("circuit", "relational")])
            .set(2.0);

        let ctx = context(&metrics);
        let expr = Expr::parse("metric('circuit_breaker_state') == 2").unwrap();
        assert!(expr.evaluate(&ctx).unwrap());

        let expr =
            Expr::parse("metric('circuit_breaker_state', {'circuit': 'other'}) == 2").unwrap();
        assert!(!expr.evaluate(&ctx).unwrap());
    }

    #[test]
    fn test_division_by_zero_errors() {
        let metrics = MetricsRegistry::new();
        let ctx = context(&metrics);
        let expr = Expr::parse(
            "rate('trade_errors_total', 5) / rate('trade_api_requests_total', 5) > 0.05",
        )
        .unwrap();
        // No traffic recorded, both rates are zero.
        assert!(expr.evaluate(&ctx).is_err());
    }

    #[test]
    fn test_type_mismatch_errors() {
        let metrics = MetricsRegistry::new();
        let ctx = context(&metrics);
        assert!(Expr::parse("health() + 1").unwrap().evaluate(&ctx).is_err());
        assert!(Expr::parse("not metric('a')").unwrap().evaluate(&ctx).is_err());
        assert!(Expr::parse("1 == true").unwrap().evaluate(&ctx).is_err());
    }
}
