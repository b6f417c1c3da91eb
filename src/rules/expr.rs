//! Alert expression language
//!
//! A small PromQL subset: an instant selector, a range function over a
//! selector, or an aggregation of either, compared against a constant.
//!
//! ```text
//! increase(http_requests_total{code=~"5.."}[5m]) > 10
//! sum by (job) (rate(http_requests_total{code="500"}[1m])) >= 0.5
//! up{job="api"} == 0
//! ```

use std::fmt;
use std::time::Duration;

use super::duration::{format_duration, parse_duration};
use super::matcher::{LabelMatcher, MatchOp};

/// Parsed rule condition
#[derive(Debug, Clone)]
pub struct AlertExpr {
    pub vector: VectorExpr,
    pub op: CompareOp,
    pub threshold: f64,
}

#[derive(Debug, Clone)]
pub enum VectorExpr {
    /// Latest sample of each series within the lookback
    Instant(Selector),
    /// Range function over `(t - window, t]`
    Range {
        func: RangeFunc,
        selector: Selector,
        window: Duration,
    },
    Aggregate {
        op: AggregateOp,
        by: Vec<String>,
        inner: Box<VectorExpr>,
    },
}

#[derive(Debug, Clone)]
pub struct Selector {
    pub metric: String,
    pub matchers: Vec<LabelMatcher>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeFunc {
    Rate,
    Increase,
    Delta,
    AvgOverTime,
    MinOverTime,
    MaxOverTime,
    SumOverTime,
    CountOverTime,
    LastOverTime,
}

impl RangeFunc {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "rate" => RangeFunc::Rate,
            "increase" => RangeFunc::Increase,
            "delta" => RangeFunc::Delta,
            "avg_over_time" => RangeFunc::AvgOverTime,
            "min_over_time" => RangeFunc::MinOverTime,
            "max_over_time" => RangeFunc::MaxOverTime,
            "sum_over_time" => RangeFunc::SumOverTime,
            "count_over_time" => RangeFunc::CountOverTime,
            "last_over_time" => RangeFunc::LastOverTime,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            RangeFunc::Rate => "rate",
            RangeFunc::Increase => "increase",
            RangeFunc::Delta => "delta",
            RangeFunc::AvgOverTime => "avg_over_time",
            RangeFunc::MinOverTime => "min_over_time",
            RangeFunc::MaxOverTime => "max_over_time",
            RangeFunc::SumOverTime => "sum_over_time",
            RangeFunc::CountOverTime => "count_over_time",
            RangeFunc::LastOverTime => "last_over_time",
        }
    }

    /// Minimum samples in the window for the function to produce a value
    pub fn min_samples(&self) -> usize {
        match self {
            RangeFunc::Rate | RangeFunc::Increase | RangeFunc::Delta => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOp {
    Sum,
    Avg,
    Min,
    Max,
    Count,
}

impl AggregateOp {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "sum" => AggregateOp::Sum,
            "avg" => AggregateOp::Avg,
            "min" => AggregateOp::Min,
            "max" => AggregateOp::Max,
            "count" => AggregateOp::Count,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            AggregateOp::Sum => "sum",
            AggregateOp::Avg => "avg",
            AggregateOp::Min => "min",
            AggregateOp::Max => "max",
            AggregateOp::Count => "count",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl CompareOp {
    /// NaN never satisfies a comparison
    pub fn apply(&self, value: f64, threshold: f64) -> bool {
        match self {
            CompareOp::Gt => value > threshold,
            CompareOp::Ge => value >= threshold,
            CompareOp::Lt => value < threshold,
            CompareOp::Le => value <= threshold,
            CompareOp::Eq => value == threshold,
            CompareOp::Ne => !value.is_nan() && value != threshold,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
        }
    }
}

impl AlertExpr {
    /// Longest range window referenced by the expression
    pub fn max_window(&self) -> Option<Duration> {
        self.vector.max_window()
    }
}

impl VectorExpr {
    pub fn max_window(&self) -> Option<Duration> {
        match self {
            VectorExpr::Instant(_) => None,
            VectorExpr::Range { window, .. } => Some(*window),
            VectorExpr::Aggregate { inner, .. } => inner.max_window(),
        }
    }

    pub fn has_instant_selector(&self) -> bool {
        match self {
            VectorExpr::Instant(_) => true,
            VectorExpr::Range { .. } => false,
            VectorExpr::Aggregate { inner, .. } => inner.has_instant_selector(),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.metric)?;
        if !self.matchers.is_empty() {
            let parts: Vec<String> = self.matchers.iter().map(|m| m.to_string()).collect();
            write!(f, "{{{}}}", parts.join(", "))?;
        }
        Ok(())
    }
}

impl fmt::Display for VectorExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VectorExpr::Instant(sel) => write!(f, "{}", sel),
            VectorExpr::Range {
                func,
                selector,
                window,
            } => write!(f, "{}({}[{}])", func.name(), selector, format_duration(*window)),
            VectorExpr::Aggregate { op, by, inner } => {
                write!(f, "{}", op.name())?;
                if !by.is_empty() {
                    write!(f, " by ({})", by.join(", "))?;
                }
                write!(f, " ({})", inner)
            }
        }
    }
}

impl fmt::Display for AlertExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.vector, self.op.as_str(), self.threshold)
    }
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(f64),
    /// Raw text between `[` and `]`
    Range(String),
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Op(&'static str),
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, ExprError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let next = chars.get(i + 1).map(|(_, c)| *c);
        match c {
            '(' => tokens.push((pos, Token::LParen)),
            ')' => tokens.push((pos, Token::RParen)),
            '{' => tokens.push((pos, Token::LBrace)),
            '}' => tokens.push((pos, Token::RBrace)),
            ',' => tokens.push((pos, Token::Comma)),
            '[' => {
                let end = chars[i..]
                    .iter()
                    .position(|(_, c)| *c == ']')
                    .ok_or_else(|| ExprError::syntax(pos, "unterminated range"))?;
                let text: String = chars[i + 1..i + end].iter().map(|(_, c)| c).collect();
                tokens.push((pos, Token::Range(text.trim().to_string())));
                i += end + 1;
                continue;
            }
            '>' | '<' | '=' | '!' => {
                let op = match (c, next) {
                    ('>', Some('=')) => ">=",
                    ('<', Some('=')) => "<=",
                    ('=', Some('=')) => "==",
                    ('!', Some('=')) => "!=",
                    ('=', Some('~')) => "=~",
                    ('!', Some('~')) => "!~",
                    ('>', _) => ">",
                    ('<', _) => "<",
                    ('=', _) => "=",
                    _ => return Err(ExprError::syntax(pos, "unexpected '!'")),
                };
                tokens.push((pos, Token::Op(op)));
                i += op.len();
                continue;
            }
            '"' | '\'' => {
                let quote = c;
                let mut value = String::new();
                let mut j = i + 1;
                loop {
                    match chars.get(j).map(|(_, c)| *c) {
                        None => return Err(ExprError::syntax(pos, "unterminated string")),
                        Some(ch) if ch == quote => break,
                        Some('\\') => {
                            let escaped = chars
                                .get(j + 1)
                                .map(|(_, c)| *c)
                                .ok_or_else(|| ExprError::syntax(pos, "unterminated string"))?;
                            value.push(match escaped {
                                'n' => '\n',
                                't' => '\t',
                                other => other,
                            });
                            j += 2;
                        }
                        Some(ch) => {
                            value.push(ch);
                            j += 1;
                        }
                    }
                }
                tokens.push((pos, Token::Str(value)));
                i = j + 1;
                continue;
            }
            c if c.is_ascii_digit()
                || c == '.'
                || (c == '-' && next.map_or(false, |n| n.is_ascii_digit() || n == '.')) =>
            {
                let mut j = i + 1;
                while let Some((_, ch)) = chars.get(j) {
                    let prev = chars[j - 1].1;
                    let exponent_sign = (*ch == '-' || *ch == '+') && (prev == 'e' || prev == 'E');
                    if ch.is_ascii_digit() || *ch == '.' || *ch == 'e' || *ch == 'E' || exponent_sign {
                        j += 1;
                    } else {
                        break;
                    }
                }
                let text: String = chars[i..j].iter().map(|(_, c)| c).collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| ExprError::syntax(pos, format!("invalid number '{}'", text)))?;
                tokens.push((pos, Token::Number(value)));
                i = j;
                continue;
            }
            c if c.is_ascii_alphabetic() || c == '_' || c == ':' => {
                let mut j = i + 1;
                while let Some((_, ch)) = chars.get(j) {
                    if ch.is_ascii_alphanumeric() || *ch == '_' || *ch == ':' {
                        j += 1;
                    } else {
                        break;
                    }
                }
                let ident: String = chars[i..j].iter().map(|(_, c)| c).collect();
                tokens.push((pos, Token::Ident(ident)));
                i = j;
                continue;
            }
            other => {
                return Err(ExprError::syntax(pos, format!("unexpected character '{}'", other)));
            }
        }
        i += 1;
    }

    Ok(tokens)
}

// ============================================================================
// Parser
// ============================================================================

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn new(input: &str) -> Result<Self, ExprError> {
        Ok(Self {
            tokens: tokenize(input)?,
            pos: 0,
            end: input.len(),
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn offset(&self) -> usize {
        self.tokens.get(self.pos).map(|(p, _)| *p).unwrap_or(self.end)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|(_, t)| t.clone());
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ExprError> {
        let offset = self.offset();
        match self.next() {
            Some(t) if t == expected => Ok(()),
            _ => Err(ExprError::syntax(offset, format!("expected {}", what))),
        }
    }

    fn ident(&mut self, what: &str) -> Result<String, ExprError> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            _ => Err(ExprError::syntax(offset, format!("expected {}", what))),
        }
    }

    fn finish(&self) -> Result<(), ExprError> {
        if self.pos < self.tokens.len() {
            return Err(ExprError::syntax(self.offset(), "unexpected trailing input"));
        }
        Ok(())
    }

    fn alert_expr(&mut self) -> Result<AlertExpr, ExprError> {
        let vector = self.vector()?;

        let offset = self.offset();
        let op = match self.next() {
            Some(Token::Op(">")) => CompareOp::Gt,
            Some(Token::Op(">=")) => CompareOp::Ge,
            Some(Token::Op("<")) => CompareOp::Lt,
            Some(Token::Op("<=")) => CompareOp::Le,
            Some(Token::Op("==")) => CompareOp::Eq,
            Some(Token::Op("!=")) => CompareOp::Ne,
            _ => return Err(ExprError::syntax(offset, "expected comparison operator")),
        };

        let offset = self.offset();
        let threshold = match self.next() {
            Some(Token::Number(n)) => n,
            Some(Token::Ident(word)) if word == "Inf" => f64::INFINITY,
            _ => return Err(ExprError::syntax(offset, "expected numeric threshold")),
        };

        self.finish()?;
        Ok(AlertExpr {
            vector,
            op,
            threshold,
        })
    }

    fn vector(&mut self) -> Result<VectorExpr, ExprError> {
        let offset = self.offset();
        let name = self.ident("metric name or function")?;

        if let Some(op) = AggregateOp::from_name(&name) {
            if matches!(self.peek(), Some(Token::LParen) | Some(Token::Ident(_))) {
                return self.aggregate(op);
            }
        }

        if let Some(func) = RangeFunc::from_name(&name) {
            if self.peek() == Some(&Token::LParen) {
                self.next();
                let selector_name = self.ident("metric name")?;
                let selector = self.selector(selector_name)?;

                let range_offset = self.offset();
                let window = match self.next() {
                    Some(Token::Range(text)) => parse_duration(&text)
                        .map_err(|_| ExprError::InvalidWindow(text.clone()))?,
                    _ => {
                        return Err(ExprError::syntax(
                            range_offset,
                            format!("{}() requires a range like [5m]", func.name()),
                        ))
                    }
                };
                if window.is_zero() {
                    return Err(ExprError::InvalidWindow(format_duration(window)));
                }
                self.expect(Token::RParen, "')'")?;
                return Ok(VectorExpr::Range {
                    func,
                    selector,
                    window,
                });
            }
        }

        if self.peek() == Some(&Token::LParen) {
            return Err(ExprError::syntax(offset, format!("unknown function '{}'", name)));
        }

        let selector = self.selector(name)?;
        if let Some(Token::Range(_)) = self.peek() {
            return Err(ExprError::syntax(
                self.offset(),
                "range selector needs a function such as rate() or increase()",
            ));
        }
        Ok(VectorExpr::Instant(selector))
    }

    fn aggregate(&mut self, op: AggregateOp) -> Result<VectorExpr, ExprError> {
        let mut by = self.grouping()?;
        self.expect(Token::LParen, "'(' after aggregation")?;
        let inner = self.vector()?;
        self.expect(Token::RParen, "')'")?;
        if by.is_empty() {
            by = self.grouping()?;
        }
        Ok(VectorExpr::Aggregate {
            op,
            by,
            inner: Box::new(inner),
        })
    }

    fn grouping(&mut self) -> Result<Vec<String>, ExprError> {
        match self.peek() {
            Some(Token::Ident(kw)) if kw == "by" => {}
            _ => return Ok(Vec::new()),
        }
        self.next();
        self.expect(Token::LParen, "'(' after by")?;

        let mut labels = Vec::new();
        loop {
            match self.next() {
                Some(Token::RParen) => break,
                Some(Token::Ident(label)) => {
                    labels.push(label);
                    match self.next() {
                        Some(Token::Comma) => continue,
                        Some(Token::RParen) => break,
                        _ => return Err(ExprError::syntax(self.offset(), "expected ',' or ')'")),
                    }
                }
                _ => return Err(ExprError::syntax(self.offset(), "expected label name")),
            }
        }
        Ok(labels)
    }

    fn selector(&mut self, metric: String) -> Result<Selector, ExprError> {
        let mut matchers = Vec::new();

        if self.peek() == Some(&Token::LBrace) {
            self.next();
            loop {
                if self.peek() == Some(&Token::RBrace) {
                    self.next();
                    break;
                }
                matchers.push(self.matcher()?);
                match self.next() {
                    Some(Token::Comma) => continue,
                    Some(Token::RBrace) => break,
                    _ => return Err(ExprError::syntax(self.offset(), "expected ',' or '}'")),
                }
            }
        }

        Ok(Selector { metric, matchers })
    }

    fn matcher(&mut self) -> Result<LabelMatcher, ExprError> {
        let name = self.ident("label name")?;

        let offset = self.offset();
        let op = match self.next() {
            Some(Token::Op("=")) => MatchOp::Equal,
            Some(Token::Op("!=")) => MatchOp::NotEqual,
            Some(Token::Op("=~")) => MatchOp::Regex,
            Some(Token::Op("!~")) => MatchOp::NotRegex,
            _ => return Err(ExprError::syntax(offset, "expected matcher operator")),
        };

        let offset = self.offset();
        let value = match self.next() {
            Some(Token::Str(s)) => s,
            _ => return Err(ExprError::syntax(offset, "expected quoted label value")),
        };

        LabelMatcher::new(name, op, value).map_err(|e| ExprError::InvalidRegex(e.to_string()))
    }
}

/// Parse a rule condition such as `rate(errors_total[5m]) > 0.1`
pub fn parse_expr(input: &str) -> Result<AlertExpr, ExprError> {
    Parser::new(input)?.alert_expr()
}

/// Parse a single route matcher such as `severity="critical"`. A bare word
/// value (`severity=critical`) is accepted as well.
pub fn parse_matcher(input: &str) -> Result<LabelMatcher, ExprError> {
    let trimmed = input.trim();
    let op_pos = trimmed
        .find(|c: char| c == '=' || c == '!')
        .ok_or_else(|| ExprError::syntax(0, "expected matcher operator"))?;
    let value_part = trimmed[op_pos..]
        .trim_start_matches(|c: char| c == '=' || c == '!' || c == '~')
        .trim();

    if value_part.starts_with('"') || value_part.starts_with('\'') {
        let mut parser = Parser::new(trimmed)?;
        let matcher = parser.matcher()?;
        parser.finish()?;
        return Ok(matcher);
    }

    let name = trimmed[..op_pos].trim();
    let op_text = &trimmed[op_pos..trimmed.len() - value_part.len()].trim();
    let op = match *op_text {
        "=" => MatchOp::Equal,
        "!=" => MatchOp::NotEqual,
        "=~" => MatchOp::Regex,
        "!~" => MatchOp::NotRegex,
        _ => return Err(ExprError::syntax(op_pos, "expected matcher operator")),
    };
    if !crate::data::is_valid_metric_name(name) {
        return Err(ExprError::syntax(0, "expected label name"));
    }
    LabelMatcher::new(name, op, value_part).map_err(|e| ExprError::InvalidRegex(e.to_string()))
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExprError {
    #[error("Syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("Invalid regex: {0}")]
    InvalidRegex(String),

    #[error("Malformed window: '{0}'")]
    InvalidWindow(String),

    #[error("No series found for metric '{0}'")]
    MissingMetric(String),

    #[error("Window {window} exceeds retained history {retention}")]
    WindowExceedsRetention { window: String, retention: String },
}

impl ExprError {
    fn syntax(offset: usize, message: impl Into<String>) -> Self {
        ExprError::Syntax {
            offset,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_function() {
        let expr = parse_expr(r#"increase(http_requests_total{code=~"5..", job="api"}[5m]) > 10"#)
            .unwrap();

        assert_eq!(expr.op, CompareOp::Gt);
        assert_eq!(expr.threshold, 10.0);
        assert_eq!(expr.max_window(), Some(Duration::from_secs(300)));

        match &expr.vector {
            VectorExpr::Range { func, selector, .. } => {
                assert_eq!(*func, RangeFunc::Increase);
                assert_eq!(selector.metric, "http_requests_total");
                assert_eq!(selector.matchers.len(), 2);
                assert_eq!(selector.matchers[0].op, MatchOp::Regex);
            }
            other => panic!("unexpected vector {:?}", other),
        }
    }

    #[test]
    fn test_parse_instant_selector() {
        let expr = parse_expr("up{job='db'} == 0").unwrap();
        assert!(matches!(expr.vector, VectorExpr::Instant(_)));
        assert_eq!(expr.op, CompareOp::Eq);
        assert_eq!(expr.max_window(), None);

        let expr = parse_expr("node_load1 >= -0.5e1").unwrap();
        assert_eq!(expr.threshold, -5.0);
    }

    #[test]
    fn test_parse_aggregation_both_positions() {
        let prefix = parse_expr("sum by (job, instance) (rate(errors_total[1m])) > 0.5").unwrap();
        let suffix = parse_expr("sum(rate(errors_total[1m])) by (job, instance) > 0.5").unwrap();

        for expr in [prefix, suffix] {
            match expr.vector {
                VectorExpr::Aggregate { op, by, .. } => {
                    assert_eq!(op, AggregateOp::Sum);
                    assert_eq!(by, vec!["job".to_string(), "instance".to_string()]);
                }
                other => panic!("unexpected vector {:?}", other),
            }
        }
    }

    #[test]
    fn test_metric_named_like_aggregate() {
        // A metric called "count" with no parens is a plain selector
        let expr = parse_expr("count > 3").unwrap();
        match expr.vector {
            VectorExpr::Instant(sel) => assert_eq!(sel.metric, "count"),
            other => panic!("unexpected vector {:?}", other),
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            parse_expr("rate(errors_total) > 1"),
            Err(ExprError::Syntax { .. })
        ));
        assert!(matches!(
            parse_expr("rate(errors_total[5q]) > 1"),
            Err(ExprError::InvalidWindow(_))
        ));
        assert!(matches!(
            parse_expr("rate(errors_total[0s]) > 1"),
            Err(ExprError::InvalidWindow(_))
        ));
        assert!(matches!(
            parse_expr(r#"errors_total{code=~"("} > 1"#),
            Err(ExprError::InvalidRegex(_))
        ));
        assert!(parse_expr("errors_total").is_err());
        assert!(parse_expr("errors_total > 1 2").is_err());
        assert!(parse_expr("errors_total[5m] > 1").is_err());
        assert!(parse_expr("histogram_quantile(errors_total) > 1").is_err());
    }

    #[test]
    fn test_display_round_trips() {
        let source = r#"max by (job) (avg_over_time(queue_depth{env!="dev"}[1h30m])) < 3"#;
        let expr = parse_expr(source).unwrap();
        let rendered = expr.to_string();
        let reparsed = parse_expr(&rendered).unwrap();
        assert_eq!(reparsed.to_string(), rendered);
        assert_eq!(reparsed.max_window(), Some(Duration::from_secs(5400)));
    }

    #[test]
    fn test_parse_route_matcher() {
        let m = parse_matcher(r#"severity="critical""#).unwrap();
        assert_eq!(m.op, MatchOp::Equal);
        assert_eq!(m.value, "critical");

        let m = parse_matcher("team=~db|infra").unwrap();
        assert_eq!(m.op, MatchOp::Regex);
        assert!(m.matches_value("infra"));

        let m = parse_matcher("env != staging").unwrap();
        assert_eq!(m.op, MatchOp::NotEqual);
        assert_eq!(m.name, "env");

        assert!(parse_matcher("no operator").is_err());
    }
}
