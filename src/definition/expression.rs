//! Pluggable expressions evaluated against a [`RequestContext`].
//!
//! The engine only depends on the [`Expression`] and [`ExpressionParser`]
//! traits. [`DefaultExpressionParser`] understands a deliberately small
//! language: literals, scope paths (`flowScope.hotel.name`), implicit
//! variable paths searched through every scope, `currentEvent.*`, `==`, `!=`
//! and `!`.

use std::{fmt, sync::Arc, sync::LazyLock};

use regex::Regex;
use serde_json::Value;

use crate::{AttributeMap, AttributeValue, ConvoflowError, RequestContext, Result, ScopeType};

static PATH_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z0-9_]+)*$").unwrap());

/// Root name used to address the event being processed.
pub const CURRENT_EVENT_ROOT: &str = "currentEvent";

pub trait Expression: Send + Sync + fmt::Debug {
    /// Evaluates this expression.
    ///
    /// # Arguments
    ///
    /// * `ctx` - The [`RequestContext`] of the request being processed.
    ///
    /// # Returns
    ///
    /// The value as JSON; unresolved variables evaluate to [`Value::Null`].
    fn evaluate(
        &self,
        ctx: &RequestContext<'_>,
    ) -> Result<Value>;
}

pub trait ExpressionParser: Send + Sync {
    /// Parses `text`, with or without a surrounding `${...}` delimiter.
    fn parse(
        &self,
        text: &str,
    ) -> Result<Arc<dyn Expression>>;
}

/// Whether `text` is wrapped in `${` and `}`.
pub fn is_delimited(text: &str) -> bool {
    let text = text.trim();
    text.starts_with("${") && text.ends_with('}')
}

/// Strips an optional `${...}` delimiter.
pub fn strip_delimiters(text: &str) -> &str {
    let text = text.trim();
    if is_delimited(text) {
        text[2..text.len() - 1].trim()
    } else {
        text
    }
}

/// Truthiness used by `!` and by boolean coercions.
pub fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) if s.eq_ignore_ascii_case("true") => Some(true),
        Value::String(s) if s.eq_ignore_ascii_case("false") => Some(false),
        _ => None,
    }
}

/// Renders a value the way it is compared against event ids.
pub fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn navigate(
    value: &Value,
    path: &[String],
) -> Value {
    let mut current = value;
    for segment in path {
        let next = match current {
            Value::Object(obj) => obj.get(segment),
            Value::Array(arr) => segment.parse::<usize>().ok().and_then(|i| arr.get(i)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn resolve_in(
    map: &AttributeMap,
    path: &[String],
) -> Result<Value> {
    let Some((first, rest)) = path.split_first() else {
        return Ok(Value::Null);
    };
    match map.get(first) {
        None => Ok(Value::Null),
        Some(AttributeValue::Data(v)) => Ok(navigate(v, rest)),
        Some(AttributeValue::Object(o)) => Err(ConvoflowError::Expression(format!(
            "variable '{}' holds a live object of type '{}' that cannot be evaluated",
            first,
            o.type_name()
        ))),
    }
}

fn split_path(path: &str) -> Vec<String> {
    path.split('.').map(str::to_string).collect()
}

/// A constant.
#[derive(Debug, Clone)]
pub struct LiteralExpression(pub Value);

impl Expression for LiteralExpression {
    fn evaluate(
        &self,
        _ctx: &RequestContext<'_>,
    ) -> Result<Value> {
        Ok(self.0.clone())
    }
}

/// A path rooted in one explicit scope, e.g. `flowScope.booking.id`.
#[derive(Debug, Clone)]
pub struct ScopeExpression {
    scope: ScopeType,
    path: Vec<String>,
}

impl ScopeExpression {
    pub fn new(
        scope: ScopeType,
        path: &str,
    ) -> Self {
        Self {
            scope,
            path: split_path(path),
        }
    }
}

impl Expression for ScopeExpression {
    fn evaluate(
        &self,
        ctx: &RequestContext<'_>,
    ) -> Result<Value> {
        resolve_in(ctx.scope(self.scope)?, &self.path)
    }
}

/// A path whose first segment is looked up in every scope, request scope first.
#[derive(Debug, Clone)]
pub struct ImplicitExpression {
    path: Vec<String>,
}

impl ImplicitExpression {
    pub fn new(path: &str) -> Self {
        Self {
            path: split_path(path),
        }
    }
}

impl Expression for ImplicitExpression {
    fn evaluate(
        &self,
        ctx: &RequestContext<'_>,
    ) -> Result<Value> {
        let Some(first) = self.path.first() else {
            return Ok(Value::Null);
        };
        for scope in ScopeType::SEARCH_ORDER {
            if scope == ScopeType::View && !ctx.has_view_scope() {
                continue;
            }
            if scope == ScopeType::Flow && ctx.active_session().is_err() {
                continue;
            }
            let map = ctx.scope(scope)?;
            if map.contains_key(first) {
                return resolve_in(map, &self.path);
            }
        }
        Ok(Value::Null)
    }
}

/// `currentEvent.id` or `currentEvent.<attribute>`.
#[derive(Debug, Clone)]
pub struct EventExpression {
    path: Vec<String>,
}

impl EventExpression {
    pub fn new(path: &str) -> Self {
        Self {
            path: if path.is_empty() { Vec::new() } else { split_path(path) },
        }
    }
}

impl Expression for EventExpression {
    fn evaluate(
        &self,
        ctx: &RequestContext<'_>,
    ) -> Result<Value> {
        let Some(event) = ctx.current_event() else {
            return Ok(Value::Null);
        };
        match self.path.first().map(String::as_str) {
            None | Some("id") => Ok(Value::String(event.id().to_string())),
            Some("source") => Ok(Value::String(event.source().to_string())),
            Some("attributes") => resolve_in(event.attributes(), &self.path[1..]),
            Some(_) => resolve_in(event.attributes(), &self.path),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr)]
pub enum ComparisonOperator {
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    NotEq,
}

/// Equality comparison; numbers compare by value, everything else structurally.
#[derive(Debug, Clone)]
pub struct ComparisonExpression {
    left: Arc<dyn Expression>,
    operator: ComparisonOperator,
    right: Arc<dyn Expression>,
}

impl ComparisonExpression {
    pub fn new(
        left: Arc<dyn Expression>,
        operator: ComparisonOperator,
        right: Arc<dyn Expression>,
    ) -> Self {
        Self {
            left,
            operator,
            right,
        }
    }
}

impl Expression for ComparisonExpression {
    fn evaluate(
        &self,
        ctx: &RequestContext<'_>,
    ) -> Result<Value> {
        let left = self.left.evaluate(ctx)?;
        let right = self.right.evaluate(ctx)?;
        let equal = match (&left, &right) {
            (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
            (a, b) => a == b,
        };
        Ok(Value::Bool(match self.operator {
            ComparisonOperator::Eq => equal,
            ComparisonOperator::NotEq => !equal,
        }))
    }
}

#[derive(Debug, Clone)]
pub struct NotExpression(pub Arc<dyn Expression>);

impl Expression for NotExpression {
    fn evaluate(
        &self,
        ctx: &RequestContext<'_>,
    ) -> Result<Value> {
        let value = self.0.evaluate(ctx)?;
        match value {
            Value::Null => Ok(Value::Bool(true)),
            other => as_bool(&other)
                .map(|b| Value::Bool(!b))
                .ok_or_else(|| ConvoflowError::Expression(format!("cannot negate non-boolean value '{}'", other))),
        }
    }
}

type EvaluateFn = dyn Fn(&RequestContext<'_>) -> Result<Value> + Send + Sync;

/// An expression backed by a closure.
#[derive(Clone)]
pub struct FnExpression {
    name: String,
    f: Arc<EvaluateFn>,
}

impl FnExpression {
    pub fn new<F>(
        name: &str,
        f: F,
    ) -> Self
    where
        F: Fn(&RequestContext<'_>) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            f: Arc::new(f),
        }
    }
}

impl fmt::Debug for FnExpression {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "FnExpression({})", self.name)
    }
}

impl Expression for FnExpression {
    fn evaluate(
        &self,
        ctx: &RequestContext<'_>,
    ) -> Result<Value> {
        (self.f)(ctx)
    }
}

/// Parser for the built-in expression language.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultExpressionParser;

impl DefaultExpressionParser {
    pub fn new() -> Self {
        Self
    }

    fn parse_operand(
        &self,
        text: &str,
    ) -> Result<Arc<dyn Expression>> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ConvoflowError::Expression("empty expression".to_string()));
        }
        if let Some(rest) = text.strip_prefix('!') {
            return Ok(Arc::new(NotExpression(self.parse_operand(rest)?)));
        }
        if let Some(literal) = parse_literal(text) {
            return Ok(Arc::new(LiteralExpression(literal)));
        }
        if !PATH_PATTERN.is_match(text) {
            return Err(ConvoflowError::Expression(format!("unsupported expression '{}'", text)));
        }

        let (root, rest) = text.split_once('.').unwrap_or((text, ""));
        if root == CURRENT_EVENT_ROOT {
            return Ok(Arc::new(EventExpression::new(rest)));
        }
        if let Some(scope) = ScopeType::from_expression_root(root) {
            if rest.is_empty() {
                return Err(ConvoflowError::Expression(format!("expression '{}' must name a variable inside the scope", text)));
            }
            return Ok(Arc::new(ScopeExpression::new(scope, rest)));
        }
        Ok(Arc::new(ImplicitExpression::new(text)))
    }
}

impl ExpressionParser for DefaultExpressionParser {
    fn parse(
        &self,
        text: &str,
    ) -> Result<Arc<dyn Expression>> {
        let body = strip_delimiters(text);
        if let Some((left, operator, right)) = split_comparison(body) {
            return Ok(Arc::new(ComparisonExpression::new(self.parse_operand(left)?, operator, self.parse_operand(right)?)));
        }
        self.parse_operand(body)
    }
}

fn parse_literal(text: &str) -> Option<Value> {
    let quoted = |q: char| text.len() >= 2 && text.starts_with(q) && text.ends_with(q);
    if quoted('\'') || quoted('"') {
        return Some(Value::String(text[1..text.len() - 1].to_string()));
    }
    match text {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        "null" => return Some(Value::Null),
        _ => {}
    }
    if text.starts_with(|c: char| c.is_ascii_digit() || c == '-') {
        return serde_json::from_str::<serde_json::Number>(text).ok().map(Value::Number);
    }
    None
}

/// Splits on the first `==` or `!=` outside of quotes.
fn split_comparison(text: &str) -> Option<(&str, ComparisonOperator, &str)> {
    let bytes = text.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i + 1 < bytes.len() {
        let c = bytes[i];
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == b'\'' || c == b'"' => quote = Some(c),
            None if bytes[i + 1] == b'=' && (c == b'=' || c == b'!') => {
                let operator = if c == b'=' { ComparisonOperator::Eq } else { ComparisonOperator::NotEq };
                return Some((&text[..i], operator, &text[i + 2..]));
            }
            None => {}
        }
        i += 1;
    }
    None
}
