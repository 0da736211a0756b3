#![allow(clippy::result_large_err)]

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use regex::Regex;
use rhai::{Array, Dynamic, Engine, Map, Scope};
use serde_json::Value;
use std::sync::OnceLock;

/// Matches `$name` and `$name.path.0.segment` references inside a condition.
fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)").expect("valid regex")
    })
}

/// Matches simple single-quoted string literals, rewritten to double quotes.
fn single_quoted_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r#"'([^'"\\]*)'"#).expect("valid regex"))
}

/// Matches `null`/`undefined` keywords, skipping double-quoted literals and
/// reference path segments.
fn null_keyword_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#""(?:[^"\\]|\\.)*"|([.$])?\b(?:null|undefined)\b"#).expect("valid regex")
    })
}

/// Condition evaluator backed by a locked-down Rhai engine.
///
/// References are substituted before evaluation: strings become quoted and
/// escaped literals, numbers and booleans are inlined, absent values become
/// `()`, and arrays/objects are bound into the scope under generated names.
pub struct ExpressionEngine {
    engine: Engine,
}

impl Default for ExpressionEngine {
    fn default() -> Self {
        let mut engine = Engine::new_raw();
        engine.set_max_operations(50_000);
        engine.set_max_call_levels(64);
        engine.set_max_expr_depths(64, 64);
        engine.set_max_string_size(64 * 1024);
        engine.on_print(|_| {});
        engine.on_debug(|_, _, _| {});
        ExpressionEngine { engine }
    }
}

/// Expression text after reference substitution plus the structured bindings.
pub struct SubstitutedExpression {
    pub text: String,
    pub bindings: Vec<(String, Value)>,
}

impl ExpressionEngine {
    /// Replace every `$reference` in `expr` using `lookup`.
    pub fn substitute<F>(&self, expr: &str, lookup: &F) -> SubstitutedExpression
    where
        F: Fn(&str) -> Option<Value>,
    {
        let normalized = expr.replace("===", "==").replace("!==", "!=");
        let normalized = single_quoted_pattern().replace_all(&normalized, "\"$1\"");
        let normalized =
            null_keyword_pattern().replace_all(&normalized, |caps: &regex::Captures<'_>| {
                let matched = &caps[0];
                if matched.starts_with('"') || caps.get(1).is_some() {
                    matched.to_string()
                } else {
                    "()".to_string()
                }
            });
        let mut bindings = Vec::new();
        let text = reference_pattern()
            .replace_all(&normalized, |caps: &regex::Captures<'_>| {
                match lookup(&caps[1]) {
                    None | Some(Value::Null) => "()".to_string(),
                    Some(Value::Bool(flag)) => flag.to_string(),
                    Some(Value::Number(number)) => encode_number(&number),
                    Some(Value::String(text)) => quote(&text),
                    Some(structured) => {
                        let name = format!("ref{}", bindings.len());
                        bindings.push((name.clone(), structured));
                        name
                    }
                }
            })
            .into_owned();
        SubstitutedExpression { text, bindings }
    }

    /// Evaluate a boolean condition. Non-boolean results are errors.
    pub fn evaluate_condition<F>(&self, expr: &str, lookup: &F) -> Result<bool, AppError>
    where
        F: Fn(&str) -> Option<Value>,
    {
        let substituted = self.substitute(expr, lookup);
        let mut scope = Scope::new();
        for (name, value) in &substituted.bindings {
            scope.push_dynamic(name.as_str(), to_dynamic(value));
        }
        let result = self
            .engine
            .eval_with_scope::<Dynamic>(&mut scope, &substituted.text)
            .map_err(|err| {
                AppError::new(
                    ErrorCategory::ValidationError,
                    format!("expression execution error: {}", err),
                )
                .with_code("WFG-EXPR-001")
            })?;
        result.as_bool().map_err(|type_name| {
            AppError::new(
                ErrorCategory::ValidationError,
                format!("condition '{}' evaluated to {}, not bool", expr, type_name),
            )
            .with_code("WFG-EXPR-002")
        })
    }
}

fn quote(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('"');
    for ch in text.chars() {
        match ch {
            '\\' => quoted.push_str("\\\\"),
            '"' => quoted.push_str("\\\""),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            other => quoted.push(other),
        }
    }
    quoted.push('"');
    quoted
}

fn encode_number(number: &serde_json::Number) -> String {
    if let Some(i) = number.as_i64() {
        i.to_string()
    } else if let Some(f) = number.as_f64() {
        format!("{:?}", f)
    } else {
        number.to_string()
    }
}

fn to_dynamic(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => Dynamic::from(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Dynamic::from(i)
            } else if let Some(f) = n.as_f64() {
                Dynamic::from(f)
            } else {
                Dynamic::from(0_i64)
            }
        }
        Value::String(s) => Dynamic::from(s.clone()),
        Value::Array(items) => {
            let mut arr = Array::new();
            for item in items {
                arr.push(to_dynamic(item));
            }
            Dynamic::from_array(arr)
        }
        Value::Object(map) => {
            let mut rhai_map = Map::new();
            for (key, value) in map {
                rhai_map.insert(key.into(), to_dynamic(value));
            }
            Dynamic::from_map(rhai_map)
        }
    }
}
