// Sandboxed template engine for workflow documents
//
// Renders `{{ expr }}` interpolations and `{% %}` control blocks against the
// run context. Rendering is recursive over strings, sequences, and mappings;
// strings without template markers pass through untouched, and undefined
// names are hard errors that surface as node-preparation failures.

use minijinja::{Environment, UndefinedBehavior};
use serde_json::{Map, Value};

use crate::error::EngineError;

/// Template engine with the workflow filter set installed.
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);

        env.add_filter("truncate", filters::truncate);
        env.add_filter("json", filters::json);
        env.add_filter("lines", filters::lines);
        env.add_filter("first_line", filters::first_line);
        env.add_filter("last_line", filters::last_line);
        env.add_filter("strip", filters::strip);
        env.add_filter("upper", filters::upper);
        env.add_filter("lower", filters::lower);
        env.add_filter("split", filters::split);

        env.add_function("date", functions::date);

        Self { env }
    }

    /// Render a template string against a context mapping.
    pub fn render(&self, template: &str, context: &Map<String, Value>) -> Result<String, EngineError> {
        self.env
            .render_str(template, Value::Object(context.clone()))
            .map_err(|e| EngineError::Template(format_minijinja_error(&e)))
    }

    /// Whether a string contains template syntax at all.
    pub fn has_template(value: &str) -> bool {
        value.contains("{{") || value.contains("{%")
    }

    /// Recursively render template strings inside a JSON value. Non-string
    /// scalars pass through unchanged.
    pub fn render_value(
        &self,
        value: &Value,
        context: &Map<String, Value>,
    ) -> Result<Value, EngineError> {
        match value {
            Value::String(s) => {
                if Self::has_template(s) {
                    Ok(Value::String(self.render(s, context)?))
                } else {
                    Ok(value.clone())
                }
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.render_value(item, context))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut rendered = Map::with_capacity(map.len());
                for (key, val) in map {
                    rendered.insert(key.clone(), self.render_value(val, context)?);
                }
                Ok(Value::Object(rendered))
            }
            _ => Ok(value.clone()),
        }
    }

    /// Render every template string in a mapping.
    pub fn render_map(
        &self,
        map: &Map<String, Value>,
        context: &Map<String, Value>,
    ) -> Result<Map<String, Value>, EngineError> {
        match self.render_value(&Value::Object(map.clone()), context)? {
            Value::Object(rendered) => Ok(rendered),
            _ => unreachable!("rendering an object yields an object"),
        }
    }
}

fn format_minijinja_error(err: &minijinja::Error) -> String {
    // Include the nested cause (e.g. which name was undefined)
    let mut msg = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        msg.push_str(&format!(": {cause}"));
        source = cause.source();
    }
    msg
}

mod filters {
    use minijinja::value::Value;
    use minijinja::Error;

    pub fn truncate(value: String, length: Option<usize>, suffix: Option<String>) -> String {
        let length = length.unwrap_or(80);
        let suffix = suffix.unwrap_or_else(|| "...".to_string());
        if value.chars().count() <= length {
            return value;
        }
        let keep = length.saturating_sub(suffix.chars().count());
        let truncated: String = value.chars().take(keep).collect();
        format!("{truncated}{suffix}")
    }

    pub fn json(value: Value, indent: Option<usize>) -> Result<String, Error> {
        let serialized = match indent {
            Some(_) => serde_json::to_string_pretty(&value),
            None => serde_json::to_string(&value),
        };
        serialized.map_err(|e| {
            Error::new(
                minijinja::ErrorKind::InvalidOperation,
                format!("cannot serialize value to JSON: {e}"),
            )
        })
    }

    pub fn lines(value: String) -> Vec<String> {
        value.lines().map(str::to_string).collect()
    }

    pub fn first_line(value: String) -> String {
        value.lines().next().unwrap_or_default().to_string()
    }

    pub fn last_line(value: String) -> String {
        value.lines().last().unwrap_or_default().to_string()
    }

    pub fn strip(value: String) -> String {
        value.trim().to_string()
    }

    pub fn upper(value: String) -> String {
        value.to_uppercase()
    }

    pub fn lower(value: String) -> String {
        value.to_lowercase()
    }

    pub fn split(value: String, sep: Option<String>) -> Vec<String> {
        match sep {
            Some(sep) => value.split(&sep).map(str::to_string).collect(),
            None => value.split_whitespace().map(str::to_string).collect(),
        }
    }
}

mod functions {
    use std::fmt::Write;

    /// Current local time formatted with a chrono format string. An invalid
    /// format specifier yields whatever was formatted before the error
    /// rather than failing the render.
    pub fn date(fmt: String) -> String {
        let mut out = String::new();
        let _ = write!(out, "{}", chrono::Local::now().format(&fmt));
        out
    }
}
