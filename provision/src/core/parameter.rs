//! Typed configuration parameters.
//!
//! Every kind keeps its value as text (the persisted form); kind-specific
//! behavior is selected by matching on [`ParamKind`] when a value is set or
//! rendered.

use crate::core::json::quoted;
use crate::core::numeric::{format_float, parse_float, parse_int};

/// Placeholder returned instead of a stored secret. Writing it back is a no-op.
pub const PASSWORD_MASK: &str = "********";

#[derive(Debug, Clone, PartialEq)]
pub enum ParamKind {
    String,
    Password,
    Int,
    Float,
    Bool,
    /// Selection stored as a code, with the ordered options offered to clients.
    Dropdown { options: Vec<String> },
}

impl ParamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamKind::String => "string",
            ParamKind::Password => "password",
            ParamKind::Int => "int",
            ParamKind::Float => "float",
            ParamKind::Bool => "bool",
            ParamKind::Dropdown { .. } => "dropdown",
        }
    }
}

/// Whether [`Parameter::set`] changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    Applied,
    /// Input was refused and the previous value kept (blank or masked secret).
    Ignored,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    /// Unique key within the endpoint; also the storage key.
    pub name: String,
    pub label: String,
    pub kind: ParamKind,
    /// Current value as text. Empty means "use `init`".
    pub value: String,
    /// Declared default as text.
    pub init: String,
    /// Numeric bound or length bound. `None` is unbounded.
    pub min: Option<i64>,
    pub max: Option<i64>,
}

impl Parameter {
    /// Create a parameter with an empty value. An empty `label` falls back to `name`.
    pub fn new(name: &str, kind: ParamKind, init: impl Into<String>, label: &str) -> Self {
        Self {
            name: name.to_string(),
            label: if label.is_empty() {
                name.to_string()
            } else {
                label.to_string()
            },
            kind,
            value: String::new(),
            init: init.into(),
            min: None,
            max: None,
        }
    }

    /// Apply raw input (a form field) according to the kind.
    pub fn set(&mut self, raw: &str) -> SetOutcome {
        match self.kind {
            ParamKind::Password => {
                let trimmed = raw.trim();
                if trimmed.is_empty() || trimmed == PASSWORD_MASK {
                    return SetOutcome::Ignored;
                }
                self.value = trimmed.to_string();
            }
            ParamKind::Bool => {
                self.value = if raw.is_empty() { "0" } else { "1" }.to_string();
            }
            ParamKind::String | ParamKind::Int | ParamKind::Float | ParamKind::Dropdown { .. } => {
                self.value = raw.to_string();
            }
        }
        SetOutcome::Applied
    }

    /// Stored value if present, otherwise the declared default.
    pub fn effective(&self) -> &str {
        if self.value.is_empty() {
            &self.init
        } else {
            &self.value
        }
    }

    pub fn as_int(&self) -> i64 {
        parse_int(self.effective())
    }

    pub fn as_float(&self) -> f64 {
        parse_float(self.effective())
    }

    pub fn as_bool(&self) -> bool {
        parse_int(self.effective()) != 0
    }

    pub fn options(&self) -> Option<&[String]> {
        match &self.kind {
            ParamKind::Dropdown { options } => Some(options),
            _ => None,
        }
    }

    /// JSON literal for the current value, or `None` when it is omitted.
    ///
    /// Secrets render as [`PASSWORD_MASK`] and never as plaintext.
    pub fn render_value(&self) -> Option<String> {
        if self.value.is_empty() {
            return None;
        }
        Some(match self.kind {
            ParamKind::Password => quoted(PASSWORD_MASK),
            _ => self.render_text(&self.value),
        })
    }

    /// JSON literal for the declared default, or `None` when it is omitted.
    pub fn render_default(&self) -> Option<String> {
        if self.init.is_empty() || self.kind == ParamKind::Password {
            return None;
        }
        Some(self.render_text(&self.init))
    }

    fn render_text(&self, text: &str) -> String {
        match self.kind {
            ParamKind::String | ParamKind::Password | ParamKind::Dropdown { .. } => quoted(text),
            ParamKind::Int => parse_int(text).to_string(),
            ParamKind::Float => format_float(parse_float(text)),
            ParamKind::Bool => (parse_int(text) != 0).to_string(),
        }
    }
}
