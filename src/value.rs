//! Typed variable values and the flat evaluation context.
//!
//! Every variable carries a declared [`ValueType`]; concrete values are the
//! tagged [`TypedValue`] variants. Values stay typed until evaluation time,
//! when the evaluator coerces them to text — integral numbers render without
//! a trailing `.0`, so `Number(2.0)` interpolates as `"2"`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Value types
// ---------------------------------------------------------------------------

/// Declared type of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    /// Free-form text.
    Text,
    /// One of a declared ordered set of options.
    Enum,
    /// Floating-point number (integral values render without a fraction).
    Number,
    /// True/false flag.
    Boolean,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Text => "text",
            Self::Enum => "enum",
            Self::Number => "number",
            Self::Boolean => "boolean",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// Typed values
// ---------------------------------------------------------------------------

/// A concrete variable value.
///
/// In interchange documents this serializes untagged: strings, numbers and
/// booleans map directly to their JSON forms. A deserialized string always
/// comes back as [`TypedValue::Text`]; the merge boundary re-tags it as
/// `Enum` when the descriptor declares an enumerated type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypedValue {
    /// A boolean flag.
    Boolean(bool),
    /// A number.
    Number(f64),
    /// Free-form text.
    Text(String),
    /// A selected enum option.
    Enum(String),
}

impl TypedValue {
    /// The [`ValueType`] tag of this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Text(_) => ValueType::Text,
            Self::Enum(_) => ValueType::Enum,
            Self::Number(_) => ValueType::Number,
            Self::Boolean(_) => ValueType::Boolean,
        }
    }

    /// Textual representation used when a value is interpolated.
    ///
    /// Integral numbers drop the fraction (`2.0` → `"2"`); booleans render
    /// as `"true"`/`"false"`.
    pub fn render(&self) -> String {
        match self {
            Self::Text(s) | Self::Enum(s) => s.clone(),
            Self::Number(n) => render_number(*n),
            Self::Boolean(b) => b.to_string(),
        }
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Render a number the way a template author expects: integral values
/// without a trailing `.0`.
pub(crate) fn render_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 {
        format!("{n:.0}")
    } else {
        n.to_string()
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Flat, per-invocation map of concrete values.
///
/// Mutated exclusively through the assembler's merge operation
/// (last-write-wins per key); the evaluator only reads it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    values: BTreeMap<String, TypedValue>,
}

impl Context {
    /// Create an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a value (last write wins).
    pub fn insert(&mut self, name: impl Into<String>, value: TypedValue) {
        self.values.insert(name.into(), value);
    }

    /// Look up a value by variable name.
    pub fn get(&self, name: &str) -> Option<&TypedValue> {
        self.values.get(name)
    }

    /// Whether a value exists for `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Iterate over entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &TypedValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the context holds no entries.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
