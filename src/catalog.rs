//! Variable catalog — the canonical registry of every variable name the
//! resolver recognizes.
//!
//! Variables come from three origins: *derived* (computed from running
//! state, read-only to callers), *supplied* (pushed in by a calling service
//! per invocation), and *custom* (declared per bundle). The catalog merges
//! the fixed built-in set with the active bundle's custom descriptors and is
//! the single source of truth during a resolution pass: a context key not
//! declared here is inert data, never a variable.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value::{TypedValue, ValueType};

/// Error type for catalog construction.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// A custom variable name collides with a built-in or another custom.
    #[error("variable name already taken: {name}")]
    NameCollision {
        /// The colliding name.
        name: String,
    },
    /// A descriptor violates its own shape rules.
    #[error("invalid variable '{name}': {reason}")]
    InvalidDescriptor {
        /// Name of the offending variable.
        name: String,
        /// Plain-language description of the violation.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Descriptors
// ---------------------------------------------------------------------------

/// Where a variable's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Computed from running state; read-only to callers.
    Derived,
    /// Pushed in by a calling service per invocation.
    Supplied,
    /// Declared per bundle by the user.
    Custom,
}

/// Declaration of a single variable: name, origin, type, and default rule.
///
/// Text defaults may themselves be template strings (`"{{protagonistName}}"`);
/// a marker-free string simply renders as itself. Enum defaults must name one
/// of the declared options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDescriptor {
    /// Unique, stable token identifying the variable.
    pub name: String,
    /// Value origin.
    pub origin: Origin,
    /// Declared type.
    pub value_type: ValueType,
    /// Ordered option set; non-empty exactly when `value_type` is `Enum`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enum_options: Vec<String>,
    /// Default applied when no value was merged. Text defaults are treated
    /// as template strings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<TypedValue>,
    /// Whether evaluation fails when the variable ends up with no value.
    #[serde(default)]
    pub required: bool,
}

impl VariableDescriptor {
    /// Create a descriptor with no options, no default, not required.
    pub fn new(name: impl Into<String>, origin: Origin, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            origin,
            value_type,
            enum_options: Vec::new(),
            default: None,
            required: false,
        }
    }

    /// Declare the enum option set.
    pub fn with_options(mut self, options: &[&str]) -> Self {
        self.enum_options = options.iter().map(|s| (*s).to_owned()).collect();
        self
    }

    /// Attach a default value.
    pub fn with_default(mut self, default: TypedValue) -> Self {
        self.default = Some(default);
        self
    }

    /// Mark the variable required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// The default as a template body.
    ///
    /// Only text-typed defaults run through the evaluator; enum defaults are
    /// literal option names even though they deserialize as strings.
    pub fn templated_default(&self) -> Option<&str> {
        match (self.value_type, &self.default) {
            (ValueType::Text, Some(TypedValue::Text(body))) => Some(body),
            _ => None,
        }
    }

    /// Check the descriptor's internal shape rules.
    ///
    /// # Errors
    ///
    /// Returns a plain-language reason when the shape is violated: enum
    /// types need a non-empty option set and an in-options default; other
    /// types forbid options; literal defaults must match the declared type.
    pub fn well_formed(&self) -> Result<(), String> {
        match self.value_type {
            ValueType::Enum => {
                if self.enum_options.is_empty() {
                    return Err("enum variable declares no options".to_owned());
                }
                if let Some(default) = &self.default {
                    let chosen = match default {
                        TypedValue::Text(s) | TypedValue::Enum(s) => s.as_str(),
                        other => {
                            return Err(format!(
                                "enum default must be one of the options, got a {} value",
                                other.value_type()
                            ))
                        }
                    };
                    if !self.enum_options.iter().any(|o| o == chosen) {
                        return Err(format!("default '{chosen}' is not among the declared options"));
                    }
                }
            }
            other => {
                if !self.enum_options.is_empty() {
                    return Err(format!("{other} variable must not declare enum options"));
                }
                if let Some(default) = &self.default {
                    if default.value_type() != other {
                        return Err(format!(
                            "default is a {} value but the variable is declared {other}",
                            default.value_type()
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Built-in descriptor set
// ---------------------------------------------------------------------------

/// The fixed built-in descriptors (derived + supplied), defined once.
///
/// Calling services must never redeclare these; a custom variable with one
/// of these names fails catalog construction.
pub fn builtin_descriptors() -> Vec<VariableDescriptor> {
    use Origin::{Derived, Supplied};
    use ValueType::{Boolean, Enum, Number, Text};

    vec![
        // Derived — seeded by the assembler from the clock.
        VariableDescriptor::new("currentDate", Derived, Text),
        VariableDescriptor::new("currentTime", Derived, Text),
        VariableDescriptor::new("currentYear", Derived, Number),
        // Supplied — pushed in by calling services as facts become known.
        VariableDescriptor::new("storyTitle", Supplied, Text),
        VariableDescriptor::new("storySummary", Supplied, Text),
        VariableDescriptor::new("recentText", Supplied, Text),
        VariableDescriptor::new("userInstruction", Supplied, Text),
        VariableDescriptor::new("protagonistName", Supplied, Text),
        VariableDescriptor::new("language", Supplied, Text),
        VariableDescriptor::new("genre", Supplied, Enum).with_options(&[
            "fantasy", "scifi", "mystery", "romance", "horror", "literary",
        ]),
        VariableDescriptor::new("maxWords", Supplied, Number),
        VariableDescriptor::new("includeDialogue", Supplied, Boolean),
    ]
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Immutable-per-resolution registry mapping names to descriptors.
///
/// Rebuilt whenever the active bundle changes; read-only during a
/// resolution pass, so it can be shared freely across concurrent
/// assemblers.
#[derive(Debug, Clone)]
pub struct Catalog {
    entries: BTreeMap<String, VariableDescriptor>,
}

impl Catalog {
    /// Merge the built-in descriptor set with a bundle's custom descriptors.
    ///
    /// # Errors
    ///
    /// Fails closed on the first malformed descriptor, non-custom origin in
    /// the custom set, or name collision (a built-in can never be shadowed).
    pub fn build(customs: &[VariableDescriptor]) -> Result<Self, CatalogError> {
        let mut entries = BTreeMap::new();
        for descriptor in builtin_descriptors() {
            entries.insert(descriptor.name.clone(), descriptor);
        }

        for descriptor in customs {
            if descriptor.origin != Origin::Custom {
                return Err(CatalogError::InvalidDescriptor {
                    name: descriptor.name.clone(),
                    reason: "bundle variables must have origin 'custom'".to_owned(),
                });
            }
            descriptor
                .well_formed()
                .map_err(|reason| CatalogError::InvalidDescriptor {
                    name: descriptor.name.clone(),
                    reason,
                })?;
            if entries.contains_key(&descriptor.name) {
                return Err(CatalogError::NameCollision {
                    name: descriptor.name.clone(),
                });
            }
            entries.insert(descriptor.name.clone(), descriptor.clone());
        }

        Ok(Self { entries })
    }

    /// Look up a descriptor by name.
    pub fn describe(&self, name: &str) -> Option<&VariableDescriptor> {
        self.entries.get(name)
    }

    /// Every declared name, in lexicographic order.
    pub fn all_names(&self) -> BTreeSet<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    /// Declared names filtered by origin.
    pub fn names_by_origin(&self, origin: Origin) -> BTreeSet<&str> {
        self.entries
            .values()
            .filter(|d| d.origin == origin)
            .map(|d| d.name.as_str())
            .collect()
    }

    /// Iterate descriptors in name order.
    pub fn descriptors(&self) -> impl Iterator<Item = &VariableDescriptor> {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn custom(name: &str) -> VariableDescriptor {
        VariableDescriptor::new(name, Origin::Custom, ValueType::Text)
    }

    #[test]
    fn builtins_are_registered() {
        let catalog = Catalog::build(&[]).expect("build");
        assert!(catalog.describe("protagonistName").is_some());
        assert!(catalog.describe("currentDate").is_some());
        assert_eq!(
            catalog.describe("genre").expect("genre").value_type,
            ValueType::Enum
        );
    }

    #[test]
    fn custom_cannot_shadow_builtin() {
        let err = Catalog::build(&[custom("protagonistName")]).expect_err("collision");
        assert!(matches!(err, CatalogError::NameCollision { name } if name == "protagonistName"));
    }

    #[test]
    fn duplicate_customs_collide() {
        let err = Catalog::build(&[custom("styleNotes"), custom("styleNotes")])
            .expect_err("collision");
        assert!(matches!(err, CatalogError::NameCollision { .. }));
    }

    #[test]
    fn enum_without_options_is_malformed() {
        let bad = VariableDescriptor::new("mood", Origin::Custom, ValueType::Enum);
        let err = Catalog::build(&[bad]).expect_err("invalid");
        assert!(matches!(err, CatalogError::InvalidDescriptor { .. }));
    }

    #[test]
    fn enum_default_must_be_an_option() {
        let bad = VariableDescriptor::new("mood", Origin::Custom, ValueType::Enum)
            .with_options(&["light", "dark"])
            .with_default(TypedValue::Text("grim".to_owned()));
        assert!(bad.well_formed().is_err());

        let good = VariableDescriptor::new("mood", Origin::Custom, ValueType::Enum)
            .with_options(&["light", "dark"])
            .with_default(TypedValue::Text("dark".to_owned()));
        assert!(good.well_formed().is_ok());
    }

    #[test]
    fn literal_default_type_must_match() {
        let bad = VariableDescriptor::new("limit", Origin::Custom, ValueType::Number)
            .with_default(TypedValue::Boolean(true));
        assert!(bad.well_formed().is_err());
    }

    #[test]
    fn non_custom_origin_rejected_in_bundle_set() {
        let bad = VariableDescriptor::new("sneaky", Origin::Derived, ValueType::Text);
        let err = Catalog::build(&[bad]).expect_err("invalid");
        assert!(matches!(err, CatalogError::InvalidDescriptor { .. }));
    }

    #[test]
    fn names_by_origin_partitions() {
        let catalog = Catalog::build(&[custom("styleNotes")]).expect("build");
        assert!(catalog.names_by_origin(Origin::Derived).contains("currentYear"));
        assert!(catalog.names_by_origin(Origin::Supplied).contains("genre"));
        assert_eq!(
            catalog.names_by_origin(Origin::Custom),
            ["styleNotes"].into_iter().collect()
        );
    }

    #[test]
    fn templated_default_only_for_text() {
        let d = custom("greeting").with_default(TypedValue::Text("Hi {{protagonistName}}".to_owned()));
        assert_eq!(d.templated_default(), Some("Hi {{protagonistName}}"));
        let n = VariableDescriptor::new("limit", Origin::Custom, ValueType::Number)
            .with_default(TypedValue::Number(4.0));
        assert_eq!(n.templated_default(), None);
    }
}
