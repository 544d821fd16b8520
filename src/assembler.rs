//! Per-invocation context assembly and paired template evaluation.
//!
//! An [`Assembler`] starts from derived values (seeded from the clock at
//! construction), accepts incremental merges of supplied values from the
//! calling service, resolves custom-variable defaults once in dependency
//! order, and renders one named template's primary and secondary bodies
//! against a single context snapshot.
//!
//! Each instance is single-owner: `merge` mutates internal map state with no
//! locking, so concurrent use of one instance needs external
//! synchronization. Independent assemblers share nothing mutable — the
//! bundle is captured as an `Arc` at construction and a later bundle swap
//! elsewhere never affects an in-flight instance.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Datelike, Local};
use thiserror::Error;
use tracing::{debug, warn};

use crate::bundle::Bundle;
use crate::catalog::{Catalog, CatalogError, Origin, VariableDescriptor};
use crate::evaluator::{EvalError, Evaluator};
use crate::value::{Context, TypedValue, ValueType};

/// Error type for context assembly and evaluation.
#[derive(Debug, Error)]
pub enum AssemblerError {
    /// A required variable ended up with no supplied value and no default.
    #[error("required variable has no value: {0}")]
    MissingRequiredVariable(String),
    /// The requested template id is not in the active bundle.
    #[error("template not found: {0}")]
    TemplateNotFound(String),
    /// A merged value does not match the variable's declared type.
    #[error("type mismatch for '{name}': expected {expected}, got {got}")]
    TypeMismatch {
        /// Variable name.
        name: String,
        /// Declared type.
        expected: ValueType,
        /// Type of the merged value.
        got: ValueType,
    },
    /// A merged enum value is not among the declared options.
    #[error("'{value}' is not a declared option of enum variable '{name}'")]
    InvalidEnumValue {
        /// Variable name.
        name: String,
        /// The rejected value.
        value: String,
    },
    /// Derived variables are computed from running state, never merged.
    #[error("variable is read-only: {0}")]
    ReadOnlyVariable(String),
    /// Template evaluation failed.
    #[error(transparent)]
    Eval(#[from] EvalError),
    /// Catalog construction failed for the bundle.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// The matched pair of rendered outputs for one template.
///
/// Both halves are always rendered against the identical context snapshot;
/// no caller ever renders them separately and risks a skewed pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPair {
    /// Rendered primary body (e.g. the system instruction).
    pub primary: String,
    /// Rendered secondary body (e.g. the user instruction).
    pub secondary: String,
}

/// Per-invocation context assembler. See the module docs for the lifecycle.
#[derive(Debug)]
pub struct Assembler {
    bundle: Arc<Bundle>,
    catalog: Catalog,
    evaluator: Evaluator,
    context: Context,
    /// Merged keys with no catalog entry. Kept for snapshot debugging,
    /// never exposed to templates.
    inert: Context,
    defaults_applied: bool,
}

impl Assembler {
    /// Build an assembler over a captured bundle reference.
    ///
    /// Seeds the derived variables (`currentDate`, `currentTime`,
    /// `currentYear`) from the local clock.
    ///
    /// # Errors
    ///
    /// Fails when the bundle's custom variables cannot form a catalog
    /// (name collision with a built-in, malformed descriptor).
    pub fn new(bundle: Arc<Bundle>) -> Result<Self, CatalogError> {
        Self::with_fuel(bundle, crate::evaluator::DEFAULT_FUEL)
    }

    /// Like [`Assembler::new`] with an explicit evaluation fuel ceiling.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Assembler::new`].
    pub fn with_fuel(bundle: Arc<Bundle>, fuel: u64) -> Result<Self, CatalogError> {
        let catalog = Catalog::build(&bundle.custom_variables)?;

        let mut context = Context::new();
        let now = Local::now();
        context.insert(
            "currentDate",
            TypedValue::Text(now.format("%Y-%m-%d").to_string()),
        );
        context.insert(
            "currentTime",
            TypedValue::Text(now.format("%H:%M").to_string()),
        );
        context.insert("currentYear", TypedValue::Number(f64::from(now.year())));

        Ok(Self {
            bundle,
            catalog,
            evaluator: Evaluator::new(fuel),
            context,
            inert: Context::new(),
            defaults_applied: false,
        })
    }

    /// Merge supplied values into the context, last write winning per key.
    ///
    /// Values are type-checked against their descriptors here, close to the
    /// cause of any mismatch; template-level problems are left to
    /// validation and evaluation. Undeclared keys are accepted as inert
    /// data. The whole batch is checked before any entry is applied, so a
    /// failed merge leaves the context untouched. Chainable:
    /// `asm.merge(a)?.merge(b)?`.
    ///
    /// # Errors
    ///
    /// [`AssemblerError::ReadOnlyVariable`] for derived names,
    /// [`AssemblerError::TypeMismatch`] and
    /// [`AssemblerError::InvalidEnumValue`] for declared-type violations.
    pub fn merge<I, K>(&mut self, values: I) -> Result<&mut Self, AssemblerError>
    where
        I: IntoIterator<Item = (K, TypedValue)>,
        K: Into<String>,
    {
        let mut declared: Vec<(String, TypedValue)> = Vec::new();
        let mut inert: Vec<(String, TypedValue)> = Vec::new();
        for (key, value) in values {
            let name: String = key.into();
            match self.catalog.describe(&name) {
                None => inert.push((name, value)),
                Some(descriptor) => {
                    if descriptor.origin == Origin::Derived {
                        return Err(AssemblerError::ReadOnlyVariable(name));
                    }
                    let checked = check_type(descriptor, value)?;
                    declared.push((name, checked));
                }
            }
        }

        for (name, value) in inert {
            debug!(%name, "merged key is not a declared variable; kept as inert data");
            self.inert.insert(name, value);
        }
        for (name, value) in declared {
            self.context.insert(name, value);
        }
        Ok(self)
    }

    /// Read-only copy of the current context, inert keys included.
    pub fn snapshot(&self) -> Context {
        let mut copy = self.context.clone();
        for (name, value) in self.inert.iter() {
            copy.insert(name, value.clone());
        }
        copy
    }

    /// Render both halves of the template with id `template_id` against one
    /// context snapshot.
    ///
    /// On the first call, custom-variable defaults are resolved in
    /// dependency order; merged values always win over defaults.
    ///
    /// # Errors
    ///
    /// [`AssemblerError::TemplateNotFound`] for an unknown id,
    /// [`AssemblerError::MissingRequiredVariable`] when a required variable
    /// has neither value nor default, and any [`EvalError`] from rendering
    /// — the first failure aborts the call; there are no retries and no
    /// silent empty-string substitutions.
    pub fn evaluate(&mut self, template_id: &str) -> Result<RenderedPair, AssemblerError> {
        if !self.defaults_applied {
            self.resolve_defaults();
            self.defaults_applied = true;
        }

        for descriptor in self.catalog.descriptors() {
            if descriptor.required && !self.context.contains(&descriptor.name) {
                return Err(AssemblerError::MissingRequiredVariable(
                    descriptor.name.clone(),
                ));
            }
        }

        let template = self
            .bundle
            .template(template_id)
            .ok_or_else(|| AssemblerError::TemplateNotFound(template_id.to_owned()))?;

        // One snapshot for both halves.
        let snapshot = self.context.clone();
        let primary = self.evaluator.evaluate(&template.primary_body, &snapshot)?;
        let secondary = self.evaluator.evaluate(&template.secondary_body, &snapshot)?;
        Ok(RenderedPair { primary, secondary })
    }

    /// Fill unset custom variables from their defaults, dependencies first.
    ///
    /// A templated default that references a name still absent from the
    /// context is skipped with a warning; the variable stays unset and
    /// surfaces later as `MissingRequiredVariable` or `UnknownVariable`
    /// only if it is actually needed.
    fn resolve_defaults(&mut self) {
        for name in self.default_order() {
            if self.context.contains(&name) {
                continue;
            }
            let Some(descriptor) = self.catalog.describe(&name) else {
                continue;
            };
            let Some(default) = descriptor.default.clone() else {
                continue;
            };

            if let Some(body) = descriptor.templated_default() {
                match self.evaluator.evaluate(body, &self.context) {
                    Ok(rendered) => self.context.insert(name, TypedValue::Text(rendered)),
                    Err(err) => {
                        warn!(variable = %name, %err, "default could not be expanded; leaving unset");
                    }
                }
                continue;
            }

            // Literal default. Enum defaults deserialize as text; re-tag.
            let literal = match (descriptor.value_type, default) {
                (ValueType::Enum, TypedValue::Text(s) | TypedValue::Enum(s)) => {
                    TypedValue::Enum(s)
                }
                (_, other) => other,
            };
            self.context.insert(name, literal);
        }
    }

    /// Custom names ordered so every templated-default dependency comes
    /// before its dependent. Cyclic bundles never reach this point once
    /// validated; if one does, the visited guard still terminates and the
    /// affected defaults simply fail to expand.
    fn default_order(&self) -> Vec<String> {
        let customs: BTreeSet<&str> = self
            .catalog
            .names_by_origin(Origin::Custom)
            .into_iter()
            .collect();

        let mut order: Vec<String> = Vec::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        for name in &customs {
            self.push_deps_first(name, &customs, &mut seen, &mut order);
        }
        order
    }

    fn push_deps_first(
        &self,
        name: &str,
        customs: &BTreeSet<&str>,
        seen: &mut BTreeSet<String>,
        order: &mut Vec<String>,
    ) {
        if !seen.insert(name.to_owned()) {
            return;
        }
        if let Some(body) = self
            .catalog
            .describe(name)
            .and_then(VariableDescriptor::templated_default)
        {
            if let Ok(referenced) = self.evaluator.referenced_variables(body) {
                for dep in referenced {
                    if customs.contains(dep.as_str()) {
                        self.push_deps_first(&dep, customs, seen, order);
                    }
                }
            }
        }
        order.push(name.to_owned());
    }
}

/// Validate a merged value against its descriptor, re-tagging enum text.
fn check_type(
    descriptor: &VariableDescriptor,
    value: TypedValue,
) -> Result<TypedValue, AssemblerError> {
    match descriptor.value_type {
        ValueType::Enum => match value {
            TypedValue::Text(s) | TypedValue::Enum(s) => {
                if descriptor.enum_options.iter().any(|o| *o == s) {
                    Ok(TypedValue::Enum(s))
                } else {
                    Err(AssemblerError::InvalidEnumValue {
                        name: descriptor.name.clone(),
                        value: s,
                    })
                }
            }
            other => Err(AssemblerError::TypeMismatch {
                name: descriptor.name.clone(),
                expected: ValueType::Enum,
                got: other.value_type(),
            }),
        },
        expected => {
            if value.value_type() == expected {
                Ok(value)
            } else {
                Err(AssemblerError::TypeMismatch {
                    name: descriptor.name.clone(),
                    expected,
                    got: value.value_type(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::TemplateDef;

    fn bundle(templates: Vec<TemplateDef>, customs: Vec<VariableDescriptor>) -> Arc<Bundle> {
        let mut b = Bundle::empty("test", "Test Pack");
        b.templates = templates;
        b.custom_variables = customs;
        Arc::new(b)
    }

    fn text(s: &str) -> TypedValue {
        TypedValue::Text(s.to_owned())
    }

    #[test]
    fn last_write_wins_across_merges() {
        let b = bundle(
            vec![TemplateDef::new("t", "{{ maxWords }}", "{{ maxWords }}")],
            Vec::new(),
        );
        let mut asm = Assembler::new(b).expect("assembler");
        asm.merge([("maxWords", TypedValue::Number(1.0))])
            .expect("merge")
            .merge([("maxWords", TypedValue::Number(2.0))])
            .expect("merge");
        let pair = asm.evaluate("t").expect("render");
        assert_eq!(pair.primary, "2");
    }

    #[test]
    fn paired_render_sees_one_snapshot() {
        let b = bundle(
            vec![TemplateDef::new("t", "{{ storyTitle }}", "{{ storyTitle }}")],
            Vec::new(),
        );
        let mut asm = Assembler::new(b).expect("assembler");
        asm.merge([("storyTitle", text("Ash"))]).expect("merge");
        let pair = asm.evaluate("t").expect("render");
        assert_eq!(pair.primary, pair.secondary);
    }

    #[test]
    fn missing_template_fails() {
        let b = bundle(Vec::new(), Vec::new());
        let mut asm = Assembler::new(b).expect("assembler");
        let err = asm.evaluate("nope").expect_err("fail");
        assert!(matches!(err, AssemblerError::TemplateNotFound(id) if id == "nope"));
    }

    #[test]
    fn required_without_value_or_default_fails() {
        let b = bundle(
            vec![TemplateDef::new("t", "x", "y")],
            vec![VariableDescriptor::new("styleNotes", Origin::Custom, ValueType::Text).required()],
        );
        let mut asm = Assembler::new(b).expect("assembler");
        let err = asm.evaluate("t").expect_err("fail");
        assert!(
            matches!(err, AssemblerError::MissingRequiredVariable(name) if name == "styleNotes")
        );
    }

    #[test]
    fn required_satisfied_by_default() {
        let b = bundle(
            vec![TemplateDef::new("t", "{{ styleNotes }}", "ok")],
            vec![VariableDescriptor::new("styleNotes", Origin::Custom, ValueType::Text)
                .with_default(text("vivid prose"))
                .required()],
        );
        let mut asm = Assembler::new(b).expect("assembler");
        let pair = asm.evaluate("t").expect("render");
        assert_eq!(pair.primary, "vivid prose");
    }

    #[test]
    fn merged_value_beats_default() {
        let b = bundle(
            vec![TemplateDef::new("t", "{{ styleNotes }}", "ok")],
            vec![VariableDescriptor::new("styleNotes", Origin::Custom, ValueType::Text)
                .with_default(text("default prose"))],
        );
        let mut asm = Assembler::new(b).expect("assembler");
        asm.merge([("styleNotes", text("terse prose"))]).expect("merge");
        let pair = asm.evaluate("t").expect("render");
        assert_eq!(pair.primary, "terse prose");
    }

    #[test]
    fn templated_default_expands_against_context() {
        let b = bundle(
            vec![TemplateDef::new("t", "{{ greeting }}", "ok")],
            vec![VariableDescriptor::new("greeting", Origin::Custom, ValueType::Text)
                .with_default(text("Dear {{ protagonistName }}"))],
        );
        let mut asm = Assembler::new(b).expect("assembler");
        asm.merge([("protagonistName", text("Mira"))]).expect("merge");
        let pair = asm.evaluate("t").expect("render");
        assert_eq!(pair.primary, "Dear Mira");
    }

    #[test]
    fn default_chain_resolves_in_dependency_order() {
        let b = bundle(
            vec![TemplateDef::new("t", "{{ outer }}", "ok")],
            vec![
                VariableDescriptor::new("outer", Origin::Custom, ValueType::Text)
                    .with_default(text("[{{ inner }}]")),
                VariableDescriptor::new("inner", Origin::Custom, ValueType::Text)
                    .with_default(text("core")),
            ],
        );
        let mut asm = Assembler::new(b).expect("assembler");
        let pair = asm.evaluate("t").expect("render");
        assert_eq!(pair.primary, "[core]");
    }

    #[test]
    fn unexpandable_default_left_unset() {
        // greeting's default needs protagonistName, which was never merged.
        let b = bundle(
            vec![TemplateDef::new("t", "no greeting here", "ok")],
            vec![VariableDescriptor::new("greeting", Origin::Custom, ValueType::Text)
                .with_default(text("Dear {{ protagonistName }}"))],
        );
        let mut asm = Assembler::new(b).expect("assembler");
        // Template doesn't reference greeting, so evaluation succeeds.
        let pair = asm.evaluate("t").expect("render");
        assert_eq!(pair.primary, "no greeting here");
        assert!(!asm.snapshot().contains("greeting"));
    }

    #[test]
    fn type_mismatch_rejected_at_merge() {
        let b = bundle(Vec::new(), Vec::new());
        let mut asm = Assembler::new(b).expect("assembler");
        let err = asm
            .merge([("maxWords", TypedValue::Boolean(true))])
            .expect_err("fail");
        assert!(matches!(
            err,
            AssemblerError::TypeMismatch { name, expected: ValueType::Number, got: ValueType::Boolean }
                if name == "maxWords"
        ));
    }

    #[test]
    fn failed_merge_leaves_context_untouched() {
        let b = bundle(Vec::new(), Vec::new());
        let mut asm = Assembler::new(b).expect("assembler");
        let err = asm
            .merge([
                ("storyTitle", text("Ash")),
                ("maxWords", TypedValue::Boolean(true)),
            ])
            .expect_err("fail");
        assert!(matches!(err, AssemblerError::TypeMismatch { .. }));
        // The valid entry ahead of the bad one was not applied.
        assert!(!asm.snapshot().contains("storyTitle"));
    }

    #[test]
    fn undeclared_enum_option_rejected_at_merge() {
        let b = bundle(Vec::new(), Vec::new());
        let mut asm = Assembler::new(b).expect("assembler");
        let err = asm.merge([("genre", text("western"))]).expect_err("fail");
        assert!(matches!(
            err,
            AssemblerError::InvalidEnumValue { name, value }
                if name == "genre" && value == "western"
        ));
    }

    #[test]
    fn declared_enum_option_retagged() {
        let b = bundle(Vec::new(), Vec::new());
        let mut asm = Assembler::new(b).expect("assembler");
        asm.merge([("genre", text("fantasy"))]).expect("merge");
        assert_eq!(
            asm.snapshot().get("genre"),
            Some(&TypedValue::Enum("fantasy".to_owned()))
        );
    }

    #[test]
    fn derived_variables_are_read_only() {
        let b = bundle(Vec::new(), Vec::new());
        let mut asm = Assembler::new(b).expect("assembler");
        let err = asm.merge([("currentDate", text("1999-01-01"))]).expect_err("fail");
        assert!(matches!(err, AssemblerError::ReadOnlyVariable(name) if name == "currentDate"));
    }

    #[test]
    fn derived_values_seeded_at_construction() {
        let b = bundle(Vec::new(), Vec::new());
        let asm = Assembler::new(b).expect("assembler");
        let snap = asm.snapshot();
        assert!(snap.contains("currentDate"));
        assert!(snap.contains("currentTime"));
        assert!(snap.contains("currentYear"));
    }

    #[test]
    fn inert_keys_never_reach_templates() {
        let b = bundle(
            vec![TemplateDef::new("t", "{{ mystery }}", "ok")],
            Vec::new(),
        );
        let mut asm = Assembler::new(b).expect("assembler");
        asm.merge([("mystery", text("data"))]).expect("merge");
        // Kept in the snapshot for debugging...
        assert!(asm.snapshot().contains("mystery"));
        // ...but not part of the evaluation namespace.
        let err = asm.evaluate("t").expect_err("fail");
        assert!(matches!(
            err,
            AssemblerError::Eval(EvalError::UnknownVariable(name)) if name == "mystery"
        ));
    }

    #[test]
    fn progressive_merges_refine_later_steps() {
        let b = bundle(
            vec![
                TemplateDef::new("step1", "genre: {{ genre }}", "go"),
                TemplateDef::new("step2", "hero: {{ protagonistName }}", "go"),
            ],
            Vec::new(),
        );
        let mut asm = Assembler::new(b).expect("assembler");

        asm.merge([("genre", text("mystery"))]).expect("merge");
        let first = asm.evaluate("step1").expect("render");
        assert_eq!(first.primary, "genre: mystery");

        // A later step learns the protagonist.
        asm.merge([("protagonistName", text("Vesper"))]).expect("merge");
        let second = asm.evaluate("step2").expect("render");
        assert_eq!(second.primary, "hero: Vesper");
    }
}
