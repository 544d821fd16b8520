//! Bundle schema, JSON interchange, and the active-bundle store.
//!
//! A bundle is the versioned, importable/exportable unit pairing template
//! texts with custom-variable declarations. This module owns the data
//! contract only — durable storage belongs to an external collaborator. A
//! bundle whose `schemaVersion` is unrecognized is refused, and no bundle
//! becomes active without passing full validation first.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::assembler::Assembler;
use crate::catalog::{CatalogError, Origin, VariableDescriptor};
use crate::validator::{ValidationReport, Validator};
use crate::value::{TypedValue, ValueType};

/// The on-disk shape this build reads and writes.
pub const SCHEMA_VERSION: u32 = 1;

/// Error type for bundle interchange and activation.
#[derive(Debug, Error)]
pub enum BundleError {
    /// The document's `schemaVersion` is not one this build understands.
    #[error("unsupported bundle schema version: {0}")]
    UnsupportedSchema(u32),
    /// The document is not valid JSON for the bundle shape.
    #[error("malformed bundle document: {0}")]
    Malformed(#[from] serde_json::Error),
    /// Two templates share an id.
    #[error("duplicate template id: {0}")]
    DuplicateTemplate(String),
    /// Two custom variables share a name.
    #[error("duplicate variable name: {0}")]
    DuplicateVariable(String),
    /// The bundle failed validation and was not activated.
    #[error("bundle failed validation with {} error(s)", .0.errors().len())]
    Validation(ValidationReport),
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// One template: an id and the two bodies rendered as a pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateDef {
    /// Stable identifier used by calling services.
    pub id: String,
    /// Primary body (typically the system instruction).
    pub primary_body: String,
    /// Secondary body (typically the user instruction).
    pub secondary_body: String,
}

impl TemplateDef {
    /// Create a template definition.
    pub fn new(
        id: impl Into<String>,
        primary_body: impl Into<String>,
        secondary_body: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            primary_body: primary_body.into(),
            secondary_body: secondary_body.into(),
        }
    }
}

/// The versioned unit bundling templates and custom-variable definitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    /// Stable bundle identifier.
    pub id: String,
    /// Human-facing name.
    pub name: String,
    /// On-disk shape version; see [`SCHEMA_VERSION`].
    pub schema_version: u32,
    /// Templates keyed by unique id.
    pub templates: Vec<TemplateDef>,
    /// Custom variable declarations (origin = custom).
    pub custom_variables: Vec<VariableDescriptor>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SchemaProbe {
    schema_version: u32,
}

impl Bundle {
    /// An empty bundle at the current schema version.
    pub fn empty(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            schema_version: SCHEMA_VERSION,
            templates: Vec::new(),
            custom_variables: Vec::new(),
        }
    }

    /// The built-in starter bundle, seeded once on first run.
    pub fn seeded() -> Self {
        let mut bundle = Self::empty("default", "Starter Pack");

        bundle.templates = vec![
            TemplateDef::new(
                "continueStory",
                "You are a co-writer for a {{ genre }} story titled \
                 \"{{ storyTitle }}\".\n{{ styleGuidance }}\n\
                 {% if includeDialogue %}Dialogue is welcome.\n{% endif %}\
                 Keep the continuation under {{ maxWords }} words.",
                "Here is the story so far:\n{{ recentText }}\n\n\
                 Continue the story. {{ userInstruction }}",
            ),
            TemplateDef::new(
                "summarizeChapter",
                "You summarize fiction faithfully: no invented events, no \
                 commentary, present tense.",
                "Summarize the following chapter in a short paragraph:\n\
                 {{ recentText }}",
            ),
            TemplateDef::new(
                "suggestTitles",
                "You are a sharp-eyed book editor suggesting titles for a \
                 {{ genre }} story.",
                "Story summary:\n{{ storySummary }}\n\nSuggest five titles.",
            ),
        ];

        bundle.custom_variables = vec![
            VariableDescriptor::new("styleGuidance", Origin::Custom, ValueType::Text)
                .with_default(TypedValue::Text(
                    "Write in vivid, concrete prose.".to_owned(),
                )),
            VariableDescriptor::new("paragraphLimit", Origin::Custom, ValueType::Number)
                .with_default(TypedValue::Number(4.0)),
        ];

        bundle
    }

    /// Look up a template by id.
    pub fn template(&self, id: &str) -> Option<&TemplateDef> {
        self.templates.iter().find(|t| t.id == id)
    }

    /// Deep-copy this bundle's templates and variables into a new bundle
    /// under a fresh id. Later edits to either bundle are independent.
    pub fn duplicate(&self, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            schema_version: SCHEMA_VERSION,
            templates: self.templates.clone(),
            custom_variables: self.custom_variables.clone(),
        }
    }

    /// Parse a bundle interchange document.
    ///
    /// # Errors
    ///
    /// [`BundleError::UnsupportedSchema`] when `schemaVersion` differs from
    /// this build's (checked before the full parse, so future shapes are
    /// refused rather than misread); [`BundleError::Malformed`] for bad
    /// JSON; duplicate template ids and variable names are rejected.
    pub fn from_json(document: &str) -> Result<Self, BundleError> {
        let probe: SchemaProbe = serde_json::from_str(document)?;
        if probe.schema_version != SCHEMA_VERSION {
            return Err(BundleError::UnsupportedSchema(probe.schema_version));
        }

        let bundle: Self = serde_json::from_str(document)?;

        let mut template_ids = std::collections::BTreeSet::new();
        for template in &bundle.templates {
            if !template_ids.insert(&template.id) {
                return Err(BundleError::DuplicateTemplate(template.id.clone()));
            }
        }
        let mut variable_names = std::collections::BTreeSet::new();
        for descriptor in &bundle.custom_variables {
            if !variable_names.insert(&descriptor.name) {
                return Err(BundleError::DuplicateVariable(descriptor.name.clone()));
            }
        }

        Ok(bundle)
    }

    /// Serialize to the interchange document.
    ///
    /// # Errors
    ///
    /// Serialization failures only (a malformed float, practically).
    pub fn to_json(&self) -> Result<String, BundleError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

// ---------------------------------------------------------------------------
// Active-bundle store
// ---------------------------------------------------------------------------

/// Holder of the process's active bundle, with an explicit, atomic swap.
///
/// Assemblers capture an `Arc` of the bundle at construction; a later
/// [`BundleStore::activate`] never affects an in-flight assembler. The lock
/// guards the pointer only — bundles themselves are immutable once active.
#[derive(Debug)]
pub struct BundleStore {
    active: RwLock<Arc<Bundle>>,
}

impl BundleStore {
    /// Create a store over an initial (already validated) bundle.
    pub fn new(initial: Bundle) -> Self {
        Self {
            active: RwLock::new(Arc::new(initial)),
        }
    }

    /// The currently active bundle.
    pub fn active(&self) -> Arc<Bundle> {
        let guard = self
            .active
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Validate `bundle` and, only if clean, make it the active bundle.
    ///
    /// # Errors
    ///
    /// [`BundleError::Validation`] carrying the full error batch when the
    /// bundle is broken; the previous bundle stays active.
    pub fn activate(&self, bundle: Bundle, validator: &Validator) -> Result<(), BundleError> {
        if bundle.schema_version != SCHEMA_VERSION {
            return Err(BundleError::UnsupportedSchema(bundle.schema_version));
        }
        let report = validator.validate_bundle(&bundle);
        if !report.is_valid() {
            return Err(BundleError::Validation(report));
        }

        let mut guard = self
            .active
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        info!(bundle = %bundle.id, name = %bundle.name, "bundle activated");
        *guard = Arc::new(bundle);
        Ok(())
    }

    /// Construct an assembler over the active bundle.
    ///
    /// # Errors
    ///
    /// Propagates catalog construction failures for the captured bundle.
    pub fn assembler(&self) -> Result<Assembler, CatalogError> {
        Assembler::new(self.active())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_bundle_validates_cleanly() {
        let report = Validator::new().validate_bundle(&Bundle::seeded());
        assert!(report.is_valid(), "{:?}", report.errors());
    }

    #[test]
    fn round_trip_preserves_templates_and_variables() {
        let original = Bundle::seeded();
        let json = original.to_json().expect("export");
        let reimported = Bundle::from_json(&json).expect("import");
        assert_eq!(original.templates, reimported.templates);
        assert_eq!(original.custom_variables, reimported.custom_variables);

        // Same validation outcome either way.
        let validator = Validator::new();
        assert_eq!(
            validator.validate_bundle(&original),
            validator.validate_bundle(&reimported)
        );
    }

    #[test]
    fn unsupported_schema_is_refused() {
        let mut bundle = Bundle::seeded();
        bundle.schema_version = 99;
        let json = bundle.to_json().expect("export");
        let err = Bundle::from_json(&json).expect_err("refuse");
        assert!(matches!(err, BundleError::UnsupportedSchema(99)));
    }

    #[test]
    fn duplicate_template_ids_are_refused() {
        let mut bundle = Bundle::empty("b", "B");
        bundle.templates = vec![
            TemplateDef::new("t", "a", "b"),
            TemplateDef::new("t", "c", "d"),
        ];
        let json = bundle.to_json().expect("export");
        let err = Bundle::from_json(&json).expect_err("refuse");
        assert!(matches!(err, BundleError::DuplicateTemplate(id) if id == "t"));
    }

    #[test]
    fn duplicate_variable_names_are_refused() {
        let mut bundle = Bundle::empty("b", "B");
        bundle.custom_variables = vec![
            VariableDescriptor::new("x", Origin::Custom, ValueType::Text),
            VariableDescriptor::new("x", Origin::Custom, ValueType::Text),
        ];
        let json = bundle.to_json().expect("export");
        let err = Bundle::from_json(&json).expect_err("refuse");
        assert!(matches!(err, BundleError::DuplicateVariable(name) if name == "x"));
    }

    #[test]
    fn duplicate_gets_fresh_id_and_deep_copies() {
        let original = Bundle::seeded();
        let mut copy = original.duplicate("My Pack");
        assert_ne!(copy.id, original.id);
        assert_eq!(copy.templates, original.templates);

        copy.templates.clear();
        assert!(!original.templates.is_empty());
    }

    #[test]
    fn activate_rejects_broken_bundle_and_keeps_previous() {
        let store = BundleStore::new(Bundle::seeded());
        let mut broken = Bundle::empty("broken", "Broken");
        broken.templates = vec![TemplateDef::new("t", "{{ nope }}", "x")];

        let err = store
            .activate(broken, &Validator::new())
            .expect_err("refuse");
        assert!(matches!(err, BundleError::Validation(_)));
        assert_eq!(store.active().id, "default");
    }

    #[test]
    fn activate_rejects_in_process_duplicate_template_ids() {
        // Duplicate ids must be caught even when the bundle never went
        // through the JSON import path.
        let store = BundleStore::new(Bundle::seeded());
        let mut dup = Bundle::empty("dup", "Dup");
        dup.templates = vec![
            TemplateDef::new("t", "first body", "x"),
            TemplateDef::new("t", "second body", "y"),
        ];

        let err = store.activate(dup, &Validator::new()).expect_err("refuse");
        assert!(matches!(err, BundleError::Validation(_)));
        assert_eq!(store.active().id, "default");
    }

    #[test]
    fn swap_leaves_in_flight_assemblers_untouched() {
        let store = BundleStore::new(Bundle::seeded());
        let mut in_flight = store.assembler().expect("assembler");
        in_flight
            .merge([(
                "recentText",
                TypedValue::Text("The lighthouse went dark.".to_owned()),
            )])
            .expect("merge");

        let replacement = Bundle::seeded().duplicate("Second");
        store
            .activate(replacement, &Validator::new())
            .expect("activate");
        assert_ne!(store.active().id, "default");

        // The in-flight assembler still renders from its captured bundle.
        let pair = in_flight.evaluate("summarizeChapter").expect("render");
        assert!(pair.secondary.contains("The lighthouse went dark."));
    }

    #[test]
    fn activate_checks_schema_version() {
        let store = BundleStore::new(Bundle::seeded());
        let mut stale = Bundle::seeded();
        stale.schema_version = 0;
        let err = store.activate(stale, &Validator::new()).expect_err("refuse");
        assert!(matches!(err, BundleError::UnsupportedSchema(0)));
    }
}
