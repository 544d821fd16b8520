//! Static validation of templates and bundles against the catalog.
//!
//! Three checks, all message-carrying rather than exception-raising:
//! unknown-variable references (with nearest-match suggestions), syntax
//! errors translated into plain language, and cycles in custom-variable
//! default dependencies. Bundle validation aggregates every error into one
//! batch so a broken bundle can be fixed in a single pass.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::debug;

use crate::bundle::Bundle;
use crate::catalog::{Catalog, Origin, VariableDescriptor};
use crate::evaluator::Evaluator;

/// Maximum edit distance for an unknown-variable suggestion.
pub const DEFAULT_SUGGESTION_DISTANCE: usize = 3;

/// A single validation finding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A referenced name is not declared in the catalog.
    #[error("unknown variable '{name}'{}", .suggestion.as_ref().map(|s| format!(" (did you mean '{s}'?)")).unwrap_or_default())]
    UnknownVariable {
        /// The undeclared name as written in the template.
        name: String,
        /// Closest catalog name within the edit-distance threshold.
        suggestion: Option<String>,
    },
    /// The template body does not parse.
    #[error("syntax error at line {line}, column {column}: {message}")]
    Syntax {
        /// 1-based line of the failure.
        line: usize,
        /// 1-based column of the failure.
        column: usize,
        /// Plain-language description (no parser jargon).
        message: String,
    },
    /// Custom-variable defaults reference each other in a loop.
    #[error("circular reference between variable defaults: {}", .cycle.join(" -> "))]
    CircularReference {
        /// Every variable in the cycle, in traversal order.
        cycle: Vec<String>,
    },
    /// A custom variable name collides with a built-in or another custom.
    #[error("variable name already taken: {name}")]
    NameCollision {
        /// The colliding name.
        name: String,
    },
    /// Two templates in the bundle share an id.
    #[error("duplicate template id: {id}")]
    DuplicateTemplate {
        /// The repeated id.
        id: String,
    },
    /// A custom variable descriptor violates its shape rules.
    #[error("invalid variable '{name}': {reason}")]
    InvalidVariable {
        /// Name of the offending variable.
        name: String,
        /// Plain-language description of the violation.
        reason: String,
    },
}

/// Aggregated outcome of a validation run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    errors: Vec<ValidationError>,
}

impl ValidationReport {
    /// Whether the run found no errors.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// All findings, in discovery order.
    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }

    /// Consume the report, yielding its findings.
    pub fn into_errors(self) -> Vec<ValidationError> {
        self.errors
    }

    fn push(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    fn extend(&mut self, errors: impl IntoIterator<Item = ValidationError>) {
        self.errors.extend(errors);
    }
}

/// Static analyzer over template bodies and custom-variable graphs.
#[derive(Debug)]
pub struct Validator {
    evaluator: Evaluator,
    suggestion_distance: usize,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator {
    /// Validator with default evaluator limits and suggestion threshold.
    pub fn new() -> Self {
        Self {
            evaluator: Evaluator::default(),
            suggestion_distance: DEFAULT_SUGGESTION_DISTANCE,
        }
    }

    /// Override the suggestion edit-distance threshold.
    pub fn with_suggestion_distance(mut self, distance: usize) -> Self {
        self.suggestion_distance = distance;
        self
    }

    /// Statically check one template body against the catalog.
    ///
    /// Never raises on malformed input; a parse failure degrades to a
    /// [`ValidationError::Syntax`] finding with a translated message.
    pub fn validate_template(&self, body: &str, catalog: &Catalog) -> ValidationReport {
        let mut report = ValidationReport::default();
        self.check_body(body, catalog, &mut report);
        report
    }

    /// Validate a whole bundle: every template body (both halves), every
    /// custom descriptor, and the default-dependency cycle check, collecting
    /// all errors rather than stopping at the first.
    pub fn validate_bundle(&self, bundle: &Bundle) -> ValidationReport {
        let mut report = ValidationReport::default();

        // Templates are a set keyed by id, however the bundle was built.
        let mut template_ids: BTreeSet<&str> = BTreeSet::new();
        for template in &bundle.templates {
            if !template_ids.insert(&template.id) {
                report.push(ValidationError::DuplicateTemplate {
                    id: template.id.clone(),
                });
            }
        }

        // Descriptor shape and collision checks, aggregated.
        let builtin_names: BTreeSet<String> = Catalog::build(&[])
            .map(|c| c.all_names().into_iter().map(str::to_owned).collect())
            .unwrap_or_default();
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        let mut usable: Vec<VariableDescriptor> = Vec::new();
        for descriptor in &bundle.custom_variables {
            let mut ok = true;
            if descriptor.origin != Origin::Custom {
                report.push(ValidationError::InvalidVariable {
                    name: descriptor.name.clone(),
                    reason: "bundle variables must have origin 'custom'".to_owned(),
                });
                ok = false;
            }
            if let Err(reason) = descriptor.well_formed() {
                report.push(ValidationError::InvalidVariable {
                    name: descriptor.name.clone(),
                    reason,
                });
                ok = false;
            }
            if builtin_names.contains(&descriptor.name) || !seen.insert(&descriptor.name) {
                report.push(ValidationError::NameCollision {
                    name: descriptor.name.clone(),
                });
                ok = false;
            }
            if ok {
                usable.push(descriptor.clone());
            }
        }

        // Catalog over the usable descriptors; template checks still run
        // against the built-ins if every custom was rejected.
        let catalog = Catalog::build(&usable).unwrap_or_else(|_| {
            Catalog::build(&[]).unwrap_or_else(|_| unreachable!("built-ins are well formed"))
        });

        for template in &bundle.templates {
            self.check_body(&template.primary_body, &catalog, &mut report);
            self.check_body(&template.secondary_body, &catalog, &mut report);
        }

        // Templated defaults are templates too.
        for descriptor in &usable {
            if let Some(body) = descriptor.templated_default() {
                self.check_body(body, &catalog, &mut report);
            }
        }

        report.extend(self.check_cycles(&usable));

        debug!(
            bundle = %bundle.id,
            errors = report.errors().len(),
            "bundle validation finished"
        );
        report
    }

    fn check_body(&self, body: &str, catalog: &Catalog, report: &mut ValidationReport) {
        if let Err(raw) = self.evaluator.parse_raw(body) {
            let line = raw.line().unwrap_or(1);
            let column = raw
                .range()
                .map_or(1, |range| column_at(body, range.start));
            report.push(ValidationError::Syntax {
                line,
                column,
                message: translate_syntax_message(&raw, line),
            });
            return;
        }

        // Body parsed above, so this cannot fail.
        let Ok(referenced) = self.evaluator.referenced_variables(body) else {
            return;
        };
        for name in referenced {
            if catalog.describe(&name).is_none() {
                let suggestion = self.suggest(&name, catalog);
                report.push(ValidationError::UnknownVariable { name, suggestion });
            }
        }
    }

    /// Nearest catalog name within the threshold, ties broken
    /// lexicographically.
    fn suggest(&self, name: &str, catalog: &Catalog) -> Option<String> {
        let mut best: Option<(usize, &str)> = None;
        for candidate in catalog.all_names() {
            let distance = edit_distance(name, candidate);
            if distance > self.suggestion_distance {
                continue;
            }
            let better = match best {
                None => true,
                Some((best_distance, best_name)) => {
                    distance < best_distance
                        || (distance == best_distance && candidate < best_name)
                }
            };
            if better {
                best = Some((distance, candidate));
            }
        }
        best.map(|(_, candidate)| candidate.to_owned())
    }

    /// Directed-cycle check over custom-variable default dependencies.
    ///
    /// Node state (unvisited / in-progress / done) is fresh per run;
    /// defaults can change between runs, so nothing is cached.
    fn check_cycles(&self, customs: &[VariableDescriptor]) -> Vec<ValidationError> {
        // Every custom gets a node; only templated defaults contribute edges,
        // and only edges to other customs matter (built-ins have no defaults
        // to follow, so they can never close a loop).
        let mut edges: BTreeMap<String, BTreeSet<String>> = customs
            .iter()
            .map(|d| (d.name.clone(), BTreeSet::new()))
            .collect();
        for descriptor in customs {
            let Some(body) = descriptor.templated_default() else {
                continue;
            };
            let Ok(referenced) = self.evaluator.referenced_variables(body) else {
                // Unparseable defaults were already reported as syntax errors.
                continue;
            };
            let deps: BTreeSet<String> = referenced
                .into_iter()
                .filter(|r| edges.contains_key(r))
                .collect();
            edges.insert(descriptor.name.clone(), deps);
        }

        let mut state: BTreeMap<String, Color> = BTreeMap::new();
        let mut path: Vec<String> = Vec::new();
        let mut cycles: Vec<Vec<String>> = Vec::new();
        let roots: Vec<String> = edges.keys().cloned().collect();
        for name in roots {
            if !state.contains_key(&name) {
                visit(&name, &edges, &mut state, &mut path, &mut cycles);
            }
        }

        cycles
            .into_iter()
            .map(|cycle| ValidationError::CircularReference { cycle })
            .collect()
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    InProgress,
    Done,
}

fn visit(
    name: &str,
    edges: &BTreeMap<String, BTreeSet<String>>,
    state: &mut BTreeMap<String, Color>,
    path: &mut Vec<String>,
    cycles: &mut Vec<Vec<String>>,
) {
    state.insert(name.to_owned(), Color::InProgress);
    path.push(name.to_owned());

    if let Some(deps) = edges.get(name) {
        for dep in deps {
            match state.get(dep).copied() {
                Some(Color::InProgress) => {
                    // Back edge: the cycle is the path segment from the
                    // first occurrence of `dep` onward, in traversal order.
                    if let Some(start) = path.iter().position(|p| p == dep) {
                        cycles.push(path.get(start..).unwrap_or_default().to_vec());
                    }
                }
                Some(Color::Done) => {}
                None => visit(dep, edges, state, path, cycles),
            }
        }
    }

    path.pop();
    state.insert(name.to_owned(), Color::Done);
}

// ---------------------------------------------------------------------------
// Syntax-message translation
// ---------------------------------------------------------------------------

/// Rewrite an engine parse error into plain language.
fn translate_syntax_message(err: &minijinja::Error, line: usize) -> String {
    let detail = err.detail().unwrap_or("the template could not be parsed");
    let lowered = detail.to_lowercase();

    if lowered.contains("unexpected end of input") || lowered.contains("unexpected end of block") {
        return format!(
            "a block is never closed; add the missing closing end-block (for example \
             `{{% endif %}}`) for the block started near line {line}"
        );
    }
    if lowered.contains("unknown statement") {
        return format!("unrecognized block tag near line {line}; only `if` blocks are supported");
    }
    if lowered.contains("unexpected `}}`") || lowered.contains("unexpected '}'") {
        return format!("a stray closing marker near line {line} has no matching opening `{{{{`");
    }
    format!("the template could not be read near line {line}: {detail}")
}

/// 1-based column of a byte offset within `body`.
fn column_at(body: &str, offset: usize) -> usize {
    let clamped = offset.min(body.len());
    let upto = body.get(..clamped).unwrap_or("");
    let line_start = upto.rfind('\n').map_or(0, |i| i.saturating_add(1));
    upto.get(line_start..)
        .map_or(1, |prefix| prefix.chars().count().saturating_add(1))
}

// ---------------------------------------------------------------------------
// Edit distance
// ---------------------------------------------------------------------------

/// Two-row Levenshtein distance.
fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.iter().enumerate() {
        let mut cur: Vec<usize> = Vec::with_capacity(b.len().saturating_add(1));
        cur.push(i.saturating_add(1));
        for (j, cb) in b.iter().enumerate() {
            let substitution = if ca == cb { 0 } else { 1 };
            let keep = prev.get(j).copied().unwrap_or(usize::MAX).saturating_add(substitution);
            let delete = prev
                .get(j.saturating_add(1))
                .copied()
                .unwrap_or(usize::MAX)
                .saturating_add(1);
            let insert = cur.last().copied().unwrap_or(usize::MAX).saturating_add(1);
            cur.push(keep.min(delete).min(insert));
        }
        prev = cur;
    }
    prev.last().copied().unwrap_or(usize::MAX)
}
