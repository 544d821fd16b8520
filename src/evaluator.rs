//! Sandboxed template evaluator.
//!
//! A thin wrapper around a locked-down `minijinja` environment: no default
//! filters, tests, or globals, strict undefined behavior (an unresolved
//! reference is a hard error, never an empty string), auto-escaping off
//! (output is plain prompt text, not HTML), and a per-render fuel ceiling so
//! a hostile template cannot cause unbounded work. Templates can use
//! interpolation, conditional blocks, and a fixed allow-list of text
//! filters; there is no file, network, or host-call capability.

use std::collections::{BTreeMap, BTreeSet};

use minijinja::{Environment, ErrorKind, UndefinedBehavior};
use thiserror::Error;

use crate::value::{render_number, Context, TypedValue};

/// Default per-render fuel ceiling.
///
/// Generously above anything a legitimate prompt template needs, while
/// keeping a runaway template in sub-millisecond territory.
pub const DEFAULT_FUEL: u64 = 50_000;

/// Error type for template evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    /// The template body is not valid template syntax.
    #[error("template syntax error at line {line}: {message}")]
    Syntax {
        /// 1-based source line of the failure (0 when unknown).
        line: usize,
        /// Raw engine message.
        message: String,
    },
    /// The template references a name with no value in the context. Carries
    /// the reference as written, dotted paths included (`storyTitle.x`).
    ///
    /// Validation catches this ahead of time for catalog-declared names, so
    /// a runtime occurrence means a bypassed validation step or a variable
    /// removed after the template was last validated.
    #[error("unknown variable: {0}")]
    UnknownVariable(String),
    /// The engine hit an undefined value the reference scan could not
    /// attribute to a single name. Carries the raw engine message.
    #[error("template used an undefined value: {0}")]
    UndefinedValue(String),
    /// Evaluation hit the fuel ceiling and was aborted.
    #[error("evaluation exceeded its resource ceiling")]
    ResourceExceeded,
}

/// Sandboxed evaluator. Cheap to construct; holds no per-render state, so a
/// single instance is safe to share for concurrent reads.
#[derive(Debug)]
pub struct Evaluator {
    env: Environment<'static>,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new(DEFAULT_FUEL)
    }
}

impl Evaluator {
    /// Build an evaluator with the given fuel ceiling.
    pub fn new(fuel: u64) -> Self {
        let mut env = Environment::empty();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_auto_escape_callback(|_| minijinja::AutoEscape::None);
        env.set_fuel(Some(fuel));
        register_filters(&mut env);
        Self { env }
    }

    /// Render `body` against `context`.
    ///
    /// Pure function of its inputs: identical `(body, context)` pairs always
    /// produce byte-identical output, and nothing outside the returned
    /// string is touched.
    ///
    /// # Errors
    ///
    /// [`EvalError::Syntax`] on malformed bodies, [`EvalError::UnknownVariable`]
    /// for the lexicographically first referenced name missing from the
    /// context, [`EvalError::ResourceExceeded`] when the fuel ceiling is hit,
    /// [`EvalError::UndefinedValue`] when the engine trips on an undefined
    /// value the reference scan could not name.
    pub fn evaluate(&self, body: &str, context: &Context) -> Result<String, EvalError> {
        let template = self
            .env
            .template_from_str(body)
            .map_err(|e| syntax_error(&e))?;

        // Pre-check references so the missing name is reported precisely.
        // Nested tracking keeps a dotted path like `storyTitle.x` intact;
        // the namespace is flat, so any dotted path is unknown by
        // construction. Strict undefined in the engine remains as a
        // backstop.
        let mut referenced: Vec<String> =
            template.undeclared_variables(true).into_iter().collect();
        referenced.sort();
        for name in &referenced {
            if !context.contains(name) {
                return Err(EvalError::UnknownVariable(name.clone()));
            }
        }

        template
            .render(engine_context(context))
            .map_err(|e| match e.kind() {
                ErrorKind::OutOfFuel => EvalError::ResourceExceeded,
                ErrorKind::UndefinedError => EvalError::UndefinedValue(detail_of(&e)),
                _ => syntax_error(&e),
            })
    }

    /// Parse `body` without rendering.
    ///
    /// # Errors
    ///
    /// [`EvalError::Syntax`] when the body is malformed.
    pub fn parse(&self, body: &str) -> Result<(), EvalError> {
        self.parse_raw(body).map(|_| ()).map_err(|e| syntax_error(&e))
    }

    /// Parse `body` and hand back the raw engine error for translation.
    pub(crate) fn parse_raw(&self, body: &str) -> Result<(), minijinja::Error> {
        self.env.template_from_str(body).map(|_| ())
    }

    /// Every variable reference in `body` as written (interpolations and
    /// conditionals alike, dotted paths kept intact), in lexicographic
    /// order.
    ///
    /// # Errors
    ///
    /// [`EvalError::Syntax`] when the body does not parse.
    pub fn referenced_variables(&self, body: &str) -> Result<BTreeSet<String>, EvalError> {
        let template = self
            .env
            .template_from_str(body)
            .map_err(|e| syntax_error(&e))?;
        Ok(template.undeclared_variables(true).into_iter().collect())
    }
}

/// Convert the typed context into the engine's namespace.
///
/// Booleans stay booleans (so conditionals test them naturally); integral
/// numbers become integers (so `{{ maxWords }}` renders `400`, not `400.0`);
/// everything else is passed as text.
fn engine_context(context: &Context) -> BTreeMap<String, serde_json::Value> {
    context
        .iter()
        .map(|(name, value)| {
            let json = match value {
                TypedValue::Text(s) | TypedValue::Enum(s) => serde_json::Value::from(s.clone()),
                TypedValue::Boolean(b) => serde_json::Value::from(*b),
                TypedValue::Number(n) => number_json(*n),
            };
            (name.to_owned(), json)
        })
        .collect()
}

fn number_json(n: f64) -> serde_json::Value {
    if n.is_finite() && n.fract() == 0.0 {
        if let Ok(i) = render_number(n).parse::<i64>() {
            return serde_json::Value::from(i);
        }
    }
    serde_json::Value::from(n)
}

fn syntax_error(err: &minijinja::Error) -> EvalError {
    EvalError::Syntax {
        line: err.line().unwrap_or(0),
        message: detail_of(err),
    }
}

fn detail_of(err: &minijinja::Error) -> String {
    err.detail().map_or_else(|| err.to_string(), str::to_owned)
}

/// Fixed filter allow-list. Text manipulation only.
fn register_filters(env: &mut Environment<'static>) {
    env.add_filter("upper", |s: String| s.to_uppercase());
    env.add_filter("lower", |s: String| s.to_lowercase());
    env.add_filter("trim", |s: String| s.trim().to_owned());
    env.add_filter("title", |s: String| title_case(&s));
    env.add_filter("truncate", |s: String, n: usize| -> String {
        s.chars().take(n).collect()
    });
    env.add_filter("replace", |s: String, from: String, to: String| {
        s.replace(&from, &to)
    });
}

fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut at_word_start = true;
    for ch in s.chars() {
        if ch.is_whitespace() {
            at_word_start = true;
            out.push(ch);
        } else if at_word_start {
            out.extend(ch.to_uppercase());
            at_word_start = false;
        } else {
            out.extend(ch.to_lowercase());
        }
    }
    out
}
