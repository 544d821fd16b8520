#![allow(missing_docs)]

//! Storyloom CLI — seed, validate, and render prompt template bundles.
//!
//! One-shot subcommands over the library: `init` writes the starter bundle,
//! `validate` runs the full static check batch, `render` assembles a
//! context from `--set` assignments and renders one template pair.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use storyloom::assembler::Assembler;
use storyloom::bundle::Bundle;
use storyloom::catalog::Catalog;
use storyloom::config::{self, ResolverConfig};
use storyloom::validator::Validator;
use storyloom::value::{TypedValue, ValueType};

#[derive(Parser)]
#[command(
    name = "storyloom",
    version,
    about = "Prompt template resolution for AI-assisted story writing"
)]
struct Cli {
    /// Path to resolver.toml (default: ~/.storyloom/resolver.toml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the seeded starter bundle to a file.
    Init {
        /// Output path for the bundle document.
        #[arg(long, default_value = "bundle.json")]
        out: PathBuf,
    },
    /// Statically validate a bundle document, reporting every error.
    Validate {
        /// Bundle document to check.
        bundle: PathBuf,
    },
    /// Render one template from a bundle.
    Render {
        /// Bundle document to render from.
        bundle: PathBuf,

        /// Template id to render.
        #[arg(long)]
        template: String,

        /// Variable assignment, name=value (repeatable).
        #[arg(long = "set", value_name = "NAME=VALUE")]
        sets: Vec<String>,
    },
}

fn main() -> Result<()> {
    storyloom::logging::init();
    let cli = Cli::parse();
    let resolver_config = load_resolver_config(cli.config.as_deref())?;

    match cli.command {
        Command::Init { out } => init_bundle(&out),
        Command::Validate { bundle } => validate_bundle(&bundle, &resolver_config),
        Command::Render {
            bundle,
            template,
            sets,
        } => render_template(&bundle, &template, &sets, &resolver_config),
    }
}

fn load_resolver_config(explicit: Option<&Path>) -> Result<ResolverConfig> {
    if let Some(path) = explicit {
        return config::load_config(path);
    }
    let default_path = config::config_dir()?.join("resolver.toml");
    if default_path.is_file() {
        return config::load_config(&default_path);
    }
    Ok(ResolverConfig::default())
}

fn init_bundle(out: &Path) -> Result<()> {
    let bundle = Bundle::seeded();
    let json = bundle.to_json().context("failed to serialize starter bundle")?;
    std::fs::write(out, json)
        .with_context(|| format!("failed to write bundle to {}", out.display()))?;
    info!(path = %out.display(), "starter bundle written");
    Ok(())
}

fn load_bundle(path: &Path) -> Result<Bundle> {
    let document = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read bundle at {}", path.display()))?;
    Bundle::from_json(&document)
        .with_context(|| format!("failed to load bundle at {}", path.display()))
}

fn validate_bundle(path: &Path, resolver_config: &ResolverConfig) -> Result<()> {
    let bundle = load_bundle(path)?;
    let validator =
        Validator::new().with_suggestion_distance(resolver_config.suggestions.max_distance);
    let report = validator.validate_bundle(&bundle);

    if report.is_valid() {
        println!(
            "bundle '{}' is valid ({} template(s), {} custom variable(s))",
            bundle.name,
            bundle.templates.len(),
            bundle.custom_variables.len()
        );
        return Ok(());
    }

    for error in report.errors() {
        eprintln!("error: {error}");
    }
    bail!(
        "bundle '{}' failed validation with {} error(s)",
        bundle.name,
        report.errors().len()
    );
}

fn render_template(
    path: &Path,
    template_id: &str,
    sets: &[String],
    resolver_config: &ResolverConfig,
) -> Result<()> {
    let bundle = load_bundle(path)?;

    // Never render from a broken bundle; surface the whole batch instead.
    let validator =
        Validator::new().with_suggestion_distance(resolver_config.suggestions.max_distance);
    let report = validator.validate_bundle(&bundle);
    if !report.is_valid() {
        for error in report.errors() {
            eprintln!("error: {error}");
        }
        bail!("bundle '{}' failed validation; not rendering", bundle.name);
    }

    let catalog = Catalog::build(&bundle.custom_variables)?;
    let values: Vec<(String, TypedValue)> = sets
        .iter()
        .map(|raw| parse_assignment(&catalog, raw))
        .collect::<Result<_>>()?;

    let mut assembler = Assembler::with_fuel(Arc::new(bundle), resolver_config.evaluation.fuel)?;
    assembler.merge(values)?;
    let pair = assembler.evaluate(template_id)?;

    println!("--- primary ---");
    println!("{}", pair.primary);
    println!("--- secondary ---");
    println!("{}", pair.secondary);
    Ok(())
}

/// Parse a `name=value` assignment, typing the value by its descriptor.
///
/// Undeclared names are passed through as text; the assembler keeps them as
/// inert data.
fn parse_assignment(catalog: &Catalog, raw: &str) -> Result<(String, TypedValue)> {
    let Some((name, value)) = raw.split_once('=') else {
        bail!("assignment '{raw}' is not of the form name=value");
    };

    let typed = match catalog.describe(name).map(|d| d.value_type) {
        Some(ValueType::Number) => TypedValue::Number(
            value
                .parse::<f64>()
                .with_context(|| format!("'{name}' expects a number, got '{value}'"))?,
        ),
        Some(ValueType::Boolean) => match value {
            "true" => TypedValue::Boolean(true),
            "false" => TypedValue::Boolean(false),
            other => bail!("'{name}' expects true or false, got '{other}'"),
        },
        // Enum values go in as text; the merge boundary checks the options.
        Some(ValueType::Text | ValueType::Enum) | None => TypedValue::Text(value.to_owned()),
    };

    Ok((name.to_owned(), typed))
}
