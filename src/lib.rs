//! Storyloom — prompt template resolution for AI-assisted story writing.
//!
//! Resolves textual prompt templates against a single flat variable
//! namespace before they reach a language model: a sandboxed evaluator, a
//! variable catalog with three origins (derived, supplied, custom), static
//! validation (unknown references, syntax, default cycles), and a
//! per-invocation context assembler producing matched primary/secondary
//! render pairs.
//!
//! See `DESIGN.md` for architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod assembler;
pub mod bundle;
pub mod catalog;
pub mod config;
pub mod evaluator;
pub mod logging;
pub mod validator;
pub mod value;
