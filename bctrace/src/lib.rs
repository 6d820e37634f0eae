//! The bytecode-to-HIR front end of a tracing JIT.
//!
//! A [Translator] is fed one decoded [bytecode::Op] at a time and emits typed SSA IR into a
//! [hir::Module]: a main trace plus the exit, side-exit, and catch traces that guards, branches,
//! and calls which may throw need.

#![allow(clippy::new_without_default)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::upper_case_acronyms)]

pub mod bytecode;
pub mod config;
pub mod hir;
mod log;
#[cfg(test)]
mod testing;
pub mod translate;
pub mod unit;

pub use self::config::TranslatorConfig;
pub use self::translate::Translator;
use thiserror::Error;

/// A translation error: these are caused by malformed or unsupported inputs rather than by bugs
/// in the translator itself (which `panic`).
#[derive(Debug, Error)]
pub enum TranslationError {
    #[error("General error: {0}")]
    /// An id in the bytecode did not resolve in the [unit::Unit] being translated.
    General(String),
    #[error("Limit exceeded: {0}")]
    /// A limit was exceeded (e.g. more instructions than an [hir::InstIdx] can address).
    LimitExceeded(String),
}
