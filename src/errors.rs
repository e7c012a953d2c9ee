//! Error kinds surfaced by every component of the loader.
//!
//! The taxonomy follows the policy table in the design notes: `NotFound`,
//! `Incompatible` and `Conflict` are locally recoverable (particularly during
//! DSU), `ResourceExhausted` is handed back to the caller without retry, and
//! `BadFormat`/`Fatal` are unrecoverable for the image or process respectively.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum LuciError {
    /// ELF header or dynamic section failed validation.
    #[error("bad ELF format in {path:?}: {reason}")]
    BadFormat { path: PathBuf, reason: String },

    /// A symbol or file could not be located.
    #[error("not found: {what}")]
    NotFound { what: String },

    /// A COPY/unique-symbol conflict, or a version mismatch that can't be reconciled.
    #[error("conflict: {reason}")]
    Conflict { reason: String },

    /// mmap/fd allocation failure.
    #[error("resource exhausted: {reason}")]
    ResourceExhausted { reason: String },

    /// DSU compatibility check failed; the candidate version is discarded.
    #[error("incompatible update for {path:?}: {reason}")]
    Incompatible { path: PathBuf, reason: String },

    /// Structural invariant broken, or an initializer aborted. Unrecoverable.
    #[error("fatal: {reason}")]
    Fatal { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ELF parse error: {0}")]
    Goblin(#[from] goblin::error::Error),
}

pub type Result<T> = std::result::Result<T, LuciError>;

impl LuciError {
    /// The log severity that matches this error's kind, per the error design table.
    pub fn log_level(&self) -> log::Level {
        match self {
            LuciError::BadFormat { .. } => log::Level::Error,
            LuciError::NotFound { .. } => log::Level::Debug,
            LuciError::Conflict { .. } => log::Level::Warn,
            LuciError::ResourceExhausted { .. } => log::Level::Error,
            LuciError::Incompatible { .. } => log::Level::Warn,
            LuciError::Fatal { .. } => log::Level::Error,
            LuciError::Io(_) => log::Level::Error,
            LuciError::Goblin(_) => log::Level::Error,
        }
    }
}

/// Accumulates non-fatal issues encountered while still making forward progress.
///
/// Mirrors the soft-error accumulator pattern used for compatibility-check
/// findings: a failed check on one symbol doesn't necessarily abort the whole
/// update, but the caller needs to see what was skipped.
#[derive(Debug, Default)]
pub struct SoftErrorList<E> {
    errors: Vec<E>,
}

impl<E> SoftErrorList<E> {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn push(&mut self, error: E) {
        self.errors.push(error);
    }

    pub fn iter(&self) -> impl Iterator<Item = &E> {
        self.errors.iter()
    }

    pub fn into_vec(self) -> Vec<E> {
        self.errors
    }
}
