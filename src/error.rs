use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::domain::ExecutionRequest;

/// Why a submission was refused before anything was spawned. These are user
/// defects and surface as a `CompileError` outcome with the reason in the
/// captured stderr, not as infrastructure faults.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    #[error("submission contains no source files")]
    NoFiles,

    #[error("invalid source file name: {0:?}")]
    InvalidFileName(String),

    #[error("invalid entry point: {0:?}")]
    InvalidEntryPoint(String),
}

/// Infrastructure faults inside the sandbox machinery. These never escape
/// `execute` as an `Err`; the harness folds them into an `InternalError`
/// outcome (after one retry with a fresh sandbox).
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to create sandbox scope under {}: {source}", path.display())]
    CreateScope { path: PathBuf, source: io::Error },

    #[error("failed to materialize {name}: {source}")]
    Materialize { name: String, source: io::Error },

    #[error("isolation setup failed: {0}")]
    Isolation(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("failed while capturing child output: {0}")]
    Capture(String),

    #[error("resource governor failure: {0}")]
    Governor(String),

    #[error("failed to remove sandbox scope {}: {source}", path.display())]
    Teardown { path: PathBuf, source: io::Error },

    #[error("executor is shutting down")]
    Shutdown,
}

/// Returned by `try_execute` when every sandbox slot is busy. Carries the
/// request back so the caller can queue or retry it without rebuilding.
#[derive(Debug, Error)]
#[error("all sandbox slots are busy")]
pub struct Rejected {
    pub request: ExecutionRequest,
}
