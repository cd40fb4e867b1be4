use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;

use crate::domain::{CapturedOutput, ExecutionResult, Outcome};
use crate::error::{SandboxError, SubmissionError};

/// Everything observed about one finished step, before classification.
#[derive(Clone, Debug, Default)]
pub(crate) struct StepReport {
    pub(crate) status: Option<i32>,
    pub(crate) signal: Option<i32>,
    pub(crate) stdout: CapturedOutput,
    pub(crate) stderr: CapturedOutput,
    pub(crate) timed_out: bool,
    pub(crate) output_overflow: bool,
    pub(crate) memory_breached: bool,
    pub(crate) memory_limited: bool,
    pub(crate) peak_memory_bytes: Option<u64>,
}

impl StepReport {
    /// A step only counts as clean when it exited zero without
    /// tripping any ceiling.
    pub(crate) fn clean_exit(&self) -> bool {
        self.status == Some(0) && !self.timed_out && !self.output_overflow && !self.memory_breached
    }

    /// An unexplained SIGKILL under an active memory ceiling is the
    /// kernel OOM killer. The harness itself only sends SIGKILL for
    /// timeouts and output overflow, and those set their flag first.
    fn oom_killed(&self) -> bool {
        self.signal == Some(Signal::SIGKILL as i32)
            && self.memory_limited
            && !self.timed_out
            && !self.output_overflow
    }
}

/// What the pipeline produced for one request, in raw form.
#[derive(Debug)]
pub(crate) enum RawOutcome {
    /// The harness itself broke, nothing meaningful was observed.
    Fault { error: SandboxError },
    /// The submission never reached a sandbox.
    Invalid { error: SubmissionError },
    /// Compilation did not finish cleanly, the program never ran.
    CompileOnly { compile: StepReport },
    /// Compilation succeeded and the program ran to some end.
    Full { compile: StepReport, run: StepReport },
}

/// Folds a raw pipeline outcome into the caller-facing result. Pure:
/// same raw outcome, same result.
pub(crate) fn normalize(
    raw: RawOutcome,
    started_at: DateTime<Utc>,
    elapsed: Duration,
) -> ExecutionResult {
    let (outcome, step) = match raw {
        RawOutcome::Fault { error } => {
            let stderr = CapturedOutput {
                bytes: error.to_string().into_bytes(),
                truncated: false,
            };
            return ExecutionResult {
                outcome: Outcome::InternalError,
                exit_code: None,
                stdout: CapturedOutput::default(),
                stderr,
                started_at,
                elapsed,
                peak_memory_bytes: None,
            };
        }
        RawOutcome::Invalid { error } => {
            let stderr = CapturedOutput {
                bytes: error.to_string().into_bytes(),
                truncated: false,
            };
            return ExecutionResult {
                outcome: Outcome::CompileError,
                exit_code: None,
                stdout: CapturedOutput::default(),
                stderr,
                started_at,
                elapsed,
                peak_memory_bytes: None,
            };
        }
        RawOutcome::CompileOnly { compile } => (classify_compile(&compile), compile),
        // Only a clean compile may be paired with a run step.
        RawOutcome::Full { compile, run } if compile.clean_exit() => (classify_run(&run), run),
        RawOutcome::Full { compile, .. } => (Outcome::InternalError, compile),
    };
    ExecutionResult {
        outcome,
        exit_code: step.status,
        stdout: step.stdout,
        stderr: step.stderr,
        started_at,
        elapsed,
        peak_memory_bytes: step.peak_memory_bytes,
    }
}

fn classify_compile(compile: &StepReport) -> Outcome {
    if compile.timed_out {
        Outcome::Timeout
    } else if compile.memory_breached || compile.oom_killed() {
        Outcome::ResourceExceeded
    } else if compile.output_overflow {
        Outcome::ResourceExceeded
    } else if compile.status == Some(0) {
        // A clean compile should never be routed here.
        Outcome::InternalError
    } else {
        Outcome::CompileError
    }
}

fn classify_run(run: &StepReport) -> Outcome {
    if run.timed_out {
        Outcome::Timeout
    } else if run.memory_breached || run.oom_killed() {
        Outcome::ResourceExceeded
    } else if run.output_overflow {
        Outcome::ResourceExceeded
    } else if run.status == Some(0) {
        Outcome::Success
    } else {
        Outcome::RuntimeError
    }
}
