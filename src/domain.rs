use std::borrow::Cow;
use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use crate::error::SubmissionError;
use crate::toolchain::public_class_name;

pub const DEFAULT_WALL_TIME: Duration = Duration::from_millis(10_000);
pub const DEFAULT_MEMORY_BYTES: u64 = 128 * 1024 * 1024;
pub const DEFAULT_MAX_OUTPUT_BYTES: u64 = 10_000;

const COMPILE_WALL_TIME: Duration = Duration::from_millis(10_000);
const COMPILE_MEMORY_BYTES: u64 = 1024 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Language {
    Java,
}

#[derive(Clone, Debug)]
pub struct SourceFile {
    pub name: String,
    pub contents: String,
}

/// Untrusted source code plus the metadata needed to compile and start it.
/// Immutable once accepted; owned by exactly one `execute` invocation.
#[derive(Clone, Debug)]
pub struct Submission {
    pub language: Language,
    pub entry_point: String,
    pub files: Vec<SourceFile>,
}

impl Submission {
    /// Single-file Java submission. The file is named after the first
    /// `public class` declaration in the source, falling back to `Main`.
    pub fn java(source: impl Into<String>) -> Self {
        let source = source.into();
        let entry = public_class_name(&source).unwrap_or_else(|| "Main".to_string());
        Submission {
            language: Language::Java,
            files: vec![SourceFile {
                name: format!("{entry}.java"),
                contents: source,
            }],
            entry_point: entry,
        }
    }

    pub fn with_file(mut self, name: impl Into<String>, contents: impl Into<String>) -> Self {
        self.files.push(SourceFile {
            name: name.into(),
            contents: contents.into(),
        });
        self
    }

    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = entry_point.into();
        self
    }

    pub fn validate(&self) -> Result<(), SubmissionError> {
        if self.files.is_empty() {
            return Err(SubmissionError::NoFiles);
        }
        for file in &self.files {
            if !valid_file_name(&file.name) {
                return Err(SubmissionError::InvalidFileName(file.name.clone()));
            }
        }
        if !valid_entry_point(&self.entry_point) {
            return Err(SubmissionError::InvalidEntryPoint(self.entry_point.clone()));
        }
        Ok(())
    }
}

/// A materialized file must stay a single path component inside the scope;
/// a leading dash would be parsed as a compiler flag.
fn valid_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.starts_with('-')
        && !name.contains(['/', '\\', '\0'])
}

fn valid_entry_point(entry: &str) -> bool {
    !entry.is_empty()
        && entry.split('.').all(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
                _ => return false,
            }
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        })
}

/// Ceilings enforced by the resource governor for one step.
/// `memory_bytes == 0` disables the memory ceiling.
#[derive(Clone, Debug)]
pub struct ResourceLimits {
    pub wall_time: Duration,
    pub memory_bytes: u64,
    pub max_output_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        ResourceLimits {
            wall_time: DEFAULT_WALL_TIME,
            memory_bytes: DEFAULT_MEMORY_BYTES,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

impl ResourceLimits {
    /// Limits for the compile step. Fixed per harness rather than taken from
    /// the request, so a submission cannot grant itself a laxer compiler.
    pub fn compile_default() -> Self {
        ResourceLimits {
            wall_time: COMPILE_WALL_TIME,
            memory_bytes: COMPILE_MEMORY_BYTES,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn with_wall_time(mut self, wall_time: Duration) -> Self {
        self.wall_time = wall_time;
        self
    }

    pub fn with_memory_bytes(mut self, memory_bytes: u64) -> Self {
        self.memory_bytes = memory_bytes;
        self
    }

    pub fn with_max_output_bytes(mut self, max_output_bytes: u64) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }
}

/// One execution request: a submission plus its per-request configuration.
/// Created per call, owned by the harness, never shared across requests.
#[derive(Debug)]
pub struct ExecutionRequest {
    pub id: Uuid,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub submission: Submission,
    pub limits: ResourceLimits,
    pub stdin: Vec<u8>,
    pub scope_root: Option<PathBuf>,
}

impl ExecutionRequest {
    pub fn new(submission: Submission) -> Self {
        ExecutionRequest {
            id: Uuid::new_v4(),
            created_at: chrono::Utc::now(),
            submission,
            limits: ResourceLimits::default(),
            stdin: Vec::new(),
            scope_root: None,
        }
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = stdin.into();
        self
    }

    pub fn with_scope_root(mut self, scope_root: impl Into<PathBuf>) -> Self {
        self.scope_root = Some(scope_root.into());
        self
    }
}

/// One captured stream. Bytes, not strings: stderr must round-trip
/// byte-for-byte even when the program emits invalid UTF-8.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

impl CapturedOutput {
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success,
    CompileError,
    RuntimeError,
    Timeout,
    ResourceExceeded,
    InternalError,
}

/// The single result produced for a request. Streams are always
/// populated: empty, not absent, when a step wrote nothing.
#[derive(Clone, Debug)]
pub struct ExecutionResult {
    pub outcome: Outcome,
    pub exit_code: Option<i32>,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub elapsed: Duration,
    pub peak_memory_bytes: Option<u64>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}
