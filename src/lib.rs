//! Sandboxed execution of untrusted Java source.
//!
//! `javabox` compiles and runs a [`Submission`] inside a throwaway,
//! resource-governed sandbox and reports what happened as plain data.
//! The harness never bubbles faults to the caller: every request ends
//! in an [`ExecutionResult`] carrying one of six [`Outcome`]s, with
//! whatever the program wrote on stdout and stderr.
//!
//! ```no_run
//! use javabox::{ExecutionRequest, JavaBox, JavaBoxConfig, Submission};
//!
//! #[tokio::main]
//! async fn main() {
//!     let executor = JavaBox::new(JavaBoxConfig::default());
//!     let submission = Submission::java(
//!         r#"
//!         public class Main {
//!             public static void main(String[] args) {
//!                 System.out.println("hello");
//!             }
//!         }
//!         "#,
//!     );
//!     let result = executor.execute(ExecutionRequest::new(submission)).await;
//!     println!("{:?}: {}", result.outcome, result.stdout.text());
//! }
//! ```
//!
//! Isolation is layered. Every request gets a private scope directory
//! that is removed afterwards, its own session and process group, a
//! scrubbed environment, an unshared network namespace and a fixed
//! non-root identity. Wall clock, memory and output ceilings are
//! enforced by a [`ResourceGovernor`]: kernel cgroups where the host
//! allows it, an rlimit plus procfs watchdog fallback everywhere else.
//! Identity drop and network unsharing need privileges; by default
//! their failure is tolerated so the harness stays usable on plain
//! developer machines, [`IsolationSettings::strict`] makes it fatal.

mod domain;
mod error;
mod executor;
mod governor;
mod report;
mod sandbox;
mod toolchain;

pub use domain::{
    CapturedOutput, ExecutionRequest, ExecutionResult, Language, Outcome, ResourceLimits,
    SourceFile, Submission, DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_MEMORY_BYTES, DEFAULT_WALL_TIME,
};
pub use error::{Rejected, SandboxError, SubmissionError};
pub use executor::{JavaBox, JavaBoxConfig};
pub use governor::{
    default_governor, CgroupGovernor, GovernorScope, ResourceGovernor, RlimitGovernor, RlimitRule,
};
pub use sandbox::{IsolationSettings, SandboxIdentity, SandboxInstance};
pub use toolchain::{public_class_name, JavaToolchain};
