use std::ffi::OsString;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{Notify, Semaphore, TryAcquireError};

use crate::domain::{CapturedOutput, ExecutionRequest, ExecutionResult, Outcome, ResourceLimits};
use crate::error::{Rejected, SandboxError};
use crate::governor::{default_governor, GovernorScope, ResourceGovernor};
use crate::report::{normalize, RawOutcome, StepReport};
use crate::sandbox::{IsolationSettings, SandboxInstance};
use crate::toolchain::JavaToolchain;

const DEFAULT_MAX_CONCURRENT: usize = 8;
const READ_CHUNK: usize = 8 * 1024;

/// Everything a `JavaBox` needs to know up front. Plain data, build
/// one per executor and hand it over.
#[derive(Clone, Debug)]
pub struct JavaBoxConfig {
    /// Parent directory for per-request sandbox scopes.
    pub scope_root: PathBuf,
    /// Isolation posture shared by every sandbox of this executor.
    pub isolation: IsolationSettings,
    /// Ceilings for the compilation step. Fixed per executor, request
    /// limits only govern the program run.
    pub compile_limits: ResourceLimits,
    /// Where javac and java live.
    pub toolchain: JavaToolchain,
    /// Number of requests allowed in flight at once. Values below one
    /// are treated as one.
    pub max_concurrent: usize,
}

impl Default for JavaBoxConfig {
    fn default() -> Self {
        Self {
            scope_root: std::env::temp_dir().join("javabox"),
            isolation: IsolationSettings::default(),
            compile_limits: ResourceLimits::compile_default(),
            toolchain: JavaToolchain::default(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

impl JavaBoxConfig {
    pub fn with_scope_root(mut self, scope_root: impl Into<PathBuf>) -> Self {
        self.scope_root = scope_root.into();
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationSettings) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_compile_limits(mut self, compile_limits: ResourceLimits) -> Self {
        self.compile_limits = compile_limits;
        self
    }

    pub fn with_toolchain(mut self, toolchain: JavaToolchain) -> Self {
        self.toolchain = toolchain;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }
}

/// The execution harness. Cheap to clone, clones share the sandbox
/// slots and the resource governor.
#[derive(Clone, Debug)]
pub struct JavaBox {
    config: Arc<JavaBoxConfig>,
    governor: Arc<dyn ResourceGovernor>,
    permits: Arc<Semaphore>,
}

impl JavaBox {
    /// Builds a harness with the strongest resource governor the host
    /// supports.
    pub fn new(config: JavaBoxConfig) -> Self {
        Self::with_governor(config, default_governor())
    }

    pub fn with_governor(config: JavaBoxConfig, governor: Arc<dyn ResourceGovernor>) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config: Arc::new(config),
            governor,
            permits,
        }
    }

    /// Runs a request to completion, waiting for a sandbox slot when
    /// all are busy. Never fails: harness faults come back as an
    /// `InternalError` outcome, after one retry in a fresh sandbox.
    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let _permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return shutdown_result(),
        };
        self.execute_with_permit(request).await
    }

    /// Like `execute`, but refuses to queue: when every slot is busy
    /// the request comes back unchanged inside `Rejected`.
    pub async fn try_execute(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult, Rejected> {
        let _permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => return Err(Rejected { request }),
            Err(TryAcquireError::Closed) => return Ok(shutdown_result()),
        };
        Ok(self.execute_with_permit(request).await)
    }

    async fn execute_with_permit(&self, request: ExecutionRequest) -> ExecutionResult {
        let first = self.attempt(&request).await;
        if first.outcome != Outcome::InternalError {
            return first;
        }
        tracing::warn!(
            message = "internal fault, retrying once in a fresh sandbox",
            request = %request.id,
            fault = %first.stderr.text(),
        );
        self.attempt(&request).await
    }

    /// One full pass: validate, create a sandbox, compile and run,
    /// tear down, classify. Teardown failures are logged and never
    /// change the result.
    #[tracing::instrument(skip_all, fields(request = %request.id))]
    async fn attempt(&self, request: &ExecutionRequest) -> ExecutionResult {
        let started_at = Utc::now();
        let clock = tokio::time::Instant::now();

        if let Err(error) = request.submission.validate() {
            return normalize(RawOutcome::Invalid { error }, started_at, clock.elapsed());
        }

        let scope_root = request
            .scope_root
            .as_deref()
            .unwrap_or(&self.config.scope_root);
        let instance = match SandboxInstance::create(scope_root, self.config.isolation).await {
            Ok(instance) => instance,
            Err(error) => {
                tracing::error!(message = "failed to create sandbox", %error);
                return normalize(RawOutcome::Fault { error }, started_at, clock.elapsed());
            }
        };

        let raw = match self.drive(&instance, request).await {
            Ok(raw) => raw,
            Err(error) => {
                tracing::error!(message = "execution pipeline fault", %error);
                RawOutcome::Fault { error }
            }
        };

        if let Err(error) = instance.destroy().await {
            tracing::error!(message = "sandbox teardown failed", %error);
        }

        normalize(raw, started_at, clock.elapsed())
    }

    async fn drive(
        &self,
        instance: &SandboxInstance,
        request: &ExecutionRequest,
    ) -> Result<RawOutcome, SandboxError> {
        instance.materialize(&request.submission).await?;

        let (program, args) = self.config.toolchain.compile_command(&request.submission);
        let label = format!("{}-compile", instance.id());
        let compile = self
            .run_step(
                instance,
                &label,
                &program,
                &args,
                &self.config.compile_limits,
                &[],
            )
            .await?;
        if !compile.clean_exit() {
            return Ok(RawOutcome::CompileOnly { compile });
        }

        let (program, args) = self
            .config
            .toolchain
            .run_command(&request.submission.entry_point);
        let label = format!("{}-run", instance.id());
        let run = self
            .run_step(instance, &label, &program, &args, &request.limits, &request.stdin)
            .await?;
        Ok(RawOutcome::Full { compile, run })
    }

    /// Spawns one governed process in the scope and watches it until
    /// it exits or a ceiling kills it.
    #[tracing::instrument(skip_all, fields(%label))]
    async fn run_step(
        &self,
        instance: &SandboxInstance,
        label: &str,
        program: &Path,
        args: &[OsString],
        limits: &ResourceLimits,
        stdin: &[u8],
    ) -> Result<StepReport, SandboxError> {
        let scope: Box<dyn GovernorScope> = self.governor.open(label, limits).await?;

        let mut command = instance.command(program, args, &scope.child_rlimits());
        if !stdin.is_empty() {
            command.stdin(Stdio::piped());
        }
        let mut child = command.spawn().map_err(|source| SandboxError::Spawn {
            program: program.display().to_string(),
            source,
        })?;
        let pid = child
            .id()
            .ok_or_else(|| SandboxError::Capture("child pid unavailable".to_string()))?;
        instance.adopt_group(pid);
        if let Err(error) = scope.attach(pid).await {
            // The group kill can miss a child still short of its
            // setsid, the direct kill cannot.
            instance.kill_group();
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(error);
        }

        let overflow = Arc::new(Notify::new());
        let stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Capture("child stdout missing".to_string()))?;
        let stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| SandboxError::Capture("child stderr missing".to_string()))?;
        let cap = limits.max_output_bytes;
        let stdout_task = tokio::spawn(read_capped(stdout_pipe, cap, Arc::clone(&overflow)));
        let stderr_task = tokio::spawn(read_capped(stderr_pipe, cap, Arc::clone(&overflow)));

        if let Some(mut writer) = child.stdin.take() {
            let bytes = stdin.to_vec();
            tokio::spawn(async move {
                // The child may exit without draining, that is its call.
                let _ = writer.write_all(&bytes).await;
                let _ = writer.shutdown().await;
            });
        }

        // Keeps the deadline arithmetic in range for absurd limits.
        let wall_time = limits.wall_time.min(Duration::from_secs(86_400));
        let deadline = tokio::time::Instant::now() + wall_time;
        let mut timed_out = false;
        let mut overflowed = false;
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                _ = tokio::time::sleep_until(deadline), if !timed_out && !overflowed => {
                    timed_out = true;
                    tracing::debug!("wall clock exceeded, killing process group");
                    instance.kill_group();
                    let _ = child.start_kill();
                }
                _ = overflow.notified(), if !timed_out && !overflowed => {
                    overflowed = true;
                    tracing::debug!("output ceiling breached, killing process group");
                    instance.kill_group();
                    let _ = child.start_kill();
                }
            }
        };
        let status =
            status.map_err(|source| SandboxError::Capture(format!("wait failed: {source}")))?;

        let (stdout, stderr) = futures::future::join(stdout_task, stderr_task).await;
        let stdout = stdout.map_err(|error| SandboxError::Capture(error.to_string()))?;
        let stderr = stderr.map_err(|error| SandboxError::Capture(error.to_string()))?;

        let memory_breached = scope.memory_breached();
        let peak_memory_bytes = scope.peak_memory_bytes();
        scope.close();

        let output_overflow = overflowed || stdout.truncated || stderr.truncated;
        Ok(StepReport {
            status: status.code(),
            signal: status.signal(),
            stdout,
            stderr,
            timed_out,
            output_overflow,
            memory_breached,
            memory_limited: limits.memory_bytes > 0,
            peak_memory_bytes,
        })
    }
}

fn shutdown_result() -> ExecutionResult {
    normalize(
        RawOutcome::Fault {
            error: SandboxError::Shutdown,
        },
        Utc::now(),
        Duration::ZERO,
    )
}

/// Reads a stream until EOF or until `cap` bytes are kept. On breach
/// the reader keeps what fits, flags truncation and pings `overflow`
/// so the step can kill the producer. Hitting the cap exactly at EOF
/// is not a breach.
async fn read_capped<R>(mut reader: R, cap: u64, overflow: Arc<Notify>) -> CapturedOutput
where
    R: AsyncRead + Unpin,
{
    let mut bytes = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            // A dying producer reads as EOF, anything else ends capture.
            Err(_) => break,
        };
        let room = cap.saturating_sub(bytes.len() as u64);
        if (n as u64) > room {
            bytes.extend_from_slice(&chunk[..room as usize]);
            overflow.notify_one();
            return CapturedOutput {
                bytes,
                truncated: true,
            };
        }
        bytes.extend_from_slice(&chunk[..n]);
    }
    CapturedOutput {
        bytes,
        truncated: false,
    }
}
