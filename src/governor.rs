use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cgroups_rs::cgroup_builder::CgroupBuilder;
use cgroups_rs::memory::MemController;
use cgroups_rs::pid::PidController;
use cgroups_rs::{Cgroup, CgroupPid, Controller, MaxValue};
use nix::sys::resource::Resource;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::domain::ResourceLimits;
use crate::error::SandboxError;

/// Hard ceiling on the number of processes a single step may hold,
/// enforced through the pids controller when cgroups are in play.
const MAX_TASKS: i64 = 64;

/// Largest file a sandboxed process may create in its scope.
const SCRATCH_BYTES: u64 = 256 * 1024 * 1024;

/// How often the rlimit watchdog samples `/proc/<pid>/status`.
const WATCHDOG_INTERVAL: Duration = Duration::from_millis(20);

/// A single rlimit the sandbox applies in the child after fork.
#[derive(Clone, Copy, Debug)]
pub struct RlimitRule {
    pub resource: Resource,
    pub soft: u64,
    pub hard: u64,
}

/// Rlimits every governed step gets regardless of the enforcement
/// mechanism. The CPU ceiling backs up the wall clock kill: soft fires
/// SIGXCPU, hard fires SIGKILL one second later.
fn base_rlimits(limits: &ResourceLimits) -> Vec<RlimitRule> {
    let cpu_secs = limits.wall_time.as_secs().saturating_add(1);
    vec![
        RlimitRule {
            resource: Resource::RLIMIT_CPU,
            soft: cpu_secs,
            hard: cpu_secs.saturating_add(1),
        },
        RlimitRule {
            resource: Resource::RLIMIT_FSIZE,
            soft: SCRATCH_BYTES,
            hard: SCRATCH_BYTES,
        },
        RlimitRule {
            resource: Resource::RLIMIT_CORE,
            soft: 0,
            hard: 0,
        },
    ]
}

/// Enforces the resource ceilings of a single execution step.
#[mockall::automock]
#[async_trait::async_trait]
pub trait ResourceGovernor: std::fmt::Debug + Send + Sync {
    /// Prepares enforcement for one step. The label names the step in
    /// whatever accounting structure the mechanism keeps.
    async fn open(
        &self,
        label: &str,
        limits: &ResourceLimits,
    ) -> Result<Box<dyn GovernorScope>, SandboxError>;
}

/// Live enforcement handle for one spawned process.
#[async_trait::async_trait]
pub trait GovernorScope: std::fmt::Debug + Send + Sync {
    /// Rlimits the child must install on itself before exec.
    fn child_rlimits(&self) -> Vec<RlimitRule>;

    /// Binds the spawned process to the scope. Must run before the
    /// process is allowed to make progress on untrusted code.
    async fn attach(&self, pid: u32) -> Result<(), SandboxError>;

    /// Whether the memory ceiling was hit at any point.
    fn memory_breached(&self) -> bool;

    /// Highest observed memory footprint, when the mechanism tracks it.
    fn peak_memory_bytes(&self) -> Option<u64>;

    /// Releases accounting state. Safe to call more than once.
    fn close(&self);
}

/// Picks the strongest enforcement mechanism the host offers. Cgroups
/// give hard memory kills; the rlimit fallback polls and reacts.
pub fn default_governor() -> Arc<dyn ResourceGovernor> {
    if CgroupGovernor::available() {
        tracing::debug!("using cgroup resource governor");
        Arc::new(CgroupGovernor::new())
    } else {
        tracing::debug!("cgroup hierarchy not writable, using rlimit governor");
        Arc::new(RlimitGovernor::new())
    }
}

/// Governor backed by a kernel cgroup per step. Memory is limited by
/// the memory controller, process count by the pids controller.
#[derive(Clone, Debug)]
pub struct CgroupGovernor {
    parent: String,
}

impl CgroupGovernor {
    pub fn new() -> Self {
        Self {
            parent: "javabox".to_string(),
        }
    }

    /// True when the memory controller exists and this process may
    /// create cgroups. Probes by building and deleting a throwaway
    /// group, actual permissions vary too much to predict.
    pub fn available() -> bool {
        let hierarchy = cgroups_rs::hierarchies::auto();
        let has_memory = hierarchy
            .subsystems()
            .iter()
            .any(|subsystem| subsystem.controller_name() == "memory");
        if !has_memory {
            return false;
        }
        let probe = format!("javabox-probe-{}", Uuid::new_v4());
        match CgroupBuilder::new(&probe).build(hierarchy) {
            Ok(cgroup) => {
                if let Err(error) = cgroup.delete() {
                    tracing::warn!(message = "failed to delete probe cgroup", %probe, %error);
                }
                true
            }
            Err(_) => false,
        }
    }
}

impl Default for CgroupGovernor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ResourceGovernor for CgroupGovernor {
    async fn open(
        &self,
        label: &str,
        limits: &ResourceLimits,
    ) -> Result<Box<dyn GovernorScope>, SandboxError> {
        let name = format!("{}/{}", self.parent, label);
        let limits = limits.clone();
        let scope = tokio::task::spawn_blocking(move || build_cgroup(&name, &limits))
            .await
            .map_err(|error| SandboxError::Governor(error.to_string()))??;
        Ok(Box::new(scope))
    }
}

fn build_cgroup(name: &str, limits: &ResourceLimits) -> Result<CgroupScope, SandboxError> {
    let hierarchy = cgroups_rs::hierarchies::auto();
    let mut controllers = vec!["pids".to_string()];
    let mut builder = CgroupBuilder::new(name)
        .pid()
        .maximum_number_of_processes(MaxValue::Value(MAX_TASKS))
        .done();
    // Swap gets the same ceiling as memory so the hog cannot spill.
    if limits.memory_bytes > 0 {
        let bytes = limits.memory_bytes as i64;
        builder = builder
            .memory()
            .memory_soft_limit(bytes)
            .memory_hard_limit(bytes)
            .memory_swap_limit(bytes)
            .done();
        controllers.push("memory".to_string());
    }
    let cgroup = builder
        .set_specified_controllers(controllers)
        .build(hierarchy)
        .map_err(|error| SandboxError::Governor(error.to_string()))?;
    if let Some(memory) = cgroup.controller_of::<MemController>() {
        if let Err(error) = memory.reset_max_usage() {
            tracing::warn!(message = "failed to reset cgroup max usage", %name, %error);
        }
    }
    Ok(CgroupScope {
        label: name.to_string(),
        memory_limit: limits.memory_bytes,
        wall_time: limits.wall_time,
        cgroup: Mutex::new(Some(cgroup)),
    })
}

pub struct CgroupScope {
    label: String,
    memory_limit: u64,
    wall_time: Duration,
    cgroup: Mutex<Option<Cgroup>>,
}

impl fmt::Debug for CgroupScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CgroupScope")
            .field("label", &self.label)
            .field("memory_limit", &self.memory_limit)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl GovernorScope for CgroupScope {
    fn child_rlimits(&self) -> Vec<RlimitRule> {
        base_rlimits(&ResourceLimits {
            wall_time: self.wall_time,
            memory_bytes: self.memory_limit,
            max_output_bytes: 0,
        })
    }

    async fn attach(&self, pid: u32) -> Result<(), SandboxError> {
        let task = CgroupPid::from(pid as u64);
        let guard = self
            .cgroup
            .lock()
            .map_err(|_| SandboxError::Governor("cgroup handle poisoned".to_string()))?;
        let cgroup = guard
            .as_ref()
            .ok_or_else(|| SandboxError::Governor("cgroup already closed".to_string()))?;
        if let Some(memory) = cgroup.controller_of::<MemController>() {
            memory
                .add_task(&task)
                .map_err(|error| SandboxError::Governor(error.to_string()))?;
        }
        if let Some(pids) = cgroup.controller_of::<PidController>() {
            pids.add_task(&task)
                .map_err(|error| SandboxError::Governor(error.to_string()))?;
        }
        Ok(())
    }

    fn memory_breached(&self) -> bool {
        if self.memory_limit == 0 {
            return false;
        }
        let Ok(guard) = self.cgroup.lock() else {
            return false;
        };
        let Some(cgroup) = guard.as_ref() else {
            return false;
        };
        match cgroup.controller_of::<MemController>() {
            Some(memory) => memory.memswap().max_usage_in_bytes >= self.memory_limit,
            None => false,
        }
    }

    fn peak_memory_bytes(&self) -> Option<u64> {
        let guard = self.cgroup.lock().ok()?;
        let cgroup = guard.as_ref()?;
        let memory = cgroup.controller_of::<MemController>()?;
        let peak = memory.memswap().max_usage_in_bytes;
        (peak > 0).then_some(peak)
    }

    fn close(&self) {
        let Ok(mut guard) = self.cgroup.lock() else {
            return;
        };
        if let Some(cgroup) = guard.take() {
            if let Err(error) = cgroup.delete() {
                tracing::warn!(message = "failed to delete cgroup", label = %self.label, %error);
            }
        }
    }
}

impl Drop for CgroupScope {
    fn drop(&mut self) {
        self.close();
    }
}

/// Fallback governor for hosts without a writable cgroup hierarchy.
/// Memory is watched from the outside: a task samples the resident set
/// through procfs and kills the process group on breach. Coarser than
/// a kernel limit but needs no privileges.
#[derive(Clone, Debug, Default)]
pub struct RlimitGovernor;

impl RlimitGovernor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl ResourceGovernor for RlimitGovernor {
    async fn open(
        &self,
        label: &str,
        limits: &ResourceLimits,
    ) -> Result<Box<dyn GovernorScope>, SandboxError> {
        Ok(Box::new(RlimitScope {
            label: label.to_string(),
            limits: limits.clone(),
            breached: Arc::new(AtomicBool::new(false)),
            peak: Arc::new(AtomicU64::new(0)),
            watchdog: Mutex::new(None),
        }))
    }
}

pub struct RlimitScope {
    label: String,
    limits: ResourceLimits,
    breached: Arc<AtomicBool>,
    peak: Arc<AtomicU64>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for RlimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RlimitScope")
            .field("label", &self.label)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl GovernorScope for RlimitScope {
    fn child_rlimits(&self) -> Vec<RlimitRule> {
        base_rlimits(&self.limits)
    }

    async fn attach(&self, pid: u32) -> Result<(), SandboxError> {
        let handle = tokio::spawn(watch_memory(
            pid,
            self.limits.memory_bytes,
            Arc::clone(&self.breached),
            Arc::clone(&self.peak),
        ));
        let mut guard = self
            .watchdog
            .lock()
            .map_err(|_| SandboxError::Governor("watchdog handle poisoned".to_string()))?;
        if let Some(previous) = guard.replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    fn memory_breached(&self) -> bool {
        self.breached.load(Ordering::SeqCst)
    }

    fn peak_memory_bytes(&self) -> Option<u64> {
        let peak = self.peak.load(Ordering::SeqCst);
        (peak > 0).then_some(peak)
    }

    fn close(&self) {
        let Ok(mut guard) = self.watchdog.lock() else {
            return;
        };
        if let Some(handle) = guard.take() {
            handle.abort();
        }
    }
}

impl Drop for RlimitScope {
    fn drop(&mut self) {
        self.close();
    }
}

/// Samples the high-water resident set of `pid` until the process
/// exits. When a ceiling is configured and crossed, the whole process
/// group goes down with SIGKILL, mirroring what the kernel would do
/// under a cgroup limit.
async fn watch_memory(pid: u32, memory_limit: u64, breached: Arc<AtomicBool>, peak: Arc<AtomicU64>) {
    let path = format!("/proc/{pid}/status");
    let mut interval = tokio::time::interval(WATCHDOG_INTERVAL);
    loop {
        interval.tick().await;
        let Ok(status) = tokio::fs::read_to_string(&path).await else {
            break;
        };
        let Some(kb) = parse_status_kb(&status, "VmHWM:") else {
            continue;
        };
        let bytes = kb.saturating_mul(1024);
        peak.fetch_max(bytes, Ordering::SeqCst);
        if memory_limit > 0 && bytes >= memory_limit {
            breached.store(true, Ordering::SeqCst);
            tracing::debug!(
                message = "memory ceiling breached, killing process group",
                %pid,
                %bytes,
                limit = %memory_limit,
            );
            let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
            break;
        }
    }
}

/// Pulls a kibibyte-valued field such as `VmHWM:` out of
/// `/proc/<pid>/status` content.
fn parse_status_kb(status: &str, field: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with(field))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::Stdio;

    #[test]
    fn test_base_rlimits_round_wall_time_up() {
        let limits = ResourceLimits::default().with_wall_time(Duration::from_millis(200));
        let rules = base_rlimits(&limits);
        let cpu = rules
            .iter()
            .find(|rule| matches!(rule.resource, Resource::RLIMIT_CPU))
            .unwrap();
        assert_eq!(cpu.soft, 1);
        assert_eq!(cpu.hard, 2);
    }

    #[test]
    fn test_base_rlimits_disable_core_dumps() {
        let rules = base_rlimits(&ResourceLimits::default());
        let core = rules
            .iter()
            .find(|rule| matches!(rule.resource, Resource::RLIMIT_CORE))
            .unwrap();
        assert_eq!(core.soft, 0);
        assert_eq!(core.hard, 0);
    }

    #[test]
    fn test_parse_status_kb_reads_field() {
        let status = "Name:\tsleep\nVmPeak:\t 5000 kB\nVmHWM:\t 748 kB\n";
        assert_eq!(parse_status_kb(status, "VmHWM:"), Some(748));
        assert_eq!(parse_status_kb(status, "VmPeak:"), Some(5000));
    }

    #[test]
    fn test_parse_status_kb_missing_field() {
        assert_eq!(parse_status_kb("Name:\tsleep\n", "VmHWM:"), None);
        assert_eq!(parse_status_kb("VmHWM:\n", "VmHWM:"), None);
    }

    fn spawn_in_own_group(program: &str, args: &[&str]) -> tokio::process::Child {
        let mut command = std::process::Command::new(program);
        command.args(args).stdout(Stdio::null()).stderr(Stdio::null());
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                Ok(())
            });
        }
        let mut command = tokio::process::Command::from(command);
        command.kill_on_drop(true);
        command.spawn().unwrap()
    }

    #[tokio::test]
    async fn test_rlimit_watchdog_kills_on_breach() {
        let governor = RlimitGovernor::new();
        let limits = ResourceLimits::default().with_memory_bytes(1);
        let scope = governor.open("watchdog-breach", &limits).await.unwrap();

        let mut child = spawn_in_own_group("/bin/sleep", &["30"]);
        let pid = child.id().unwrap();
        scope.attach(pid).await.unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("watchdog did not kill the child")
            .unwrap();
        assert!(!status.success());
        assert!(scope.memory_breached());
        assert!(scope.peak_memory_bytes().unwrap() >= 1);
        scope.close();
    }

    #[tokio::test]
    async fn test_rlimit_watchdog_idle_without_ceiling() {
        let governor = RlimitGovernor::new();
        let limits = ResourceLimits::default().with_memory_bytes(0);
        let scope = governor.open("watchdog-idle", &limits).await.unwrap();

        let mut child = spawn_in_own_group("/bin/sleep", &["0.2"]);
        let pid = child.id().unwrap();
        scope.attach(pid).await.unwrap();

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(status.success());
        assert!(!scope.memory_breached());
        scope.close();
    }

    #[tokio::test]
    async fn test_scope_close_is_idempotent() {
        let governor = RlimitGovernor::new();
        let scope = governor
            .open("close-twice", &ResourceLimits::default())
            .await
            .unwrap();
        scope.close();
        scope.close();
    }

    #[tokio::test]
    #[ignore = "requires cgroup write access"]
    async fn test_cgroup_scope_lifecycle() {
        let governor = CgroupGovernor::new();
        let limits = ResourceLimits::default().with_memory_bytes(64 * 1024 * 1024);
        let scope = governor.open("cgroup-lifecycle", &limits).await.unwrap();
        assert!(!scope.child_rlimits().is_empty());

        let mut child = spawn_in_own_group("/bin/sleep", &["0.2"]);
        scope.attach(child.id().unwrap()).await.unwrap();
        child.wait().await.unwrap();
        assert!(!scope.memory_breached());
        scope.close();
    }
}
