use std::ffi::OsString;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use nix::errno::Errno;
use nix::sched::{unshare, CloneFlags};
use nix::sys::resource::setrlimit;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{setgid, setgroups, setsid, setuid, Gid, Pid, Uid};
use tempfile::TempDir;
use tokio::process::Command;
use uuid::Uuid;

use crate::domain::Submission;
use crate::error::SandboxError;
use crate::governor::RlimitRule;

/// How long teardown waits for a killed process group to disappear
/// before removing the scope underneath it.
const REAP_GRACE: Duration = Duration::from_millis(500);

/// The account sandboxed processes run as. Fixed at instance
/// construction, never derived from a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SandboxIdentity {
    pub uid: u32,
    pub gid: u32,
}

impl SandboxIdentity {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }
}

impl Default for SandboxIdentity {
    fn default() -> Self {
        Self {
            uid: 1000,
            gid: 1000,
        }
    }
}

/// Isolation posture applied to every process of an instance.
///
/// In strict mode a failed isolation step aborts the spawn. The
/// permissive default keeps going so the harness still works on
/// unprivileged developer hosts, where dropping identity or
/// unsharing the network namespace is not allowed.
#[derive(Clone, Copy, Debug)]
pub struct IsolationSettings {
    pub identity: Option<SandboxIdentity>,
    pub deny_network: bool,
    pub strict: bool,
}

impl Default for IsolationSettings {
    fn default() -> Self {
        Self {
            identity: Some(SandboxIdentity::default()),
            deny_network: true,
            strict: false,
        }
    }
}

impl IsolationSettings {
    pub fn with_identity(mut self, identity: Option<SandboxIdentity>) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_deny_network(mut self, deny_network: bool) -> Self {
        self.deny_network = deny_network;
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

/// Private filesystem scope plus the process group bookkeeping for one
/// request. Dropping the instance kills whatever is still running and
/// removes the scope directory.
#[derive(Debug)]
pub struct SandboxInstance {
    id: Uuid,
    dir: Option<TempDir>,
    path: PathBuf,
    settings: IsolationSettings,
    group: Mutex<Option<i32>>,
}

impl SandboxInstance {
    /// Creates a fresh scope directory under `root`, owner-only and
    /// chowned to the sandbox identity when one is configured.
    pub async fn create(root: &Path, settings: IsolationSettings) -> Result<Self, SandboxError> {
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|source| SandboxError::CreateScope {
                path: root.to_path_buf(),
                source,
            })?;
        if settings.identity.is_some() && !nix::unistd::geteuid().is_root() {
            tracing::debug!("not running as root, identity drop is best effort");
        }
        let root_buf = root.to_path_buf();
        let (dir, path) = tokio::task::spawn_blocking(move || prepare_scope(&root_buf, settings))
            .await
            .map_err(|error| SandboxError::CreateScope {
                path: root.to_path_buf(),
                source: io::Error::other(error),
            })??;
        Ok(Self {
            id: Uuid::new_v4(),
            dir: Some(dir),
            path,
            settings,
            group: Mutex::new(None),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the submission sources into the scope. Files get fixed
    /// 0644 permissions so the sandbox identity can read them whatever
    /// the umask says.
    pub async fn materialize(&self, submission: &Submission) -> Result<(), SandboxError> {
        for file in &submission.files {
            let path = self.path.join(&file.name);
            tokio::fs::write(&path, file.contents.as_bytes())
                .await
                .map_err(|source| SandboxError::Materialize {
                    name: file.name.clone(),
                    source,
                })?;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))
                .await
                .map_err(|source| SandboxError::Materialize {
                    name: file.name.clone(),
                    source,
                })?;
        }
        Ok(())
    }

    /// Builds a command confined to this scope: cleaned environment,
    /// piped output, and a pre-exec hook that moves the child into its
    /// own session, applies rlimits and sheds identity before exec.
    pub(crate) fn command(
        &self,
        program: &Path,
        args: &[OsString],
        rlimits: &[RlimitRule],
    ) -> Command {
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&self.path)
            .env_clear()
            .env("PATH", "/usr/local/bin:/usr/bin:/bin")
            .env("HOME", &self.path)
            .env("TMPDIR", &self.path)
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let deny_network = self.settings.deny_network;
        let strict = self.settings.strict;
        let identity = self.settings.identity;
        let rules = rlimits.to_vec();
        unsafe {
            command.pre_exec(move || child_setup(deny_network, strict, &rules, identity));
        }
        command
    }

    /// Registers the process group of a freshly spawned step. Any
    /// previous group is killed first, one group is live at a time.
    pub(crate) fn adopt_group(&self, pid: u32) {
        let Ok(mut guard) = self.group.lock() else {
            return;
        };
        if let Some(previous) = guard.replace(pid as i32) {
            kill_pgid(previous);
        }
    }

    /// SIGKILLs the current process group. Safe to call repeatedly and
    /// when nothing is running.
    pub(crate) fn kill_group(&self) {
        let Ok(guard) = self.group.lock() else {
            return;
        };
        if let Some(pgid) = *guard {
            kill_pgid(pgid);
        }
    }

    /// Polls until the current group has no surviving members or the
    /// grace period runs out.
    async fn await_group_exit(&self, grace: Duration) {
        let pgid = match self.group.lock() {
            Ok(guard) => *guard,
            Err(_) => None,
        };
        let Some(pgid) = pgid else {
            return;
        };
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            // Signal 0 probes for survivors without touching them.
            if let Err(Errno::ESRCH) = killpg(Pid::from_raw(pgid), None) {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(message = "process group outlived the reap grace period", %pgid);
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Tears the instance down: kill the group, wait for it to be
    /// reaped, then remove the scope directory.
    #[tracing::instrument(skip_all, fields(sandbox = %self.id))]
    pub async fn destroy(mut self) -> Result<(), SandboxError> {
        self.kill_group();
        self.await_group_exit(REAP_GRACE).await;
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || dir.close())
            .await
            .map_err(|error| SandboxError::Teardown {
                path: path.clone(),
                source: io::Error::other(error),
            })?
            .map_err(|source| SandboxError::Teardown { path, source })?;
        Ok(())
    }
}

impl Drop for SandboxInstance {
    fn drop(&mut self) {
        // Cancelled or panicked callers still must not leak processes.
        // The TempDir field removes the scope right after.
        self.kill_group();
    }
}

fn prepare_scope(
    root: &Path,
    settings: IsolationSettings,
) -> Result<(TempDir, PathBuf), SandboxError> {
    let dir = tempfile::Builder::new()
        .prefix("sandbox-")
        .tempdir_in(root)
        .map_err(|source| SandboxError::CreateScope {
            path: root.to_path_buf(),
            source,
        })?;
    let path = dir.path().to_path_buf();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700)).map_err(|source| {
        SandboxError::CreateScope {
            path: path.clone(),
            source,
        }
    })?;
    if let Some(identity) = settings.identity {
        if let Err(source) = std::os::unix::fs::chown(&path, Some(identity.uid), Some(identity.gid))
        {
            if settings.strict {
                return Err(SandboxError::Isolation(format!(
                    "cannot chown scope to uid {}: {source}",
                    identity.uid
                )));
            }
            tracing::debug!(message = "cannot chown sandbox scope, continuing", %source);
        }
    }
    Ok((dir, path))
}

fn kill_pgid(pgid: i32) {
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(error) => {
            tracing::warn!(message = "failed to kill process group", %pgid, %error);
        }
    }
}

/// Runs between fork and exec, so only async-signal-safe calls and no
/// allocation. A new session makes the child a process group leader,
/// which is what group kills key on.
fn child_setup(
    deny_network: bool,
    strict: bool,
    rlimits: &[RlimitRule],
    identity: Option<SandboxIdentity>,
) -> io::Result<()> {
    setsid().map_err(errno_to_io)?;
    if deny_network {
        if let Err(errno) = unshare(CloneFlags::CLONE_NEWNET) {
            if strict {
                return Err(errno_to_io(errno));
            }
        }
    }
    for rule in rlimits {
        setrlimit(rule.resource, rule.soft, rule.hard).map_err(errno_to_io)?;
    }
    if let Some(identity) = identity {
        let dropped = setgroups(&[])
            .and_then(|()| setgid(Gid::from_raw(identity.gid)))
            .and_then(|()| setuid(Uid::from_raw(identity.uid)));
        if let Err(errno) = dropped {
            if strict {
                return Err(errno_to_io(errno));
            }
        }
    }
    Ok(())
}

fn errno_to_io(errno: Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_settings() -> IsolationSettings {
        IsolationSettings::default()
            .with_identity(None)
            .with_deny_network(false)
    }

    #[tokio::test]
    async fn test_create_makes_private_scope() {
        let root = tempfile::tempdir().unwrap();
        let instance = SandboxInstance::create(root.path(), open_settings())
            .await
            .unwrap();
        assert!(instance.path().starts_with(root.path()));
        assert!(instance.path().is_dir());

        let other = SandboxInstance::create(root.path(), open_settings())
            .await
            .unwrap();
        assert_ne!(instance.path(), other.path());
    }

    #[tokio::test]
    async fn test_destroy_removes_scope() {
        let root = tempfile::tempdir().unwrap();
        let instance = SandboxInstance::create(root.path(), open_settings())
            .await
            .unwrap();
        let path = instance.path().to_path_buf();
        instance.destroy().await.unwrap();
        assert!(!path.exists());
        assert!(root.path().is_dir());
    }

    #[tokio::test]
    async fn test_materialize_writes_sources() {
        let root = tempfile::tempdir().unwrap();
        let instance = SandboxInstance::create(root.path(), open_settings())
            .await
            .unwrap();
        let submission = Submission::java("public class Main {}")
            .with_file("Helper.java", "class Helper {}");
        instance.materialize(&submission).await.unwrap();

        let main = tokio::fs::read_to_string(instance.path().join("Main.java"))
            .await
            .unwrap();
        assert_eq!(main, "public class Main {}");
        assert!(instance.path().join("Helper.java").is_file());
        instance.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_command_runs_inside_scope() {
        let root = tempfile::tempdir().unwrap();
        let instance = SandboxInstance::create(root.path(), open_settings())
            .await
            .unwrap();
        let args: Vec<OsString> = vec!["-c".into(), "pwd".into()];
        let output = instance
            .command(Path::new("/bin/sh"), &args, &[])
            .output()
            .await
            .unwrap();
        assert!(output.status.success());
        let reported = String::from_utf8_lossy(&output.stdout);
        let expected = std::fs::canonicalize(instance.path()).unwrap();
        assert_eq!(reported.trim(), expected.to_string_lossy());
        instance.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_kill_group_takes_down_descendants() {
        let root = tempfile::tempdir().unwrap();
        let instance = SandboxInstance::create(root.path(), open_settings())
            .await
            .unwrap();
        let args: Vec<OsString> = vec!["-c".into(), "sleep 30 & exec sleep 30".into()];
        let mut child = instance
            .command(Path::new("/bin/sh"), &args, &[])
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        instance.adopt_group(pid);

        tokio::time::sleep(Duration::from_millis(50)).await;
        instance.kill_group();
        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("group kill did not reach the leader")
            .unwrap();
        assert!(!status.success());

        // Killing again must be harmless, destroy reaps the rest.
        instance.kill_group();
        instance.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_rlimits_reach_the_child() {
        let root = tempfile::tempdir().unwrap();
        let instance = SandboxInstance::create(root.path(), open_settings())
            .await
            .unwrap();
        let rules = [RlimitRule {
            resource: nix::sys::resource::Resource::RLIMIT_FSIZE,
            soft: 1024,
            hard: 1024,
        }];
        let args: Vec<OsString> = vec!["-c".into(), "ulimit -f".into()];
        let output = instance
            .command(Path::new("/bin/sh"), &args, &rules)
            .output()
            .await
            .unwrap();
        // ulimit -f reports in 512-byte blocks
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "2");
        instance.destroy().await.unwrap();
    }
}
