#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use javabox::{IsolationSettings, JavaBox, JavaBoxConfig, JavaToolchain, RlimitGovernor};
use tempfile::TempDir;

/// Toolchain backed by shell scripts, so harness behavior is testable
/// without a JDK. The scripts run inside the sandbox like the real
/// tools would.
pub struct StubToolchain {
    pub toolchain: JavaToolchain,
    _dir: TempDir,
}

pub fn stub_toolchain(javac_body: &str, java_body: &str) -> StubToolchain {
    let dir = tempfile::tempdir().unwrap();
    let javac = write_script(dir.path(), "javac", javac_body);
    let java = write_script(dir.path(), "java", java_body);
    StubToolchain {
        toolchain: JavaToolchain::new(javac, java),
        _dir: dir,
    }
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Isolation that works without privileges: no identity drop, no
/// network namespace.
pub fn open_isolation() -> IsolationSettings {
    IsolationSettings::default()
        .with_identity(None)
        .with_deny_network(false)
}

pub fn test_config(scope_root: &Path, toolchain: JavaToolchain) -> JavaBoxConfig {
    JavaBoxConfig::default()
        .with_scope_root(scope_root)
        .with_toolchain(toolchain)
        .with_isolation(open_isolation())
}

/// Rlimit governor keeps the tests deterministic whatever the host's
/// cgroup situation is.
pub fn test_executor(config: JavaBoxConfig) -> JavaBox {
    JavaBox::with_governor(config, Arc::new(RlimitGovernor::new()))
}

/// Counts live processes whose working directory sits under `path`.
/// Zero after an execution means nothing escaped the group kill.
pub fn processes_with_cwd(path: &Path) -> usize {
    proc_entries()
        .filter_map(|entry| std::fs::read_link(entry.join("cwd")).ok())
        .filter(|cwd| cwd.starts_with(path))
        .count()
}

/// Counts live processes whose command line contains `needle`.
pub fn processes_with_cmdline(needle: &str) -> usize {
    proc_entries()
        .filter_map(|entry| std::fs::read(entry.join("cmdline")).ok())
        .filter(|cmdline| {
            String::from_utf8_lossy(cmdline)
                .split('\0')
                .any(|arg| arg.contains(needle))
        })
        .count()
}

fn proc_entries() -> impl Iterator<Item = PathBuf> {
    std::fs::read_dir("/proc")
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .chars()
                .all(|c| c.is_ascii_digit())
        })
        .map(|entry| entry.path())
}
