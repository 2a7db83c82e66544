/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

//! Lifecycle orchestration: limits, directories, rlimits, spawn, pid file,
//! readiness, watchdog, signal forwarding, sidecars, teardown.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use pylaunch_common::cgroup::CgroupProbe;
use pylaunch_common::config::MemoryMode;
use pylaunch_common::config::ResolvedConfig;
use pylaunch_common::cpu::detect_cpu_count;
use pylaunch_common::limits::compute_limits;
use pylaunch_common::limits::format_bytes;
use pylaunch_common::limits::LimitsError;
use pylaunch_common::limits::MemoryLimits;
use pylaunch_common::liveliness::LivelinessGuard;

use crate::command::build_command_args;
use crate::env::build_process_env;
use crate::env::ServiceMetadata;
use crate::process::create_directories;
use crate::process::merged_stderr;
use crate::process::remove_pid_file;
use crate::process::resolve_path;
use crate::process::write_pid_file;
use crate::readiness::ReadinessProbe;
use crate::rlimit::set_resource_limits;
use crate::sidecar::shutdown_sidecars;
use crate::sidecar::spawn_sidecars;
use crate::signals::forward_signals;
use crate::watchdog::RssWatchdog;

const DEFAULT_DIRS: &[&str] = &["var/data/tmp", "var/log", "var/run"];

pub struct SupervisorParams {
    /// Root of the deployed distribution; relative config paths resolve
    /// against it and the child runs with it as working directory.
    pub dist_root: PathBuf,
    pub service_name: String,
    pub service_version: String,
}

/// Outcome of one supervised run.
#[derive(Debug)]
pub struct LaunchResult {
    /// The child's exit code; -1 when it died of a signal.
    pub exit_code: i32,

    /// Whether the RSS watchdog sent SIGTERM due to memory pressure.
    pub watchdog_triggered: bool,

    pub duration: Duration,
}

/// Owns the primary child, the pid file, and every subsidiary task for
/// the child's lifetime. Subsidiary components receive only the child's
/// pid plus a shared liveliness observer; dropping the supervisor's guard
/// is the single cancellation edge.
pub struct Supervisor {
    params: SupervisorParams,
    config: ResolvedConfig,
    probe: CgroupProbe,
}

impl Supervisor {
    pub fn new(params: SupervisorParams, config: ResolvedConfig) -> Self {
        Self {
            params,
            config,
            probe: CgroupProbe::host(),
        }
    }

    /// Swap the cgroup probe, so tests can supply synthetic hierarchies.
    pub fn with_cgroup_probe(mut self, probe: CgroupProbe) -> Self {
        self.probe = probe;
        self
    }

    /// Run the full launch sequence and block until the child exits.
    pub async fn supervise(mut self) -> anyhow::Result<LaunchResult> {
        let start = Instant::now();

        tracing::info!(
            "Config: executable={} mode={:?} memory.mode={} container={}",
            self.config.executable,
            self.config.launch_mode,
            self.config.memory.mode,
            self.config.is_container,
        );

        let limits = self.resolve_limits()?;
        if limits.effective_limit_bytes > 0 {
            tracing::info!(
                "Memory limits: cgroup={} effective={} mode={}",
                format_bytes(limits.cgroup_limit_bytes),
                format_bytes(limits.effective_limit_bytes),
                self.config.memory.mode,
            );
        }

        let dirs: Vec<String> = if self.config.dirs.is_empty() {
            DEFAULT_DIRS.iter().map(|d| (*d).to_string()).collect()
        } else {
            self.config.dirs.clone()
        };
        let dirs: Vec<String> = dirs
            .iter()
            .map(|d| resolve_path(&self.params.dist_root, d).display().to_string())
            .collect();
        create_directories(&dirs).context("directory creation failed")?;

        set_resource_limits(&self.config.resources);

        let argv = build_command_args(&self.config);
        let cpu_count = detect_cpu_count(&self.config.cpu, self.probe.fs().as_ref());
        let metadata = ServiceMetadata {
            name: self.params.service_name.clone(),
            version: self.params.service_version.clone(),
        };
        let env = build_process_env(&self.config, &limits, &metadata, cpu_count, std::env::vars());

        // Bare interpreter names (`python3`) go through PATH; anything
        // with a separator resolves against the dist root.
        let executable = if argv[0].contains('/') {
            resolve_path(&self.params.dist_root, &argv[0])
        } else {
            PathBuf::from(&argv[0])
        };
        tracing::info!("Launching: {} {}", executable.display(), argv[1..].join(" "));

        let mut cmd = tokio::process::Command::new(&executable);
        cmd.args(&argv[1..])
            .env_clear()
            .envs(&env)
            .current_dir(&self.params.dist_root);
        if let Ok(stderr) = merged_stderr() {
            cmd.stderr(stderr);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to start process {}", executable.display()))?;
        let pid = child.id().context("child has no pid")? as i32;
        tracing::info!("Process started: pid={}", pid);

        let pid_path = self
            .params
            .dist_root
            .join(format!("var/run/{}.pid", self.params.service_name));
        if let Err(e) = write_pid_file(pid, &pid_path) {
            tracing::warn!("Failed to write pid file: {:#}", e);
        }

        let (observer, guard) = LivelinessGuard::create();

        let mut readiness = ReadinessProbe::new(self.config.readiness.clone());
        if let Err(e) = readiness.start().await {
            tracing::warn!("Failed to start readiness probe: {:#}", e);
        }
        readiness.set_ready();

        let watchdog = if self.config.memory.mode != MemoryMode::Unmanaged
            && self.config.watchdog.enabled.resolve(true)
        {
            let watchdog = RssWatchdog::new(pid, limits.clone(), self.config.watchdog.clone());
            Some(tokio::spawn(watchdog.run(Arc::clone(&observer))))
        } else {
            None
        };

        let forwarder = tokio::spawn(forward_signals(pid, Arc::clone(&observer)));

        let sidecars = spawn_sidecars(&self.config.sub_processes, &env, &self.params.dist_root);

        let status = child.wait().await;

        // Teardown order matters: cancel the watchdog and forwarder first,
        // drain readiness, reap sidecars, and only then drop the pid file.
        drop(guard);
        let watchdog_triggered = match watchdog {
            Some(handle) => handle.await.unwrap_or(false),
            None => false,
        };
        let _ = forwarder.await;
        readiness.drain().await;
        shutdown_sidecars(sidecars).await;
        remove_pid_file(&pid_path);

        let exit_code = match status {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                tracing::warn!("Failed to wait for child: {}", e);
                1
            }
        };
        let duration = start.elapsed();
        tracing::info!(
            "Process exited: code={} duration={:?} watchdog_triggered={}",
            exit_code,
            duration,
            watchdog_triggered,
        );

        Ok(LaunchResult {
            exit_code,
            watchdog_triggered,
            duration,
        })
    }

    /// Compute limits, deciding what a cgroup introspection failure means:
    /// fatal inside a container, demotion to unmanaged outside.
    fn resolve_limits(&mut self) -> anyhow::Result<MemoryLimits> {
        match compute_limits(&self.config, &self.probe) {
            Ok(limits) => Ok(limits),
            Err(e @ LimitsError::FixedLimitZero) => Err(e).context("invalid memory config"),
            Err(LimitsError::Cgroup(e)) if self.config.is_container => {
                Err(e).context("memory limit detection failed in container")
            }
            Err(LimitsError::Cgroup(e)) => {
                tracing::warn!(
                    "Failed to detect memory limits: {:#} (continuing with unmanaged memory)",
                    anyhow::Error::from(e)
                );
                self.config.memory.mode = MemoryMode::Unmanaged;
                Ok(MemoryLimits {
                    is_container: self.config.is_container,
                    ..Default::default()
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pylaunch_common::config::LaunchMode;
    use pylaunch_common::config::ResolvedMemory;
    use pylaunch_common::fs_view::MapFs;

    use super::*;

    fn params(dist_root: &std::path::Path) -> SupervisorParams {
        SupervisorParams {
            dist_root: dist_root.to_owned(),
            service_name: "test-service".to_owned(),
            service_version: "0.0.1".to_owned(),
        }
    }

    fn command_config(executable: &str, args: Vec<&str>) -> ResolvedConfig {
        ResolvedConfig {
            executable: executable.to_owned(),
            launch_mode: LaunchMode::Command,
            args: args.into_iter().map(str::to_owned).collect(),
            memory: ResolvedMemory {
                mode: MemoryMode::Unmanaged,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn empty_probe() -> CgroupProbe {
        CgroupProbe::new(Arc::new(MapFs::empty()))
    }

    #[tokio::test]
    async fn test_exit_code_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(
            params(dir.path()),
            command_config("/bin/sh", vec!["-c", "exit 7"]),
        )
        .with_cgroup_probe(empty_probe());

        let result = supervisor.supervise().await.unwrap();
        assert_eq!(result.exit_code, 7);
        assert!(!result.watchdog_triggered);
    }

    #[tokio::test]
    async fn test_signal_death_is_minus_one() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(
            params(dir.path()),
            command_config("/bin/sh", vec!["-c", "kill -TERM $$"]),
        )
        .with_cgroup_probe(empty_probe());

        let result = supervisor.supervise().await.unwrap();
        assert_eq!(result.exit_code, -1);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(
            params(dir.path()),
            command_config("service/bin/does-not-exist", vec![]),
        )
        .with_cgroup_probe(empty_probe());

        assert!(supervisor.supervise().await.is_err());
    }

    #[tokio::test]
    async fn test_pid_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("var/run/test-service.pid");
        let supervisor = Supervisor::new(
            params(dir.path()),
            command_config("/bin/sh", vec!["-c", "sleep 2"]),
        )
        .with_cgroup_probe(empty_probe());

        let handle = tokio::spawn(supervisor.supervise());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(pid_path.exists(), "pid file should exist while child runs");
        let pid: i32 = std::fs::read_to_string(&pid_path)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(pid > 0);

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(!pid_path.exists(), "pid file should be removed on exit");
    }

    #[tokio::test]
    async fn test_default_directories_created() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(
            params(dir.path()),
            command_config("/bin/sh", vec!["-c", "true"]),
        )
        .with_cgroup_probe(empty_probe());

        supervisor.supervise().await.unwrap();
        assert!(dir.path().join("var/data/tmp").is_dir());
        assert!(dir.path().join("var/log").is_dir());
        assert!(dir.path().join("var/run").is_dir());
    }

    #[tokio::test]
    async fn test_cgroup_failure_demotes_outside_container() {
        let dir = tempfile::tempdir().unwrap();
        // cgroup-aware with nothing to probe: outside a container this
        // demotes to unmanaged, so the child must see no memory env.
        let mut config =
            command_config("/bin/sh", vec!["-c", "test -z \"$MEMORY_LIMIT_BYTES\""]);
        config.memory.mode = MemoryMode::CgroupAware;

        let supervisor = Supervisor::new(params(dir.path()), config).with_cgroup_probe(empty_probe());
        let result = supervisor.supervise().await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(!result.watchdog_triggered);
    }

    #[tokio::test]
    async fn test_cgroup_failure_is_fatal_in_container() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = command_config("/bin/sh", vec!["-c", "true"]);
        config.memory.mode = MemoryMode::CgroupAware;
        config.is_container = true;

        let supervisor = Supervisor::new(params(dir.path()), config).with_cgroup_probe(empty_probe());
        assert!(supervisor.supervise().await.is_err());
    }

    #[tokio::test]
    async fn test_fixed_limit_zero_is_fatal_everywhere() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = command_config("/bin/sh", vec!["-c", "true"]);
        config.memory.mode = MemoryMode::Fixed;
        config.memory.fixed_limit_bytes = 0;

        let supervisor = Supervisor::new(params(dir.path()), config).with_cgroup_probe(empty_probe());
        assert!(supervisor.supervise().await.is_err());
    }

    #[tokio::test]
    async fn test_memory_env_reaches_child() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = command_config(
            "/bin/sh",
            vec![
                "-c",
                "test \"$MEMORY_LIMIT_BYTES\" = \"67108864\" && test \"$PYTHONMALLOC\" = malloc",
            ],
        );
        config.memory.mode = MemoryMode::Fixed;
        // Small enough that the 64 MiB floor kicks in.
        config.memory.fixed_limit_bytes = 32 * 1024 * 1024;
        // The watchdog would trip on such a tiny limit; keep it out of
        // this test's way.
        config.watchdog.enabled = pylaunch_common::config::Enabled::Off;

        let supervisor = Supervisor::new(params(dir.path()), config).with_cgroup_probe(empty_probe());
        let result = supervisor.supervise().await.unwrap();
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_watchdog_terminates_runaway_child() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = command_config("/bin/sleep", vec!["120"]);
        // Any real process exceeds a 100 kB hard threshold, so the
        // watchdog fires on its first poll.
        config.memory.mode = MemoryMode::Fixed;
        config.memory.fixed_limit_bytes = 100_000;
        config.watchdog.poll_interval_seconds = 1;
        config.watchdog.grace_period_seconds = 1;

        let supervisor = Supervisor::new(params(dir.path()), config).with_cgroup_probe(empty_probe());
        let result = tokio::time::timeout(Duration::from_secs(30), supervisor.supervise())
            .await
            .expect("watchdog should terminate the child quickly")
            .unwrap();

        assert!(result.watchdog_triggered);
        assert_eq!(result.exit_code, -1);
        assert!(result.duration < Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_sidecar_killed_when_primary_exits() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = command_config("/bin/sh", vec!["-c", "sleep 1"]);
        config.sub_processes = vec![pylaunch_common::config::SubProcessConfig {
            name: "sleeper".to_owned(),
            executable: "/bin/sleep".to_owned(),
            args: vec!["120".to_owned()],
            env: Default::default(),
        }];

        let supervisor = Supervisor::new(params(dir.path()), config).with_cgroup_probe(empty_probe());
        let result = tokio::time::timeout(Duration::from_secs(15), supervisor.supervise())
            .await
            .expect("supervise should not wait for the sidecar")
            .unwrap();
        assert_eq!(result.exit_code, 0);
    }
}
