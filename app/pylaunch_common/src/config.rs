/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

//! The two-file launcher configuration model.
//!
//! A distribution ships an immutable static config
//! (`service/bin/launcher-static.yml`, written at build time) and operators
//! may drop a custom config (`var/conf/launcher-custom.yml`) next to it.
//! The two are merged here into a [`ResolvedConfig`] with all defaults
//! applied and all ranges validated; nothing downstream ever sees an
//! unresolved option.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;

use crate::logging::LoggingConfig;

pub const CONFIG_TYPE_PYTHON: &str = "python";
pub const CONFIG_VERSION: u32 = 1;

/// How the launcher manages memory for the child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemoryMode {
    /// Read cgroup limits at runtime and run the RSS watchdog so SIGTERM
    /// lands before the OOM killer's SIGKILL.
    CgroupAware,
    /// Use an explicitly provided byte ceiling without reading cgroups.
    Fixed,
    /// No limits computed, no watchdog, no memory env injected.
    Unmanaged,
}

impl fmt::Display for MemoryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryMode::CgroupAware => write!(f, "cgroup-aware"),
            MemoryMode::Fixed => write!(f, "fixed"),
            MemoryMode::Unmanaged => write!(f, "unmanaged"),
        }
    }
}

/// How the child process is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// A self-executing PEX bundle, optionally prefixed with an interpreter.
    #[default]
    Pex,
    /// `python -m <executable>`.
    Module,
    /// `python <executable>`.
    Script,
    /// `python -m uvicorn <executable>[:<entry_point>]`.
    Uvicorn,
    /// `python -m gunicorn <executable>[:<entry_point>]`.
    Gunicorn,
    /// Run `executable` directly; no Python wrapper.
    Command,
}

/// An on/off flag whose absence is meaningful: `Unset` enables default-on
/// behavior where the surrounding mode warrants it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Enabled {
    On,
    Off,
    #[default]
    Unset,
}

impl Enabled {
    pub fn from_option(v: Option<bool>) -> Self {
        match v {
            Some(true) => Enabled::On,
            Some(false) => Enabled::Off,
            None => Enabled::Unset,
        }
    }

    pub fn resolve(self, default: bool) -> bool {
        match self {
            Enabled::On => true,
            Enabled::Off => false,
            Enabled::Unset => default,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryConfig {
    pub mode: Option<MemoryMode>,

    /// Target RSS as a percentage of the detected or fixed limit. Default 75.
    pub max_rss_percent: Option<f64>,

    /// Explicit ceiling in bytes; only used when mode is `fixed`.
    pub fixed_limit_bytes: Option<u64>,

    /// Subtracted from the target to absorb allocator fragmentation and
    /// native-extension overhead. Default 0.10.
    pub heap_fragmentation_buffer: Option<f64>,

    /// `MALLOC_TRIM_THRESHOLD_` for the child. Default 131072; -1 disables.
    pub malloc_trim_threshold: Option<i64>,

    /// `MALLOC_ARENA_MAX` for the child. Default 2; 0 leaves glibc's default.
    pub malloc_arena_max: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchdogConfig {
    /// Tri-state: unset means on whenever the memory mode warrants it.
    pub enabled: Option<bool>,
    pub poll_interval_seconds: Option<u64>,
    pub soft_limit_percent: Option<f64>,
    pub hard_limit_percent: Option<f64>,
    pub grace_period_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceConfig {
    pub max_open_files: Option<u64>,
    pub max_processes: Option<u64>,
    pub core_dump_enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReadinessConfig {
    pub enabled: bool,
    pub http_port: Option<u16>,
    pub http_path: Option<String>,
    /// How long to report not-ready after shutdown begins, so load
    /// balancers can drain connections. Default 10.
    pub drain_seconds: Option<u64>,
    /// Optional marker file written on ready and removed during drain.
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CpuConfig {
    /// Read cgroup CPU quotas to compute the effective CPU count. Default on.
    pub auto_detect: Option<bool>,

    /// Explicit CPU count; wins over detection when > 0.
    #[serde(rename = "override")]
    pub override_cpus: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubProcessConfig {
    /// Identifier used in logs.
    pub name: String,
    /// Path to the binary, relative to the distribution root.
    pub executable: String,
    pub args: Vec<String>,
    /// Overlaid on the primary's environment.
    pub env: BTreeMap<String, String>,
}

/// Immutable configuration generated at build time. Written to
/// `service/bin/launcher-static.yml` by the packaging toolchain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StaticLauncherConfig {
    pub config_type: String,
    pub config_version: u32,

    /// Path to the PEX binary (or module/script per `launch_mode`),
    /// relative to the distribution root.
    pub executable: String,

    pub launch_mode: LaunchMode,

    /// Optional interpreter path. Supports env references like
    /// `$PYTHON_HOME/bin/python3`.
    pub python_path: Option<String>,

    /// `module.path:callable` target for uvicorn/gunicorn modes.
    pub entry_point: Option<String>,

    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,

    /// Flags for the interpreter itself, before the target.
    pub python_opts: Vec<String>,

    pub memory: MemoryConfig,
    pub resources: ResourceConfig,
    pub cpu: CpuConfig,

    /// Directories to create (relative to the distribution root) before
    /// launch.
    pub dirs: Vec<String>,

    pub watchdog: WatchdogConfig,
    pub readiness: ReadinessConfig,

    /// Sidecar processes launched alongside the primary.
    pub sub_processes: Vec<SubProcessConfig>,
}

/// Mutable per-deployment overrides, read from
/// `var/conf/launcher-custom.yml`. Absence of the file is not an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CustomLauncherConfig {
    pub config_type: Option<String>,
    pub config_version: Option<u32>,

    /// Merged over the static config's env.
    pub env: BTreeMap<String, String>,

    /// Appended to the static config's python_opts.
    pub python_opts: Vec<String>,

    /// Appended to the static config's args.
    pub args: Vec<String>,

    pub memory: Option<MemoryConfig>,
    pub watchdog: Option<WatchdogConfig>,
    pub readiness: Option<ReadinessConfig>,
    pub logging: LoggingConfig,

    /// Disables all container-aware behavior, mirroring the legacy launcher
    /// flag of the same name.
    pub dangerous_disable_container_support: bool,
}

/// Memory policy with every default applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMemory {
    pub mode: MemoryMode,
    pub max_rss_percent: f64,
    pub fixed_limit_bytes: u64,
    pub heap_fragmentation_buffer: f64,
    pub malloc_trim_threshold: i64,
    pub malloc_arena_max: u32,
}

impl Default for ResolvedMemory {
    fn default() -> Self {
        Self {
            mode: MemoryMode::CgroupAware,
            max_rss_percent: 75.0,
            fixed_limit_bytes: 0,
            heap_fragmentation_buffer: 0.10,
            malloc_trim_threshold: 131072,
            malloc_arena_max: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedWatchdog {
    pub enabled: Enabled,
    pub poll_interval_seconds: u64,
    pub soft_limit_percent: f64,
    pub hard_limit_percent: f64,
    pub grace_period_seconds: u64,
}

impl Default for ResolvedWatchdog {
    fn default() -> Self {
        Self {
            enabled: Enabled::Unset,
            poll_interval_seconds: 5,
            soft_limit_percent: 85.0,
            hard_limit_percent: 95.0,
            grace_period_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedResources {
    pub max_open_files: u64,
    pub max_processes: u64,
    pub core_dump_enabled: bool,
}

impl Default for ResolvedResources {
    fn default() -> Self {
        Self {
            max_open_files: 65536,
            max_processes: 4096,
            core_dump_enabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedReadiness {
    pub enabled: bool,
    pub http_port: u16,
    pub http_path: String,
    pub drain_seconds: u64,
    pub file_path: Option<String>,
}

impl Default for ResolvedReadiness {
    fn default() -> Self {
        Self {
            enabled: false,
            http_port: 8081,
            http_path: "/ready".to_owned(),
            drain_seconds: 10,
            file_path: None,
        }
    }
}

/// The fully merged and validated configuration the supervisor runs from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedConfig {
    pub executable: String,
    pub launch_mode: LaunchMode,
    pub python_path: String,
    pub entry_point: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub python_opts: Vec<String>,
    pub memory: ResolvedMemory,
    pub watchdog: ResolvedWatchdog,
    pub resources: ResolvedResources,
    pub readiness: ResolvedReadiness,
    pub cpu: CpuConfig,
    pub logging: LoggingConfig,
    pub dirs: Vec<String>,
    pub sub_processes: Vec<SubProcessConfig>,

    /// Whether the `CONTAINER` environment marker was present (and not
    /// overridden by `dangerousDisableContainerSupport`).
    pub is_container: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read static config from {path}")]
    ReadStatic {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read custom config from {path}")]
    ReadCustom {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("expected configType {expected:?}, got {actual:?}")]
    WrongConfigType { expected: String, actual: String },
    #[error("expected configVersion {expected}, got {actual}")]
    WrongConfigVersion { expected: u32, actual: u32 },
    #[error("executable must not be empty")]
    EmptyExecutable,
    #[error("maxRssPercent must be in (0, 100], got {0}")]
    MaxRssPercentOutOfRange(f64),
    #[error("heapFragmentationBuffer must be in [0, 1), got {0}")]
    FragmentationBufferOutOfRange(f64),
    #[error("watchdog limits must satisfy 0 < soft < hard <= 100, got soft={soft} hard={hard}")]
    WatchdogLimitsOutOfRange { soft: f64, hard: f64 },
}

/// Read and parse both configuration files. The custom file is optional;
/// when absent, defaults apply and a note is logged.
pub fn load_configs(
    static_path: &Path,
    custom_path: &Path,
) -> Result<(StaticLauncherConfig, CustomLauncherConfig), ConfigError> {
    let static_raw =
        std::fs::read_to_string(static_path).map_err(|source| ConfigError::ReadStatic {
            path: static_path.display().to_string(),
            source,
        })?;
    let static_config: StaticLauncherConfig =
        serde_yaml::from_str(&static_raw).map_err(|source| ConfigError::Parse {
            path: static_path.display().to_string(),
            source,
        })?;

    let custom_config = match std::fs::read_to_string(custom_path) {
        Ok(raw) => serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: custom_path.display().to_string(),
            source,
        })?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(
                "Custom config file {} not found, using defaults",
                custom_path.display()
            );
            CustomLauncherConfig::default()
        }
        Err(source) => {
            return Err(ConfigError::ReadCustom {
                path: custom_path.display().to_string(),
                source,
            });
        }
    };

    validate_static(&static_config)?;

    Ok((static_config, custom_config))
}

fn validate_static(config: &StaticLauncherConfig) -> Result<(), ConfigError> {
    if config.config_type != CONFIG_TYPE_PYTHON {
        return Err(ConfigError::WrongConfigType {
            expected: CONFIG_TYPE_PYTHON.to_owned(),
            actual: config.config_type.clone(),
        });
    }
    if config.config_version != CONFIG_VERSION {
        return Err(ConfigError::WrongConfigVersion {
            expected: CONFIG_VERSION,
            actual: config.config_version,
        });
    }
    if config.executable.is_empty() {
        return Err(ConfigError::EmptyExecutable);
    }
    Ok(())
}

/// Merge static and custom configs into a [`ResolvedConfig`].
///
/// `container_marker` is the presence of the `CONTAINER` environment
/// variable, passed in by the caller so tests can force either value.
pub fn merge_configs(
    static_config: StaticLauncherConfig,
    custom: CustomLauncherConfig,
    container_marker: bool,
) -> Result<ResolvedConfig, ConfigError> {
    let mut env = static_config.env;
    env.extend(custom.env);

    let mut args = static_config.args;
    args.extend(custom.args);

    let mut python_opts = static_config.python_opts;
    python_opts.extend(custom.python_opts);

    let memory = resolve_memory(static_config.memory, custom.memory)?;
    let watchdog = resolve_watchdog(static_config.watchdog, custom.watchdog)?;
    let readiness = resolve_readiness(static_config.readiness, custom.readiness);

    let resources_defaults = ResolvedResources::default();
    let resources = ResolvedResources {
        max_open_files: static_config
            .resources
            .max_open_files
            .unwrap_or(resources_defaults.max_open_files),
        max_processes: static_config
            .resources
            .max_processes
            .unwrap_or(resources_defaults.max_processes),
        core_dump_enabled: static_config
            .resources
            .core_dump_enabled
            .unwrap_or(resources_defaults.core_dump_enabled),
    };

    let is_container = container_marker && !custom.dangerous_disable_container_support;

    Ok(ResolvedConfig {
        executable: static_config.executable,
        launch_mode: static_config.launch_mode,
        python_path: static_config.python_path.unwrap_or_default(),
        entry_point: static_config.entry_point.unwrap_or_default(),
        args,
        env,
        python_opts,
        memory,
        watchdog,
        resources,
        readiness,
        cpu: static_config.cpu,
        logging: custom.logging,
        dirs: static_config.dirs,
        sub_processes: static_config.sub_processes,
        is_container,
    })
}

fn resolve_memory(
    static_config: MemoryConfig,
    custom: Option<MemoryConfig>,
) -> Result<ResolvedMemory, ConfigError> {
    let custom = custom.unwrap_or_default();
    let defaults = ResolvedMemory::default();

    let resolved = ResolvedMemory {
        mode: custom
            .mode
            .or(static_config.mode)
            .unwrap_or(defaults.mode),
        max_rss_percent: custom
            .max_rss_percent
            .or(static_config.max_rss_percent)
            .unwrap_or(defaults.max_rss_percent),
        fixed_limit_bytes: custom
            .fixed_limit_bytes
            .or(static_config.fixed_limit_bytes)
            .unwrap_or(defaults.fixed_limit_bytes),
        heap_fragmentation_buffer: custom
            .heap_fragmentation_buffer
            .or(static_config.heap_fragmentation_buffer)
            .unwrap_or(defaults.heap_fragmentation_buffer),
        malloc_trim_threshold: custom
            .malloc_trim_threshold
            .or(static_config.malloc_trim_threshold)
            .unwrap_or(defaults.malloc_trim_threshold),
        malloc_arena_max: custom
            .malloc_arena_max
            .or(static_config.malloc_arena_max)
            .unwrap_or(defaults.malloc_arena_max),
    };

    if resolved.max_rss_percent <= 0.0 || resolved.max_rss_percent > 100.0 {
        return Err(ConfigError::MaxRssPercentOutOfRange(
            resolved.max_rss_percent,
        ));
    }
    if resolved.heap_fragmentation_buffer < 0.0 || resolved.heap_fragmentation_buffer >= 1.0 {
        return Err(ConfigError::FragmentationBufferOutOfRange(
            resolved.heap_fragmentation_buffer,
        ));
    }

    Ok(resolved)
}

fn resolve_watchdog(
    static_config: WatchdogConfig,
    custom: Option<WatchdogConfig>,
) -> Result<ResolvedWatchdog, ConfigError> {
    let custom = custom.unwrap_or_default();
    let defaults = ResolvedWatchdog::default();

    let resolved = ResolvedWatchdog {
        enabled: Enabled::from_option(custom.enabled.or(static_config.enabled)),
        // Zero means unset for the interval fields; a zero-length poll
        // interval has no meaning.
        poll_interval_seconds: custom
            .poll_interval_seconds
            .filter(|v| *v > 0)
            .or(static_config.poll_interval_seconds.filter(|v| *v > 0))
            .unwrap_or(defaults.poll_interval_seconds),
        soft_limit_percent: custom
            .soft_limit_percent
            .or(static_config.soft_limit_percent)
            .unwrap_or(defaults.soft_limit_percent),
        hard_limit_percent: custom
            .hard_limit_percent
            .or(static_config.hard_limit_percent)
            .unwrap_or(defaults.hard_limit_percent),
        grace_period_seconds: custom
            .grace_period_seconds
            .filter(|v| *v > 0)
            .or(static_config.grace_period_seconds.filter(|v| *v > 0))
            .unwrap_or(defaults.grace_period_seconds),
    };

    let (soft, hard) = (resolved.soft_limit_percent, resolved.hard_limit_percent);
    if soft <= 0.0 || soft >= hard || hard > 100.0 {
        return Err(ConfigError::WatchdogLimitsOutOfRange { soft, hard });
    }

    Ok(resolved)
}

fn resolve_readiness(
    static_config: ReadinessConfig,
    custom: Option<ReadinessConfig>,
) -> ResolvedReadiness {
    let custom = custom.unwrap_or_default();
    let defaults = ResolvedReadiness::default();

    ResolvedReadiness {
        enabled: static_config.enabled || custom.enabled,
        http_port: custom
            .http_port
            .or(static_config.http_port)
            .unwrap_or(defaults.http_port),
        http_path: custom
            .http_path
            .or(static_config.http_path)
            .unwrap_or(defaults.http_path),
        drain_seconds: custom
            .drain_seconds
            .or(static_config.drain_seconds)
            .unwrap_or(defaults.drain_seconds),
        file_path: custom.file_path.or(static_config.file_path),
    }
}
