/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

use crate::cgroup::CgroupError;
use crate::cgroup::CgroupProbe;
use crate::config::MemoryMode;
use crate::config::ResolvedConfig;

/// Absolute floor for the effective limit. Below this the interpreter
/// itself may fail to start.
pub const MINIMUM_EFFECTIVE_LIMIT_BYTES: u64 = 64 * 1024 * 1024;

/// Computed memory limits. Immutable once built.
///
/// The watchdog thresholds are percentages of `cgroup_limit_bytes` — the
/// true ceiling the OOM killer enforces — not of `effective_limit_bytes`.
/// The workload is told the smaller effective target through its
/// environment, so the watchdog always fires before the kernel would,
/// even when operators reason in terms of the effective limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryLimits {
    /// Raw ceiling: cgroup value, fixed value, or total system memory.
    pub cgroup_limit_bytes: u64,

    /// Target RSS for the child:
    /// `cgroup_limit_bytes * max_rss_percent/100 * (1 - heap_fragmentation_buffer)`,
    /// floor-clamped to 64 MiB.
    pub effective_limit_bytes: u64,

    /// Watchdog warning threshold.
    pub soft_warn_bytes: u64,

    /// Watchdog SIGTERM threshold.
    pub hard_kill_bytes: u64,

    /// 2, 1, or 0 when no cgroup controller was found.
    pub cgroup_version: u32,

    /// Whether the `CONTAINER` environment marker was present.
    pub is_container: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum LimitsError {
    #[error("memory mode is 'fixed' but fixedLimitBytes is 0")]
    FixedLimitZero,
    #[error(transparent)]
    Cgroup(#[from] CgroupError),
}

/// Derive [`MemoryLimits`] from the resolved policy.
///
/// `unmanaged` returns zeroed limits carrying only `is_container`. Cgroup
/// introspection failures surface typed; whether they are fatal is the
/// supervisor's call (fatal inside a container, demotion outside).
pub fn compute_limits(
    config: &ResolvedConfig,
    probe: &CgroupProbe,
) -> Result<MemoryLimits, LimitsError> {
    let mut limits = MemoryLimits {
        is_container: config.is_container,
        ..Default::default()
    };

    match config.memory.mode {
        MemoryMode::Unmanaged => return Ok(limits),
        MemoryMode::Fixed => {
            if config.memory.fixed_limit_bytes == 0 {
                return Err(LimitsError::FixedLimitZero);
            }
            limits.cgroup_limit_bytes = config.memory.fixed_limit_bytes;
        }
        MemoryMode::CgroupAware => {
            let (version, limit) = probe.memory_limit()?;
            limits.cgroup_version = version.as_u32();
            limits.cgroup_limit_bytes = limit;
        }
    }

    // base = ceiling * maxRssPercent / 100, then shaved by the
    // fragmentation buffer; both steps truncate to whole bytes.
    let base = (limits.cgroup_limit_bytes as f64 * config.memory.max_rss_percent / 100.0) as u64;
    let effective = (base as f64 * (1.0 - config.memory.heap_fragmentation_buffer)) as u64;
    limits.effective_limit_bytes = effective.max(MINIMUM_EFFECTIVE_LIMIT_BYTES);

    limits.soft_warn_bytes =
        (limits.cgroup_limit_bytes as f64 * config.watchdog.soft_limit_percent / 100.0) as u64;
    limits.hard_kill_bytes =
        (limits.cgroup_limit_bytes as f64 * config.watchdog.hard_limit_percent / 100.0) as u64;

    Ok(limits)
}

/// Human-readable byte count for log lines.
pub fn format_bytes(b: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;

    if b >= GIB {
        format!("{:.2} GiB", b as f64 / GIB as f64)
    } else if b >= MIB {
        format!("{:.2} MiB", b as f64 / MIB as f64)
    } else if b >= KIB {
        format!("{:.2} KiB", b as f64 / KIB as f64)
    } else {
        format!("{b} B")
    }
}
