/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

use crate::config::CpuConfig;
use crate::fs_view::FsView;

/// CPU quota file, cgroup v2. Format: `<quota> <period>`, quota may be `max`.
pub const CGROUP_V2_CPU_MAX_PATH: &str = "sys/fs/cgroup/cpu.max";

/// CPU quota in microseconds, cgroup v1. Negative means unlimited.
pub const CGROUP_V1_CPU_QUOTA_PATH: &str = "sys/fs/cgroup/cpu/cpu.cfs_quota_us";

/// CPU period in microseconds, cgroup v1.
pub const CGROUP_V1_CPU_PERIOD_PATH: &str = "sys/fs/cgroup/cpu/cpu.cfs_period_us";

/// Effective number of CPUs available to the process, never less than 1.
///
/// Reads cgroup CPU quotas when available, otherwise falls back to the host
/// CPU count. An explicit `override` in the config wins over everything.
pub fn detect_cpu_count(config: &CpuConfig, fs: &dyn FsView) -> usize {
    if let Some(n) = config.override_cpus.filter(|n| *n > 0) {
        return n;
    }
    if !config.auto_detect.unwrap_or(true) {
        return num_cpus::get();
    }

    if let Some(count) = read_cgroup_v2_cpu(fs) {
        return count;
    }
    if let Some(count) = read_cgroup_v1_cpu(fs) {
        return count;
    }

    num_cpus::get()
}

/// `cpu.max` holds `<quota> <period>` (e.g. `200000 100000` = 2 CPUs).
/// `max` as the quota means unlimited.
fn read_cgroup_v2_cpu(fs: &dyn FsView) -> Option<usize> {
    let content = fs.read_to_string(CGROUP_V2_CPU_MAX_PATH).ok()?;
    let content = content.trim();
    let mut fields = content.split_whitespace();
    let (quota, period) = (fields.next()?, fields.next()?);
    if fields.next().is_some() {
        return None;
    }

    if quota == "max" {
        return Some(num_cpus::get());
    }
    let quota: f64 = quota.parse().ok()?;
    let period: f64 = period.parse().ok()?;
    if period == 0.0 {
        return Some(num_cpus::get());
    }
    Some(quota_to_count(quota, period))
}

fn read_cgroup_v1_cpu(fs: &dyn FsView) -> Option<usize> {
    let quota: f64 = fs
        .read_to_string(CGROUP_V1_CPU_QUOTA_PATH)
        .ok()?
        .trim()
        .parse()
        .ok()?;
    // -1 means unlimited
    if quota < 0.0 {
        return Some(num_cpus::get());
    }

    let period: f64 = fs
        .read_to_string(CGROUP_V1_CPU_PERIOD_PATH)
        .ok()?
        .trim()
        .parse()
        .ok()?;
    if period == 0.0 {
        return Some(num_cpus::get());
    }
    Some(quota_to_count(quota, period))
}

fn quota_to_count(quota: f64, period: f64) -> usize {
    ((quota / period).ceil() as usize).max(1)
}
