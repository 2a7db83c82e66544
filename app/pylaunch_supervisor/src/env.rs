/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

use std::collections::BTreeMap;

use pylaunch_common::config::MemoryMode;
use pylaunch_common::config::ResolvedConfig;
use pylaunch_common::limits::MemoryLimits;

/// Service identity injected into the child environment.
pub struct ServiceMetadata {
    pub name: String,
    pub version: String,
}

/// Compose the child's environment. Last-wins precedence:
///
/// 1. Inherited environment.
/// 2. Memory block (skipped entirely when the mode is `unmanaged`).
/// 3. Merged config env.
/// 4. Service metadata.
/// 5. CPU block — set only where the key is not already present.
///
/// Then `PYTHONDONTWRITEBYTECODE`, `PYTHONUNBUFFERED`, and `TMPDIR`
/// defaults where still absent. The result is a sorted map, so identical
/// inputs compose byte-for-byte identical environments.
pub fn build_process_env(
    config: &ResolvedConfig,
    limits: &MemoryLimits,
    metadata: &ServiceMetadata,
    cpu_count: usize,
    inherited: impl IntoIterator<Item = (String, String)>,
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = inherited.into_iter().collect();

    env.extend(build_memory_env(config, limits));

    for (k, v) in &config.env {
        env.insert(k.clone(), v.clone());
    }

    env.insert("SERVICE_NAME".to_owned(), metadata.name.clone());
    env.insert("SERVICE_VERSION".to_owned(), metadata.version.clone());
    env.insert("SLS_SERVICE_NAME".to_owned(), metadata.name.clone());
    env.insert("SLS_SERVICE_VERSION".to_owned(), metadata.version.clone());

    let cpus = cpu_count.to_string();
    for key in [
        "OMP_NUM_THREADS",
        "MKL_NUM_THREADS",
        "OPENBLAS_NUM_THREADS",
        "NUMEXPR_MAX_THREADS",
        "SERVICE_CPU_COUNT",
    ] {
        set_default(&mut env, key, &cpus);
    }

    set_default(&mut env, "PYTHONDONTWRITEBYTECODE", "1");
    set_default(&mut env, "PYTHONUNBUFFERED", "1");
    set_default(&mut env, "TMPDIR", "var/data/tmp");

    env
}

/// Memory-management variables derived from the computed limits. Empty for
/// `unmanaged` mode.
pub fn build_memory_env(
    config: &ResolvedConfig,
    limits: &MemoryLimits,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();

    if config.memory.mode == MemoryMode::Unmanaged {
        return env;
    }

    let effective = limits.effective_limit_bytes.to_string();
    let ceiling = limits.cgroup_limit_bytes.to_string();
    let mode = config.memory.mode.to_string();

    env.insert("MEMORY_LIMIT_BYTES".to_owned(), effective.clone());
    env.insert("CGROUP_LIMIT_BYTES".to_owned(), ceiling.clone());
    env.insert("MEMORY_MODE".to_owned(), mode.clone());

    // SLS-prefixed aliases, kept for SLS deployments.
    env.insert("SLS_MEMORY_LIMIT_BYTES".to_owned(), effective);
    env.insert("SLS_CGROUP_LIMIT_BYTES".to_owned(), ceiling);
    env.insert("SLS_MEMORY_MODE".to_owned(), mode);

    // glibc malloc tuning. Anything allocated through C extensions goes
    // through glibc malloc, and its arena behavior inflates RSS.
    if config.memory.malloc_arena_max > 0 {
        env.insert(
            "MALLOC_ARENA_MAX".to_owned(),
            config.memory.malloc_arena_max.to_string(),
        );
    }
    if config.memory.malloc_trim_threshold >= 0 {
        env.insert(
            "MALLOC_TRIM_THRESHOLD_".to_owned(),
            config.memory.malloc_trim_threshold.to_string(),
        );
    }

    // System malloc instead of pymalloc, so RSS tracks actual usage and
    // glibc can return freed memory to the OS.
    env.insert("PYTHONMALLOC".to_owned(), "malloc".to_owned());

    env
}

fn set_default(env: &mut BTreeMap<String, String>, key: &str, value: &str) {
    if !env.contains_key(key) {
        env.insert(key.to_owned(), value.to_owned());
    }
}
