/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

//! Sidecar processes launched alongside the primary.
//!
//! Fire-and-forget while the primary runs; killed and reaped when it
//! exits. A sidecar that fails to start never blocks the primary.

use std::collections::BTreeMap;
use std::path::Path;

use pylaunch_common::config::SubProcessConfig;
use tokio::process::Child;
use tokio::process::Command;

use crate::process::merged_stderr;
use crate::process::resolve_path;

pub struct Sidecar {
    pub name: String,
    child: Child,
}

/// Spawn each configured sidecar with the primary's environment plus its
/// own overlay. Individual failures are logged and skipped.
pub fn spawn_sidecars(
    configs: &[SubProcessConfig],
    primary_env: &BTreeMap<String, String>,
    dist_root: &Path,
) -> Vec<Sidecar> {
    let mut running = Vec::new();

    for config in configs {
        let mut env = primary_env.clone();
        for (k, v) in &config.env {
            env.insert(k.clone(), v.clone());
        }

        let mut cmd = Command::new(resolve_path(dist_root, &config.executable));
        cmd.args(&config.args)
            .env_clear()
            .envs(&env)
            .current_dir(dist_root);
        match merged_stderr() {
            Ok(stderr) => {
                cmd.stderr(stderr);
            }
            Err(e) => {
                tracing::warn!("Failed to merge stderr for subprocess {}: {}", config.name, e);
            }
        }

        match cmd.spawn() {
            Ok(child) => {
                tracing::info!(
                    "Subprocess started: name={} pid={}",
                    config.name,
                    child.id().unwrap_or_default()
                );
                running.push(Sidecar {
                    name: config.name.clone(),
                    child,
                });
            }
            Err(e) => {
                tracing::warn!("Failed to start subprocess {}: {}", config.name, e);
            }
        }
    }

    running
}

/// Kill and reap every sidecar.
pub async fn shutdown_sidecars(sidecars: Vec<Sidecar>) {
    for mut sidecar in sidecars {
        if let Err(e) = sidecar.child.start_kill() {
            tracing::info!("Failed to kill subprocess {}: {}", sidecar.name, e);
        }
        if let Err(e) = sidecar.child.wait().await {
            tracing::info!("Failed to reap subprocess {}: {}", sidecar.name, e);
        }
    }
}
