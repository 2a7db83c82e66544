/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

use nix::sys::resource::setrlimit;
use nix::sys::resource::Resource;
use pylaunch_common::config::ResolvedResources;

/// Apply OS-level resource limits to the current process, ahead of exec.
/// The child inherits them. Each limit is set with soft = hard.
///
/// Failures are warnings, not fatal: a launcher that cannot raise NOFILE
/// should still launch the service.
pub fn set_resource_limits(config: &ResolvedResources) {
    if config.max_open_files > 0 {
        apply(Resource::RLIMIT_NOFILE, config.max_open_files);
    }
    if config.max_processes > 0 {
        apply(Resource::RLIMIT_NPROC, config.max_processes);
    }
    if !config.core_dump_enabled {
        apply(Resource::RLIMIT_CORE, 0);
    }
}

fn apply(resource: Resource, value: u64) {
    if let Err(e) = setrlimit(resource, value, value) {
        tracing::warn!("Failed to set {:?} to {}: {}", resource, value, e);
    }
}

#[cfg(test)]
mod tests {
    use nix::sys::resource::getrlimit;

    use super::*;

    #[test]
    fn test_core_limit_forced_to_zero() {
        set_resource_limits(&ResolvedResources {
            max_open_files: 0,
            max_processes: 0,
            core_dump_enabled: false,
        });
        let (soft, _hard) = getrlimit(Resource::RLIMIT_CORE).unwrap();
        assert_eq!(soft, 0);
    }

    #[test]
    fn test_failures_do_not_panic() {
        // Raising NOFILE beyond the hard limit fails for unprivileged
        // processes; the call must swallow it.
        set_resource_limits(&ResolvedResources {
            max_open_files: u64::MAX - 1,
            max_processes: 0,
            core_dump_enabled: true,
        });
    }
}
