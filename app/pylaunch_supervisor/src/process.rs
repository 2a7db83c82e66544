/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

//! Pid files, directory setup, and process liveness.

use std::io;
use std::os::fd::AsFd;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Context;
use nix::sys::signal;
use nix::unistd::Pid;

/// Ensure every configured directory exists, relative to the working
/// directory (the distribution root).
pub fn create_directories(dirs: &[String]) -> anyhow::Result<()> {
    for dir in dirs {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory {dir}"))?;
    }
    Ok(())
}

pub fn write_pid_file(pid: i32, path: &Path) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create pid file directory {}", dir.display()))?;
    }
    std::fs::write(path, format!("{pid}\n"))
        .with_context(|| format!("failed to write pid file {}", path.display()))
}

pub fn read_pid_file(path: &Path) -> anyhow::Result<i32> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read pid file {}", path.display()))?;
    data.trim()
        .parse()
        .with_context(|| format!("invalid pid in {}", path.display()))
}

/// Remove the pid file. Idempotent: a missing file is not an error.
pub fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove pid file {}: {}", path.display(), e);
        }
    }
}

/// Whether a process with this pid exists, probed with signal 0.
pub fn is_process_alive(pid: i32) -> bool {
    signal::kill(Pid::from_raw(pid), None).is_ok()
}

/// Resolve a path against the distribution root; absolute paths pass
/// through.
pub fn resolve_path(dist_root: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_owned()
    } else {
        dist_root.join(path)
    }
}

/// A `Stdio` that writes to the supervisor's stdout, so child stderr can
/// be merged into the single launcher output stream.
pub fn merged_stderr() -> io::Result<Stdio> {
    let fd = std::io::stdout().as_fd().try_clone_to_owned()?;
    Ok(Stdio::from(fd))
}
