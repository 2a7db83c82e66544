/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;

/// Read-only filesystem view addressed by paths relative to some root.
///
/// The cgroup probe and CPU detection read `/sys` and `/proc` through this
/// trait so that tests can supply synthetic hierarchies.
pub trait FsView: Send + Sync {
    /// Whether `path` (relative, no leading slash) exists under the root.
    fn exists(&self, path: &str) -> bool;

    /// Read the file at `path` (relative, no leading slash) as UTF-8.
    fn read_to_string(&self, path: &str) -> io::Result<String>;
}

/// The host filesystem, rooted at `/` by default.
pub struct HostFs {
    root: PathBuf,
}

impl HostFs {
    pub fn new() -> Self {
        Self::rooted_at("/")
    }

    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for HostFs {
    fn default() -> Self {
        Self::new()
    }
}

impl FsView for HostFs {
    fn exists(&self, path: &str) -> bool {
        self.root.join(path).exists()
    }

    fn read_to_string(&self, path: &str) -> io::Result<String> {
        std::fs::read_to_string(self.root.join(path))
    }
}

/// In-memory view over a fixed set of files. Test double, but exported so
/// downstream crates can build synthetic cgroup trees in their own tests.
pub struct MapFs {
    files: HashMap<String, String>,
}

impl MapFs {
    pub fn new(files: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>) -> Self {
        Self {
            files: files
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn empty() -> Self {
        Self {
            files: HashMap::new(),
        }
    }
}

impl FsView for MapFs {
    fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    fn read_to_string(&self, path: &str) -> io::Result<String> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no such file: {path}")))
    }
}
