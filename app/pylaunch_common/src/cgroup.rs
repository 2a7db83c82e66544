/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

use std::io;
use std::io::ErrorKind;
use std::sync::Arc;

use crate::fs_view::FsView;
use crate::fs_view::HostFs;

/// Indicates cgroup v2 when present at the root of the unified hierarchy.
pub const CGROUP_V2_INDICATOR_PATH: &str = "sys/fs/cgroup/cgroup.controllers";

/// Memory limit file, cgroup v2. Contains a byte count or `max`.
pub const CGROUP_V2_MEMORY_MAX_PATH: &str = "sys/fs/cgroup/memory.max";

/// Memory limit file, cgroup v1. Unlimited is encoded as a huge number.
pub const CGROUP_V1_MEMORY_LIMIT_PATH: &str = "sys/fs/cgroup/memory/memory.limit_in_bytes";

/// Fallback source of total system memory.
pub const PROC_MEMINFO_PATH: &str = "proc/meminfo";

/// cgroup v1 reports "no limit" as a value near 2^63. Anything above this is
/// treated as unlimited.
const CGROUP_V1_UNLIMITED_THRESHOLD: u64 = 1 << 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V2,
    V1,
    /// No cgroup memory controller found; limits come from `/proc/meminfo`.
    Absent,
}

impl CgroupVersion {
    pub fn as_u32(self) -> u32 {
        match self {
            CgroupVersion::V2 => 2,
            CgroupVersion::V1 => 1,
            CgroupVersion::Absent => 0,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CgroupError {
    #[error("no cgroup memory controller found (checked v1 and v2 paths)")]
    NotFound,
    #[error("malformed value {content:?} in {path}")]
    MalformedValue { path: String, content: String },
    #[error("failed to read {path}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl CgroupError {
    fn io(path: &str, source: io::Error) -> Self {
        CgroupError::Io {
            path: path.to_owned(),
            source,
        }
    }

    fn malformed(path: &str, content: &str) -> Self {
        CgroupError::MalformedValue {
            path: path.to_owned(),
            content: content.to_owned(),
        }
    }
}

/// Reads cgroup memory limits through an injectable filesystem view.
///
/// A limit of `max` (v2) or an effectively-unlimited v1 value falls through
/// to `MemTotal` from `/proc/meminfo`; neither is an error.
pub struct CgroupProbe {
    fs: Arc<dyn FsView>,
}

impl CgroupProbe {
    pub fn new(fs: Arc<dyn FsView>) -> Self {
        Self { fs }
    }

    /// Probe over the host root. This is what production uses.
    pub fn host() -> Self {
        Self::new(Arc::new(HostFs::new()))
    }

    pub fn fs(&self) -> &Arc<dyn FsView> {
        &self.fs
    }

    /// cgroup v2 is indicated by `cgroup.controllers` at the hierarchy root;
    /// v1 by the presence of the memory controller's limit file.
    pub fn detect_version(&self) -> CgroupVersion {
        if self.fs.exists(CGROUP_V2_INDICATOR_PATH) {
            CgroupVersion::V2
        } else if self.fs.exists(CGROUP_V1_MEMORY_LIMIT_PATH) {
            CgroupVersion::V1
        } else {
            CgroupVersion::Absent
        }
    }

    /// Detect the cgroup version and read the memory limit in bytes.
    pub fn memory_limit(&self) -> Result<(CgroupVersion, u64), CgroupError> {
        let version = self.detect_version();
        let limit = self.read_memory_limit(version)?;
        Ok((version, limit))
    }

    fn read_memory_limit(&self, version: CgroupVersion) -> Result<u64, CgroupError> {
        let path = match version {
            CgroupVersion::V2 => CGROUP_V2_MEMORY_MAX_PATH,
            CgroupVersion::V1 => CGROUP_V1_MEMORY_LIMIT_PATH,
            CgroupVersion::Absent => return Err(CgroupError::NotFound),
        };

        let content = self
            .fs
            .read_to_string(path)
            .map_err(|e| CgroupError::io(path, e))?;
        let content = content.trim();

        // cgroup v2 spells "no limit" as the literal string `max`.
        if content == "max" {
            return self.system_memory();
        }

        let limit: u64 = content
            .parse()
            .map_err(|_| CgroupError::malformed(path, content))?;

        if version == CgroupVersion::V1 && limit > CGROUP_V1_UNLIMITED_THRESHOLD {
            return self.system_memory();
        }

        Ok(limit)
    }

    /// Total system memory from the `MemTotal:` line of `/proc/meminfo`,
    /// converted from kB to bytes.
    pub fn system_memory(&self) -> Result<u64, CgroupError> {
        let content = self
            .fs
            .read_to_string(PROC_MEMINFO_PATH)
            .map_err(|e| CgroupError::io(PROC_MEMINFO_PATH, e))?;

        for line in content.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                let kb: u64 = rest
                    .split_whitespace()
                    .next()
                    .and_then(|tok| tok.parse().ok())
                    .ok_or_else(|| CgroupError::malformed(PROC_MEMINFO_PATH, line))?;
                return Ok(kb * 1024);
            }
        }

        Err(CgroupError::Io {
            path: PROC_MEMINFO_PATH.to_owned(),
            source: io::Error::new(ErrorKind::NotFound, "MemTotal not found"),
        })
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::fs_view::MapFs;

    fn probe(files: Vec<(&str, &str)>) -> CgroupProbe {
        CgroupProbe::new(Arc::new(MapFs::new(files)))
    }

    #[test]
    fn test_detect_version_v2() {
        let p = probe(vec![(CGROUP_V2_INDICATOR_PATH, "cpu memory io")]);
        assert_eq!(p.detect_version(), CgroupVersion::V2);
    }

    #[test]
    fn test_detect_version_v1() {
        let p = probe(vec![(CGROUP_V1_MEMORY_LIMIT_PATH, "9223372036854771712")]);
        assert_eq!(p.detect_version(), CgroupVersion::V1);
    }

    #[test]
    fn test_detect_version_absent() {
        let p = probe(vec![]);
        assert_eq!(p.detect_version(), CgroupVersion::Absent);
        assert_matches!(p.memory_limit(), Err(CgroupError::NotFound));
    }

    #[test]
    fn test_v2_memory_limit() {
        let p = probe(vec![
            (CGROUP_V2_INDICATOR_PATH, ""),
            (CGROUP_V2_MEMORY_MAX_PATH, "1073741824\n"),
        ]);
        assert_eq!(p.memory_limit().unwrap(), (CgroupVersion::V2, 1073741824));
    }

    #[test]
    fn test_v2_max_falls_back_to_meminfo() {
        let p = probe(vec![
            (CGROUP_V2_INDICATOR_PATH, ""),
            (CGROUP_V2_MEMORY_MAX_PATH, "max\n"),
            (
                PROC_MEMINFO_PATH,
                "MemTotal:       16384256 kB\nMemFree:         1024 kB\n",
            ),
        ]);
        assert_eq!(
            p.memory_limit().unwrap(),
            (CgroupVersion::V2, 16384256 * 1024)
        );
    }

    #[test]
    fn test_v1_unlimited_falls_back_to_meminfo() {
        let p = probe(vec![
            (CGROUP_V1_MEMORY_LIMIT_PATH, "9223372036854771712\n"),
            (PROC_MEMINFO_PATH, "MemTotal: 8388608 kB\n"),
        ]);
        assert_eq!(
            p.memory_limit().unwrap(),
            (CgroupVersion::V1, 8388608 * 1024)
        );
    }

    #[test]
    fn test_v1_concrete_limit() {
        let p = probe(vec![(CGROUP_V1_MEMORY_LIMIT_PATH, "536870912")]);
        assert_eq!(p.memory_limit().unwrap(), (CgroupVersion::V1, 536870912));
    }

    #[test]
    fn test_malformed_limit() {
        let p = probe(vec![
            (CGROUP_V2_INDICATOR_PATH, ""),
            (CGROUP_V2_MEMORY_MAX_PATH, "not-a-number"),
        ]);
        assert_matches!(
            p.memory_limit(),
            Err(CgroupError::MalformedValue { content, .. }) if content == "not-a-number"
        );
    }

    #[test]
    fn test_meminfo_without_memtotal() {
        let p = probe(vec![
            (CGROUP_V2_INDICATOR_PATH, ""),
            (CGROUP_V2_MEMORY_MAX_PATH, "max"),
            (PROC_MEMINFO_PATH, "MemFree: 1024 kB\n"),
        ]);
        assert_matches!(p.memory_limit(), Err(CgroupError::Io { .. }));
    }
}
