/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

//! SLS deployment manifest metadata.

use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

/// The slice of `deployment/manifest.yml` the launcher cares about.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Manifest {
    pub product_name: Option<String>,
    pub product_version: Option<String>,
}

pub fn read_manifest(path: &Path) -> anyhow::Result<Manifest> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    let manifest: Manifest = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse manifest {}", path.display()))?;
    if manifest.product_name.is_none() {
        anyhow::bail!("product-name not found in {}", path.display());
    }
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.yml");
        std::fs::write(
            &path,
            "manifest-version: \"1.0\"\nproduct-group: com.example\nproduct-name: my-service\nproduct-version: 1.2.3\n",
        )
        .unwrap();

        let manifest = read_manifest(&path).unwrap();
        assert_eq!(manifest.product_name.as_deref(), Some("my-service"));
        assert_eq!(manifest.product_version.as_deref(), Some("1.2.3"));
    }

    #[test]
    fn test_manifest_without_product_name_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.yml");
        std::fs::write(&path, "product-version: 1.2.3\n").unwrap();
        assert!(read_manifest(&path).is_err());
    }
}
