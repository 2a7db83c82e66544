/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

//! `pylaunch` is a container-aware launcher for Python service
//! distributions. It replaces shell-based launch scripts with a native
//! binary that reads declarative YAML configuration, detects cgroup
//! memory limits, runs an RSS watchdog that sends SIGTERM before the OOM
//! killer fires SIGKILL, and manages process lifecycle end to end (pid
//! files, signal forwarding, readiness, graceful shutdown).

use std::path::Path;
use std::path::PathBuf;

use clap::Parser;
use clap::ValueEnum;
use pylaunch_common::config::load_configs;
use pylaunch_common::config::merge_configs;
use pylaunch_common::logging;
use pylaunch_supervisor::process::is_process_alive;
use pylaunch_supervisor::process::read_pid_file;
use pylaunch_supervisor::process::remove_pid_file;
use pylaunch_supervisor::supervisor::Supervisor;
use pylaunch_supervisor::supervisor::SupervisorParams;

mod manifest;

const DEFAULT_STATIC_CONFIG: &str = "service/bin/launcher-static.yml";
const DEFAULT_CUSTOM_CONFIG: &str = "var/conf/launcher-custom.yml";
const DEFAULT_CHECK_CONFIG: &str = "service/bin/launcher-check.yml";
const MANIFEST_PATH: &str = "deployment/manifest.yml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Startup,
    Check,
    Status,
}

#[derive(Parser)]
#[clap(name = "pylaunch", version)]
struct Opt {
    #[clap(
        long,
        value_name = "PATH",
        help = "Path to static launcher config (default: service/bin/launcher-static.yml)"
    )]
    static_config: Option<PathBuf>,

    #[clap(
        long,
        value_name = "PATH",
        help = "Path to custom launcher config (default: var/conf/launcher-custom.yml)"
    )]
    custom_config: Option<PathBuf>,

    #[clap(
        long,
        value_name = "PATH",
        help = "Distribution root directory (default: auto-detect from executable path)"
    )]
    dist_root: Option<PathBuf>,

    #[clap(long, value_enum, default_value = "startup")]
    mode: Mode,

    #[clap(long, help = "Run health check instead of starting the service")]
    check: bool,

    #[clap(long, help = "Check if the service is running")]
    status: bool,

    #[clap(long, value_name = "NAME", help = "Service name (from the manifest if omitted)")]
    service_name: Option<String>,

    #[clap(long, value_name = "VER", help = "Service version (from the manifest if omitted)")]
    service_version: Option<String>,
}

#[tokio::main]
async fn main() {
    let opt = Opt::parse();

    let mode = if opt.check {
        Mode::Check
    } else if opt.status {
        Mode::Status
    } else {
        opt.mode
    };

    let dist_root = match resolve_dist_root(opt.dist_root.clone()) {
        Ok(root) => root,
        Err(e) => {
            eprintln!("Failed to determine distribution root: {e:#}");
            std::process::exit(1);
        }
    };
    if let Err(e) = std::env::set_current_dir(&dist_root) {
        eprintln!(
            "Failed to chdir to distribution root {}: {e}",
            dist_root.display()
        );
        std::process::exit(1);
    }

    let code = match mode {
        Mode::Startup => do_startup(&opt, dist_root).await,
        Mode::Check => do_check(&opt, dist_root).await,
        Mode::Status => do_status(&opt),
    };
    std::process::exit(code);
}

async fn do_startup(opt: &Opt, dist_root: PathBuf) -> i32 {
    let (service_name, service_version) = resolve_identity(opt);

    let static_path = opt
        .static_config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STATIC_CONFIG));
    let custom_path = opt
        .custom_config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CUSTOM_CONFIG));

    launch(static_path, custom_path, dist_root, service_name, service_version).await
}

async fn do_check(opt: &Opt, dist_root: PathBuf) -> i32 {
    let check_path = Path::new(DEFAULT_CHECK_CONFIG);
    if !check_path.exists() {
        eprintln!("No health check configured (missing {DEFAULT_CHECK_CONFIG})");
        return 1;
    }

    let (service_name, _) = resolve_identity(opt);
    launch(
        check_path.to_owned(),
        PathBuf::from(DEFAULT_CUSTOM_CONFIG),
        dist_root,
        service_name,
        "check".to_owned(),
    )
    .await
}

async fn launch(
    static_path: PathBuf,
    custom_path: PathBuf,
    dist_root: PathBuf,
    service_name: String,
    service_version: String,
) -> i32 {
    let (static_config, custom_config) = match load_configs(&static_path, &custom_path) {
        Ok(configs) => configs,
        Err(e) => {
            eprintln!("Config error: {e:#}");
            return 1;
        }
    };

    let container_marker = std::env::var_os("CONTAINER").is_some();
    let config = match merge_configs(static_config, custom_config, container_marker) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Config error: {e:#}");
            return 1;
        }
    };

    if let Err(e) = logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e:#}");
        return 1;
    }

    tracing::info!(
        "pylaunch starting (service={}, version={})",
        service_name,
        service_version
    );

    let supervisor = Supervisor::new(
        SupervisorParams {
            dist_root,
            service_name,
            service_version,
        },
        config,
    );

    match supervisor.supervise().await {
        Ok(result) => {
            if result.watchdog_triggered {
                eprintln!("Process was terminated by RSS watchdog (OOM prevention)");
            }
            result.exit_code
        }
        Err(e) => {
            eprintln!("Launch failed: {e:#}");
            1
        }
    }
}

fn do_status(opt: &Opt) -> i32 {
    let (service_name, _) = resolve_identity(opt);
    let pid_path = PathBuf::from(format!("var/run/{service_name}.pid"));

    let pid = match read_pid_file(&pid_path) {
        Ok(pid) => pid,
        Err(_) => {
            eprintln!("Service not running (no pid file at {})", pid_path.display());
            return 1;
        }
    };

    if !is_process_alive(pid) {
        eprintln!("Service not running (stale pid file, pid={pid})");
        remove_pid_file(&pid_path);
        return 1;
    }

    println!("Service running: pid={pid}");
    0
}

/// Service name and version from flags, falling back to the SLS manifest,
/// falling back to placeholders.
fn resolve_identity(opt: &Opt) -> (String, String) {
    let mut name = opt.service_name.clone();
    let mut version = opt.service_version.clone();

    if name.is_none() || version.is_none() {
        match manifest::read_manifest(Path::new(MANIFEST_PATH)) {
            Ok(manifest) => {
                if name.is_none() {
                    name = manifest.product_name;
                }
                if version.is_none() {
                    version = manifest.product_version;
                }
            }
            Err(e) => {
                eprintln!("WARNING: failed to read manifest: {e:#}");
            }
        }
    }

    (
        name.unwrap_or_else(|| "unknown".to_owned()),
        version.unwrap_or_else(|| "0.0.0".to_owned()),
    )
}

/// The launcher binary lives at `service/bin/<arch>/pylaunch`, so the
/// distribution root is its fourth ancestor.
fn resolve_dist_root(flag: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(root) = flag {
        return Ok(root);
    }
    let exe = std::env::current_exe()?;
    exe.ancestors()
        .nth(4)
        .map(Path::to_owned)
        .ok_or_else(|| anyhow::anyhow!("executable path {} is too shallow", exe.display()))
}
