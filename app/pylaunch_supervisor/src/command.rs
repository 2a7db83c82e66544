/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

use pylaunch_common::config::LaunchMode;
use pylaunch_common::config::ResolvedConfig;

const DEFAULT_INTERPRETER: &str = "python3";

/// Assemble the child's argv for the configured launch mode.
///
/// - `pex`:      `[python_path] [python_opts...] <executable> [args...]`
///   (no interpreter prefix when `python_path` is empty — the PEX is
///   self-executing, and `python_opts` only apply with a prefix)
/// - `module`:   `python [python_opts...] -m <executable> [args...]`
/// - `script`:   `python [python_opts...] <executable> [args...]`
/// - `uvicorn`:  `python [python_opts...] -m uvicorn <executable>[:<entry_point>] [args...]`
/// - `gunicorn`: `python [python_opts...] -m gunicorn <executable>[:<entry_point>] [args...]`
/// - `command`:  `<executable> [args...]` — no Python wrapper
pub fn build_command_args(config: &ResolvedConfig) -> Vec<String> {
    match config.launch_mode {
        LaunchMode::Command => {
            let mut args = vec![config.executable.clone()];
            args.extend(config.args.iter().cloned());
            args
        }

        LaunchMode::Module => build_python_args(config, &["-m", &config.executable]),

        LaunchMode::Script => build_python_args(config, &[&config.executable]),

        LaunchMode::Uvicorn => {
            let app_spec = app_spec(config);
            build_python_args(config, &["-m", "uvicorn", &app_spec])
        }

        LaunchMode::Gunicorn => {
            let app_spec = app_spec(config);
            build_python_args(config, &["-m", "gunicorn", &app_spec])
        }

        LaunchMode::Pex => {
            let mut args = Vec::new();
            if !config.python_path.is_empty() {
                args.push(expand_env_vars(&config.python_path));
                args.extend(config.python_opts.iter().cloned());
            }
            args.push(config.executable.clone());
            args.extend(config.args.iter().cloned());
            args
        }
    }
}

fn app_spec(config: &ResolvedConfig) -> String {
    if config.entry_point.is_empty() {
        config.executable.clone()
    } else {
        format!("{}:{}", config.executable, config.entry_point)
    }
}

/// `[python] [opts...] [extra...] [config.args...]`
fn build_python_args(config: &ResolvedConfig, extra: &[&str]) -> Vec<String> {
    let python = if config.python_path.is_empty() {
        DEFAULT_INTERPRETER
    } else {
        &config.python_path
    };

    let mut args = vec![expand_env_vars(python)];
    args.extend(config.python_opts.iter().cloned());
    args.extend(extra.iter().map(|s| (*s).to_owned()));
    args.extend(config.args.iter().cloned());
    args
}

/// Expand `$VAR` and `${VAR}` references against the process environment.
/// Undefined references are left literal rather than erased.
pub fn expand_env_vars(path: &str) -> String {
    expand_env_vars_with(path, |name| std::env::var(name).ok())
}

pub(crate) fn expand_env_vars_with(
    path: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> String {
    let mut out = String::with_capacity(path.len());
    let mut chars = path.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        match chars.peek() {
            Some((_, '{')) => {
                // ${VAR}: scan to the closing brace.
                let rest = &path[i + 2..];
                match rest.find('}') {
                    Some(end) => {
                        let name = &rest[..end];
                        match lookup(name) {
                            Some(value) => out.push_str(&value),
                            None => {
                                out.push_str(&path[i..i + 2 + end + 1]);
                            }
                        }
                        chars.next(); // consume '{'
                        for _ in 0..end + 1 {
                            chars.next();
                        }
                    }
                    None => out.push(c),
                }
            }
            Some((_, c2)) if c2.is_ascii_alphabetic() || *c2 == '_' => {
                // $VAR: name is [A-Za-z_][A-Za-z0-9_]*.
                let rest = &path[i + 1..];
                let end = rest
                    .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
                    .unwrap_or(rest.len());
                let name = &rest[..end];
                match lookup(name) {
                    Some(value) => out.push_str(&value),
                    None => out.push_str(&path[i..i + 1 + end]),
                }
                for _ in 0..end {
                    chars.next();
                }
            }
            _ => out.push(c),
        }
    }

    out
}
