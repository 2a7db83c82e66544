/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

//! The supervisory engine: everything between "configuration has been
//! resolved" and "child has exited".
//!
//! The [`supervisor::Supervisor`] composes the child's command line and
//! environment, applies resource limits, spawns the primary process and
//! its sidecars, and runs the RSS watchdog, readiness probe, and signal
//! forwarder until the primary exits.

pub mod command;
pub mod env;
pub mod process;
pub mod readiness;
pub mod rlimit;
pub mod sidecar;
pub mod signals;
pub mod supervisor;
pub mod watchdog;
