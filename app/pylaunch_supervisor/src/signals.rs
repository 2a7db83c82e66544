/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

//! Signal forwarding from the supervisor to the child.

use std::sync::Arc;

use nix::sys::signal;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use pylaunch_common::liveliness::LivelinessObserver;
use tokio::signal::unix::signal as unix_signal;
use tokio::signal::unix::SignalKind;

/// Relay SIGTERM, SIGINT, and SIGHUP to the child until cancelled.
///
/// Each received signal is forwarded once. A child that is already gone is
/// not an error; the supervisor's wait path owns that observation.
/// Cancellation closes the subscription without side effects.
pub async fn forward_signals(
    pid: i32,
    observer: Arc<dyn LivelinessObserver>,
) -> anyhow::Result<()> {
    let mut term = unix_signal(SignalKind::terminate())?;
    let mut int = unix_signal(SignalKind::interrupt())?;
    let mut hup = unix_signal(SignalKind::hangup())?;

    loop {
        let forwarded = tokio::select! {
            _ = observer.while_alive() => return Ok(()),
            _ = term.recv() => Signal::SIGTERM,
            _ = int.recv() => Signal::SIGINT,
            _ = hup.recv() => Signal::SIGHUP,
        };

        tracing::info!("Forwarding {} to pid {}", forwarded, pid);
        if let Err(e) = signal::kill(Pid::from_raw(pid), forwarded) {
            tracing::info!("Failed to forward {} to pid {}: {}", forwarded, pid, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt;
    use std::time::Duration;

    use pylaunch_common::liveliness::LivelinessGuard;

    use super::*;

    #[tokio::test]
    async fn test_cancellation_closes_forwarder() {
        let (observer, guard) = LivelinessGuard::create();
        let handle = tokio::spawn(forward_signals(std::process::id() as i32, observer));
        drop(guard);

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("forwarder should close on cancellation")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_forward_sighup_to_child() {
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "sleep 120"])
            .spawn()
            .unwrap();
        let pid = child.id().unwrap() as i32;

        let (observer, guard) = LivelinessGuard::create();
        let forwarder = tokio::spawn(forward_signals(pid, observer));
        // Let the forwarder install its handlers before raising.
        tokio::time::sleep(Duration::from_millis(200)).await;

        // Raise SIGHUP against ourselves; the forwarder relays it.
        signal::kill(Pid::from_raw(std::process::id() as i32), Signal::SIGHUP).unwrap();

        let status = tokio::time::timeout(Duration::from_secs(10), child.wait())
            .await
            .expect("child should die of the forwarded SIGHUP")
            .unwrap();
        assert_eq!(status.signal(), Some(libc::SIGHUP));

        drop(guard);
        forwarder.await.unwrap().unwrap();
    }
}
