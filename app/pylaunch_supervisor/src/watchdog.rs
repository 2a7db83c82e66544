/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

//! RSS watchdog.
//!
//! Monitors the resident set size of the primary child and sends SIGTERM
//! when it crosses the hard threshold, so the service gets a graceful
//! shutdown window before the kernel OOM killer would SIGKILL it.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use pylaunch_common::config::ResolvedWatchdog;
use pylaunch_common::limits::format_bytes;
use pylaunch_common::limits::MemoryLimits;
use pylaunch_common::liveliness::LivelinessObserver;
use tokio::time::MissedTickBehavior;

use crate::process::is_process_alive;

/// State transitions only move forward, with one exception: a process
/// whose RSS falls back below the soft threshold recovers to `Healthy`.
/// Once `HardLimit` is reached there is no way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WatchdogState {
    Healthy,
    SoftWarning,
    HardLimit,
    Terminating,
}

impl fmt::Display for WatchdogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchdogState::Healthy => write!(f, "healthy"),
            WatchdogState::SoftWarning => write!(f, "soft_warning"),
            WatchdogState::HardLimit => write!(f, "hard_limit"),
            WatchdogState::Terminating => write!(f, "terminating"),
        }
    }
}

type RssReader = Box<dyn Fn(i32) -> io::Result<u64> + Send>;

pub struct RssWatchdog {
    pid: i32,
    limits: MemoryLimits,
    config: ResolvedWatchdog,
    state: WatchdogState,
    read_rss: RssReader,
}

impl RssWatchdog {
    pub fn new(pid: i32, limits: MemoryLimits, config: ResolvedWatchdog) -> Self {
        Self {
            pid,
            limits,
            config,
            state: WatchdogState::Healthy,
            read_rss: Box::new(read_process_rss),
        }
    }

    /// Replace the RSS source. Tests feed synthetic sequences through this.
    pub fn with_rss_reader(
        mut self,
        read_rss: impl Fn(i32) -> io::Result<u64> + Send + 'static,
    ) -> Self {
        self.read_rss = Box::new(read_rss);
        self
    }

    /// Poll until cancelled or triggered. Returns whether the watchdog
    /// terminated the process.
    ///
    /// Cancellation stops polling within one interval but does NOT cancel
    /// a SIGKILL already scheduled by [`Self::terminate_process`]: that is
    /// a safety commitment that must complete.
    pub async fn run(mut self, observer: Arc<dyn LivelinessObserver>) -> bool {
        if self.limits.hard_kill_bytes == 0 {
            tracing::info!("No memory limit configured, watchdog disabled");
            return false;
        }

        let interval = Duration::from_secs(self.config.poll_interval_seconds);
        let mut ticker = tokio::time::interval(interval);
        // Overruns shift subsequent ticks; they never accumulate.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            "Watchdog started: pid={} soft_warn={} hard_kill={} poll={:?} grace={}s",
            self.pid,
            format_bytes(self.limits.soft_warn_bytes),
            format_bytes(self.limits.hard_kill_bytes),
            interval,
            self.config.grace_period_seconds,
        );

        loop {
            tokio::select! {
                _ = observer.while_alive() => return false,
                _ = ticker.tick() => {
                    if self.check() {
                        return true;
                    }
                }
            }
        }
    }

    /// One RSS reading and state transition. Returns whether termination
    /// was triggered.
    fn check(&mut self) -> bool {
        let rss = match (self.read_rss)(self.pid) {
            Ok(rss) => rss,
            Err(e) => {
                // Process likely exited; the supervisor's wait path will
                // observe that on its own.
                tracing::info!("Failed to read RSS for pid {}: {}", self.pid, e);
                return false;
            }
        };

        if rss >= self.limits.hard_kill_bytes && self.state < WatchdogState::HardLimit {
            self.state = WatchdogState::HardLimit;
            tracing::error!(
                "HARD LIMIT EXCEEDED: rss={} limit={} ({:.1}% of cgroup limit {}). Sending SIGTERM to pid {}.",
                format_bytes(rss),
                format_bytes(self.limits.hard_kill_bytes),
                rss as f64 / self.limits.cgroup_limit_bytes as f64 * 100.0,
                format_bytes(self.limits.cgroup_limit_bytes),
                self.pid,
            );
            self.terminate_process();
            return true;
        }

        if rss >= self.limits.soft_warn_bytes && self.state < WatchdogState::SoftWarning {
            self.state = WatchdogState::SoftWarning;
            tracing::warn!(
                "SOFT WARNING: rss={} warn_at={} ({:.1}% of cgroup limit {}). Process will be terminated at {}.",
                format_bytes(rss),
                format_bytes(self.limits.soft_warn_bytes),
                rss as f64 / self.limits.cgroup_limit_bytes as f64 * 100.0,
                format_bytes(self.limits.cgroup_limit_bytes),
                format_bytes(self.limits.hard_kill_bytes),
            );
        } else if rss < self.limits.soft_warn_bytes && self.state == WatchdogState::SoftWarning {
            self.state = WatchdogState::Healthy;
            tracing::info!(
                "RSS recovered: rss={}, back below soft warning threshold",
                format_bytes(rss)
            );
        }

        false
    }

    /// SIGTERM now, SIGKILL after the grace period. The kill task is
    /// detached from the watchdog's cancellation on purpose; if the child
    /// exits within the window, the signal-0 probe makes it a no-op.
    fn terminate_process(&mut self) {
        self.state = WatchdogState::Terminating;

        if let Err(e) = signal::kill(Pid::from_raw(self.pid), Signal::SIGTERM) {
            tracing::warn!("Failed to send SIGTERM to pid {}: {}", self.pid, e);
            return;
        }

        let pid = self.pid;
        let grace = Duration::from_secs(self.config.grace_period_seconds);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if is_process_alive(pid) {
                tracing::warn!(
                    "Grace period ({:?}) expired, sending SIGKILL to pid {}",
                    grace,
                    pid
                );
                let _ = signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
            }
        });
    }
}

/// RSS of a process in bytes: the second field of `/proc/<pid>/statm` is
/// the resident set in pages.
pub fn read_process_rss(pid: i32) -> io::Result<u64> {
    let data = std::fs::read_to_string(format!("/proc/{pid}/statm"))?;
    Ok(parse_statm_rss(&data)? * page_size())
}

/// RSS of a process and all its descendants. Forking workers (gunicorn,
/// multiprocessing) hold memory in children that the single-process
/// reader misses; the default remains the single-process reader because
/// the recursive walk races against short-lived children.
pub fn read_process_rss_with_children(pid: i32) -> io::Result<u64> {
    let mut total = read_process_rss(pid)?;

    let Ok(children) = child_pids(pid) else {
        // Child enumeration may fail transiently.
        return Ok(total);
    };
    for child in children {
        // A child may exit mid-walk.
        if let Ok(rss) = read_process_rss_with_children(child) {
            total += rss;
        }
    }
    Ok(total)
}

/// Direct children from `/proc/<pid>/task/<pid>/children`.
fn child_pids(pid: i32) -> io::Result<Vec<i32>> {
    let data = std::fs::read_to_string(format!("/proc/{pid}/task/{pid}/children"))?;
    Ok(data
        .split_whitespace()
        .filter_map(|tok| tok.parse().ok())
        .collect())
}

fn parse_statm_rss(data: &str) -> io::Result<u64> {
    data.split_whitespace()
        .nth(1)
        .and_then(|tok| tok.parse().ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected statm format: {data:?}"),
            )
        })
}

fn page_size() -> u64 {
    // SAFETY: sysconf has no memory-safety preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 { sz as u64 } else { 4096 }
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt;
    use std::sync::Mutex;

    use pylaunch_common::liveliness::LivelinessGuard;
    use pylaunch_common::liveliness::NoopLivelinessObserver;

    use super::*;

    const SOFT: u64 = 850;
    const HARD: u64 = 950;

    fn limits() -> MemoryLimits {
        MemoryLimits {
            cgroup_limit_bytes: 1000,
            effective_limit_bytes: 675,
            soft_warn_bytes: SOFT,
            hard_kill_bytes: HARD,
            cgroup_version: 2,
            is_container: true,
        }
    }

    fn config() -> ResolvedWatchdog {
        ResolvedWatchdog {
            poll_interval_seconds: 1,
            grace_period_seconds: 1,
            ..Default::default()
        }
    }

    /// Feeds a fixed sequence of readings, repeating the last forever.
    fn sequence_reader(seq: Vec<u64>) -> impl Fn(i32) -> io::Result<u64> + Send {
        let remaining = Mutex::new(seq);
        move |_pid| {
            let mut remaining = remaining.lock().unwrap();
            if remaining.len() > 1 {
                Ok(remaining.remove(0))
            } else {
                Ok(remaining[0])
            }
        }
    }

    async fn spawn_sleeper(ignore_term: bool) -> tokio::process::Child {
        let script = if ignore_term {
            "trap '' TERM; sleep 120"
        } else {
            "sleep 120"
        };
        tokio::process::Command::new("sh")
            .args(["-c", script])
            .spawn()
            .unwrap()
    }

    #[test]
    fn test_parse_statm() {
        assert_eq!(parse_statm_rss("12345 678 90 12 0 345 0\n").unwrap(), 678);
        assert!(parse_statm_rss("12345").is_err());
        assert!(parse_statm_rss("").is_err());
    }

    #[test]
    fn test_read_own_rss() {
        let rss = read_process_rss(std::process::id() as i32).unwrap();
        assert!(rss > 0);
        let with_children = read_process_rss_with_children(std::process::id() as i32).unwrap();
        assert!(with_children >= rss);
    }

    #[test]
    fn test_state_ordering() {
        assert!(WatchdogState::Healthy < WatchdogState::SoftWarning);
        assert!(WatchdogState::SoftWarning < WatchdogState::HardLimit);
        assert!(WatchdogState::HardLimit < WatchdogState::Terminating);
        assert_eq!(WatchdogState::SoftWarning.to_string(), "soft_warning");
    }

    #[tokio::test]
    async fn test_disabled_without_hard_limit() {
        let watchdog = RssWatchdog::new(1, MemoryLimits::default(), config());
        assert!(!watchdog.run(NoopLivelinessObserver::create()).await);
    }

    #[tokio::test]
    async fn test_state_trace_through_synthetic_sequence() {
        let mut child = spawn_sleeper(false).await;
        let pid = child.id().unwrap() as i32;

        let mut watchdog = RssWatchdog::new(pid, limits(), config())
            .with_rss_reader(sequence_reader(vec![SOFT - 1, SOFT + 1, SOFT + 1, HARD + 1]));

        assert!(!watchdog.check());
        assert_eq!(watchdog.state, WatchdogState::Healthy);
        assert!(!watchdog.check());
        assert_eq!(watchdog.state, WatchdogState::SoftWarning);
        assert!(!watchdog.check());
        assert_eq!(watchdog.state, WatchdogState::SoftWarning);
        assert!(watchdog.check());
        assert_eq!(watchdog.state, WatchdogState::Terminating);

        let status = child.wait().await.unwrap();
        assert_eq!(status.signal(), Some(libc::SIGTERM));
    }

    #[tokio::test]
    async fn test_soft_recovery() {
        let mut watchdog = RssWatchdog::new(1, limits(), config())
            .with_rss_reader(sequence_reader(vec![SOFT + 1, SOFT - 1]));

        assert!(!watchdog.check());
        assert_eq!(watchdog.state, WatchdogState::SoftWarning);
        assert!(!watchdog.check());
        assert_eq!(watchdog.state, WatchdogState::Healthy);
    }

    #[tokio::test]
    async fn test_read_error_is_not_a_trigger() {
        let mut watchdog = RssWatchdog::new(1, limits(), config())
            .with_rss_reader(|_| Err(io::Error::new(io::ErrorKind::NotFound, "gone")));

        assert!(!watchdog.check());
        assert_eq!(watchdog.state, WatchdogState::Healthy);
    }

    #[tokio::test]
    async fn test_run_triggers_and_returns() {
        let mut child = spawn_sleeper(false).await;
        let pid = child.id().unwrap() as i32;

        let watchdog = RssWatchdog::new(pid, limits(), config())
            .with_rss_reader(sequence_reader(vec![HARD + 1]));

        let triggered = tokio::time::timeout(
            Duration::from_secs(10),
            watchdog.run(NoopLivelinessObserver::create()),
        )
        .await
        .unwrap();
        assert!(triggered);

        let status = child.wait().await.unwrap();
        assert_eq!(status.signal(), Some(libc::SIGTERM));
    }

    #[tokio::test]
    async fn test_cancellation_stops_polling() {
        let (observer, guard) = LivelinessGuard::create();
        let watchdog =
            RssWatchdog::new(1, limits(), config()).with_rss_reader(sequence_reader(vec![0]));

        let handle = tokio::spawn(watchdog.run(observer));
        drop(guard);

        let triggered = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("run should end promptly after cancellation")
            .unwrap();
        assert!(!triggered);
    }

    #[tokio::test]
    async fn test_sigkill_after_grace_when_sigterm_ignored() {
        let mut child = spawn_sleeper(true).await;
        let pid = child.id().unwrap() as i32;
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let watchdog = RssWatchdog::new(pid, limits(), config())
            .with_rss_reader(sequence_reader(vec![HARD + 1]));
        assert!(watchdog.run(NoopLivelinessObserver::create()).await);

        let status = tokio::time::timeout(Duration::from_secs(10), child.wait())
            .await
            .expect("child should be SIGKILLed after the grace period")
            .unwrap();
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }
}
