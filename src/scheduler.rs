use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::{sync::RwLock, time::MissedTickBehavior};
use tracing::{info, warn};

use crate::{
    config::Config,
    monitor::{CycleOutcome, MonitorCycle},
};

// Repeated failures get an extra log line carrying the streak length.
const FAILURE_STREAK_WARN_AT: u32 = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorStatus {
    pub last_outcome: Option<CycleOutcome>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_change_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub cycles_run: u64,
    pub consecutive_failures: u32,
}

#[derive(Clone, Default)]
pub struct MonitorStatusHandle {
    inner: Arc<RwLock<MonitorStatus>>,
}

impl MonitorStatusHandle {
    pub async fn snapshot(&self) -> MonitorStatus {
        self.inner.read().await.clone()
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub interval: Duration,
}

impl SchedulerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: config.check_interval,
        }
    }
}

/// Runs `cycle` right away and then once per interval until the task is aborted.
///
/// Each cycle is awaited before the next tick is taken, so a cycle that
/// overruns the interval delays the schedule rather than overlapping.
pub fn spawn_scheduler(
    cycle: Arc<MonitorCycle>,
    opts: SchedulerOptions,
) -> (MonitorStatusHandle, tokio::task::JoinHandle<()>) {
    let status = MonitorStatusHandle::default();
    let status_clone = status.clone();

    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(opts.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            info!("checking for updates");

            let report = cycle.run_once().await;

            let mut snap = status_clone.inner.write().await;
            snap.cycles_run = snap.cycles_run.saturating_add(1);
            snap.last_outcome = Some(report.outcome);
            snap.last_run_at = Some(report.at);

            match report.outcome {
                CycleOutcome::Failed => {
                    snap.consecutive_failures = snap.consecutive_failures.saturating_add(1);
                    snap.last_error = report.error.as_ref().map(ToString::to_string);
                    if snap.consecutive_failures >= FAILURE_STREAK_WARN_AT {
                        warn!(
                            consecutive_failures = snap.consecutive_failures,
                            next_check_in_secs = opts.interval.as_secs(),
                            "target still failing"
                        );
                    }
                }
                outcome => {
                    if snap.consecutive_failures >= FAILURE_STREAK_WARN_AT {
                        info!(
                            consecutive_failures = snap.consecutive_failures,
                            "target recovered"
                        );
                    }
                    snap.consecutive_failures = 0;
                    snap.last_error = None;
                    if outcome == CycleOutcome::Changed {
                        snap.last_change_at = Some(report.at);
                    }
                }
            }
        }
    });

    (status, task)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;

    use crate::{
        fetcher::{ContentFetcher, FetchError, FetchFuture},
        monitor::{
            MonitorOptions,
            tests::{RecordingNotifier, ScriptedFetcher},
        },
        snapshot::JsonSnapshotStore,
    };

    fn cycle_with(dir: &std::path::Path, fetcher: Arc<dyn ContentFetcher>) -> Arc<MonitorCycle> {
        Arc::new(MonitorCycle::new(
            fetcher,
            Arc::new(RecordingNotifier::default()),
            Box::new(JsonSnapshotStore::open(dir.join("stored_data.json")).unwrap()),
            MonitorOptions {
                target_url: "https://example.com/".to_string(),
                fetch_timeout: Duration::from_secs(5),
            },
        ))
    }

    async fn wait_until_cycles(status: &MonitorStatusHandle, n: u64) -> MonitorStatus {
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let snap = status.snapshot().await;
                if snap.cycles_run >= n {
                    return snap;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn first_cycle_runs_immediately() {
        let tmp = tempfile::tempdir().unwrap();
        let fetcher = ScriptedFetcher::always("A");
        let (status, task) = spawn_scheduler(
            cycle_with(tmp.path(), fetcher.clone()),
            SchedulerOptions {
                interval: Duration::from_secs(3600),
            },
        );

        let snap = wait_until_cycles(&status, 1).await;
        assert_eq!(snap.last_outcome, Some(CycleOutcome::Initialized));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        task.abort();
    }

    #[tokio::test]
    async fn cycles_repeat_on_interval() {
        let tmp = tempfile::tempdir().unwrap();
        let (status, task) = spawn_scheduler(
            cycle_with(tmp.path(), ScriptedFetcher::always("A")),
            SchedulerOptions {
                interval: Duration::from_millis(20),
            },
        );

        let snap = wait_until_cycles(&status, 3).await;
        assert_eq!(snap.last_outcome, Some(CycleOutcome::Unchanged));
        assert_eq!(snap.consecutive_failures, 0);
        task.abort();
    }

    #[tokio::test]
    async fn failures_are_counted_and_reset_on_success() {
        let tmp = tempfile::tempdir().unwrap();
        let down = || {
            Err(FetchError::Http {
                message: "connection refused".to_string(),
            })
        };
        let fetcher = ScriptedFetcher::new(vec![
            down(),
            down(),
            down(),
            Ok("A".to_string()),
            Ok("B".to_string()),
        ]);
        let (status, task) = spawn_scheduler(
            cycle_with(tmp.path(), fetcher),
            SchedulerOptions {
                interval: Duration::from_millis(100),
            },
        );

        let snap = wait_until_cycles(&status, 3).await;
        assert_eq!(snap.consecutive_failures, 3);
        assert!(snap.last_error.unwrap().contains("connection refused"));

        let snap = wait_until_cycles(&status, 5).await;
        assert_eq!(snap.last_outcome, Some(CycleOutcome::Changed));
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.last_error, None);
        assert_eq!(snap.last_change_at, snap.last_run_at);
        task.abort();
    }

    struct SlowFetcher {
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    impl ContentFetcher for SlowFetcher {
        fn fetch(&self) -> FetchFuture {
            let in_flight = self.in_flight.clone();
            let max_in_flight = self.max_in_flight.clone();
            Box::pin(async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(60)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok("A".to_string())
            })
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    #[tokio::test]
    async fn overrunning_cycle_delays_next_tick_instead_of_overlapping() {
        let tmp = tempfile::tempdir().unwrap();
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let fetcher = Arc::new(SlowFetcher {
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: max_in_flight.clone(),
        });
        let (status, task) = spawn_scheduler(
            cycle_with(tmp.path(), fetcher),
            SchedulerOptions {
                interval: Duration::from_millis(10),
            },
        );

        wait_until_cycles(&status, 4).await;
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        task.abort();
    }
}
