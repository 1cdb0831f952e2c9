use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    fetcher::{ContentFetcher, FetchError},
    fingerprint::fingerprint,
    notifier::{ChangeAlert, Notifier},
    snapshot::{SnapshotStore, StoreError},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// First observation was persisted; nothing to compare against, no alert.
    Initialized,
    Unchanged,
    /// Baseline replaced and the notifier was invoked.
    Changed,
    /// Nothing was written.
    Failed,
}

impl CycleOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Unchanged => "unchanged",
            Self::Changed => "changed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug)]
pub enum CycleError {
    Fetch(FetchError),
    Store(StoreError),
}

impl std::fmt::Display for CycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fetch(e) => write!(f, "fetch: {e}"),
            Self::Store(e) => write!(f, "store: {e}"),
        }
    }
}

impl std::error::Error for CycleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Fetch(e) => Some(e),
            Self::Store(e) => Some(e),
        }
    }
}

#[derive(Debug)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub at: DateTime<Utc>,
    pub digest: Option<String>,
    pub error: Option<CycleError>,
    /// Set when a `Changed` cycle could not deliver its alert.
    pub notify_error: Option<String>,
}

impl CycleReport {
    fn ok(outcome: CycleOutcome, at: DateTime<Utc>, digest: String) -> Self {
        Self {
            outcome,
            at,
            digest: Some(digest),
            error: None,
            notify_error: None,
        }
    }

    fn failed(at: DateTime<Utc>, digest: Option<String>, error: CycleError) -> Self {
        Self {
            outcome: CycleOutcome::Failed,
            at,
            digest,
            error: Some(error),
            notify_error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub target_url: String,
    pub fetch_timeout: Duration,
}

/// One fetch, compare, persist, notify pass over a single target.
pub struct MonitorCycle {
    fetcher: Arc<dyn ContentFetcher>,
    notifier: Arc<dyn Notifier>,
    // Held for the whole cycle; a second caller waits instead of interleaving.
    store: Mutex<Box<dyn SnapshotStore>>,
    opts: MonitorOptions,
}

impl MonitorCycle {
    pub fn new(
        fetcher: Arc<dyn ContentFetcher>,
        notifier: Arc<dyn Notifier>,
        store: Box<dyn SnapshotStore>,
        opts: MonitorOptions,
    ) -> Self {
        Self {
            fetcher,
            notifier,
            store: Mutex::new(store),
            opts,
        }
    }

    pub async fn run_once(&self) -> CycleReport {
        let mut store = self.store.lock().await;
        let report = self.run_locked(&mut **store).await;
        log_report(&report, self.fetcher.name());
        report
    }

    async fn run_locked(&self, store: &mut dyn SnapshotStore) -> CycleReport {
        let fetched = tokio::time::timeout(self.opts.fetch_timeout, self.fetcher.fetch()).await;
        let content = match fetched {
            Ok(Ok(content)) => content,
            Ok(Err(err)) => return CycleReport::failed(Utc::now(), None, CycleError::Fetch(err)),
            Err(_) => {
                return CycleReport::failed(
                    Utc::now(),
                    None,
                    CycleError::Fetch(FetchError::Timeout {
                        after: self.opts.fetch_timeout,
                    }),
                );
            }
        };

        let at = Utc::now();
        let digest = fingerprint(&content);

        let previous = match store.load() {
            Ok(previous) => previous,
            Err(err) => return CycleReport::failed(at, Some(digest), CycleError::Store(err)),
        };

        let Some(previous) = previous else {
            return match store.save(&content, &digest, at) {
                Ok(_) => CycleReport::ok(CycleOutcome::Initialized, at, digest),
                Err(err) => CycleReport::failed(at, Some(digest), CycleError::Store(err)),
            };
        };

        if previous.digest == digest {
            return CycleReport::ok(CycleOutcome::Unchanged, at, digest);
        }

        // Persist before notifying: an alert must never go out for a change
        // the next cycle would detect again.
        if let Err(err) = store.save(&content, &digest, at) {
            return CycleReport::failed(at, Some(digest), CycleError::Store(err));
        }

        let alert = ChangeAlert {
            target_url: self.opts.target_url.clone(),
            detected_at: at,
            content,
        };
        let mut report = CycleReport::ok(CycleOutcome::Changed, at, digest);
        if let Err(err) = self.notifier.notify(&alert).await {
            warn!(
                notifier = self.notifier.name(),
                error = %err,
                "change alert failed; baseline already updated, not retrying"
            );
            report.notify_error = Some(err.to_string());
        } else {
            info!(notifier = self.notifier.name(), "change alert sent");
        }
        report
    }
}

fn log_report(report: &CycleReport, fetcher: &'static str) {
    let digest = report.digest.as_deref().unwrap_or("-");
    match report.outcome {
        CycleOutcome::Initialized => info!(
            outcome = report.outcome.as_str(),
            at = %report.at,
            digest,
            "no previous snapshot found; saved initial state"
        ),
        CycleOutcome::Unchanged => info!(
            outcome = report.outcome.as_str(),
            at = %report.at,
            digest,
            "no change detected"
        ),
        CycleOutcome::Changed => info!(
            outcome = report.outcome.as_str(),
            at = %report.at,
            digest,
            "change detected; snapshot replaced"
        ),
        CycleOutcome::Failed => {
            let error = report
                .error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            warn!(
                outcome = report.outcome.as_str(),
                at = %report.at,
                fetcher,
                error = %error,
                "check failed; snapshot untouched"
            )
        }
    }
}
