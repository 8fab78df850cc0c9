//! Periodic audit record cleanup.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Duration as ChronoDuration;

use crate::clock::Clock;
use crate::config::AuditLogConfig;
use crate::store::CredentialStore;

/// Granularity at which a sleeping task notices a stop request. Also the
/// shortest interval between runs.
const STOP_POLL: Duration = Duration::from_millis(50);

/// Deletes audit records older than the retention window.
pub struct AuditRetentionTask {
    store: Arc<CredentialStore>,
    days_retained: u32,
    interval: Duration,
    clock: Arc<dyn Clock>,
}

impl AuditRetentionTask {
    pub fn new(store: Arc<CredentialStore>, days_retained: u32, interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            days_retained,
            interval: interval.max(STOP_POLL),
            clock,
        }
    }

    /// Time between runs of a spawned task.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn from_config(store: Arc<CredentialStore>, config: &AuditLogConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(store, config.days_retained, config.cleanup_interval(), clock)
    }

    /// Delete every record older than `now - days_retained`, across all
    /// record kinds. Returns how many were removed. A window reaching past
    /// the earliest representable time removes nothing.
    pub fn run_once(&self) -> usize {
        let now = self.clock.now();
        let cutoff = ChronoDuration::try_days(i64::from(self.days_retained))
            .and_then(|window| now.checked_sub_signed(window));
        let Some(cutoff) = cutoff else {
            tracing::warn!(days_retained = self.days_retained, "retention window out of range, nothing to delete");
            return 0;
        };
        let removed = self.store.delete_audit_records_before(cutoff);
        tracing::info!(%cutoff, removed, "audit retention run complete");
        removed
    }

    /// Run [`run_once`](Self::run_once) on a background thread every
    /// `interval` until the returned handle is stopped or dropped.
    pub fn spawn(self) -> RetentionHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = thread::spawn(move || {
            while !flag.load(Ordering::Acquire) {
                self.run_once();
                let mut slept = Duration::ZERO;
                while slept < self.interval && !flag.load(Ordering::Acquire) {
                    let step = STOP_POLL.min(self.interval - slept);
                    thread::sleep(step);
                    slept += step;
                }
            }
            tracing::debug!("audit retention task stopped");
        });
        RetentionHandle {
            stop,
            thread: Some(thread),
        }
    }
}

/// Stops a spawned [`AuditRetentionTask`].
pub struct RetentionHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl RetentionHandle {
    /// Signal the task and wait for its thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("audit retention thread panicked");
            }
        }
    }
}

impl Drop for RetentionHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{
        AuditTrailBuilder, AuditingOperationCode, AuthFailureAuditRecord, RequestAuditRecord, RequestContext,
    };
    use crate::store::AuditScope;
    use crate::clock::FixedClock;
    use chrono::{TimeZone, Utc};

    fn store_with_records(clock: &Arc<FixedClock>, ages_in_days: &[i64]) -> Arc<CredentialStore> {
        let start = clock.now();
        let store = Arc::new(CredentialStore::with_clock(clock.clone()));
        for age in ages_in_days {
            clock.set(start - ChronoDuration::days(*age));
            store
                .audited(&RequestContext::new("alice"), 200, |tx| {
                    tx.audit(AuditTrailBuilder::for_operation(
                        AuditingOperationCode::CredentialFind,
                        None,
                        None,
                        vec![],
                    ));
                    Ok(())
                })
                .unwrap();
        }
        clock.set(start);
        store
    }

    #[test]
    fn test_run_once_deletes_records_outside_window() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()));
        let store = store_with_records(&clock, &[45, 31, 29, 0]);

        let task = AuditRetentionTask::new(Arc::clone(&store), 30, Duration::from_secs(60), clock.clone());
        assert_eq!(task.run_once(), 2);
        assert_eq!(store.audit_records().len(), 2);
        assert_eq!(task.run_once(), 0);
    }

    #[test]
    fn test_huge_window_deletes_nothing() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()));
        let store = store_with_records(&clock, &[45, 0]);

        let task = AuditRetentionTask::new(Arc::clone(&store), u32::MAX, Duration::from_secs(60), clock.clone());
        assert_eq!(task.run_once(), 0);
        assert_eq!(store.audit_records().len(), 2);
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()));
        let store = Arc::new(CredentialStore::with_clock(clock.clone()));

        let task = AuditRetentionTask::new(store, 30, Duration::ZERO, clock);
        assert_eq!(task.interval(), STOP_POLL);
    }

    #[test]
    fn test_run_once_cleans_every_record_kind() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()));
        let store = store_with_records(&clock, &[45]);
        let old = clock.now() - ChronoDuration::days(45);
        let context = RequestContext::new("alice");
        store.record_request(RequestAuditRecord::new(&context, "GET", "/permissions", 200, old));
        store.record_request(RequestAuditRecord::new(&context, "GET", "/permissions", 200, clock.now()));
        store.record_auth_failure(AuthFailureAuditRecord::new("DELETE", "/permissions", "token expired", old));

        let task = AuditRetentionTask::new(Arc::clone(&store), 30, Duration::from_secs(60), clock.clone());
        assert_eq!(task.run_once(), 3);
        assert!(store.audit_records().is_empty());
        assert_eq!(store.request_records().len(), 1);
        assert!(store.auth_failure_records().is_empty());
    }

    #[test]
    fn test_spawned_task_runs_and_stops() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()));
        let store = store_with_records(&clock, &[90]);

        let handle = AuditRetentionTask::new(Arc::clone(&store), 30, Duration::from_millis(10), clock.clone()).spawn();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !store.audit_records().is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        handle.stop();

        assert!(store.audit_records().is_empty());
    }
}
