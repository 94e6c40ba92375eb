use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use rand::Rng;

use crate::models::{Course, HistoryEntry};
use crate::utils::diff::compare_courses;
use crate::utils::notifier::{Notifier, Transport};
use crate::utils::store::{HistoryLog, SnapshotStore};

/// Produces the current snapshot of all visible courses with their grades.
pub trait SnapshotSource {
    async fn fetch_snapshot(&mut self) -> Result<Vec<Course>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub check_interval: Duration,
    pub failed_request_timeout: Duration,
    pub jitter: Duration,
}

impl Schedule {
    // Picks the wait before the next cycle, adding random jitter on top.
    fn next_delay(&self, succeeded: bool) -> Duration {
        let base = if succeeded {
            self.check_interval
        } else {
            self.failed_request_timeout
        };
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        base.saturating_add(Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms)))
    }
}

// Wall-clock time of the next check, if it is representable at all.
fn next_check_time(now: DateTime<Utc>, delay: Duration) -> Option<DateTime<Utc>> {
    let delay = chrono::Duration::from_std(delay).ok()?;
    now.checked_add_signed(delay)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub courses_changed: usize,
    pub messages_sent: usize,
}

/// Runs the fetch, compare, record and notify cycle.
pub struct Watcher<S: SnapshotSource, T: Transport> {
    source: S,
    snapshots: SnapshotStore,
    history: HistoryLog,
    notifier: Notifier<T>,
    schedule: Schedule,
    clock: fn() -> DateTime<Utc>,
}

impl<S: SnapshotSource, T: Transport> Watcher<S, T> {
    pub fn new(
        source: S,
        snapshots: SnapshotStore,
        history: HistoryLog,
        notifier: Notifier<T>,
        schedule: Schedule,
    ) -> Self {
        Self {
            source,
            snapshots,
            history,
            notifier,
            schedule,
            clock: Utc::now,
        }
    }

    #[cfg(test)]
    fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    /// One full cycle. The new snapshot and its changes are stored before anything is
    /// sent, so a delivery failure never loses data.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let new_grades = self
            .source
            .fetch_snapshot()
            .await
            .context("Error retrieving grades")?;

        let old_grades = self.snapshots.load().unwrap_or_else(|e| {
            warn!("{:#}, comparing against an empty snapshot", e);
            Vec::new()
        });

        let changes = compare_courses(&old_grades, &new_grades);
        let courses_changed = changes.len();
        if changes.is_empty() {
            info!("No new grades found");
        } else {
            self.history.append(HistoryEntry {
                timestamp: (self.clock)(),
                updates: changes,
            })?;
        }
        self.snapshots.save(&new_grades)?;

        // Read the clock again so the checkpoint lands after the entry just appended.
        let messages_sent = self
            .notifier
            .send_updates(&self.history, (self.clock)())
            .await?;

        Ok(CycleReport {
            courses_changed,
            messages_sent,
        })
    }

    /// Polls until Ctrl-C arrives while waiting for the next check.
    pub async fn run(&mut self) {
        loop {
            let succeeded = match self.run_cycle().await {
                Ok(report) => {
                    info!(
                        "Cycle done: {} courses changed, {} messages sent",
                        report.courses_changed, report.messages_sent
                    );
                    true
                }
                Err(e) => {
                    error!("{:#}", e);
                    false
                }
            };

            let delay = self.schedule.next_delay(succeeded);
            match next_check_time(Utc::now(), delay) {
                Some(next_check) => info!(
                    "Waiting... next check at {}",
                    next_check.format("%Y-%m-%d %H:%M:%S")
                ),
                None => info!("Waiting... next check in {:?}", delay),
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, stopping");
                    return;
                }
            }
        }
    }

    #[cfg(test)]
    fn notifier(&self) -> &Notifier<T> {
        &self.notifier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeKind, GradeReport};
    use crate::utils::formatter::{FormatConfig, Formatter};
    use crate::utils::notifier::tests::{format_config, FakeTransport};
    use crate::utils::store::Checkpoint;
    use anyhow::bail;
    use chrono::TimeZone;
    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::fs;
    use tempfile::TempDir;

    struct FakeSource {
        snapshots: VecDeque<Result<Vec<Course>>>,
    }

    impl SnapshotSource for FakeSource {
        async fn fetch_snapshot(&mut self) -> Result<Vec<Course>> {
            match self.snapshots.pop_front() {
                Some(snapshot) => snapshot,
                None => bail!("no more snapshots"),
            }
        }
    }

    fn snapshot(grade: &str) -> Vec<Course> {
        vec![Course {
            id: 1,
            fullname: "AGLA".to_string(),
            hidden: false,
            grades: vec![GradeReport {
                id: 5,
                title: "Final exam".to_string(),
                grade: grade.to_string(),
                ..Default::default()
            }],
        }]
    }

    thread_local! {
        static TICKS: Cell<i64> = const { Cell::new(0) };
    }

    // Advances one second per call.
    fn ticking_clock() -> DateTime<Utc> {
        TICKS.with(|ticks| {
            ticks.set(ticks.get() + 1);
            Utc.timestamp_opt(1_717_243_200 + ticks.get(), 0).unwrap()
        })
    }

    fn schedule() -> Schedule {
        Schedule {
            check_interval: Duration::from_secs(600),
            failed_request_timeout: Duration::from_secs(60),
            jitter: Duration::ZERO,
        }
    }

    fn watcher(
        dir: &TempDir,
        snapshots: Vec<Result<Vec<Course>>>,
        transport: FakeTransport,
        format: FormatConfig,
    ) -> Watcher<FakeSource, FakeTransport> {
        Watcher::new(
            FakeSource {
                snapshots: snapshots.into(),
            },
            SnapshotStore::new(dir.path().join("grades.json")),
            HistoryLog::new(dir.path().join("grades_history.json")),
            Notifier::new(
                transport,
                Formatter::new(format),
                Checkpoint::new(dir.path().join("last_notified.txt")),
                4096,
            ),
            schedule(),
        )
        .with_clock(ticking_clock)
    }

    #[tokio::test]
    async fn grade_change_is_recorded_and_sent() {
        let dir = TempDir::new().unwrap();
        let mut watcher = watcher(
            &dir,
            vec![Ok(snapshot("-")), Ok(snapshot("60")), Ok(snapshot("60"))],
            FakeTransport::default(),
            format_config(),
        );

        // First run sees every row as new; creations are not reported.
        let first = watcher.run_cycle().await.unwrap();
        assert_eq!(first, CycleReport { courses_changed: 1, messages_sent: 0 });

        let second = watcher.run_cycle().await.unwrap();
        assert_eq!(second, CycleReport { courses_changed: 1, messages_sent: 1 });
        let sent = watcher.notifier().transport().sent.borrow().clone();
        assert!(sent[0].contains("Grade:  \"-\"  ->  \"60\""));

        let third = watcher.run_cycle().await.unwrap();
        assert_eq!(third, CycleReport::default());

        let history = HistoryLog::new(dir.path().join("grades_history.json"));
        let entries = history.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].timestamp > entries[1].timestamp);
        assert_eq!(entries[1].updates[0].grades_table_change[0].kind, ChangeKind::Created);
        assert_eq!(
            SnapshotStore::new(dir.path().join("grades.json")).load().unwrap(),
            snapshot("60")
        );
    }

    #[tokio::test]
    async fn failed_fetch_leaves_state_untouched() {
        let dir = TempDir::new().unwrap();
        let mut watcher = watcher(
            &dir,
            vec![Ok(snapshot("50")), Err(anyhow::anyhow!("timeout"))],
            FakeTransport::default(),
            format_config(),
        );

        watcher.run_cycle().await.unwrap();
        assert!(watcher.run_cycle().await.is_err());

        assert_eq!(
            SnapshotStore::new(dir.path().join("grades.json")).load().unwrap(),
            snapshot("50")
        );
    }

    #[tokio::test]
    async fn delivery_failure_still_persists_changes() {
        let dir = TempDir::new().unwrap();
        let mut watcher = watcher(
            &dir,
            vec![Ok(snapshot("-")), Ok(snapshot("70"))],
            FakeTransport {
                fail_at: Some(0),
                ..Default::default()
            },
            format_config(),
        );

        watcher.run_cycle().await.unwrap();
        assert!(watcher.run_cycle().await.is_err());

        let history = HistoryLog::new(dir.path().join("grades_history.json"));
        assert_eq!(history.entries().unwrap().len(), 2);
        assert_eq!(
            SnapshotStore::new(dir.path().join("grades.json")).load().unwrap(),
            snapshot("70")
        );
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_treated_as_empty() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("grades.json"), "not json").unwrap();
        let mut watcher = watcher(
            &dir,
            vec![Ok(snapshot("60"))],
            FakeTransport::default(),
            FormatConfig {
                check_creates: true,
                ..format_config()
            },
        );

        let report = watcher.run_cycle().await.unwrap();

        assert_eq!(report, CycleReport { courses_changed: 1, messages_sent: 1 });
        let sent = watcher.notifier().transport().sent.borrow().clone();
        assert!(sent[0].starts_with("AGLA:\n\nNew grade\n"));
    }

    #[test]
    fn delay_depends_on_outcome() {
        let schedule = schedule();
        assert_eq!(schedule.next_delay(true), Duration::from_secs(600));
        assert_eq!(schedule.next_delay(false), Duration::from_secs(60));

        let jittered = Schedule {
            jitter: Duration::from_secs(5),
            ..schedule
        };
        let delay = jittered.next_delay(true);
        assert!(delay >= Duration::from_secs(600) && delay <= Duration::from_secs(605));
    }

    #[test]
    fn huge_interval_saturates_instead_of_overflowing() {
        let schedule = Schedule {
            check_interval: Duration::from_secs(u64::MAX),
            failed_request_timeout: Duration::from_secs(u64::MAX),
            jitter: Duration::from_secs(30),
        };

        assert!(schedule.next_delay(true) >= Duration::from_secs(u64::MAX));
        assert!(schedule.next_delay(false) >= Duration::from_secs(u64::MAX));
    }

    #[test]
    fn next_check_time_out_of_range_is_none() {
        let now = ticking_clock();
        assert_eq!(
            next_check_time(now, Duration::from_secs(60)),
            Some(now + chrono::Duration::seconds(60))
        );
        assert_eq!(next_check_time(now, Duration::from_secs(u64::MAX)), None);
        assert_eq!(next_check_time(now, Duration::from_secs(i64::MAX as u64 / 1000)), None);
    }
}
