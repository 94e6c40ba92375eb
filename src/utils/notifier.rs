use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::utils::formatter::Formatter;
use crate::utils::store::{Checkpoint, HistoryLog};

/// Somewhere rendered messages can be delivered to.
pub trait Transport {
    async fn send(&self, message: &str) -> Result<()>;
}

/// Sends everything recorded in the history since the last successful notification.
pub struct Notifier<T: Transport> {
    transport: T,
    formatter: Formatter,
    checkpoint: Checkpoint,
    max_message_len: usize,
}

impl<T: Transport> Notifier<T> {
    pub fn new(
        transport: T,
        formatter: Formatter,
        checkpoint: Checkpoint,
        max_message_len: usize,
    ) -> Self {
        Self {
            transport,
            formatter,
            checkpoint,
            max_message_len,
        }
    }

    /// Returns the number of messages sent. The checkpoint only moves to `now` once
    /// every message went through, so a failed delivery is retried next time.
    pub async fn send_updates(&self, history: &HistoryLog, now: DateTime<Utc>) -> Result<usize> {
        let updates = match self.checkpoint.get()? {
            Some(since) => history.query_since(since)?,
            None => {
                warn!("No last notified time found, notifying the whole history");
                history.query_all()?
            }
        };

        let updates = self.formatter.filter(updates);
        let messages = self
            .formatter
            .render(&updates, self.max_message_len)
            .context("Failed to convert updates for print")?;

        for (sent, message) in messages.iter().enumerate() {
            self.transport
                .send(message)
                .await
                .with_context(|| format!("Failed to send updates after {} messages", sent))?;
        }

        self.checkpoint.set(now)?;
        if !messages.is_empty() {
            info!("Sent {} messages", messages.len());
        }
        Ok(messages.len())
    }

    #[cfg(test)]
    pub fn transport(&self) -> &T {
        &self.transport
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::models::{
        ChangeKind, CourseGradesChange, CourseSummary, GradeField, GradeReport, GradeRowChange,
        HistoryEntry,
    };
    use crate::utils::formatter::FormatConfig;
    use anyhow::bail;
    use chrono::TimeZone;
    use std::cell::RefCell;
    use tempfile::TempDir;

    /// Records messages, failing from the `fail_at`-th send on.
    #[derive(Default)]
    pub struct FakeTransport {
        pub sent: RefCell<Vec<String>>,
        pub fail_at: Option<usize>,
    }

    impl Transport for FakeTransport {
        async fn send(&self, message: &str) -> Result<()> {
            if self.fail_at == Some(self.sent.borrow().len()) {
                bail!("chat is unreachable");
            }
            self.sent.borrow_mut().push(message.to_string());
            Ok(())
        }
    }

    pub fn format_config() -> FormatConfig {
        FormatConfig {
            to_print: vec![GradeField::Title, GradeField::Grade],
            to_print_on_updates: vec![],
            updates_to_check: vec![GradeField::Grade],
            check_creates: false,
            check_removes: false,
        }
    }

    fn grade_update(course_id: i64, grade: &str) -> CourseGradesChange {
        CourseGradesChange {
            course: CourseSummary {
                id: course_id,
                fullname: format!("Course {}", course_id),
            },
            grades_table_change: vec![GradeRowChange {
                id: 1,
                kind: ChangeKind::Updated,
                fields: vec![GradeField::Grade],
                from: GradeReport {
                    id: 1,
                    grade: "-".to_string(),
                    ..Default::default()
                },
                to: GradeReport {
                    id: 1,
                    grade: grade.to_string(),
                    ..Default::default()
                },
            }],
        }
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 2, hour, 0, 0).unwrap()
    }

    struct Setup {
        _dir: TempDir,
        history: HistoryLog,
        checkpoint_path: std::path::PathBuf,
    }

    fn setup() -> Setup {
        let dir = TempDir::new().unwrap();
        let history = HistoryLog::new(dir.path().join("history.json"));
        history
            .append(HistoryEntry {
                timestamp: at(1),
                updates: vec![grade_update(1, "50")],
            })
            .unwrap();
        history
            .append(HistoryEntry {
                timestamp: at(3),
                updates: vec![grade_update(2, "70")],
            })
            .unwrap();
        let checkpoint_path = dir.path().join("last_notified.txt");
        Setup {
            _dir: dir,
            history,
            checkpoint_path,
        }
    }

    fn notifier(setup: &Setup, transport: FakeTransport, max: usize) -> Notifier<FakeTransport> {
        Notifier::new(
            transport,
            Formatter::new(format_config()),
            Checkpoint::new(&setup.checkpoint_path),
            max,
        )
    }

    #[tokio::test]
    async fn sends_only_changes_after_checkpoint() {
        let setup = setup();
        Checkpoint::new(&setup.checkpoint_path).set(at(2)).unwrap();
        let notifier = notifier(&setup, FakeTransport::default(), 4096);

        let sent = notifier.send_updates(&setup.history, at(4)).await.unwrap();

        assert_eq!(sent, 1);
        let messages = notifier.transport().sent.borrow();
        assert!(messages[0].starts_with("Course 2:"));
        assert!(!messages[0].contains("Course 1"));
        assert_eq!(
            Checkpoint::new(&setup.checkpoint_path).get().unwrap(),
            Some(at(4))
        );
    }

    #[tokio::test]
    async fn missing_checkpoint_sends_whole_history_in_order() {
        let setup = setup();
        let notifier = notifier(&setup, FakeTransport::default(), 4096);

        assert_eq!(notifier.send_updates(&setup.history, at(4)).await.unwrap(), 1);
        let messages = notifier.transport().sent.borrow();
        let first = messages[0].find("Course 1").unwrap();
        let second = messages[0].find("Course 2").unwrap();
        assert!(first < second);
    }

    #[tokio::test]
    async fn failed_delivery_keeps_checkpoint() {
        let setup = setup();
        Checkpoint::new(&setup.checkpoint_path).set(at(0)).unwrap();
        let transport = FakeTransport {
            fail_at: Some(1),
            ..Default::default()
        };
        // Small enough to put each course in its own message.
        let notifier = notifier(&setup, transport, 50);

        assert!(notifier.send_updates(&setup.history, at(4)).await.is_err());
        assert_eq!(notifier.transport().sent.borrow().len(), 1);
        assert_eq!(
            Checkpoint::new(&setup.checkpoint_path).get().unwrap(),
            Some(at(0))
        );
    }

    #[tokio::test]
    async fn nothing_new_still_advances_checkpoint() {
        let setup = setup();
        Checkpoint::new(&setup.checkpoint_path).set(at(5)).unwrap();
        let notifier = notifier(&setup, FakeTransport::default(), 4096);

        assert_eq!(notifier.send_updates(&setup.history, at(6)).await.unwrap(), 0);
        assert!(notifier.transport().sent.borrow().is_empty());
        assert_eq!(
            Checkpoint::new(&setup.checkpoint_path).get().unwrap(),
            Some(at(6))
        );
    }
}
