use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use simplelog::LevelFilter;
use url::Url;

use crate::models::GradeField;
use crate::utils::formatter::{FormatConfig, MIN_MESSAGE_LEN};

const DEFAULT_MOODLE_URL: &str = "https://moodle.innopolis.university";

/// Everything the watcher needs, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub moodle_url: Url,
    pub moodle_token: String,
    pub bot_token: String,
    pub chat_id: i64,
    pub last_grades_path: PathBuf,
    pub grades_history_path: PathBuf,
    pub last_notified_path: PathBuf,
    pub check_interval: Duration,
    pub failed_request_timeout: Duration,
    pub interval_jitter: Duration,
    pub request_timeout: Duration,
    pub format: FormatConfig,
    pub max_message_len: usize,
    pub log_level: LevelFilter,
}

impl Config {
    /// Reads the configuration from environment variables (and `.env`, once loaded).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let max_message_len = vars.parsed_or("MAX_MESSAGE_LEN", || Ok(4096))?;
        if max_message_len < MIN_MESSAGE_LEN {
            bail!(
                "MAX_MESSAGE_LEN must be at least {} bytes, got {}",
                MIN_MESSAGE_LEN,
                max_message_len
            );
        }

        Ok(Self {
            moodle_url: vars.parsed_or("MOODLE_URL", || {
                Url::parse(DEFAULT_MOODLE_URL).map_err(anyhow::Error::from)
            })?,
            moodle_token: vars.required("MOODLE_TOKEN")?,
            bot_token: vars.required("BOT_TOKEN")?,
            chat_id: vars
                .required("CHAT_ID")?
                .trim()
                .parse()
                .context("CHAT_ID must be an integer")?,
            last_grades_path: vars.path("LAST_GRADES_PATH", "grades.json"),
            grades_history_path: vars.path("GRADES_HISTORY_PATH", "grades_history.json"),
            last_notified_path: vars.path("LAST_NOTIFIED_PATH", "last_notified.txt"),
            check_interval: vars.seconds("CHECK_INTERVAL", 600)?,
            failed_request_timeout: vars.seconds("FAILED_REQUEST_TIMEOUT", 60)?,
            interval_jitter: vars.seconds("INTERVAL_JITTER", 30)?,
            request_timeout: vars.seconds("REQUEST_TIMEOUT", 10)?,
            format: FormatConfig {
                to_print: vars.fields("TO_PRINT", "Title,Grade")?,
                to_print_on_updates: vars.fields(
                    "TO_PRINT_ON_UPDATES",
                    "Percentage,Feedback,Range,Weight,Contribution",
                )?,
                updates_to_check: vars.fields("UPDATES_TO_CHECK", "Grade,Percentage,Feedback")?,
                check_creates: vars.parsed_or("NOTIFY_CREATES", || Ok(false))?,
                check_removes: vars.parsed_or("NOTIFY_REMOVES", || Ok(false))?,
            },
            max_message_len,
            log_level: vars.parsed_or("LOG_LEVEL", || Ok(LevelFilter::Info))?,
        })
    }
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    // Blank values count as unset.
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|value| !value.trim().is_empty())
    }

    fn required(&self, key: &str) -> Result<String> {
        self.get(key)
            .ok_or_else(|| anyhow!("{} environment variable not found", key))
    }

    fn parsed_or<T, D>(&self, key: &str, default: D) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
        D: FnOnce() -> Result<T>,
    {
        match self.get(key) {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|e| anyhow!("Invalid {} {:?}: {}", key, value, e)),
            None => default(),
        }
    }

    // Relative paths resolve against the working directory.
    fn path(&self, key: &str, default: &str) -> PathBuf {
        PathBuf::from(self.get(key).unwrap_or_else(|| default.to_string()))
    }

    fn seconds(&self, key: &str, default: u64) -> Result<Duration> {
        self.parsed_or(key, || Ok(default)).map(Duration::from_secs)
    }

    // Comma-separated field names, case-insensitive.
    fn fields(&self, key: &str, default: &str) -> Result<Vec<GradeField>> {
        let value = self.get(key).unwrap_or_else(|| default.to_string());
        value
            .split(',')
            .filter(|name| !name.trim().is_empty())
            .map(|name| name.parse::<GradeField>().with_context(|| format!("Invalid {}", key)))
            .collect()
    }
}
