mod config;
mod models;
mod utils;

use dotenv::dotenv;
use log::{error, info};
use simplelog::{ColorChoice, Config as LogConfig, TermLogger, TerminalMode};

use crate::config::Config;
use crate::utils::formatter::Formatter;
use crate::utils::moodle::MoodleClient;
use crate::utils::notifier::Notifier;
use crate::utils::store::{Checkpoint, HistoryLog, SnapshotStore};
use crate::utils::telegram::TelegramTransport;
use crate::utils::watcher::{Schedule, Watcher};

#[tokio::main]
async fn main() {
    // Loads environment variables from a `.env` file, if present.
    dotenv().ok();

    // Reads the whole configuration up front; nothing runs with a bad one.
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    // Initializes the logger
    if let Err(e) = TermLogger::init(
        config.log_level,
        LogConfig::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    ) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    // Builds the Moodle client that produces snapshots.
    let source = match MoodleClient::new(
        &config.moodle_url,
        config.moodle_token.clone(),
        config.request_timeout,
    ) {
        Ok(source) => source,
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    };

    // Sends the filtered changes to the Telegram chat.
    let notifier = Notifier::new(
        TelegramTransport::new(&config.bot_token, config.chat_id),
        Formatter::new(config.format.clone()),
        Checkpoint::new(&config.last_notified_path),
        config.max_message_len,
    );

    let mut watcher = Watcher::new(
        source,
        SnapshotStore::new(&config.last_grades_path),
        HistoryLog::new(&config.grades_history_path),
        notifier,
        Schedule {
            check_interval: config.check_interval,
            failed_request_timeout: config.failed_request_timeout,
            jitter: config.interval_jitter,
        },
    );

    // Polls until Ctrl-C.
    info!("Watching grades at {}", config.moodle_url);
    watcher.run().await;
}
