pub mod diff;
pub mod formatter;
pub mod moodle;
pub mod notifier;
pub mod store;
pub mod telegram;
pub mod watcher;
