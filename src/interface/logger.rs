use crossbeam_channel::Sender;
use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::learner::LearnerEvent;

/// Forwards log records to the dashboard as `LearnerEvent::Log`.
///
/// Writing to stderr would corrupt the alternate screen, so while the TUI is up
/// this replaces `env_logger` as the global logger.
pub struct ChannelLogger {
    tx: Sender<LearnerEvent>,
    level: Level,
}

impl ChannelLogger {
    pub fn new(tx: Sender<LearnerEvent>, level: Level) -> Self {
        Self { tx, level }
    }

    /// Installs the logger globally. Fails if a logger is already set.
    pub fn install(self) -> Result<(), log::SetLoggerError> {
        let filter = self.level.to_level_filter();
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(filter);
        Ok(())
    }
}

impl Log for ChannelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = match record.level() {
            Level::Info => record.args().to_string(),
            level => format!("{}: {}", level, record.args()),
        };
        // The receiver is gone once the UI shuts down.
        let _ = self.tx.send(LearnerEvent::Log(line));
    }

    fn flush(&self) {}
}

/// Parses a level name, defaulting to `Info`.
pub fn parse_level(name: &str) -> LevelFilter {
    name.parse().unwrap_or(LevelFilter::Info)
}
