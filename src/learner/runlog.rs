use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::errors::error_chain;

/// Append-only, timestamped run log. Every line is also sent to the `log` facade under
/// target `otf`. Write failures are reported through `log` and otherwise ignored.
pub struct RunLog {
    path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
}

impl RunLog {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            writer: Some(BufWriter::new(file)),
        })
    }

    /// A log that only forwards to the `log` facade.
    pub fn facade_only() -> Self {
        Self {
            path: None,
            writer: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn write_line(&mut self, level: &str, message: &str) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let result = writeln!(writer, "{} {}: {}", stamp, level, message).and_then(|_| writer.flush());
        if let Err(e) = result {
            log::warn!(target: "otf", "run log write failed: {}", e);
            self.writer = None;
        }
    }

    pub fn info(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        log::info!(target: "otf", "{}", message);
        self.write_line("INFO", message);
    }

    pub fn warn(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        log::warn!(target: "otf", "{}", message);
        self.write_line("WARN", message);
    }

    /// Logs an error with its full cause chain.
    pub fn error(&mut self, context: &str, err: &(dyn std::error::Error + 'static)) {
        let message = format!("{}: {}", context, error_chain(err));
        log::error!(target: "otf", "{}", message);
        self.write_line("ERROR", &message);
    }
}
