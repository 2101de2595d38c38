//! Panics are reported through `tracing` like every other failure.
//!
//! The record carries the thread, location and a backtrace.

use std::any::Any;
use std::backtrace::Backtrace;
use std::fmt;
use std::io::Write;
use std::panic::PanicHookInfo;
use std::path::{Path, PathBuf};

use chrono::Local;

use super::LOG_FILE_PREFIX;

struct PanicRecord {
    thread: String,
    location: String,
    message: String,
    backtrace: Backtrace,
}

impl PanicRecord {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        Self {
            thread: std::thread::current()
                .name()
                .unwrap_or("<unnamed>")
                .to_string(),
            location: info
                .location()
                .map(|l| format!("{}:{}", l.file(), l.line()))
                .unwrap_or_else(|| "<unknown>".to_string()),
            message: payload_message(info.payload()),
            backtrace: Backtrace::force_capture(),
        }
    }
}

impl fmt::Display for PanicRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} PANIC in thread '{}' at {}: {}",
            Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"),
            self.thread,
            self.location,
            self.message
        )?;
        write!(f, "{}", self.backtrace)
    }
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic payload>".to_string())
}

/// Install the hook, chaining to the previously installed one.
///
/// With `panic = "abort"` the non-blocking file writer never gets to flush,
/// so the record is also appended to today's log file directly.
pub fn install(log_dir: impl AsRef<Path>) {
    let log_dir = log_dir.as_ref().to_path_buf();
    let previous = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |info: &PanicHookInfo<'_>| {
        // A failure while reporting must not turn into a double panic.
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let record = PanicRecord::capture(info);
            tracing::error!(
                target: "media_forge::panic",
                thread = %record.thread,
                location = %record.location,
                "Panic: {}\n{}",
                record.message,
                record.backtrace
            );
            if cfg!(panic = "abort") {
                let _ = append_to_daily_log(&log_dir, &record);
            }
        }));
        previous(info);
    }));
}

fn daily_log_path(log_dir: &Path) -> PathBuf {
    log_dir.join(format!(
        "{}.{}",
        LOG_FILE_PREFIX,
        Local::now().format("%Y-%m-%d")
    ))
}

fn append_to_daily_log(log_dir: &Path, record: &PanicRecord) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(daily_log_path(log_dir))?;
    writeln!(file, "{record}")?;
    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_message() {
        let literal: Box<dyn Any + Send> = Box::new("model crashed");
        assert_eq!(payload_message(literal.as_ref()), "model crashed");

        let owned: Box<dyn Any + Send> = Box::new(format!("stage {} failed", 2));
        assert_eq!(payload_message(owned.as_ref()), "stage 2 failed");

        let other: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(payload_message(other.as_ref()), "<non-string panic payload>");
    }

    #[test]
    fn test_daily_log_path_matches_appender_naming() {
        let path = daily_log_path(Path::new("/var/log/mf"));
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        let date = name.strip_prefix(&format!("{}.", LOG_FILE_PREFIX)).unwrap();
        assert!(chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").is_ok());
    }
}
