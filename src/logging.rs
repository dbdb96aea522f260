//! Append-only activity and error logs for the exchange engine.
//!
//! Business events go to `activity.log`, failures to `errors.log`; error
//! lines are mirrored to the process logger as well.

use crate::errors::Error;
use chrono::Local;
use parking_lot::Mutex;
use std::fmt;
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogType {
    Activity,
    Error,
}

impl fmt::Display for LogType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LogType::Activity => write!(f, "ACTIVITY"),
            LogType::Error => write!(f, "ERROR"),
        }
    }
}

lazy_static::lazy_static! {
    static ref ACTIVITY_LOG: Mutex<Option<File>> = Mutex::new(None);
    static ref ERROR_LOG: Mutex<Option<File>> = Mutex::new(None);
}

fn open_append(path: &Path) -> Result<File, Error> {
    OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .map_err(|e| Error::General(format!("failed to open log {:?}: {}", path, e)))
}

pub fn init(log_dir: &str) -> Result<(), Error> {
    let dir = Path::new(log_dir);
    create_dir_all(dir)
        .map_err(|e| Error::General(format!("failed to create log directory: {}", e)))?;
    *ACTIVITY_LOG.lock() = Some(open_append(&dir.join("activity.log"))?);
    *ERROR_LOG.lock() = Some(open_append(&dir.join("errors.log"))?);
    Ok(())
}

fn format_line(log_type: LogType, message: &str) -> String {
    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
    format!("[{}] [{}] {}", timestamp, log_type, message)
}

pub fn write(log_type: LogType, message: &str) {
    let line = format_line(log_type, message);
    let sink: &Mutex<Option<File>> = match log_type {
        LogType::Activity => &ACTIVITY_LOG,
        LogType::Error => &ERROR_LOG,
    };
    if let Some(file) = sink.lock().as_mut() {
        let _ = writeln!(file, "{}", line);
    }
    if log_type == LogType::Error {
        log::error!("{}", message);
    }
}
