//! Writes decoded records to CSV files.
//!
//! Each session gets its own [`CsvLogger`], and each logger keeps one file
//! per message type, named after the tag and the day:
//! `tag_<tag_id>_<dd_mm_YYYY>_<msg_type>.csv`. Files are opened in append
//! mode so a tag that reconnects keeps writing to the same file, and the
//! header row is only written to files that start out empty.

use crate::hardware_message_decoder::{MessageType, Record};
use crate::session::{DeviceSession, SessionId};

use chrono::{Local, NaiveDate};
use log::{info, warn};
use std::{
    borrow::Cow,
    collections::{hash_map::Entry, HashMap},
    fmt,
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

/// What can go wrong while logging.
#[derive(Debug)]
pub enum LoggerError {
    /// Opening or writing a file failed
    Io(io::Error),
    /// The csv writer failed
    Csv(csv::Error),
}

impl fmt::Display for LoggerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            LoggerError::Io(e) => Cow::from(format!("io error: {}", e)),
            LoggerError::Csv(e) => Cow::from(format!("csv error: {}", e)),
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for LoggerError {}

impl From<io::Error> for LoggerError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<csv::Error> for LoggerError {
    fn from(value: csv::Error) -> Self {
        Self::Csv(value)
    }
}

/// The CSV files of one session.
pub struct CsvLogger {
    dir: PathBuf,
    date: NaiveDate,
    writers: HashMap<MessageType, csv::Writer<File>>,
}

impl CsvLogger {
    /// A logger writing into `dir`, stamped with today's date.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_date(dir, Local::now().date_naive())
    }

    /// A logger writing into `dir`, stamped with `date`.
    pub fn with_date(dir: impl Into<PathBuf>, date: NaiveDate) -> Self {
        Self {
            dir: dir.into(),
            date,
            writers: HashMap::new(),
        }
    }

    /// Where records like `record` end up.
    pub fn path_for(&self, record: &Record) -> PathBuf {
        path_for(&self.dir, self.date, record)
    }

    /// Appends one row for `record`.
    pub fn log(&mut self, record: &Record) -> Result<(), LoggerError> {
        let writer = match self.writers.entry(record.msg_type()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let path = path_for(&self.dir, self.date, record);
                entry.insert(open_writer(&path, record)?)
            }
        };

        writer.write_record(record.fields().iter().map(|(_, value)| value.to_string()))?;
        writer.flush()?;
        Ok(())
    }

    /// Flushes every open file.
    pub fn flush(&mut self) -> Result<(), LoggerError> {
        for writer in self.writers.values_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

fn path_for(dir: &Path, date: NaiveDate, record: &Record) -> PathBuf {
    let tag_id = record
        .tag_id()
        .map_or_else(|| "unknown".to_owned(), |id| id.to_string());
    dir.join(format!(
        "tag_{}_{}_{}.csv",
        tag_id,
        date.format("%d_%m_%Y"),
        record.msg_type()
    ))
}

fn open_writer(path: &Path, record: &Record) -> Result<csv::Writer<File>, LoggerError> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let is_new = file.metadata()?.len() == 0;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    if is_new {
        writer.write_record(record.field_names())?;
    }
    info!("Logging {} records to {}", record.msg_type(), path.display());
    Ok(writer)
}

/// The loggers of every session, created the first time a session logs.
pub struct SessionLoggers {
    dir: PathBuf,
    loggers: HashMap<SessionId, CsvLogger>,
}

impl SessionLoggers {
    /// Loggers writing into `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_owned(),
            loggers: HashMap::new(),
        }
    }

    /// Writes one row for every record `session` decoded since the last
    /// call while its logging was on. Failures are reported and otherwise
    /// ignored.
    pub fn log(&mut self, session: &DeviceSession) {
        let records = session.take_unlogged();
        if records.is_empty() {
            return;
        }

        let dir = &self.dir;
        let logger = self
            .loggers
            .entry(session.id().clone())
            .or_insert_with(|| CsvLogger::new(dir));
        for record in &records {
            if let Err(e) = logger.log(record) {
                warn!("{}: failed to log record: {}", session.id(), e);
            }
        }
    }

    /// Writes what is left of a session that went away and closes its files.
    pub fn forget(&mut self, session: &DeviceSession) {
        self.log(session);
        if let Some(mut logger) = self.loggers.remove(session.id()) {
            if let Err(e) = logger.flush() {
                warn!("{}: failed to flush log files: {}", session.id(), e);
            }
        }
    }
}
