//! Structured capture of `log` records.
//!
//! [`CaptureLogger`] turns records into [`CapturedRecord`]s, tagging each with
//! the current mapped diagnostic context ([`Mdc`]). Captured records can be
//! written as a JSON array or as JSON lines and read back from either, so a
//! task's log can be stored as a dataset.

use crate::error::{ButlerError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

pub const DEFAULT_LOG_FORMAT: &str = "{levelname} {asctime} {name} {filename}:{lineno} - {message}";

static MDC: Lazy<RwLock<BTreeMap<String, String>>> = Lazy::new(|| RwLock::new(BTreeMap::new()));

/// Process-wide mapped diagnostic context.
pub struct Mdc;

impl Mdc {
    /// Set `key`, returning its previous value.
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        MDC.write().insert(key.into(), value.into())
    }

    /// Remove `key`; unknown keys are ignored.
    pub fn remove(key: &str) -> Option<String> {
        MDC.write().remove(key)
    }

    pub fn get(key: &str) -> Option<String> {
        MDC.read().get(key).cloned()
    }

    pub fn snapshot() -> BTreeMap<String, String> {
        MDC.read().clone()
    }

    /// Set several keys until the returned guard is dropped. Other keys are
    /// left alone.
    pub fn scoped<I, K, V>(values: I) -> MdcGuard
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut mdc = MDC.write();
        let previous = values
            .into_iter()
            .map(|(k, v)| {
                let key = k.into();
                let old = mdc.insert(key.clone(), v.into());
                (key, old)
            })
            .collect();
        MdcGuard { previous }
    }
}

/// Restores the MDC values replaced by [`Mdc::scoped`].
#[must_use = "the MDC values are restored when the guard is dropped"]
pub struct MdcGuard {
    previous: Vec<(String, Option<String>)>,
}

impl Drop for MdcGuard {
    fn drop(&mut self) {
        let mut mdc = MDC.write();
        for (key, old) in self.previous.drain(..).rev() {
            match old {
                Some(value) => {
                    mdc.insert(key, value);
                }
                None => {
                    mdc.remove(&key);
                }
            }
        }
    }
}

/// One captured log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedRecord {
    pub name: String,
    pub asctime: DateTime<Utc>,
    pub message: String,
    pub levelno: u32,
    pub levelname: String,
    pub filename: String,
    pub pathname: String,
    pub lineno: u32,
    pub module: String,
    #[serde(default, rename = "MDC")]
    pub mdc: BTreeMap<String, String>,
}

impl CapturedRecord {
    pub fn from_log_record(record: &log::Record<'_>, mdc: BTreeMap<String, String>) -> Self {
        let pathname = record.file().unwrap_or_default().to_string();
        let filename = Path::new(&pathname)
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            name: record.target().to_string(),
            asctime: Utc::now(),
            message: record.args().to_string(),
            levelno: level_number(record.level()),
            levelname: level_name(record.level()).to_string(),
            filename,
            pathname,
            lineno: record.line().unwrap_or(0),
            module: record.module_path().unwrap_or_default().to_string(),
            mdc,
        }
    }

    /// Substitute `{field}` placeholders. `{MDC}` renders the whole context
    /// and `{MDC[key]}` a single entry, empty when missing. `{{` and `}}`
    /// are literal braces; unknown placeholders are kept as written.
    pub fn format(&self, log_format: &str) -> String {
        let mut out = String::with_capacity(log_format.len() + self.message.len());
        let mut rest = log_format;
        while let Some(pos) = rest.find(['{', '}']) {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos..];
            if tail.starts_with("{{") || tail.starts_with("}}") {
                out.push_str(&tail[..1]);
                rest = &tail[2..];
                continue;
            }
            if tail.starts_with('}') {
                out.push('}');
                rest = &tail[1..];
                continue;
            }
            let Some(end) = tail.find('}') else {
                out.push_str(tail);
                rest = "";
                break;
            };
            let key = &tail[1..end];
            match self.field(key) {
                Some(value) => out.push_str(&value),
                None => out.push_str(&tail[..=end]),
            }
            rest = &tail[end + 1..];
        }
        out.push_str(rest);
        out
    }

    fn field(&self, key: &str) -> Option<String> {
        let value = match key {
            "name" => self.name.clone(),
            "asctime" => self.asctime.to_rfc3339_opts(SecondsFormat::Millis, true),
            "message" => self.message.clone(),
            "levelname" => self.levelname.clone(),
            "levelno" => self.levelno.to_string(),
            "filename" => self.filename.clone(),
            "pathname" => self.pathname.clone(),
            "lineno" => self.lineno.to_string(),
            "module" => self.module.clone(),
            "MDC" => {
                let items: Vec<String> = self.mdc.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                format!("{{{}}}", items.join(", "))
            }
            _ => {
                let inner = key.strip_prefix("MDC[")?.strip_suffix(']')?;
                self.mdc.get(inner).cloned().unwrap_or_default()
            }
        };
        Some(value)
    }
}

impl fmt::Display for CapturedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format(DEFAULT_LOG_FORMAT))
    }
}

pub fn level_number(level: log::Level) -> u32 {
    match level {
        log::Level::Trace => 5,
        log::Level::Debug => 10,
        log::Level::Info => 20,
        log::Level::Warn => 30,
        log::Level::Error => 40,
    }
}

fn level_name(level: log::Level) -> &'static str {
    match level {
        log::Level::Trace => "TRACE",
        log::Level::Debug => "DEBUG",
        log::Level::Info => "INFO",
        log::Level::Warn => "WARNING",
        log::Level::Error => "ERROR",
    }
}

/// Ordered captured records. Serializes as a plain JSON array.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogRecords {
    records: Vec<CapturedRecord>,
    #[serde(skip)]
    log_format: Option<String>,
}

impl LogRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records<I: IntoIterator<Item = CapturedRecord>>(records: I) -> Self {
        Self {
            records: records.into_iter().collect(),
            log_format: None,
        }
    }

    /// Parse either a JSON array of records or one JSON record per line.
    /// Empty input gives no records.
    pub fn from_raw(raw: &str) -> Result<Self> {
        let trimmed = raw.trim_start();
        let Some(first) = trimmed.chars().next() else {
            return Ok(Self::new());
        };
        match first {
            '[' => Ok(serde_json::from_str(trimmed)?),
            '{' => {
                let records = trimmed
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(serde_json::from_str)
                    .collect::<std::result::Result<Vec<CapturedRecord>, _>>()?;
                Ok(Self::from_records(records))
            }
            other => {
                let start: String = trimmed.chars().take(32).collect();
                Err(ButlerError::SerializationErrorWithContext(format!(
                    "unrecognized JSON log format: expected '{{' or '[' but got {:?} in content starting with {:?}",
                    other, start
                )))
            }
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_raw(&std::fs::read_to_string(path)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.records)?)
    }

    /// One record per line, newline terminated.
    pub fn to_json_lines(&self) -> Result<String> {
        let mut out = String::new();
        for record in &self.records {
            out.push_str(&serde_json::to_string(record)?);
            out.push('\n');
        }
        Ok(out)
    }

    pub fn log_format(&self) -> &str {
        self.log_format.as_deref().unwrap_or(DEFAULT_LOG_FORMAT)
    }

    /// Set the format used by `Display`; `None` restores the default.
    /// Returns the previous format.
    pub fn set_log_format(&mut self, log_format: Option<String>) -> Option<String> {
        std::mem::replace(&mut self.log_format, log_format)
    }

    pub fn push(&mut self, record: CapturedRecord) {
        self.records.push(record);
    }

    pub fn extend<I: IntoIterator<Item = CapturedRecord>>(&mut self, records: I) {
        self.records.extend(records);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&CapturedRecord> {
        self.records.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CapturedRecord> {
        self.records.iter()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

impl fmt::Display for LogRecords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let log_format = self.log_format();
        for (i, record) in self.records.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            f.write_str(&record.format(log_format))?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a LogRecords {
    type Item = &'a CapturedRecord;
    type IntoIter = std::slice::Iter<'a, CapturedRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// `log::Log` implementation that stores records at or above `level`.
pub struct CaptureLogger {
    records: Arc<Mutex<LogRecords>>,
    level: log::LevelFilter,
    forward: Option<Box<dyn log::Log>>,
}

impl CaptureLogger {
    pub fn new(level: log::LevelFilter) -> Self {
        Self {
            records: Arc::new(Mutex::new(LogRecords::new())),
            level,
            forward: None,
        }
    }

    /// Also pass every record to `logger`, regardless of `level`.
    pub fn with_forward(mut self, logger: Box<dyn log::Log>) -> Self {
        self.forward = Some(logger);
        self
    }

    /// Shared handle to the captured records.
    pub fn records(&self) -> Arc<Mutex<LogRecords>> {
        Arc::clone(&self.records)
    }

    /// Remove and return everything captured so far.
    pub fn take(&self) -> LogRecords {
        std::mem::take(&mut *self.records.lock())
    }

    /// Install as the global logger. Fails if a logger is already set.
    pub fn install(self) -> Result<Arc<Mutex<LogRecords>>> {
        let records = self.records();
        let level = match &self.forward {
            Some(_) => log::LevelFilter::Trace,
            None => self.level,
        };
        log::set_logger(Box::leak(Box::new(self)))
            .map_err(|e| ButlerError::Other(format!("cannot install capture logger: {}", e)))?;
        log::set_max_level(level);
        Ok(records)
    }
}

impl log::Log for CaptureLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= self.level
            || self.forward.as_ref().is_some_and(|f| f.enabled(metadata))
    }

    fn log(&self, record: &log::Record<'_>) {
        if record.level() <= self.level {
            self.records
                .lock()
                .push(CapturedRecord::from_log_record(record, Mdc::snapshot()));
        }
        if let Some(forward) = &self.forward
            && forward.enabled(record.metadata())
        {
            forward.log(record);
        }
    }

    fn flush(&self) {
        if let Some(forward) = &self.forward {
            forward.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Log;

    fn emit(logger: &CaptureLogger, level: log::Level, message: &str) {
        logger.log(
            &log::Record::builder()
                .args(format_args!("{}", message))
                .level(level)
                .target("butlerdb.test")
                .file(Some("src/graph/builder.rs"))
                .line(Some(42))
                .module_path(Some("butlerdb::graph::builder"))
                .build(),
        );
    }

    fn sample(message: &str) -> CapturedRecord {
        CapturedRecord {
            name: "butlerdb.test".to_string(),
            asctime: DateTime::parse_from_rfc3339("2024-01-02T03:04:05.678Z")
                .unwrap()
                .with_timezone(&Utc),
            message: message.to_string(),
            levelno: 20,
            levelname: "INFO".to_string(),
            filename: "builder.rs".to_string(),
            pathname: "src/graph/builder.rs".to_string(),
            lineno: 42,
            module: "butlerdb::graph::builder".to_string(),
            mdc: BTreeMap::from([("LABEL".to_string(), "isr".to_string())]),
        }
    }

    #[test]
    fn test_capture_respects_level() {
        let logger = CaptureLogger::new(log::LevelFilter::Info);
        emit(&logger, log::Level::Debug, "hidden");
        emit(&logger, log::Level::Info, "shown");
        emit(&logger, log::Level::Error, "bad");
        let records = logger.take();
        assert_eq!(records.len(), 2);
        let first = records.get(0).unwrap();
        assert_eq!(first.message, "shown");
        assert_eq!(first.levelno, 20);
        assert_eq!(first.filename, "builder.rs");
        assert_eq!(records.get(1).unwrap().levelname, "ERROR");
        assert!(logger.take().is_empty());
    }

    #[test]
    fn test_capture_attaches_mdc() {
        let logger = CaptureLogger::new(log::LevelFilter::Trace);
        {
            let _guard = Mdc::scoped([("CAPTURE_TEST_LABEL", "calibrate")]);
            emit(&logger, log::Level::Trace, "inside");
        }
        emit(&logger, log::Level::Trace, "outside");
        let records = logger.take();
        assert_eq!(records.get(0).unwrap().mdc["CAPTURE_TEST_LABEL"], "calibrate");
        assert_eq!(records.get(0).unwrap().levelno, 5);
        assert!(!records.get(1).unwrap().mdc.contains_key("CAPTURE_TEST_LABEL"));
    }

    #[test]
    fn test_scoped_restores_previous_value() {
        Mdc::set("SCOPED_TEST_KEY", "outer");
        {
            let _guard = Mdc::scoped([("SCOPED_TEST_KEY", "inner"), ("SCOPED_TEST_NEW", "x")]);
            assert_eq!(Mdc::get("SCOPED_TEST_KEY").as_deref(), Some("inner"));
        }
        assert_eq!(Mdc::get("SCOPED_TEST_KEY").as_deref(), Some("outer"));
        assert_eq!(Mdc::get("SCOPED_TEST_NEW"), None);
        assert_eq!(Mdc::remove("SCOPED_TEST_KEY").as_deref(), Some("outer"));
        assert_eq!(Mdc::remove("SCOPED_TEST_KEY"), None);
    }

    #[test]
    fn test_format_placeholders() {
        let record = sample("hello");
        assert_eq!(
            record.to_string(),
            "INFO 2024-01-02T03:04:05.678Z butlerdb.test builder.rs:42 - hello"
        );
        assert_eq!(record.format("{MDC[LABEL]}|{MDC[missing]}|{MDC}"), "isr||{LABEL=isr}");
        assert_eq!(record.format("{{literal}} {unknown} {levelno}"), "{literal} {unknown} 20");
    }

    #[test]
    fn test_from_raw_detects_format() {
        let records = LogRecords::from_records([sample("a"), sample("b")]);

        let array = LogRecords::from_raw(&records.to_json().unwrap()).unwrap();
        assert_eq!(array, records);

        let lines = records.to_json_lines().unwrap();
        let with_blank = format!("{}\n\n", lines.replace('\n', "\n\n"));
        assert_eq!(LogRecords::from_raw(&with_blank).unwrap(), records);

        assert!(LogRecords::from_raw("").unwrap().is_empty());
        assert!(matches!(
            LogRecords::from_raw("not json"),
            Err(ButlerError::SerializationErrorWithContext(_))
        ));
    }

    #[test]
    fn test_display_uses_log_format() {
        let mut records = LogRecords::from_records([sample("a"), sample("b")]);
        assert_eq!(records.set_log_format(Some("{message}".to_string())), None);
        assert_eq!(records.to_string(), "a\nb");
        records.set_log_format(None);
        assert!(records.to_string().starts_with("INFO "));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("task.log.json");
        let records = LogRecords::from_records([sample("from disk")]);
        std::fs::write(&path, records.to_json_lines().unwrap()).unwrap();
        assert_eq!(LogRecords::from_file(&path).unwrap(), records);
    }
}
