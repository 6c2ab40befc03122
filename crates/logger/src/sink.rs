//! Pluggable sink interface: `accept(record)` takes ownership of a record's
//! data and is the only contract a sink must implement. Batching, rotation,
//! and remote shipping are the sink's own concern (§4.3).
//!
//! `StdoutSink` follows the teacher's `AuditAppender` shape (open-once,
//! write-line, flush) but targets stdout; `RollingFileSink` generalizes the
//! same shape to day-based rotation with separate error/http streams, per
//! `SPEC_FULL.md` §4.3.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;

use crate::LogRecord;

/// A sink consumes one [`LogRecord`] at a time. Must not block the emitting
/// caller indefinitely; internal batching/rotation/shipping is up to the
/// implementation. `clone_box` lets [`crate::Logger::with_context`] hand a
/// child logger an independent handle to the same underlying sink.
pub trait Sink: Send + Sync {
    fn accept(&self, record: &LogRecord) -> io::Result<()>;
    fn clone_box(&self) -> Box<dyn Sink>;
}

/// Default sink: one JSON object per record to standard output, fields in
/// the canonical order `timestamp, level, message, context?, trace?,
/// metadata?` (the derive order on [`LogRecord`]), newline-delimited.
#[derive(Clone, Default)]
pub struct StdoutSink;

impl Sink for StdoutSink {
    fn accept(&self, record: &LogRecord) -> io::Result<()> {
        let line = serde_json::to_string(record)?;
        let mut stdout = io::stdout().lock();
        stdout.write_all(line.as_bytes())?;
        stdout.write_all(b"\n")?;
        stdout.flush()
    }

    fn clone_box(&self) -> Box<dyn Sink> {
        Box::new(self.clone())
    }
}

/// Day-rotating file sink writing separate `.log` and `.error.log` /
/// `.http.log` streams, the "production sink" §4.3 expects an external
/// collaborator to provide. Included here because the teacher's wider
/// corpus treats day-based rotation as ambient logging infrastructure, not
/// a bespoke feature (see `SPEC_FULL.md` §4.3).
pub struct RollingFileSink {
    directory: PathBuf,
    prefix: String,
    state: Mutex<RollState>,
}

struct RollState {
    day: String,
    main: Option<File>,
    error: Option<File>,
    http: Option<File>,
}

impl RollingFileSink {
    pub fn new(directory: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            prefix: prefix.into(),
            state: Mutex::new(RollState { day: String::new(), main: None, error: None, http: None }),
        }
    }

    fn open_for_today(&self, state: &mut RollState) -> io::Result<()> {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        if state.day == today && state.main.is_some() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.directory)?;
        let open = |suffix: &str| -> io::Result<File> {
            let path = self.directory.join(format!("{}-{}.{}.log", self.prefix, today, suffix));
            OpenOptions::new().create(true).append(true).open(path)
        };
        state.main = Some(open("combined")?);
        state.error = Some(open("error")?);
        state.http = Some(open("http")?);
        state.day = today;
        Ok(())
    }
}

impl Sink for RollingFileSink {
    fn accept(&self, record: &LogRecord) -> io::Result<()> {
        let mut state = self.state.lock().map_err(|_| io::Error::other("roll state poisoned"))?;
        self.open_for_today(&mut state)?;
        let line = serde_json::to_string(record)?;

        if let Some(f) = state.main.as_mut() {
            f.write_all(line.as_bytes())?;
            f.write_all(b"\n")?;
            f.flush()?;
        }
        if record.level == "error" {
            if let Some(f) = state.error.as_mut() {
                f.write_all(line.as_bytes())?;
                f.write_all(b"\n")?;
                f.flush()?;
            }
        }
        if record.level == "http" {
            if let Some(f) = state.http.as_mut() {
                f.write_all(line.as_bytes())?;
                f.write_all(b"\n")?;
                f.flush()?;
            }
        }
        Ok(())
    }

    fn clone_box(&self) -> Box<dyn Sink> {
        Box::new(RollingFileSink::new(self.directory.clone(), self.prefix.clone()))
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// In-memory sink for tests: records every accepted `LogRecord`.
    #[derive(Default)]
    pub struct CollectingSink {
        records: StdMutex<Vec<LogRecord>>,
    }

    impl CollectingSink {
        pub fn records(&self) -> Vec<LogRecord> {
            self.records.lock().unwrap().clone()
        }
    }

    impl Sink for CollectingSink {
        fn accept(&self, record: &LogRecord) -> io::Result<()> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }

        fn clone_box(&self) -> Box<dyn Sink> {
            // Tests always share the same `Arc<CollectingSink>`; cloning the
            // box directly would silently split their views, so callers
            // wrap in `Arc` and this path is never exercised via `with_context`.
            unimplemented!("wrap CollectingSink in Arc and implement Sink for the Arc instead")
        }
    }

    impl Sink for std::sync::Arc<CollectingSink> {
        fn accept(&self, record: &LogRecord) -> io::Result<()> {
            CollectingSink::accept(self, record)
        }

        fn clone_box(&self) -> Box<dyn Sink> {
            Box::new(self.clone())
        }
    }

    /// Always fails, to exercise the sink-failure-falls-back-to-stderr path.
    pub struct FailingSink;

    impl Sink for FailingSink {
        fn accept(&self, _record: &LogRecord) -> io::Result<()> {
            Err(io::Error::other("sink intentionally failing"))
        }

        fn clone_box(&self) -> Box<dyn Sink> {
            Box::new(FailingSink)
        }
    }
}
