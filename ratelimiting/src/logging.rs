use env_logger::Target;
use log::LevelFilter;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Append-only log file shared between the logger and the control loop.
///
/// Unbuffered: `env_logger` flushes its pipe after every record, so each
/// record reaches the file when it is logged. The control loop still flushes
/// once per sweep and closes the file on teardown. Records written after
/// `close` go to stderr.
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    file: Arc<Mutex<Option<File>>>,
}

impl LogSink {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(LogSink {
            file: Arc::new(Mutex::new(Some(file))),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<File>> {
        self.file.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    pub fn flush(&self) -> io::Result<()> {
        match self.lock().as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }

    /// Flush and close the file. Returns `false` if it was already closed.
    pub fn close(&self) -> io::Result<bool> {
        match self.lock().take() {
            Some(mut file) => {
                file.flush()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.lock().as_mut() {
            Some(file) => file.write(buf),
            None => io::stderr().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        LogSink::flush(self)
    }
}

// Map the numeric --verbose level onto a log filter
pub fn level_from_verbosity(verbosity: Option<u8>) -> LevelFilter {
    match verbosity {
        None => LevelFilter::Info,
        Some(0) => LevelFilter::Off,
        Some(1) => LevelFilter::Error,
        Some(2) => LevelFilter::Warn,
        Some(3) => LevelFilter::Info,
        Some(4) => LevelFilter::Debug,
        Some(_) => LevelFilter::Trace,
    }
}

/// Install the global logger, appending to `path` when it can be opened and
/// falling back to stderr otherwise.
pub fn init_logging(level: LevelFilter, path: &Path) -> LogSink {
    let mut builder = env_logger::Builder::new();
    builder.filter(None, level).format_timestamp_micros();

    let sink = match LogSink::open(path) {
        Ok(sink) => {
            eprintln!(
                "writing errors/warnings/info/debug output to {}",
                path.display()
            );
            builder.target(Target::Pipe(Box::new(sink.clone())));
            sink
        }
        Err(e) => {
            eprintln!(
                "could not open log file {}: {}, logging to stderr",
                path.display(),
                e
            );
            builder.target(Target::Stderr);
            LogSink::default()
        }
    };

    builder.init();
    sink
}
