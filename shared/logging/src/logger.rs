//! Logger initialization and the rotating file sink

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{Local, NaiveDate};
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::EnvFilter;

use smartmessage_config::{LogFormat, LogRotation, LogSink, LoggerSettings};
use smartmessage_errors::{Result, SmartMessageError};

/// Initialize the process-wide logger from settings.
///
/// Fails if a global subscriber is already installed or the level string
/// does not parse; test suites should prefer [`init_test_logging`].
pub fn init_logging(settings: &LoggerSettings) -> Result<()> {
    let filter = EnvFilter::try_new(&settings.level).map_err(|e| {
        SmartMessageError::Configuration {
            message: format!("Invalid log level '{}': {}", settings.level, e),
            key: Some("logger.level".to_string()),
            code: "CONFIG_ERROR".to_string(),
        }
    })?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(settings.colorize)
        .with_file(settings.source_location)
        .with_line_number(settings.source_location);

    let result = match (&settings.sink, settings.format) {
        (LogSink::Stdout, LogFormat::Text) => builder.with_writer(io::stdout).try_init(),
        (LogSink::Stdout, LogFormat::Json) => builder.json().with_writer(io::stdout).try_init(),
        (LogSink::Stderr, LogFormat::Text) => builder.with_writer(io::stderr).try_init(),
        (LogSink::Stderr, LogFormat::Json) => builder.json().with_writer(io::stderr).try_init(),
        (LogSink::Null, LogFormat::Text) => builder.with_writer(io::sink).try_init(),
        (LogSink::Null, LogFormat::Json) => builder.json().with_writer(io::sink).try_init(),
        (LogSink::File { path }, format) => {
            let writer = RotatingFileWriter::new(path, settings.rotation)?;
            match format {
                LogFormat::Text => builder.with_writer(writer).try_init(),
                LogFormat::Json => builder.json().with_writer(writer).try_init(),
            }
        }
    };

    result.map_err(|e| SmartMessageError::Configuration {
        message: format!("Logger initialization failed: {}", e),
        key: None,
        code: "CONFIG_ERROR".to_string(),
    })
}

/// Install a silent logger, ignoring the error when one is already set.
///
/// Safe to call from every test.
pub fn init_test_logging() {
    let _ = init_logging(&LoggerSettings::null());
}

/// File sink that rotates by size or by local date.
///
/// Rotation renames the active file to `<path>.<yyyymmdd-hhmmss>` and
/// reopens a fresh one; writes are serialized by an internal mutex.
pub struct RotatingFileWriter {
    path: PathBuf,
    rotation: LogRotation,
    state: Mutex<WriterState>,
}

struct WriterState {
    file: File,
    written: u64,
    opened_on: NaiveDate,
}

impl RotatingFileWriter {
    pub fn new(path: &Path, rotation: LogRotation) -> Result<Self> {
        let file = open_append(path)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self {
            path: path.to_path_buf(),
            rotation,
            state: Mutex::new(WriterState {
                file,
                written,
                opened_on: Local::now().date_naive(),
            }),
        })
    }

    fn write_locked(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().expect("log writer mutex poisoned");

        let rotate = match self.rotation {
            LogRotation::None => false,
            LogRotation::Size { max_bytes } => state.written + buf.len() as u64 > max_bytes,
            LogRotation::Time => Local::now().date_naive() != state.opened_on,
        };

        if rotate {
            state.file.flush()?;
            let stamp = Local::now().format("%Y%m%d-%H%M%S");
            let rotated = self.path.with_extension(format!("{}.log", stamp));
            fs::rename(&self.path, &rotated)?;
            state.file = open_append(&self.path)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            state.written = 0;
            state.opened_on = Local::now().date_naive();
        }

        let n = state.file.write(buf)?;
        state.written += n as u64;
        Ok(n)
    }

    fn flush_locked(&self) -> io::Result<()> {
        self.state
            .lock()
            .expect("log writer mutex poisoned")
            .file
            .flush()
    }
}

fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| SmartMessageError::FileSystem {
                message: e.to_string(),
                path: Some(path.display().to_string()),
                operation: "create_dir".to_string(),
                code: "FILESYSTEM_ERROR".to_string(),
            })?;
        }
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| SmartMessageError::FileSystem {
            message: e.to_string(),
            path: Some(path.display().to_string()),
            operation: "open".to_string(),
            code: "FILESYSTEM_ERROR".to_string(),
        })
}

/// Handle yielded per log event; delegates to the shared writer.
pub struct RotatingHandle<'a> {
    writer: &'a RotatingFileWriter,
}

impl io::Write for RotatingHandle<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write_locked(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush_locked()
    }
}

impl<'a> MakeWriter<'a> for RotatingFileWriter {
    type Writer = RotatingHandle<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        RotatingHandle { writer: self }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn size_rotation_rolls_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");
        let writer =
            RotatingFileWriter::new(&path, LogRotation::Size { max_bytes: 16 }).unwrap();

        let mut handle = writer.make_writer();
        handle.write_all(b"0123456789").unwrap();
        handle.write_all(b"0123456789").unwrap();
        handle.flush().unwrap();

        // Second write exceeded the cap, so a rotated sibling must exist.
        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert!(entries.len() >= 2, "expected rotated file, got {:?}", entries);
    }

    #[test]
    fn null_logger_initializes() {
        init_test_logging();
        tracing::info!("discarded");
    }
}
