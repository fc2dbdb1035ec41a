//! Log sink setup.
//!
//! Every event becomes exactly one line:
//!
//! ```text
//! [2026-10-16 09:14:03.117] [INFO] [4242/worker-7] worker{session=7}: Session closed completed_io=10
//! ```
//!
//! The fmt layer renders the whole line into one buffer and hands it to the
//! writer in a single `write_all`. With a log file opened `O_APPEND`, lines
//! from the supervisor and its worker processes never interleave.

use chrono::Local;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

/// `[timestamp] [level] [pid/tag] spans: message fields`
pub struct LineFormat {
    pid: u32,
    tag: String,
}

impl LineFormat {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            pid: std::process::id(),
            tag: tag.into(),
        }
    }
}

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        write!(
            writer,
            "[{}] [{}] [{}/{}] ",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            event.metadata().level(),
            self.pid,
            self.tag
        )?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;
                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` overrides `level`. Lines go to `file` (appended) or stderr.
pub fn init(level: &str, file: Option<&Path>, tag: &str) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(LineFormat::new(tag));

    let result = match file {
        Some(path) => builder.with_writer(Mutex::new(open_append(path)?)).try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
    result.map_err(|e| LoggingError::Init(e.to_string()))
}

/// Open `path` for appending, creating it if needed.
pub fn open_append(path: &Path) -> Result<File, LoggingError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| LoggingError::File(path.to_path_buf(), e))
}

#[derive(Debug)]
pub enum LoggingError {
    File(PathBuf, std::io::Error),
    Init(String),
}

impl fmt::Display for LoggingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoggingError::File(path, e) => {
                write!(f, "Failed to open log file '{}': {}", path.display(), e)
            }
            LoggingError::Init(msg) => write!(f, "Failed to install log subscriber: {msg}"),
        }
    }
}

impl std::error::Error for LoggingError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Write};
    use std::sync::Arc;
    use tracing::{info, info_span, warn};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_line_format() {
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = tracing_subscriber::fmt()
            .event_format(LineFormat::new("supervisor"))
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let span = info_span!("worker", session = 7);
            let _guard = span.enter();
            info!(completed_io = 10, "Session closed");
        });

        let out = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        let line = out.lines().next().unwrap();
        let pid = std::process::id();
        assert!(line.starts_with('['));
        assert!(line.contains(&format!("] [INFO] [{pid}/supervisor] ")));
        assert!(line.contains("worker{session=7}: Session closed"));
        assert!(line.contains("completed_io=10"));
        assert_eq!(out.matches('\n').count(), 1);
    }

    #[test]
    fn test_file_sink_appends_whole_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.log");
        std::fs::write(&path, "existing\n").unwrap();

        let subscriber = tracing_subscriber::fmt()
            .event_format(LineFormat::new("worker-1"))
            .with_writer(Mutex::new(open_append(&path).unwrap()))
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            warn!("first");
            warn!(peer = "127.0.0.1:5000", "second");
        });

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "existing");
        assert!(lines[1].contains("[WARN]") && lines[1].ends_with("first"));
        assert!(lines[2].contains("/worker-1] second"));
        assert!(lines[2].contains("peer=\"127.0.0.1:5000\""));
    }

    #[test]
    fn test_open_append_reports_path() {
        let err = open_append(Path::new("/nonexistent/dir/echo.log")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/dir/echo.log"));
    }
}
