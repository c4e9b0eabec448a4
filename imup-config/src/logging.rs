//! Tracing sink installation and live reconfiguration.
//!
//! The subscriber is installed once per process; verbosity and the
//! stderr/file destination sit behind reload handles so a remote config
//! reload can rebuild the sink without restarting the agent.

use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, OnceLock, PoisonError, RwLock},
};

use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    fmt::MakeWriter, layer::SubscriberExt, registry::Registry, reload, util::SubscriberInitExt,
};

use crate::Verbosity;

static HANDLES: OnceLock<Handles> = OnceLock::new();

struct Handles {
    filter: reload::Handle<LevelFilter, Registry>,
    sink: SinkHandle,
}

/// Install the global tracing subscriber. Safe to call more than once; later
/// calls behave like [`reconfigure`].
pub fn init(verbosity: Verbosity, to_file: bool) {
    if HANDLES.get().is_some() {
        reconfigure(verbosity, to_file);
        return;
    }

    let (filter, filter_handle) = reload::Layer::new(verbosity.level_filter());
    let sink = SinkHandle::new(to_file);

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(sink.clone());

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();

    let _ = HANDLES.set(Handles {
        filter: filter_handle,
        sink,
    });
}

/// Swap the level filter and log destination in place.
pub fn reconfigure(verbosity: Verbosity, to_file: bool) {
    let Some(handles) = HANDLES.get() else {
        init(verbosity, to_file);
        return;
    };

    if handles
        .filter
        .modify(|filter| *filter = verbosity.level_filter())
        .is_err()
    {
        tracing::warn!("cannot reload log level filter");
    }

    handles.sink.set(Sink::open(to_file));
}

/// Directory the file logger writes into.
#[must_use]
pub fn log_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("imup")
        .join("logs")
}

enum Sink {
    Stderr,
    File(Arc<File>),
}

impl Sink {
    fn open(to_file: bool) -> Self {
        if !to_file {
            return Self::Stderr;
        }

        match open_log_file() {
            Ok(file) => Self::File(Arc::new(file)),
            Err(err) => {
                eprintln!("cannot open log file, falling back to stderr: {err}");
                Self::Stderr
            }
        }
    }
}

fn open_log_file() -> io::Result<File> {
    let dir = log_dir();
    std::fs::create_dir_all(&dir)?;

    let path = dir.join("imup.log");
    let file = OpenOptions::new().append(true).create(true).open(&path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666));
    }

    Ok(file)
}

#[derive(Clone)]
struct SinkHandle(Arc<RwLock<Sink>>);

impl SinkHandle {
    fn new(to_file: bool) -> Self {
        Self(Arc::new(RwLock::new(Sink::open(to_file))))
    }

    fn set(&self, sink: Sink) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = sink;
    }
}

impl<'a> MakeWriter<'a> for SinkHandle {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        match &*self.0.read().unwrap_or_else(PoisonError::into_inner) {
            Sink::Stderr => SinkWriter::Stderr(io::stderr()),
            Sink::File(file) => SinkWriter::File(Arc::clone(file)),
        }
    }
}

enum SinkWriter {
    Stderr(io::Stderr),
    File(Arc<File>),
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Stderr(stderr) => stderr.write(buf),
            Self::File(file) => (&**file).write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Stderr(stderr) => stderr.flush(),
            Self::File(file) => (&**file).flush(),
        }
    }
}
