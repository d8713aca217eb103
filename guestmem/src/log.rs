//! The implementation of the `GM_LOG` environment variable.
//!
//! Mapping operations are infrequent and diagnostically interesting, so they
//! are logged through a process-wide logger configured once from the
//! environment rather than threaded through every call site.

use std::{env, error::Error, fs::File, io::Write, path::PathBuf, sync::LazyLock};
use strum::{EnumCount, FromRepr};

/// How verbose should the guest-memory logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    /// Log errors (e.g. mapping requests against a dead address space).
    Error,
    /// Log warnings (e.g. decoding stopped at a non-executable byte).
    Warning,
    /// Log events (e.g. ranges being mapped and unmapped).
    Event,
}

pub struct Log {
    /// The requested [Verbosity] level for logging.
    level: Verbosity,
    /// The path to write to. A value of `None` means stderr.
    path: Option<PathBuf>,
}

static LOG: LazyLock<Log> = LazyLock::new(|| match Log::new() {
    Ok(log) => log,
    Err(e) => {
        eprintln!("gm-error: {e}");
        Log {
            level: Verbosity::Error,
            path: None,
        }
    }
});

impl Log {
    fn new() -> Result<Self, Box<dyn Error>> {
        match env::var("GM_LOG") {
            Ok(s) => {
                let (path, level) = match s.split(':').collect::<Vec<_>>()[..] {
                    [path, level] => {
                        if path == "-" {
                            (None, level)
                        } else {
                            let path = PathBuf::from(path);
                            // If there's an existing log file, truncate (i.e. empty it), so that
                            // later appends to the log aren't appending to a previous log run.
                            File::create(&path).ok();
                            (Some(path), level)
                        }
                    }
                    [level] => (None, level),
                    [..] => return Err("GM_LOG must be of the format `[<path|->:]<level>`".into()),
                };
                let level = level
                    .parse::<u8>()
                    .map_err(|e| format!("Invalid GM_LOG level '{s}': {e}"))?;
                let max_level = u8::try_from(Verbosity::COUNT).unwrap() - 1;
                let level = Verbosity::from_repr(level)
                    .ok_or_else(|| format!("GM_LOG level {level} exceeds maximum {max_level}"))?;
                Ok(Self { path, level })
            }
            Err(_) => Ok(Self {
                path: None,
                level: Verbosity::Error,
            }),
        }
    }

    /// Log `msg` with the [Verbosity] level `level`.
    ///
    /// # Panics
    ///
    /// If `level == Verbosity::Disabled`.
    fn log(&self, level: Verbosity, msg: &str) {
        if level <= self.level {
            let prefix = match level {
                Verbosity::Disabled => panic!(),
                Verbosity::Error => "gm-error",
                Verbosity::Warning => "gm-warning",
                Verbosity::Event => "gm-event",
            };
            match &self.path {
                Some(p) => {
                    let s = format!("{prefix}: {msg}\n");
                    File::options()
                        .append(true)
                        .open(p)
                        .map(|mut x| x.write(s.as_bytes()))
                        .ok();
                }
                None => {
                    eprintln!("{prefix}: {msg}");
                }
            }
        }
    }
}

pub fn log_error(msg: &str) {
    LOG.log(Verbosity::Error, msg);
}

pub fn log_warning(msg: &str) {
    LOG.log(Verbosity::Warning, msg);
}

pub fn log_event(msg: &str) {
    LOG.log(Verbosity::Event, msg);
}
