use std::{
    borrow::Cow,
    fmt,
    io::{self, Write},
    panic::Location,
    sync::Arc,
};

use parking_lot::Mutex;

/// Destination of rendered access log lines.
///
/// Cloning an `Output` shares the destination: lines from every clone go
/// through the same lock, so two requests never interleave mid-line.
///
/// # Examples
/// ```rust
/// use actix_web_middleware_accesslog::Output;
///
/// let to_stderr = Output::stderr();
/// let to_log_facade = Output::log("http_access");
/// ```
#[derive(Clone)]
pub struct Output(Target);

#[derive(Clone)]
enum Target {
    Writer(Arc<Mutex<Box<dyn Write + Send>>>),
    Log {
        target: Cow<'static, str>,
        level: log::Level,
    },
}

impl Output {
    pub fn stdout() -> Self {
        Output::writer(io::stdout())
    }

    pub fn stderr() -> Self {
        Output::writer(io::stderr())
    }

    /// Write lines to `writer`, one `write_all` per line.
    pub fn writer<W: Write + Send + 'static>(writer: W) -> Self {
        Output(Target::Writer(Arc::new(Mutex::new(Box::new(writer)))))
    }

    /// Forward lines to the `log` facade as `info` records with the given target.
    pub fn log(target: impl Into<Cow<'static, str>>) -> Self {
        Output(Target::Log {
            target: target.into(),
            level: log::Level::Info,
        })
    }

    /// Change the level of records produced by [`Output::log`]. No effect on writers.
    pub fn with_level(mut self, new_level: log::Level) -> Self {
        if let Target::Log { level, .. } = &mut self.0 {
            *level = new_level;
        }
        self
    }

    /// Emit one line. Failures are reported through `log` and otherwise ignored.
    #[track_caller]
    pub(crate) fn write_line(&self, mut line: String) {
        match &self.0 {
            Target::Writer(writer) => {
                line.push('\n');
                let mut writer = writer.lock();
                let written = writer
                    .write_all(line.as_bytes())
                    .and_then(|()| writer.flush());
                if let Err(err) = written {
                    log::warn!("failed to write access log line: {err}");
                }
            }
            Target::Log { target, level } => rust_log::log(
                *level,
                target.as_ref(),
                module_path!(),
                Location::caller(),
                &line,
            ),
        }
    }
}

impl Default for Output {
    fn default() -> Self {
        Output::stdout()
    }
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Target::Writer(_) => f.write_str("Output::Writer"),
            Target::Log { target, level } => f
                .debug_struct("Output::Log")
                .field("target", target)
                .field("level", level)
                .finish(),
        }
    }
}

pub mod rust_log {
    use std::panic::Location;

    pub fn log(
        level: log::Level,
        target: &str,
        module_path: &'static str,
        loc: &'static Location<'static>,
        line: &str,
    ) {
        log::logger().log(
            &log::Record::builder()
                .args(format_args!("{line}"))
                .level(level)
                .target(target)
                .module_path_static(Some(module_path))
                .file_static(Some(loc.file()))
                .line(Some(loc.line()))
                .build(),
        );
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io::{self, Write};
    use std::sync::Arc;

    use parking_lot::Mutex;

    /// Writer whose contents stay readable after it is handed to an `Output`.
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        pub(crate) fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
