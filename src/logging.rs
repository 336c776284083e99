//! Logging to the system log.
//!
//! `tracing` events are formatted by `tracing_subscriber::fmt` and handed to
//! syslog(3), one message per event, with the syslog priority taken from the
//! event level. The log is opened with `LOG_PERROR`, so a foreground server
//! also prints every message to stderr.

use std::ffi::CString;
use std::io;
use tracing::{Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

const DEFAULT_LEVEL: &str = "info";

/// Open the system log and install the global subscriber.
///
/// Verbosity comes from `RUST_LOG`, falling back to `info`.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL));

    // SAFETY: a null ident makes syslog use the program name.
    unsafe {
        libc::openlog(
            std::ptr::null(),
            libc::LOG_PID | libc::LOG_PERROR,
            libc::LOG_USER,
        );
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Syslog)
        .with_ansi(false)
        .without_time()
        .with_target(false)
        .with_level(false)
        .init();
}

/// Close the system log.
pub fn close() {
    // SAFETY: closelog is always safe to call.
    unsafe { libc::closelog() }
}

fn priority(level: &Level) -> libc::c_int {
    match *level {
        Level::ERROR => libc::LOG_ERR,
        Level::WARN => libc::LOG_WARNING,
        Level::INFO => libc::LOG_INFO,
        Level::DEBUG | Level::TRACE => libc::LOG_DEBUG,
    }
}

/// `MakeWriter` that produces one syslog message per event
#[derive(Debug, Clone, Copy, Default)]
pub struct Syslog;

impl<'a> MakeWriter<'a> for Syslog {
    type Writer = SyslogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SyslogWriter::new(libc::LOG_INFO)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        SyslogWriter::new(priority(meta.level()))
    }
}

/// Buffers one formatted event and sends it to syslog when dropped
#[derive(Debug)]
pub struct SyslogWriter {
    priority: libc::c_int,
    line: Vec<u8>,
}

impl SyslogWriter {
    fn new(priority: libc::c_int) -> Self {
        SyslogWriter {
            priority,
            line: Vec::new(),
        }
    }

    fn message(&self) -> Option<CString> {
        let mut line = self.line.as_slice();
        while let [rest @ .., b'\n' | b'\r'] = line {
            line = rest;
        }
        if line.is_empty() {
            return None;
        }
        let bytes: Vec<u8> = line.iter().map(|&b| if b == 0 { b' ' } else { b }).collect();
        CString::new(bytes).ok()
    }
}

impl io::Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.line.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SyslogWriter {
    fn drop(&mut self) {
        if let Some(msg) = self.message() {
            // SAFETY: both the format and the message are NUL-terminated.
            unsafe {
                libc::syslog(self.priority, c"%s".as_ptr(), msg.as_ptr());
            }
        }
    }
}
