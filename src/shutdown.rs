//! Process-wide shutdown state and signal handling.
//!
//! The server blocks in `accept`, `recv` and `send` with no timeouts, so a
//! termination signal has to break those calls from the outside. The signal
//! handler does the minimum that is async-signal-safe: set a flag, shut
//! down the registered sockets and unlink the data file. The main flow
//! notices the flag once its blocking call returns and finishes the
//! orderly shutdown (closing, logging) itself.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::OnceLock;

const NO_FD: RawFd = -1;

/// The context used by the running binary and its signal handlers.
pub static SHUTDOWN: ShutdownContext = ShutdownContext::new();

/// Shutdown flag plus the descriptors a signal must interrupt
#[derive(Debug)]
pub struct ShutdownContext {
    requested: AtomicBool,
    listener: AtomicI32,
    connection: AtomicI32,
    data_path: OnceLock<CString>,
}

impl Default for ShutdownContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownContext {
    pub const fn new() -> Self {
        ShutdownContext {
            requested: AtomicBool::new(false),
            listener: AtomicI32::new(NO_FD),
            connection: AtomicI32::new(NO_FD),
            data_path: OnceLock::new(),
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Request shutdown and wake every blocked socket call.
    ///
    /// Only async-signal-safe operations happen here. Sockets are shut down
    /// rather than closed: the owning `TcpListener`/`TcpStream` still closes
    /// its descriptor exactly once when dropped.
    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);

        for slot in [&self.connection, &self.listener] {
            let fd = slot.load(Ordering::SeqCst);
            if fd != NO_FD {
                // SAFETY: shutdown(2) on a stale or invalid fd only fails
                // with EBADF/ENOTSOCK; it touches no memory.
                unsafe {
                    libc::shutdown(fd, libc::SHUT_RDWR);
                }
            }
        }

        if let Some(path) = self.data_path.get() {
            // SAFETY: `path` is a NUL-terminated string that lives as long
            // as the context.
            unsafe {
                libc::unlink(path.as_ptr());
            }
        }
    }

    pub fn register_listener(&self, fd: RawFd) {
        self.listener.store(fd, Ordering::SeqCst);
    }

    pub fn clear_listener(&self) {
        self.listener.store(NO_FD, Ordering::SeqCst);
    }

    pub fn register_connection(&self, fd: RawFd) {
        self.connection.store(fd, Ordering::SeqCst);
    }

    pub fn clear_connection(&self) {
        self.connection.store(NO_FD, Ordering::SeqCst);
    }

    /// Remember the file to unlink on shutdown. Only the first call has
    /// an effect.
    pub fn set_data_path(&self, path: &Path) -> io::Result<()> {
        let path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let _ = self.data_path.set(path);
        Ok(())
    }
}

extern "C" fn handle_signal(_signum: libc::c_int) {
    SHUTDOWN.trigger();
}

/// Install SIGINT and SIGTERM handlers that trigger [`SHUTDOWN`].
///
/// `SA_RESTART` is left unset so a blocking call in the main thread fails
/// with `EINTR` instead of resuming.
pub fn install_signal_handlers() -> Result<(), (&'static str, io::Error)> {
    for (signum, name) in [(libc::SIGINT, "SIGINT"), (libc::SIGTERM, "SIGTERM")] {
        // SAFETY: the zeroed sigaction is fully initialised below, and the
        // handler only performs async-signal-safe work.
        let rc = unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handle_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            action.sa_flags = 0;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(signum, &action, std::ptr::null_mut())
        };
        if rc != 0 {
            return Err((name, io::Error::last_os_error()));
        }
    }
    Ok(())
}
