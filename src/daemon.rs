//! Background (daemon) mode.
//!
//! Called after the listening socket is bound and listening, so the port is
//! already reserved by the time the foreground parent exits.

use std::ffi::CStr;
use std::io;
use tracing::info;

const DEV_NULL: &CStr = c"/dev/null";
const ROOT: &CStr = c"/";

/// Step of daemonization that failed
#[derive(Debug)]
pub enum DaemonError {
    Fork(io::Error),
    Setsid(io::Error),
    Chdir(io::Error),
    DevNull(io::Error),
    Redirect(io::Error),
}

impl std::fmt::Display for DaemonError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DaemonError::Fork(e) => write!(f, "fork failed: {}", e),
            DaemonError::Setsid(e) => write!(f, "setsid failed: {}", e),
            DaemonError::Chdir(e) => write!(f, "chdir to / failed: {}", e),
            DaemonError::DevNull(e) => write!(f, "failed to open /dev/null: {}", e),
            DaemonError::Redirect(e) => write!(f, "failed to redirect standard streams: {}", e),
        }
    }
}

impl std::error::Error for DaemonError {}

/// Fork into the background.
///
/// The parent exits with status 0 and never returns. The child detaches
/// from the controlling terminal, moves to `/`, clears the umask and points
/// stdin, stdout and stderr at `/dev/null`.
pub fn daemonize() -> Result<(), DaemonError> {
    // SAFETY: the process is single-threaded at this point, so the child
    // inherits a consistent copy of the address space.
    match unsafe { libc::fork() } {
        -1 => return Err(DaemonError::Fork(io::Error::last_os_error())),
        0 => {}
        _ => std::process::exit(0),
    }

    // SAFETY: plain syscalls on static, NUL-terminated paths.
    unsafe {
        if libc::setsid() < 0 {
            return Err(DaemonError::Setsid(io::Error::last_os_error()));
        }
        if libc::chdir(ROOT.as_ptr()) < 0 {
            return Err(DaemonError::Chdir(io::Error::last_os_error()));
        }
        libc::umask(0);
    }

    redirect_std_streams()?;
    info!(pid = std::process::id(), "Running in daemon mode");
    Ok(())
}

fn redirect_std_streams() -> Result<(), DaemonError> {
    // SAFETY: `DEV_NULL` is a valid C string; the descriptors passed to
    // dup2/close are ones this function owns or the standard streams.
    unsafe {
        let null = libc::open(DEV_NULL.as_ptr(), libc::O_RDWR);
        if null < 0 {
            return Err(DaemonError::DevNull(io::Error::last_os_error()));
        }
        for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
            if libc::dup2(null, fd) < 0 {
                let err = io::Error::last_os_error();
                libc::close(null);
                return Err(DaemonError::Redirect(err));
            }
        }
        if null > libc::STDERR_FILENO {
            libc::close(null);
        }
    }
    Ok(())
}
