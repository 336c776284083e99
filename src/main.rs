//! logsock: a TCP record log server
//!
//! Listens on port 9000 and treats every newline-terminated chunk of bytes
//! it receives as a record:
//! - each record is appended to `/var/tmp/aesdsocketdata`
//! - after each record the full log is sent back to the client
//! - connections are handled one at a time
//! - SIGINT/SIGTERM stop the server and delete the log
//!
//! Pass `-d` to fork into the background once the port is bound.

mod config;
mod daemon;
mod logging;
mod record;
mod server;
mod shutdown;
mod storage;

use config::Config;
use server::{Server, ServerError};
use shutdown::SHUTDOWN;
use tracing::{error, info};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration; bad arguments exit here, before any socket exists
    let config = Config::load();

    // Initialize logging
    logging::init();

    info!(
        address = %config.listen,
        data_file = %config.data_path.display(),
        daemon = config.daemon,
        "Starting logsock server"
    );

    let result = run(config);
    if let Err(ref e) = result {
        error!(error = %e, "Server failed");
    }
    logging::close();

    result.map_err(Into::into)
}

fn run(config: Config) -> Result<(), ServerError> {
    let daemon = config.daemon;
    let server = Server::bind(config, &SHUTDOWN)?;

    // The port is reserved before the foreground parent exits.
    if daemon {
        daemon::daemonize()?;
    }

    shutdown::install_signal_handlers().map_err(|(name, e)| ServerError::Signal(name, e))?;

    server.run();
    Ok(())
}
