//! Configuration module for the logsock server.
//!
//! The only runtime choice is whether to run in the background. The port,
//! backlog and data file location are fixed; they live in `Config` so the
//! server code never reaches for a global constant.

use clap::Parser;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;

/// Port the server listens on, on all interfaces.
pub const PORT: u16 = 9000;

/// Pending connections the kernel may queue while one is being served.
pub const BACKLOG: i32 = 1;

/// Location of the record log.
pub const DATA_FILE: &str = "/var/tmp/aesdsocketdata";

/// Size of a single receive, file read and send.
pub const CHUNK_SIZE: usize = 1024;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "logsock")]
#[command(about = "Append newline-terminated records to a log and echo it back", long_about = None)]
#[command(disable_help_flag = true, disable_version_flag = true)]
pub struct CliArgs {
    /// Fork into the background after the listening socket is bound
    #[arg(short = 'd')]
    pub daemon: bool,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddrV4,
    pub backlog: i32,
    pub data_path: PathBuf,
    pub chunk_size: usize,
    pub daemon: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, PORT),
            backlog: BACKLOG,
            data_path: PathBuf::from(DATA_FILE),
            chunk_size: CHUNK_SIZE,
            daemon: false,
        }
    }
}

impl Config {
    /// Load configuration from the command line.
    ///
    /// Unknown arguments make clap print usage to stderr and exit with a
    /// non-zero status, before any socket exists.
    pub fn load() -> Self {
        Self::from_args(CliArgs::parse())
    }

    fn from_args(cli: CliArgs) -> Self {
        Config {
            daemon: cli.daemon,
            ..Config::default()
        }
    }
}
