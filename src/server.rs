//! TCP server for the record log.
//!
//! Connections are served strictly one at a time on the calling thread:
//! the accept loop does not call `accept` again until the current
//! connection's handler has returned. Every completed record is appended to
//! the log, the whole log is sent back, and the write side of the
//! connection is shut down so the client sees the end of the response.

use crate::config::Config;
use crate::daemon::DaemonError;
use crate::record::RecordBuffer;
use crate::shutdown::ShutdownContext;
use crate::storage::{CopyError, DataStore};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use tracing::{debug, error, info, trace};

/// Fatal errors while bringing the server up
#[derive(Debug)]
pub enum ServerError {
    Socket(io::Error),
    ReuseAddr(io::Error),
    Bind(SocketAddrV4, io::Error),
    Listen(io::Error),
    LocalAddr(io::Error),
    DataPath(io::Error),
    Daemon(DaemonError),
    Signal(&'static str, io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Socket(e) => write!(f, "socket() failed: {}", e),
            ServerError::ReuseAddr(e) => write!(f, "setsockopt(SO_REUSEADDR) failed: {}", e),
            ServerError::Bind(addr, e) => write!(f, "bind() to {} failed: {}", addr, e),
            ServerError::Listen(e) => write!(f, "listen() failed: {}", e),
            ServerError::LocalAddr(e) => write!(f, "failed to read listening address: {}", e),
            ServerError::DataPath(e) => write!(f, "invalid data file path: {}", e),
            ServerError::Daemon(e) => write!(f, "daemon mode failed: {}", e),
            ServerError::Signal(name, e) => write!(f, "failed to install {} handler: {}", name, e),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<DaemonError> for ServerError {
    fn from(e: DaemonError) -> Self {
        ServerError::Daemon(e)
    }
}

/// Create the listening socket: IPv4, `SO_REUSEADDR`, blocking.
fn bind_listener(config: &Config) -> Result<TcpListener, ServerError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(ServerError::Socket)?;

    socket
        .set_reuse_address(true)
        .map_err(ServerError::ReuseAddr)?;
    socket
        .bind(&SocketAddr::V4(config.listen).into())
        .map_err(|e| ServerError::Bind(config.listen, e))?;
    socket.listen(config.backlog).map_err(ServerError::Listen)?;

    Ok(socket.into())
}

/// Server instance
pub struct Server {
    config: Config,
    listener: TcpListener,
    store: DataStore,
    shutdown: &'static ShutdownContext,
}

impl Server {
    /// Bind and start listening.
    ///
    /// The listening socket and the data file are registered with
    /// `shutdown` so a signal can interrupt the server at any point after
    /// this returns.
    pub fn bind(config: Config, shutdown: &'static ShutdownContext) -> Result<Self, ServerError> {
        let listener = bind_listener(&config)?;
        let local_addr = listener.local_addr().map_err(ServerError::LocalAddr)?;

        shutdown
            .set_data_path(&config.data_path)
            .map_err(ServerError::DataPath)?;
        shutdown.register_listener(listener.as_raw_fd());

        // Each run starts with an empty log.
        let store = DataStore::new(config.data_path.clone());
        match store.remove() {
            Ok(true) => info!(path = %store.path().display(), "Removed stale data file"),
            Ok(false) => {}
            Err(e) => error!(
                path = %store.path().display(),
                error = %e,
                "Failed to remove stale data file"
            ),
        }

        info!(
            address = %local_addr,
            backlog = config.backlog,
            data_file = %config.data_path.display(),
            "Server listening"
        );

        Ok(Server {
            store,
            config,
            listener,
            shutdown,
        })
    }

    /// Accept and serve connections until shutdown is requested, then
    /// close the listener and delete the data file.
    pub fn run(self) {
        while !self.shutdown.is_requested() {
            let (mut stream, peer) = match self.listener.accept() {
                Ok(conn) => conn,
                Err(_) if self.shutdown.is_requested() => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    continue;
                }
            };

            // Responses go out as soon as they are written.
            if let Err(e) = stream.set_nodelay(true) {
                error!(peer = %peer.ip(), error = %e, "Failed to set TCP_NODELAY");
            }

            info!(peer = %peer.ip(), "Accepted connection");
            self.shutdown.register_connection(stream.as_raw_fd());
            if !self.shutdown.is_requested() {
                self.handle_connection(&mut stream);
            }
            self.shutdown.clear_connection();
            drop(stream);
            info!(peer = %peer.ip(), "Closed connection");
        }

        if self.shutdown.is_requested() {
            info!("Caught signal, exiting");
        }
        self.close();
    }

    fn close(self) {
        self.shutdown.clear_listener();
        drop(self.listener);

        match self.store.remove() {
            Ok(true) => debug!(path = %self.store.path().display(), "Removed data file"),
            Ok(false) => {}
            Err(e) => error!(
                path = %self.store.path().display(),
                error = %e,
                "Failed to remove data file"
            ),
        }
    }

    /// Serve one connection until the peer closes, a receive fails, or
    /// shutdown is requested.
    fn handle_connection(&self, stream: &mut TcpStream) {
        let mut records = RecordBuffer::new();
        let mut chunk = vec![0u8; self.config.chunk_size.max(1)];

        while !self.shutdown.is_requested() {
            let n = match stream.read(&mut chunk) {
                Ok(0) => {
                    trace!("Connection closed by client");
                    break;
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if !self.shutdown.is_requested() {
                        error!(error = %e, "Failed to receive");
                    }
                    break;
                }
            };

            debug!(bytes = n, "Received data");
            self.handle_chunk(stream, &mut records, &chunk[..n]);
        }

        if records.pending() > 0 {
            debug!(
                bytes = records.pending(),
                "Discarding unterminated record"
            );
        }
    }

    /// Flush every record completed by `chunk`. Once shutdown has started
    /// the log is left alone.
    fn handle_chunk(&self, stream: &mut TcpStream, records: &mut RecordBuffer, chunk: &[u8]) {
        records.feed(chunk, |record| {
            if !self.shutdown.is_requested() {
                self.flush_record(stream, record);
            }
        });
    }

    /// Append `record` to the log, send the whole log back and half-close.
    fn flush_record(&self, stream: &mut TcpStream, record: &[u8]) {
        debug!(
            bytes = record.len(),
            path = %self.store.path().display(),
            "Writing record"
        );

        // The echo is still attempted: the client gets whatever the log holds.
        if let Err(e) = self.store.append(record) {
            error!(path = %self.store.path().display(), error = %e, "Failed to append record");
        }

        match self.store.copy_to(stream, self.config.chunk_size) {
            Ok(bytes) => trace!(bytes, "Sent data file"),
            Err(CopyError::Read(e)) => {
                error!(path = %self.store.path().display(), error = %e, "Failed to read data file")
            }
            // Expected for any record after the first on a connection.
            Err(CopyError::Write(e)) => debug!(error = %e, "Failed to send data file"),
        }

        if let Err(e) = stream.shutdown(Shutdown::Write) {
            debug!(error = %e, "Failed to shut down write side");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};

    struct TestServer {
        addr: SocketAddr,
        data_path: PathBuf,
        shutdown: &'static ShutdownContext,
        handle: Option<JoinHandle<()>>,
        _dir: tempfile::TempDir,
    }

    impl TestServer {
        fn start() -> Self {
            Self::start_with(|_| {})
        }

        fn start_with(adjust: impl FnOnce(&mut Config)) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = Config {
                listen: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
                data_path: dir.path().join("data"),
                ..Config::default()
            };
            adjust(&mut config);

            let data_path = config.data_path.clone();
            let shutdown: &'static ShutdownContext = Box::leak(Box::new(ShutdownContext::new()));
            let server = Server::bind(config, shutdown).unwrap();
            let addr = server.listener.local_addr().unwrap();
            let handle = thread::spawn(move || server.run());

            TestServer {
                addr,
                data_path,
                shutdown,
                handle: Some(handle),
                _dir: dir,
            }
        }

        fn stop(&mut self) {
            if let Some(handle) = self.handle.take() {
                self.shutdown.trigger();
                handle.join().unwrap();
            }
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.stop();
        }
    }

    /// Send `data` on a fresh connection and read until the server
    /// half-closes.
    fn exchange(addr: SocketAddr, data: &[u8]) -> Vec<u8> {
        let mut client = TcpStream::connect(addr).unwrap();
        client.write_all(data).unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        response
    }

    fn assert_silent(client: &mut TcpStream) {
        client
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let mut buf = [0u8; 64];
        match client.read(&mut buf) {
            Err(e) => assert!(
                matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ),
                "unexpected error: {}",
                e
            ),
            Ok(n) => panic!("expected no response, got {} bytes", n),
        }
        client.set_read_timeout(None).unwrap();
    }

    #[test]
    fn test_single_record_echo() {
        let server = TestServer::start();
        assert_eq!(exchange(server.addr, b"hello\n"), b"hello\n");
    }

    #[test]
    fn test_log_accumulates_across_connections() {
        let server = TestServer::start();
        assert_eq!(exchange(server.addr, b"hello\n"), b"hello\n");
        assert_eq!(exchange(server.addr, b"world\n"), b"hello\nworld\n");

        let mut expected = b"hello\nworld\n".to_vec();
        for i in 0..5 {
            let record = format!("record {}\n", i);
            expected.extend_from_slice(record.as_bytes());
            assert_eq!(exchange(server.addr, record.as_bytes()), expected);
        }
    }

    #[test]
    fn test_large_log_is_streamed_in_chunks() {
        let server = TestServer::start_with(|config| config.chunk_size = 16);
        let record: Vec<u8> = (0..10_000u32)
            .map(|i| b'0' + (i % 10) as u8)
            .chain(std::iter::once(b'\n'))
            .collect();

        assert_eq!(exchange(server.addr, &record), record);

        let mut expected = record.clone();
        expected.extend_from_slice(b"tail\n");
        assert_eq!(exchange(server.addr, b"tail\n"), expected);
    }

    #[test]
    fn test_partial_record_waits_for_terminator() {
        let server = TestServer::start();
        let mut client = TcpStream::connect(server.addr).unwrap();

        client.write_all(b"par").unwrap();
        assert_silent(&mut client);
        assert!(!server.data_path.exists());

        client.write_all(b"tial\n").unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        assert_eq!(response, b"partial\n");
    }

    #[test]
    fn test_later_records_on_connection_are_still_logged() {
        let server = TestServer::start();

        // The echo of "two" cannot be delivered after the half-close, but
        // the record itself is stored.
        assert_eq!(exchange(server.addr, b"one\ntwo\n"), b"one\n");
        assert_eq!(exchange(server.addr, b"three\n"), b"one\ntwo\nthree\n");
    }

    #[test]
    fn test_unterminated_tail_is_discarded_on_close() {
        let server = TestServer::start();
        assert_eq!(exchange(server.addr, b"kept\nlost"), b"kept\n");
        assert_eq!(exchange(server.addr, b"next\n"), b"kept\nnext\n");
    }

    #[test]
    fn test_connections_are_served_one_at_a_time() {
        let server = TestServer::start();

        // Large enough that the echo cannot fit in the socket buffers, so the
        // handler stays blocked in send while `first` does not read.
        let mut record = vec![b'x'; 16 * 1024 * 1024];
        record.push(b'\n');

        let mut first = TcpStream::connect(server.addr).unwrap();
        first.write_all(&record).unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while std::fs::metadata(&server.data_path).map(|m| m.len()).unwrap_or(0)
            < record.len() as u64
        {
            assert!(Instant::now() < deadline, "record never reached the log");
            thread::sleep(Duration::from_millis(20));
        }

        let mut second = TcpStream::connect(server.addr).unwrap();
        second.write_all(b"b\n").unwrap();
        assert_silent(&mut second);
        assert_eq!(
            std::fs::metadata(&server.data_path).unwrap().len(),
            record.len() as u64
        );

        let mut response = Vec::new();
        first.read_to_end(&mut response).unwrap();
        assert_eq!(response.len(), record.len());
        drop(first);

        let mut response = Vec::new();
        second.read_to_end(&mut response).unwrap();
        record.extend_from_slice(b"b\n");
        assert_eq!(response, record);
    }

    #[test]
    fn test_idle_connection_blocks_the_next_one() {
        let server = TestServer::start();

        let mut first = TcpStream::connect(server.addr).unwrap();
        first.write_all(b"a\n").unwrap();
        let mut response = Vec::new();
        first.read_to_end(&mut response).unwrap();
        assert_eq!(response, b"a\n");

        // `first` is still open, so the second client is queued but unread.
        let mut second = TcpStream::connect(server.addr).unwrap();
        second.write_all(b"b\n").unwrap();
        assert_silent(&mut second);
        assert_eq!(std::fs::read(&server.data_path).unwrap(), b"a\n");

        drop(first);
        let mut response = Vec::new();
        second.read_to_end(&mut response).unwrap();
        assert_eq!(response, b"a\nb\n");
    }

    #[test]
    fn test_append_failure_keeps_connection_alive() {
        let mut server = TestServer::start_with(|config| {
            config.data_path = config.data_path.join("missing").join("data");
        });

        let mut client = TcpStream::connect(server.addr).unwrap();
        client.write_all(b"lost\n").unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        assert!(response.is_empty());

        // The server is still serving the same connection.
        client.write_all(b"more\n").unwrap();
        drop(client);

        assert_eq!(exchange(server.addr, b"again\n"), b"");
        server.stop();
    }

    #[test]
    fn test_shutdown_removes_data_file() {
        let mut server = TestServer::start();
        assert_eq!(exchange(server.addr, b"hello\n"), b"hello\n");
        assert!(server.data_path.exists());

        server.stop();
        assert!(!server.data_path.exists());
    }

    #[test]
    fn test_shutdown_interrupts_active_connection() {
        let mut server = TestServer::start();

        let mut client = TcpStream::connect(server.addr).unwrap();
        client.write_all(b"a\npending").unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        assert_eq!(response, b"a\n");

        // The handler is blocked in recv waiting for the rest of the record.
        server.stop();
        assert!(!server.data_path.exists());
        assert!(TcpStream::connect(server.addr).is_err());
    }

    #[test]
    fn test_stale_data_file_removed_on_bind() {
        let server = TestServer::start_with(|config| {
            std::fs::write(&config.data_path, b"old\n").unwrap();
        });
        assert_eq!(exchange(server.addr, b"new\n"), b"new\n");
    }

    #[test]
    fn test_no_records_logged_after_shutdown_starts() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            listen: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
            data_path: dir.path().join("data"),
            ..Config::default()
        };
        let shutdown: &'static ShutdownContext = Box::leak(Box::new(ShutdownContext::new()));
        let server = Server::bind(config, shutdown).unwrap();

        let peer = TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = TcpStream::connect(peer.local_addr().unwrap()).unwrap();
        let (mut stream, _) = peer.accept().unwrap();

        let mut records = RecordBuffer::new();
        server.handle_chunk(&mut stream, &mut records, b"before\n");
        assert_eq!(std::fs::read(dir.path().join("data")).unwrap(), b"before\n");

        shutdown.trigger();
        assert!(!dir.path().join("data").exists());

        server.handle_chunk(&mut stream, &mut records, b"a\nb\n");
        assert!(!dir.path().join("data").exists());
        assert_eq!(records.pending(), 0);
    }

    #[test]
    fn test_bind_conflict_is_fatal() {
        let server = TestServer::start();
        let config = Config {
            listen: SocketAddrV4::new(Ipv4Addr::LOCALHOST, server.addr.port()),
            ..Config::default()
        };
        let shutdown: &'static ShutdownContext = Box::leak(Box::new(ShutdownContext::new()));

        match Server::bind(config, shutdown) {
            Err(ServerError::Bind(addr, _)) => assert_eq!(addr.port(), server.addr.port()),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("second bind succeeded"),
        }
    }
}
