//! Thread-per-connection deployment over the bounded worker pool.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};

use reef_common::config::ServerConfig;
use reef_common::error::{ReefError, ReefResult};
use reef_core::Executor;
use reef_facade::{ReadWindow, Session};
use reef_storage::Storage;

use super::{NetworkServer, READ_WINDOW_BYTES};

const LISTEN_BACKLOG: i32 = 16;
/// Accept runs non-blocking and re-checks the shutdown flag on this interval, so `stop` never
/// needs to unblock a parked `accept` call.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Server that processes each connection synchronously on one pool thread.
pub struct BlockingServer {
    config: ServerConfig,
    storage: Arc<dyn Storage>,
    running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    acceptor: Option<JoinHandle<()>>,
    pool: Option<Arc<Executor>>,
}

impl std::fmt::Debug for BlockingServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingServer")
            .field("config", &self.config)
            .field("local_addr", &self.local_addr)
            .field("running", &self.running.load(Ordering::Acquire))
            .finish()
    }
}

impl BlockingServer {
    /// Creates a stopped server instance.
    #[must_use]
    pub fn new(config: ServerConfig, storage: Arc<dyn Storage>) -> Self {
        Self {
            config,
            storage,
            running: Arc::new(AtomicBool::new(false)),
            local_addr: None,
            acceptor: None,
            pool: None,
        }
    }

    /// Address the listener is bound to, available after a successful `start`.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl NetworkServer for BlockingServer {
    fn start(&mut self) -> ReefResult<()> {
        if self.acceptor.is_some() {
            return Err(ReefError::InvalidState("server is already started"));
        }

        let listener = bind_listener(self.config.port)?;
        let local_addr = listener
            .local_addr()
            .map_err(|error| ReefError::Io(format!("query local address failed: {error}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|error| ReefError::Io(format!("set listener non-blocking failed: {error}")))?;

        let pool = Arc::new(Executor::new(self.config.pool, self.config.pool_idle_timeout));
        self.running.store(true, Ordering::Release);

        let acceptor_pool = Arc::clone(&pool);
        let storage = Arc::clone(&self.storage);
        let running = Arc::clone(&self.running);
        let receive_timeout = self.config.receive_timeout;
        let handle = thread::spawn(move || {
            accept_loop(&listener, &acceptor_pool, &storage, &running, receive_timeout);
        });

        self.local_addr = Some(local_addr);
        self.pool = Some(pool);
        self.acceptor = Some(handle);
        info!(%local_addr, "blocking network service started");
        Ok(())
    }

    fn stop(&mut self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("stopping blocking network service");
        }
    }

    fn join(&mut self) {
        if let Some(handle) = self.acceptor.take() {
            let _ = handle.join();
        }
        if let Some(pool) = self.pool.take() {
            pool.stop(true);
        }
    }
}

fn bind_listener(port: u16) -> ReefResult<TcpListener> {
    let address = SocketAddr::from(([0, 0, 0, 0], port));
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .map_err(|error| ReefError::Io(format!("create listener socket failed: {error}")))?;
    socket
        .set_reuse_address(true)
        .map_err(|error| ReefError::Io(format!("set listener address reuse failed: {error}")))?;
    socket
        .bind(&address.into())
        .map_err(|error| ReefError::Io(format!("bind listener failed: {error}")))?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|error| ReefError::Io(format!("listen failed: {error}")))?;
    Ok(socket.into())
}

fn accept_loop(
    listener: &TcpListener,
    pool: &Arc<Executor>,
    storage: &Arc<dyn Storage>,
    running: &Arc<AtomicBool>,
    receive_timeout: Duration,
) {
    while running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "accepted connection");
                if let Err(error) = configure_stream(&stream, receive_timeout) {
                    warn!(%peer, %error, "failed to configure accepted socket");
                    continue;
                }
                let task_storage = Arc::clone(storage);
                let task_running = Arc::clone(running);
                let accepted = pool.submit(move || {
                    process_connection(stream, &task_storage, &task_running);
                });
                if !accepted {
                    // The rejected task dropped the stream, closing the socket immediately.
                    warn!(%peer, "worker pool saturated; connection rejected");
                }
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => {
                warn!(%error, "accept failed");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
    // The listener closes here; in-flight connections drain through the pool stop in `join`.
    info!("acceptor stopped");
}

fn configure_stream(stream: &TcpStream, receive_timeout: Duration) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    let timeout = if receive_timeout.is_zero() {
        None
    } else {
        Some(receive_timeout)
    };
    stream.set_read_timeout(timeout)
}

fn process_connection(mut stream: TcpStream, storage: &Arc<dyn Storage>, running: &AtomicBool) {
    let peer = stream
        .peer_addr()
        .map_or_else(|_| "unknown".to_owned(), |addr| addr.to_string());
    let mut window = ReadWindow::with_capacity(READ_WINDOW_BYTES);
    let mut session = Session::new(Arc::clone(storage));

    match drive_connection(&mut stream, &mut window, &mut session, running) {
        Ok(()) => debug!(peer = %peer, "connection closed"),
        Err(error) => debug!(peer = %peer, %error, "connection terminated"),
    }
    // Dropping the stream releases the descriptor exactly once.
}

/// Blocking read / parse / execute / respond loop for one connection.
///
/// Once shutdown is signalled the loop still finishes an in-flight command, but stops reading
/// for a new one, bounding shutdown latency without corrupting mid-command state.
fn drive_connection(
    stream: &mut TcpStream,
    window: &mut ReadWindow,
    session: &mut Session,
    running: &AtomicBool,
) -> ReefResult<()> {
    loop {
        if !running.load(Ordering::Acquire) && !session.has_pending_command() {
            return Ok(());
        }

        let read_len = match window.read_from(stream) {
            Ok(read_len) => read_len,
            Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
            Err(error)
                if matches!(
                    error.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ReefError::Io("receive timed out".to_owned()));
            }
            Err(error) => return Err(ReefError::Io(format!("read failed: {error}"))),
        };
        if read_len == 0 {
            return Ok(());
        }

        let mut write_response = |response: Vec<u8>| {
            stream
                .write_all(&response)
                .map_err(|error| ReefError::Io(format!("write response failed: {error}")))
        };
        session.advance(window, &mut write_response)?;
    }
}
