//! Multiplexed non-blocking deployment: one acceptor thread plus N event-loop workers.
//!
//! Each worker owns a `mio::Poll` and a disjoint set of connections; the acceptor distributes
//! new sockets round-robin through a mutex-guarded inbox plus a waker. All connection state is
//! mutated only by its owning loop thread; shutdown crosses threads as a flag-plus-wake
//! message, never as direct mutation of per-connection state.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, info, warn};

use reef_common::config::ServerConfig;
use reef_common::error::{ReefError, ReefResult};
use reef_facade::{ReadWindow, ResponseQueue, Session};
use reef_storage::Storage;

use super::{NetworkServer, READ_WINDOW_BYTES};

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(0);
const CONNECTION_TOKEN_START: usize = 1;
const MAX_EVENTS: usize = 256;
/// Bound on every poll wait so the shutdown flag is observed even under total I/O silence.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionLifecycle {
    Active,
    /// No more reads; flush queued responses, then close.
    Draining,
    /// Close as soon as control returns to the loop.
    Closing,
}

struct ReactorConnection {
    socket: TcpStream,
    window: ReadWindow,
    session: Session,
    responses: ResponseQueue,
    lifecycle: ConnectionLifecycle,
    interest: Interest,
}

impl ReactorConnection {
    fn new(socket: TcpStream, storage: Arc<dyn Storage>) -> Self {
        Self {
            socket,
            window: ReadWindow::with_capacity(READ_WINDOW_BYTES),
            session: Session::new(storage),
            responses: ResponseQueue::new(),
            lifecycle: ConnectionLifecycle::Active,
            interest: Interest::READABLE,
        }
    }

    fn on_peer_closed_or_error(&mut self) {
        if self.lifecycle == ConnectionLifecycle::Active {
            self.lifecycle = ConnectionLifecycle::Draining;
        }
    }

    fn mark_draining(&mut self) {
        if self.lifecycle == ConnectionLifecycle::Active {
            self.lifecycle = ConnectionLifecycle::Draining;
        }
    }

    fn mark_closing(&mut self) {
        self.lifecycle = ConnectionLifecycle::Closing;
    }

    fn can_read(&self) -> bool {
        self.lifecycle == ConnectionLifecycle::Active
    }

    fn should_try_flush(&self) -> bool {
        !self.responses.is_empty()
    }

    fn should_close_now(&self) -> bool {
        self.lifecycle == ConnectionLifecycle::Closing
            || (self.lifecycle == ConnectionLifecycle::Draining && self.responses.is_empty())
    }

    /// Reads until the socket would block, advancing the session on whatever bytes arrived.
    fn handle_readable(&mut self) {
        loop {
            match self.window.read_from(&mut self.socket) {
                Ok(0) => {
                    self.mark_draining();
                    return;
                }
                Ok(_) => {
                    let responses = &mut self.responses;
                    let mut queue_response = |response: Vec<u8>| {
                        responses.push(response);
                        Ok(())
                    };
                    if let Err(error) = self.session.advance(&mut self.window, &mut queue_response)
                    {
                        // Protocol violations are fatal; no response is guaranteed.
                        debug!(%error, "connection fault while reading");
                        self.mark_closing();
                        return;
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => return,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => {
                    debug!(%error, "read failed");
                    self.mark_closing();
                    return;
                }
            }
        }
    }

    /// Drains queued responses; a partial write leaves the cursor mid-element.
    fn handle_writable(&mut self) {
        match self.responses.write_to(&mut self.socket) {
            Ok(_drained) => {}
            Err(error) => {
                debug!(%error, "write failed");
                self.mark_closing();
            }
        }
    }

    fn desired_interest(&self) -> Interest {
        let mut interest = if self.can_read() {
            Interest::READABLE
        } else {
            Interest::WRITABLE
        };
        if !self.responses.is_empty() {
            interest |= Interest::WRITABLE;
        }
        interest
    }
}

/// Per-worker handle shared with the acceptor: new sockets arrive through the inbox, the waker
/// interrupts the worker's poll wait.
struct WorkerShared {
    inbox: Mutex<Vec<TcpStream>>,
    waker: Waker,
}

/// Server multiplexing all connections over a fixed set of event-loop threads.
pub struct ReactorServer {
    config: ServerConfig,
    storage: Arc<dyn Storage>,
    running: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
    acceptor: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    worker_shared: Vec<Arc<WorkerShared>>,
}

impl std::fmt::Debug for ReactorServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReactorServer")
            .field("config", &self.config)
            .field("local_addr", &self.local_addr)
            .field("running", &self.running.load(Ordering::Acquire))
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl ReactorServer {
    /// Creates a stopped server instance.
    #[must_use]
    pub fn new(config: ServerConfig, storage: Arc<dyn Storage>) -> Self {
        Self {
            config,
            storage,
            running: Arc::new(AtomicBool::new(false)),
            local_addr: None,
            acceptor: None,
            workers: Vec::new(),
            worker_shared: Vec::new(),
        }
    }

    /// Address the listener is bound to, available after a successful `start`.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl NetworkServer for ReactorServer {
    fn start(&mut self) -> ReefResult<()> {
        if self.acceptor.is_some() {
            return Err(ReefError::InvalidState("server is already started"));
        }

        let address = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let mut listener = TcpListener::bind(address)
            .map_err(|error| ReefError::Io(format!("bind listener failed: {error}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|error| ReefError::Io(format!("query local address failed: {error}")))?;

        let acceptor_poll =
            Poll::new().map_err(|error| ReefError::Io(format!("create poll failed: {error}")))?;
        acceptor_poll
            .registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(|error| {
                ReefError::Io(format!("register listener in poll failed: {error}"))
            })?;

        // Create every worker's poll and waker first so a setup failure aborts the whole start
        // before any thread exists.
        let worker_count = self.config.reactor_workers.max(1);
        let mut worker_setups = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let poll = Poll::new()
                .map_err(|error| ReefError::Io(format!("create worker poll failed: {error}")))?;
            let waker = Waker::new(poll.registry(), WAKER_TOKEN)
                .map_err(|error| ReefError::Io(format!("create worker waker failed: {error}")))?;
            let shared = Arc::new(WorkerShared {
                inbox: Mutex::new(Vec::new()),
                waker,
            });
            worker_setups.push((poll, shared));
        }

        self.running.store(true, Ordering::Release);
        for (worker_index, (poll, shared)) in worker_setups.into_iter().enumerate() {
            self.worker_shared.push(Arc::clone(&shared));
            let running = Arc::clone(&self.running);
            let storage = Arc::clone(&self.storage);
            self.workers.push(thread::spawn(move || {
                worker_loop(worker_index, poll, &shared, &running, &storage);
            }));
        }

        let worker_handles = self.worker_shared.clone();
        let running = Arc::clone(&self.running);
        self.acceptor = Some(thread::spawn(move || {
            accept_loop(acceptor_poll, listener, &worker_handles, &running);
        }));

        self.local_addr = Some(local_addr);
        info!(%local_addr, workers = worker_count, "reactor network service started");
        Ok(())
    }

    fn stop(&mut self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("stopping reactor network service");
            for shared in &self.worker_shared {
                if let Err(error) = shared.waker.wake() {
                    warn!(%error, "failed to wake worker for shutdown");
                }
            }
        }
    }

    fn join(&mut self) {
        if let Some(handle) = self.acceptor.take() {
            let _ = handle.join();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        self.worker_shared.clear();
    }
}

fn accept_loop(
    mut poll: Poll,
    listener: TcpListener,
    workers: &[Arc<WorkerShared>],
    running: &AtomicBool,
) {
    let mut events = Events::with_capacity(8);
    let mut next_worker = 0_usize;

    while running.load(Ordering::Acquire) {
        if let Err(error) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if error.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!(%error, "acceptor poll failed");
            break;
        }

        loop {
            match listener.accept() {
                Ok((socket, peer)) => {
                    debug!(%peer, "accepted connection");
                    let worker = &workers[next_worker % workers.len()];
                    next_worker = next_worker.wrapping_add(1);
                    if let Ok(mut inbox) = worker.inbox.lock() {
                        inbox.push(socket);
                    }
                    if let Err(error) = worker.waker.wake() {
                        warn!(%error, "failed to wake worker for new connection");
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error) => {
                    warn!(%error, "accept failed");
                    break;
                }
            }
        }
    }
    // The listener closes here; workers tear down their own connections.
    info!("reactor acceptor stopped");
}

fn worker_loop(
    worker_index: usize,
    mut poll: Poll,
    shared: &WorkerShared,
    running: &AtomicBool,
    storage: &Arc<dyn Storage>,
) {
    let mut events = Events::with_capacity(MAX_EVENTS);
    let mut connections: HashMap<Token, ReactorConnection> = HashMap::new();
    let mut next_token = CONNECTION_TOKEN_START;

    while running.load(Ordering::Acquire) {
        if let Err(error) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if error.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!(worker = worker_index, %error, "worker poll failed; exiting");
            break;
        }

        register_inbox(
            worker_index,
            &poll,
            shared,
            &mut connections,
            &mut next_token,
            storage,
        );

        for event in &events {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }
            // A stale token whose connection already closed dispatches nothing.
            let Some(mut connection) = connections.remove(&token) else {
                continue;
            };

            if event.is_read_closed() || event.is_write_closed() || event.is_error() {
                connection.on_peer_closed_or_error();
            }
            if event.is_readable() && connection.can_read() {
                connection.handle_readable();
            }
            if event.is_writable() && connection.should_try_flush() {
                connection.handle_writable();
            }

            if connection.should_close_now() {
                close_connection(worker_index, &poll, token, connection);
                continue;
            }
            if let Err(error) = refresh_interest(&poll, token, &mut connection) {
                warn!(worker = worker_index, %error, "interest refresh failed; closing connection");
                close_connection(worker_index, &poll, token, connection);
                continue;
            }
            let _ = connections.insert(token, connection);
        }
    }

    shutdown_connections(worker_index, &poll, &mut connections);
}

fn register_inbox(
    worker_index: usize,
    poll: &Poll,
    shared: &WorkerShared,
    connections: &mut HashMap<Token, ReactorConnection>,
    next_token: &mut usize,
    storage: &Arc<dyn Storage>,
) {
    let sockets = match shared.inbox.lock() {
        Ok(mut inbox) => inbox.drain(..).collect::<Vec<_>>(),
        Err(_) => return,
    };

    for mut socket in sockets {
        let token = Token(*next_token);
        *next_token = next_token.saturating_add(1);
        if let Err(error) = poll
            .registry()
            .register(&mut socket, token, Interest::READABLE)
        {
            warn!(worker = worker_index, %error, "register accepted connection failed");
            continue;
        }
        let _ = socket.set_nodelay(true);
        let _ = connections.insert(token, ReactorConnection::new(socket, Arc::clone(storage)));
        debug!(worker = worker_index, token = token.0, "connection registered");
    }
}

fn refresh_interest(
    poll: &Poll,
    token: Token,
    connection: &mut ReactorConnection,
) -> ReefResult<()> {
    let next_interest = connection.desired_interest();
    if next_interest == connection.interest {
        return Ok(());
    }
    poll.registry()
        .reregister(&mut connection.socket, token, next_interest)
        .map_err(|error| {
            ReefError::Io(format!("refresh connection poll interest failed: {error}"))
        })?;
    connection.interest = next_interest;
    Ok(())
}

fn close_connection(
    worker_index: usize,
    poll: &Poll,
    token: Token,
    mut connection: ReactorConnection,
) {
    if let Err(error) = poll.registry().deregister(&mut connection.socket) {
        debug!(worker = worker_index, %error, "deregister failed");
    }
    debug!(worker = worker_index, token = token.0, "connection closed");
    // Dropping the connection releases the descriptor exactly once.
}

/// Graceful shutdown for one loop: best-effort flush of queued responses, then close all owned
/// connections before the thread exits.
fn shutdown_connections(
    worker_index: usize,
    poll: &Poll,
    connections: &mut HashMap<Token, ReactorConnection>,
) {
    for (token, mut connection) in connections.drain() {
        if connection.should_try_flush() {
            let _ = connection.responses.write_to(&mut connection.socket);
        }
        close_connection(worker_index, poll, token, connection);
    }
}
