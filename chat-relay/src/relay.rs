//! Two-party TCP relay using one OS thread per connection.
//!
//! - **Accept thread**: blocks on the listener, registers each connection, and
//!   either rejects it (capacity reached) or spawns its session thread.
//! - **Session threads**: read newline-delimited input, validate it, and hand
//!   chat lines to [`broadcast`](crate::broadcast::broadcast).
//!
//! The registry lock is held only while the membership table is touched;
//! sends happen afterwards on a snapshot, so a slow peer never blocks
//! registration.

use std::{
    io::{self, BufRead, BufReader, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, warn};

use crate::{
    broadcast::{Outbox, broadcast},
    config::ServerConfig,
    message::{Notice, PeerLabel, Profile},
    registry::{PeerId, PeerIds, Registry},
    session::{Inbound, InputRules, Session, SessionEvent},
};

const PROFILE: Profile = Profile::Stream;

/// Longest line buffered before it is answered as too long, in bytes.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Writing half of a relay connection, shared with the registry.
#[derive(Clone, Debug)]
pub struct StreamOutbox {
    stream: Arc<TcpStream>,
}

impl StreamOutbox {
    fn new(stream: Arc<TcpStream>) -> Self {
        Self { stream }
    }

    fn notify(&self, notice: &Notice) -> io::Result<()> {
        self.deliver(&notice.render(PROFILE))
    }
}

impl Outbox for StreamOutbox {
    fn deliver(&self, text: &str) -> io::Result<()> {
        let mut stream = &*self.stream;
        stream.write_all(text.as_bytes())?;
        stream.flush()
    }

    fn close(&self) {
        // The peer may already be gone (ENOTCONN); nothing left to do then.
        if let Err(err) = self.stream.shutdown(Shutdown::Both) {
            debug!(error = ?err, "shutdown on closed connection");
        }
    }
}

struct RelayState {
    registry: Registry<StreamOutbox>,
    ids: PeerIds,
    rules: InputRules,
    running: AtomicBool,
}

pub struct RelayServer {
    listener: TcpListener,
    state: Arc<RelayState>,
}

impl RelayServer {
    /// Binds the listening socket. Failure here aborts startup.
    pub fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)
            .with_context(|| format!("failed to bind relay to {}", config.listen))?;
        Ok(Self::new(listener, &config))
    }

    pub fn new(listener: TcpListener, config: &ServerConfig) -> Self {
        Self {
            listener,
            state: Arc::new(RelayState {
                registry: Registry::new(config.capacity),
                ids: PeerIds::new(),
                rules: config.input_rules(),
                running: AtomicBool::new(true),
            }),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs the accept loop on the calling thread.
    pub fn run(self) -> Result<()> {
        accept_loop(&self.listener, &self.state);
        Ok(())
    }

    /// Runs the accept loop on a dedicated thread.
    pub fn spawn(self) -> Result<RelayHandle> {
        let addr = self.local_addr()?;
        let RelayServer { listener, state } = self;
        let accept_state = Arc::clone(&state);
        let accept = thread::Builder::new()
            .name(format!("relay-accept-{addr}"))
            .spawn(move || accept_loop(&listener, &accept_state))
            .context("failed to spawn relay accept thread")?;

        Ok(RelayHandle {
            addr,
            state,
            accept,
        })
    }
}

/// Control handle for a relay started with [`RelayServer::spawn`].
pub struct RelayHandle {
    addr: SocketAddr,
    state: Arc<RelayState>,
    accept: JoinHandle<()>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of currently registered participants.
    pub fn participants(&self) -> usize {
        self.state.registry.len()
    }

    /// Stops accepting and closes every registered connection.
    pub fn shutdown(self) -> Result<()> {
        self.state.running.store(false, Ordering::SeqCst);
        // Unblock accept() so the loop observes the flag.
        if let Err(err) = TcpStream::connect(self.addr) {
            debug!(error = ?err, "wake-up connection failed");
        }
        self.accept
            .join()
            .map_err(|_| anyhow!("relay accept thread panicked"))?;

        for (id, outbox) in self.state.registry.drain() {
            debug!(peer = %id, "closing on shutdown");
            outbox.close();
        }
        info!("relay stopped");
        Ok(())
    }
}

fn accept_loop(listener: &TcpListener, state: &Arc<RelayState>) {
    for stream in listener.incoming() {
        if !state.running.load(Ordering::SeqCst) {
            break;
        }
        match stream {
            Ok(stream) => admit(stream, state),
            Err(err) => warn!(error = ?err, "failed to accept connection"),
        }
    }
}

/// Registers and welcomes a fresh connection, or turns it away.
fn admit(stream: TcpStream, state: &Arc<RelayState>) {
    let peer = match stream.peer_addr() {
        Ok(peer) => peer,
        Err(err) => {
            warn!(error = ?err, "dropping connection without peer address");
            return;
        }
    };
    let label = PeerLabel::from(peer);
    let stream = Arc::new(stream);
    let outbox = StreamOutbox::new(Arc::clone(&stream));
    let mut session = Session::new(state.ids.next_id(), label);

    if !state.registry.register(session.id(), outbox.clone()) {
        info!(peer = %session.label(), "connection refused: relay is full");
        if let Err(err) = outbox.notify(&Notice::Rejected) {
            debug!(peer = %session.label(), error = ?err, "rejection notice not delivered");
        }
        outbox.close();
        return;
    }

    info!(
        peer = %session.label(),
        participants = state.registry.len(),
        "client connected"
    );

    match outbox.notify(&Notice::Welcome) {
        Ok(()) => {
            // Connecting accepts Welcomed.
            let _ = session.apply(SessionEvent::Welcomed);
        }
        Err(err) => {
            close_on_error(&mut session, &err);
            state.registry.deregister(session.id());
            outbox.close();
            return;
        }
    }

    let id = session.id();
    let session_state = Arc::clone(state);
    let spawned = thread::Builder::new()
        .name(format!("relay-session-{}", id.get()))
        .spawn(move || run_session(stream, session, session_state));
    if let Err(err) = spawned {
        warn!(peer = %id, error = ?err, "failed to spawn session thread");
        if let Some(outbox) = state.registry.deregister(id) {
            outbox.close();
        }
    }
}

/// Deregisters and closes the connection when the session ends, on every
/// exit path including a panic.
struct Release<'a> {
    registry: &'a Registry<StreamOutbox>,
    id: PeerId,
    outbox: StreamOutbox,
}

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
        self.outbox.close();
    }
}

fn run_session(stream: Arc<TcpStream>, mut session: Session, state: Arc<RelayState>) {
    let outbox = StreamOutbox::new(Arc::clone(&stream));
    let release = Release {
        registry: &state.registry,
        id: session.id(),
        outbox: outbox.clone(),
    };

    let mut reader = BufReader::new(&*stream);
    let mut line = Vec::new();
    while session.is_open() {
        let handled = match read_line(&mut reader, &mut line) {
            Ok(ReadLine::Closed) => {
                session.close(SessionEvent::PeerClosed);
                Ok(())
            }
            Ok(ReadLine::Line) => {
                let text = String::from_utf8_lossy(&line).into_owned();
                handle_line(&mut session, &text, &outbox, &state)
            }
            Ok(ReadLine::Overflow) => {
                debug!(peer = %session.label(), "line exceeded the read buffer");
                outbox.notify(&Notice::TooLong)
            }
            Err(err) => Err(err),
        };
        if let Err(err) = handled {
            close_on_error(&mut session, &err);
        }
    }

    drop(release);
    if let Err(err) = session.apply(SessionEvent::Released) {
        warn!(peer = %session.label(), error = %err, "unexpected session state");
    }
    info!(
        peer = %session.label(),
        reason = ?session.closed_by(),
        participants = state.registry.len(),
        "client disconnected"
    );
}

enum ReadLine {
    Line,
    /// More than [`MAX_LINE_BYTES`] without a newline; the rest was skipped.
    Overflow,
    Closed,
}

/// Reads one newline-terminated line into `line`, buffering at most
/// [`MAX_LINE_BYTES`].
fn read_line<R: BufRead>(reader: &mut R, line: &mut Vec<u8>) -> io::Result<ReadLine> {
    line.clear();
    let read = reader
        .by_ref()
        .take(MAX_LINE_BYTES as u64)
        .read_until(b'\n', line)?;
    if read == 0 {
        return Ok(ReadLine::Closed);
    }
    if line.ends_with(b"\n") || read < MAX_LINE_BYTES {
        return Ok(ReadLine::Line);
    }
    skip_line(reader)?;
    Ok(ReadLine::Overflow)
}

/// Discards input up to and including the next newline.
fn skip_line<R: BufRead>(reader: &mut R) -> io::Result<()> {
    loop {
        let buffered = reader.fill_buf()?;
        if buffered.is_empty() {
            return Ok(());
        }
        match buffered.iter().position(|byte| *byte == b'\n') {
            Some(end) => {
                reader.consume(end + 1);
                return Ok(());
            }
            None => {
                let len = buffered.len();
                reader.consume(len);
            }
        }
    }
}

fn handle_line(
    session: &mut Session,
    text: &str,
    outbox: &StreamOutbox,
    state: &RelayState,
) -> io::Result<()> {
    match state.rules.classify(session, text) {
        Inbound::Empty => outbox.notify(&Notice::EmptyIgnored),
        Inbound::Exit => {
            session.close(SessionEvent::ExitRequested);
            outbox.notify(&Notice::Farewell)
        }
        Inbound::TooLong { len } => {
            debug!(peer = %session.label(), len, "message too long");
            outbox.notify(&Notice::TooLong)
        }
        Inbound::Chat(message) => {
            info!(peer = %message.sender_label(), body = message.body(), "relaying message");
            let delivery = broadcast(
                &state.registry,
                &message.render(PROFILE),
                Some(message.sender()),
            );
            if delivery.had_no_recipients() {
                outbox.notify(&Notice::NoOtherParticipant)?;
            }
            Ok(())
        }
    }
}

fn close_on_error(session: &mut Session, err: &io::Error) {
    match SessionEvent::from_io_error(err) {
        None => debug!(peer = %session.label(), error = ?err, "transient read error"),
        Some(SessionEvent::ConnectionReset) => {
            warn!(peer = %session.label(), "connection lost");
            session.close(SessionEvent::ConnectionReset);
        }
        Some(event) => {
            warn!(peer = %session.label(), error = ?err, "connection error");
            session.close(event);
        }
    }
}
