//! Broadcast chat over WebSockets on a single-threaded event loop.
//!
//! Every connection is a task. The task owns the reading half of the socket;
//! a companion writer task owns the sending half and drains a bounded
//! channel, so a broadcast only enqueues and never awaits a slow peer. A peer
//! whose queue is full counts as a failed delivery and is dropped.
//! Registry access goes through [`AsyncRegistry`], whose lock brackets every
//! mutation and snapshot even though only one task runs at a time.
//!
//! Stopping the server drains the registry, then signals every session over a
//! `watch` channel so each one flushes a close frame to its peer.

use std::{future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    select,
    sync::{
        Notify,
        mpsc::{self, error::TrySendError},
        watch,
    },
    task::{JoinHandle, JoinSet},
    time::timeout,
};
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use tracing::{debug, info, warn};

use crate::{
    broadcast::{Outbox, broadcast_async},
    config::{NoticeAudience, ServerConfig},
    message::{Notice, PeerLabel, Profile},
    registry::{AsyncRegistry, PeerId, PeerIds},
    session::{Inbound, InputRules, Session, SessionEvent},
};

const PROFILE: Profile = Profile::Frame;

/// Frames a peer may have queued before it counts as stalled.
const OUTBOX_CAPACITY: usize = 128;

/// How long a closing session waits for queued frames to reach the peer.
const FLUSH_GRACE: Duration = Duration::from_secs(2);

/// How long shutdown waits for sessions to close their connections.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Queue feeding one connection's writer task.
#[derive(Clone, Debug)]
pub struct FrameOutbox {
    tx: mpsc::Sender<String>,
    dropped: Arc<Notify>,
}

impl FrameOutbox {
    fn new(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        let outbox = Self {
            tx,
            dropped: Arc::new(Notify::new()),
        };
        (outbox, rx)
    }

    fn notify(&self, notice: &Notice) -> io::Result<()> {
        self.deliver(&notice.render(PROFILE))
    }

    /// Resolves once a failed delivery has dropped this peer.
    async fn dropped(&self) {
        self.dropped.notified().await;
    }
}

impl Outbox for FrameOutbox {
    fn deliver(&self, text: &str) -> io::Result<()> {
        self.tx.try_send(text.to_string()).map_err(|err| match err {
            TrySendError::Full(_) => io::Error::other("peer is not reading its frames"),
            TrySendError::Closed(_) => {
                io::Error::new(io::ErrorKind::BrokenPipe, "connection writer has stopped")
            }
        })
    }

    fn close(&self) {
        // Stores a permit, so the session sees it even if not yet waiting.
        self.dropped.notify_one();
    }
}

struct ChatState {
    registry: AsyncRegistry<FrameOutbox>,
    ids: PeerIds,
    rules: InputRules,
    announce: NoticeAudience,
    shutdown: watch::Sender<bool>,
}

pub struct ChatServer {
    listener: TcpListener,
    state: Arc<ChatState>,
}

impl ChatServer {
    /// Binds the listening socket. Failure here aborts startup.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind chat server to {}", config.listen))?;
        Ok(Self::new(listener, &config))
    }

    pub fn new(listener: TcpListener, config: &ServerConfig) -> Self {
        Self {
            listener,
            state: Arc::new(ChatState {
                registry: AsyncRegistry::new(config.capacity),
                ids: PeerIds::new(),
                rules: config.input_rules(),
                announce: config.announce,
                shutdown: watch::Sender::new(false),
            }),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let ChatServer { listener, state } = self;
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&state, &mut sessions).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state, &mut sessions);
                }
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(err) = finished {
                        warn!(error = ?err, "client task failed");
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(state: &ChatState, sessions: &mut JoinSet<()>) {
    // Drained peers are not announced as leaving.
    let remaining = state.registry.drain().await;
    info!(participants = remaining.len(), "chat server shutting down");
    drop(remaining);
    state.shutdown.send_replace(true);

    let closed = timeout(SHUTDOWN_GRACE, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;
    if closed.is_err() {
        warn!(sessions = sessions.len(), "sessions still open after shutdown grace");
        sessions.shutdown().await;
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<ChatState>,
    sessions: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => spawn_client_handler(stream, peer, state, sessions),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_client_handler(
    stream: TcpStream,
    peer: SocketAddr,
    state: &Arc<ChatState>,
    sessions: &mut JoinSet<()>,
) {
    let state = Arc::clone(state);
    sessions.spawn(async move {
        if let Err(err) = handle_connection(stream, peer, state).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}

/// Which side ended a session.
enum Ended {
    Reader,
    Writer(Result<Result<(), WsError>, tokio::task::JoinError>),
    /// A broadcast gave up on this peer.
    Dropped,
    Shutdown,
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: Arc<ChatState>) -> Result<()> {
    let ws = accept_async(stream)
        .await
        .context("websocket handshake failed")?;
    let (sink, mut frames) = ws.split();
    let (outbox, rx) = FrameOutbox::new(OUTBOX_CAPACITY);
    let mut writer = tokio::spawn(write_frames(sink, rx));
    let mut stopping = state.shutdown.subscribe();
    let mut session = Session::new(state.ids.next_id(), PeerLabel::from(peer));

    if !state.registry.register(session.id(), outbox.clone()).await {
        info!(peer = %session.label(), "connection refused: chat is full");
        if let Err(err) = outbox.notify(&Notice::Rejected) {
            debug!(peer = %session.label(), error = ?err, "rejection notice not delivered");
        }
        drop(outbox);
        finish_writer(&mut writer, session.label()).await;
        return Ok(());
    }

    match outbox.notify(&Notice::Welcome) {
        Ok(()) => {
            // Connecting accepts Welcomed.
            let _ = session.apply(SessionEvent::Welcomed);
            announce(&state, Notice::Joined(session.label().clone()), session.id()).await;
            let participants = state.registry.len().await;
            info!(peer = %session.label(), participants, "client connected");
        }
        Err(_) => session.close(SessionEvent::Failed),
    }

    let ended = select! {
        () = read_frames(&mut frames, &mut session, &outbox, &state) => Ended::Reader,
        joined = &mut writer => Ended::Writer(joined),
        () = outbox.dropped() => Ended::Dropped,
        () = shutdown_requested(&mut stopping) => Ended::Shutdown,
    };

    match &ended {
        Ended::Reader => {}
        Ended::Writer(joined) => {
            debug!(peer = %session.label(), result = ?joined, "writer stopped first");
            session.close(SessionEvent::ConnectionReset);
        }
        Ended::Dropped => {
            warn!(peer = %session.label(), "dropped after a failed delivery");
            session.close(SessionEvent::Failed);
        }
        Ended::Shutdown => session.close(SessionEvent::ServerShutdown),
    }

    // Leave notice only when no failed broadcast already dropped this peer.
    if state.registry.deregister(session.id()).await.is_some() {
        announce(&state, Notice::Left(session.label().clone()), session.id()).await;
    }
    drop(outbox);
    if !matches!(ended, Ended::Writer(_)) {
        finish_writer(&mut writer, session.label()).await;
    }

    if let Err(err) = session.apply(SessionEvent::Released) {
        warn!(peer = %session.label(), error = %err, "unexpected session state");
    }
    let participants = state.registry.len().await;
    info!(
        peer = %session.label(),
        reason = ?session.closed_by(),
        participants,
        "client disconnected"
    );
    Ok(())
}

async fn shutdown_requested(stopping: &mut watch::Receiver<bool>) {
    // A dropped sender also means the server is gone.
    let _ = stopping.wait_for(|stop| *stop).await;
}

async fn read_frames<S>(
    frames: &mut S,
    session: &mut Session,
    outbox: &FrameOutbox,
    state: &ChatState,
) where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while session.is_open() {
        match frames.next().await {
            None => session.close(SessionEvent::PeerClosed),
            Some(Ok(Message::Text(text))) => {
                handle_text(session, text.as_str(), outbox, state).await;
            }
            Some(Ok(Message::Binary(bytes))) => {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                handle_text(session, &text, outbox, state).await;
            }
            Some(Ok(Message::Close(_))) => session.close(SessionEvent::PeerClosed),
            // Pings are answered by the protocol layer.
            Some(Ok(_)) => {}
            Some(Err(err)) => close_on_ws_error(session, &err),
        }
    }
}

async fn handle_text(session: &mut Session, text: &str, outbox: &FrameOutbox, state: &ChatState) {
    let replied = match state.rules.classify(session, text) {
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
            debug!(peer = %message.sender_label(), body = message.body(), "broadcasting message");
            broadcast_async(
                &state.registry,
                &message.render(PROFILE),
                Some(message.sender()),
            )
            .await;
            Ok(())
        }
    };

    if let Err(err) = replied {
        debug!(peer = %session.label(), error = ?err, "reply not delivered");
        session.close(SessionEvent::Failed);
    }
}

async fn announce(state: &ChatState, notice: Notice, subject: PeerId) {
    let excluding = match state.announce {
        NoticeAudience::Others => Some(subject),
        NoticeAudience::Everyone => None,
    };
    broadcast_async(&state.registry, &notice.render(PROFILE), excluding).await;
}

fn close_on_ws_error(session: &mut Session, err: &WsError) {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            session.close(SessionEvent::PeerClosed);
        }
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            warn!(peer = %session.label(), "connection closed abruptly");
            session.close(SessionEvent::ConnectionReset);
        }
        WsError::Io(io_err) => match SessionEvent::from_io_error(io_err) {
            None => debug!(peer = %session.label(), error = ?io_err, "transient read error"),
            Some(SessionEvent::ConnectionReset) => {
                warn!(peer = %session.label(), "connection closed abruptly");
                session.close(SessionEvent::ConnectionReset);
            }
            Some(event) => {
                warn!(peer = %session.label(), error = ?io_err, "connection error");
                session.close(event);
            }
        },
        other => {
            warn!(peer = %session.label(), error = ?other, "websocket error");
            session.close(SessionEvent::Failed);
        }
    }
}

async fn write_frames<S>(mut sink: S, mut rx: mpsc::Receiver<String>) -> Result<(), WsError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(text) = rx.recv().await {
        sink.send(Message::text(text)).await?;
    }
    sink.close().await
}

/// Lets the writer flush queued frames and send the close frame.
async fn finish_writer(writer: &mut JoinHandle<Result<(), WsError>>, label: &PeerLabel) {
    match timeout(FLUSH_GRACE, &mut *writer).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => debug!(peer = %label, error = ?err, "close handshake incomplete"),
        Ok(Err(err)) => warn!(peer = %label, error = ?err, "writer task failed"),
        Err(_) => {
            debug!(peer = %label, "writer did not drain in time");
            writer.abort();
        }
    }
}
