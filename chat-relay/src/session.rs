//! Per-connection session state and input validation.
//!
//! Both servers drive a [`Session`] through the same transitions:
//!
//! ```text
//! Connecting --Welcomed--> Active --(exit | peer closed | reset | failed | shutdown)--> Closing --Released--> Closed
//! ```
//!
//! A connection that fails before the welcome goes straight from
//! `Connecting` to `Closing`. [`SessionState::on`] is the only place the
//! transitions are defined.

use std::io;

use thiserror::Error;

use crate::{
    message::{ChatMessage, PeerLabel},
    registry::PeerId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Things that move a session forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Registered and the welcome notice was sent.
    Welcomed,
    /// The peer sent the exit keyword.
    ExitRequested,
    /// Zero-length read or close frame.
    PeerClosed,
    /// Connection reset or aborted by the peer.
    ConnectionReset,
    /// Any other I/O error on the connection.
    Failed,
    /// The server is stopping.
    ServerShutdown,
    /// Deregistered and the socket was released.
    Released,
}

impl SessionEvent {
    /// Maps an I/O error to the event it causes.
    ///
    /// Returns `None` for conditions that are retried on the next read
    /// (would-block, interrupted, read timeout).
    pub fn from_io_error(err: &io::Error) -> Option<Self> {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut => {
                None
            }
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Some(SessionEvent::ConnectionReset),
            io::ErrorKind::UnexpectedEof => Some(SessionEvent::PeerClosed),
            _ => Some(SessionEvent::Failed),
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("session cannot handle {event:?} while {state:?}")]
pub struct InvalidTransition {
    pub state: SessionState,
    pub event: SessionEvent,
}

impl SessionState {
    pub fn on(self, event: SessionEvent) -> Result<SessionState, InvalidTransition> {
        use SessionEvent::*;
        use SessionState::*;

        match (self, event) {
            (Connecting, Welcomed) => Ok(Active),
            (
                Connecting | Active,
                ExitRequested | PeerClosed | ConnectionReset | Failed | ServerShutdown,
            ) => {
                Ok(Closing)
            }
            (Closing, Released) => Ok(Closed),
            (state, event) => Err(InvalidTransition { state, event }),
        }
    }
}

/// Identity and lifecycle of one connection, owned by its handler.
#[derive(Debug)]
pub struct Session {
    id: PeerId,
    label: PeerLabel,
    state: SessionState,
    closed_by: Option<SessionEvent>,
}

impl Session {
    pub fn new(id: PeerId, label: PeerLabel) -> Self {
        Self {
            id,
            label,
            state: SessionState::Connecting,
            closed_by: None,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn label(&self) -> &PeerLabel {
        &self.label
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The event that moved the session into `Closing`, if any.
    pub fn closed_by(&self) -> Option<SessionEvent> {
        self.closed_by
    }

    pub fn apply(&mut self, event: SessionEvent) -> Result<SessionState, InvalidTransition> {
        let next = self.state.on(event)?;
        if next == SessionState::Closing && self.state != SessionState::Closing {
            self.closed_by = Some(event);
        }
        self.state = next;
        Ok(next)
    }

    /// Applies `event` only when the session is still open; later causes of
    /// closing are ignored so the first one is the one reported.
    pub fn close(&mut self, event: SessionEvent) {
        if matches!(self.state, SessionState::Connecting | SessionState::Active) {
            // Connecting/Active accept every closing event.
            let _ = self.apply(event);
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, SessionState::Connecting | SessionState::Active)
    }
}

/// What a single received unit turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Only whitespace; answered with a notice, never broadcast.
    Empty,
    /// The exit keyword; ends this session only.
    Exit,
    /// Longer than the configured maximum; answered with a notice.
    TooLong { len: usize },
    Chat(ChatMessage),
}

/// Validation applied to every received unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRules {
    exit_keyword: String,
    max_len: Option<usize>,
}

impl InputRules {
    pub fn new(exit_keyword: impl Into<String>, max_len: Option<usize>) -> Self {
        Self {
            exit_keyword: exit_keyword.into(),
            max_len,
        }
    }

    pub fn exit_keyword(&self) -> &str {
        &self.exit_keyword
    }

    pub fn is_exit(&self, text: &str) -> bool {
        text.trim().to_lowercase() == self.exit_keyword.to_lowercase()
    }

    pub fn classify(&self, session: &Session, raw: &str) -> Inbound {
        let text = raw.trim();
        if text.is_empty() {
            return Inbound::Empty;
        }
        if self.is_exit(text) {
            return Inbound::Exit;
        }
        let len = text.chars().count();
        if self.max_len.is_some_and(|max| len > max) {
            return Inbound::TooLong { len };
        }
        Inbound::Chat(ChatMessage::new(session.id(), session.label().clone(), text))
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::registry::PeerIds;

    fn session() -> Session {
        let addr: SocketAddr = "127.0.0.1:6001".parse().expect("valid address");
        Session::new(PeerIds::new().next_id(), PeerLabel::from(addr))
    }

    #[test]
    fn lifecycle_follows_the_happy_path() {
        let mut session = session();
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(session.apply(SessionEvent::Welcomed), Ok(SessionState::Active));
        assert_eq!(session.apply(SessionEvent::ExitRequested), Ok(SessionState::Closing));
        assert_eq!(session.apply(SessionEvent::Released), Ok(SessionState::Closed));
        assert_eq!(session.closed_by(), Some(SessionEvent::ExitRequested));
    }

    #[test]
    fn failing_before_welcome_still_closes() {
        assert_eq!(
            SessionState::Connecting.on(SessionEvent::Failed),
            Ok(SessionState::Closing)
        );
    }

    #[test]
    fn server_shutdown_closes_an_active_session() {
        let mut session = session();
        session.apply(SessionEvent::Welcomed).expect("welcome");
        session.close(SessionEvent::ServerShutdown);
        assert_eq!(session.state(), SessionState::Closing);
        assert_eq!(session.closed_by(), Some(SessionEvent::ServerShutdown));
    }

    #[test]
    fn released_twice_is_rejected() {
        let err = SessionState::Closed
            .on(SessionEvent::Released)
            .expect_err("closed sessions cannot be released again");
        assert_eq!(err.state, SessionState::Closed);
        assert!(SessionState::Active.on(SessionEvent::Released).is_err());
        assert!(SessionState::Active.on(SessionEvent::Welcomed).is_err());
    }

    #[test]
    fn close_keeps_the_first_cause() {
        let mut session = session();
        session.apply(SessionEvent::Welcomed).expect("welcome");
        session.close(SessionEvent::PeerClosed);
        session.close(SessionEvent::Failed);
        assert_eq!(session.state(), SessionState::Closing);
        assert_eq!(session.closed_by(), Some(SessionEvent::PeerClosed));
    }

    #[test]
    fn io_errors_map_to_events() {
        let event = |kind| SessionEvent::from_io_error(&io::Error::from(kind));
        assert_eq!(event(io::ErrorKind::WouldBlock), None);
        assert_eq!(event(io::ErrorKind::TimedOut), None);
        assert_eq!(
            event(io::ErrorKind::ConnectionReset),
            Some(SessionEvent::ConnectionReset)
        );
        assert_eq!(event(io::ErrorKind::PermissionDenied), Some(SessionEvent::Failed));
    }

    #[test]
    fn whitespace_only_input_is_empty() {
        let rules = InputRules::new("sair", None);
        let session = session();
        assert_eq!(rules.classify(&session, ""), Inbound::Empty);
        assert_eq!(rules.classify(&session, " \t\r\n"), Inbound::Empty);
    }

    #[test]
    fn exit_keyword_ignores_case_and_padding() {
        let rules = InputRules::new("sair", None);
        let session = session();
        for raw in ["sair", "SAIR", "Sair", "  sAiR\r\n"] {
            assert_eq!(rules.classify(&session, raw), Inbound::Exit, "input {raw:?}");
        }
        assert!(matches!(rules.classify(&session, "sair agora"), Inbound::Chat(_)));
    }

    #[test]
    fn oversized_input_is_counted_in_characters() {
        let rules = InputRules::new("sair", Some(4));
        let session = session();
        assert!(matches!(rules.classify(&session, "ação"), Inbound::Chat(_)));
        assert_eq!(
            rules.classify(&session, "ações"),
            Inbound::TooLong { len: 5 }
        );
    }

    #[test]
    fn chat_input_is_trimmed() {
        let rules = InputRules::new("sair", Some(4096));
        let session = session();
        match rules.classify(&session, "  hello \n") {
            Inbound::Chat(message) => {
                assert_eq!(message.body(), "hello");
                assert_eq!(message.sender(), session.id());
            }
            other => panic!("expected chat, got {other:?}"),
        }
    }
}
