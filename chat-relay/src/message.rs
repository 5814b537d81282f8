//! Chat messages and the fixed notices each transport profile sends.
//!
//! The stream profile (TCP relay) delimits every unit with `\n`; the frame
//! profile (WebSocket chat) sends each unit as one text frame and needs no
//! delimiter. [`Notice::render`] produces the exact bytes for either.

use std::fmt;

use crate::registry::PeerId;

const LINE_ENDING: char = '\n';

/// How application messages are delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    /// Newline-terminated UTF-8 text over a byte stream.
    Stream,
    /// One discrete text frame per message.
    Frame,
}

/// `ip:port` of the remote end, used in relayed text and logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerLabel(String);

impl PeerLabel {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<std::net::SocketAddr> for PeerLabel {
    fn from(addr: std::net::SocketAddr) -> Self {
        Self(format!("{}:{}", addr.ip(), addr.port()))
    }
}

impl fmt::Display for PeerLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One validated chat line on its way to the broadcast engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    sender: PeerId,
    sender_label: PeerLabel,
    body: String,
}

impl ChatMessage {
    /// Builds a message from raw input, trimming surrounding whitespace.
    pub fn new(sender: PeerId, sender_label: PeerLabel, body: &str) -> Self {
        Self {
            sender,
            sender_label,
            body: body.trim().to_string(),
        }
    }

    pub fn sender(&self) -> PeerId {
        self.sender
    }

    pub fn sender_label(&self) -> &PeerLabel {
        &self.sender_label
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Text as recipients see it: `"{sender_label}: {body}"`.
    pub fn render(&self, profile: Profile) -> String {
        let text = format!("{}: {}", self.sender_label, self.body);
        terminate(text, profile)
    }
}

/// Server-originated text that is not relayed chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Welcome,
    Farewell,
    Rejected,
    EmptyIgnored,
    TooLong,
    NoOtherParticipant,
    Joined(PeerLabel),
    Left(PeerLabel),
}

impl Notice {
    pub fn render(&self, profile: Profile) -> String {
        let text = match (self, profile) {
            (Notice::Welcome, Profile::Stream) => {
                "Bem-vindo ao chat! Digite 'sair' para encerrar.".to_string()
            }
            (Notice::Welcome, Profile::Frame) => {
                "Bem-vindo ao chat WebSocket! Digite 'sair' para encerrar.".to_string()
            }
            (Notice::Farewell, Profile::Stream) => "Encerrando a sessao. Ate logo!".to_string(),
            (Notice::Farewell, Profile::Frame) => "Encerrando sua sessão. Até logo!".to_string(),
            (Notice::Rejected, _) => "Servidor cheio, tente novamente mais tarde.".to_string(),
            (Notice::EmptyIgnored, _) => "Mensagem vazia ignorada.".to_string(),
            (Notice::TooLong, _) => "Mensagem muito longa, tente novamente.".to_string(),
            (Notice::NoOtherParticipant, _) => {
                "Nenhum outro cliente conectado no momento.".to_string()
            }
            (Notice::Joined(label), _) => format!("[SERVER] {label} entrou no chat."),
            (Notice::Left(label), _) => format!("[SERVER] {label} saiu do chat."),
        };
        terminate(text, profile)
    }
}

fn terminate(mut text: String, profile: Profile) -> String {
    if profile == Profile::Stream {
        text.push(LINE_ENDING);
    }
    text
}
