//! Server configuration shared by both chat profiles.

use std::net::SocketAddr;

use clap::ValueEnum;

use crate::{registry::Capacity, session::InputRules};

pub const DEFAULT_EXIT_KEYWORD: &str = "sair";

/// Who sees the join/leave notice about a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum NoticeAudience {
    /// Every other registered peer; the subject does not see its own notice.
    Others,
    /// All registered peers, including the one that joined.
    Everyone,
}

/// Everything a server needs to run; built once and moved into the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub capacity: Capacity,
    pub max_message_len: Option<usize>,
    pub exit_keyword: String,
    pub announce: NoticeAudience,
}

impl ServerConfig {
    /// Two-party TCP relay defaults.
    pub fn relay(listen: SocketAddr) -> Self {
        Self {
            listen,
            capacity: Capacity::Limited(2),
            max_message_len: None,
            exit_keyword: DEFAULT_EXIT_KEYWORD.to_string(),
            announce: NoticeAudience::Others,
        }
    }

    /// Open WebSocket broadcast chat defaults.
    pub fn chat(listen: SocketAddr) -> Self {
        Self {
            listen,
            capacity: Capacity::Unlimited,
            max_message_len: Some(4096),
            exit_keyword: DEFAULT_EXIT_KEYWORD.to_string(),
            announce: NoticeAudience::Others,
        }
    }

    pub fn with_capacity(mut self, capacity: impl Into<Capacity>) -> Self {
        self.capacity = capacity.into();
        self
    }

    pub fn with_max_message_len(mut self, max: Option<usize>) -> Self {
        self.max_message_len = max;
        self
    }

    pub fn with_announce(mut self, announce: NoticeAudience) -> Self {
        self.announce = announce;
        self
    }

    pub fn input_rules(&self) -> InputRules {
        InputRules::new(self.exit_keyword.clone(), self.max_message_len)
    }
}
