use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::config::{NoticeAudience, ServerConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the two-party TCP relay (one thread per connection).
    Relay(RelayArgs),
    /// Run the WebSocket broadcast chat (single-threaded event loop).
    Chat(ChatArgs),
    /// Connect to a TCP relay from the terminal.
    RelayClient(RelayClientArgs),
    /// Connect to a WebSocket chat from the terminal.
    ChatClient(ChatClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RelayArgs {
    /// Socket address the relay should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:6500")]
    pub listen: SocketAddr,

    /// Maximum concurrent participants; 0 means unlimited.
    #[arg(long, default_value_t = 2)]
    pub capacity: usize,

    /// Reject messages longer than this many characters.
    #[arg(long)]
    pub max_message_len: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct ChatArgs {
    /// Socket address the chat server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:8765")]
    pub listen: SocketAddr,

    /// Maximum concurrent participants; 0 means unlimited.
    #[arg(long, default_value_t = 0)]
    pub capacity: usize,

    /// Reject messages longer than this many characters.
    #[arg(long, default_value_t = 4096)]
    pub max_message_len: usize,

    /// Who receives the join/leave notices about a participant.
    #[arg(long, value_enum, default_value_t = NoticeAudience::Others)]
    pub announce: NoticeAudience,
}

#[derive(Args, Debug, Clone)]
pub struct RelayClientArgs {
    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:6500")]
    pub server: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ChatClientArgs {
    /// WebSocket URI of the chat server.
    #[arg(long, default_value = "ws://127.0.0.1:8765")]
    pub uri: String,
}

impl From<RelayArgs> for ServerConfig {
    fn from(args: RelayArgs) -> Self {
        ServerConfig::relay(args.listen)
            .with_capacity(args.capacity)
            .with_max_message_len(args.max_message_len)
    }
}

impl From<ChatArgs> for ServerConfig {
    fn from(args: ChatArgs) -> Self {
        ServerConfig::chat(args.listen)
            .with_capacity(args.capacity)
            .with_max_message_len(Some(args.max_message_len))
            .with_announce(args.announce)
    }
}
