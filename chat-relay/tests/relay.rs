use std::{
    io::{BufRead, BufReader, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    thread,
    time::{Duration, Instant},
};

use anyhow::{Result, bail};
use chat_relay::{
    config::ServerConfig,
    relay::{MAX_LINE_BYTES, RelayHandle, RelayServer},
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

const WELCOME: &str = "Bem-vindo ao chat! Digite 'sair' para encerrar.";
const FAREWELL: &str = "Encerrando a sessao. Ate logo!";
const REJECTED: &str = "Servidor cheio, tente novamente mais tarde.";
const EMPTY: &str = "Mensagem vazia ignorada.";
const ALONE: &str = "Nenhum outro cliente conectado no momento.";
const TOO_LONG: &str = "Mensagem muito longa, tente novamente.";

struct Peer {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    label: String,
}

impl Peer {
    fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        let local = stream.local_addr()?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
            label: format!("{}:{}", local.ip(), local.port()),
        })
    }

    /// Connects and consumes the welcome line.
    fn join(addr: SocketAddr) -> Result<Self> {
        let mut peer = Self::connect(addr)?;
        peer.expect(WELCOME)?;
        Ok(peer)
    }

    fn send(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(format!("{line}\n").as_bytes())?;
        Ok(())
    }

    fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }

    fn expect(&mut self, expected: &str) -> Result<()> {
        match self.read_line()? {
            Some(line) if line == expected => Ok(()),
            other => bail!("expected {expected:?}, got {other:?}"),
        }
    }

    fn expect_closed(&mut self) -> Result<()> {
        match self.read_line()? {
            None => Ok(()),
            Some(line) => bail!("expected the relay to close the connection, got {line:?}"),
        }
    }
}

fn start_relay(configure: impl FnOnce(ServerConfig) -> ServerConfig) -> Result<RelayHandle> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let config = configure(ServerConfig::relay(listener.local_addr()?));
    RelayServer::new(listener, &config).spawn()
}

fn wait_for_participants(relay: &RelayHandle, expected: usize) -> Result<()> {
    let deadline = Instant::now() + READ_TIMEOUT;
    while relay.participants() != expected {
        if Instant::now() > deadline {
            bail!(
                "timed out waiting for {expected} participants (have {})",
                relay.participants()
            );
        }
        thread::sleep(Duration::from_millis(10));
    }
    Ok(())
}

#[test]
fn two_party_relay_end_to_end() -> Result<()> {
    let relay = start_relay(|config| config)?;
    let addr = relay.local_addr();

    let mut alice = Peer::join(addr)?;
    let mut bob = Peer::join(addr)?;

    let mut carol = Peer::connect(addr)?;
    carol.expect(REJECTED)?;
    carol.expect_closed()?;
    assert_eq!(relay.participants(), 2);

    alice.send("oi")?;
    bob.expect(&format!("{}: oi", alice.label))?;

    alice.send("sair")?;
    alice.expect(FAREWELL)?;
    alice.expect_closed()?;

    bob.send("ainda aqui")?;
    bob.expect(ALONE)?;

    // The freed slot can be taken again.
    let mut dave = Peer::join(addr)?;
    dave.send("tudo bem?")?;
    bob.expect(&format!("{}: tudo bem?", dave.label))?;

    relay.shutdown()
}

#[test]
fn empty_messages_are_not_relayed() -> Result<()> {
    let relay = start_relay(|config| config)?;
    let addr = relay.local_addr();
    let mut alice = Peer::join(addr)?;
    let mut bob = Peer::join(addr)?;

    alice.send("   ")?;
    alice.expect(EMPTY)?;
    alice.send("")?;
    alice.expect(EMPTY)?;

    alice.send("  de verdade  ")?;
    bob.expect(&format!("{}: de verdade", alice.label))?;

    relay.shutdown()
}

#[test]
fn exit_keyword_ignores_case_and_spares_the_other_session() -> Result<()> {
    let relay = start_relay(|config| config)?;
    let addr = relay.local_addr();
    let mut alice = Peer::join(addr)?;
    let mut bob = Peer::join(addr)?;

    bob.send("Sair")?;
    bob.expect(FAREWELL)?;
    bob.expect_closed()?;
    wait_for_participants(&relay, 1)?;

    let mut carol = Peer::join(addr)?;
    carol.send("SAIR agora não")?;
    alice.expect(&format!("{}: SAIR agora não", carol.label))?;

    relay.shutdown()
}

#[test]
fn abrupt_disconnect_frees_the_slot() -> Result<()> {
    let relay = start_relay(|config| config)?;
    let addr = relay.local_addr();
    let alice = Peer::join(addr)?;
    let mut bob = Peer::join(addr)?;

    drop(alice);
    wait_for_participants(&relay, 1)?;

    bob.send("alguém?")?;
    bob.expect(ALONE)?;

    relay.shutdown()
}

#[test]
fn oversized_messages_are_rejected_when_limited() -> Result<()> {
    let relay = start_relay(|config| config.with_max_message_len(Some(5)))?;
    let addr = relay.local_addr();
    let mut alice = Peer::join(addr)?;
    let mut bob = Peer::join(addr)?;

    alice.send("123456")?;
    alice.expect(TOO_LONG)?;
    alice.send("12345")?;
    bob.expect(&format!("{}: 12345", alice.label))?;

    relay.shutdown()
}

#[test]
fn unbounded_lines_are_cut_off_without_a_configured_limit() -> Result<()> {
    let relay = start_relay(|config| config)?;
    let addr = relay.local_addr();
    let mut alice = Peer::join(addr)?;
    let mut bob = Peer::join(addr)?;

    let flood = "x".repeat(MAX_LINE_BYTES * 2);
    alice.send(&flood)?;
    alice.expect(TOO_LONG)?;

    alice.send("oi")?;
    bob.expect(&format!("{}: oi", alice.label))?;

    relay.shutdown()
}

#[test]
fn shutdown_closes_connected_clients() -> Result<()> {
    let relay = start_relay(|config| config)?;
    let mut alice = Peer::join(relay.local_addr())?;
    wait_for_participants(&relay, 1)?;

    relay.shutdown()?;
    alice.expect_closed()
}
