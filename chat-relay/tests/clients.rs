use std::{
    io::{BufRead, BufReader, Cursor},
    net::{TcpListener, TcpStream},
    time::Duration,
};

use anyhow::Result;
use chat_relay::{
    chat::ChatServer, chat_client, config::ServerConfig, relay::RelayServer, relay_client,
};
use futures_util::StreamExt;
use tokio::{sync::oneshot, time::timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn lines(output: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(output)
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn relay_client_prints_every_server_line() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let relay = RelayServer::new(listener, &ServerConfig::relay(addr)).spawn()?;

    let input = Cursor::new("\noi\nsair\n");
    let output = relay_client::run_with(relay.local_addr(), input, Vec::new())?;

    assert_eq!(
        lines(&output),
        vec![
            "Bem-vindo ao chat! Digite 'sair' para encerrar.",
            "Nenhum outro cliente conectado no momento.",
            "Encerrando a sessao. Ate logo!",
        ]
    );
    relay.shutdown()
}

#[test]
fn relay_client_treats_end_of_input_as_exit() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    let relay = RelayServer::new(listener, &ServerConfig::relay(addr)).spawn()?;

    let peer = TcpStream::connect(relay.local_addr())?;
    peer.set_read_timeout(Some(TEST_TIMEOUT))?;
    let mut peer_reader = BufReader::new(peer.try_clone()?);
    let mut line = String::new();
    peer_reader.read_line(&mut line)?;

    let output = relay_client::run_with(relay.local_addr(), Cursor::new("olá\n"), Vec::new())?;
    assert_eq!(
        lines(&output),
        vec![
            "Bem-vindo ao chat! Digite 'sair' para encerrar.",
            "Encerrando a sessao. Ate logo!",
        ]
    );

    line.clear();
    peer_reader.read_line(&mut line)?;
    assert!(line.ends_with(": olá\n"), "peer received {line:?}");

    drop(peer);
    relay.shutdown()
}

#[tokio::test]
async fn chat_client_sends_lines_and_stops_after_farewell() -> Result<()> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server = ChatServer::new(listener, &ServerConfig::chat(addr));
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server_task = tokio::spawn(server.run_until(async move {
        let _ = shutdown_rx.await;
    }));

    let uri = format!("ws://{addr}");
    let (mut observer, _) = connect_async(uri.as_str()).await?;
    // Welcome frame.
    timeout(TEST_TIMEOUT, observer.next()).await?;

    let input = Cursor::new(b"   \noi\nsair\n".to_vec());
    let output = timeout(TEST_TIMEOUT, chat_client::run_with(&uri, input, Vec::new())).await??;
    assert_eq!(
        lines(&output),
        vec![
            "Bem-vindo ao chat WebSocket! Digite 'sair' para encerrar.",
            "Encerrando sua sessão. Até logo!",
        ]
    );

    let mut relayed = None;
    while let Some(frame) = timeout(TEST_TIMEOUT, observer.next()).await? {
        if let Message::Text(text) = frame? {
            if !text.as_str().starts_with("[SERVER]") {
                relayed = Some(text.as_str().to_string());
                break;
            }
        }
    }
    let relayed = relayed.expect("observer should receive the client's message");
    assert!(relayed.ends_with(": oi"), "observer received {relayed:?}");

    let _ = shutdown_tx.send(());
    let _ = server_task.await;
    Ok(())
}
