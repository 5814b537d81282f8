//! Terminal client for the WebSocket chat.
//!
//! Receiving and sending run as two tasks raced against each other. When the
//! receiver finishes first (server closed) the sender is aborted. When the
//! sender finishes first (exit keyword sent) the receiver gets a short grace
//! period to print the farewell before it is aborted in turn.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    select,
    task::JoinError,
    time::timeout,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use tracing::info;

use crate::{cli::ChatClientArgs, config::DEFAULT_EXIT_KEYWORD, session::InputRules};

const FAREWELL_GRACE: Duration = Duration::from_secs(2);

pub async fn run(args: ChatClientArgs) -> Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    run_with(&args.uri, stdin, tokio::io::stdout()).await?;
    Ok(())
}

/// Runs a session reading from `input` and printing to `output`, which is
/// handed back once the server closes the connection.
pub async fn run_with<R, W>(uri: &str, input: R, output: W) -> Result<W>
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (ws, _) = connect_async(uri)
        .await
        .with_context(|| format!("failed to connect to {uri}"))?;
    info!("connected to {uri}");

    let (sink, frames) = ws.split();
    let rules = InputRules::new(DEFAULT_EXIT_KEYWORD, None);
    let mut receiver = tokio::spawn(receive_frames(frames, output));
    let mut sender = tokio::spawn(send_lines(sink, input, rules));

    select! {
        received = &mut receiver => {
            sender.abort();
            let _ = sender.await;
            joined(received)
        }
        sent = &mut sender => {
            if let Err(err) = joined(sent) {
                receiver.abort();
                return Err(err);
            }
            match timeout(FAREWELL_GRACE, &mut receiver).await {
                Ok(received) => joined(received),
                Err(_) => {
                    receiver.abort();
                    Err(anyhow!("server did not close the session"))
                }
            }
        }
    }
}

fn joined<T>(result: Result<Result<T>, JoinError>) -> Result<T> {
    result.context("client task did not complete")?
}

async fn send_lines<S, R>(mut sink: S, input: R, rules: InputRules) -> Result<()>
where
    S: Sink<Message, Error = WsError> + Unpin,
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    loop {
        let line = lines
            .next_line()
            .await
            .context("failed to read input")?
            .unwrap_or_else(|| rules.exit_keyword().to_string());

        let text = line.trim();
        if text.is_empty() {
            info!("empty message not sent");
            continue;
        }

        sink.send(Message::text(text.to_string()))
            .await
            .context("failed to send message")?;
        if rules.is_exit(text) {
            return Ok(());
        }
    }
}

async fn receive_frames<S, W>(mut frames: S, mut output: W) -> Result<W>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(Message::Text(text)) => write_line(&mut output, text.as_str()).await?,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(
                WsError::ConnectionClosed
                | WsError::AlreadyClosed
                | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake),
            ) => break,
            Err(err) => return Err(err).context("connection to chat server failed"),
        }
    }
    info!("server closed the connection");
    Ok(output)
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, line: &str) -> Result<()> {
    output.write_all(line.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await?;
    Ok(())
}
