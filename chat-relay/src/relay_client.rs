//! Terminal client for the TCP relay.
//!
//! A receiver thread prints every line the relay sends while the calling
//! thread forwards input lines. Sending the exit keyword (or reaching the end
//! of input) half-closes the connection; the client then waits for the relay
//! to finish the session so its farewell is not lost.
//!
//! Input is read with a blocking call, so after a rejection or a server-side
//! close the client notices only once the next line is entered (or input ends).

use std::{
    io::{self, BufRead, BufReader, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info};

use crate::{cli::RelayClientArgs, config::DEFAULT_EXIT_KEYWORD, session::InputRules};

pub fn run(args: RelayClientArgs) -> Result<()> {
    let stdin = io::stdin().lock();
    run_with(args.server, stdin, io::stdout())?;
    Ok(())
}

/// Runs a session reading from `input` and printing to `output`, which is
/// handed back once the relay closes the connection.
pub fn run_with<R, W>(server: SocketAddr, input: R, output: W) -> Result<W>
where
    R: BufRead,
    W: Write + Send + 'static,
{
    let stream = TcpStream::connect(server)
        .with_context(|| format!("failed to connect to {server}"))?;
    info!("connected to {server}");

    let connected = Arc::new(AtomicBool::new(true));
    let reader = stream
        .try_clone()
        .context("failed to clone connection for the receiver")?;
    let receiver_connected = Arc::clone(&connected);
    let receiver = thread::Builder::new()
        .name("relay-client-receiver".to_string())
        .spawn(move || receive_lines(reader, output, &receiver_connected))
        .context("failed to spawn receiver thread")?;

    let rules = InputRules::new(DEFAULT_EXIT_KEYWORD, None);
    let sent = send_lines(&stream, input, &rules, &connected);

    if let Err(err) = stream.shutdown(Shutdown::Write) {
        debug!(error = ?err, "write half already closed");
    }
    let output = receiver
        .join()
        .map_err(|_| anyhow!("receiver thread panicked"))?
        .context("failed to print server output")?;
    if let Err(err) = stream.shutdown(Shutdown::Both) {
        debug!(error = ?err, "connection already closed");
    }

    sent?;
    info!("client finished");
    Ok(output)
}

fn send_lines<R: BufRead>(
    stream: &TcpStream,
    input: R,
    rules: &InputRules,
    connected: &AtomicBool,
) -> Result<()> {
    let mut lines = input.lines();
    while connected.load(Ordering::SeqCst) {
        let line = match lines.next() {
            Some(line) => line.context("failed to read input")?,
            None => rules.exit_keyword().to_string(),
        };

        let text = line.trim();
        if text.is_empty() {
            info!("empty message not sent");
            continue;
        }

        let mut writer = stream;
        if let Err(err) = writer.write_all(format!("{text}\n").as_bytes()) {
            info!(error = %err, "failed to send; connection lost");
            break;
        }
        if rules.is_exit(text) {
            break;
        }
    }
    Ok(())
}

fn receive_lines<W: Write>(stream: TcpStream, mut output: W, connected: &AtomicBool) -> io::Result<W> {
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    let result = loop {
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => {
                info!("server closed the connection");
                break Ok(());
            }
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                if let Err(err) = writeln!(output, "{}", text.trim_end()).and_then(|()| output.flush()) {
                    break Err(err);
                }
                line.clear();
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                info!(error = %err, "connection ended");
                break Ok(());
            }
        }
    };
    connected.store(false, Ordering::SeqCst);
    result.map(|()| output)
}
