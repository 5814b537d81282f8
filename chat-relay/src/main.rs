use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use chat_relay::{
    chat::ChatServer,
    chat_client,
    cli::{Cli, Command},
    config::ServerConfig,
    relay::RelayServer,
    relay_client,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

/// The chat server and client multiplex every connection on one thread.
fn single_threaded_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")
}

fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Relay(args) => {
            let server = RelayServer::bind(ServerConfig::from(args))?;
            let addr = server.local_addr()?;
            info!("relay listening on {}", addr);
            if let Err(err) = server.run() {
                warn!("relay exited with error: {err:?}");
                return Err(err);
            }
        }
        Command::Chat(args) => {
            let config = ServerConfig::from(args);
            single_threaded_runtime()?.block_on(async move {
                let server = ChatServer::bind(config).await?;
                let addr = server.local_addr()?;
                info!("chat listening on {}", addr);
                if let Err(err) = server.run_until_ctrl_c().await {
                    warn!("chat server exited with error: {err:?}");
                    return Err(err);
                }
                Ok::<_, anyhow::Error>(())
            })?;
        }
        Command::RelayClient(args) => relay_client::run(args)?,
        Command::ChatClient(args) => {
            let runtime = single_threaded_runtime()?;
            let result = runtime.block_on(chat_client::run(args));
            // A pending stdin read would otherwise keep the process alive.
            runtime.shutdown_background();
            result?;
        }
    }

    Ok(())
}
