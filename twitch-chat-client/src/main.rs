use std::io::Write;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::select;
use tracing::{info, warn};

use twitch_chat_client::{
    cli::{Cli, OutputFormat},
    client::ChatSession,
    message::ChatMessage,
    transport::TcpConnector,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let credentials = cli.credentials().context("invalid credentials")?;
    let session = ChatSession::new(cli.session_config(), credentials)?;
    let handle = session.handle();
    let format = cli.format;

    info!(host = %cli.host, port = cli.port, channel = %session.channel(), "connecting");
    let sink = move |message: ChatMessage| print_message(&message, format);
    let mut task = tokio::spawn(session.run(TcpConnector, sink));

    let joined = select! {
        joined = &mut task => joined,
        ctrl_c = tokio::signal::ctrl_c() => {
            if let Err(error) = ctrl_c {
                warn!(?error, "ctrl-c handler failed");
            }
            info!("stopping session");
            handle.stop();
            task.await
        }
    };

    joined.context("session task panicked")??;
    Ok(())
}

fn print_message(message: &ChatMessage, format: OutputFormat) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    match format {
        OutputFormat::Text => writeln!(stdout, "{message}")?,
        OutputFormat::Json => {
            serde_json::to_writer(&mut stdout, message)?;
            writeln!(stdout)?;
        }
    }
    stdout.flush()?;
    Ok(())
}
