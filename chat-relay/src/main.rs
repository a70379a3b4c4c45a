use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use chat_relay::{
    EventLoop,
    cli::{Cli, Command, ServerArgs},
    client,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => run_server(args).await?,
        Command::Client(args) => client::run(args).await?,
    }

    Ok(())
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let relay = EventLoop::bind(args.listen, args.relay_config())
        .with_context(|| format!("failed to start relay on {}", args.listen))?;
    let addr = relay.local_addr()?;
    info!("relay listening on {}", addr);

    // The loop blocks its thread in poll; keep it off the async workers.
    let shutdown = relay.shutdown_handle();
    let mut engine = tokio::task::spawn_blocking(move || relay.run());

    tokio::select! {
        result = &mut engine => {
            result.context("relay thread panicked")??;
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
            shutdown.shutdown().context("failed to wake relay for shutdown")?;
            engine.await.context("relay thread panicked")??;
        }
    }

    Ok(())
}
