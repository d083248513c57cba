use clap::Parser;
use anyhow::Result;
use tracing_subscriber::EnvFilter;

use wschat::server::Server;

#[derive(Parser)]
#[command(name = "server", about = "WebSocket fan-out chat server")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8080")]
    addr: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let srv = Server::new();

    // Graceful shutdown on Ctrl-C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutting down");
        std::process::exit(0);
    });

    srv.listen_and_serve(&args.addr).await?;
    Ok(())
}
