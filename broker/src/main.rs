use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use mwbridge_broker::{serve, Rooms};

#[derive(Parser)]
#[command(name = "mwbridge-broker", version, about = "Multiworld room server")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:38281")]
    listen: String,
    /// Name announced to connecting clients.
    #[arg(long, default_value = "mwbridge")]
    server_name: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let args = Args::parse();
    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("listen on {}", args.listen))?;
    info!("serving multiworld on {}", args.listen);

    serve(listener, Rooms::new(), args.server_name).await;
    Ok(())
}
