use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

mod apfile;
mod apserver;
mod datastorage;
mod itemnames;
mod play;
mod savefile;
mod setup;

use play::ConnectionLost;

const RESUME_DELAY: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(
    name = "mwbridge",
    version,
    about = "Serve an Archipelago seed as one world of a multiworld room"
)]
pub struct Args {
    /// The Archipelago seed to serve.
    #[arg(long, default_value = "./AP.archipelago")]
    pub apfile: PathBuf,
    /// The multiworld server to join.
    #[arg(long, default_value = "127.0.0.1:38281")]
    pub mwserver: String,
    /// The room to join.
    #[arg(long, default_value = "")]
    pub mwroom: String,
    /// Serve Archipelago on this port.
    #[arg(long, default_value_t = 38281)]
    pub apport: u16,
    /// Store the multiworld result and game data in this directory.
    #[arg(long, default_value = "./multipelago-seed")]
    pub workdir: PathBuf,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_target(false).init();
    let args = Args::parse();
    if let Err(err) = serve(args).await {
        error!("{err:#}");
        std::process::exit(1);
    }
}

async fn serve(args: Args) -> anyhow::Result<()> {
    let data = apfile::load(&args.apfile)?;
    anyhow::ensure!(
        data.connect_names.len() == 1,
        ".archipelago contains {} worlds, expected only one",
        data.connect_names.len()
    );
    anyhow::ensure!(
        data.version.len() == mwbridge_core::approto::VERSION_NUMBER_SIZE,
        "invalid .archipelago version: {:?}",
        data.version
    );

    match std::fs::metadata(&args.workdir) {
        Ok(info) if !info.is_dir() => anyhow::bail!(
            "non-directory already present at workdir path {:?}",
            args.workdir
        ),
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            setup::setup(&args, &data)
                .await
                .context("set up multiworld seed")?;
            info!("MW setup complete");
        }
        Err(err) => return Err(err.into()),
    }

    loop {
        match play::play(&args, &data).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is::<ConnectionLost>() => {
                warn!("connection lost; resuming shortly");
                tokio::time::sleep(RESUME_DELAY).await;
            }
            Err(err) => return Err(err),
        }
    }
}
