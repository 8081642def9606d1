use std::error::Error;

use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tssd::args::{Args, Command};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Init {
            config,
            listen_addr,
        } => tssd::init::init(config, listen_addr),
        Command::PeerId { config } => tssd::peer::peer_id(config),
        Command::AddPeer {
            name,
            pubkey,
            address,
            config,
        } => tssd::peer::add_peer(config, &name, &pubkey, address),
        Command::Run { config } => tssd::node::run(config).await,
    }
}
