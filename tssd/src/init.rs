use std::{error::Error, net::SocketAddr};

use comm::noise::Keypair;
use eyre::eyre;

use crate::config::Config;

/// Generate the key pair unless there is one already, and store it together
/// with `listen_addr` in the config file.
pub fn init(config: Option<String>, listen_addr: Option<SocketAddr>) -> Result<(), Box<dyn Error>> {
    let mut config = Config::read(config)?;

    if config.keypair.is_some() {
        eprintln!("Skipping keypair generation; keypair already generated and stored");
    } else {
        eprintln!("Generating keypair... ");
        config.keypair = Some(Keypair::generate()?);
    }
    if let Some(listen_addr) = listen_addr {
        config.listen_addr = listen_addr;
    }

    let path = config.path().ok_or_else(|| eyre!("path not specified"))?;
    eprintln!("Writing to config file at {}...", path.display());
    config.write()?;
    eprintln!(
        "Done.\nWARNING: the config file contains the private key of this node in clear. \
        Keep it safe and never share it with anyone."
    );
    println!("{}", config.keypair()?.peer_id());

    Ok(())
}
