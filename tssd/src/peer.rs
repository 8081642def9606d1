use std::{error::Error, net::SocketAddr};

use eyre::eyre;

use crate::config::{Config, Peer, KEY_LEN};

/// Print the id other nodes use to add this one.
pub fn peer_id(config: Option<String>) -> Result<(), Box<dyn Error>> {
    let config = Config::read(config)?;
    println!("{}", config.keypair()?.peer_id());
    Ok(())
}

/// Add `name` to the address book, replacing an entry with the same name.
pub fn add_peer(
    config: Option<String>,
    name: &str,
    pubkey: &str,
    address: SocketAddr,
) -> Result<(), Box<dyn Error>> {
    let mut config = Config::read(config)?;

    let pubkey = hex::decode(pubkey.trim())?;
    if pubkey.len() != KEY_LEN {
        return Err(eyre!("public key must be {KEY_LEN} bytes, got {}", pubkey.len()).into());
    }
    let peer = Peer { pubkey, address };
    let replaced = config.peer.insert(name.to_string(), peer);
    config.validate()?;

    if replaced.is_some() {
        eprintln!("Replaced peer {name}");
    } else {
        eprintln!("Added peer {name}");
    }
    config.write()?;

    Ok(())
}
