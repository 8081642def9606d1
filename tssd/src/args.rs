use std::net::SocketAddr;

use clap::{Parser, Subcommand};

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Generates the node's communication key pair and writes it to the
    /// config file. Rerunning it keeps the existing key pair.
    Init {
        /// The path to the config file to manage. If not specified, it uses
        /// $HOME/.config/tssd/config.toml
        #[arg(short, long)]
        config: Option<String>,
        /// The address to accept peer connections on.
        #[arg(short, long)]
        listen_addr: Option<SocketAddr>,
    },
    /// Prints the peer id of this node, which other nodes need to add it.
    PeerId {
        /// The path to the config file to manage. If not specified, it uses
        /// $HOME/.config/tssd/config.toml
        #[arg(short, long)]
        config: Option<String>,
    },
    /// Adds a peer to the address book, replacing any peer with the same
    /// name.
    AddPeer {
        /// Name of the peer in the address book.
        #[arg(short, long)]
        name: String,
        /// The peer id printed by `tssd peer-id` on the peer.
        #[arg(short, long)]
        pubkey: String,
        /// The address the peer listens on.
        #[arg(short, long)]
        address: SocketAddr,
        /// The path to the config file to manage. If not specified, it uses
        /// $HOME/.config/tssd/config.toml
        #[arg(short, long)]
        config: Option<String>,
    },
    /// Runs the node until interrupted.
    Run {
        /// The path to the config file to use. If not specified, it uses
        /// $HOME/.config/tssd/config.toml
        #[arg(short, long)]
        config: Option<String>,
    },
}
