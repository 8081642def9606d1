use std::{
    collections::{BTreeMap, HashSet},
    error::Error,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use comm::{noise::Keypair, p2p::NetworkHost, PeerId};
use coordinator::{BullyConfig, CoordinatorConfig};
use eyre::eyre;
use serde::{Deserialize, Serialize};

use crate::write_atomic;

/// Size of an X25519 key.
pub const KEY_LEN: usize = 32;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:4100";
pub const DEFAULT_PROTOCOL: &str = "/tss/coordination/1";
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECS: u64 = 30;

/// The node config file, which is serialized with serde.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The path the config was loaded from.
    #[serde(skip)]
    pub(crate) path: Option<PathBuf>,
    #[serde(default)]
    pub version: u8,
    /// The address to accept peer connections on.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// The protocol id bound into every handshake. Nodes with different ids
    /// cannot talk to each other.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    /// The communication key pair of the node.
    pub keypair: Option<Keypair>,
    #[serde(default)]
    pub coordinator: CoordinatorSection,
    #[serde(default)]
    pub bully: BullySection,
    /// The address book, keyed by each peer's name.
    #[serde(default)]
    pub peer: BTreeMap<String, Peer>,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 4100))
}

fn default_protocol() -> String {
    DEFAULT_PROTOCOL.to_string()
}

fn default_health_check_interval_secs() -> u64 {
    DEFAULT_HEALTH_CHECK_INTERVAL_SECS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: None,
            version: 0,
            listen_addr: default_listen_addr(),
            protocol: default_protocol(),
            health_check_interval_secs: DEFAULT_HEALTH_CHECK_INTERVAL_SECS,
            keypair: None,
            coordinator: CoordinatorSection::default(),
            bully: BullySection::default(),
            peer: BTreeMap::new(),
        }
    }
}

/// An address book entry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Peer {
    /// The communication public key of the peer.
    #[serde(
        serialize_with = "serdect::slice::serialize_hex_lower_or_bin",
        deserialize_with = "serdect::slice::deserialize_hex_or_bin_vec"
    )]
    pub pubkey: Vec<u8>,
    pub address: SocketAddr,
}

impl Peer {
    pub fn id(&self) -> PeerId {
        PeerId::from_public_key(&self.pubkey)
    }
}

/// Session timeouts, in milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CoordinatorSection {
    pub initiate_period_ms: u64,
    pub coordinator_timeout_ms: u64,
    pub tss_timeout_ms: u64,
    pub max_retries: usize,
}

impl Default for CoordinatorSection {
    fn default() -> Self {
        let config = CoordinatorConfig::default();
        Self {
            initiate_period_ms: millis(config.initiate_period),
            coordinator_timeout_ms: millis(config.coordinator_timeout),
            tss_timeout_ms: millis(config.tss_timeout),
            max_retries: config.max_retries,
        }
    }
}

impl From<&CoordinatorSection> for CoordinatorConfig {
    fn from(section: &CoordinatorSection) -> Self {
        Self {
            initiate_period: Duration::from_millis(section.initiate_period_ms),
            coordinator_timeout: Duration::from_millis(section.coordinator_timeout_ms),
            tss_timeout: Duration::from_millis(section.tss_timeout_ms),
            max_retries: section.max_retries,
        }
    }
}

/// Bully election timeouts, in milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BullySection {
    pub ping_wait_time_ms: u64,
    pub ping_back_off_ms: u64,
    pub ping_interval_ms: u64,
    pub election_wait_time_ms: u64,
    pub bully_wait_time_ms: u64,
}

impl Default for BullySection {
    fn default() -> Self {
        let config = BullyConfig::default();
        Self {
            ping_wait_time_ms: millis(config.ping_wait_time),
            ping_back_off_ms: millis(config.ping_back_off),
            ping_interval_ms: millis(config.ping_interval),
            election_wait_time_ms: millis(config.election_wait_time),
            bully_wait_time_ms: millis(config.bully_wait_time),
        }
    }
}

impl From<&BullySection> for BullyConfig {
    fn from(section: &BullySection) -> Self {
        Self {
            ping_wait_time: Duration::from_millis(section.ping_wait_time_ms),
            ping_back_off: Duration::from_millis(section.ping_back_off_ms),
            ping_interval: Duration::from_millis(section.ping_interval_ms),
            election_wait_time: Duration::from_millis(section.election_wait_time_ms),
            bully_wait_time: Duration::from_millis(section.bully_wait_time_ms),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Returns the default path of the config
    /// ($HOME/.config/tssd/config.toml in Linux) if `path` is None,
    /// otherwise parse the given path and return it.
    pub fn parse_path(path: Option<String>) -> Result<PathBuf, Box<dyn Error>> {
        if let Some(path) = path {
            Ok(PathBuf::from_str(&path)?)
        } else {
            Ok(dirs::config_dir()
                .ok_or_else(|| eyre!("could not determine the config directory"))?
                .join("tssd")
                .join("config.toml"))
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Read the config from given path, or the default path if None.
    /// If the path does not exist, it will load a default config.
    /// Calling `write()` later will write to the specified path.
    pub fn read(path: Option<String>) -> Result<Self, Box<dyn Error>> {
        let path = Self::parse_path(path)?;
        if !path.exists() {
            return Ok(Config {
                path: Some(path),
                ..Default::default()
            });
        }
        let s = std::fs::read_to_string(&path)?;
        let mut config: Config = toml::from_str(&s)?;
        config.path = Some(path);
        Ok(config)
    }

    /// Write the config to path it was loaded from.
    pub fn write(&self) -> Result<(), Box<dyn Error>> {
        let s = toml::to_string_pretty(self)?;
        let path = self.path().ok_or_else(|| eyre!("path not specified"))?;
        Ok(write_atomic::write_file(path, s.as_bytes())?)
    }

    pub fn keypair(&self) -> Result<&Keypair, Box<dyn Error>> {
        Ok(self
            .keypair
            .as_ref()
            .ok_or_else(|| eyre!("no keypair found; run `tssd init` first"))?)
    }

    /// Check that the config can be used to run a node.
    pub fn validate(&self) -> Result<(), Box<dyn Error>> {
        let keypair = self.keypair()?;
        if keypair.public.len() != KEY_LEN || keypair.private.as_bytes().len() != KEY_LEN {
            return Err(eyre!("keypair must hold two {KEY_LEN} byte keys").into());
        }

        let mut seen = HashSet::from([keypair.peer_id()]);
        for (name, peer) in &self.peer {
            if peer.pubkey.len() != KEY_LEN {
                return Err(eyre!("public key of peer {name} must be {KEY_LEN} bytes").into());
            }
            if !seen.insert(peer.id()) {
                return Err(eyre!("peer {name} has the key of another peer or of this node").into());
            }
        }

        let c = &self.coordinator;
        let b = &self.bully;
        let timeouts = [
            ("health_check_interval_secs", self.health_check_interval_secs),
            ("coordinator.initiate_period_ms", c.initiate_period_ms),
            ("coordinator.coordinator_timeout_ms", c.coordinator_timeout_ms),
            ("coordinator.tss_timeout_ms", c.tss_timeout_ms),
            ("bully.ping_wait_time_ms", b.ping_wait_time_ms),
            ("bully.ping_back_off_ms", b.ping_back_off_ms),
            ("bully.ping_interval_ms", b.ping_interval_ms),
            ("bully.election_wait_time_ms", b.election_wait_time_ms),
            ("bully.bully_wait_time_ms", b.bully_wait_time_ms),
        ];
        if let Some((field, _)) = timeouts.iter().find(|(_, value)| *value == 0) {
            return Err(eyre!("{field} must not be zero").into());
        }
        Ok(())
    }

    /// Build the network host: the node's key pair plus its address book.
    pub fn network_host(&self) -> Result<NetworkHost, Box<dyn Error>> {
        let host = NetworkHost::new(self.keypair()?.clone());
        for peer in self.peer.values() {
            host.add_peer(peer.id(), peer.address);
        }
        Ok(host)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}
