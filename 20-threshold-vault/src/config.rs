//! Static cluster topology and protocol parameters.
//!
//! Every process (replica, client, gateway) loads the same [`ClusterConfig`]
//! at startup. It names each peer's address and role and fixes the fault
//! bound `f`, the decryption threshold `k`, and the seed the demo key
//! ceremony deals from.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity of a replica, client, or gateway.
pub type PeerId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("expected 3f+1 = {expected} servers, found {found}")]
    ServerCount { expected: usize, found: usize },
    #[error("server ids must be exactly 0..{n}, found {id}")]
    ServerIdRange { n: usize, id: PeerId },
    #[error("client id {0} collides with the server id range")]
    ClientIdInServerRange(PeerId),
    #[error("peer id {0} appears more than once")]
    DuplicateId(PeerId),
    #[error("address {0} is used by more than one peer")]
    DuplicateAddress(String),
    #[error("threshold must be between 1 and 2f+1 = {quorum}, got {threshold}")]
    Threshold { threshold: usize, quorum: usize },
    #[error("port {base_port} + {id} does not fit in a u16")]
    PortOutOfRange { base_port: u16, id: PeerId },
    #[error("peer {0} is not in the cluster configuration")]
    UnknownPeer(PeerId),
}

/// Where a peer listens and whether it takes part in the quorum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub id: PeerId,
    pub host: String,
    pub port: u16,
    pub is_server: bool,
}

impl PeerAddress {
    pub fn new(id: PeerId, host: impl Into<String>, port: u16, is_server: bool) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            is_server,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Maximum number of faulty servers tolerated.
    pub f: usize,
    /// Decryption shares needed to reconstruct a secret.
    pub threshold: usize,
    /// Seed for the demo key ceremony; every process must use the same value.
    pub seed: u64,
    pub peers: Vec<PeerAddress>,
}

impl ClusterConfig {
    /// A localhost cluster of `3f+1` servers plus the given clients.
    ///
    /// Every peer listens on `base_port + id`, the same id-derived layout the
    /// sample configuration uses. Fails if any such port does not fit in a `u16`.
    pub fn local(
        f: usize,
        threshold: usize,
        base_port: u16,
        clients: &[PeerId],
    ) -> Result<Self, ConfigError> {
        let n = 3 * f + 1;
        let servers = (0..n as PeerId).map(|id| (id, true));
        let clients = clients.iter().map(|&id| (id, false));
        let peers = servers
            .chain(clients)
            .map(|(id, is_server)| {
                let port = u16::try_from(id)
                    .ok()
                    .and_then(|offset| base_port.checked_add(offset))
                    .ok_or(ConfigError::PortOutOfRange { base_port, id })?;
                Ok(PeerAddress::new(id, "127.0.0.1", port, is_server))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;
        Ok(Self {
            f,
            threshold,
            seed: 0x5eed,
            peers,
        })
    }

    /// Reads and validates a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let n = self.n();
        let found = self.servers().count();
        if found != n {
            return Err(ConfigError::ServerCount { expected: n, found });
        }
        if self.threshold == 0 || self.threshold > self.quorum() {
            return Err(ConfigError::Threshold {
                threshold: self.threshold,
                quorum: self.quorum(),
            });
        }

        let mut ids = HashSet::new();
        let mut addrs = HashSet::new();
        for peer in &self.peers {
            if !ids.insert(peer.id) {
                return Err(ConfigError::DuplicateId(peer.id));
            }
            if !addrs.insert(peer.addr()) {
                return Err(ConfigError::DuplicateAddress(peer.addr()));
            }
            let in_server_range = (peer.id as usize) < n;
            if peer.is_server && !in_server_range {
                return Err(ConfigError::ServerIdRange { n, id: peer.id });
            }
            if !peer.is_server && in_server_range {
                return Err(ConfigError::ClientIdInServerRange(peer.id));
            }
        }
        Ok(())
    }

    /// Total number of servers, `3f+1`.
    pub fn n(&self) -> usize {
        3 * self.f + 1
    }

    /// Matching responses needed to finish an operation, `2f+1`.
    pub fn quorum(&self) -> usize {
        2 * self.f + 1
    }

    pub fn servers(&self) -> impl Iterator<Item = &PeerAddress> {
        self.peers.iter().filter(|peer| peer.is_server)
    }

    pub fn server_ids(&self) -> Vec<PeerId> {
        self.servers().map(|peer| peer.id).collect()
    }

    pub fn peer(&self, id: PeerId) -> Result<&PeerAddress, ConfigError> {
        self.peers
            .iter()
            .find(|peer| peer.id == id)
            .ok_or(ConfigError::UnknownPeer(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_cluster_is_valid() {
        let config = ClusterConfig::local(2, 3, 8001, &[7, 8]).expect("local cluster");
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.n(), 7);
        assert_eq!(config.quorum(), 5);
        assert_eq!(config.server_ids(), vec![0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(config.peer(7).map(|p| p.port), Ok(8008));
        assert!(!config.peer(8).expect("client").is_server);
    }

    #[test]
    fn local_ports_past_u16_are_an_error() {
        assert_eq!(
            ClusterConfig::local(2, 3, 65_530, &[]),
            Err(ConfigError::PortOutOfRange {
                base_port: 65_530,
                id: 6
            })
        );
        assert_eq!(
            ClusterConfig::local(1, 2, 9000, &[70_000]),
            Err(ConfigError::PortOutOfRange {
                base_port: 9000,
                id: 70_000
            })
        );
        assert!(ClusterConfig::local(1, 2, 65_531, &[]).is_ok());
    }

    #[test]
    fn rejects_wrong_server_count() {
        let mut config = ClusterConfig::local(1, 2, 9000, &[]).expect("local cluster");
        config.peers.pop();
        assert_eq!(
            config.validate(),
            Err(ConfigError::ServerCount {
                expected: 4,
                found: 3
            })
        );
    }

    #[test]
    fn rejects_threshold_above_quorum() {
        let mut config = ClusterConfig::local(1, 2, 9000, &[]).expect("local cluster");
        config.threshold = 4;
        assert_eq!(
            config.validate(),
            Err(ConfigError::Threshold {
                threshold: 4,
                quorum: 3
            })
        );
        config.threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_client_ids_inside_server_range() {
        let mut config = ClusterConfig::local(1, 2, 9000, &[]).expect("local cluster");
        config.peers.push(PeerAddress::new(2, "127.0.0.1", 9100, false));
        assert_eq!(config.validate(), Err(ConfigError::DuplicateId(2)));

        let mut config = ClusterConfig::local(1, 2, 9000, &[]).expect("local cluster");
        config.peers[3].is_server = false;
        config.peers.push(PeerAddress::new(4, "127.0.0.1", 9100, true));
        assert_eq!(config.validate(), Err(ConfigError::ClientIdInServerRange(3)));
    }

    #[test]
    fn rejects_shared_addresses() {
        let mut config = ClusterConfig::local(1, 2, 9000, &[]).expect("local cluster");
        config.peers.push(PeerAddress::new(10, "127.0.0.1", 9000, false));
        assert_eq!(
            config.validate(),
            Err(ConfigError::DuplicateAddress("127.0.0.1:9000".into()))
        );
    }

    #[test]
    fn json_roundtrip_through_file() -> Result<()> {
        let config = ClusterConfig::local(1, 2, 9300, &[4])?;
        let path = std::env::temp_dir().join(format!("tv-config-{}.json", std::process::id()));
        std::fs::write(&path, serde_json::to_string_pretty(&config)?)?;
        let loaded = ClusterConfig::load(&path)?;
        std::fs::remove_file(&path)?;
        assert_eq!(loaded, config);
        Ok(())
    }
}
