//! Key material for one process, dealt from the cluster seed.
//!
//! This is a demonstration ceremony, not a secure one. Persisting keys is
//! outside this crate, so every process replays the same dealing from
//! `ClusterConfig::seed` and then discards what is not its own. Anyone who
//! holds the configuration file can replay it too and learn every signing
//! key and every threshold share. A deployment would need a real dealer or
//! a distributed key generation that hands each process only its own keys.
//!
//! What a process keeps: its Ed25519 signing key, the verifying keys of
//! every peer, and (for servers) one share of the threshold decryption key.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use ed25519_dalek::SigningKey;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::config::{ClusterConfig, PeerId};
use crate::signature::{Ed25519Signatures, KeyDirectory, SignatureService};
use crate::threshold::{self, ThresholdElGamal, ThresholdEncryption};

pub struct KeyMaterial {
    pub signatures: Arc<dyn SignatureService>,
    /// Present only for servers.
    pub threshold: Option<Arc<dyn ThresholdEncryption>>,
}

/// Deals every key in the cluster and returns the part belonging to `id`.
pub fn deal(cluster: &ClusterConfig, id: PeerId) -> Result<KeyMaterial> {
    let me = cluster.peer(id)?;
    let mut rng = StdRng::seed_from_u64(cluster.seed);

    // Sorted so that every process draws keys in the same order.
    let mut signing_keys: BTreeMap<PeerId, SigningKey> = BTreeMap::new();
    let mut ids: Vec<PeerId> = cluster.peers.iter().map(|peer| peer.id).collect();
    ids.sort_unstable();
    for peer_id in ids {
        signing_keys.insert(peer_id, SigningKey::generate(&mut rng));
    }
    let directory: KeyDirectory = signing_keys
        .iter()
        .map(|(&peer_id, key)| (peer_id, key.verifying_key()))
        .collect();

    let (public, shares) = threshold::deal(cluster.n(), cluster.threshold, &mut rng);

    let signing_key = signing_keys
        .remove(&id)
        .ok_or_else(|| anyhow::anyhow!("no signing key dealt for peer {id}"))?;
    let signatures: Arc<dyn SignatureService> =
        Arc::new(Ed25519Signatures::new(id, signing_key, Arc::new(directory)));

    let threshold = if me.is_server {
        let share = shares
            .into_iter()
            .find(|share| share.server_id == id)
            .ok_or_else(|| anyhow::anyhow!("no threshold share dealt for server {id}"))?;
        Some(Arc::new(ThresholdElGamal::new(public, share)) as Arc<dyn ThresholdEncryption>)
    } else {
        None
    };

    Ok(KeyMaterial {
        signatures,
        threshold,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processes_agree_on_each_others_keys() -> Result<()> {
        let cluster = ClusterConfig::local(1, 2, 9400, &[10])?;
        let client = deal(&cluster, 10)?;
        let server = deal(&cluster, 2)?;

        assert!(client.threshold.is_none());
        let signature = client.signatures.sign(b"hello");
        assert!(server.signatures.validate(b"hello", 10, &signature));
        Ok(())
    }

    #[test]
    fn threshold_shares_from_separate_deals_combine() -> Result<()> {
        let cluster = ClusterConfig::local(1, 2, 9400, &[])?;
        let a = deal(&cluster, 0)?.threshold.expect("server share");
        let b = deal(&cluster, 3)?.threshold.expect("server share");

        let ciphertext = a.encrypt(b"top secret")?;
        let shares = vec![a.decrypt_share(&ciphertext)?, b.decrypt_share(&ciphertext)?];
        assert_eq!(a.combine_shares(&ciphertext, &shares, &[0, 3])?, b"top secret");
        Ok(())
    }

    #[test]
    fn config_holders_can_replay_any_servers_keys() -> Result<()> {
        let cluster = ClusterConfig::local(1, 2, 9400, &[10])?;
        let replayed = deal(&cluster, 0)?;
        let server = deal(&cluster, 0)?;

        let signature = replayed.signatures.sign(b"forged");
        assert!(server.signatures.validate(b"forged", 0, &signature));
        Ok(())
    }

    #[test]
    fn unknown_peer_is_an_error() {
        let cluster = ClusterConfig::local(1, 2, 9400, &[]).expect("local cluster");
        assert!(deal(&cluster, 42).is_err());
    }
}
