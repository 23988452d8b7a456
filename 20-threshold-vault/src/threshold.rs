//! Threshold encryption of stored secrets.
//!
//! Secrets are encrypted under a group public key whose private key is
//! Shamir-shared among the `N` replicas. A replica can only contribute a
//! *decryption share* for a ciphertext; any `k` shares combine back into the
//! plaintext and fewer than `k` reveal nothing.
//!
//! # Scheme
//!
//! Hashed ElGamal over the BLS12-381 G1 group:
//!
//! - Dealing: random polynomial `p` of degree `k-1`, group key `pk = g·p(0)`,
//!   replica `i` holds `s_i = p(i+1)`.
//! - `encrypt(m)`: `U = g·r`, `K = pk·r`, `V = m ⊕ H(K)`, plus a tag binding
//!   `K` to `m` so a bad combination is detected instead of returning garbage.
//! - `decrypt_share(U, V)`: `U·s_i`.
//! - `combine`: Lagrange interpolation at zero over `k` shares gives
//!   `U·p(0) = K`.
//!
//! The nonce `r` is derived from the plaintext and the group key, so every
//! replica encrypting the same PUT produces a byte-identical ciphertext.
//! Shares computed by different replicas from their own stored copies can
//! therefore be combined, and catch-up can compare entries byte for byte.

use std::collections::HashSet;

use blstrs::{G1Affine, G1Projective, Scalar};
use ff::Field;
use group::{Curve, Group};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::PeerId;

const NONCE_DST: &[u8] = b"threshold-vault/nonce/v1";
const STREAM_DST: &[u8] = b"threshold-vault/stream/v1";
const TAG_DST: &[u8] = b"threshold-vault/tag/v1";
const TAG_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ThresholdError {
    #[error("need {needed} decryption shares, got {got}")]
    NotEnoughShares { needed: usize, got: usize },
    #[error("{shares} shares but {ids} sender ids")]
    LengthMismatch { shares: usize, ids: usize },
    #[error("duplicate share from server {0}")]
    DuplicateSender(PeerId),
    #[error("malformed group element")]
    InvalidPoint,
    #[error("combined shares do not decrypt this ciphertext")]
    Mismatch,
}

/// Opaque ciphertext: `U` compressed, the masked secret `V`, and its tag.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ciphertext {
    #[serde(with = "crate::encoding::base64_bytes")]
    pub u: Vec<u8>,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub v: Vec<u8>,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub tag: Vec<u8>,
}

impl std::fmt::Debug for Ciphertext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ciphertext")
            .field("u", &crate::encoding::encode(&self.u))
            .field("v_len", &self.v.len())
            .finish()
    }
}

/// One replica's partial decryption of a [`Ciphertext`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Share(#[serde(with = "crate::encoding::base64_bytes")] pub Vec<u8>);

pub trait ThresholdEncryption: Send + Sync {
    /// Number of shares `combine_shares` needs.
    fn threshold(&self) -> usize;

    fn encrypt(&self, secret: &[u8]) -> Result<Ciphertext, ThresholdError>;

    fn decrypt_share(&self, ciphertext: &Ciphertext) -> Result<Share, ThresholdError>;

    /// `shares[i]` must come from `sender_ids[i]`. Only the first `k` pairs are used.
    fn combine_shares(
        &self,
        ciphertext: &Ciphertext,
        shares: &[Share],
        sender_ids: &[PeerId],
    ) -> Result<Vec<u8>, ThresholdError>;
}

/// Group public key together with the reconstruction threshold.
#[derive(Clone, Debug)]
pub struct ThresholdPublicKey {
    pub point: G1Projective,
    pub k: usize,
}

/// A single replica's share of the group private key.
#[derive(Clone, Debug)]
pub struct ThresholdKeyShare {
    pub server_id: PeerId,
    pub secret: Scalar,
}

/// Trusted-dealer ceremony: shares a fresh private key among servers `0..n`.
pub fn deal(n: usize, k: usize, rng: &mut impl RngCore) -> (ThresholdPublicKey, Vec<ThresholdKeyShare>) {
    let secret = Scalar::random(&mut *rng);
    let mut coeffs = vec![secret];
    for _ in 1..k {
        coeffs.push(Scalar::random(&mut *rng));
    }

    let shares = (0..n as PeerId)
        .map(|server_id| {
            let x = evaluation_point(server_id);
            let mut y = Scalar::ZERO;
            let mut x_pow = Scalar::ONE;
            for coeff in &coeffs {
                y += *coeff * x_pow;
                x_pow *= x;
            }
            ThresholdKeyShare {
                server_id,
                secret: y,
            }
        })
        .collect();

    let public = ThresholdPublicKey {
        point: G1Projective::generator() * secret,
        k,
    };
    (public, shares)
}

/// Hashed ElGamal with a Shamir-shared key; see the module docs.
pub struct ThresholdElGamal {
    public: ThresholdPublicKey,
    share: ThresholdKeyShare,
}

impl ThresholdElGamal {
    pub fn new(public: ThresholdPublicKey, share: ThresholdKeyShare) -> Self {
        Self { public, share }
    }

    pub fn server_id(&self) -> PeerId {
        self.share.server_id
    }
}

impl ThresholdEncryption for ThresholdElGamal {
    fn threshold(&self) -> usize {
        self.public.k
    }

    fn encrypt(&self, secret: &[u8]) -> Result<Ciphertext, ThresholdError> {
        let r = derive_nonce(&self.public.point, secret);
        let u = G1Projective::generator() * r;
        let key = self.public.point * r;
        Ok(Ciphertext {
            u: compress(&u),
            v: mask(&key, secret),
            tag: tag(&key, secret),
        })
    }

    fn decrypt_share(&self, ciphertext: &Ciphertext) -> Result<Share, ThresholdError> {
        let u = decompress(&ciphertext.u)?;
        Ok(Share(compress(&(u * self.share.secret))))
    }

    fn combine_shares(
        &self,
        ciphertext: &Ciphertext,
        shares: &[Share],
        sender_ids: &[PeerId],
    ) -> Result<Vec<u8>, ThresholdError> {
        let k = self.public.k;
        if shares.len() != sender_ids.len() {
            return Err(ThresholdError::LengthMismatch {
                shares: shares.len(),
                ids: sender_ids.len(),
            });
        }
        if shares.len() < k {
            return Err(ThresholdError::NotEnoughShares {
                needed: k,
                got: shares.len(),
            });
        }

        let mut seen = HashSet::new();
        let mut parts = Vec::with_capacity(k);
        for (share, &id) in shares.iter().zip(sender_ids).take(k) {
            if !seen.insert(id) {
                return Err(ThresholdError::DuplicateSender(id));
            }
            parts.push((evaluation_point(id), decompress(&share.0)?));
        }

        let key = interpolate_at_zero(&parts)?;
        let secret = mask(&key, &ciphertext.v);
        if tag(&key, &secret) != ciphertext.tag {
            return Err(ThresholdError::Mismatch);
        }
        Ok(secret)
    }
}

/// Servers are numbered from zero but polynomial evaluation must avoid x = 0.
fn evaluation_point(server_id: PeerId) -> Scalar {
    Scalar::from(server_id + 1)
}

fn interpolate_at_zero(parts: &[(Scalar, G1Projective)]) -> Result<G1Projective, ThresholdError> {
    let mut acc = G1Projective::identity();
    for (i, (x_i, point)) in parts.iter().enumerate() {
        let mut num = Scalar::ONE;
        let mut den = Scalar::ONE;
        for (j, (x_j, _)) in parts.iter().enumerate() {
            if i != j {
                num *= -*x_j;
                den *= *x_i - *x_j;
            }
        }
        let inv = Option::<Scalar>::from(den.invert()).ok_or(ThresholdError::InvalidPoint)?;
        acc += *point * (num * inv);
    }
    Ok(acc)
}

fn derive_nonce(public: &G1Projective, secret: &[u8]) -> Scalar {
    let mut hasher = Sha256::new();
    hasher.update(NONCE_DST);
    hasher.update(compress(public));
    hasher.update(secret);
    let seed: [u8; 32] = hasher.finalize().into();
    Scalar::random(StdRng::from_seed(seed))
}

fn mask(key: &G1Projective, input: &[u8]) -> Vec<u8> {
    let key_bytes = compress(key);
    let mut out = Vec::with_capacity(input.len());
    for (block, chunk) in input.chunks(32).enumerate() {
        let mut hasher = Sha256::new();
        hasher.update(STREAM_DST);
        hasher.update(&key_bytes);
        hasher.update((block as u32).to_be_bytes());
        let pad = hasher.finalize();
        out.extend(chunk.iter().zip(pad.iter()).map(|(a, b)| a ^ b));
    }
    out
}

fn tag(key: &G1Projective, secret: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(TAG_DST);
    hasher.update(compress(key));
    hasher.update(secret);
    hasher.finalize()[..TAG_LEN].to_vec()
}

fn compress(point: &G1Projective) -> Vec<u8> {
    point.to_affine().to_compressed().to_vec()
}

fn decompress(bytes: &[u8]) -> Result<G1Projective, ThresholdError> {
    let bytes: &[u8; 48] = bytes.try_into().map_err(|_| ThresholdError::InvalidPoint)?;
    Option::<G1Affine>::from(G1Affine::from_compressed(bytes))
        .map(G1Projective::from)
        .ok_or(ThresholdError::InvalidPoint)
}
