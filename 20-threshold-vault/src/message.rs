//! The closed message vocabulary exchanged between replicas, clients, and
//! gateways, with its wire codec and signing contract.
//!
//! # Wire format
//!
//! Each message is a JSON object whose `"type"` field names the variant
//! (`"PUT"`, `"PUT_ACCEPT"`, ...). Binary fields are base64 strings. Framing
//! is handled separately in [`crate::framing`].
//!
//! # Signatures
//!
//! Every variant except [`Intro`] is signed. The signature covers
//! `data()`, a deterministic length-prefixed encoding of every field except
//! the signature itself. Messages derived from a client request embed that
//! request by value, and their `data()` includes the inner payload *and* the
//! inner signature, so a replica cannot vouch for a `Put` the client never
//! signed. Verification walks the chain down to the client's signature.
//!
//! Constructors come in pairs: `signed(.., signer)` produces a signature on
//! the send path, `with_signature(.., signature)` carries one on the decode
//! path. There is no way to build a message with neither or both.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::PeerId;
use crate::signature::{Signature, SignatureService};
use crate::threshold::{Ciphertext, Share};

/// Microseconds since the UNIX epoch, assigned by a request's initiator.
pub type Timestamp = u64;

/// Every `"type"` discriminator this codec understands.
pub const MESSAGE_TYPES: &[&str] = &[
    "INTRO",
    "LOGIN",
    "LOGIN_RESPONSE",
    "ENROLL",
    "ENROLL_RESPONSE",
    "GET",
    "DECRYPTION_SHARE",
    "RESPONSE",
    "PUT",
    "PUT_ACCEPT",
    "PUT_COMPLETE",
    "CATCH_UP_REQUEST",
    "CATCH_UP_RESPONSE",
];

static LAST_TIMESTAMP: AtomicU64 = AtomicU64::new(0);

/// Current wall-clock time in microseconds.
pub fn now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

/// Wall-clock timestamp, strictly increasing within this process.
pub fn next_timestamp() -> Timestamp {
    let now = now();
    let mut last = LAST_TIMESTAMP.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_TIMESTAMP.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(current) => last = current,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("malformed message: {0}")]
    MalformedField(String),
}

/// Builder for the signable payload of a message.
///
/// Fields are written as a 4-byte big-endian length followed by the bytes,
/// after a leading type tag, so no two distinct messages share a payload.
struct SignableData(Vec<u8>);

impl SignableData {
    fn new(tag: &str) -> Self {
        Self(Vec::new()).bytes(tag.as_bytes())
    }

    fn bytes(mut self, field: &[u8]) -> Self {
        self.0.extend_from_slice(&(field.len() as u32).to_be_bytes());
        self.0.extend_from_slice(field);
        self
    }

    fn str(self, field: &str) -> Self {
        self.bytes(field.as_bytes())
    }

    fn u64(self, field: u64) -> Self {
        self.bytes(&field.to_be_bytes())
    }

    /// Embeds a parent message: its payload followed by its signature.
    fn parent(self, data: &[u8], signature: &Signature) -> Self {
        self.bytes(data).bytes(signature.as_bytes())
    }

    fn finish(self) -> Vec<u8> {
        self.0
    }
}

/// First frame on every connection; announces who is on the other end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intro {
    pub peer_id: PeerId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Get {
    pub key: String,
    pub client_id: PeerId,
    pub timestamp: Timestamp,
    pub signature: Signature,
}

impl Get {
    pub fn signed(key: impl Into<String>, timestamp: Timestamp, signer: &dyn SignatureService) -> Self {
        let mut get = Self::with_signature(key, signer.id(), timestamp, Signature::from_bytes(Vec::new()));
        get.signature = signer.sign(&get.data());
        get
    }

    pub fn with_signature(
        key: impl Into<String>,
        client_id: PeerId,
        timestamp: Timestamp,
        signature: Signature,
    ) -> Self {
        Self {
            key: key.into(),
            client_id,
            timestamp,
            signature,
        }
    }

    pub fn data(&self) -> Vec<u8> {
        SignableData::new("GET")
            .str(&self.key)
            .u64(self.client_id)
            .u64(self.timestamp)
            .finish()
    }

    pub fn verify(&self, sigs: &dyn SignatureService) -> bool {
        sigs.validate(&self.data(), self.client_id, &self.signature)
    }
}

/// A replica's partial decryption for the secret a [`Get`] asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionShare {
    pub share: Share,
    pub sender_id: PeerId,
    pub get: Get,
    pub signature: Signature,
}

impl DecryptionShare {
    pub fn signed(share: Share, get: Get, signer: &dyn SignatureService) -> Self {
        let mut msg = Self::with_signature(share, signer.id(), get, Signature::from_bytes(Vec::new()));
        msg.signature = signer.sign(&msg.data());
        msg
    }

    pub fn with_signature(share: Share, sender_id: PeerId, get: Get, signature: Signature) -> Self {
        Self {
            share,
            sender_id,
            get,
            signature,
        }
    }

    pub fn data(&self) -> Vec<u8> {
        SignableData::new("DECRYPTION_SHARE")
            .bytes(&self.share.0)
            .u64(self.sender_id)
            .parent(&self.get.data(), &self.get.signature)
            .finish()
    }

    pub fn verify(&self, sigs: &dyn SignatureService) -> bool {
        self.get.verify(sigs) && sigs.validate(&self.data(), self.sender_id, &self.signature)
    }
}

/// The reconstructed secret, sent by each replica to the requesting client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetResponse {
    pub get: Get,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub secret: Vec<u8>,
    pub sender_id: PeerId,
    pub signature: Signature,
}

impl GetResponse {
    pub fn signed(get: Get, secret: Vec<u8>, signer: &dyn SignatureService) -> Self {
        let mut msg = Self::with_signature(get, secret, signer.id(), Signature::from_bytes(Vec::new()));
        msg.signature = signer.sign(&msg.data());
        msg
    }

    pub fn with_signature(get: Get, secret: Vec<u8>, sender_id: PeerId, signature: Signature) -> Self {
        Self {
            get,
            secret,
            sender_id,
            signature,
        }
    }

    pub fn data(&self) -> Vec<u8> {
        SignableData::new("RESPONSE")
            .parent(&self.get.data(), &self.get.signature)
            .bytes(&self.secret)
            .u64(self.sender_id)
            .finish()
    }

    pub fn verify(&self, sigs: &dyn SignatureService) -> bool {
        self.get.verify(sigs) && sigs.validate(&self.data(), self.sender_id, &self.signature)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Put {
    pub key: String,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub secret: Vec<u8>,
    pub client_id: PeerId,
    pub timestamp: Timestamp,
    pub signature: Signature,
}

impl Put {
    pub fn signed(
        key: impl Into<String>,
        secret: Vec<u8>,
        timestamp: Timestamp,
        signer: &dyn SignatureService,
    ) -> Self {
        let mut put = Self::with_signature(key, secret, signer.id(), timestamp, Signature::from_bytes(Vec::new()));
        put.signature = signer.sign(&put.data());
        put
    }

    pub fn with_signature(
        key: impl Into<String>,
        secret: Vec<u8>,
        client_id: PeerId,
        timestamp: Timestamp,
        signature: Signature,
    ) -> Self {
        Self {
            key: key.into(),
            secret,
            client_id,
            timestamp,
            signature,
        }
    }

    pub fn data(&self) -> Vec<u8> {
        SignableData::new("PUT")
            .str(&self.key)
            .bytes(&self.secret)
            .u64(self.client_id)
            .u64(self.timestamp)
            .finish()
    }

    pub fn verify(&self, sigs: &dyn SignatureService) -> bool {
        sigs.validate(&self.data(), self.client_id, &self.signature)
    }
}

/// A replica's promise to store the embedded [`Put`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutAccept {
    pub put: Put,
    pub sender_id: PeerId,
    pub signature: Signature,
}

impl PutAccept {
    pub fn signed(put: Put, signer: &dyn SignatureService) -> Self {
        let mut msg = Self::with_signature(put, signer.id(), Signature::from_bytes(Vec::new()));
        msg.signature = signer.sign(&msg.data());
        msg
    }

    pub fn with_signature(put: Put, sender_id: PeerId, signature: Signature) -> Self {
        Self {
            put,
            sender_id,
            signature,
        }
    }

    pub fn data(&self) -> Vec<u8> {
        SignableData::new("PUT_ACCEPT")
            .parent(&self.put.data(), &self.put.signature)
            .u64(self.sender_id)
            .finish()
    }

    pub fn verify(&self, sigs: &dyn SignatureService) -> bool {
        self.put.verify(sigs) && sigs.validate(&self.data(), self.sender_id, &self.signature)
    }
}

/// Tells the client a replica has stored its [`Put`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutComplete {
    pub put: Put,
    pub sender_id: PeerId,
    pub signature: Signature,
}

impl PutComplete {
    pub fn signed(put: Put, signer: &dyn SignatureService) -> Self {
        let mut msg = Self::with_signature(put, signer.id(), Signature::from_bytes(Vec::new()));
        msg.signature = signer.sign(&msg.data());
        msg
    }

    pub fn with_signature(put: Put, sender_id: PeerId, signature: Signature) -> Self {
        Self {
            put,
            sender_id,
            signature,
        }
    }

    pub fn data(&self) -> Vec<u8> {
        SignableData::new("PUT_COMPLETE")
            .parent(&self.put.data(), &self.put.signature)
            .u64(self.sender_id)
            .finish()
    }

    pub fn verify(&self, sigs: &dyn SignatureService) -> bool {
        self.put.verify(sigs) && sigs.validate(&self.data(), self.sender_id, &self.signature)
    }
}

/// One stored secret as exchanged during catch-up.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatchUpEntry {
    pub key: String,
    pub ciphertext: Ciphertext,
    pub client_id: PeerId,
    pub timestamp: Timestamp,
}

impl CatchUpEntry {
    fn write(&self, data: SignableData) -> SignableData {
        data.str(&self.key)
            .bytes(&self.ciphertext.u)
            .bytes(&self.ciphertext.v)
            .bytes(&self.ciphertext.tag)
            .u64(self.client_id)
            .u64(self.timestamp)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchUpRequest {
    pub sender_id: PeerId,
    /// Newest timestamp the sender holds per client, as `(client_id, timestamp)`.
    pub known_timestamps: Vec<(PeerId, Timestamp)>,
    pub signature: Signature,
}

impl CatchUpRequest {
    pub fn signed(known_timestamps: Vec<(PeerId, Timestamp)>, signer: &dyn SignatureService) -> Self {
        let mut msg = Self::with_signature(signer.id(), known_timestamps, Signature::from_bytes(Vec::new()));
        msg.signature = signer.sign(&msg.data());
        msg
    }

    pub fn with_signature(
        sender_id: PeerId,
        known_timestamps: Vec<(PeerId, Timestamp)>,
        signature: Signature,
    ) -> Self {
        Self {
            sender_id,
            known_timestamps,
            signature,
        }
    }

    pub fn data(&self) -> Vec<u8> {
        let mut data = SignableData::new("CATCH_UP_REQUEST")
            .u64(self.sender_id)
            .u64(self.known_timestamps.len() as u64);
        for &(client_id, timestamp) in &self.known_timestamps {
            data = data.u64(client_id).u64(timestamp);
        }
        data.finish()
    }

    pub fn verify(&self, sigs: &dyn SignatureService) -> bool {
        sigs.validate(&self.data(), self.sender_id, &self.signature)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatchUpResponse {
    pub entries: Vec<CatchUpEntry>,
    pub sender_id: PeerId,
    pub signature: Signature,
}

impl CatchUpResponse {
    pub fn signed(entries: Vec<CatchUpEntry>, signer: &dyn SignatureService) -> Self {
        let mut msg = Self::with_signature(entries, signer.id(), Signature::from_bytes(Vec::new()));
        msg.signature = signer.sign(&msg.data());
        msg
    }

    pub fn with_signature(entries: Vec<CatchUpEntry>, sender_id: PeerId, signature: Signature) -> Self {
        Self {
            entries,
            sender_id,
            signature,
        }
    }

    pub fn data(&self) -> Vec<u8> {
        let mut data = SignableData::new("CATCH_UP_RESPONSE").u64(self.entries.len() as u64);
        for entry in &self.entries {
            data = entry.write(data);
        }
        data.u64(self.sender_id).finish()
    }

    pub fn verify(&self, sigs: &dyn SignatureService) -> bool {
        sigs.validate(&self.data(), self.sender_id, &self.signature)
    }
}

/// End user asking a gateway to log in. The PAKE payload is opaque here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub pake_message: Vec<u8>,
    pub user_id: PeerId,
    pub timestamp: Timestamp,
    pub signature: Signature,
}

impl LoginRequest {
    pub fn signed(
        username: impl Into<String>,
        pake_message: Vec<u8>,
        timestamp: Timestamp,
        signer: &dyn SignatureService,
    ) -> Self {
        let mut msg = Self::with_signature(
            username,
            pake_message,
            signer.id(),
            timestamp,
            Signature::from_bytes(Vec::new()),
        );
        msg.signature = signer.sign(&msg.data());
        msg
    }

    pub fn with_signature(
        username: impl Into<String>,
        pake_message: Vec<u8>,
        user_id: PeerId,
        timestamp: Timestamp,
        signature: Signature,
    ) -> Self {
        Self {
            username: username.into(),
            pake_message,
            user_id,
            timestamp,
            signature,
        }
    }

    pub fn data(&self) -> Vec<u8> {
        SignableData::new("LOGIN")
            .str(&self.username)
            .bytes(&self.pake_message)
            .u64(self.user_id)
            .u64(self.timestamp)
            .finish()
    }

    pub fn verify(&self, sigs: &dyn SignatureService) -> bool {
        sigs.validate(&self.data(), self.user_id, &self.signature)
    }
}

/// Gateway's answer to a [`LoginRequest`]; signed by the gateway it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginResponse {
    pub username: String,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub pake_response: Vec<u8>,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub encrypted_blob: Vec<u8>,
    pub timestamp: Timestamp,
    pub signature: Signature,
}

impl LoginResponse {
    pub fn signed(
        username: impl Into<String>,
        pake_response: Vec<u8>,
        encrypted_blob: Vec<u8>,
        timestamp: Timestamp,
        signer: &dyn SignatureService,
    ) -> Self {
        let mut msg = Self::with_signature(
            username,
            pake_response,
            encrypted_blob,
            timestamp,
            Signature::from_bytes(Vec::new()),
        );
        msg.signature = signer.sign(&msg.data());
        msg
    }

    pub fn with_signature(
        username: impl Into<String>,
        pake_response: Vec<u8>,
        encrypted_blob: Vec<u8>,
        timestamp: Timestamp,
        signature: Signature,
    ) -> Self {
        Self {
            username: username.into(),
            pake_response,
            encrypted_blob,
            timestamp,
            signature,
        }
    }

    pub fn data(&self) -> Vec<u8> {
        SignableData::new("LOGIN_RESPONSE")
            .str(&self.username)
            .bytes(&self.pake_response)
            .bytes(&self.encrypted_blob)
            .u64(self.timestamp)
            .finish()
    }

    pub fn verify(&self, sigs: &dyn SignatureService, signer: PeerId) -> bool {
        sigs.validate(&self.data(), signer, &self.signature)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollRequest {
    pub username: String,
    pub password: String,
    pub user_id: PeerId,
    pub timestamp: Timestamp,
    pub signature: Signature,
}

impl EnrollRequest {
    pub fn signed(
        username: impl Into<String>,
        password: impl Into<String>,
        timestamp: Timestamp,
        signer: &dyn SignatureService,
    ) -> Self {
        let mut msg = Self::with_signature(
            username,
            password,
            signer.id(),
            timestamp,
            Signature::from_bytes(Vec::new()),
        );
        msg.signature = signer.sign(&msg.data());
        msg
    }

    pub fn with_signature(
        username: impl Into<String>,
        password: impl Into<String>,
        user_id: PeerId,
        timestamp: Timestamp,
        signature: Signature,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            user_id,
            timestamp,
            signature,
        }
    }

    pub fn data(&self) -> Vec<u8> {
        SignableData::new("ENROLL")
            .str(&self.username)
            .str(&self.password)
            .u64(self.user_id)
            .u64(self.timestamp)
            .finish()
    }

    pub fn verify(&self, sigs: &dyn SignatureService) -> bool {
        sigs.validate(&self.data(), self.user_id, &self.signature)
    }
}

/// Gateway's answer to an [`EnrollRequest`]; signed by the gateway it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollResponse {
    pub username: String,
    pub timestamp: Timestamp,
    pub signature: Signature,
}

impl EnrollResponse {
    pub fn signed(username: impl Into<String>, timestamp: Timestamp, signer: &dyn SignatureService) -> Self {
        let mut msg = Self::with_signature(username, timestamp, Signature::from_bytes(Vec::new()));
        msg.signature = signer.sign(&msg.data());
        msg
    }

    pub fn with_signature(username: impl Into<String>, timestamp: Timestamp, signature: Signature) -> Self {
        Self {
            username: username.into(),
            timestamp,
            signature,
        }
    }

    pub fn data(&self) -> Vec<u8> {
        SignableData::new("ENROLL_RESPONSE")
            .str(&self.username)
            .u64(self.timestamp)
            .finish()
    }

    pub fn verify(&self, sigs: &dyn SignatureService, signer: PeerId) -> bool {
        sigs.validate(&self.data(), signer, &self.signature)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    #[serde(rename = "INTRO")]
    Intro(Intro),
    #[serde(rename = "LOGIN")]
    LoginRequest(LoginRequest),
    #[serde(rename = "LOGIN_RESPONSE")]
    LoginResponse(LoginResponse),
    #[serde(rename = "ENROLL")]
    EnrollRequest(EnrollRequest),
    #[serde(rename = "ENROLL_RESPONSE")]
    EnrollResponse(EnrollResponse),
    #[serde(rename = "GET")]
    Get(Get),
    #[serde(rename = "DECRYPTION_SHARE")]
    DecryptionShare(DecryptionShare),
    #[serde(rename = "RESPONSE")]
    GetResponse(GetResponse),
    #[serde(rename = "PUT")]
    Put(Put),
    #[serde(rename = "PUT_ACCEPT")]
    PutAccept(PutAccept),
    #[serde(rename = "PUT_COMPLETE")]
    PutComplete(PutComplete),
    #[serde(rename = "CATCH_UP_REQUEST")]
    CatchUpRequest(CatchUpRequest),
    #[serde(rename = "CATCH_UP_RESPONSE")]
    CatchUpResponse(CatchUpResponse),
}

impl Message {
    /// The `"type"` discriminator this message is written with.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Intro(_) => "INTRO",
            Message::LoginRequest(_) => "LOGIN",
            Message::LoginResponse(_) => "LOGIN_RESPONSE",
            Message::EnrollRequest(_) => "ENROLL",
            Message::EnrollResponse(_) => "ENROLL_RESPONSE",
            Message::Get(_) => "GET",
            Message::DecryptionShare(_) => "DECRYPTION_SHARE",
            Message::GetResponse(_) => "RESPONSE",
            Message::Put(_) => "PUT",
            Message::PutAccept(_) => "PUT_ACCEPT",
            Message::PutComplete(_) => "PUT_COMPLETE",
            Message::CatchUpRequest(_) => "CATCH_UP_REQUEST",
            Message::CatchUpResponse(_) => "CATCH_UP_RESPONSE",
        }
    }

    pub fn to_wire(&self) -> Vec<u8> {
        // Every field is a string, integer, or sequence, so serialization cannot fail.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self, DecodeError> {
        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|err| DecodeError::MalformedField(format!("invalid json: {err}")))?;
        let tag = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| DecodeError::MalformedField("missing \"type\" discriminator".into()))?;
        if !MESSAGE_TYPES.contains(&tag) {
            return Err(DecodeError::UnknownType(tag.to_string()));
        }
        serde_json::from_value(value).map_err(|err| DecodeError::MalformedField(err.to_string()))
    }

    /// Checks every signature the message carries, down to the originating request.
    ///
    /// `origin` is the peer id the connection introduced itself as; it is
    /// only consulted for gateway responses, which do not name their signer.
    pub fn verify(&self, sigs: &dyn SignatureService, origin: Option<PeerId>) -> bool {
        match self {
            Message::Intro(_) => true,
            Message::LoginRequest(msg) => msg.verify(sigs),
            Message::LoginResponse(msg) => origin.is_some_and(|id| msg.verify(sigs, id)),
            Message::EnrollRequest(msg) => msg.verify(sigs),
            Message::EnrollResponse(msg) => origin.is_some_and(|id| msg.verify(sigs, id)),
            Message::Get(msg) => msg.verify(sigs),
            Message::DecryptionShare(msg) => msg.verify(sigs),
            Message::GetResponse(msg) => msg.verify(sigs),
            Message::Put(msg) => msg.verify(sigs),
            Message::PutAccept(msg) => msg.verify(sigs),
            Message::PutComplete(msg) => msg.verify(sigs),
            Message::CatchUpRequest(msg) => msg.verify(sigs),
            Message::CatchUpResponse(msg) => msg.verify(sigs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::keys::{self, KeyMaterial};

    struct Peers {
        client: KeyMaterial,
        server: KeyMaterial,
        other: KeyMaterial,
    }

    fn peers() -> Peers {
        let cluster = ClusterConfig::local(1, 2, 9500, &[10]).expect("local cluster");
        Peers {
            client: keys::deal(&cluster, 10).expect("client keys"),
            server: keys::deal(&cluster, 0).expect("server keys"),
            other: keys::deal(&cluster, 1).expect("server keys"),
        }
    }

    fn share() -> Share {
        Share(vec![9; 48])
    }

    fn ciphertext() -> Ciphertext {
        Ciphertext {
            u: vec![1; 48],
            v: vec![2, 3, 4],
            tag: vec![5; 16],
        }
    }

    fn every_variant(p: &Peers) -> Vec<Message> {
        let c = p.client.signatures.as_ref();
        let s = p.server.signatures.as_ref();
        let put = Put::signed("alice", b"s3cret".to_vec(), 1_000, c);
        let get = Get::signed("alice", 2_000, c);
        vec![
            Message::Intro(Intro { peer_id: 4 }),
            Message::LoginRequest(LoginRequest::signed("alice", vec![0, 1, 2], 3_000, c)),
            Message::LoginResponse(LoginResponse::signed("alice", vec![], vec![7, 7], 3_000, s)),
            Message::EnrollRequest(EnrollRequest::signed("alice", "hunter2", 4_000, c)),
            Message::EnrollResponse(EnrollResponse::signed("alice", 4_000, s)),
            Message::Get(get.clone()),
            Message::DecryptionShare(DecryptionShare::signed(share(), get.clone(), s)),
            Message::GetResponse(GetResponse::signed(get, b"s3cret".to_vec(), s)),
            Message::Put(put.clone()),
            Message::PutAccept(PutAccept::signed(put.clone(), s)),
            Message::PutComplete(PutComplete::signed(put, s)),
            Message::CatchUpRequest(CatchUpRequest::signed(vec![(10, 1_000), (11, 5)], s)),
            Message::CatchUpResponse(CatchUpResponse::signed(
                vec![CatchUpEntry {
                    key: "alice".into(),
                    ciphertext: ciphertext(),
                    client_id: 10,
                    timestamp: 1_000,
                }],
                s,
            )),
        ]
    }

    #[test]
    fn every_variant_survives_the_wire() {
        let p = peers();
        let variants = every_variant(&p);
        assert_eq!(variants.len(), MESSAGE_TYPES.len());
        for message in variants {
            let decoded = Message::from_wire(&message.to_wire()).expect("decode");
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn wire_uses_protocol_type_names() {
        let p = peers();
        for message in every_variant(&p) {
            let value: serde_json::Value =
                serde_json::from_slice(&message.to_wire()).expect("json object");
            assert_eq!(value["type"], message.type_name());
        }
    }

    #[test]
    fn every_signed_variant_verifies() {
        let p = peers();
        let verifier = p.other.signatures.as_ref();
        for message in every_variant(&p) {
            assert!(message.verify(verifier, Some(0)), "{}", message.type_name());
        }
    }

    #[test]
    fn gateway_responses_need_the_introduced_origin() {
        let p = peers();
        let verifier = p.other.signatures.as_ref();
        let response = Message::EnrollResponse(EnrollResponse::signed(
            "alice",
            1,
            p.server.signatures.as_ref(),
        ));
        assert!(response.verify(verifier, Some(0)));
        assert!(!response.verify(verifier, Some(1)));
        assert!(!response.verify(verifier, None));
    }

    #[test]
    fn unknown_type_and_malformed_fields_are_distinguished() {
        assert_eq!(
            Message::from_wire(br#"{"type":"SHUTDOWN"}"#),
            Err(DecodeError::UnknownType("SHUTDOWN".into()))
        );
        assert!(matches!(
            Message::from_wire(br#"{"type":"INTRO","peer_id":"three"}"#),
            Err(DecodeError::MalformedField(_))
        ));
        assert!(matches!(
            Message::from_wire(br#"{"peer_id":3}"#),
            Err(DecodeError::MalformedField(_))
        ));
        assert!(matches!(
            Message::from_wire(b"not json"),
            Err(DecodeError::MalformedField(_))
        ));
        assert!(matches!(
            Message::from_wire(br#"{"type":"PUT","key":"k","secret":"%%%","client_id":1,"timestamp":2,"signature":""}"#),
            Err(DecodeError::MalformedField(_))
        ));
    }

    #[test]
    fn tampering_with_the_put_invalidates_the_accept() {
        let p = peers();
        let put = Put::signed("alice", b"s3cret".to_vec(), 1_000, p.client.signatures.as_ref());
        let accept = PutAccept::signed(put, p.server.signatures.as_ref());
        let verifier = p.other.signatures.as_ref();
        assert!(accept.verify(verifier));

        let mut forged = accept.clone();
        forged.put.secret = b"other".to_vec();
        assert!(!forged.verify(verifier));

        let mut forged = accept.clone();
        forged.put.timestamp += 1;
        assert!(!forged.verify(verifier));

        let mut forged = accept.clone();
        forged.put.key = "mallory".into();
        assert!(!forged.verify(verifier));
    }

    #[test]
    fn tampering_with_the_outer_layer_leaves_the_inner_put_valid() {
        let p = peers();
        let put = Put::signed("alice", b"s3cret".to_vec(), 1_000, p.client.signatures.as_ref());
        let mut accept = PutAccept::signed(put, p.server.signatures.as_ref());
        accept.sender_id = 1;

        let verifier = p.other.signatures.as_ref();
        assert!(!accept.verify(verifier));
        assert!(accept.put.verify(verifier));
    }

    #[test]
    fn replica_cannot_vouch_for_an_unsigned_put() {
        let p = peers();
        let unsigned = Put::with_signature("alice", b"x".to_vec(), 10, 1, Signature::from_bytes(vec![0; 64]));
        let accept = PutAccept::signed(unsigned, p.server.signatures.as_ref());
        assert!(!accept.verify(p.other.signatures.as_ref()));
    }

    #[test]
    fn decryption_share_chain_reaches_the_get() {
        let p = peers();
        let get = Get::signed("alice", 5, p.client.signatures.as_ref());
        let mut msg = DecryptionShare::signed(share(), get, p.server.signatures.as_ref());
        let verifier = p.other.signatures.as_ref();
        assert!(msg.verify(verifier));

        msg.get.key = "bob".into();
        assert!(!msg.verify(verifier));
    }

    #[test]
    fn timestamps_strictly_increase() {
        let a = next_timestamp();
        let b = next_timestamp();
        let c = next_timestamp();
        assert!(a < b && b < c);
    }
}
