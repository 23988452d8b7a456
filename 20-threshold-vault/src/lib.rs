//! Replicated threshold secret storage.
//!
//! A cluster of `N = 3f+1` replicas jointly holds secrets encrypted under a
//! threshold key: no single replica can decrypt, and any `k` decryption
//! shares reconstruct the plaintext. Clients PUT a secret once and GET it
//! back later. Every operation is final only after `2f+1` replicas agree, so
//! up to `f` replicas may be faulty or unreachable.
//!
//! # Architecture
//!
//! Each process runs one tokio event-loop task that owns all protocol state:
//!
//! - **Connection tasks** read and write framed messages, one pair per peer
//! - **The event loop** verifies each inbound message, routes it to the
//!   state machine for its request, and hands the resulting sends back to
//!   the connection manager
//! - **State machines** are plain synchronous structs that return the
//!   messages they want sent instead of touching sockets
//!
//! # Modules
//!
//! - [`framing`]: 4-byte length-prefixed frames over TCP
//! - [`connection`]: lazy per-peer links with an intro handshake
//! - [`message`]: message vocabulary, JSON codec, and signature chaining
//! - [`signature`] and [`threshold`]: the Ed25519 and BLS12-381 primitives
//! - [`machine`]: PUT, GET, and catch-up quorum state machines
//! - [`dispatcher`]: admission gate and routing to state machines
//! - [`replica`] and [`client`]: per-process runtimes
//! - [`gateway`]: enroll/login front end built on [`client`]
//! - [`config`], [`keys`], [`store`]: topology, key dealing, secrets store

pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod encoding;
pub mod framing;
pub mod gateway;
pub mod keys;
pub mod machine;
pub mod message;
pub mod replica;
pub mod signature;
pub mod store;
pub mod threshold;
