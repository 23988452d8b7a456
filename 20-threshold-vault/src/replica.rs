//! Replica runtime: one event-loop task per server.
//!
//! The loop task owns the [`Dispatcher`] and with it every state machine.
//! Inbound frames from the [`ConnectionManager`], control requests from the
//! [`ReplicaHandle`], and the retention sweep timer all arrive through one
//! `select!`, so each message is handled to completion before the next one
//! and no machine needs a lock.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ClusterConfig, PeerId};
use crate::connection::{ConnectionManager, DEFAULT_INTRO_TIMEOUT, InboundFrame};
use crate::dispatcher::{Dispatcher, RetentionPolicy};
use crate::keys;
use crate::machine::{Outgoing, ReplicaContext};
use crate::message;
use crate::store::{SecretStore, StoredSecret};

/// How often the retention policy is applied.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Everything needed to start one replica.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    pub id: PeerId,
    pub cluster: ClusterConfig,
    pub retention: RetentionPolicy,
    pub intro_timeout: Duration,
    pub sweep_interval: Duration,
    /// Broadcast a catch-up request as soon as the replica is up.
    pub catch_up_on_start: bool,
}

impl ReplicaConfig {
    /// Defaults: keep every instance, 5 s intro timeout, 30 s sweeps, no catch-up on start.
    pub fn new(id: PeerId, cluster: ClusterConfig) -> Self {
        Self {
            id,
            cluster,
            retention: RetentionPolicy::default(),
            intro_timeout: DEFAULT_INTRO_TIMEOUT,
            sweep_interval: SWEEP_INTERVAL,
            catch_up_on_start: false,
        }
    }
}

/// Snapshot of a replica's state, as returned by [`ReplicaHandle::status`].
#[derive(Debug, Clone)]
pub struct ReplicaStatus {
    pub id: PeerId,
    pub instances: usize,
    pub catch_up_active: bool,
    pub store: BTreeMap<String, StoredSecret>,
}

enum ReplicaRequest {
    Status {
        respond_to: oneshot::Sender<ReplicaStatus>,
    },
    CatchUp {
        respond_to: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Handle for controlling a running replica.
pub struct ReplicaHandle {
    id: PeerId,
    local_addr: SocketAddr,
    request_tx: mpsc::UnboundedSender<ReplicaRequest>,
    task: JoinHandle<()>,
}

impl ReplicaHandle {
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// The address the replica actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn status(&self) -> Result<ReplicaStatus> {
        let (respond_to, rx) = oneshot::channel();
        self.request_tx
            .send(ReplicaRequest::Status { respond_to })
            .map_err(|_| anyhow!("replica {} has stopped", self.id))?;
        rx.await.context("status response channel closed")
    }

    /// Starts a catch-up round; returns once the request has been broadcast.
    pub async fn catch_up(&self) -> Result<()> {
        let (respond_to, rx) = oneshot::channel();
        self.request_tx
            .send(ReplicaRequest::CatchUp { respond_to })
            .map_err(|_| anyhow!("replica {} has stopped", self.id))?;
        rx.await.context("catch-up response channel closed")
    }

    /// Stops the event loop and closes every connection.
    pub async fn shutdown(self) -> Result<()> {
        // An error means the loop already exited.
        let _ = self.request_tx.send(ReplicaRequest::Shutdown);
        self.task.await.context("replica task panicked")
    }
}

/// Deals this replica's keys, binds its port, and starts its event loop.
pub async fn spawn_replica(config: ReplicaConfig) -> Result<ReplicaHandle> {
    let ReplicaConfig {
        id,
        cluster,
        retention,
        intro_timeout,
        sweep_interval,
        catch_up_on_start,
    } = config;

    if !cluster.peer(id)?.is_server {
        return Err(anyhow!("peer {id} is not configured as a server"));
    }
    let material = keys::deal(&cluster, id)?;
    let crypto = material
        .threshold
        .ok_or_else(|| anyhow!("server {id} was dealt no threshold share"))?;
    let ctx = ReplicaContext {
        id,
        f: cluster.f,
        signer: material.signatures,
        crypto,
        store: Arc::new(SecretStore::new()),
    };
    let mut dispatcher = Dispatcher::new(ctx, retention);

    let (connections, inbound) = ConnectionManager::new(id, &cluster, intro_timeout);
    let local_addr = connections.listen().await?;
    connections.connect_lower_ports();

    if catch_up_on_start {
        deliver(&connections, dispatcher.start_catch_up());
    }

    let (request_tx, requests) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(dispatcher, connections, inbound, requests, sweep_interval));
    info!(id, %local_addr, n = cluster.n(), f = cluster.f, k = cluster.threshold, "replica started");

    Ok(ReplicaHandle {
        id,
        local_addr,
        request_tx,
        task,
    })
}

async fn run(
    mut dispatcher: Dispatcher,
    connections: ConnectionManager,
    mut inbound: mpsc::UnboundedReceiver<InboundFrame>,
    mut requests: mpsc::UnboundedReceiver<ReplicaRequest>,
    sweep_interval: Duration,
) {
    let mut sweep = tokio::time::interval(sweep_interval);
    loop {
        tokio::select! {
            Some(frame) = inbound.recv() => {
                let outgoing = dispatcher.on_message(Some(frame.from), &frame.payload);
                deliver(&connections, outgoing);
            }
            request = requests.recv() => match request {
                Some(ReplicaRequest::Status { respond_to }) => {
                    let ctx = dispatcher.context();
                    let status = ReplicaStatus {
                        id: ctx.id,
                        instances: dispatcher.instance_count(),
                        catch_up_active: dispatcher.catch_up_active(),
                        store: ctx.store.snapshot(),
                    };
                    let _ = respond_to.send(status);
                }
                Some(ReplicaRequest::CatchUp { respond_to }) => {
                    deliver(&connections, dispatcher.start_catch_up());
                    let _ = respond_to.send(());
                }
                Some(ReplicaRequest::Shutdown) | None => break,
            },
            _ = sweep.tick() => {
                dispatcher.sweep(message::now());
            }
        }
    }
    info!(id = dispatcher.context().id, "replica shutting down");
    connections.shutdown();
}

fn deliver(connections: &ConnectionManager, outgoing: Vec<Outgoing>) {
    for out in outgoing {
        match out {
            Outgoing::Broadcast(message) => {
                debug!(kind = message.type_name(), "broadcast");
                connections.broadcast(&message);
            }
            Outgoing::Send { to, message } => {
                debug!(to, kind = message.type_name(), "send");
                if let Err(err) = connections.send(to, &message) {
                    warn!(to, error = %err, "failed to send");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clients_cannot_run_as_replicas() {
        let cluster = ClusterConfig::local(1, 2, 19_500, &[10]).expect("local cluster");
        let err = spawn_replica(ReplicaConfig::new(10, cluster))
            .await
            .err()
            .expect("client id must be refused");
        assert!(err.to_string().contains("not configured as a server"));
    }

    #[tokio::test]
    async fn status_reports_an_empty_replica() -> Result<()> {
        let cluster = ClusterConfig::local(1, 2, 19_520, &[])?;
        let replica = spawn_replica(ReplicaConfig::new(0, cluster)).await?;
        let status = replica.status().await?;
        assert_eq!(status.id, 0);
        assert_eq!(status.instances, 0);
        assert!(status.store.is_empty());

        replica.catch_up().await?;
        assert!(replica.status().await?.catch_up_active);
        replica.shutdown().await
    }
}
