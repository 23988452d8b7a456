//! Client side of the protocol.
//!
//! A [`Client`] sends signed `Put`/`Get` requests to every server and waits
//! for `2f+1` agreeing answers. Like a replica, it runs a single loop task
//! that owns every pending request; callers talk to it over channels and
//! await a oneshot reply.
//!
//! Clients also receive `LOGIN`/`ENROLL` requests when they act as a
//! gateway (see [`crate::gateway`]), and can send such requests to a
//! gateway when they act as an end user.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ClusterConfig, PeerId};
use crate::connection::{ConnectionManager, DEFAULT_INTRO_TIMEOUT, InboundFrame};
use crate::keys;
use crate::machine::{OperationKind, RouteKey};
use crate::message::{
    EnrollRequest, EnrollResponse, Get, GetResponse, LoginRequest, LoginResponse, Message, Put,
    PutComplete, Timestamp, next_timestamp,
};
use crate::signature::SignatureService;

/// Waits for `2f+1` distinct servers to confirm one `Put`.
pub struct ClientPutStateMachine {
    put: Put,
    f: usize,
    confirmations: BTreeSet<PeerId>,
    done: bool,
}

impl ClientPutStateMachine {
    /// Tracks `put` in a cluster tolerating `f` faults.
    pub fn new(put: Put, f: usize) -> Self {
        Self {
            put,
            f,
            confirmations: BTreeSet::new(),
            done: false,
        }
    }

    pub fn route(&self) -> RouteKey {
        RouteKey::new(&self.put.key, self.put.timestamp, OperationKind::Put)
    }

    /// Returns `true` exactly once, on the confirmation that reaches quorum.
    pub fn handle_complete(&mut self, complete: &PutComplete) -> bool {
        if self.done || complete.put != self.put || !is_server(self.f, complete.sender_id) {
            return false;
        }
        self.confirmations.insert(complete.sender_id);
        if self.confirmations.len() >= 2 * self.f + 1 {
            self.done = true;
            return true;
        }
        false
    }
}

/// Waits for `2f+1` distinct servers to return the same secret for one `Get`.
pub struct ClientGetStateMachine {
    get: Get,
    f: usize,
    responses: BTreeMap<PeerId, Vec<u8>>,
    done: bool,
}

impl ClientGetStateMachine {
    /// Tracks `get` in a cluster tolerating `f` faults.
    pub fn new(get: Get, f: usize) -> Self {
        Self {
            get,
            f,
            responses: BTreeMap::new(),
            done: false,
        }
    }

    pub fn route(&self) -> RouteKey {
        RouteKey::new(&self.get.key, self.get.timestamp, OperationKind::Get)
    }

    /// Returns the secret exactly once, when `2f+1` servers agree on it.
    pub fn handle_response(&mut self, response: &GetResponse) -> Option<Vec<u8>> {
        if self.done || response.get != self.get || !is_server(self.f, response.sender_id) {
            return None;
        }
        if self.responses.contains_key(&response.sender_id) {
            return None;
        }
        self.responses
            .insert(response.sender_id, response.secret.clone());
        let agreeing = self
            .responses
            .values()
            .filter(|secret| **secret == response.secret)
            .count();
        if agreeing >= 2 * self.f + 1 {
            self.done = true;
            return Some(response.secret.clone());
        }
        None
    }
}

fn is_server(f: usize, id: PeerId) -> bool {
    (id as usize) < 3 * f + 1
}

/// A verified end-user request delivered to a gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserRequest {
    Enroll(EnrollRequest),
    Login(LoginRequest),
}

enum Command {
    Put {
        machine: ClientPutStateMachine,
        respond_to: oneshot::Sender<()>,
    },
    Get {
        machine: ClientGetStateMachine,
        respond_to: oneshot::Sender<Vec<u8>>,
    },
    Gateway {
        gateway: PeerId,
        username: String,
        timestamp: Timestamp,
        respond_to: oneshot::Sender<Message>,
    },
}

type GatewayKey = (PeerId, String, Timestamp);

#[derive(Default)]
struct Pending {
    puts: HashMap<RouteKey, (ClientPutStateMachine, oneshot::Sender<()>)>,
    gets: HashMap<RouteKey, (ClientGetStateMachine, oneshot::Sender<Vec<u8>>)>,
    gateway: HashMap<GatewayKey, oneshot::Sender<Message>>,
}

impl Pending {
    /// Forgets requests whose caller gave up waiting.
    fn prune(&mut self) {
        self.puts.retain(|_, (_, tx)| !tx.is_closed());
        self.gets.retain(|_, (_, tx)| !tx.is_closed());
        self.gateway.retain(|_, tx| !tx.is_closed());
    }
}

pub struct Client {
    id: PeerId,
    f: usize,
    signer: Arc<dyn SignatureService>,
    connections: ConnectionManager,
    commands: mpsc::UnboundedSender<Command>,
    user_requests: Option<mpsc::UnboundedReceiver<UserRequest>>,
    task: JoinHandle<()>,
}

impl Client {
    /// Starts a client peer: deals its keys, binds its port, and spawns its loop.
    pub async fn connect(cluster: &ClusterConfig, id: PeerId) -> Result<Self> {
        if cluster.peer(id)?.is_server {
            return Err(anyhow!("peer {id} is a server, not a client"));
        }
        let material = keys::deal(cluster, id)?;
        let (connections, inbound) = ConnectionManager::new(id, cluster, DEFAULT_INTRO_TIMEOUT);
        connections.listen().await?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (user_tx, user_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(
            Arc::clone(&material.signatures),
            inbound,
            command_rx,
            user_tx,
        ));
        info!(id, "client started");

        Ok(Self {
            id,
            f: cluster.f,
            signer: material.signatures,
            connections,
            commands,
            user_requests: Some(user_rx),
            task,
        })
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Signs as this client; the gateway uses it for its responses.
    pub fn signer(&self) -> &dyn SignatureService {
        self.signer.as_ref()
    }

    /// Takes the stream of verified end-user requests; only the first call returns it.
    pub fn take_user_requests(&mut self) -> Option<mpsc::UnboundedReceiver<UserRequest>> {
        self.user_requests.take()
    }

    /// Sends an arbitrary message to one peer.
    pub fn send(&self, to: PeerId, message: &Message) -> Result<()> {
        self.connections.send(to, message)?;
        Ok(())
    }

    /// Stores `secret` under `key`; resolves once `2f+1` servers confirm.
    pub async fn put(&self, key: &str, secret: Vec<u8>, timeout: Duration) -> Result<()> {
        let put = Put::signed(key, secret, next_timestamp(), self.signer.as_ref());
        let (respond_to, rx) = oneshot::channel();
        self.command(Command::Put {
            machine: ClientPutStateMachine::new(put.clone(), self.f),
            respond_to,
        })?;
        self.connections.broadcast(&Message::Put(put));

        tokio::time::timeout(timeout, rx)
            .await
            .with_context(|| format!("put {key:?} timed out after {timeout:?}"))?
            .context("client loop stopped")
    }

    /// Fetches the secret under `key`; resolves once `2f+1` servers agree on it.
    pub async fn get(&self, key: &str, timeout: Duration) -> Result<Vec<u8>> {
        let get = Get::signed(key, next_timestamp(), self.signer.as_ref());
        let (respond_to, rx) = oneshot::channel();
        self.command(Command::Get {
            machine: ClientGetStateMachine::new(get.clone(), self.f),
            respond_to,
        })?;
        self.connections.broadcast(&Message::Get(get));

        tokio::time::timeout(timeout, rx)
            .await
            .with_context(|| format!("get {key:?} timed out after {timeout:?}"))?
            .context("client loop stopped")
    }

    /// Asks `gateway` to enroll `username` with `password`.
    pub async fn enroll(
        &self,
        gateway: PeerId,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> Result<EnrollResponse> {
        let request = EnrollRequest::signed(username, password, next_timestamp(), self.signer.as_ref());
        let timestamp = request.timestamp;
        match self
            .gateway_round_trip(gateway, username, timestamp, Message::EnrollRequest(request), timeout)
            .await?
        {
            Message::EnrollResponse(response) => Ok(response),
            other => Err(anyhow!("gateway answered enroll with {}", other.type_name())),
        }
    }

    /// Asks `gateway` to log `username` in; the PAKE payload is passed through opaquely.
    pub async fn login(
        &self,
        gateway: PeerId,
        username: &str,
        pake_message: Vec<u8>,
        timeout: Duration,
    ) -> Result<LoginResponse> {
        let request =
            LoginRequest::signed(username, pake_message, next_timestamp(), self.signer.as_ref());
        let timestamp = request.timestamp;
        match self
            .gateway_round_trip(gateway, username, timestamp, Message::LoginRequest(request), timeout)
            .await?
        {
            Message::LoginResponse(response) => Ok(response),
            other => Err(anyhow!("gateway answered login with {}", other.type_name())),
        }
    }

    async fn gateway_round_trip(
        &self,
        gateway: PeerId,
        username: &str,
        timestamp: Timestamp,
        request: Message,
        timeout: Duration,
    ) -> Result<Message> {
        let (respond_to, rx) = oneshot::channel();
        self.command(Command::Gateway {
            gateway,
            username: username.to_string(),
            timestamp,
            respond_to,
        })?;
        self.send(gateway, &request)?;

        tokio::time::timeout(timeout, rx)
            .await
            .with_context(|| format!("gateway {gateway} did not answer within {timeout:?}"))?
            .context("client loop stopped")
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("client {} has stopped", self.id))
    }

    pub async fn shutdown(self) -> Result<()> {
        let Client {
            commands,
            connections,
            task,
            ..
        } = self;
        drop(commands);
        task.await.context("client task panicked")?;
        connections.shutdown();
        Ok(())
    }
}

async fn run(
    signer: Arc<dyn SignatureService>,
    mut inbound: mpsc::UnboundedReceiver<InboundFrame>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    user_requests: mpsc::UnboundedSender<UserRequest>,
) {
    let mut pending = Pending::default();
    loop {
        tokio::select! {
            // Commands first: a request is always registered before its answers are read.
            biased;
            command = commands.recv() => match command {
                Some(command) => register(&mut pending, command),
                None => break,
            },
            Some(frame) = inbound.recv() => {
                pending.prune();
                on_frame(signer.as_ref(), &mut pending, &user_requests, frame);
            }
        }
    }
}

fn register(pending: &mut Pending, command: Command) {
    match command {
        Command::Put {
            machine,
            respond_to,
        } => {
            pending.puts.insert(machine.route(), (machine, respond_to));
        }
        Command::Get {
            machine,
            respond_to,
        } => {
            pending.gets.insert(machine.route(), (machine, respond_to));
        }
        Command::Gateway {
            gateway,
            username,
            timestamp,
            respond_to,
        } => {
            pending.gateway.insert((gateway, username, timestamp), respond_to);
        }
    }
}

fn on_frame(
    signer: &dyn SignatureService,
    pending: &mut Pending,
    user_requests: &mpsc::UnboundedSender<UserRequest>,
    frame: InboundFrame,
) {
    let message = match Message::from_wire(&frame.payload) {
        Ok(message) => message,
        Err(err) => {
            warn!(from = frame.from, error = %err, "dropping undecodable frame");
            return;
        }
    };
    if !message.verify(signer, Some(frame.from)) {
        warn!(from = frame.from, kind = message.type_name(), "dropping message with invalid signature");
        return;
    }

    match message {
        Message::PutComplete(complete) => {
            let route = RouteKey::new(&complete.put.key, complete.put.timestamp, OperationKind::Put);
            let Some((machine, _)) = pending.puts.get_mut(&route) else {
                debug!(key = %complete.put.key, "completion for no pending put");
                return;
            };
            if machine.handle_complete(&complete) {
                if let Some((_, respond_to)) = pending.puts.remove(&route) {
                    let _ = respond_to.send(());
                }
            }
        }
        Message::GetResponse(response) => {
            let route = RouteKey::new(&response.get.key, response.get.timestamp, OperationKind::Get);
            let Some((machine, _)) = pending.gets.get_mut(&route) else {
                debug!(key = %response.get.key, "response for no pending get");
                return;
            };
            if let Some(secret) = machine.handle_response(&response) {
                if let Some((_, respond_to)) = pending.gets.remove(&route) {
                    let _ = respond_to.send(secret);
                }
            }
        }
        Message::EnrollResponse(ref response) => {
            let key = (frame.from, response.username.clone(), response.timestamp);
            if let Some(respond_to) = pending.gateway.remove(&key) {
                let _ = respond_to.send(message);
            }
        }
        Message::LoginResponse(ref response) => {
            let key = (frame.from, response.username.clone(), response.timestamp);
            if let Some(respond_to) = pending.gateway.remove(&key) {
                let _ = respond_to.send(message);
            }
        }
        Message::EnrollRequest(request) => {
            if user_requests.send(UserRequest::Enroll(request)).is_err() {
                debug!("no gateway listening for enroll requests");
            }
        }
        Message::LoginRequest(request) => {
            if user_requests.send(UserRequest::Login(request)).is_err() {
                debug!("no gateway listening for login requests");
            }
        }
        other => debug!(from = frame.from, kind = other.type_name(), "clients ignore this message kind"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::tests::{CLIENT, Fixture};

    #[test]
    fn put_needs_quorum_of_distinct_servers() {
        let fx = Fixture::new();
        let put = fx.put("alice", b"pw", 10);
        let mut machine = ClientPutStateMachine::new(put.clone(), 2);
        let complete = |id: usize| PutComplete::signed(put.clone(), fx.replicas[id].signer.as_ref());

        for id in [0, 1, 2, 3] {
            assert!(!machine.handle_complete(&complete(id)));
        }
        assert!(!machine.handle_complete(&complete(3)), "duplicate");
        assert!(machine.handle_complete(&complete(4)));
        assert!(!machine.handle_complete(&complete(5)), "fires once");
    }

    #[test]
    fn put_ignores_confirmations_from_clients() {
        let fx = Fixture::new();
        let put = fx.put("alice", b"pw", 10);
        let mut machine = ClientPutStateMachine::new(put.clone(), 0);
        let forged = PutComplete::signed(put, fx.client.signatures.as_ref());
        assert_eq!(forged.sender_id, CLIENT);
        assert!(!machine.handle_complete(&forged));
    }

    #[test]
    fn get_needs_quorum_of_identical_secrets() {
        let fx = Fixture::new();
        let get = fx.get("alice", 10);
        let mut machine = ClientGetStateMachine::new(get.clone(), 2);
        let respond = |id: usize, secret: &[u8]| {
            GetResponse::signed(get.clone(), secret.to_vec(), fx.replicas[id].signer.as_ref())
        };

        assert_eq!(machine.handle_response(&respond(0, b"right")), None);
        assert_eq!(machine.handle_response(&respond(1, b"wrong")), None);
        assert_eq!(machine.handle_response(&respond(2, b"right")), None);
        assert_eq!(machine.handle_response(&respond(3, b"right")), None);
        assert_eq!(machine.handle_response(&respond(3, b"right")), None, "duplicate");
        assert_eq!(machine.handle_response(&respond(4, b"wrong")), None);
        assert_eq!(machine.handle_response(&respond(5, b"right")), None);
        assert_eq!(
            machine.handle_response(&respond(6, b"right")),
            Some(b"right".to_vec())
        );
    }
}
