//! Per-request quorum state machines run by every replica.
//!
//! A machine never touches a socket. Each handler takes the replica's
//! [`ReplicaContext`] and returns the [`Outgoing`] messages the caller must
//! deliver, which keeps the machines synchronous and directly testable.
//!
//! Every machine moves `Fresh -> AwaitingQuorum -> Completed` and never
//! backwards. The side effect at quorum (store, or reconstruct and respond)
//! is guarded by a one-shot latch, so duplicate and late deliveries after
//! completion are absorbed silently.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::PeerId;
use crate::message::{
    CatchUpEntry, CatchUpRequest, CatchUpResponse, DecryptionShare, Get, GetResponse, Message,
    Put, PutAccept, PutComplete, Timestamp,
};
use crate::signature::SignatureService;
use crate::store::{SecretStore, StoredSecret};
use crate::threshold::{Ciphertext, Share, ThresholdEncryption};

/// A message a handler wants delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// To every server except ourselves.
    Broadcast(Message),
    Send { to: PeerId, message: Message },
}

/// Everything a machine may consult or mutate on behalf of its replica.
#[derive(Clone)]
pub struct ReplicaContext {
    pub id: PeerId,
    pub f: usize,
    pub signer: Arc<dyn SignatureService>,
    pub crypto: Arc<dyn ThresholdEncryption>,
    pub store: Arc<SecretStore>,
}

impl ReplicaContext {
    /// Distinct votes needed to act, `2f+1`, counting our own.
    pub fn quorum(&self) -> usize {
        2 * self.f + 1
    }

    /// Server ids are exactly `0..3f+1`; only they may vote.
    pub fn is_server(&self, id: PeerId) -> bool {
        (id as usize) < 3 * self.f + 1
    }
}

/// Lifecycle of one request instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No message handled yet, or a GET still waiting for its ciphertext.
    Fresh,
    /// Our own vote is out; collecting peers'.
    AwaitingQuorum,
    /// The quorum action has fired.
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationKind {
    Get,
    Put,
}

/// Identifies one request instance across every replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteKey {
    pub subject: String,
    pub timestamp: Timestamp,
    pub kind: OperationKind,
}

impl RouteKey {
    pub fn new(subject: impl Into<String>, timestamp: Timestamp, kind: OperationKind) -> Self {
        Self {
            subject: subject.into(),
            timestamp,
            kind,
        }
    }

    /// The instance a request-path message belongs to, if it belongs to one.
    pub fn of(message: &Message) -> Option<Self> {
        match message {
            Message::Put(put) => Some(Self::new(&put.key, put.timestamp, OperationKind::Put)),
            Message::PutAccept(accept) => Some(Self::new(
                &accept.put.key,
                accept.put.timestamp,
                OperationKind::Put,
            )),
            Message::Get(get) => Some(Self::new(&get.key, get.timestamp, OperationKind::Get)),
            Message::DecryptionShare(share) => Some(Self::new(
                &share.get.key,
                share.get.timestamp,
                OperationKind::Get,
            )),
            _ => None,
        }
    }
}

/// Replicates one client `Put` and stores it once `2f+1` servers accept.
pub struct PutStateMachine {
    put: Put,
    accepted: bool,
    acceptors: BTreeSet<PeerId>,
    completed: bool,
}

impl PutStateMachine {
    /// Creates a fresh machine for `put`; nothing is broadcast until the first
    /// message for it is handled.
    pub fn new(put: Put) -> Self {
        Self {
            put,
            accepted: false,
            acceptors: BTreeSet::new(),
            completed: false,
        }
    }

    /// The client request this instance replicates.
    pub fn put(&self) -> &Put {
        &self.put
    }

    pub fn phase(&self) -> Phase {
        match (self.accepted, self.completed) {
            (_, true) => Phase::Completed,
            (true, false) => Phase::AwaitingQuorum,
            (false, false) => Phase::Fresh,
        }
    }

    /// Distinct servers known to accept this put, ourselves included.
    pub fn acceptors(&self) -> &BTreeSet<PeerId> {
        &self.acceptors
    }

    /// Handles the client's `Put`. The first message of either kind makes us
    /// broadcast our own `PutAccept`.
    pub fn handle_put(&mut self, ctx: &ReplicaContext, put: &Put) -> Vec<Outgoing> {
        if put != &self.put {
            warn!(key = %put.key, timestamp = put.timestamp, "conflicting put for the same instance");
            return Vec::new();
        }
        self.advance(ctx, None)
    }

    /// Records a peer's `PutAccept`.
    ///
    /// Once `2f+1` distinct servers have accepted, the secret is encrypted and
    /// stored and a single `PutComplete` goes to the client. Accepts for a
    /// different put, or signed by a non-server, are dropped.
    pub fn handle_accept(&mut self, ctx: &ReplicaContext, accept: &PutAccept) -> Vec<Outgoing> {
        if accept.put != self.put {
            warn!(sender = accept.sender_id, key = %accept.put.key, "accept for a different put");
            return Vec::new();
        }
        if !ctx.is_server(accept.sender_id) {
            warn!(sender = accept.sender_id, "put accept from a non-server");
            return Vec::new();
        }
        self.advance(ctx, Some(accept.sender_id))
    }

    fn advance(&mut self, ctx: &ReplicaContext, sender: Option<PeerId>) -> Vec<Outgoing> {
        let mut out = Vec::new();
        if !self.accepted {
            self.accepted = true;
            self.acceptors.insert(ctx.id);
            out.push(Outgoing::Broadcast(Message::PutAccept(PutAccept::signed(
                self.put.clone(),
                ctx.signer.as_ref(),
            ))));
        }
        if let Some(sender) = sender {
            if !self.acceptors.insert(sender) {
                debug!(sender, key = %self.put.key, "duplicate put accept");
            }
        }

        if self.completed || self.acceptors.len() < ctx.quorum() {
            return out;
        }
        self.completed = true;

        match ctx.crypto.encrypt(&self.put.secret) {
            Ok(ciphertext) => {
                ctx.store.put(
                    self.put.key.clone(),
                    StoredSecret {
                        ciphertext,
                        client_id: self.put.client_id,
                        timestamp: self.put.timestamp,
                    },
                );
                info!(
                    key = %self.put.key,
                    client = self.put.client_id,
                    timestamp = self.put.timestamp,
                    acceptors = self.acceptors.len(),
                    "put reached quorum"
                );
                out.push(Outgoing::Send {
                    to: self.put.client_id,
                    message: Message::PutComplete(PutComplete::signed(
                        self.put.clone(),
                        ctx.signer.as_ref(),
                    )),
                });
            }
            Err(err) => warn!(key = %self.put.key, error = %err, "failed to encrypt secret"),
        }
        out
    }
}

/// Collects decryption shares for one client `Get` and answers once `2f+1`
/// servers have contributed.
pub struct GetStateMachine {
    get: Get,
    ciphertext: Option<Ciphertext>,
    /// Shares in arrival order, at most one per sender.
    shares: Vec<(PeerId, Share)>,
    shared: bool,
    responded: bool,
}

impl GetStateMachine {
    /// Creates a fresh machine for `get`.
    pub fn new(get: Get) -> Self {
        Self {
            get,
            ciphertext: None,
            shares: Vec::new(),
            shared: false,
            responded: false,
        }
    }

    /// The client request this instance answers.
    pub fn get(&self) -> &Get {
        &self.get
    }

    pub fn phase(&self) -> Phase {
        match (self.shared, self.responded) {
            (_, true) => Phase::Completed,
            (true, false) => Phase::AwaitingQuorum,
            (false, false) => Phase::Fresh,
        }
    }

    /// Senders of the recorded shares, in arrival order.
    pub fn share_senders(&self) -> Vec<PeerId> {
        self.shares.iter().map(|(id, _)| *id).collect()
    }

    /// The share recorded for `sender`, which is always the first one it sent.
    pub fn share_of(&self, sender: PeerId) -> Option<&Share> {
        self.shares
            .iter()
            .find(|(id, _)| *id == sender)
            .map(|(_, share)| share)
    }

    /// Handles the client's `Get`: computes and broadcasts our own share if the
    /// ciphertext is stored locally.
    pub fn handle_get(&mut self, ctx: &ReplicaContext, get: &Get) -> Vec<Outgoing> {
        if get != &self.get {
            warn!(key = %get.key, timestamp = get.timestamp, "conflicting get for the same instance");
            return Vec::new();
        }
        self.advance(ctx)
    }

    /// Records a peer's decryption share, at most one per sender.
    ///
    /// With shares from `2f+1` distinct servers the secret is reconstructed
    /// and sent to the client exactly once. A second, different share from a
    /// sender that already contributed is ignored.
    pub fn handle_share(&mut self, ctx: &ReplicaContext, share: &DecryptionShare) -> Vec<Outgoing> {
        if share.get != self.get {
            warn!(sender = share.sender_id, key = %share.get.key, "share for a different get");
            return Vec::new();
        }
        if !ctx.is_server(share.sender_id) {
            warn!(sender = share.sender_id, "decryption share from a non-server");
            return Vec::new();
        }
        self.record(share.sender_id, share.share.clone());
        self.advance(ctx)
    }

    fn record(&mut self, sender: PeerId, share: Share) {
        if self.shares.iter().any(|(id, _)| *id == sender) {
            debug!(sender, key = %self.get.key, "duplicate decryption share");
            return;
        }
        self.shares.push((sender, share));
    }

    fn advance(&mut self, ctx: &ReplicaContext) -> Vec<Outgoing> {
        let mut out = Vec::new();
        if !self.shared {
            // Stays fresh until the ciphertext exists locally; any later message retries.
            let Ok(stored) = ctx.store.get(&self.get.key) else {
                debug!(key = %self.get.key, "no ciphertext stored yet");
                return out;
            };
            match ctx.crypto.decrypt_share(&stored.ciphertext) {
                Ok(own) => {
                    self.shared = true;
                    self.ciphertext = Some(stored.ciphertext);
                    self.record(ctx.id, own.clone());
                    out.push(Outgoing::Broadcast(Message::DecryptionShare(
                        DecryptionShare::signed(own, self.get.clone(), ctx.signer.as_ref()),
                    )));
                }
                Err(err) => {
                    warn!(key = %self.get.key, error = %err, "failed to compute decryption share");
                    return out;
                }
            }
        }

        if self.responded || self.shares.len() < ctx.quorum() {
            return out;
        }
        let Some(ciphertext) = &self.ciphertext else {
            return out;
        };
        match combine(ctx.crypto.as_ref(), ciphertext, &self.shares) {
            Some(secret) => {
                self.responded = true;
                info!(
                    key = %self.get.key,
                    client = self.get.client_id,
                    shares = self.shares.len(),
                    "get reached quorum"
                );
                out.push(Outgoing::Send {
                    to: self.get.client_id,
                    message: Message::GetResponse(GetResponse::signed(
                        self.get.clone(),
                        secret,
                        ctx.signer.as_ref(),
                    )),
                });
            }
            None => warn!(
                key = %self.get.key,
                shares = self.shares.len(),
                "no subset of shares reconstructs the secret yet"
            ),
        }
        out
    }
}

/// Combines the first `k` shares in arrival order, falling back to other
/// `k`-subsets when a faulty share spoils the first attempt.
fn combine(
    crypto: &dyn ThresholdEncryption,
    ciphertext: &Ciphertext,
    shares: &[(PeerId, Share)],
) -> Option<Vec<u8>> {
    let k = crypto.threshold();
    if shares.len() < k {
        return None;
    }
    let mut indices: Vec<usize> = (0..k).collect();
    loop {
        let ids: Vec<PeerId> = indices.iter().map(|&i| shares[i].0).collect();
        let subset: Vec<Share> = indices.iter().map(|&i| shares[i].1.clone()).collect();
        match crypto.combine_shares(ciphertext, &subset, &ids) {
            Ok(secret) => return Some(secret),
            Err(err) => debug!(?ids, error = %err, "share subset failed to combine"),
        }
        if !next_combination(&mut indices, shares.len()) {
            return None;
        }
    }
}

/// Advances `indices` to the next `k`-combination of `0..n` in lexicographic order.
fn next_combination(indices: &mut [usize], n: usize) -> bool {
    let k = indices.len();
    let Some(pos) = (0..k).rev().find(|&i| indices[i] < n - k + i) else {
        return false;
    };
    indices[pos] += 1;
    for i in pos + 1..k {
        indices[i] = indices[i - 1] + 1;
    }
    true
}

/// Resynchronizes a replica's store from its peers after a restart.
///
/// One round collects responses from `2f+1` distinct servers (our own empty
/// answer included) and applies every entry that at least `f+1` of them
/// reported identically, so a single faulty replica cannot inject data.
#[derive(Default)]
pub struct CatchUpStateMachine {
    active: bool,
    responses: BTreeMap<PeerId, Vec<CatchUpEntry>>,
}

impl CatchUpStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Opens a new round and returns the `CatchUpRequest` to broadcast.
    ///
    /// Any responses from an earlier unfinished round are discarded.
    pub fn start(&mut self, ctx: &ReplicaContext) -> Vec<Outgoing> {
        self.active = true;
        self.responses.clear();
        self.responses.insert(ctx.id, Vec::new());
        let known: Vec<(PeerId, Timestamp)> = ctx.store.latest_timestamps().into_iter().collect();
        info!(clients = known.len(), "starting catch-up round");
        vec![Outgoing::Broadcast(Message::CatchUpRequest(CatchUpRequest::signed(
            known,
            ctx.signer.as_ref(),
        )))]
    }

    /// Replies with every entry newer than the requester's watermarks.
    pub fn answer(&self, ctx: &ReplicaContext, request: &CatchUpRequest) -> Vec<Outgoing> {
        if !ctx.is_server(request.sender_id) || request.sender_id == ctx.id {
            return Vec::new();
        }
        let known: BTreeMap<PeerId, Timestamp> = request.known_timestamps.iter().copied().collect();
        let entries = ctx.store.select_newer(&known);
        debug!(to = request.sender_id, entries = entries.len(), "answering catch-up request");
        vec![Outgoing::Send {
            to: request.sender_id,
            message: Message::CatchUpResponse(CatchUpResponse::signed(
                entries,
                ctx.signer.as_ref(),
            )),
        }]
    }

    /// Records one response; returns how many entries were applied when the round completes.
    pub fn handle_response(
        &mut self,
        ctx: &ReplicaContext,
        response: &CatchUpResponse,
    ) -> Option<usize> {
        if !self.active || !ctx.is_server(response.sender_id) {
            return None;
        }
        if self.responses.contains_key(&response.sender_id) {
            debug!(sender = response.sender_id, "duplicate catch-up response");
            return None;
        }
        self.responses
            .insert(response.sender_id, response.entries.clone());
        if self.responses.len() < ctx.quorum() {
            return None;
        }

        let mut votes: HashMap<&CatchUpEntry, BTreeSet<PeerId>> = HashMap::new();
        for (&sender, entries) in &self.responses {
            for entry in entries {
                votes.entry(entry).or_default().insert(sender);
            }
        }
        let mut agreed: Vec<&CatchUpEntry> = votes
            .into_iter()
            .filter(|(_, senders)| senders.len() > ctx.f)
            .map(|(entry, _)| entry)
            .collect();
        agreed.sort_by_key(|entry| entry.timestamp);

        let mut applied = 0;
        for entry in agreed {
            let stored = ctx.store.put(
                entry.key.clone(),
                StoredSecret {
                    ciphertext: entry.ciphertext.clone(),
                    client_id: entry.client_id,
                    timestamp: entry.timestamp,
                },
            );
            if stored {
                applied += 1;
            }
        }

        info!(
            responders = self.responses.len(),
            applied, "catch-up round complete"
        );
        self.active = false;
        self.responses.clear();
        Some(applied)
    }
}
