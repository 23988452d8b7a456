//! Routes verified messages to the state machine that owns them.
//!
//! The dispatcher is the only admission gate: frames that fail to decode or
//! whose signature chain does not verify are dropped here, with nothing sent
//! back, before any machine sees them.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::PeerId;
use crate::machine::{
    CatchUpStateMachine, GetStateMachine, Outgoing, Phase, PutStateMachine, ReplicaContext,
    RouteKey,
};
use crate::message::{Message, Timestamp};

/// How long finished and abandoned request instances are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Never evict. Memory grows with the number of requests served.
    #[default]
    KeepAll,
    /// Evict instances whose request timestamp is older than `now - age`, and
    /// drop late messages for them instead of recreating the instance.
    MaxAge(Duration),
}

impl RetentionPolicy {
    fn watermark(self, now: Timestamp) -> Option<Timestamp> {
        match self {
            RetentionPolicy::KeepAll => None,
            RetentionPolicy::MaxAge(age) => Some(now.saturating_sub(age.as_micros() as u64)),
        }
    }
}

/// The machine behind one [`RouteKey`].
pub enum RequestMachine {
    Put(PutStateMachine),
    Get(GetStateMachine),
}

impl RequestMachine {
    pub fn phase(&self) -> Phase {
        match self {
            RequestMachine::Put(machine) => machine.phase(),
            RequestMachine::Get(machine) => machine.phase(),
        }
    }
}

/// Owns every request instance of one replica.
///
/// Instances are created lazily by whichever message for them arrives first,
/// which may be a peer's `PutAccept` or `DecryptionShare` rather than the
/// client's request; the embedded request seeds the machine either way.
///
/// # Why one owner
///
/// The replica event loop is the only caller, so the map and every machine in
/// it are mutated without locks and each message is handled to completion
/// before the next.
pub struct Dispatcher {
    ctx: ReplicaContext,
    machines: HashMap<RouteKey, RequestMachine>,
    catch_up: CatchUpStateMachine,
    retention: RetentionPolicy,
    /// Requests older than this are dropped; advanced by [`Dispatcher::sweep`].
    watermark: Timestamp,
}

impl Dispatcher {
    /// Creates a dispatcher with no instances and an idle catch-up machine.
    pub fn new(ctx: ReplicaContext, retention: RetentionPolicy) -> Self {
        Self {
            ctx,
            machines: HashMap::new(),
            catch_up: CatchUpStateMachine::new(),
            retention,
            watermark: 0,
        }
    }

    pub fn context(&self) -> &ReplicaContext {
        &self.ctx
    }

    /// Decodes, verifies, and routes one frame from `origin`.
    pub fn on_message(&mut self, origin: Option<PeerId>, raw: &[u8]) -> Vec<Outgoing> {
        let message = match Message::from_wire(raw) {
            Ok(message) => message,
            Err(err) => {
                warn!(?origin, error = %err, "dropping undecodable frame");
                return Vec::new();
            }
        };
        if !message.verify(self.ctx.signer.as_ref(), origin) {
            warn!(?origin, kind = message.type_name(), "dropping message with invalid signature");
            return Vec::new();
        }
        self.handle(message)
    }

    /// Routes an already verified message.
    pub fn handle(&mut self, message: Message) -> Vec<Outgoing> {
        if let Some(route) = RouteKey::of(&message) {
            if route.timestamp < self.watermark {
                debug!(key = %route.subject, timestamp = route.timestamp, "dropping expired request");
                return Vec::new();
            }
            return self.route(route, message);
        }

        match message {
            Message::CatchUpRequest(request) => self.catch_up.answer(&self.ctx, &request),
            Message::CatchUpResponse(response) => {
                if let Some(applied) = self.catch_up.handle_response(&self.ctx, &response) {
                    debug!(applied, "catch-up applied entries");
                }
                Vec::new()
            }
            Message::Intro(intro) => {
                debug!(peer = intro.peer_id, "ignoring intro outside a handshake");
                Vec::new()
            }
            other => {
                debug!(kind = other.type_name(), "replicas do not handle this message kind");
                Vec::new()
            }
        }
    }

    fn route(&mut self, route: RouteKey, message: Message) -> Vec<Outgoing> {
        let ctx = &self.ctx;
        match message {
            Message::Put(put) => {
                let machine = self
                    .machines
                    .entry(route)
                    .or_insert_with(|| RequestMachine::Put(PutStateMachine::new(put.clone())));
                match machine {
                    RequestMachine::Put(machine) => machine.handle_put(ctx, &put),
                    RequestMachine::Get(_) => Vec::new(),
                }
            }
            Message::PutAccept(accept) => {
                let machine = self.machines.entry(route).or_insert_with(|| {
                    RequestMachine::Put(PutStateMachine::new(accept.put.clone()))
                });
                match machine {
                    RequestMachine::Put(machine) => machine.handle_accept(ctx, &accept),
                    RequestMachine::Get(_) => Vec::new(),
                }
            }
            Message::Get(get) => {
                let machine = self
                    .machines
                    .entry(route)
                    .or_insert_with(|| RequestMachine::Get(GetStateMachine::new(get.clone())));
                match machine {
                    RequestMachine::Get(machine) => machine.handle_get(ctx, &get),
                    RequestMachine::Put(_) => Vec::new(),
                }
            }
            Message::DecryptionShare(share) => {
                let machine = self.machines.entry(route).or_insert_with(|| {
                    RequestMachine::Get(GetStateMachine::new(share.get.clone()))
                });
                match machine {
                    RequestMachine::Get(machine) => machine.handle_share(ctx, &share),
                    RequestMachine::Put(_) => Vec::new(),
                }
            }
            other => {
                warn!(kind = other.type_name(), "message has a route key but no machine kind");
                Vec::new()
            }
        }
    }

    /// Broadcasts a catch-up request for everything this replica is missing.
    pub fn start_catch_up(&mut self) -> Vec<Outgoing> {
        self.catch_up.start(&self.ctx)
    }

    /// Whether a catch-up round is still collecting responses.
    pub fn catch_up_active(&self) -> bool {
        self.catch_up.is_active()
    }

    /// Number of request instances currently held.
    pub fn instance_count(&self) -> usize {
        self.machines.len()
    }

    /// Phase of the instance for `route`, or `None` if it was never created or was swept.
    pub fn phase_of(&self, route: &RouteKey) -> Option<Phase> {
        self.machines.get(route).map(RequestMachine::phase)
    }

    /// Applies the retention policy at time `now`; returns how many instances were evicted.
    pub fn sweep(&mut self, now: Timestamp) -> usize {
        let Some(watermark) = self.retention.watermark(now) else {
            return 0;
        };
        self.watermark = self.watermark.max(watermark);
        let before = self.machines.len();
        self.machines.retain(|route, _| route.timestamp >= watermark);
        let evicted = before - self.machines.len();
        if evicted > 0 {
            info!(evicted, remaining = self.machines.len(), "swept request instances");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::tests::{CLIENT, Fixture};
    use crate::machine::OperationKind;
    use crate::message::{Intro, PutAccept};

    fn dispatcher(fx: &Fixture, id: usize, retention: RetentionPolicy) -> Dispatcher {
        Dispatcher::new(fx.replicas[id].clone(), retention)
    }

    #[test]
    fn put_is_routed_and_creates_one_instance() {
        let fx = Fixture::new();
        let mut d = dispatcher(&fx, 0, RetentionPolicy::KeepAll);
        let put = fx.put("alice", b"pw", 10);
        let out = d.on_message(Some(CLIENT), &Message::Put(put.clone()).to_wire());
        assert_eq!(out.len(), 1);
        assert_eq!(d.instance_count(), 1);

        let accept = PutAccept::signed(put, fx.replicas[1].signer.as_ref());
        d.on_message(Some(1), &Message::PutAccept(accept).to_wire());
        assert_eq!(d.instance_count(), 1);
        assert_eq!(
            d.phase_of(&RouteKey::new("alice", 10, OperationKind::Put)),
            Some(Phase::AwaitingQuorum)
        );
    }

    #[test]
    fn tampered_signature_never_reaches_a_machine() {
        let fx = Fixture::new();
        let mut d = dispatcher(&fx, 0, RetentionPolicy::KeepAll);
        let mut put = fx.put("alice", b"pw", 10);
        put.signature.as_bytes_mut()[0] ^= 0x01;

        let out = d.on_message(Some(CLIENT), &Message::Put(put).to_wire());
        assert!(out.is_empty());
        assert_eq!(d.instance_count(), 0);
    }

    #[test]
    fn tampered_inner_put_inside_accept_is_dropped() {
        let fx = Fixture::new();
        let mut d = dispatcher(&fx, 0, RetentionPolicy::KeepAll);
        let mut accept = PutAccept::signed(fx.put("alice", b"pw", 10), fx.replicas[2].signer.as_ref());
        accept.put.secret = b"pwned".to_vec();

        assert!(d.on_message(Some(2), &Message::PutAccept(accept).to_wire()).is_empty());
        assert_eq!(d.instance_count(), 0);
    }

    #[test]
    fn garbage_and_unknown_types_are_dropped() {
        let fx = Fixture::new();
        let mut d = dispatcher(&fx, 0, RetentionPolicy::KeepAll);
        assert!(d.on_message(Some(1), b"\x00\x01garbage").is_empty());
        assert!(d.on_message(Some(1), br#"{"type":"VIEW_CHANGE"}"#).is_empty());
        assert!(d.on_message(None, &Message::Intro(Intro { peer_id: 1 }).to_wire()).is_empty());
        assert_eq!(d.instance_count(), 0);
    }

    #[test]
    fn full_put_round_across_seven_dispatchers() {
        let fx = Fixture::new();
        let mut nodes: Vec<Dispatcher> = (0..7)
            .map(|id| dispatcher(&fx, id, RetentionPolicy::KeepAll))
            .collect();
        let put = fx.put("alice", b"pw", 10);

        // Client sends the put to every replica; relay each broadcast to everyone else.
        let mut queue: Vec<(usize, Message)> =
            (0..7).map(|id| (id, Message::Put(put.clone()))).collect();
        let mut completes = 0;
        while let Some((to, message)) = queue.pop() {
            for out in nodes[to].handle(message) {
                match out {
                    Outgoing::Broadcast(msg) => {
                        for peer in (0..7).filter(|&p| p != to) {
                            queue.push((peer, msg.clone()));
                        }
                    }
                    Outgoing::Send { to: CLIENT, message: Message::PutComplete(_) } => completes += 1,
                    other => panic!("unexpected {other:?}"),
                }
            }
        }
        assert_eq!(completes, 7, "one completion per replica");
        for ctx in &fx.replicas {
            assert!(ctx.store.get("alice").is_ok());
        }
    }

    #[test]
    fn sweep_evicts_old_instances_and_blocks_their_return() {
        let fx = Fixture::new();
        let mut d = dispatcher(&fx, 0, RetentionPolicy::MaxAge(Duration::from_micros(100)));
        d.handle(Message::Put(fx.put("old", b"1", 10)));
        d.handle(Message::Put(fx.put("new", b"2", 500)));
        assert_eq!(d.sweep(550), 1);
        assert_eq!(d.instance_count(), 1);

        assert!(d.handle(Message::Put(fx.put("old", b"1", 10))).is_empty());
        assert_eq!(d.instance_count(), 1);
    }

    #[test]
    fn keep_all_never_evicts() {
        let fx = Fixture::new();
        let mut d = dispatcher(&fx, 0, RetentionPolicy::KeepAll);
        d.handle(Message::Put(fx.put("old", b"1", 10)));
        assert_eq!(d.sweep(u64::MAX), 0);
        assert_eq!(d.instance_count(), 1);
    }
}
