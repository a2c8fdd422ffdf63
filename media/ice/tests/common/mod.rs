//! Deterministic network simulation for ICE agents
//!
//! Two peers, optionally behind NATs, a STUN server and a TURN server. Time is virtual, every packet takes
//! [`LATENCY`] to arrive.

#![allow(dead_code)]

use ezk_ice::{
    CandidatePairState, Component, IceAgent, IceCandidate, IceConfig, IceEvent, ReceivedPkt,
    StreamId, StunServer, TurnCredential, TurnServer,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use stun_types::attributes::{
    Attribute, ChannelNumber, Data, ErrorCode, Fingerprint, Lifetime, MessageIntegrity,
    MessageIntegrityKey, Nonce, Realm, UseCandidate, Username, XorMappedAddress, XorPeerAddress,
    XorRelayedAddress,
};
use stun_types::{
    ChannelData, Class, Message, MessageBuilder, Method, PacketKind, TransactionId, classify,
};

pub const A: usize = 0;
pub const B: usize = 1;

pub const LATENCY: Duration = Duration::from_millis(10);
pub const RTT: Duration = Duration::from_millis(20);

pub const STUN_SERVER: &str = "192.0.2.1:3478";
pub const TURN_SERVER: &str = "192.0.2.2:3478";
pub const TURN_USERNAME: &str = "user";
pub const TURN_PASSWORD: &str = "password";

const RTP_PORT: u16 = 5000;
const RTCP_PORT: u16 = 5001;

pub fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn stun_server() -> StunServer {
    StunServer::new(STUN_SERVER.parse().unwrap())
}

pub fn turn_server() -> TurnServer {
    TurnServer::new(
        TURN_SERVER.parse().unwrap(),
        TurnCredential::Static {
            username: TURN_USERNAME.into(),
            password: TURN_PASSWORD.into(),
        },
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatKind {
    /// Endpoint independent mapping and filtering
    FullCone,
    /// Endpoint independent mapping, address and port dependent filtering
    PortRestricted,
    /// Address and port dependent mapping and filtering
    Symmetric,
}

struct Nat {
    kind: NatKind,
    public_ip: IpAddr,
    next_port: u16,
    mappings: HashMap<(SocketAddr, Option<SocketAddr>), SocketAddr>,
    reverse: HashMap<SocketAddr, SocketAddr>,
    /// (public address, remote address) pairs packets have been sent to
    allowed: HashSet<(SocketAddr, SocketAddr)>,
}

impl Nat {
    fn new(kind: NatKind, public_ip: IpAddr) -> Self {
        Self {
            kind,
            public_ip,
            next_port: 40000,
            mappings: HashMap::new(),
            reverse: HashMap::new(),
            allowed: HashSet::new(),
        }
    }

    fn outbound(&mut self, private: SocketAddr, remote: SocketAddr) -> SocketAddr {
        let key = match self.kind {
            NatKind::FullCone | NatKind::PortRestricted => (private, None),
            NatKind::Symmetric => (private, Some(remote)),
        };

        let public = match self.mappings.get(&key) {
            Some(public) => *public,
            None => {
                let public = SocketAddr::new(self.public_ip, self.next_port);
                self.next_port += 1;
                self.mappings.insert(key, public);
                self.reverse.insert(public, private);
                public
            }
        };

        self.allowed.insert((public, remote));

        public
    }

    fn inbound(&self, public: SocketAddr, remote: SocketAddr) -> Option<SocketAddr> {
        let private = self.reverse.get(&public)?;

        let allowed = match self.kind {
            NatKind::FullCone => true,
            NatKind::PortRestricted | NatKind::Symmetric => {
                self.allowed.contains(&(public, remote))
            }
        };

        allowed.then_some(*private)
    }
}

pub struct PeerConfig {
    pub ip: IpAddr,
    pub nat: Option<(NatKind, IpAddr)>,
    pub config: IceConfig,
    pub rtcp_mux: bool,
}

impl PeerConfig {
    pub fn new(ip: &str) -> Self {
        Self {
            ip: ip.parse().unwrap(),
            nat: None,
            config: IceConfig::default(),
            rtcp_mux: true,
        }
    }

    pub fn nat(mut self, kind: NatKind, public_ip: &str) -> Self {
        self.nat = Some((kind, public_ip.parse().unwrap()));
        self
    }

    pub fn config(mut self, f: impl FnOnce(&mut IceConfig)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn rtcp_mux(mut self, rtcp_mux: bool) -> Self {
        self.rtcp_mux = rtcp_mux;
        self
    }
}

pub struct Peer {
    pub agent: IceAgent,
    pub stream: StreamId,
    pub ip: IpAddr,
    ports: Vec<(Component, u16)>,
    nat: Option<Nat>,

    /// All events except SendData & ReceiveData
    pub events: Vec<IceEvent>,
    /// Application data received
    pub received: Vec<(Instant, Vec<u8>)>,
    /// Candidates emitted by the agent
    pub candidates: Vec<IceCandidate>,
    /// Destination of every packet the agent sent
    pub sent_to: Vec<SocketAddr>,
}

impl Peer {
    fn new(config: PeerConfig, controlling: bool) -> Self {
        let mut ice_config = config.config;
        ice_config.controlling = controlling;

        let mut agent = IceAgent::new(ice_config);
        let stream = agent.add_stream(config.rtcp_mux);

        let mut ports = vec![(Component::Rtp, RTP_PORT)];
        if !config.rtcp_mux {
            ports.push((Component::Rtcp, RTCP_PORT));
        }

        for (component, port) in &ports {
            agent
                .add_host_addr(stream, *component, SocketAddr::new(config.ip, *port))
                .unwrap();
        }

        Self {
            agent,
            stream,
            ip: config.ip,
            ports,
            nat: config
                .nat
                .map(|(kind, public_ip)| Nat::new(kind, public_ip)),
            events: vec![],
            received: vec![],
            candidates: vec![],
            sent_to: vec![],
        }
    }

    fn port(&self, component: Component) -> u16 {
        self.ports
            .iter()
            .find(|(c, _)| *c == component)
            .map(|(_, port)| *port)
            .unwrap()
    }

    /// Returns the local destination and component if the packet reaches this peer
    fn accept(&self, from: SocketAddr, to: SocketAddr) -> Option<(SocketAddr, Component)> {
        let destination = match &self.nat {
            Some(nat) => {
                if to.ip() != nat.public_ip {
                    return None;
                }

                nat.inbound(to, from)?
            }
            None => {
                if to.ip() != self.ip {
                    return None;
                }

                to
            }
        };

        let (component, _) = self
            .ports
            .iter()
            .find(|(_, port)| *port == destination.port())?;

        Some((destination, *component))
    }

    pub fn state_changes(&self) -> Vec<ezk_ice::IceAgentState> {
        self.events
            .iter()
            .filter_map(|event| match event {
                IceEvent::ConnectionStateChanged { new, .. } => Some(*new),
                _ => None,
            })
            .collect()
    }

    pub fn source_failures(&self) -> Vec<(SocketAddr, ezk_ice::Error)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                IceEvent::CandidateSourceFailed { server, error, .. } => {
                    Some((*server, error.clone()))
                }
                _ => None,
            })
            .collect()
    }
}

struct TurnAllocation {
    relayed: SocketAddr,
    permissions: HashSet<IpAddr>,
    channels: HashMap<u16, SocketAddr>,
}

/// Minimal TURN server using long-term credentials
pub struct SimTurnServer {
    pub addr: SocketAddr,
    realm: String,
    nonce: String,
    allocations: HashMap<SocketAddr, TurnAllocation>,
    next_port: u16,

    /// Reject allocations with 486
    pub quota_reached: bool,
    pub allocations_created: usize,
    pub released: usize,
}

type Datagram = (SocketAddr, SocketAddr, Vec<u8>);

impl SimTurnServer {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            realm: "ezk".into(),
            nonce: "f9e1c5d0".into(),
            allocations: HashMap::new(),
            next_port: 50000,
            quota_reached: false,
            allocations_created: 0,
            released: 0,
        }
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    fn is_relay(&self, addr: SocketAddr) -> bool {
        self.allocations.values().any(|a| a.relayed == addr)
    }

    fn key(&self) -> MessageIntegrityKey {
        MessageIntegrityKey::long_term(TURN_USERNAME, &self.realm, TURN_PASSWORD)
    }

    /// Message from a client to the server address
    fn from_client(&mut self, client: SocketAddr, data: Vec<u8>) -> Option<Datagram> {
        match classify(&data) {
            PacketKind::ChannelData => {
                let channel_data = ChannelData::parse(&data).ok()?;
                let allocation = self.allocations.get(&client)?;
                let peer = allocation.channels.get(&channel_data.channel)?;

                Some((allocation.relayed, *peer, channel_data.data.to_vec()))
            }
            PacketKind::Stun => {
                let mut msg = Message::parse(data).ok()?;

                match (msg.class(), msg.method()) {
                    (Class::Indication, Method::Send) => {
                        let allocation = self.allocations.get(&client)?;
                        let peer = msg.attribute::<XorPeerAddress>()?.ok()?.0;

                        if !allocation.permissions.contains(&peer.ip()) {
                            return None;
                        }

                        let data = msg.attribute::<Data>()?.ok()?.0.to_vec();

                        Some((allocation.relayed, peer, data))
                    }
                    (Class::Request, _) => {
                        let response = self.handle_request(client, &mut msg);
                        Some((self.addr, client, response))
                    }
                    _ => None,
                }
            }
            PacketKind::Other => None,
        }
    }

    fn handle_request(&mut self, client: SocketAddr, msg: &mut Message) -> Vec<u8> {
        let transaction_id = msg.transaction_id();
        let method = msg.method();
        let key = self.key();

        let authenticated = msg.attribute::<Username>().is_some()
            && msg
                .attribute_with::<MessageIntegrity>(key.clone())
                .is_some_and(|r| r.is_ok());

        if !authenticated {
            let mut builder = MessageBuilder::new(Class::Error, method, transaction_id);
            builder.add_attr(ErrorCode {
                number: ErrorCode::UNAUTHORIZED,
                reason: "Unauthorized",
            });
            builder.add_attr(Realm::new(&self.realm));
            builder.add_attr(Nonce::new(self.nonce.as_bytes()));
            return builder.finish().unwrap();
        }

        let error = |number: u16, reason: &str| {
            let mut builder = MessageBuilder::new(Class::Error, method, transaction_id);
            builder.add_attr(ErrorCode { number, reason });
            builder.add_attr_with(MessageIntegrity, key.clone());
            builder.finish().unwrap()
        };

        let mut builder = MessageBuilder::new(Class::Success, method, transaction_id);

        match method {
            Method::Allocate => {
                if self.quota_reached {
                    return error(ErrorCode::ALLOCATION_QUOTA_REACHED, "Allocation Quota Reached");
                }

                if self.allocations.contains_key(&client) {
                    return error(ErrorCode::ALLOCATION_MISMATCH, "Allocation Mismatch");
                }

                let relayed = SocketAddr::new(self.addr.ip(), self.next_port);
                self.next_port += 1;
                self.allocations_created += 1;
                self.allocations.insert(
                    client,
                    TurnAllocation {
                        relayed,
                        permissions: HashSet::new(),
                        channels: HashMap::new(),
                    },
                );

                builder.add_attr(XorRelayedAddress(relayed));
                builder.add_attr(XorMappedAddress(client));
                builder.add_attr(Lifetime(600));
            }
            Method::Refresh => {
                let lifetime = match msg.attribute::<Lifetime>() {
                    Some(Ok(lifetime)) => lifetime.0,
                    _ => 600,
                };

                if !self.allocations.contains_key(&client) {
                    return error(ErrorCode::ALLOCATION_MISMATCH, "Allocation Mismatch");
                }

                if lifetime == 0 {
                    self.allocations.remove(&client);
                    self.released += 1;
                }

                builder.add_attr(Lifetime(lifetime));
            }
            Method::CreatePermission => {
                let peer = msg.attribute::<XorPeerAddress>().unwrap().unwrap().0;

                let Some(allocation) = self.allocations.get_mut(&client) else {
                    return error(ErrorCode::ALLOCATION_MISMATCH, "Allocation Mismatch");
                };

                allocation.permissions.insert(peer.ip());
            }
            Method::ChannelBind => {
                let channel = msg.attribute::<ChannelNumber>().unwrap().unwrap().0;
                let peer = msg.attribute::<XorPeerAddress>().unwrap().unwrap().0;

                let Some(allocation) = self.allocations.get_mut(&client) else {
                    return error(ErrorCode::ALLOCATION_MISMATCH, "Allocation Mismatch");
                };

                allocation.channels.insert(channel, peer);
                allocation.permissions.insert(peer.ip());
            }
            _ => return error(ErrorCode::BAD_REQUEST, "Bad Request"),
        }

        builder.add_attr_with(MessageIntegrity, key.clone());
        builder.finish().unwrap()
    }

    /// Packet from a peer to a relayed address
    fn from_peer(&self, peer: SocketAddr, relayed: SocketAddr, data: &[u8]) -> Option<Datagram> {
        let (client, allocation) = self
            .allocations
            .iter()
            .find(|(_, a)| a.relayed == relayed)?;

        if !allocation.permissions.contains(&peer.ip()) {
            return None;
        }

        let bound = allocation
            .channels
            .iter()
            .find(|(_, bound_peer)| **bound_peer == peer);

        let data = match bound {
            Some((channel, _)) => ChannelData::new(*channel, data).to_vec(),
            None => {
                let mut builder =
                    MessageBuilder::new(Class::Indication, Method::Data, TransactionId::random());
                builder.add_attr(XorPeerAddress(peer));
                builder.add_attr(Data::new(data));
                builder.finish().unwrap()
            }
        };

        Some((self.addr, *client, data))
    }
}

fn stun_binding_response(from: SocketAddr, data: Vec<u8>) -> Option<Vec<u8>> {
    let msg = Message::parse(data).ok()?;

    if msg.class() != Class::Request || msg.method() != Method::Binding {
        return None;
    }

    let mut builder = MessageBuilder::new(Class::Success, Method::Binding, msg.transaction_id());
    builder.add_attr(XorMappedAddress(from));
    builder.add_attr(Fingerprint);
    builder.finish().ok()
}

struct Packet {
    from: SocketAddr,
    to: SocketAddr,
    data: Vec<u8>,
    at: Instant,
}

fn is_nomination(data: &[u8]) -> bool {
    matches!(classify(data), PacketKind::Stun)
        && Message::parse(data.to_vec()).is_ok_and(|msg| {
            msg.class() == Class::Request
                && msg.method() == Method::Binding
                && msg.has_attribute(UseCandidate::TYPE)
        })
}

pub struct Net {
    pub now: Instant,
    pub peers: [Peer; 2],
    queue: VecDeque<Packet>,

    pub stun_server: Option<SocketAddr>,
    pub turn: Option<SimTurnServer>,

    /// Drop packets unless they are sent to or from a server
    pub block_direct: bool,
    /// Drop every packet
    pub blackhole: bool,
    /// Drop binding requests with USE-CANDIDATE sent directly between the peers
    pub drop_nominations: bool,
    /// Forward local candidates to the other peer
    pub signaling: bool,
}

impl Net {
    /// Peer `a` is controlling, `b` controlled, unless their config says otherwise
    pub fn new(a: PeerConfig, b: PeerConfig) -> Self {
        Self::with_roles(a, true, b, false)
    }

    pub fn with_roles(a: PeerConfig, a_controlling: bool, b: PeerConfig, b_controlling: bool) -> Self {
        init_log();

        let mut peers = [Peer::new(a, a_controlling), Peer::new(b, b_controlling)];

        let a_credentials = peers[A].agent.credentials().clone();
        let b_credentials = peers[B].agent.credentials().clone();
        peers[A].agent.set_remote_credentials(b_credentials);
        peers[B].agent.set_remote_credentials(a_credentials);

        Self {
            now: Instant::now(),
            peers,
            queue: VecDeque::new(),
            stun_server: Some(STUN_SERVER.parse().unwrap()),
            turn: Some(SimTurnServer::new(TURN_SERVER.parse().unwrap())),
            block_direct: false,
            blackhole: false,
            drop_nominations: false,
            signaling: true,
        }
    }

    pub fn start(&mut self) {
        for i in [A, B] {
            self.peers[i].agent.start(self.now);
            self.drain(i);
        }
    }

    /// Exchange the credentials of both agents again, e.g. after a restart
    pub fn exchange_credentials(&mut self) {
        let a_credentials = self.peers[A].agent.credentials().clone();
        let b_credentials = self.peers[B].agent.credentials().clone();

        self.peers[A].agent.set_remote_credentials(b_credentials);
        self.drain(A);
        self.peers[B].agent.set_remote_credentials(a_credentials);
        self.drain(B);
    }

    pub fn restart(&mut self) {
        // Both restart before any candidate of the new generation is signaled
        for i in [A, B] {
            self.peers[i].agent.restart(self.now);
        }

        for i in [A, B] {
            self.drain(i);
        }

        self.exchange_credentials();
    }

    pub fn send(&mut self, peer: usize, data: &[u8]) -> Result<(), ezk_ice::Error> {
        let stream = self.peers[peer].stream;
        self.peers[peer]
            .agent
            .send(stream, Component::Rtp, data.to_vec())?;
        self.drain(peer);
        Ok(())
    }

    pub fn drain(&mut self, i: usize) {
        while let Some(event) = self.peers[i].agent.pop_event() {
            match event {
                IceEvent::SendData {
                    component,
                    data,
                    source,
                    target,
                    ..
                } => {
                    let peer = &mut self.peers[i];
                    let source = SocketAddr::new(source.unwrap_or(peer.ip), peer.port(component));

                    peer.sent_to.push(target);

                    let from = match &mut peer.nat {
                        Some(nat) => nat.outbound(source, target),
                        None => source,
                    };

                    self.enqueue(from, target, data);
                }
                IceEvent::LocalCandidate { candidate, .. } => {
                    self.peers[i].candidates.push(candidate.clone());

                    if self.signaling {
                        let other = &mut self.peers[1 - i];
                        let stream = other.stream;

                        if let Err(e) = other.agent.add_remote_candidate(stream, &candidate) {
                            log::warn!("failed to signal candidate {candidate}, {e}");
                        }
                    }
                }
                IceEvent::ReceiveData { data, .. } => {
                    self.peers[i].received.push((self.now, data));
                }
                event => self.peers[i].events.push(event),
            }
        }
    }

    fn enqueue(&mut self, from: SocketAddr, to: SocketAddr, data: Vec<u8>) {
        self.queue.push_back(Packet {
            from,
            to,
            data,
            at: self.now + LATENCY,
        });
    }

    fn is_server(&self, addr: SocketAddr) -> bool {
        Some(addr) == self.stun_server
            || self
                .turn
                .as_ref()
                .is_some_and(|turn| turn.addr == addr || turn.is_relay(addr))
    }

    fn route(&mut self, packet: Packet) {
        if self.blackhole {
            return;
        }

        let direct = !self.is_server(packet.from) && !self.is_server(packet.to);

        if direct && (self.block_direct || (self.drop_nominations && is_nomination(&packet.data))) {
            return;
        }

        if Some(packet.to) == self.stun_server {
            if let Some(response) = stun_binding_response(packet.from, packet.data) {
                self.enqueue(packet.to, packet.from, response);
            }

            return;
        }

        if let Some(turn) = &mut self.turn {
            if packet.to == turn.addr {
                if let Some((from, to, data)) = turn.from_client(packet.from, packet.data) {
                    self.enqueue(from, to, data);
                }

                return;
            }

            if turn.is_relay(packet.to) {
                if let Some((from, to, data)) = turn.from_peer(packet.from, packet.to, &packet.data) {
                    self.enqueue(from, to, data);
                }

                return;
            }
        }

        for i in [A, B] {
            if let Some((destination, component)) = self.peers[i].accept(packet.from, packet.to) {
                let stream = self.peers[i].stream;

                self.peers[i].agent.receive(
                    self.now,
                    ReceivedPkt {
                        data: packet.data,
                        source: packet.from,
                        destination,
                        stream,
                        component,
                    },
                );

                self.drain(i);
                return;
            }
        }
    }

    /// Deliver all due packets and poll both agents
    fn step(&mut self) {
        while self.queue.front().is_some_and(|p| p.at <= self.now) {
            if let Some(packet) = self.queue.pop_front() {
                self.route(packet);
            }
        }

        for i in [A, B] {
            self.peers[i].agent.poll(self.now);
            self.drain(i);
        }
    }

    fn next_event(&self) -> Option<Instant> {
        let packet = self.queue.front().map(|p| p.at);
        let timeouts = self
            .peers
            .iter()
            .filter_map(|peer| peer.agent.timeout(self.now))
            .map(|timeout| self.now + timeout);

        packet.into_iter().chain(timeouts).min()
    }

    /// Run the simulation until `f` returns true or `max` elapsed. Returns if `f` returned true.
    pub fn run_until(&mut self, max: Duration, mut f: impl FnMut(&Net) -> bool) -> bool {
        let end = self.now + max;
        let mut steps_at_instant = 0;

        loop {
            self.step();

            if f(self) {
                return true;
            }

            let next = match self.next_event() {
                Some(next) if next <= end => next,
                _ => {
                    self.now = end;
                    self.step();
                    return f(self);
                }
            };

            if next <= self.now {
                steps_at_instant += 1;
                assert!(steps_at_instant < 10_000, "simulation does not advance");
            } else {
                steps_at_instant = 0;
                self.now = next;
            }
        }
    }

    pub fn run_for(&mut self, duration: Duration) {
        self.run_until(duration, |_| false);
    }

    pub fn state(&self, peer: usize) -> ezk_ice::IceAgentState {
        self.peers[peer].agent.state()
    }

    pub fn both_connected(&self) -> bool {
        use ezk_ice::IceAgentState::*;

        [A, B]
            .iter()
            .all(|i| matches!(self.state(*i), Connected | Completed))
    }

    pub fn selected(&self, peer: usize) -> Option<ezk_ice::SelectedPair> {
        let peer = &self.peers[peer];
        peer.agent.selected_pair(peer.stream, Component::Rtp)
    }

    /// At most one check is in progress per foundation
    pub fn assert_foundations_checked_one_at_a_time(&self) {
        for peer in &self.peers {
            let mut in_progress = HashSet::new();

            for pair in peer.agent.pairs(peer.stream, Component::Rtp) {
                if pair.state != CandidatePairState::InProgress {
                    continue;
                }

                let foundation = format!("{}:{}", pair.local.foundation, pair.remote.foundation);

                assert!(
                    in_progress.insert(foundation.clone()),
                    "foundation {foundation} has more than one check in progress"
                );
            }
        }
    }
}
