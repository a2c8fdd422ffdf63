use crate::candidate::{
    Candidate, CandidateKind, IceCandidate, LocalCandidateId, RemoteCandidateId,
    candidate_priority, compute_foundation,
};
use crate::checklist::{CandidatePairState, Check, Checklist, can_pair};
use crate::config::{IceConfig, IceTransportPolicy};
use crate::gather::{BindingId, StunServerBinding};
use crate::stun::{
    BindingRequest, make_binding_request, make_role_error, make_success_response,
    verify_fingerprint, verify_integrity,
};
use crate::transaction::{Route, Transaction, TransactionOwner, TransactionPoll, Transactions};
use crate::turn::{AllocationEvent, AllocationId, TurnAllocation};
use crate::{
    Component, DisplayPair, Error, IceCredentials, IceEvent, ReceivedPkt, StreamId, opt_min,
};
use slotmap::SlotMap;
use std::collections::VecDeque;
use std::mem::take;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant, SystemTime};
use stun_types::attributes::{
    ErrorCode, IceControlled, IceControlling, Priority, UseCandidate, XorMappedAddress,
};
use stun_types::{Class, Message, Method, PacketKind, TransactionId, classify};

/// State of the ICE agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceAgentState {
    /// [`IceAgent::start`] has not been called yet
    New,
    /// Gathering candidates, waiting for the peer's candidates
    Gathering,
    /// Running connectivity checks
    Checking,
    /// Every component has a selected candidate pair
    Connected,
    /// Connected and no more connectivity checks are pending
    Completed,
    /// Keepalives on a selected candidate pair failed
    Disconnected,
    /// Connectivity could not be established or was lost, only [`IceAgent::restart`] recovers from this
    Failed,
    /// [`IceAgent::close`] has been called
    Closed,
}

/// Candidate gathering state of the ICE agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceGatheringState {
    New,
    Gathering,
    /// All candidate sources answered or timed out (end-of-candidates)
    Complete,
}

/// The candidate pair used to exchange data on a component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedPair {
    pub local: IceCandidate,
    pub remote: IceCandidate,
}

/// Diagnostic information about a candidate pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairInfo {
    pub local: IceCandidate,
    pub remote: IceCandidate,
    pub priority: u64,
    pub state: CandidatePairState,
    pub nominated: bool,
}

/// sans io ICE agent
///
/// Candidates are exchanged with the peer using [`IceEvent::LocalCandidate`] and [`IceAgent::add_remote_candidate`],
/// the credentials using [`IceAgent::credentials`] and [`IceAgent::set_remote_credentials`].
///
/// The agent must be driven by calling [`IceAgent::poll`] whenever the duration returned by [`IceAgent::timeout`]
/// elapsed, and after every call to [`IceAgent::receive`]. Events must be drained using [`IceAgent::pop_event`].
pub struct IceAgent {
    config: IceConfig,

    /// Incremented on every restart
    generation: u32,

    local_credentials: IceCredentials,
    remote_credentials: Option<IceCredentials>,
    remote_end_of_candidates: bool,

    is_controlling: bool,
    control_tie_breaker: u64,

    streams: SlotMap<StreamId, Stream>,
    stun_bindings: SlotMap<BindingId, StunServerBinding>,
    allocations: SlotMap<AllocationId, TurnAllocation>,
    transactions: Transactions,

    state: IceAgentState,
    gathering_state: IceGatheringState,
    started: bool,

    connected_at: Option<Instant>,
    disconnected_at: Option<Instant>,
    last_error: Option<String>,

    /// STUN requests received before the remote credentials were set
    backlog: Vec<Backlogged>,

    events: VecDeque<IceEvent>,
}

struct Stream {
    rtcp_mux: bool,
    components: Vec<ComponentState>,
}

impl Stream {
    /// RTCP uses the RTP component if rtcp-mux is enabled
    fn resolve(&self, component: Component) -> Component {
        if self.rtcp_mux {
            Component::Rtp
        } else {
            component
        }
    }

    fn component(&self, component: Component) -> Option<&ComponentState> {
        self.components.iter().find(|c| c.component == component)
    }

    fn component_mut(&mut self, component: Component) -> Option<&mut ComponentState> {
        self.components.iter_mut().find(|c| c.component == component)
    }
}

struct ComponentState {
    component: Component,

    /// Registered local addresses, used as base of all local candidates
    host_addrs: Vec<SocketAddr>,

    local_candidates: SlotMap<LocalCandidateId, Candidate>,
    remote_candidates: SlotMap<RemoteCandidateId, Candidate>,
    checklist: Checklist,

    selected: Option<Selected>,

    /// Selected pair of the previous generation, carries data until the current generation connects
    retained: Option<(Candidate, Candidate)>,

    failed: bool,
    /// Since when all candidate pairs are failed
    failing_since: Option<Instant>,
}

struct Selected {
    local: LocalCandidateId,
    remote: RemoteCandidateId,
    next_keepalive: Instant,
    keepalive_failures: u32,
}

/// Describes how a packet was received
#[derive(Debug, Clone, Copy)]
struct Incoming {
    stream: StreamId,
    component: Component,
    source: SocketAddr,
    destination: SocketAddr,
    /// Received through a TURN allocation
    relay: Option<AllocationId>,
}

impl Incoming {
    /// Route to reply on
    fn reply_route(&self) -> Route {
        match self.relay {
            Some(allocation) => Route::Relayed {
                allocation,
                peer: self.source,
            },
            None => Route::Direct {
                source: Some(self.destination.ip()),
                target: self.source,
            },
        }
    }
}

/// Requests kept until the remote credentials are known, older ones are dropped first
const MAX_BACKLOG: usize = 64;

struct Backlogged {
    received_at: Instant,
    incoming: Incoming,
    msg: Message,
}

fn pair_route(local: &Candidate, remote: &Candidate) -> Route {
    match local.allocation {
        Some(allocation) => Route::Relayed {
            allocation,
            peer: remote.addr,
        },
        None => Route::Direct {
            source: Some(local.base.ip()),
            target: remote.addr,
        },
    }
}

impl ComponentState {
    fn new(component: Component) -> Self {
        Self {
            component,
            host_addrs: vec![],
            local_candidates: SlotMap::with_key(),
            remote_candidates: SlotMap::with_key(),
            checklist: Checklist::default(),
            selected: None,
            retained: None,
            failed: false,
            failing_since: None,
        }
    }

    fn add_pair(
        &mut self,
        local: LocalCandidateId,
        remote: RemoteCandidateId,
        is_controlling: bool,
        allocations: &mut SlotMap<AllocationId, TurnAllocation>,
    ) {
        let (Some(local_candidate), Some(remote_candidate)) = (
            self.local_candidates.get(local),
            self.remote_candidates.get(remote),
        ) else {
            return;
        };

        // Exclude pairs with different ip version or link local scope
        if !can_pair(local_candidate.addr, remote_candidate.addr) {
            return;
        }

        if !self.checklist.add_pair(
            local,
            local_candidate,
            remote,
            remote_candidate,
            is_controlling,
        ) {
            return;
        }

        log::debug!(
            "add pair {}, component={:?}",
            DisplayPair(local_candidate, remote_candidate),
            self.component
        );

        // The peer must be allowed to send through the allocation
        if let Some(allocation) = local_candidate
            .allocation
            .and_then(|id| allocations.get_mut(id))
        {
            allocation.add_permission(remote_candidate.addr.ip());
        }
    }

    fn prune(&mut self, max: usize) {
        for pair in self.checklist.prune(max) {
            if let (Some(local), Some(remote)) = (
                self.local_candidates.get(pair.local),
                self.remote_candidates.get(pair.remote),
            ) {
                log::debug!("Pruned pair {}", DisplayPair(local, remote));
            }
        }
    }

    fn selected_candidates(&self) -> Option<(&Candidate, &Candidate)> {
        let selected = self.selected.as_ref()?;

        Some((
            self.local_candidates.get(selected.local)?,
            self.remote_candidates.get(selected.remote)?,
        ))
    }

    /// Candidates data is sent on, falls back to the pair of the previous generation
    fn data_candidates(&self) -> Option<(&Candidate, &Candidate)> {
        self.selected_candidates()
            .or_else(|| self.retained.as_ref().map(|(local, remote)| (local, remote)))
    }

    fn is_selected(&self, local: LocalCandidateId, remote: RemoteCandidateId) -> bool {
        self.selected
            .as_ref()
            .is_some_and(|s| s.local == local && s.remote == remote)
    }

    fn is_connected(&self, max_keepalive_failures: u32) -> bool {
        self.selected
            .as_ref()
            .is_some_and(|s| s.keepalive_failures < max_keepalive_failures)
    }

    /// Discard everything of the current generation
    fn reset(&mut self) {
        self.local_candidates.clear();
        self.remote_candidates.clear();
        self.checklist.clear();
        self.selected = None;
        self.failed = false;
        self.failing_since = None;
    }
}

impl IceAgent {
    pub fn new(config: IceConfig) -> Self {
        IceAgent {
            generation: 0,
            local_credentials: IceCredentials::random(),
            remote_credentials: None,
            remote_end_of_candidates: false,
            is_controlling: config.controlling,
            control_tie_breaker: rand::random(),
            streams: SlotMap::with_key(),
            stun_bindings: SlotMap::with_key(),
            allocations: SlotMap::with_key(),
            transactions: Transactions::default(),
            state: IceAgentState::New,
            gathering_state: IceGatheringState::New,
            started: false,
            connected_at: None,
            disconnected_at: None,
            last_error: None,
            backlog: vec![],
            events: VecDeque::new(),
            config,
        }
    }

    /// Return the ice-agent's ice credentials
    pub fn credentials(&self) -> &IceCredentials {
        &self.local_credentials
    }

    /// Set the peer's credentials, received using the signaling protocol
    pub fn set_remote_credentials(&mut self, credentials: IceCredentials) {
        self.remote_credentials = Some(credentials);

        for backlogged in take(&mut self.backlog) {
            self.receive_check_request(
                backlogged.received_at,
                backlogged.incoming,
                backlogged.msg,
            );
        }
    }

    /// The peer will not send any more candidates
    pub fn set_remote_end_of_candidates(&mut self) {
        self.remote_end_of_candidates = true;
    }

    pub fn state(&self) -> IceAgentState {
        self.state
    }

    pub fn gathering_state(&self) -> IceGatheringState {
        self.gathering_state
    }

    /// Current generation, incremented on every restart
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn is_controlling(&self) -> bool {
        self.is_controlling
    }

    /// Diagnostic message of the reason the agent failed
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Add a media stream. With `rtcp_mux` the stream only has a single [`Component::Rtp`].
    pub fn add_stream(&mut self, rtcp_mux: bool) -> StreamId {
        let mut components = vec![ComponentState::new(Component::Rtp)];

        if !rtcp_mux {
            components.push(ComponentState::new(Component::Rtcp));
        }

        self.streams.insert(Stream {
            rtcp_mux,
            components,
        })
    }

    /// Remove a stream, releasing all its resources
    pub fn remove_stream(&mut self, stream_id: StreamId) -> Result<(), Error> {
        if self.streams.remove(stream_id).is_none() {
            return Err(Error::UnknownStream);
        }

        let allocations: Vec<AllocationId> = self
            .allocations
            .iter()
            .filter(|(_, a)| a.stream() == stream_id)
            .map(|(id, _)| id)
            .collect();

        for allocation in allocations {
            self.release_allocation(allocation);
        }

        self.stun_bindings.retain(|_, b| b.stream() != stream_id);
        self.transactions.retain(|t| t.stream != stream_id);
        self.backlog.retain(|b| b.incoming.stream != stream_id);

        self.update_gathering_state();

        Ok(())
    }

    /// Register a host address for a given ICE component. This will be used to create a host candidate.
    /// For the ICE agent to work properly, all available ip addresses of the host system should be provided.
    pub fn add_host_addr(
        &mut self,
        stream_id: StreamId,
        component: Component,
        addr: SocketAddr,
    ) -> Result<(), Error> {
        let stream = self
            .streams
            .get_mut(stream_id)
            .ok_or(Error::UnknownStream)?;
        let component_state = stream
            .component_mut(component)
            .ok_or(Error::UnknownComponent)?;

        if addr.ip().is_unspecified() {
            return Ok(());
        }

        if let SocketAddr::V6(v6) = addr
            && v6.ip().to_ipv4_mapped().is_some()
        {
            return Ok(());
        }

        if component_state.host_addrs.contains(&addr) {
            return Ok(());
        }

        component_state.host_addrs.push(addr);

        if self.started && self.state != IceAgentState::Closed {
            self.gather_from_host(stream_id, component, addr);
            self.update_gathering_state();
        }

        Ok(())
    }

    /// Start gathering candidates
    pub fn start(&mut self, now: Instant) {
        if self.started || self.state == IceAgentState::Closed {
            return;
        }

        self.started = true;
        self.set_state(now, IceAgentState::Gathering);
        self.gather();
        self.update_gathering_state();
    }

    fn gather(&mut self) {
        let hosts: Vec<(StreamId, Component, SocketAddr)> = self
            .streams
            .iter()
            .flat_map(|(stream_id, stream)| {
                stream.components.iter().flat_map(move |c| {
                    c.host_addrs
                        .iter()
                        .map(move |addr| (stream_id, c.component, *addr))
                })
            })
            .collect();

        for (stream_id, component, addr) in hosts {
            self.gather_from_host(stream_id, component, addr);
        }
    }

    /// Create the host candidate and the STUN bindings & TURN allocations of a host address
    fn gather_from_host(&mut self, stream_id: StreamId, component: Component, addr: SocketAddr) {
        self.add_local_candidate(
            stream_id,
            component,
            CandidateKind::Host,
            addr,
            addr,
            None,
            None,
            None,
        );

        if self.config.transport_policy == IceTransportPolicy::All {
            for server in &self.config.stun_servers {
                // One binding per stream, component and server
                let exists = server.addr.is_ipv4() != addr.is_ipv4()
                    || self.stun_bindings.values().any(|b| {
                        b.stream() == stream_id
                            && b.component() == component
                            && b.server() == server.addr
                    });

                if exists {
                    continue;
                }

                log::debug!("Creating STUN binding to {} from {addr}", server.addr);

                self.stun_bindings.insert(StunServerBinding::new(
                    server.addr,
                    stream_id,
                    component,
                    addr,
                ));
            }
        }

        for server in &self.config.turn_servers {
            let exists = server.addr.is_ipv4() != addr.is_ipv4()
                || self.allocations.values().any(|a| {
                    a.stream() == stream_id && a.component() == component && a.server() == server.addr
                });

            if exists {
                continue;
            }

            log::debug!("Creating TURN allocation on {} from {addr}", server.addr);

            self.allocations.insert(TurnAllocation::new(
                server.addr,
                stream_id,
                component,
                addr,
                server.credential.clone(),
                SystemTime::now(),
            ));
        }

        // Allocations outlive a restart, their candidates are added again
        let allocated: Vec<(AllocationId, SocketAddr, SocketAddr)> = self
            .allocations
            .iter()
            .filter(|(_, a)| a.stream() == stream_id && a.component() == component && a.base() == addr)
            .filter_map(|(id, a)| a.addresses().map(|(relayed, mapped)| (id, relayed, mapped)))
            .collect();

        for (allocation_id, relayed, mapped) in allocated {
            self.on_allocation_event(allocation_id, Some(AllocationEvent::Allocated { relayed, mapped }));
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn add_local_candidate(
        &mut self,
        stream_id: StreamId,
        component: Component,
        kind: CandidateKind,
        base: SocketAddr,
        addr: SocketAddr,
        related: Option<SocketAddr>,
        server: Option<IpAddr>,
        allocation: Option<AllocationId>,
    ) {
        if self.config.transport_policy == IceTransportPolicy::Relay
            && kind != CandidateKind::Relayed
        {
            return;
        }

        if kind == CandidateKind::ServerReflexive && addr == base {
            log::trace!("Discarding server-reflexive candidate {addr}, it is equal to its base");
            return;
        }

        let Some(component_state) = self
            .streams
            .get_mut(stream_id)
            .and_then(|s| s.component_mut(component))
        else {
            return;
        };

        // Check if we need to create a new candidate for this
        let already_exists = component_state
            .local_candidates
            .values()
            .any(|c| c.kind == kind && c.base == base && c.addr == addr);

        if already_exists {
            return;
        }

        // Every candidate of the same type gets a lower local preference
        let same_kind = component_state
            .local_candidates
            .values()
            .filter(|c| c.kind == kind)
            .count();
        let local_preference = u16::try_from(65535usize.saturating_sub(same_kind)).unwrap_or(0);

        let priority = candidate_priority(
            kind.type_preference(&self.config.type_preferences),
            local_preference,
            component.id(),
        );

        let local_id = component_state.local_candidates.insert(Candidate {
            addr,
            kind,
            priority,
            foundation: compute_foundation(kind, base.ip(), server, "udp"),
            component,
            base,
            related,
            allocation,
        });

        let candidate = &component_state.local_candidates[local_id];

        log::debug!("add local candidate {component:?} {candidate}");

        self.events.push_back(IceEvent::LocalCandidate {
            stream: stream_id,
            candidate: candidate.to_ice_candidate(),
        });

        // Remote peer-reflexive candidates are not paired here
        let remotes: Vec<RemoteCandidateId> = component_state
            .remote_candidates
            .iter()
            .filter(|(_, c)| c.kind != CandidateKind::PeerReflexive)
            .map(|(id, _)| id)
            .collect();

        for remote_id in remotes {
            component_state.add_pair(
                local_id,
                remote_id,
                self.is_controlling,
                &mut self.allocations,
            );
        }

        component_state.prune(self.config.max_checklist_size);
    }

    /// Add a peer's ice-candidate which has been received using an extern signaling protocol
    pub fn add_remote_candidate(
        &mut self,
        stream_id: StreamId,
        candidate: &IceCandidate,
    ) -> Result<(), Error> {
        if self.state == IceAgentState::Closed {
            return Err(Error::Closed);
        }

        if !candidate.transport.eq_ignore_ascii_case("udp") {
            return Err(Error::UnsupportedCandidate("only UDP candidates are supported"));
        }

        let stream = self
            .streams
            .get_mut(stream_id)
            .ok_or(Error::UnknownStream)?;
        let component = Component::from_id(candidate.component).ok_or(Error::UnknownComponent)?;
        let component_state = stream
            .component_mut(component)
            .ok_or(Error::UnknownComponent)?;

        let addr = candidate.addr();

        let existing = component_state
            .remote_candidates
            .iter()
            .find(|(_, c)| c.addr == addr)
            .map(|(id, c)| (id, c.kind));

        let remote_id = match existing {
            Some((_, kind))
                if kind != CandidateKind::PeerReflexive
                    || candidate.kind == CandidateKind::PeerReflexive =>
            {
                // Already known
                return Ok(());
            }
            Some((remote_id, _)) => {
                // A signaled candidate replaces the peer-reflexive candidate learned from a check
                let remote = &mut component_state.remote_candidates[remote_id];

                log::debug!("Peer-reflexive candidate {addr} signaled as {}", candidate.kind);

                remote.kind = candidate.kind;
                remote.priority = candidate.priority;
                remote.foundation.clone_from(&candidate.foundation);
                remote.related = candidate.related;

                component_state.checklist.refresh(
                    &component_state.local_candidates,
                    &component_state.remote_candidates,
                    self.is_controlling,
                );

                remote_id
            }
            None => {
                let remote = Candidate {
                    addr,
                    kind: candidate.kind,
                    priority: candidate.priority,
                    foundation: candidate.foundation.clone(),
                    component,
                    base: addr,
                    related: candidate.related,
                    allocation: None,
                };

                log::debug!("add remote candidate {component:?} {remote}");

                component_state.remote_candidates.insert(remote)
            }
        };

        // Local peer-reflexive candidates share the base of a host candidate, pairing them is redundant
        let locals: Vec<LocalCandidateId> = component_state
            .local_candidates
            .iter()
            .filter(|(_, c)| c.kind != CandidateKind::PeerReflexive)
            .map(|(id, _)| id)
            .collect();

        for local_id in locals {
            component_state.add_pair(
                local_id,
                remote_id,
                self.is_controlling,
                &mut self.allocations,
            );
        }

        component_state.prune(self.config.max_checklist_size);

        Ok(())
    }

    /// Returns all local candidates of the stream
    pub fn local_candidates(&self, stream_id: StreamId) -> Vec<IceCandidate> {
        let Some(stream) = self.streams.get(stream_id) else {
            return vec![];
        };

        stream
            .components
            .iter()
            .flat_map(|c| c.local_candidates.values())
            .map(Candidate::to_ice_candidate)
            .collect()
    }

    /// Returns the selected candidate pair of the component
    pub fn selected_pair(&self, stream_id: StreamId, component: Component) -> Option<SelectedPair> {
        let stream = self.streams.get(stream_id)?;
        let (local, remote) = stream
            .component(stream.resolve(component))?
            .data_candidates()?;

        Some(SelectedPair {
            local: local.to_ice_candidate(),
            remote: remote.to_ice_candidate(),
        })
    }

    /// Returns all candidate pairs of the component, ordered by descending priority
    pub fn pairs(&self, stream_id: StreamId, component: Component) -> Vec<PairInfo> {
        let Some(component_state) = self
            .streams
            .get(stream_id)
            .and_then(|s| s.component(s.resolve(component)))
        else {
            return vec![];
        };

        component_state
            .checklist
            .pairs()
            .iter()
            .filter_map(|pair| {
                let local = component_state.local_candidates.get(pair.local)?;
                let remote = component_state.remote_candidates.get(pair.remote)?;

                Some(PairInfo {
                    local: local.to_ice_candidate(),
                    remote: remote.to_ice_candidate(),
                    priority: pair.priority,
                    state: pair.state,
                    nominated: pair.nominated,
                })
            })
            .collect()
    }

    /// Send data on the selected candidate pair of the component
    pub fn send(
        &mut self,
        stream_id: StreamId,
        component: Component,
        data: Vec<u8>,
    ) -> Result<(), Error> {
        if self.state == IceAgentState::Closed {
            return Err(Error::Closed);
        }

        let stream = self.streams.get(stream_id).ok_or(Error::UnknownStream)?;
        let component = stream.resolve(component);
        let (local, remote) = stream
            .component(component)
            .ok_or(Error::UnknownComponent)?
            .data_candidates()
            .ok_or(Error::NoSelectedPair)?;

        let route = pair_route(local, remote);

        self.send_routed(stream_id, component, route, data);

        Ok(())
    }

    fn send_routed(&mut self, stream: StreamId, component: Component, route: Route, data: Vec<u8>) {
        match route {
            Route::Direct { source, target } => {
                self.events.push_back(IceEvent::SendData {
                    stream,
                    component,
                    data,
                    source,
                    target,
                });
            }
            Route::Relayed { allocation, peer } => {
                let Some(allocation) = self.allocations.get_mut(allocation) else {
                    log::debug!("Cannot send to {peer}, TURN allocation no longer exists");
                    return;
                };

                match allocation.wrap(peer, &data) {
                    Ok(data) => self.events.push_back(IceEvent::SendData {
                        stream: allocation.stream(),
                        component: allocation.component(),
                        data,
                        source: Some(allocation.base().ip()),
                        target: allocation.server(),
                    }),
                    Err(e) => log::warn!("Failed to wrap data for {peer}, {e}"),
                }
            }
        }
    }

    /// Receive network packets for this ICE agent
    pub fn receive(&mut self, now: Instant, pkt: ReceivedPkt) {
        if self.state == IceAgentState::Closed {
            return;
        }

        if self
            .streams
            .get(pkt.stream)
            .and_then(|s| s.component(pkt.component))
            .is_none()
        {
            log::debug!("Received packet for unknown stream or component, discarding");
            return;
        }

        let incoming = Incoming {
            stream: pkt.stream,
            component: pkt.component,
            source: pkt.source,
            destination: pkt.destination,
            relay: None,
        };

        self.receive_datagram(now, incoming, pkt.data);

        self.update_nominations();
        self.update_state(now);
    }

    fn find_allocation(&self, incoming: &Incoming) -> Option<AllocationId> {
        if incoming.relay.is_some() {
            return None;
        }

        self.allocations
            .iter()
            .find(|(_, a)| {
                a.stream() == incoming.stream
                    && a.component() == incoming.component
                    && a.server() == incoming.source
            })
            .map(|(id, _)| id)
    }

    fn receive_datagram(&mut self, now: Instant, incoming: Incoming, data: Vec<u8>) {
        match classify(&data) {
            PacketKind::Stun => {
                let mut msg = match Message::parse(data) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::debug!("Failed to parse stun message {e}");
                        return;
                    }
                };

                // Data relayed by a TURN server
                if msg.class() == Class::Indication
                    && msg.method() == Method::Data
                    && let Some(allocation_id) = self.find_allocation(&incoming)
                {
                    if let Some((peer, data)) =
                        self.allocations[allocation_id].unwrap_indication(&mut msg)
                    {
                        self.receive_relayed(now, incoming, allocation_id, peer, data);
                    }

                    return;
                }

                self.receive_stun(now, incoming, msg);
            }
            PacketKind::ChannelData => {
                if let Some(allocation_id) = self.find_allocation(&incoming)
                    && let Some((peer, data)) =
                        self.allocations[allocation_id].unwrap_channel_data(&data)
                {
                    self.receive_relayed(now, incoming, allocation_id, peer, data);
                } else {
                    self.receive_application_data(incoming, data);
                }
            }
            PacketKind::Other => self.receive_application_data(incoming, data),
        }
    }

    fn receive_relayed(
        &mut self,
        now: Instant,
        incoming: Incoming,
        allocation_id: AllocationId,
        peer: SocketAddr,
        data: Vec<u8>,
    ) {
        let Some(relayed) = self.allocations[allocation_id].relayed_addr() else {
            return;
        };

        let incoming = Incoming {
            source: peer,
            destination: relayed,
            relay: Some(allocation_id),
            ..incoming
        };

        self.receive_datagram(now, incoming, data);
    }

    fn receive_application_data(&mut self, incoming: Incoming, data: Vec<u8>) {
        self.events.push_back(IceEvent::ReceiveData {
            stream: incoming.stream,
            component: incoming.component,
            data,
            source: incoming.source,
        });
    }

    fn receive_stun(&mut self, now: Instant, incoming: Incoming, mut msg: Message) {
        match msg.class() {
            Class::Request => {
                if msg.method() != Method::Binding {
                    log::trace!("Ignoring STUN {:?} request", msg.method());
                    return;
                }

                if !verify_fingerprint(&mut msg) {
                    log::trace!("Incoming STUN request failed fingerprint check, discarding");
                    return;
                }

                self.receive_check_request(now, incoming, msg);
            }
            Class::Indication => { /* ignore */ }
            Class::Success | Class::Error => self.receive_stun_response(now, incoming, msg),
        }
    }

    fn receive_check_request(&mut self, now: Instant, incoming: Incoming, mut msg: Message) {
        // Store messages later if the remote credentials aren't set yet
        let Some(remote_credentials) = &self.remote_credentials else {
            if self.backlog.len() >= MAX_BACKLOG {
                log::debug!("Backlog of incoming requests is full, dropping the oldest");
                self.backlog.remove(0);
            }

            self.backlog.push(Backlogged {
                received_at: now,
                incoming,
                msg,
            });
            return;
        };

        if !verify_integrity(&self.local_credentials, remote_credentials, &mut msg) {
            log::debug!("Incoming stun request failed the integrity check, discarding");
            return;
        }

        let Some(Ok(Priority(priority))) = msg.attribute::<Priority>() else {
            log::debug!("Incoming stun request did not contain PRIORITY attribute");
            return;
        };

        let use_candidate = msg.attribute::<UseCandidate>().is_some();
        let transaction_id = msg.transaction_id();

        // Detect and handle role conflict
        if self.is_controlling {
            if let Some(Ok(IceControlling(tie_breaker))) = msg.attribute::<IceControlling>() {
                if self.control_tie_breaker >= tie_breaker {
                    self.send_role_error(transaction_id, incoming);
                    return;
                }

                self.switch_role(false);
            }
        } else if let Some(Ok(IceControlled(tie_breaker))) = msg.attribute::<IceControlled>() {
            if self.control_tie_breaker >= tie_breaker {
                self.switch_role(true);
            } else {
                self.send_role_error(transaction_id, incoming);
                return;
            }
        }

        let is_controlling = self.is_controlling;

        let Some(component_state) = self
            .streams
            .get_mut(incoming.stream)
            .and_then(|s| s.component_mut(incoming.component))
        else {
            return;
        };

        let local_id = component_state
            .local_candidates
            .iter()
            .find(|(_, c)| match incoming.relay {
                Some(allocation) => c.allocation == Some(allocation),
                None => c.kind == CandidateKind::Host && c.addr == incoming.destination,
            })
            .map(|(id, _)| id);

        let Some(local_id) = local_id else {
            log::debug!(
                "Failed to find matching local candidate for incoming STUN request ({})",
                incoming.destination
            );
            return;
        };

        let remote_id = match component_state
            .remote_candidates
            .iter()
            .find(|(_, c)| c.addr == incoming.source)
        {
            Some((remote_id, _)) => remote_id,
            None => {
                // No remote candidate with the source ip addr, create new peer-reflexive candidate
                let candidate = Candidate {
                    addr: incoming.source,
                    kind: CandidateKind::PeerReflexive,
                    priority,
                    foundation: compute_foundation(
                        CandidateKind::PeerReflexive,
                        incoming.source.ip(),
                        None,
                        "udp",
                    ),
                    component: incoming.component,
                    base: incoming.source,
                    related: None,
                    allocation: None,
                };

                log::debug!("learned remote candidate {candidate}");

                component_state.remote_candidates.insert(candidate)
            }
        };

        component_state.add_pair(local_id, remote_id, is_controlling, &mut self.allocations);
        component_state.prune(self.config.max_checklist_size);

        let mut select = false;

        // The peer can reach us on a failed pair, check it again
        if component_state.checklist.retry_failed(local_id, remote_id) {
            component_state.checklist.push_triggered(local_id, remote_id);
        }

        if let Some(pair) = component_state.checklist.find_mut(local_id, remote_id) {
            if use_candidate && !is_controlling {
                pair.received_use_candidate = true;
            }

            log::trace!(
                "got connectivity check for pair {}, use-candidate={use_candidate}",
                DisplayPair(
                    &component_state.local_candidates[local_id],
                    &component_state.remote_candidates[remote_id]
                ),
            );

            match pair.state {
                CandidatePairState::Frozen | CandidatePairState::Waiting => {
                    component_state.checklist.push_triggered(local_id, remote_id);
                }
                CandidatePairState::Succeeded => {
                    select = use_candidate && !is_controlling;
                }
                CandidatePairState::InProgress | CandidatePairState::Failed => {}
            }
        }

        match make_success_response(transaction_id, &self.local_credentials, incoming.source) {
            Ok(response) => {
                self.send_routed(
                    incoming.stream,
                    incoming.component,
                    incoming.reply_route(),
                    response,
                );
            }
            Err(e) => log::warn!("Failed to create STUN success response, {e}"),
        }

        if select {
            self.select_pair(now, incoming.stream, incoming.component, local_id, remote_id);
        }
    }

    fn send_role_error(&mut self, transaction_id: TransactionId, incoming: Incoming) {
        log::debug!("Role conflict with {}, responding with 487", incoming.source);

        match make_role_error(transaction_id, &self.local_credentials) {
            Ok(response) => self.send_routed(
                incoming.stream,
                incoming.component,
                incoming.reply_route(),
                response,
            ),
            Err(e) => log::warn!("Failed to create role conflict response, {e}"),
        }
    }

    fn switch_role(&mut self, is_controlling: bool) {
        log::debug!(
            "Switching role to {}",
            if is_controlling {
                "controlling"
            } else {
                "controlled"
            }
        );

        self.is_controlling = is_controlling;

        // A role switch requires an agent to recompute pair priorities, since the priority values depend on the role.
        for stream in self.streams.values_mut() {
            for component_state in &mut stream.components {
                component_state.checklist.refresh(
                    &component_state.local_candidates,
                    &component_state.remote_candidates,
                    is_controlling,
                );
            }
        }
    }

    fn receive_stun_response(&mut self, now: Instant, incoming: Incoming, mut msg: Message) {
        let transaction_id = msg.transaction_id();

        let Some(transaction) = self.transactions.take(&transaction_id) else {
            log::trace!("Failed to find transaction for STUN response, discarding");
            return;
        };

        // The source of the response must be the target of the request
        let expected_relay = match transaction.route {
            Route::Direct { .. } => None,
            Route::Relayed { allocation, .. } => Some(allocation),
        };
        let symmetric =
            incoming.source == transaction.route.peer() && incoming.relay == expected_relay;

        match transaction.owner {
            TransactionOwner::ServerBinding(binding_id) => {
                if !symmetric {
                    self.transactions.insert(transaction_id, transaction);
                    return;
                }

                self.receive_server_binding_response(now, binding_id, msg);
            }
            TransactionOwner::Turn { allocation, kind } => {
                let Some(turn_allocation) = self.allocations.get_mut(allocation) else {
                    return;
                };

                if !symmetric || !turn_allocation.verify_response(&mut msg) {
                    self.transactions.insert(transaction_id, transaction);
                    return;
                }

                let event = turn_allocation.on_response(now, kind, &mut msg);
                self.on_allocation_event(allocation, event);
            }
            TransactionOwner::Check {
                local,
                remote,
                nomination,
                controlling,
            } => {
                if transaction.generation != self.generation {
                    return;
                }

                if !self.verify_check_response(&mut msg) {
                    self.transactions.insert(transaction_id, transaction);
                    return;
                }

                self.receive_check_response(
                    now,
                    transaction.stream,
                    transaction.component,
                    CheckResponse {
                        local,
                        remote,
                        nomination,
                        controlling,
                        symmetric,
                    },
                    msg,
                );
            }
            TransactionOwner::Keepalive { local, remote } => {
                if !self.verify_check_response(&mut msg) {
                    self.transactions.insert(transaction_id, transaction);
                    return;
                }

                let Some(component_state) = self
                    .streams
                    .get_mut(transaction.stream)
                    .and_then(|s| s.component_mut(transaction.component))
                else {
                    return;
                };

                let Some(selected) = component_state
                    .selected
                    .as_mut()
                    .filter(|s| s.local == local && s.remote == remote)
                else {
                    return;
                };

                if msg.class() == Class::Success && symmetric {
                    selected.keepalive_failures = 0;
                } else {
                    selected.keepalive_failures += 1;
                    log::debug!(
                        "Keepalive failed on {:?}, {} consecutive failures",
                        transaction.component,
                        selected.keepalive_failures
                    );
                }
            }
        }
    }

    fn verify_check_response(&self, msg: &mut Message) -> bool {
        let Some(remote_credentials) = &self.remote_credentials else {
            return false;
        };

        if !verify_fingerprint(msg) || !verify_integrity(&self.local_credentials, remote_credentials, msg)
        {
            log::debug!("Incoming stun {:?} failed the integrity check, discarding", msg.class());
            return false;
        }

        true
    }

    fn receive_server_binding_response(&mut self, now: Instant, binding_id: BindingId, mut msg: Message) {
        let refresh_interval = self.config.stun.binding_refresh_interval;

        let Some(binding) = self.stun_bindings.get_mut(binding_id) else {
            return;
        };

        let (stream, component, base, server) = (
            binding.stream(),
            binding.component(),
            binding.base(),
            binding.server(),
        );

        if msg.class() == Class::Success
            && let Some(mapped) = binding.receive_stun_response(now, refresh_interval, &mut msg)
        {
            self.add_local_candidate(
                stream,
                component,
                CandidateKind::ServerReflexive,
                base,
                mapped,
                Some(base),
                Some(server.ip()),
                None,
            );

            return;
        }

        let reason = match msg.attribute::<ErrorCode>() {
            Some(Ok(error_code)) => format!("binding request failed with error code {}", error_code.number),
            _ => "binding response without mapped address".to_string(),
        };

        log::debug!("STUN binding to {server} failed, {reason}");

        if binding.on_timeout(now, refresh_interval) {
            self.events.push_back(IceEvent::CandidateSourceFailed {
                stream,
                component,
                server,
                error: Error::Stun(reason),
            });
        }
    }

    fn on_allocation_event(&mut self, allocation_id: AllocationId, event: Option<AllocationEvent>) {
        let Some(event) = event else {
            return;
        };

        let Some(allocation) = self.allocations.get(allocation_id) else {
            return;
        };

        let (stream, component, base, server) = (
            allocation.stream(),
            allocation.component(),
            allocation.base(),
            allocation.server(),
        );

        match event {
            AllocationEvent::Allocated { relayed, mapped } => {
                self.add_local_candidate(
                    stream,
                    component,
                    CandidateKind::ServerReflexive,
                    base,
                    mapped,
                    Some(base),
                    Some(server.ip()),
                    None,
                );
                self.add_local_candidate(
                    stream,
                    component,
                    CandidateKind::Relayed,
                    relayed,
                    relayed,
                    Some(mapped),
                    Some(server.ip()),
                    Some(allocation_id),
                );
            }
            AllocationEvent::Failed(error) => {
                log::debug!("TURN allocation on {server} failed, {error}");

                if let Some(component_state) = self
                    .streams
                    .get_mut(stream)
                    .and_then(|s| s.component_mut(component))
                {
                    let relayed: Vec<LocalCandidateId> = component_state
                        .local_candidates
                        .iter()
                        .filter(|(_, c)| c.allocation == Some(allocation_id))
                        .map(|(id, _)| id)
                        .collect();

                    for local_id in relayed {
                        component_state.checklist.fail_local(local_id);

                        if component_state
                            .selected
                            .as_ref()
                            .is_some_and(|s| s.local == local_id)
                        {
                            component_state.selected = None;
                        }
                    }
                }

                self.events.push_back(IceEvent::CandidateSourceFailed {
                    stream,
                    component,
                    server,
                    error,
                });
            }
        }
    }

    fn receive_check_response(
        &mut self,
        now: Instant,
        stream_id: StreamId,
        component: Component,
        response: CheckResponse,
        mut msg: Message,
    ) {
        let CheckResponse {
            local,
            remote,
            nomination,
            controlling,
            symmetric,
        } = response;

        let Some(component_state) = self
            .streams
            .get_mut(stream_id)
            .and_then(|s| s.component_mut(component))
        else {
            return;
        };

        let (Some(local_candidate), Some(remote_candidate)) = (
            component_state.local_candidates.get(local),
            component_state.remote_candidates.get(remote),
        ) else {
            return;
        };

        let Some(pair) = component_state.checklist.find(local, remote) else {
            log::debug!("Received response for pruned pair, discarding");
            return;
        };

        if msg.class() == Class::Error {
            let code = match msg.attribute::<ErrorCode>() {
                Some(Ok(error_code)) => error_code.number,
                _ => 0,
            };

            log::debug!(
                "Candidate pair {} failed with code={code}",
                DisplayPair(local_candidate, remote_candidate)
            );

            if code == ErrorCode::ROLE_CONFLICT {
                // Once the agent has switched its role, the agent MUST add the candidate pair whose check
                // generated the 487 error response to the triggered-check queue
                component_state
                    .checklist
                    .set_state(local, remote, CandidatePairState::Waiting);
                component_state.checklist.push_triggered(local, remote);

                if self.is_controlling == controlling {
                    self.switch_role(!controlling);
                }
            } else {
                component_state.checklist.set_state(local, remote, CandidatePairState::Failed);
            }

            return;
        }

        // The ICE agent MUST check that the source and destination transport addresses in the Binding request and
        // response are symmetric
        if !symmetric {
            log::debug!(
                "got success response with invalid source address for pair {}",
                DisplayPair(local_candidate, remote_candidate)
            );

            component_state.checklist.set_state(local, remote, CandidatePairState::Failed);
            return;
        }

        // A mapped address unknown to us is a local peer-reflexive candidate, it is neither signaled nor paired
        let discovered = match msg.attribute::<XorMappedAddress>() {
            Some(Ok(XorMappedAddress(mapped)))
                if mapped != local_candidate.addr
                    && local_candidate.kind == CandidateKind::Host
                    && !component_state
                        .local_candidates
                        .values()
                        .any(|c| c.addr == mapped && c.base == local_candidate.base) =>
            {
                let candidate = Candidate {
                    addr: mapped,
                    kind: CandidateKind::PeerReflexive,
                    priority: candidate_priority(
                        CandidateKind::PeerReflexive.type_preference(&self.config.type_preferences),
                        local_candidate.local_preference(),
                        component.id(),
                    ),
                    foundation: compute_foundation(
                        CandidateKind::PeerReflexive,
                        local_candidate.base.ip(),
                        None,
                        "udp",
                    ),
                    component,
                    base: local_candidate.base,
                    related: Some(local_candidate.base),
                    allocation: None,
                };

                log::debug!(
                    "Check of {} discovered local {candidate}",
                    DisplayPair(local_candidate, remote_candidate)
                );

                Some(candidate)
            }
            _ => None,
        };

        log::debug!(
            "got success response for pair {} nomination={nomination}",
            DisplayPair(local_candidate, remote_candidate),
        );

        let select = nomination || (!self.is_controlling && pair.received_use_candidate);

        if let Some(candidate) = discovered {
            component_state.local_candidates.insert(candidate);
        }

        component_state
            .checklist
            .set_state(local, remote, CandidatePairState::Succeeded);

        if select {
            self.select_pair(now, stream_id, component, local, remote);
        }
    }

    fn select_pair(
        &mut self,
        now: Instant,
        stream_id: StreamId,
        component: Component,
        local: LocalCandidateId,
        remote: RemoteCandidateId,
    ) {
        let Some(component_state) = self
            .streams
            .get_mut(stream_id)
            .and_then(|s| s.component_mut(component))
        else {
            return;
        };

        if component_state.is_selected(local, remote) {
            return;
        }

        let (Some(local_candidate), Some(remote_candidate)) = (
            component_state.local_candidates.get(local),
            component_state.remote_candidates.get(remote),
        ) else {
            return;
        };

        log::debug!(
            "selected pair {} for {component:?}",
            DisplayPair(local_candidate, remote_candidate)
        );

        self.events.push_back(IceEvent::SelectedPairChanged {
            stream: stream_id,
            component,
            local: local_candidate.addr,
            remote: remote_candidate.addr,
        });

        // Use ChannelData on the selected relayed pair
        if let Some(allocation) = local_candidate
            .allocation
            .and_then(|id| self.allocations.get_mut(id))
        {
            allocation.bind_channel(remote_candidate.addr);
        }

        if let Some(pair) = component_state.checklist.find_mut(local, remote) {
            pair.nominated = true;
        }

        component_state.selected = Some(Selected {
            local,
            remote,
            next_keepalive: now + self.config.keepalive_interval,
            keepalive_failures: 0,
        });
    }

    /// Drive the ICE agent forward. This must be called after the duration returned by [`timeout`](IceAgent::timeout).
    pub fn poll(&mut self, now: Instant) {
        if self.state == IceAgentState::Closed {
            return;
        }

        self.poll_transactions(now);
        self.poll_stun_bindings(now);
        // Permissions are requested before the checks which need them
        self.poll_allocations(now);
        self.update_nominations();
        self.poll_checks(now);
        self.poll_keepalives(now);
        self.update_gathering_state();
        self.update_state(now);
    }

    fn poll_transactions(&mut self, now: Instant) {
        for poll in self.transactions.poll(now, &self.config.stun) {
            match poll {
                TransactionPoll::Retransmit {
                    stream,
                    component,
                    route,
                    data,
                } => self.send_routed(stream, component, route, data),
                TransactionPoll::Expired(transaction_id, transaction) => {
                    log::trace!("STUN transaction {transaction_id} timed out");
                    self.on_transaction_expired(now, transaction);
                }
            }
        }
    }

    fn on_transaction_expired(&mut self, now: Instant, transaction: Transaction) {
        match transaction.owner {
            TransactionOwner::ServerBinding(binding_id) => {
                let Some(binding) = self.stun_bindings.get_mut(binding_id) else {
                    return;
                };

                if binding.on_timeout(now, self.config.stun.binding_refresh_interval) {
                    log::debug!("STUN server {} is unreachable", binding.server());

                    self.events.push_back(IceEvent::CandidateSourceFailed {
                        stream: binding.stream(),
                        component: binding.component(),
                        server: binding.server(),
                        error: Error::StunTimeout,
                    });
                }
            }
            TransactionOwner::Turn { allocation, kind } => {
                let Some(turn_allocation) = self.allocations.get_mut(allocation) else {
                    return;
                };

                let event = turn_allocation.on_timeout(now, kind);
                self.on_allocation_event(allocation, event);
            }
            TransactionOwner::Check { local, remote, .. } => {
                if transaction.generation != self.generation {
                    return;
                }

                let Some(component_state) = self
                    .streams
                    .get_mut(transaction.stream)
                    .and_then(|s| s.component_mut(transaction.component))
                else {
                    return;
                };

                if let (Some(local_candidate), Some(remote_candidate)) = (
                    component_state.local_candidates.get(local),
                    component_state.remote_candidates.get(remote),
                ) {
                    log::debug!(
                        "Connectivity check timed out for pair {}",
                        DisplayPair(local_candidate, remote_candidate)
                    );
                }

                component_state.checklist.set_state(local, remote, CandidatePairState::Failed);
            }
            TransactionOwner::Keepalive { local, remote } => {
                let Some(selected) = self
                    .streams
                    .get_mut(transaction.stream)
                    .and_then(|s| s.component_mut(transaction.component))
                    .and_then(|c| c.selected.as_mut())
                    .filter(|s| s.local == local && s.remote == remote)
                else {
                    return;
                };

                selected.keepalive_failures += 1;

                log::debug!(
                    "Keepalive timed out on {:?}, {} consecutive failures",
                    transaction.component,
                    selected.keepalive_failures
                );
            }
        }
    }

    fn poll_stun_bindings(&mut self, now: Instant) {
        let mut requests = vec![];

        for (binding_id, binding) in &mut self.stun_bindings {
            if let Some((transaction_id, request)) = binding.poll(now) {
                requests.push((
                    transaction_id,
                    binding_id,
                    binding.stream(),
                    binding.component(),
                    Route::Direct {
                        source: Some(binding.base().ip()),
                        target: binding.server(),
                    },
                    request,
                ));
            }
        }

        for (transaction_id, binding_id, stream, component, route, request) in requests {
            self.transactions.insert(
                transaction_id,
                Transaction::new(
                    now,
                    &self.config.stun,
                    self.generation,
                    TransactionOwner::ServerBinding(binding_id),
                    stream,
                    component,
                    route,
                    request.clone(),
                    self.config.stun.gather_max_retransmits,
                ),
            );

            self.send_routed(stream, component, route, request);
        }
    }

    fn poll_allocations(&mut self, now: Instant) {
        let mut requests = vec![];

        for (allocation_id, allocation) in &mut self.allocations {
            while let Some(request) = allocation.poll(now) {
                requests.push((
                    allocation_id,
                    allocation.stream(),
                    allocation.component(),
                    Route::Direct {
                        source: Some(allocation.base().ip()),
                        target: allocation.server(),
                    },
                    request,
                ));
            }
        }

        for (allocation, stream, component, route, request) in requests {
            self.transactions.insert(
                request.transaction_id,
                Transaction::new(
                    now,
                    &self.config.stun,
                    self.generation,
                    TransactionOwner::Turn {
                        allocation,
                        kind: request.kind,
                    },
                    stream,
                    component,
                    route,
                    request.data.clone(),
                    self.config.stun.max_retransmits,
                ),
            );

            self.send_routed(stream, component, route, request.data);
        }
    }

    /// Nominate a pair on every component which has no nominated pair, if controlling
    fn update_nominations(&mut self) {
        if !self.is_controlling {
            return;
        }

        for stream in self.streams.values_mut() {
            for component_state in &mut stream.components {
                if component_state.failed
                    || component_state.selected.is_some()
                    || component_state.checklist.pairs().iter().any(|p| p.nominated)
                {
                    continue;
                }

                let Some(pair) = component_state.checklist.nomination_candidate() else {
                    continue;
                };

                let (local, remote) = (pair.local, pair.remote);

                if let (Some(local_candidate), Some(remote_candidate)) = (
                    component_state.local_candidates.get(local),
                    component_state.remote_candidates.get(remote),
                ) {
                    log::debug!("nominating {}", DisplayPair(local_candidate, remote_candidate));
                }

                if let Some(pair) = component_state.checklist.find_mut(local, remote) {
                    pair.nominated = true;
                }

                // Make another binding request with use-candidate as soon as possible, by pushing it to the front of the queue
                component_state.checklist.push_nomination(local, remote);
            }
        }
    }

    fn poll_checks(&mut self, now: Instant) {
        if self.remote_credentials.is_none() {
            return;
        }

        let mut checks = vec![];

        for (stream_id, stream) in &mut self.streams {
            for component_state in &mut stream.components {
                if component_state.failed {
                    continue;
                }

                if let Some(check) = component_state
                    .checklist
                    .next_check(now, self.config.check_pacing)
                {
                    checks.push((stream_id, component_state.component, check));
                }
            }
        }

        for (stream_id, component, Check { local, remote, nomination }) in checks {
            let owner = TransactionOwner::Check {
                local,
                remote,
                nomination,
                controlling: self.is_controlling,
            };

            self.send_binding_request(now, stream_id, component, local, remote, nomination, owner);
        }
    }

    fn poll_keepalives(&mut self, now: Instant) {
        let mut keepalives = vec![];

        for (stream_id, stream) in &mut self.streams {
            for component_state in &mut stream.components {
                if let Some(selected) = &mut component_state.selected
                    && selected.next_keepalive <= now
                {
                    selected.next_keepalive = now + self.config.keepalive_interval;
                    keepalives.push((
                        stream_id,
                        component_state.component,
                        selected.local,
                        selected.remote,
                    ));
                }
            }
        }

        for (stream_id, component, local, remote) in keepalives {
            let owner = TransactionOwner::Keepalive { local, remote };

            self.send_binding_request(now, stream_id, component, local, remote, false, owner);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn send_binding_request(
        &mut self,
        now: Instant,
        stream_id: StreamId,
        component: Component,
        local: LocalCandidateId,
        remote: RemoteCandidateId,
        use_candidate: bool,
        owner: TransactionOwner,
    ) {
        let Some(remote_credentials) = &self.remote_credentials else {
            return;
        };

        let Some(component_state) = self
            .streams
            .get(stream_id)
            .and_then(|s| s.component(component))
        else {
            return;
        };

        let (Some(local_candidate), Some(remote_candidate)) = (
            component_state.local_candidates.get(local),
            component_state.remote_candidates.get(remote),
        ) else {
            return;
        };

        let transaction_id = TransactionId::random();

        // Priority of a peer-reflexive candidate the peer may learn from this request
        let priority = candidate_priority(
            CandidateKind::PeerReflexive.type_preference(&self.config.type_preferences),
            local_candidate.local_preference(),
            component.id(),
        );

        let request = make_binding_request(BindingRequest {
            transaction_id,
            local_credentials: &self.local_credentials,
            remote_credentials,
            priority,
            is_controlling: self.is_controlling,
            control_tie_breaker: self.control_tie_breaker,
            use_candidate,
        });

        let route = pair_route(local_candidate, remote_candidate);

        let request = match request {
            Ok(request) => request,
            Err(e) => {
                log::warn!("Failed to create binding request, {e}");

                if let Some(component_state) = self
                    .streams
                    .get_mut(stream_id)
                    .and_then(|s| s.component_mut(component))
                {
                    component_state.checklist.set_state(local, remote, CandidatePairState::Failed);
                }

                return;
            }
        };

        log::trace!(
            "sending binding request on pair {}, use-candidate={use_candidate}",
            DisplayPair(local_candidate, remote_candidate)
        );

        self.transactions.insert(
            transaction_id,
            Transaction::new(
                now,
                &self.config.stun,
                self.generation,
                owner,
                stream_id,
                component,
                route,
                request.clone(),
                self.config.stun.max_retransmits,
            ),
        );

        self.send_routed(stream_id, component, route, request);
    }

    fn update_gathering_state(&mut self) {
        if !self.started || self.state == IceAgentState::Closed {
            return;
        }

        let complete = self.stun_bindings.values().all(|b| b.is_completed())
            && self.allocations.values().all(|a| a.is_completed());

        let new = if complete {
            IceGatheringState::Complete
        } else {
            IceGatheringState::Gathering
        };

        if self.gathering_state != new {
            log::debug!("Gathering state {:?} -> {new:?}", self.gathering_state);

            self.events.push_back(IceEvent::GatheringStateChanged {
                old: self.gathering_state,
                new,
            });

            self.gathering_state = new;
        }
    }

    /// Detect failed components
    fn update_components(&mut self, now: Instant) {
        if self.gathering_state != IceGatheringState::Complete {
            return;
        }

        for (stream_id, stream) in &mut self.streams {
            for component_state in &mut stream.components {
                if component_state.failed || component_state.selected.is_some() {
                    component_state.failing_since = None;
                    continue;
                }

                let failed = if component_state.local_candidates.is_empty() {
                    true
                } else if component_state.checklist.all_failed() {
                    let since = *component_state.failing_since.get_or_insert(now);

                    self.remote_end_of_candidates || since + self.config.failed_timeout <= now
                } else {
                    component_state.failing_since = None;
                    false
                };

                if failed {
                    log::debug!("Component {:?} failed", component_state.component);

                    component_state.failed = true;

                    self.events.push_back(IceEvent::ComponentFailed {
                        stream: stream_id,
                        component: component_state.component,
                    });
                }
            }
        }
    }

    fn components(&self) -> impl Iterator<Item = &ComponentState> {
        self.streams.values().flat_map(|s| s.components.iter())
    }

    fn all_components_failed(&self) -> bool {
        self.components().next().is_some() && self.components().all(|c| c.failed)
    }

    fn is_connected(&self) -> bool {
        let max_failures = self.config.keepalive_max_failures;

        let mut active = self.components().filter(|c| !c.failed).peekable();

        active.peek().is_some() && active.all(|c| c.is_connected(max_failures))
    }

    fn update_state(&mut self, now: Instant) {
        self.update_components(now);

        loop {
            let next = match self.state {
                IceAgentState::New | IceAgentState::Failed | IceAgentState::Closed => None,
                IceAgentState::Gathering => {
                    let ready = {
                        let mut active = self.components().filter(|c| !c.failed).peekable();

                        active.peek().is_some()
                            && active.all(|c| !c.local_candidates.is_empty())
                            && self.components().any(|c| !c.remote_candidates.is_empty())
                    };

                    if self.all_components_failed() {
                        self.last_error = Some("all components failed".into());
                        Some(IceAgentState::Failed)
                    } else if ready {
                        Some(IceAgentState::Checking)
                    } else {
                        None
                    }
                }
                IceAgentState::Checking => {
                    if self.all_components_failed() {
                        self.last_error = Some("all candidate pairs failed".into());
                        Some(IceAgentState::Failed)
                    } else if self.is_connected() {
                        Some(IceAgentState::Connected)
                    } else {
                        None
                    }
                }
                IceAgentState::Connected => {
                    let exhausted = self.components().all(|c| c.checklist.is_exhausted());

                    if !self.is_connected() {
                        Some(IceAgentState::Disconnected)
                    } else if exhausted
                        && self
                            .connected_at
                            .is_some_and(|at| at + self.config.completed_grace <= now)
                    {
                        Some(IceAgentState::Completed)
                    } else {
                        None
                    }
                }
                IceAgentState::Completed => {
                    if self.is_connected() {
                        None
                    } else {
                        Some(IceAgentState::Disconnected)
                    }
                }
                IceAgentState::Disconnected => {
                    if self.is_connected() {
                        Some(IceAgentState::Connected)
                    } else if self
                        .disconnected_at
                        .is_some_and(|at| at + self.config.disconnected_timeout <= now)
                    {
                        self.last_error = Some("connectivity lost".into());
                        Some(IceAgentState::Failed)
                    } else {
                        None
                    }
                }
            };

            match next {
                Some(state) => self.set_state(now, state),
                None => break,
            }
        }
    }

    fn set_state(&mut self, now: Instant, new: IceAgentState) {
        if self.state == new {
            return;
        }

        log::debug!("ICE agent state {:?} -> {new:?}", self.state);

        match new {
            IceAgentState::Connected => {
                self.connected_at = Some(now);
                self.disconnected_at = None;
                self.release_retained();
            }
            IceAgentState::Disconnected => self.disconnected_at = Some(now),
            _ => {}
        }

        self.events.push_back(IceEvent::ConnectionStateChanged {
            old: self.state,
            new,
        });

        self.state = new;
    }

    /// Release the selected pairs of the previous generation
    fn release_retained(&mut self) {
        let mut allocations = vec![];

        for stream in self.streams.values_mut() {
            for component_state in &mut stream.components {
                if let Some((local, remote)) = component_state.retained.take() {
                    log::debug!("Releasing pair of previous generation {}", DisplayPair(&local, &remote));

                    allocations.extend(local.allocation);
                }
            }
        }

        // Release allocations no longer used by any candidate
        for allocation in allocations {
            let in_use = self
                .components()
                .flat_map(|c| c.local_candidates.values())
                .any(|c| c.allocation == Some(allocation));

            if !in_use {
                self.release_allocation(allocation);
            }
        }
    }

    fn release_allocation(&mut self, allocation_id: AllocationId) {
        let Some(mut allocation) = self.allocations.remove(allocation_id) else {
            return;
        };

        self.transactions.retain(|t| {
            let owned = matches!(t.owner, TransactionOwner::Turn { allocation, .. } if allocation == allocation_id);
            let relayed = matches!(t.route, Route::Relayed { allocation, .. } if allocation == allocation_id);

            !owned && !relayed
        });

        if let Some(data) = allocation.release() {
            log::debug!("Releasing TURN allocation on {}", allocation.server());

            self.events.push_back(IceEvent::SendData {
                stream: allocation.stream(),
                component: allocation.component(),
                data,
                source: Some(allocation.base().ip()),
                target: allocation.server(),
            });
        }
    }

    /// Returns the next event to process
    ///
    /// This must be called until it returns None
    pub fn pop_event(&mut self) -> Option<IceEvent> {
        self.events.pop_front()
    }

    /// Returns a duration after which to call [`poll`](IceAgent::poll)
    pub fn timeout(&self, now: Instant) -> Option<Duration> {
        if self.state == IceAgentState::Closed {
            return None;
        }

        let mut deadline = self.transactions.next_timeout();

        for binding in self.stun_bindings.values() {
            deadline = opt_min(deadline, binding.poll_at(now));
        }

        for allocation in self.allocations.values() {
            deadline = opt_min(deadline, allocation.poll_at(now));
        }

        for component_state in self.components() {
            if let Some(selected) = &component_state.selected {
                deadline = opt_min(deadline, Some(selected.next_keepalive));
            }

            if component_state.failed {
                continue;
            }

            if self.remote_credentials.is_some() {
                deadline = opt_min(
                    deadline,
                    component_state
                        .checklist
                        .next_check_at(now, self.config.check_pacing),
                );
            }

            if !self.remote_end_of_candidates
                && self.gathering_state == IceGatheringState::Complete
                && let Some(since) = component_state.failing_since
            {
                deadline = opt_min(deadline, Some(since + self.config.failed_timeout));
            }
        }

        match self.state {
            IceAgentState::Connected => {
                if self.components().all(|c| c.checklist.is_exhausted())
                    && let Some(connected_at) = self.connected_at
                {
                    deadline = opt_min(deadline, Some(connected_at + self.config.completed_grace));
                }
            }
            IceAgentState::Disconnected => {
                if let Some(disconnected_at) = self.disconnected_at {
                    deadline =
                        opt_min(deadline, Some(disconnected_at + self.config.disconnected_timeout));
                }
            }
            _ => {}
        }

        deadline.map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Restart ICE: new credentials, new candidates and new connectivity checks
    ///
    /// The currently selected pairs keep carrying data until the new generation is connected.
    /// New credentials must be sent to the peer, the remote credentials & candidates must be set again.
    pub fn restart(&mut self, now: Instant) {
        if self.state == IceAgentState::Closed {
            return;
        }

        self.generation += 1;

        log::debug!("Restarting ICE, generation {}", self.generation);

        self.local_credentials = IceCredentials::random();
        self.remote_credentials = None;
        self.remote_end_of_candidates = false;
        self.backlog.clear();

        for stream in self.streams.values_mut() {
            for component_state in &mut stream.components {
                let selected = component_state
                    .selected_candidates()
                    .map(|(local, remote)| (local.clone(), remote.clone()));

                if selected.is_some() {
                    component_state.retained = selected;
                }

                component_state.reset();
            }
        }

        // Allocations are kept and reused by the next generation, failed ones are tried again
        let failed: Vec<AllocationId> = self
            .allocations
            .iter()
            .filter(|(_, a)| a.is_failed())
            .map(|(id, _)| id)
            .collect();

        for allocation in failed {
            self.release_allocation(allocation);
        }

        self.stun_bindings.clear();
        self.transactions
            .retain(|t| matches!(t.owner, TransactionOwner::Turn { .. }));

        if self.started {
            if self.gathering_state != IceGatheringState::Gathering {
                self.events.push_back(IceEvent::GatheringStateChanged {
                    old: self.gathering_state,
                    new: IceGatheringState::Gathering,
                });
                self.gathering_state = IceGatheringState::Gathering;
            }

            self.last_error = None;
            self.connected_at = None;
            self.disconnected_at = None;
            self.set_state(now, IceAgentState::Gathering);
            self.gather();
            self.update_gathering_state();
        }
    }

    /// Close the agent, releasing all TURN allocations
    pub fn close(&mut self) {
        if self.state == IceAgentState::Closed {
            return;
        }

        let allocations: Vec<AllocationId> = self.allocations.keys().collect();

        for allocation in allocations {
            self.release_allocation(allocation);
        }

        self.transactions.clear();
        self.stun_bindings.clear();
        self.backlog.clear();

        for stream in self.streams.values_mut() {
            for component_state in &mut stream.components {
                component_state.selected = None;
                component_state.retained = None;
            }
        }

        log::debug!("ICE agent state {:?} -> Closed", self.state);

        self.events.push_back(IceEvent::ConnectionStateChanged {
            old: self.state,
            new: IceAgentState::Closed,
        });

        self.state = IceAgentState::Closed;
    }
}

struct CheckResponse {
    local: LocalCandidateId,
    remote: RemoteCandidateId,
    /// The request carried USE-CANDIDATE
    nomination: bool,
    /// The request carried ICE-CONTROLLING
    controlling: bool,
    symmetric: bool,
}
