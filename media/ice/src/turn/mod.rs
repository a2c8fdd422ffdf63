//! sans io TURN client ([RFC5766](https://datatracker.ietf.org/doc/html/rfc5766))
//!
//! A [`TurnAllocation`] only creates requests and consumes responses, sending, retransmitting and
//! correlating them is done by the agent's transaction table.

use crate::config::TurnCredential;
use crate::{Component, Error, StreamId};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant, SystemTime};
use stun_types::attributes::{
    ChannelNumber, Data, ErrorCode, Lifetime, MessageIntegrity, MessageIntegrityKey, Nonce, Realm,
    RequestedTransport, Username, XorMappedAddress, XorPeerAddress, XorRelayedAddress,
};
use stun_types::{ChannelData, Class, Message, MessageBuilder, Method, TransactionId};

mod credentials;

pub use credentials::turn_rest_credentials;

slotmap::new_key_type!(
    pub(crate) struct AllocationId;
);

const DEFAULT_LIFETIME: Duration = Duration::from_secs(600);
const PERMISSION_REFRESH: Duration = Duration::from_secs(240);
const CHANNEL_REFRESH: Duration = Duration::from_secs(540);
const MAX_STALE_NONCE_RETRIES: u32 = 3;
const PERMISSION_RETRY: Duration = Duration::from_secs(5);
const MAX_PERMISSION_RETRY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TurnRequestKind {
    Allocate,
    Refresh,
    CreatePermission(IpAddr),
    ChannelBind { channel: u16, peer: SocketAddr },
}

pub(crate) struct TurnRequest {
    pub(crate) transaction_id: TransactionId,
    pub(crate) kind: TurnRequestKind,
    pub(crate) data: Vec<u8>,
}

/// Outcome of a TURN transaction the agent must act upon
#[derive(Debug)]
pub(crate) enum AllocationEvent {
    Allocated {
        relayed: SocketAddr,
        mapped: SocketAddr,
    },
    Failed(Error),
}

struct Auth {
    realm: String,
    nonce: Vec<u8>,
    key: MessageIntegrityKey,
    /// Key of the credentials before they were renewed, responses to older requests use it
    previous_key: Option<MessageIntegrityKey>,
}

/// Username & password, renewed before they expire when derived from a shared secret
struct Credentials {
    source: TurnCredential,
    username: String,
    password: String,
    /// Wall clock time at `epoch`
    wall_clock: SystemTime,
    epoch: Option<Instant>,
    renew_at: Option<Instant>,
}

impl Credentials {
    fn new(source: TurnCredential, wall_clock: SystemTime) -> Self {
        let (username, password) = match &source {
            TurnCredential::Static { username, password } => (username.clone(), password.clone()),
            TurnCredential::SharedSecret { .. } => (String::new(), String::new()),
        };

        Self {
            source,
            username,
            password,
            wall_clock,
            epoch: None,
            renew_at: None,
        }
    }

    /// Compute new time limited credentials if the current ones are about to expire
    ///
    /// Returns if the credentials changed.
    fn renew(&mut self, now: Instant) -> bool {
        let TurnCredential::SharedSecret {
            username,
            secret,
            ttl,
        } = &self.source
        else {
            return false;
        };

        let epoch = *self.epoch.get_or_insert(now);

        if self.renew_at.is_some_and(|renew_at| renew_at > now) {
            return false;
        }

        let wall_now = self.wall_clock + now.saturating_duration_since(epoch);

        (self.username, self.password) = turn_rest_credentials(username, secret, *ttl, wall_now);
        self.renew_at = Some(now + refresh_delta(*ttl));

        true
    }
}

enum AllocationState {
    /// Allocate request must be sent
    Waiting,
    /// Allocate request is in flight
    Allocating { transaction_id: TransactionId },
    Allocated {
        relayed: SocketAddr,
        mapped: SocketAddr,
        refresh_at: Instant,
        expires_at: Instant,
        refreshing: Option<TransactionId>,
    },
    Failed,
    /// Deleted using a refresh with a lifetime of 0
    Released,
}

/// State of a permission or channel binding
#[derive(Debug, Clone, Copy, PartialEq)]
enum PermissionState {
    /// Request must be sent
    Waiting,
    InProgress { transaction_id: TransactionId },
    Installed { refresh_at: Instant },
    Failed { retry_at: Instant },
}

impl PermissionState {
    fn poll_at(&self, now: Instant) -> Option<Instant> {
        match *self {
            PermissionState::Waiting => Some(now),
            PermissionState::Installed { refresh_at } => Some(refresh_at),
            PermissionState::Failed { retry_at } => Some(retry_at),
            PermissionState::InProgress { .. } => None,
        }
    }

    fn is_due(&self, now: Instant) -> bool {
        self.poll_at(now).is_some_and(|at| at <= now)
    }
}

struct Channel {
    number: u16,
    state: PermissionState,
}

pub(crate) struct TurnAllocation {
    server: SocketAddr,
    stream: StreamId,
    component: Component,
    /// Host address the allocation is made from
    base: SocketAddr,

    credentials: Credentials,
    auth: Option<Auth>,
    stale_nonce_retries: u32,

    state: AllocationState,

    permissions: HashMap<IpAddr, PermissionState>,
    /// Consecutive failures per permission, the retry delay doubles with each
    permission_failures: HashMap<IpAddr, u32>,
    channels: HashMap<SocketAddr, Channel>,
    next_channel: u16,
}

impl TurnAllocation {
    pub(crate) fn new(
        server: SocketAddr,
        stream: StreamId,
        component: Component,
        base: SocketAddr,
        credential: TurnCredential,
        wall_clock: SystemTime,
    ) -> Self {
        Self {
            server,
            stream,
            component,
            base,
            credentials: Credentials::new(credential, wall_clock),
            auth: None,
            stale_nonce_retries: 0,
            state: AllocationState::Waiting,
            permissions: HashMap::new(),
            permission_failures: HashMap::new(),
            channels: HashMap::new(),
            next_channel: ChannelNumber::MIN,
        }
    }

    pub(crate) fn server(&self) -> SocketAddr {
        self.server
    }

    pub(crate) fn stream(&self) -> StreamId {
        self.stream
    }

    pub(crate) fn component(&self) -> Component {
        self.component
    }

    pub(crate) fn base(&self) -> SocketAddr {
        self.base
    }

    pub(crate) fn relayed_addr(&self) -> Option<SocketAddr> {
        self.addresses().map(|(relayed, _)| relayed)
    }

    /// Relayed and server-reflexive address of the allocation, once allocated
    pub(crate) fn addresses(&self) -> Option<(SocketAddr, SocketAddr)> {
        match self.state {
            AllocationState::Allocated {
                relayed, mapped, ..
            } => Some((relayed, mapped)),
            _ => None,
        }
    }

    pub(crate) fn is_failed(&self) -> bool {
        matches!(self.state, AllocationState::Failed)
    }

    /// Returns if the allocation either succeeded or failed
    pub(crate) fn is_completed(&self) -> bool {
        match self.state {
            AllocationState::Waiting | AllocationState::Allocating { .. } => false,
            AllocationState::Allocated { .. }
            | AllocationState::Failed
            | AllocationState::Released => true,
        }
    }

    /// Request a permission for the peer's ip, required to exchange data with it
    pub(crate) fn add_permission(&mut self, ip: IpAddr) {
        self.permissions
            .entry(ip)
            .or_insert(PermissionState::Waiting);
    }

    /// Bind a channel to the peer, data is then sent using ChannelData messages instead of Send indications
    pub(crate) fn bind_channel(&mut self, peer: SocketAddr) {
        if self.channels.contains_key(&peer) || self.next_channel > ChannelNumber::MAX {
            return;
        }

        let number = self.next_channel;
        self.next_channel += 1;

        log::debug!("Binding channel {number:#x} to {peer} on allocation of {}", self.server);

        self.channels.insert(
            peer,
            Channel {
                number,
                state: PermissionState::Waiting,
            },
        );
    }

    pub(crate) fn poll_at(&self, now: Instant) -> Option<Instant> {
        match &self.state {
            AllocationState::Waiting => Some(now),
            AllocationState::Allocated {
                refresh_at,
                refreshing,
                ..
            } => {
                let refresh = refreshing.is_none().then_some(*refresh_at);

                let permissions = self.permissions.values().filter_map(|p| p.poll_at(now));
                let channels = self.channels.values().filter_map(|c| c.state.poll_at(now));

                refresh.into_iter().chain(permissions).chain(channels).min()
            }
            AllocationState::Allocating { .. }
            | AllocationState::Failed
            | AllocationState::Released => None,
        }
    }

    /// Returns the next request to send to the server. Must be called until it returns `None`.
    pub(crate) fn poll(&mut self, now: Instant) -> Option<TurnRequest> {
        self.renew_credentials(now);

        match &mut self.state {
            AllocationState::Waiting => {
                let transaction_id = TransactionId::random();
                self.state = AllocationState::Allocating { transaction_id };

                self.make_tracked(now, transaction_id, TurnRequestKind::Allocate)
            }
            AllocationState::Allocated {
                refresh_at,
                refreshing,
                ..
            } => {
                if refreshing.is_none() && *refresh_at <= now {
                    let transaction_id = TransactionId::random();
                    *refreshing = Some(transaction_id);

                    return self.make_tracked(now, transaction_id, TurnRequestKind::Refresh);
                }

                if let Some((&ip, state)) = self
                    .permissions
                    .iter_mut()
                    .find(|(_, state)| state.is_due(now))
                {
                    let transaction_id = TransactionId::random();
                    *state = PermissionState::InProgress { transaction_id };

                    return self
                        .make_tracked(now, transaction_id, TurnRequestKind::CreatePermission(ip));
                }

                if let Some((&peer, channel)) = self
                    .channels
                    .iter_mut()
                    .find(|(_, channel)| channel.state.is_due(now))
                {
                    let transaction_id = TransactionId::random();
                    channel.state = PermissionState::InProgress { transaction_id };
                    let channel = channel.number;

                    return self.make_tracked(
                        now,
                        transaction_id,
                        TurnRequestKind::ChannelBind { channel, peer },
                    );
                }

                None
            }
            AllocationState::Allocating { .. }
            | AllocationState::Failed
            | AllocationState::Released => None,
        }
    }

    fn renew_credentials(&mut self, now: Instant) {
        if !self.credentials.renew(now) {
            return;
        }

        log::debug!(
            "Using TURN username {} for allocation on {}",
            self.credentials.username,
            self.server
        );

        if let Some(auth) = &mut self.auth {
            let key = MessageIntegrityKey::long_term(
                &self.credentials.username,
                &auth.realm,
                &self.credentials.password,
            );

            auth.previous_key = Some(std::mem::replace(&mut auth.key, key));
        }
    }

    fn make_tracked(
        &mut self,
        now: Instant,
        transaction_id: TransactionId,
        kind: TurnRequestKind,
    ) -> Option<TurnRequest> {
        let data = match kind {
            TurnRequestKind::Allocate => self.make_request(Method::Allocate, transaction_id, |b| {
                b.add_attr(RequestedTransport::UDP);
            }),
            TurnRequestKind::Refresh => self.make_request(Method::Refresh, transaction_id, |b| {
                b.add_attr(Lifetime(DEFAULT_LIFETIME.as_secs() as u32));
            }),
            TurnRequestKind::CreatePermission(ip) => {
                self.make_request(Method::CreatePermission, transaction_id, |b| {
                    b.add_attr(XorPeerAddress(SocketAddr::new(ip, 0)));
                })
            }
            TurnRequestKind::ChannelBind { channel, peer } => {
                self.make_request(Method::ChannelBind, transaction_id, |b| {
                    b.add_attr(ChannelNumber(channel));
                    b.add_attr(XorPeerAddress(peer));
                })
            }
        };

        match data {
            Ok(data) => Some(TurnRequest {
                transaction_id,
                kind,
                data,
            }),
            Err(e) => {
                log::warn!("Failed to build TURN {kind:?} request, {e}");
                self.fail_request(now, kind);
                None
            }
        }
    }

    /// Build a request, authenticated once the server's realm & nonce are known
    fn make_request(
        &self,
        method: Method,
        transaction_id: TransactionId,
        add_attributes: impl FnOnce(&mut MessageBuilder),
    ) -> Result<Vec<u8>, stun_types::Error> {
        let mut builder = MessageBuilder::new(Class::Request, method, transaction_id);

        add_attributes(&mut builder);

        if let Some(auth) = &self.auth {
            builder.add_attr(Username::new(&self.credentials.username));
            builder.add_attr(Realm::new(&auth.realm));
            builder.add_attr(Nonce::new(&auth.nonce));
            builder.add_attr_with(MessageIntegrity, auth.key.clone());
        }

        builder.finish()
    }

    /// Mark a request as failed, permissions are retried with an increasing delay
    fn fail_request(&mut self, now: Instant, kind: TurnRequestKind) {
        match kind {
            TurnRequestKind::Allocate | TurnRequestKind::Refresh => {
                self.state = AllocationState::Failed;
            }
            TurnRequestKind::CreatePermission(ip) => {
                let failures = self.permission_failures.entry(ip).or_default();
                *failures += 1;

                let delay = PERMISSION_RETRY
                    .saturating_mul(1 << (*failures - 1).min(16))
                    .min(MAX_PERMISSION_RETRY);

                log::debug!("Retrying permission for {ip} in {}s", delay.as_secs());

                self.permissions.insert(
                    ip,
                    PermissionState::Failed {
                        retry_at: now + delay,
                    },
                );
            }
            TurnRequestKind::ChannelBind { peer, .. } => {
                self.channels.remove(&peer);
            }
        }
    }

    /// Retry a request which was rejected because of a stale nonce
    fn retry_request(&mut self, now: Instant, kind: TurnRequestKind) {
        match kind {
            TurnRequestKind::Allocate => self.state = AllocationState::Waiting,
            TurnRequestKind::Refresh => {
                if let AllocationState::Allocated {
                    refresh_at,
                    refreshing,
                    ..
                } = &mut self.state
                {
                    *refresh_at = now;
                    *refreshing = None;
                }
            }
            TurnRequestKind::CreatePermission(ip) => {
                self.permissions.insert(ip, PermissionState::Waiting);
            }
            TurnRequestKind::ChannelBind { peer, .. } => {
                if let Some(channel) = self.channels.get_mut(&peer) {
                    channel.state = PermissionState::Waiting;
                }
            }
        }
    }

    /// Verify the integrity of a response, if the allocation is authenticated
    pub(crate) fn verify_response(&self, msg: &mut Message) -> bool {
        let Some(auth) = &self.auth else {
            return true;
        };

        // Challenges are not authenticated
        if msg.class() == Class::Error
            && let Some(Ok(error_code)) = msg.attribute::<ErrorCode>()
            && matches!(
                error_code.number,
                ErrorCode::UNAUTHORIZED | ErrorCode::STALE_NONCE
            )
        {
            return true;
        }

        match msg.attribute_with::<MessageIntegrity>(auth.key.clone()) {
            Some(Ok(_)) => true,
            Some(Err(e)) => {
                // Response to a request sent before the credentials were renewed
                if let Some(previous_key) = &auth.previous_key
                    && let Some(Ok(_)) = msg.attribute_with::<MessageIntegrity>(previous_key.clone())
                {
                    return true;
                }

                log::debug!("TURN response from {} failed integrity check, {e}", self.server);
                false
            }
            // Some servers don't authenticate their responses
            None => true,
        }
    }

    /// Receive the response to a request created by [`poll`](Self::poll)
    pub(crate) fn on_response(
        &mut self,
        now: Instant,
        kind: TurnRequestKind,
        msg: &mut Message,
    ) -> Option<AllocationEvent> {
        match msg.class() {
            Class::Success => self.on_success(now, kind, msg),
            Class::Error => self.on_error(now, kind, msg),
            Class::Request | Class::Indication => None,
        }
    }

    fn on_success(
        &mut self,
        now: Instant,
        kind: TurnRequestKind,
        msg: &mut Message,
    ) -> Option<AllocationEvent> {
        let lifetime = match msg.attribute::<Lifetime>() {
            Some(Ok(lifetime)) => Duration::from_secs(lifetime.0.into()),
            _ => DEFAULT_LIFETIME,
        };

        self.stale_nonce_retries = 0;

        match kind {
            TurnRequestKind::Allocate => {
                let relayed = msg.attribute::<XorRelayedAddress>().and_then(Result::ok);
                let mapped = msg.attribute::<XorMappedAddress>().and_then(Result::ok);

                let (Some(relayed), Some(mapped)) = (relayed, mapped) else {
                    self.state = AllocationState::Failed;
                    return Some(AllocationEvent::Failed(Error::Stun(
                        "allocate response is missing the relayed or mapped address".into(),
                    )));
                };

                log::debug!(
                    "Allocated {} on {} with lifetime {}s",
                    relayed.0,
                    self.server,
                    lifetime.as_secs()
                );

                self.state = AllocationState::Allocated {
                    relayed: relayed.0,
                    mapped: mapped.0,
                    refresh_at: now + refresh_delta(lifetime),
                    expires_at: now + lifetime,
                    refreshing: None,
                };

                Some(AllocationEvent::Allocated {
                    relayed: relayed.0,
                    mapped: mapped.0,
                })
            }
            TurnRequestKind::Refresh => {
                if let AllocationState::Allocated {
                    refresh_at,
                    expires_at,
                    refreshing,
                    ..
                } = &mut self.state
                {
                    *refresh_at = now + refresh_delta(lifetime);
                    *expires_at = now + lifetime;
                    *refreshing = None;
                }

                None
            }
            TurnRequestKind::CreatePermission(ip) => {
                self.permission_failures.remove(&ip);
                self.permissions.insert(
                    ip,
                    PermissionState::Installed {
                        refresh_at: now + PERMISSION_REFRESH,
                    },
                );

                None
            }
            TurnRequestKind::ChannelBind { peer, .. } => {
                if let Some(channel) = self.channels.get_mut(&peer) {
                    channel.state = PermissionState::Installed {
                        refresh_at: now + CHANNEL_REFRESH,
                    };
                }

                None
            }
        }
    }

    fn on_error(
        &mut self,
        now: Instant,
        kind: TurnRequestKind,
        msg: &mut Message,
    ) -> Option<AllocationEvent> {
        let (code, reason) = match msg.attribute::<ErrorCode>() {
            Some(Ok(error_code)) => (error_code.number, error_code.reason.to_string()),
            _ => (0, String::new()),
        };

        log::debug!("TURN {kind:?} request to {} failed, {code} {reason}", self.server);

        match code {
            ErrorCode::UNAUTHORIZED if self.auth.is_none() && kind == TurnRequestKind::Allocate => {
                let realm = msg
                    .attribute::<Realm>()
                    .and_then(Result::ok)
                    .map(|realm| realm.0.to_string());
                let nonce = msg
                    .attribute::<Nonce>()
                    .and_then(Result::ok)
                    .map(|nonce| nonce.0.to_vec());

                if let (Some(realm), Some(nonce)) = (realm, nonce) {
                    let key = MessageIntegrityKey::long_term(
                        &self.credentials.username,
                        &realm,
                        &self.credentials.password,
                    );
                    self.auth = Some(Auth {
                        realm,
                        nonce,
                        key,
                        previous_key: None,
                    });
                    self.state = AllocationState::Waiting;

                    return None;
                }
            }
            ErrorCode::STALE_NONCE if self.stale_nonce_retries < MAX_STALE_NONCE_RETRIES => {
                let nonce = msg
                    .attribute::<Nonce>()
                    .and_then(Result::ok)
                    .map(|nonce| nonce.0.to_vec());

                if let (Some(auth), Some(nonce)) = (&mut self.auth, nonce) {
                    auth.nonce = nonce;
                    self.stale_nonce_retries += 1;
                    self.retry_request(now, kind);

                    return None;
                }
            }
            _ => {}
        }

        match kind {
            TurnRequestKind::Allocate | TurnRequestKind::Refresh => {
                self.state = AllocationState::Failed;

                let error = if code == ErrorCode::ALLOCATION_QUOTA_REACHED {
                    Error::TurnAllocationQuota
                } else {
                    Error::TurnError { code, reason }
                };

                Some(AllocationEvent::Failed(error))
            }
            TurnRequestKind::CreatePermission(..) | TurnRequestKind::ChannelBind { .. } => {
                self.fail_request(now, kind);
                None
            }
        }
    }

    /// The transaction of the request timed out
    pub(crate) fn on_timeout(&mut self, now: Instant, kind: TurnRequestKind) -> Option<AllocationEvent> {
        log::debug!("TURN {kind:?} request to {} timed out", self.server);

        match kind {
            TurnRequestKind::Allocate => {
                self.state = AllocationState::Failed;
                Some(AllocationEvent::Failed(Error::StunTimeout))
            }
            TurnRequestKind::Refresh => {
                let AllocationState::Allocated {
                    refresh_at,
                    expires_at,
                    refreshing,
                    ..
                } = &mut self.state
                else {
                    return None;
                };

                if *expires_at <= now {
                    self.state = AllocationState::Failed;
                    return Some(AllocationEvent::Failed(Error::StunTimeout));
                }

                // Try again while the allocation is still alive
                *refresh_at = now;
                *refreshing = None;

                None
            }
            TurnRequestKind::CreatePermission(..) | TurnRequestKind::ChannelBind { .. } => {
                self.fail_request(now, kind);
                None
            }
        }
    }

    /// Wrap data to send to a peer through the allocation
    ///
    /// Uses ChannelData if a channel is bound to the peer, a Send indication otherwise.
    pub(crate) fn wrap(&mut self, peer: SocketAddr, data: &[u8]) -> Result<Vec<u8>, stun_types::Error> {
        self.add_permission(peer.ip());

        if let Some(channel) = self.channels.get(&peer)
            && matches!(channel.state, PermissionState::Installed { .. })
        {
            return Ok(ChannelData::new(channel.number, data).to_vec());
        }

        let mut builder =
            MessageBuilder::new(Class::Indication, Method::Send, TransactionId::random());
        builder.add_attr(XorPeerAddress(peer));
        builder.add_attr(Data::new(data));
        builder.finish()
    }

    /// Unwrap a Data indication received from the server
    pub(crate) fn unwrap_indication(&self, msg: &mut Message) -> Option<(SocketAddr, Vec<u8>)> {
        if msg.class() != Class::Indication || msg.method() != Method::Data {
            return None;
        }

        let peer = msg.attribute::<XorPeerAddress>()?.ok()?.0;
        let data = msg.attribute::<Data>()?.ok()?.0.to_vec();

        Some((peer, data))
    }

    /// Unwrap a ChannelData message received from the server
    pub(crate) fn unwrap_channel_data(&self, data: &[u8]) -> Option<(SocketAddr, Vec<u8>)> {
        let channel_data = ChannelData::parse(data).ok()?;

        let (peer, _) = self.channels.iter().find(|(_, channel)| {
            channel.number == channel_data.channel
                && !matches!(channel.state, PermissionState::Failed { .. })
        })?;

        Some((*peer, channel_data.data.to_vec()))
    }

    /// Delete the allocation on the server. The returned request must be sent, but not tracked.
    pub(crate) fn release(&mut self) -> Option<Vec<u8>> {
        if !matches!(self.state, AllocationState::Allocated { .. }) {
            self.state = AllocationState::Released;
            return None;
        }

        let data = self.make_request(Method::Refresh, TransactionId::random(), |b| {
            b.add_attr(Lifetime(0));
        });

        self.state = AllocationState::Released;

        match data {
            Ok(data) => Some(data),
            Err(e) => {
                log::warn!("Failed to build TURN release request, {e}");
                None
            }
        }
    }
}

fn refresh_delta(lifetime: Duration) -> Duration {
    if lifetime > Duration::from_secs(120) {
        lifetime - Duration::from_secs(60)
    } else {
        lifetime / 2
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use slotmap::KeyData;

    const SERVER: &str = "198.51.100.1:3478";
    const RELAYED: &str = "198.51.100.1:50000";
    const MAPPED: &str = "203.0.113.9:40000";

    fn allocation() -> TurnAllocation {
        TurnAllocation::new(
            SERVER.parse().unwrap(),
            StreamId::from(KeyData::from_ffi(1)),
            Component::Rtp,
            "10.0.0.1:5000".parse().unwrap(),
            TurnCredential::Static {
                username: "user".into(),
                password: "pass".into(),
            },
            SystemTime::UNIX_EPOCH,
        )
    }

    fn response(
        class: Class,
        method: Method,
        transaction_id: TransactionId,
        f: impl FnOnce(&mut MessageBuilder),
    ) -> Message {
        let mut builder = MessageBuilder::new(class, method, transaction_id);
        f(&mut builder);
        Message::parse(builder.finish().unwrap()).unwrap()
    }

    fn challenge(transaction_id: TransactionId, code: u16) -> Message {
        response(Class::Error, Method::Allocate, transaction_id, |b| {
            b.add_attr(ErrorCode {
                number: code,
                reason: "",
            });
            b.add_attr(Realm::new("example.org"));
            b.add_attr(Nonce::new(b"nonce-1"));
        })
    }

    fn allocated(allocation: &mut TurnAllocation, now: Instant) {
        let request = allocation.poll(now).unwrap();
        allocation.on_response(now, request.kind, &mut challenge(request.transaction_id, 401));

        let request = allocation.poll(now).unwrap();
        let key = MessageIntegrityKey::long_term("user", "example.org", "pass");

        let mut success = response(Class::Success, Method::Allocate, request.transaction_id, |b| {
            b.add_attr(XorRelayedAddress(RELAYED.parse().unwrap()));
            b.add_attr(XorMappedAddress(MAPPED.parse().unwrap()));
            b.add_attr(Lifetime(600));
            b.add_attr_with(MessageIntegrity, key);
        });

        assert!(allocation.verify_response(&mut success));

        let event = allocation.on_response(now, request.kind, &mut success);
        assert!(matches!(event, Some(AllocationEvent::Allocated { .. })));
    }

    #[test]
    fn allocate_with_challenge() {
        let now = Instant::now();
        let mut allocation = allocation();

        let request = allocation.poll(now).unwrap();
        assert_eq!(request.kind, TurnRequestKind::Allocate);
        assert!(allocation.poll(now).is_none());

        let mut msg = Message::parse(request.data).unwrap();
        assert!(msg.attribute::<Username>().is_none());

        // 401 challenge provides realm & nonce
        let event = allocation.on_response(now, request.kind, &mut challenge(request.transaction_id, 401));
        assert!(event.is_none());
        assert!(!allocation.is_completed());

        let request = allocation.poll(now).unwrap();
        let mut msg = Message::parse(request.data).unwrap();
        assert_eq!(msg.attribute::<Username>().unwrap().unwrap().0, "user");
        assert_eq!(msg.attribute::<Realm>().unwrap().unwrap().0, "example.org");
        msg.attribute_with::<MessageIntegrity>(MessageIntegrityKey::long_term(
            "user",
            "example.org",
            "pass",
        ))
        .unwrap()
        .unwrap();

        let mut success = response(Class::Success, Method::Allocate, request.transaction_id, |b| {
            b.add_attr(XorRelayedAddress(RELAYED.parse().unwrap()));
            b.add_attr(XorMappedAddress(MAPPED.parse().unwrap()));
            b.add_attr(Lifetime(600));
        });

        match allocation.on_response(now, request.kind, &mut success) {
            Some(AllocationEvent::Allocated { relayed, mapped }) => {
                assert_eq!(relayed, RELAYED.parse().unwrap());
                assert_eq!(mapped, MAPPED.parse().unwrap());
            }
            event => panic!("unexpected {event:?}"),
        }

        assert!(allocation.is_completed());
        assert_eq!(allocation.poll_at(now), Some(now + Duration::from_secs(540)));
    }

    #[test]
    fn quota_reached() {
        let now = Instant::now();
        let mut allocation = allocation();

        let request = allocation.poll(now).unwrap();
        allocation.on_response(now, request.kind, &mut challenge(request.transaction_id, 401));

        let request = allocation.poll(now).unwrap();
        let mut error = response(Class::Error, Method::Allocate, request.transaction_id, |b| {
            b.add_attr(ErrorCode {
                number: ErrorCode::ALLOCATION_QUOTA_REACHED,
                reason: "Allocation Quota Reached",
            });
        });

        let event = allocation.on_response(now, request.kind, &mut error);
        assert!(matches!(
            event,
            Some(AllocationEvent::Failed(Error::TurnAllocationQuota))
        ));
        assert!(allocation.is_completed());
        assert!(allocation.relayed_addr().is_none());
        assert!(allocation.poll(now).is_none());
    }

    #[test]
    fn stale_nonce_retry() {
        let now = Instant::now();
        let mut allocation = allocation();
        allocated(&mut allocation, now);

        allocation.add_permission("192.0.2.7".parse().unwrap());

        let request = allocation.poll(now).unwrap();
        assert!(matches!(request.kind, TurnRequestKind::CreatePermission(..)));

        let mut stale = response(
            Class::Error,
            Method::CreatePermission,
            request.transaction_id,
            |b| {
                b.add_attr(ErrorCode {
                    number: ErrorCode::STALE_NONCE,
                    reason: "Stale Nonce",
                });
                b.add_attr(Nonce::new(b"nonce-2"));
            },
        );
        assert!(allocation.verify_response(&mut stale));
        allocation.on_response(now, request.kind, &mut stale);

        // Retried with the new nonce
        let request = allocation.poll(now).unwrap();
        assert!(matches!(request.kind, TurnRequestKind::CreatePermission(..)));

        let mut msg = Message::parse(request.data).unwrap();
        assert_eq!(msg.attribute::<Nonce>().unwrap().unwrap().0, b"nonce-2");
    }

    #[test]
    fn repeated_stale_nonces_keep_allocation() {
        let mut now = Instant::now();
        let mut allocation = allocation();
        allocated(&mut allocation, now);

        // The server rotates its nonce before every refresh
        for round in 2..6 {
            now += Duration::from_secs(540);

            let request = allocation.poll(now).unwrap();
            assert_eq!(request.kind, TurnRequestKind::Refresh);

            let nonce = format!("nonce-{round}");
            let mut stale = response(Class::Error, Method::Refresh, request.transaction_id, |b| {
                b.add_attr(ErrorCode {
                    number: ErrorCode::STALE_NONCE,
                    reason: "Stale Nonce",
                });
                b.add_attr(Nonce::new(nonce.as_bytes()));
            });
            assert!(allocation.on_response(now, request.kind, &mut stale).is_none());

            let request = allocation.poll(now).unwrap();
            assert_eq!(request.kind, TurnRequestKind::Refresh);

            let mut msg = Message::parse(request.data).unwrap();
            assert_eq!(msg.attribute::<Nonce>().unwrap().unwrap().0, nonce.as_bytes());

            let mut success = response(Class::Success, Method::Refresh, request.transaction_id, |b| {
                b.add_attr(Lifetime(600));
            });
            assert!(allocation.on_response(now, request.kind, &mut success).is_none());
        }

        assert!(!allocation.is_failed());
        assert_eq!(allocation.relayed_addr(), Some(RELAYED.parse().unwrap()));
        assert_eq!(allocation.poll_at(now), Some(now + Duration::from_secs(540)));
    }

    #[test]
    fn failed_permission_is_retried() {
        let now = Instant::now();
        let mut allocation = allocation();
        allocated(&mut allocation, now);

        let ip: IpAddr = "192.0.2.7".parse().unwrap();
        allocation.add_permission(ip);

        let request = allocation.poll(now).unwrap();
        assert_eq!(request.kind, TurnRequestKind::CreatePermission(ip));

        let mut forbidden = response(
            Class::Error,
            Method::CreatePermission,
            request.transaction_id,
            |b| {
                b.add_attr(ErrorCode {
                    number: 403,
                    reason: "Forbidden",
                });
            },
        );
        assert!(allocation.on_response(now, request.kind, &mut forbidden).is_none());

        // Sending data to the peer does not skip the delay
        allocation.wrap(SocketAddr::new(ip, 6000), b"hello").unwrap();
        assert!(allocation.poll(now).is_none());
        assert_eq!(allocation.poll_at(now), Some(now + PERMISSION_RETRY));

        let retry = now + PERMISSION_RETRY;
        let request = allocation.poll(retry).unwrap();
        assert_eq!(request.kind, TurnRequestKind::CreatePermission(ip));

        // The delay doubles with every failure
        assert!(allocation.on_timeout(retry, request.kind).is_none());
        assert_eq!(allocation.poll_at(retry), Some(retry + PERMISSION_RETRY * 2));

        let retry = retry + PERMISSION_RETRY * 2;
        let request = allocation.poll(retry).unwrap();
        assert_eq!(request.kind, TurnRequestKind::CreatePermission(ip));

        let mut success = response(
            Class::Success,
            Method::CreatePermission,
            request.transaction_id,
            |_| {},
        );
        allocation.on_response(retry, request.kind, &mut success);

        assert!(!allocation.is_failed());
        assert_eq!(allocation.poll_at(retry), Some(retry + PERMISSION_REFRESH));
    }

    #[test]
    fn shared_secret_credentials_are_renewed() {
        let wall_clock = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let ttl = Duration::from_secs(120);

        let mut allocation = TurnAllocation::new(
            SERVER.parse().unwrap(),
            StreamId::from(KeyData::from_ffi(1)),
            Component::Rtp,
            "10.0.0.1:5000".parse().unwrap(),
            TurnCredential::SharedSecret {
                username: "alice".into(),
                secret: "north".into(),
                ttl,
            },
            wall_clock,
        );

        let now = Instant::now();

        let request = allocation.poll(now).unwrap();
        allocation.on_response(now, request.kind, &mut challenge(request.transaction_id, 401));

        let request = allocation.poll(now).unwrap();
        let mut msg = Message::parse(request.data).unwrap();
        assert_eq!(msg.attribute::<Username>().unwrap().unwrap().0, "1700000120:alice");

        let mut success = response(Class::Success, Method::Allocate, request.transaction_id, |b| {
            b.add_attr(XorRelayedAddress(RELAYED.parse().unwrap()));
            b.add_attr(XorMappedAddress(MAPPED.parse().unwrap()));
            b.add_attr(Lifetime(600));
        });
        assert!(matches!(
            allocation.on_response(now, request.kind, &mut success),
            Some(AllocationEvent::Allocated { .. })
        ));

        // Half of the ttl passed, the next request uses new credentials
        let later = now + Duration::from_secs(61);
        allocation.add_permission("192.0.2.7".parse().unwrap());

        let request = allocation.poll(later).unwrap();
        let (username, password) =
            turn_rest_credentials("alice", "north", ttl, wall_clock + Duration::from_secs(61));
        assert_eq!(username, "1700000181:alice");

        let mut msg = Message::parse(request.data).unwrap();
        assert_eq!(msg.attribute::<Username>().unwrap().unwrap().0, username);
        msg.attribute_with::<MessageIntegrity>(MessageIntegrityKey::long_term(
            &username,
            "example.org",
            &password,
        ))
        .unwrap()
        .unwrap();

        // Responses signed with the previous credentials are still accepted
        let (old_username, old_password) = turn_rest_credentials("alice", "north", ttl, wall_clock);
        let old_key = MessageIntegrityKey::long_term(&old_username, "example.org", &old_password);

        let mut success = response(
            Class::Success,
            Method::CreatePermission,
            request.transaction_id,
            |b| b.add_attr_with(MessageIntegrity, old_key),
        );
        assert!(allocation.verify_response(&mut success));
    }

    #[test]
    fn wrap_and_unwrap() {
        let now = Instant::now();
        let mut allocation = allocation();
        allocated(&mut allocation, now);

        let peer: SocketAddr = "192.0.2.7:6000".parse().unwrap();

        // No channel yet, data is sent using a Send indication
        let wrapped = allocation.wrap(peer, b"hello").unwrap();
        let mut msg = Message::parse(wrapped).unwrap();
        assert_eq!(msg.method(), Method::Send);
        assert_eq!(msg.attribute::<XorPeerAddress>().unwrap().unwrap().0, peer);
        assert_eq!(msg.attribute::<Data>().unwrap().unwrap().0, b"hello");

        allocation.bind_channel(peer);

        let permission = allocation.poll(now).unwrap();
        assert!(matches!(permission.kind, TurnRequestKind::CreatePermission(..)));
        let bind = allocation.poll(now).unwrap();
        assert_eq!(
            bind.kind,
            TurnRequestKind::ChannelBind {
                channel: 0x4000,
                peer
            }
        );

        let mut success = response(Class::Success, Method::ChannelBind, bind.transaction_id, |_| {});
        allocation.on_response(now, bind.kind, &mut success);

        let wrapped = allocation.wrap(peer, b"hello").unwrap();
        assert_eq!(&wrapped[..4], [0x40, 0x00, 0x00, 0x05]);
        assert_eq!(
            allocation.unwrap_channel_data(&wrapped),
            Some((peer, b"hello".to_vec()))
        );

        let mut indication = response(Class::Indication, Method::Data, TransactionId::random(), |b| {
            b.add_attr(XorPeerAddress(peer));
            b.add_attr(Data::new(b"world"));
        });
        assert_eq!(
            allocation.unwrap_indication(&mut indication),
            Some((peer, b"world".to_vec()))
        );
    }

    #[test]
    fn release() {
        let now = Instant::now();
        let mut allocation = allocation();
        allocated(&mut allocation, now);

        let request = allocation.release().unwrap();
        let mut msg = Message::parse(request).unwrap();
        assert_eq!(msg.method(), Method::Refresh);
        assert_eq!(msg.attribute::<Lifetime>().unwrap().unwrap().0, 0);

        assert!(allocation.release().is_none());
        assert!(allocation.poll(now).is_none());
    }
}
