use std::{
    cmp::min,
    net::{IpAddr, SocketAddr},
    str::FromStr,
    time::Duration,
};

/// Default port for STUN & TURN over UDP
const DEFAULT_PORT: u16 = 3478;

/// Configuration of an [`IceAgent`](crate::IceAgent)
#[derive(Debug, Clone)]
pub struct IceConfig {
    /// STUN servers used to gather server-reflexive candidates
    pub stun_servers: Vec<StunServer>,

    /// TURN servers used to gather relayed candidates
    pub turn_servers: Vec<TurnServer>,

    /// Which candidates may be used
    pub transport_policy: IceTransportPolicy,

    /// Initial role of the agent, usually the offerer is controlling
    pub controlling: bool,

    /// Minimum interval between two connectivity checks of a checklist
    pub check_pacing: Duration,

    /// Maximum number of candidate pairs in a component's checklist. Lowest priority pairs are pruned.
    pub max_checklist_size: usize,

    /// Retransmission settings of STUN & TURN transactions
    pub stun: StunConfig,

    /// Interval of STUN binding requests on a selected candidate pair
    pub keepalive_interval: Duration,

    /// Consecutive keepalive failures after which the agent considers itself disconnected
    pub keepalive_max_failures: u32,

    /// Time in the `Disconnected` state after which the agent has failed
    pub disconnected_timeout: Duration,

    /// Time a component waits for new candidates after all its candidate pairs failed,
    /// unless the peer signaled end-of-candidates
    pub failed_timeout: Duration,

    /// Minimum time in `Connected` before transitioning to `Completed`
    pub completed_grace: Duration,

    /// Type preferences used to compute candidate priorities
    pub type_preferences: TypePreferences,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![],
            turn_servers: vec![],
            transport_policy: IceTransportPolicy::All,
            controlling: false,
            check_pacing: Duration::from_millis(20),
            max_checklist_size: 100,
            stun: StunConfig::default(),
            keepalive_interval: Duration::from_secs(15),
            keepalive_max_failures: 3,
            disconnected_timeout: Duration::from_secs(30),
            failed_timeout: Duration::from_secs(30),
            completed_grace: Duration::from_secs(5),
            type_preferences: TypePreferences::default(),
        }
    }
}

/// Restricts the candidates used by the agent
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum IceTransportPolicy {
    /// Use all candidates
    #[default]
    All,
    /// Only relayed candidates are signaled and paired
    Relay,
}

/// Retransmission timings for STUN transactions
#[derive(Debug, Clone)]
pub struct StunConfig {
    /// Retransmission timeout of the first request, doubles with every retransmit
    pub initial_rto: Duration,
    /// Upper bound of a single retransmission timeout
    pub max_rto: Duration,
    /// Retransmits of connectivity checks and TURN requests before giving up (`Rc`)
    pub max_retransmits: u32,
    /// Retransmits of requests sent to STUN servers while gathering
    pub gather_max_retransmits: u32,
    /// Interval in which the binding to a STUN server is refreshed
    pub binding_refresh_interval: Duration,
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            initial_rto: Duration::from_millis(500),
            max_rto: Duration::from_millis(1500),
            max_retransmits: 7,
            gather_max_retransmits: 5,
            binding_refresh_interval: Duration::from_secs(20),
        }
    }
}

impl StunConfig {
    /// Time to wait after the given amount of retransmits
    pub(crate) fn retransmit_delta(&self, attempts: u32) -> Duration {
        let rto = self.initial_rto.saturating_mul(1u32 << attempts.min(16));

        min(rto, self.max_rto)
    }
}

/// Candidate type preferences, see [RFC8445](https://datatracker.ietf.org/doc/html/rfc8445#section-5.1.2.2)
///
/// The ordering `host > peer-reflexive > server-reflexive > relayed` must be kept.
#[derive(Debug, Clone, Copy)]
pub struct TypePreferences {
    pub host: u8,
    pub peer_reflexive: u8,
    pub server_reflexive: u8,
    pub relayed: u8,
}

impl Default for TypePreferences {
    fn default() -> Self {
        Self {
            host: 126,
            peer_reflexive: 110,
            server_reflexive: 100,
            relayed: 0,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ServerUrlError {
    #[error("unsupported url scheme, expected {0}")]
    InvalidScheme(&'static str),
    #[error("host must be an ip address")]
    InvalidHost,
    #[error("invalid port")]
    InvalidPort,
    #[error("only UDP transport is supported")]
    UnsupportedTransport,
}

/// Parse `scheme:host[:port][?transport=udp]` where host is an ip address
fn parse_server_url(url: &str, scheme: &'static str) -> Result<SocketAddr, ServerUrlError> {
    let rest = url
        .strip_prefix(scheme)
        .and_then(|rest| rest.strip_prefix(':'))
        .ok_or(ServerUrlError::InvalidScheme(scheme))?;

    let (hostport, query) = match rest.split_once('?') {
        Some((hostport, query)) => (hostport, Some(query)),
        None => (rest, None),
    };

    if let Some(query) = query
        && !query.eq_ignore_ascii_case("transport=udp")
    {
        return Err(ServerUrlError::UnsupportedTransport);
    }

    // Full socket address, including bracketed IPv6 with port
    if let Ok(addr) = SocketAddr::from_str(hostport) {
        return Ok(addr);
    }

    let host = hostport.trim_start_matches('[').trim_end_matches(']');

    if let Ok(ip) = IpAddr::from_str(host) {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    // Host parsed but the port didn't
    match hostport.rsplit_once(':') {
        Some((host, _)) if IpAddr::from_str(host).is_ok() => Err(ServerUrlError::InvalidPort),
        _ => Err(ServerUrlError::InvalidHost),
    }
}

/// STUN server used to discover server-reflexive candidates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StunServer {
    pub addr: SocketAddr,
}

impl StunServer {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl FromStr for StunServer {
    type Err = ServerUrlError;

    /// Parse a `stun:` url, e.g. `stun:192.0.2.1:3478`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_server_url(s, "stun").map(Self::new)
    }
}

/// Credential used to authenticate against a TURN server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnCredential {
    /// Fixed username & password
    Static { username: String, password: String },

    /// Time limited credentials computed from a secret shared with the TURN server,
    /// see [`turn_rest_credentials`](crate::turn_rest_credentials)
    SharedSecret {
        username: String,
        secret: String,
        ttl: Duration,
    },
}

/// TURN server used to allocate relayed candidates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnServer {
    pub addr: SocketAddr,
    pub credential: TurnCredential,
}

impl TurnServer {
    pub fn new(addr: SocketAddr, credential: TurnCredential) -> Self {
        Self { addr, credential }
    }

    /// Create a TURN server config from a `turn:` url with a static username & credential
    pub fn from_url(
        url: &str,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Result<Self, ServerUrlError> {
        Ok(Self {
            addr: parse_server_url(url, "turn")?,
            credential: TurnCredential::Static {
                username: username.into(),
                password: credential.into(),
            },
        })
    }
}
