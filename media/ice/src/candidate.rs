use crate::Component;
use crate::config::TypePreferences;
use crate::turn::AllocationId;
use nom::IResult;
use nom::bytes::complete::{tag, take_while1, take_while_m_n};
use nom::character::complete::{digit1, space1};
use nom::combinator::{map_res, opt};
use nom::multi::many0;
use nom::sequence::{preceded, tuple};
use std::cmp::{max, min};
use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

slotmap::new_key_type!(
    pub(crate) struct LocalCandidateId;
    pub(crate) struct RemoteCandidateId;
);

/// Type of an ICE candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateKind {
    Host,
    PeerReflexive,
    ServerReflexive,
    Relayed,
}

impl CandidateKind {
    /// Name used in the `typ` field of the candidate attribute
    pub fn as_str(self) -> &'static str {
        match self {
            CandidateKind::Host => "host",
            CandidateKind::PeerReflexive => "prflx",
            CandidateKind::ServerReflexive => "srflx",
            CandidateKind::Relayed => "relay",
        }
    }

    pub(crate) fn type_preference(self, preferences: &TypePreferences) -> u8 {
        match self {
            CandidateKind::Host => preferences.host,
            CandidateKind::PeerReflexive => preferences.peer_reflexive,
            CandidateKind::ServerReflexive => preferences.server_reflexive,
            CandidateKind::Relayed => preferences.relayed,
        }
    }
}

impl FromStr for CandidateKind {
    type Err = ParseCandidateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(CandidateKind::Host),
            "prflx" => Ok(CandidateKind::PeerReflexive),
            "srflx" => Ok(CandidateKind::ServerReflexive),
            "relay" => Ok(CandidateKind::Relayed),
            _ => Err(ParseCandidateError::UnknownType(s.into())),
        }
    }
}

impl fmt::Display for CandidateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Candidate priority, see [RFC8445](https://datatracker.ietf.org/doc/html/rfc8445#section-5.1.2.1)
pub fn candidate_priority(type_preference: u8, local_preference: u16, component: u32) -> u32 {
    (u32::from(type_preference) << 24)
        + (u32::from(local_preference) << 8)
        + (256 - component.clamp(1, 256))
}

/// Candidate pair priority, see [RFC8445](https://datatracker.ietf.org/doc/html/rfc8445#section-6.1.2.3)
///
/// The result is the same on both agents, given the same candidates and opposite roles.
pub fn compute_pair_priority(local_priority: u32, remote_priority: u32, controlling: bool) -> u64 {
    let (g, d) = if controlling {
        (u64::from(local_priority), u64::from(remote_priority))
    } else {
        (u64::from(remote_priority), u64::from(local_priority))
    };

    // pair priority = 2^32*MIN(G,D) + 2*MAX(G,D) + (G>D?1:0)
    (min(g, d) << 32) + 2 * max(g, d) + u64::from(g > d)
}

pub(crate) fn compute_foundation(
    kind: CandidateKind,
    base: IpAddr,
    server: Option<IpAddr>,
    proto: &str,
) -> String {
    let mut hasher = DefaultHasher::new();
    (kind, base, server, proto).hash(&mut hasher);
    // Foundations are limited to 32 ice-chars
    format!("{:x}", hasher.finish())
}

#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub(crate) addr: SocketAddr,
    // transport: udp
    pub(crate) kind: CandidateKind,
    pub(crate) priority: u32,
    pub(crate) foundation: String,

    pub(crate) component: Component,

    // The transport address that an ICE agent sends from for a particular candidate.
    // For host, server-reflexive, and peer-reflexive candidates, the base is the same as the host candidate.
    // For relayed candidates, the base is the same as the relayed candidate
    //  (i.e., the transport address used by the TURN server to send from).
    pub(crate) base: SocketAddr,

    /// Related address as signaled: the base of reflexive candidates, the mapped address of relayed ones
    pub(crate) related: Option<SocketAddr>,

    /// TURN allocation a local relayed candidate belongs to
    pub(crate) allocation: Option<AllocationId>,
}

impl Candidate {
    /// The local preference portion of the candidate priority
    pub(crate) fn local_preference(&self) -> u16 {
        ((self.priority >> 8) & 0xFFFF) as u16
    }

    pub(crate) fn to_ice_candidate(&self) -> IceCandidate {
        IceCandidate {
            foundation: self.foundation.clone(),
            component: self.component.id(),
            transport: "UDP".into(),
            priority: self.priority,
            address: self.addr.ip(),
            port: self.addr.port(),
            kind: self.kind,
            related: self.related,
            extensions: vec![],
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            CandidateKind::Host => write!(f, "host({})", self.addr),
            CandidateKind::PeerReflexive => {
                write!(f, "peer-reflexive(base:{}, peer:{})", self.base, self.addr)
            }
            CandidateKind::ServerReflexive => {
                write!(f, "server-reflexive(base:{}, server:{})", self.base, self.addr)
            }
            CandidateKind::Relayed => write!(f, "relayed({})", self.addr),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseCandidateError {
    #[error("malformed candidate attribute")]
    Malformed,
    #[error("unknown candidate type {0:?}")]
    UnknownType(String),
    #[error("candidate address {0:?} is not an ip address")]
    InvalidAddress(String),
    #[error("raddr and rport must be both present")]
    IncompleteRelatedAddress,
}

/// ICE candidate as exchanged using the SDP `a=candidate` attribute
///
/// ```text
/// candidate:<foundation> <component-id> <transport> <priority> <address> <port> typ <type> [raddr <addr> rport <port>] [<key> <value>]*
/// ```
///
/// [RFC8839](https://datatracker.ietf.org/doc/html/rfc8839#section-5.1)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    /// Identifies candidates sharing the same type, base and server
    pub foundation: String,

    /// Component id, RTP is 1 and RTCP is 2
    pub component: u32,

    /// Transport protocol, only UDP is used by the agent
    pub transport: String,

    pub priority: u32,

    pub address: IpAddr,

    pub port: u16,

    pub kind: CandidateKind,

    /// `raddr` & `rport`
    pub related: Option<SocketAddr>,

    /// Extension key-value pairs this crate doesn't interpret
    pub extensions: Vec<(String, String)>,
}

impl IceCandidate {
    /// Transport address of the candidate
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

fn ice_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '+' || c == '/'
}

fn not_whitespace(c: char) -> bool {
    !c.is_ascii_whitespace()
}

fn token(i: &str) -> IResult<&str, &str> {
    preceded(space1, take_while1(not_whitespace))(i)
}

struct RawCandidate<'i> {
    foundation: &'i str,
    component: u32,
    transport: &'i str,
    priority: u32,
    address: &'i str,
    port: u16,
    typ: &'i str,
    extensions: Vec<(&'i str, &'i str)>,
}

fn parse_candidate(i: &str) -> IResult<&str, RawCandidate<'_>> {
    let (i, _) = opt(tag("a="))(i)?;

    let (i, (foundation, component, transport, priority, address, port, typ, extensions)) =
        tuple((
            preceded(tag("candidate:"), take_while_m_n(1, 32, ice_char)),
            preceded(space1, map_res(digit1, u32::from_str)),
            token,
            preceded(space1, map_res(digit1, u32::from_str)),
            token,
            preceded(space1, map_res(digit1, u16::from_str)),
            preceded(tuple((space1, tag("typ"))), token),
            many0(tuple((token, token))),
        ))(i)?;

    Ok((
        i,
        RawCandidate {
            foundation,
            component,
            transport,
            priority,
            address,
            port,
            typ,
            extensions,
        },
    ))
}

impl FromStr for IceCandidate {
    type Err = ParseCandidateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (rem, raw) = parse_candidate(s.trim()).map_err(|_| ParseCandidateError::Malformed)?;

        if !rem.trim().is_empty() {
            return Err(ParseCandidateError::Malformed);
        }

        let address = IpAddr::from_str(raw.address)
            .map_err(|_| ParseCandidateError::InvalidAddress(raw.address.into()))?;

        let mut rel_addr = None;
        let mut rel_port = None;
        let mut extensions = vec![];

        for (key, value) in raw.extensions {
            match key {
                "raddr" => {
                    rel_addr = Some(
                        IpAddr::from_str(value)
                            .map_err(|_| ParseCandidateError::InvalidAddress(value.into()))?,
                    )
                }
                "rport" => {
                    rel_port = Some(u16::from_str(value).map_err(|_| ParseCandidateError::Malformed)?)
                }
                _ => extensions.push((key.to_string(), value.to_string())),
            }
        }

        let related = match (rel_addr, rel_port) {
            (Some(ip), Some(port)) => Some(SocketAddr::new(ip, port)),
            (None, None) => None,
            _ => return Err(ParseCandidateError::IncompleteRelatedAddress),
        };

        Ok(IceCandidate {
            foundation: raw.foundation.into(),
            component: raw.component,
            transport: raw.transport.into(),
            priority: raw.priority,
            address,
            port: raw.port,
            kind: raw.typ.parse()?,
            related,
            extensions,
        })
    }
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "candidate:{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.transport,
            self.priority,
            self.address,
            self.port,
            self.kind
        )?;

        if let Some(related) = self.related {
            write!(f, " raddr {} rport {}", related.ip(), related.port())?;
        }

        for (key, value) in &self.extensions {
            write!(f, " {key} {value}")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn parse_host_candidate() {
        let candidate: IceCandidate = "candidate:1 1 UDP 2130706431 192.168.1.2 5000 typ host"
            .parse()
            .unwrap();

        assert_eq!(candidate.foundation, "1");
        assert_eq!(candidate.component, 1);
        assert_eq!(candidate.transport, "UDP");
        assert_eq!(candidate.priority, 2130706431);
        assert_eq!(candidate.address, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 2)));
        assert_eq!(candidate.port, 5000);
        assert_eq!(candidate.kind, CandidateKind::Host);
        assert_eq!(candidate.related, None);
        assert!(candidate.extensions.is_empty());
    }

    #[test]
    fn sdp_round_trip() {
        let lines = [
            "candidate:1 1 UDP 2130706431 192.168.1.2 5000 typ host",
            "candidate:a+b/c 2 udp 1694498815 203.0.113.4 61000 typ srflx raddr 192.168.1.2 rport 5001",
            "candidate:7 1 UDP 16777215 2001:db8::7 3478 typ relay raddr 2001:db8::1 rport 40000 generation 0 ufrag abcd",
            "candidate:x 1 UDP 1845501695 10.0.0.9 9 typ prflx raddr 10.0.0.1 rport 9",
        ];

        for line in lines {
            let candidate: IceCandidate = line.parse().unwrap();
            assert_eq!(candidate.to_string(), line);

            let reparsed: IceCandidate = candidate.to_string().parse().unwrap();
            assert_eq!(reparsed, candidate);
        }
    }

    #[test]
    fn parse_attribute_prefix() {
        let candidate: IceCandidate = "a=candidate:1 1 UDP 2130706431 192.168.1.2 5000 typ host\r\n"
            .parse()
            .unwrap();

        assert_eq!(candidate.addr(), "192.168.1.2:5000".parse().unwrap());
    }

    #[test]
    fn reject_invalid_candidates() {
        assert_eq!(
            "candidate:1 1 UDP 1 host.local 9 typ host".parse::<IceCandidate>(),
            Err(ParseCandidateError::InvalidAddress("host.local".into()))
        );
        assert_eq!(
            "candidate:1 1 UDP 1 10.0.0.1 9 typ magic".parse::<IceCandidate>(),
            Err(ParseCandidateError::UnknownType("magic".into()))
        );
        assert_eq!(
            "candidate:1 1 UDP 1 10.0.0.1 9 typ srflx raddr 10.0.0.2".parse::<IceCandidate>(),
            Err(ParseCandidateError::IncompleteRelatedAddress)
        );
        assert_eq!(
            "candidate:1 1 UDP 10.0.0.1 9 typ host".parse::<IceCandidate>(),
            Err(ParseCandidateError::Malformed)
        );
        assert_eq!(
            "candidate:1 1 UDP 99999999999 10.0.0.1 9 typ host".parse::<IceCandidate>(),
            Err(ParseCandidateError::Malformed)
        );
        assert_eq!(
            "candidate:1 1 UDP 1 10.0.0.1 9 typ host dangling".parse::<IceCandidate>(),
            Err(ParseCandidateError::Malformed)
        );
    }

    #[test]
    fn candidate_priorities() {
        let preferences = TypePreferences::default();

        let host = candidate_priority(
            CandidateKind::Host.type_preference(&preferences),
            65535,
            1,
        );
        assert_eq!(host, 2130706431);

        let relay = candidate_priority(
            CandidateKind::Relayed.type_preference(&preferences),
            65535,
            2,
        );
        assert_eq!(relay, 16777214);
    }

    #[test]
    fn pair_priority_is_symmetric() {
        let a = 2130706431;
        let b = 1694498815;

        // Agent with candidate `a` is controlling
        let on_a = compute_pair_priority(a, b, true);
        let on_b = compute_pair_priority(b, a, false);

        assert_eq!(on_a, on_b);
        assert_eq!(on_a, compute_pair_priority(a, b, true));
        assert_eq!(on_a, (u64::from(b) << 32) + 2 * u64::from(a) + 1);

        // Swapping the roles only changes the tie breaking bit
        let swapped = compute_pair_priority(a, b, false);
        assert_eq!(on_a - swapped, 1);
    }
}
