#![deny(unsafe_code)]

//! sans io implementation of an ICE agent
//!
//! The [`IceAgent`] gathers host, server-reflexive and relayed candidates, runs connectivity checks against the
//! candidates of a peer and nominates one candidate pair per component.
//! It never touches a socket itself. Received packets are passed in using [`IceAgent::receive`],
//! packets to send are returned as [`IceEvent::SendData`].

use core::fmt;
use rand::distr::{Alphanumeric, SampleString};
use std::{
    cmp::min,
    net::{IpAddr, SocketAddr},
};

mod agent;
mod candidate;
mod checklist;
mod config;
mod error;
mod gather;
mod stun;
mod transaction;
mod turn;

#[cfg(feature = "tokio")]
pub mod tokio;

pub use agent::{IceAgent, IceAgentState, IceGatheringState, PairInfo, SelectedPair};
pub use candidate::{
    CandidateKind, IceCandidate, ParseCandidateError, candidate_priority, compute_pair_priority,
};
pub use checklist::CandidatePairState;
pub use config::{
    IceConfig, IceTransportPolicy, ServerUrlError, StunConfig, StunServer, TurnCredential,
    TurnServer, TypePreferences,
};
pub use error::Error;
pub use turn::turn_rest_credentials;

slotmap::new_key_type! {
    /// Identifies a media stream (e.g. audio, video) of an [`IceAgent`]
    pub struct StreamId;
}

/// A message received on a UDP socket
pub struct ReceivedPkt<D = Vec<u8>> {
    /// The received data
    pub data: D,
    /// Source address of the message
    pub source: SocketAddr,
    /// Local socket destination address of the message
    pub destination: SocketAddr,
    /// Stream the receiving socket belongs to
    pub stream: StreamId,
    /// On which component socket this was received
    pub component: Component,
}

/// Component of the data stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Component {
    /// The RTP component of the data stream. This will also contain RTCP if rtcp-mux is enabled.
    Rtp = 1,
    /// The RTCP component of the data stream. This will not be used if rtcp-mux is enabled.
    Rtcp = 2,
}

impl Component {
    /// The component-id as used in candidates
    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            1 => Some(Component::Rtp),
            2 => Some(Component::Rtcp),
            _ => None,
        }
    }
}

/// ICE related events emitted by the [`IceAgent`]
#[derive(Debug)]
pub enum IceEvent {
    GatheringStateChanged {
        old: IceGatheringState,
        new: IceGatheringState,
    },
    ConnectionStateChanged {
        old: IceAgentState,
        new: IceAgentState,
    },
    /// A new local candidate has been gathered and must be sent to the peer
    LocalCandidate {
        stream: StreamId,
        candidate: IceCandidate,
    },
    /// A candidate pair has been selected for the component
    SelectedPairChanged {
        stream: StreamId,
        component: Component,
        local: SocketAddr,
        remote: SocketAddr,
    },
    /// All candidate pairs of the component failed
    ComponentFailed {
        stream: StreamId,
        component: Component,
    },
    /// A STUN or TURN server did not provide a candidate
    CandidateSourceFailed {
        stream: StreamId,
        component: Component,
        server: SocketAddr,
        error: Error,
    },
    /// Send data using the socket of the given stream & component
    SendData {
        stream: StreamId,
        component: Component,
        data: Vec<u8>,
        source: Option<IpAddr>,
        target: SocketAddr,
    },
    /// Application data received on the component
    ReceiveData {
        stream: StreamId,
        component: Component,
        data: Vec<u8>,
        source: SocketAddr,
    },
}

/// Credentials of an ICE agent
///
/// These must be exchanged using some external signaling protocol like SDP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

impl IceCredentials {
    pub fn random() -> Self {
        let mut rng = rand::rng();

        Self {
            ufrag: Alphanumeric.sample_string(&mut rng, 8),
            pwd: Alphanumeric.sample_string(&mut rng, 32),
        }
    }
}

pub(crate) fn opt_min<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (None, None) => None,
        (None, Some(b)) => Some(b),
        (Some(a), None) => Some(a),
        (Some(a), Some(b)) => Some(min(a, b)),
    }
}

/// Log helper to display a candidate pair
pub(crate) struct DisplayPair<'a>(pub(crate) &'a candidate::Candidate, pub(crate) &'a candidate::Candidate);

impl fmt::Display for DisplayPair<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.0, self.1)
    }
}
