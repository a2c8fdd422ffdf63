//! Server-reflexive candidate discovery using STUN servers

use crate::{Component, StreamId};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use stun_types::attributes::{Fingerprint, MappedAddress, XorMappedAddress};
use stun_types::{Class, Message, MessageBuilder, Method, TransactionId};

slotmap::new_key_type!(
    pub(crate) struct BindingId;
);

/// Binding to a STUN server, used to create and maintain a server-reflexive candidate
pub(crate) struct StunServerBinding {
    server: SocketAddr,
    stream: StreamId,
    component: Component,
    /// Host address the binding requests are sent from
    base: SocketAddr,
    state: StunServerBindingState,
    /// XorMappedAddress from last STUN response
    last_mapped_addr: Option<SocketAddr>,
}

enum StunServerBindingState {
    /// Waiting to be polled to send their first request
    Waiting,
    /// Mid STUN transaction to create or refresh the binding
    InProgress { transaction_id: TransactionId },
    /// Waiting to refresh the binding
    WaitingForRefresh { refresh_at: Instant },
    /// Failed to reach the STUN server
    Failed,
}

impl StunServerBinding {
    pub(crate) fn new(
        server: SocketAddr,
        stream: StreamId,
        component: Component,
        base: SocketAddr,
    ) -> Self {
        Self {
            server,
            stream,
            component,
            base,
            state: StunServerBindingState::Waiting,
            last_mapped_addr: None,
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

    /// Returns if the binding has either been completed or failed to complete
    pub(crate) fn is_completed(&self) -> bool {
        self.last_mapped_addr.is_some() || matches!(self.state, StunServerBindingState::Failed)
    }

    pub(crate) fn poll_at(&self, now: Instant) -> Option<Instant> {
        match &self.state {
            StunServerBindingState::Waiting => Some(now),
            StunServerBindingState::WaitingForRefresh { refresh_at } => Some(*refresh_at),
            // Retransmits are handled by the transaction table
            StunServerBindingState::InProgress { .. } | StunServerBindingState::Failed => None,
        }
    }

    /// Returns a binding request to send to the STUN server, if one is due
    pub(crate) fn poll(&mut self, now: Instant) -> Option<(TransactionId, Vec<u8>)> {
        match &self.state {
            StunServerBindingState::Waiting => {}
            StunServerBindingState::WaitingForRefresh { refresh_at } if *refresh_at <= now => {}
            _ => return None,
        }

        let transaction_id = TransactionId::random();

        let mut builder = MessageBuilder::new(Class::Request, Method::Binding, transaction_id);
        builder.add_attr(Fingerprint);

        let stun_request = match builder.finish() {
            Ok(stun_request) => stun_request,
            Err(e) => {
                log::warn!("Failed to build STUN binding request, {e}");
                self.state = StunServerBindingState::Failed;
                return None;
            }
        };

        self.state = StunServerBindingState::InProgress { transaction_id };

        Some((transaction_id, stun_request))
    }

    /// Receive a STUN success response
    ///
    /// Returns a SocketAddr discovered through the STUN binding
    pub(crate) fn receive_stun_response(
        &mut self,
        now: Instant,
        refresh_interval: Duration,
        stun_msg: &mut Message,
    ) -> Option<SocketAddr> {
        let mapped = match stun_msg.attribute::<XorMappedAddress>() {
            Some(Ok(mapped)) => mapped.0,
            Some(Err(e)) => {
                log::debug!("Invalid XOR-MAPPED-ADDRESS in response of {}, {e}", self.server);
                return None;
            }
            // Very old servers only know MAPPED-ADDRESS
            None => stun_msg.attribute::<MappedAddress>()?.ok()?.0,
        };

        self.state = StunServerBindingState::WaitingForRefresh {
            refresh_at: now + refresh_interval,
        };

        if let Some(last_mapped_addr) = self.last_mapped_addr
            && last_mapped_addr != mapped
        {
            log::debug!(
                "Mapped address of STUN binding changed from {last_mapped_addr} to {mapped}"
            );
        }

        self.last_mapped_addr = Some(mapped);

        Some(mapped)
    }

    /// The STUN transaction timed out
    ///
    /// Returns true if the binding never succeeded and the server must be considered unreachable
    pub(crate) fn on_timeout(&mut self, now: Instant, refresh_interval: Duration) -> bool {
        if self.last_mapped_addr.is_some() {
            // Keep the candidate, a later refresh may succeed again
            self.state = StunServerBindingState::WaitingForRefresh {
                refresh_at: now + refresh_interval,
            };

            false
        } else {
            self.state = StunServerBindingState::Failed;

            true
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use slotmap::KeyData;

    fn binding() -> StunServerBinding {
        StunServerBinding::new(
            "192.0.2.1:3478".parse().unwrap(),
            StreamId::from(KeyData::from_ffi(1)),
            Component::Rtp,
            "10.0.0.1:5000".parse().unwrap(),
        )
    }

    fn success_response(transaction_id: TransactionId, mapped: SocketAddr) -> Message {
        let mut builder = MessageBuilder::new(Class::Success, Method::Binding, transaction_id);
        builder.add_attr(XorMappedAddress(mapped));
        Message::parse(builder.finish().unwrap()).unwrap()
    }

    #[test]
    fn binding_lifecycle() {
        let refresh = Duration::from_secs(20);
        let now = Instant::now();
        let mut binding = binding();

        assert_eq!(binding.poll_at(now), Some(now));
        assert!(!binding.is_completed());

        let (transaction_id, request) = binding.poll(now).unwrap();
        let request = Message::parse(request).unwrap();
        assert_eq!(request.class(), Class::Request);
        assert_eq!(request.transaction_id(), transaction_id);

        // Nothing to do while the request is pending
        assert!(binding.poll(now).is_none());
        assert_eq!(binding.poll_at(now), None);

        let mapped = "203.0.113.5:40000".parse().unwrap();
        let mut response = success_response(transaction_id, mapped);
        assert_eq!(
            binding.receive_stun_response(now, refresh, &mut response),
            Some(mapped)
        );
        assert!(binding.is_completed());
        assert_eq!(binding.poll_at(now), Some(now + refresh));

        assert!(binding.poll(now + refresh).is_some());

        // A failed refresh keeps the binding usable
        assert!(!binding.on_timeout(now + refresh, refresh));
        assert!(binding.is_completed());
    }

    #[test]
    fn unreachable_server() {
        let now = Instant::now();
        let mut binding = binding();

        binding.poll(now).unwrap();
        assert!(binding.on_timeout(now, Duration::from_secs(20)));
        assert!(binding.is_completed());
        assert_eq!(binding.poll_at(now), None);
    }
}
