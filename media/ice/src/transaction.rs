//! Pending STUN & TURN requests keyed by their transaction id

use crate::candidate::{LocalCandidateId, RemoteCandidateId};
use crate::config::StunConfig;
use crate::gather::BindingId;
use crate::turn::{AllocationId, TurnRequestKind};
use crate::{Component, StreamId};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;
use stun_types::TransactionId;

/// What a transaction was started for, decides where its response is dispatched to
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum TransactionOwner {
    /// Connectivity check on a candidate pair
    Check {
        local: LocalCandidateId,
        remote: RemoteCandidateId,
        /// Request carried USE-CANDIDATE
        nomination: bool,
        /// Request carried ICE-CONTROLLING
        controlling: bool,
    },
    /// Keepalive on a selected candidate pair
    Keepalive {
        local: LocalCandidateId,
        remote: RemoteCandidateId,
    },
    /// Binding request to a STUN server
    ServerBinding(BindingId),
    /// Request of a TURN allocation
    Turn {
        allocation: AllocationId,
        kind: TurnRequestKind,
    },
}

/// How a request is sent
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Route {
    /// Directly from the socket
    Direct {
        source: Option<IpAddr>,
        target: SocketAddr,
    },
    /// Through a TURN allocation to a peer
    Relayed {
        allocation: AllocationId,
        peer: SocketAddr,
    },
}

impl Route {
    /// The address the request is sent to, responses must come from this address
    pub(crate) fn peer(&self) -> SocketAddr {
        match *self {
            Route::Direct { target, .. } => target,
            Route::Relayed { peer, .. } => peer,
        }
    }
}

pub(crate) struct Transaction {
    /// Agent generation the transaction was started in
    pub(crate) generation: u32,
    pub(crate) owner: TransactionOwner,
    pub(crate) stream: StreamId,
    pub(crate) component: Component,
    pub(crate) route: Route,
    pub(crate) request: Vec<u8>,

    retransmit_at: Instant,
    retransmits: u32,
    max_retransmits: u32,
}

impl Transaction {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        now: Instant,
        config: &StunConfig,
        generation: u32,
        owner: TransactionOwner,
        stream: StreamId,
        component: Component,
        route: Route,
        request: Vec<u8>,
        max_retransmits: u32,
    ) -> Self {
        Self {
            generation,
            owner,
            stream,
            component,
            route,
            request,
            retransmit_at: now + config.retransmit_delta(0),
            retransmits: 0,
            max_retransmits,
        }
    }
}

/// Result of [`Transactions::poll`]
pub(crate) enum TransactionPoll {
    /// The request must be sent again
    Retransmit {
        stream: StreamId,
        component: Component,
        route: Route,
        data: Vec<u8>,
    },
    /// No response was received in time, the transaction has been removed
    Expired(TransactionId, Transaction),
}

#[derive(Default)]
pub(crate) struct Transactions {
    map: HashMap<TransactionId, Transaction>,
}

impl Transactions {
    pub(crate) fn insert(&mut self, transaction_id: TransactionId, transaction: Transaction) {
        self.map.insert(transaction_id, transaction);
    }

    #[cfg(test)]
    pub(crate) fn get(&self, transaction_id: &TransactionId) -> Option<&Transaction> {
        self.map.get(transaction_id)
    }

    pub(crate) fn take(&mut self, transaction_id: &TransactionId) -> Option<Transaction> {
        self.map.remove(transaction_id)
    }

    pub(crate) fn retain(&mut self, mut f: impl FnMut(&Transaction) -> bool) {
        self.map.retain(|_, transaction| f(transaction));
    }

    pub(crate) fn clear(&mut self) {
        self.map.clear();
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = &Transaction> {
        self.map.values()
    }

    /// Check all pending transactions for retransmits and timeouts
    pub(crate) fn poll(&mut self, now: Instant, config: &StunConfig) -> Vec<TransactionPoll> {
        let mut result = vec![];
        let mut expired = vec![];

        for (transaction_id, transaction) in &mut self.map {
            if transaction.retransmit_at > now {
                continue;
            }

            if transaction.retransmits >= transaction.max_retransmits {
                expired.push(*transaction_id);
                continue;
            }

            transaction.retransmits += 1;
            transaction.retransmit_at = now + config.retransmit_delta(transaction.retransmits);

            result.push(TransactionPoll::Retransmit {
                stream: transaction.stream,
                component: transaction.component,
                route: transaction.route,
                data: transaction.request.clone(),
            });
        }

        // Deterministic order makes logs & tests easier to follow
        expired.sort_unstable();

        for transaction_id in expired {
            if let Some(transaction) = self.map.remove(&transaction_id) {
                result.push(TransactionPoll::Expired(transaction_id, transaction));
            }
        }

        result
    }

    pub(crate) fn next_timeout(&self) -> Option<Instant> {
        self.map.values().map(|t| t.retransmit_at).min()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use slotmap::KeyData;
    use std::time::Duration;

    fn transaction(now: Instant, config: &StunConfig, max_retransmits: u32) -> Transaction {
        Transaction::new(
            now,
            config,
            0,
            TransactionOwner::ServerBinding(BindingId::from(KeyData::from_ffi(1))),
            StreamId::from(KeyData::from_ffi(1)),
            Component::Rtp,
            Route::Direct {
                source: None,
                target: "192.0.2.1:3478".parse().unwrap(),
            },
            vec![1, 2, 3],
            max_retransmits,
        )
    }

    #[test]
    fn retransmit_then_expire() {
        let config = StunConfig::default();
        let start = Instant::now();
        let mut now = start;

        let mut transactions = Transactions::default();
        let id = TransactionId::random();
        transactions.insert(id, transaction(now, &config, 2));

        let mut retransmits = 0;

        loop {
            now = transactions.next_timeout().unwrap();

            match transactions.poll(now, &config).pop() {
                Some(TransactionPoll::Retransmit { data, .. }) => {
                    assert_eq!(data, [1, 2, 3]);
                    retransmits += 1;
                }
                Some(TransactionPoll::Expired(expired_id, _)) => {
                    assert_eq!(expired_id, id);
                    break;
                }
                None => panic!("poll at the timeout must make progress"),
            }
        }

        assert_eq!(retransmits, 2);
        // 500ms + 1000ms + 1500ms
        assert_eq!(now - start, Duration::from_millis(3000));
        assert!(transactions.next_timeout().is_none());
    }

    #[test]
    fn take_removes_transaction() {
        let config = StunConfig::default();
        let now = Instant::now();

        let mut transactions = Transactions::default();
        let id = TransactionId::random();
        transactions.insert(id, transaction(now, &config, 7));

        assert!(transactions.get(&id).is_some());
        assert!(transactions.take(&id).is_some());
        assert!(transactions.take(&id).is_none());
        assert!(transactions.poll(now + Duration::from_secs(60), &config).is_empty());
    }
}
