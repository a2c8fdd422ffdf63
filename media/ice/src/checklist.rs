//! Candidate pairs of a single component and the scheduling of their connectivity checks

use crate::candidate::{Candidate, LocalCandidateId, RemoteCandidateId, compute_pair_priority};
use slotmap::SlotMap;
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

/// State of a candidate pair, see [RFC8445](https://datatracker.ietf.org/doc/html/rfc8445#section-6.1.2.6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidatePairState {
    /// A check for this pair has not been sent, and it cannot be sent until the pair is unfrozen
    Frozen,

    /// A check has not been sent for this pair, but the pair is not Frozen.
    Waiting,

    /// A check has been sent for this pair, but the transaction is in progress.
    InProgress,

    /// A check has been sent for this pair, and it produced a successful result.
    Succeeded,

    /// A check has been sent for this pair, and it failed (a response to the check
    /// was never received, or a failure response was received).
    Failed,
}

pub(crate) struct CandidatePair {
    pub(crate) local: LocalCandidateId,
    pub(crate) remote: RemoteCandidateId,
    pub(crate) priority: u64,
    pub(crate) state: CandidatePairState,

    /// Local and remote foundation, pairs sharing it are checked one at a time
    pub(crate) foundation: String,

    local_foundation: String,
    local_base: SocketAddr,
    remote_addr: SocketAddr,

    // Nominated by us
    pub(crate) nominated: bool,
    // Nominated by the peer
    pub(crate) received_use_candidate: bool,

    /// Failed by the redundancy rule, never checked
    redundant: bool,
}

impl CandidatePair {
    fn is_redundant_with(&self, other: &CandidatePair) -> bool {
        (self.local_base == other.local_base && self.remote_addr == other.remote_addr)
            || (self.local_foundation == other.local_foundation && self.remote == other.remote)
    }
}

/// A check selected by [`Checklist::next_check`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Check {
    pub(crate) local: LocalCandidateId,
    pub(crate) remote: RemoteCandidateId,
    /// The check must carry USE-CANDIDATE
    pub(crate) nomination: bool,
}

#[derive(Default)]
pub(crate) struct Checklist {
    /// Sorted by descending priority
    pairs: Vec<CandidatePair>,
    triggered: VecDeque<(LocalCandidateId, RemoteCandidateId)>,
    last_check: Option<Instant>,
}

/// Returns if the two addresses may form a pair
pub(crate) fn can_pair(local: SocketAddr, remote: SocketAddr) -> bool {
    match (local.ip(), remote.ip()) {
        (IpAddr::V4(l), IpAddr::V4(r)) => l.is_link_local() == r.is_link_local(),
        // Only pair IPv6 addresses when either both or neither are link local addresses
        (IpAddr::V6(l), IpAddr::V6(r)) => l.is_unicast_link_local() == r.is_unicast_link_local(),
        _ => false,
    }
}

impl Checklist {
    pub(crate) fn pairs(&self) -> &[CandidatePair] {
        &self.pairs
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub(crate) fn find(
        &self,
        local: LocalCandidateId,
        remote: RemoteCandidateId,
    ) -> Option<&CandidatePair> {
        self.pairs
            .iter()
            .find(|p| p.local == local && p.remote == remote)
    }

    pub(crate) fn find_mut(
        &mut self,
        local: LocalCandidateId,
        remote: RemoteCandidateId,
    ) -> Option<&mut CandidatePair> {
        self.pairs
            .iter_mut()
            .find(|p| p.local == local && p.remote == remote)
    }

    /// Add a pair of the two candidates, returns false if the pair already exists
    pub(crate) fn add_pair(
        &mut self,
        local: LocalCandidateId,
        local_candidate: &Candidate,
        remote: RemoteCandidateId,
        remote_candidate: &Candidate,
        is_controlling: bool,
    ) -> bool {
        if self.find(local, remote).is_some() {
            return false;
        }

        let mut pair = CandidatePair {
            local,
            remote,
            priority: compute_pair_priority(
                local_candidate.priority,
                remote_candidate.priority,
                is_controlling,
            ),
            state: CandidatePairState::Frozen,
            foundation: pair_foundation(local_candidate, remote_candidate),
            local_foundation: local_candidate.foundation.clone(),
            local_base: local_candidate.base,
            remote_addr: remote_candidate.addr,
            nominated: false,
            received_use_candidate: false,
            redundant: false,
        };

        let redundant = self
            .pairs
            .iter_mut()
            .filter(|p| p.state != CandidatePairState::Failed)
            .find(|p| p.is_redundant_with(&pair));

        match redundant {
            Some(existing)
                if existing.priority < pair.priority
                    && matches!(
                        existing.state,
                        CandidatePairState::Frozen | CandidatePairState::Waiting
                    ) =>
            {
                log::trace!("pair with priority {} replaced by new pair", existing.priority);
                existing.state = CandidatePairState::Failed;
                existing.redundant = true;
            }
            Some(_) => {
                pair.state = CandidatePairState::Failed;
                pair.redundant = true;
            }
            None => {}
        }

        self.pairs.push(pair);
        self.sort();
        self.unfreeze();

        true
    }

    /// Recompute priorities & foundations of all pairs, after a role switch or a candidate change
    pub(crate) fn refresh(
        &mut self,
        local_candidates: &SlotMap<LocalCandidateId, Candidate>,
        remote_candidates: &SlotMap<RemoteCandidateId, Candidate>,
        is_controlling: bool,
    ) {
        for pair in &mut self.pairs {
            let (Some(local), Some(remote)) = (
                local_candidates.get(pair.local),
                remote_candidates.get(pair.remote),
            ) else {
                continue;
            };

            pair.priority = compute_pair_priority(local.priority, remote.priority, is_controlling);
            pair.foundation = pair_foundation(local, remote);
            pair.remote_addr = remote.addr;
        }

        self.sort();
        self.unfreeze();
    }

    fn sort(&mut self) {
        self.pairs.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Drop the lowest priority pairs that have no check in flight until the checklist fits `max` pairs
    ///
    /// Returns the removed pairs
    pub(crate) fn prune(&mut self, max: usize) -> Vec<CandidatePair> {
        let mut pruned = vec![];

        while self.pairs.len() > max {
            let Some(position) = self.pairs.iter().rposition(|p| {
                matches!(
                    p.state,
                    CandidatePairState::Frozen
                        | CandidatePairState::Waiting
                        | CandidatePairState::Failed
                )
            }) else {
                break;
            };

            pruned.push(self.pairs.remove(position));
        }

        if !pruned.is_empty() {
            self.triggered.retain(|(local, remote)| {
                !pruned
                    .iter()
                    .any(|p| p.local == *local && p.remote == *remote)
            });
        }

        pruned
    }

    pub(crate) fn set_state(
        &mut self,
        local: LocalCandidateId,
        remote: RemoteCandidateId,
        state: CandidatePairState,
    ) {
        if let Some(pair) = self.find_mut(local, remote) {
            pair.state = state;

            // Only a succeeded pair can stay nominated, a failed nomination frees the component for another one
            if state != CandidatePairState::Succeeded {
                pair.nominated = false;
            }

            self.unfreeze();
        }
    }

    /// A check was received on a failed pair, it is checked again unless it is redundant
    ///
    /// Returns if the pair was moved back to `Waiting`.
    pub(crate) fn retry_failed(&mut self, local: LocalCandidateId, remote: RemoteCandidateId) -> bool {
        match self.find_mut(local, remote) {
            Some(pair) if pair.state == CandidatePairState::Failed && !pair.redundant => {
                pair.state = CandidatePairState::Waiting;
                true
            }
            _ => false,
        }
    }

    /// Fail all pairs of a local candidate that can no longer be used
    pub(crate) fn fail_local(&mut self, local: LocalCandidateId) {
        for pair in &mut self.pairs {
            if pair.local == local {
                pair.state = CandidatePairState::Failed;
                pair.nominated = false;
            }
        }

        self.unfreeze();
    }

    /// Unfreeze the highest priority frozen pair of every foundation that has nothing waiting or in progress
    fn unfreeze(&mut self) {
        let mut i = 0;

        while i < self.pairs.len() {
            if self.pairs[i].state == CandidatePairState::Frozen
                && !self.is_foundation_active(&self.pairs[i].foundation)
            {
                self.pairs[i].state = CandidatePairState::Waiting;
            }

            i += 1;
        }
    }

    fn is_foundation_active(&self, foundation: &str) -> bool {
        self.pairs.iter().any(|p| {
            p.foundation == foundation
                && matches!(
                    p.state,
                    CandidatePairState::Waiting | CandidatePairState::InProgress
                )
        })
    }

    fn is_foundation_busy(&self, foundation: &str) -> bool {
        self.pairs
            .iter()
            .any(|p| p.foundation == foundation && p.state == CandidatePairState::InProgress)
    }

    /// Queue a check of the pair ahead of the ordinary checks
    pub(crate) fn push_triggered(&mut self, local: LocalCandidateId, remote: RemoteCandidateId) {
        if !self.triggered.contains(&(local, remote)) {
            self.triggered.push_back((local, remote));
        }
    }

    /// Queue a nomination check which is sent before every other triggered check
    pub(crate) fn push_nomination(&mut self, local: LocalCandidateId, remote: RemoteCandidateId) {
        self.triggered.retain(|entry| *entry != (local, remote));
        self.triggered.push_front((local, remote));
    }

    fn is_triggered_ready(&self, local: LocalCandidateId, remote: RemoteCandidateId) -> bool {
        let Some(pair) = self.find(local, remote) else {
            return false;
        };

        match pair.state {
            CandidatePairState::Frozen | CandidatePairState::Waiting => {
                !self.is_foundation_busy(&pair.foundation)
            }
            // Nomination checks are sent on succeeded pairs
            CandidatePairState::Succeeded => pair.nominated,
            CandidatePairState::InProgress | CandidatePairState::Failed => false,
        }
    }

    /// Triggered entries that will never be sent
    fn is_triggered_stale(&self, local: LocalCandidateId, remote: RemoteCandidateId) -> bool {
        self.find(local, remote).is_none_or(|pair| match pair.state {
            CandidatePairState::Frozen | CandidatePairState::Waiting => false,
            CandidatePairState::Succeeded => !pair.nominated,
            CandidatePairState::InProgress | CandidatePairState::Failed => true,
        })
    }

    fn peek_check(&self) -> Option<Check> {
        let triggered = self
            .triggered
            .iter()
            .find(|(local, remote)| self.is_triggered_ready(*local, *remote));

        if let Some(&(local, remote)) = triggered {
            let nomination = self
                .find(local, remote)
                .is_some_and(|p| p.state == CandidatePairState::Succeeded && p.nominated);

            return Some(Check {
                local,
                remote,
                nomination,
            });
        }

        self.pairs
            .iter()
            .find(|p| {
                p.state == CandidatePairState::Waiting && !self.is_foundation_busy(&p.foundation)
            })
            .map(|p| Check {
                local: p.local,
                remote: p.remote,
                nomination: false,
            })
    }

    /// Returns when the next check is due, `None` if there is nothing to check
    pub(crate) fn next_check_at(&self, now: Instant, pacing: Duration) -> Option<Instant> {
        self.peek_check()?;

        Some(match self.last_check {
            Some(last_check) => last_check + pacing,
            None => now,
        })
    }

    /// Returns the next check to perform, respecting the pacing interval
    ///
    /// Pairs which are not yet succeeded are moved to `InProgress`.
    pub(crate) fn next_check(&mut self, now: Instant, pacing: Duration) -> Option<Check> {
        if let Some(last_check) = self.last_check
            && last_check + pacing > now
        {
            return None;
        }

        let check = self.peek_check()?;

        self.triggered
            .retain(|entry| *entry != (check.local, check.remote));
        let stale: Vec<_> = self
            .triggered
            .iter()
            .copied()
            .filter(|(local, remote)| self.is_triggered_stale(*local, *remote))
            .collect();
        self.triggered.retain(|entry| !stale.contains(entry));

        if let Some(pair) = self.find_mut(check.local, check.remote)
            && pair.state != CandidatePairState::Succeeded
        {
            pair.state = CandidatePairState::InProgress;
        }

        self.last_check = Some(now);

        Some(check)
    }

    /// No pair is left to be checked
    pub(crate) fn is_exhausted(&self) -> bool {
        let pending = self.pairs.iter().any(|p| {
            matches!(
                p.state,
                CandidatePairState::Frozen
                    | CandidatePairState::Waiting
                    | CandidatePairState::InProgress
            )
        });

        !pending
            && self
                .triggered
                .iter()
                .all(|(local, remote)| self.is_triggered_stale(*local, *remote))
    }

    /// Every pair failed, an empty checklist never fails
    pub(crate) fn all_failed(&self) -> bool {
        !self.pairs.is_empty()
            && self
                .pairs
                .iter()
                .all(|p| p.state == CandidatePairState::Failed)
    }

    /// The pair to nominate, the highest priority pair once it succeeded and no pair of higher
    /// priority can still succeed
    pub(crate) fn nomination_candidate(&self) -> Option<&CandidatePair> {
        self.pairs
            .iter()
            .find(|p| p.state != CandidatePairState::Failed)
            .filter(|p| p.state == CandidatePairState::Succeeded)
    }

    pub(crate) fn clear(&mut self) {
        self.pairs.clear();
        self.triggered.clear();
        self.last_check = None;
    }
}

fn pair_foundation(local: &Candidate, remote: &Candidate) -> String {
    format!("{}:{}", local.foundation, remote.foundation)
}
