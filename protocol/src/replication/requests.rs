//! # Pending Requests
//!
//! Outstanding network requests, keyed by what they ask for. Two callers
//! asking for the same block share one [`Pending`] entry and one request on
//! the wire; both get the answer.
//!
//! A pending request is in one of two states:
//!
//! - **assigned**: sent to exactly one peer under a request id, and
//!   waiting for that peer's response;
//! - **parked**: no eligible peer right now. It is re-examined whenever a
//!   peer connects, announces, or frees up capacity.
//!
//! Peers that failed or declined a request are remembered in `tried` and
//! never asked for it again.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use tokio::sync::oneshot;

use super::messages::RequestId;
use crate::error::LogError;
use crate::events::PeerId;
use crate::log::UpgradeOutcome;

/// What a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKey {
    Block(u64),
    /// Bulk transfer of `[start, end)`.
    Range { start: u64, end: u64 },
    /// Nodes locating a byte offset.
    Seek(u64),
    Upgrade,
}

/// A successful answer, shared by every waiter.
#[derive(Debug, Clone)]
pub(crate) enum Resolved {
    Block(Bytes),
    Range,
    Nodes,
    Upgrade(UpgradeOutcome),
}

#[derive(Debug, Clone)]
pub(crate) enum Failure {
    Unavailable(String),
}

impl From<Failure> for LogError {
    fn from(f: Failure) -> Self {
        match f {
            Failure::Unavailable(reason) => LogError::Unavailable(reason),
        }
    }
}

pub(crate) type Answer = Result<Resolved, Failure>;
pub(crate) type Waiter = oneshot::Sender<Answer>;

/// Where an assigned request went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Assignment {
    pub peer: PeerId,
    pub id: RequestId,
    /// Local fork and length the request was shaped for.
    pub fork: u64,
    pub length: u64,
}

#[derive(Debug)]
pub(crate) struct Pending {
    pub waiters: Vec<Waiter>,
    pub tried: HashSet<PeerId>,
    pub assigned: Option<Assignment>,
    /// Wait for a peer rather than failing when none is eligible.
    pub park: bool,
}

impl Pending {
    fn new(park: bool) -> Self {
        Self {
            waiters: Vec::new(),
            tried: HashSet::new(),
            assigned: None,
            park,
        }
    }

    /// Whether every caller has given up.
    fn abandoned(&self) -> bool {
        !self.waiters.is_empty() && self.waiters.iter().all(|w| w.is_closed())
    }
}

#[derive(Debug, Default)]
pub(crate) struct RequestTable {
    pending: HashMap<RequestKey, Pending>,
    by_id: HashMap<(PeerId, RequestId), RequestKey>,
}

impl RequestTable {
    /// Join or create the request for `key`. Returns `true` if it was
    /// created, and so needs dispatching.
    pub fn join(&mut self, key: RequestKey, waiter: Option<Waiter>, park: bool) -> bool {
        let created = !self.pending.contains_key(&key);
        let pending = self.pending.entry(key).or_insert_with(|| Pending::new(park));
        pending.park |= park;
        if let Some(waiter) = waiter {
            pending.waiters.push(waiter);
        }
        created
    }

    pub fn get(&self, key: &RequestKey) -> Option<&Pending> {
        self.pending.get(key)
    }

    pub fn get_mut(&mut self, key: &RequestKey) -> Option<&mut Pending> {
        self.pending.get_mut(key)
    }

    pub fn contains(&self, key: &RequestKey) -> bool {
        self.pending.contains_key(key)
    }

    /// The request a response from `peer` with `id` answers.
    pub fn lookup(&self, peer: PeerId, id: RequestId) -> Option<(RequestKey, Assignment)> {
        let key = *self.by_id.get(&(peer, id))?;
        let assignment = self.pending.get(&key)?.assigned?;
        Some((key, assignment))
    }

    pub fn assign(&mut self, key: RequestKey, assignment: Assignment) {
        if let Some(pending) = self.pending.get_mut(&key) {
            pending.assigned = Some(assignment);
            self.by_id.insert((assignment.peer, assignment.id), key);
        }
    }

    /// Record that responses to `key` are now shaped for a tree of `length`.
    pub fn reshape(&mut self, key: RequestKey, length: u64) {
        if let Some(assignment) = self.pending.get_mut(&key).and_then(|p| p.assigned.as_mut()) {
            assignment.length = length;
        }
    }

    /// Detach `key` from its peer. With `tried`, the peer is never asked
    /// for it again. Returns the peer that held it.
    pub fn release(&mut self, key: RequestKey, tried: bool) -> Option<PeerId> {
        let pending = self.pending.get_mut(&key)?;
        let assignment = pending.assigned.take()?;
        if tried {
            pending.tried.insert(assignment.peer);
        }
        self.by_id.remove(&(assignment.peer, assignment.id));
        Some(assignment.peer)
    }

    /// Remove `key` and hand `answer` to every waiter. Returns the peer the
    /// request was assigned to, if any.
    pub fn resolve(&mut self, key: RequestKey, answer: Answer) -> Option<PeerId> {
        let pending = self.pending.remove(&key)?;
        let peer = pending.assigned.map(|a| {
            self.by_id.remove(&(a.peer, a.id));
            a.peer
        });
        for waiter in pending.waiters {
            let _ = waiter.send(answer.clone());
        }
        peer
    }

    /// Drop `key` if every caller waiting on it has gone away.
    pub fn drop_abandoned(&mut self, key: RequestKey) -> Option<Option<PeerId>> {
        if !self.pending.get(&key)?.abandoned() {
            return None;
        }
        Some(self.resolve(key, Err(Failure::Unavailable("abandoned".into()))))
    }

    /// Keys of requests that are not assigned to any peer.
    pub fn parked(&self) -> Vec<RequestKey> {
        self.pending
            .iter()
            .filter(|(_, p)| p.assigned.is_none())
            .map(|(k, _)| *k)
            .collect()
    }

    /// Keys of requests assigned to `peer`.
    pub fn assigned_to(&self, peer: PeerId) -> Vec<RequestKey> {
        self.pending
            .iter()
            .filter(|(_, p)| p.assigned.map_or(false, |a| a.peer == peer))
            .map(|(k, _)| *k)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(peer: PeerId, id: RequestId) -> Assignment {
        Assignment {
            peer,
            id,
            fork: 0,
            length: 0,
        }
    }

    #[test]
    fn concurrent_waiters_share_one_entry() {
        let mut table = RequestTable::default();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        assert!(table.join(RequestKey::Block(4), Some(tx1), true));
        assert!(!table.join(RequestKey::Block(4), Some(tx2), true));
        assert_eq!(table.len(), 1);

        table.assign(RequestKey::Block(4), assignment(9, 1));
        assert_eq!(table.resolve(RequestKey::Block(4), Ok(Resolved::Block(Bytes::from_static(b"x")))), Some(9));
        for rx in [&mut rx1, &mut rx2] {
            match rx.try_recv().unwrap() {
                Ok(Resolved::Block(b)) => assert_eq!(b.as_ref(), b"x"),
                other => panic!("unexpected answer {other:?}"),
            }
        }
        assert!(table.lookup(9, 1).is_none());
    }

    #[test]
    fn release_remembers_failed_peer() {
        let mut table = RequestTable::default();
        table.join(RequestKey::Upgrade, None, true);
        table.assign(RequestKey::Upgrade, assignment(3, 7));
        assert_eq!(table.lookup(3, 7).map(|(k, _)| k), Some(RequestKey::Upgrade));
        assert_eq!(table.release(RequestKey::Upgrade, true), Some(3));
        assert!(table.get(&RequestKey::Upgrade).unwrap().tried.contains(&3));
        assert_eq!(table.parked(), vec![RequestKey::Upgrade]);
        assert!(table.lookup(3, 7).is_none());
    }

    #[test]
    fn abandoned_requests_are_dropped() {
        let mut table = RequestTable::default();
        let (tx, rx) = oneshot::channel();
        table.join(RequestKey::Seek(10), Some(tx), true);
        assert_eq!(table.drop_abandoned(RequestKey::Seek(10)), None);
        drop(rx);
        assert_eq!(table.drop_abandoned(RequestKey::Seek(10)), Some(None));
        assert!(!table.contains(&RequestKey::Seek(10)));
    }
}
