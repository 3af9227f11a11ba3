//! Participant roster merged from relay pushes and host polling.
//!
//! Both sources go through [`RosterManager::merge`]. The merge is keyed on
//! the relay-assigned id and is idempotent per id, so any interleaving of
//! push and poll results yields the same roster.

use serde::Serialize;
use tracing::{debug, info};

use crate::signaling::{FeedId, LeaveTarget, PeerRecord};

/// Someone else in the room
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Participant {
    pub id: FeedId,
    pub display: String,
}

impl Participant {
    pub fn is_self(&self, local: &crate::lifecycle::LocalIdentity) -> bool {
        local.id == Some(self.id) || local.display == self.display
    }
}

/// Where a roster update came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RosterSource {
    Push,
    Poll,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterUpdate {
    Upsert {
        source: RosterSource,
        peers: Vec<PeerRecord>,
    },
    Remove(LeaveTarget),
}

/// What a merge actually changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RosterDelta {
    pub added: usize,
    pub removed: usize,
}

impl RosterDelta {
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.removed == 0
    }
}

#[derive(Debug, Clone)]
pub struct RosterManager {
    local_display: String,
    local_id: Option<FeedId>,
    entries: Vec<Participant>,
}

impl RosterManager {
    pub fn new(local_display: impl Into<String>) -> Self {
        Self {
            local_display: local_display.into(),
            local_id: None,
            entries: Vec::new(),
        }
    }

    /// Record the relay id of the local participant and drop it if it
    /// slipped in earlier.
    pub fn set_local_id(&mut self, id: FeedId) {
        self.local_id = Some(id);
        self.entries.retain(|p| p.id != id);
    }

    pub fn merge(&mut self, update: RosterUpdate) -> RosterDelta {
        let delta = match update {
            RosterUpdate::Upsert { source, peers } => {
                let added = peers
                    .into_iter()
                    .map(|peer| self.upsert(peer))
                    .filter(|added| *added)
                    .count();
                if added > 0 {
                    debug!("{} participant(s) added from {:?}", added, source);
                }
                RosterDelta { added, removed: 0 }
            }
            RosterUpdate::Remove(LeaveTarget::Feed(id)) => {
                let before = self.entries.len();
                self.entries.retain(|p| p.id != id);
                RosterDelta {
                    added: 0,
                    removed: before - self.entries.len(),
                }
            }
            RosterUpdate::Remove(LeaveTarget::Ack(token)) => {
                debug!("Ignoring departure acknowledgement {:?}", token);
                RosterDelta::default()
            }
        };

        if !delta.is_empty() {
            info!("Roster now has {} participant(s)", self.entries.len());
        }
        delta
    }

    fn upsert(&mut self, peer: PeerRecord) -> bool {
        let display = peer.display.unwrap_or_default();
        if display == self.local_display || self.local_id == Some(peer.id) {
            return false;
        }
        if self.contains(peer.id) {
            return false;
        }
        self.entries.push(Participant { id: peer.id, display });
        true
    }

    pub fn contains(&self, id: FeedId) -> bool {
        self.entries.iter().any(|p| p.id == id)
    }

    pub fn participants(&self) -> &[Participant] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.local_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn push(peers: &[(u64, &str)]) -> RosterUpdate {
        RosterUpdate::Upsert {
            source: RosterSource::Push,
            peers: peers.iter().map(|(id, name)| PeerRecord::new(*id, name)).collect(),
        }
    }

    fn ids(roster: &RosterManager) -> Vec<u64> {
        roster.participants().iter().map(|p| p.id.0).collect()
    }

    #[test]
    fn upsert_keeps_first_appearance_order() {
        let mut roster = RosterManager::new("mentor");
        roster.merge(push(&[(3, "c"), (1, "a")]));
        roster.merge(push(&[(2, "b"), (3, "c")]));
        assert_eq!(ids(&roster), vec![3, 1, 2]);
    }

    #[test]
    fn repeated_upsert_is_a_no_op() {
        let mut roster = RosterManager::new("mentor");
        roster.merge(push(&[(7, "guest_42")]));
        let delta = roster.merge(RosterUpdate::Upsert {
            source: RosterSource::Poll,
            peers: vec![PeerRecord::new(7, "renamed")],
        });
        assert!(delta.is_empty());
        assert_eq!(
            roster.participants().to_vec(),
            vec![Participant {
                id: FeedId(7),
                display: "guest_42".to_string(),
            }]
        );
    }

    #[test]
    fn same_name_different_ids_are_distinct() {
        let mut roster = RosterManager::new("mentor");
        roster.merge(push(&[(1, "guest"), (2, "guest")]));
        assert_eq!(roster.len(), 2);
    }

    #[test]
    fn local_display_is_never_listed() {
        let mut roster = RosterManager::new("mentee_17");
        roster.merge(push(&[(5, "testAccount"), (9, "mentee_17")]));
        assert_eq!(ids(&roster), vec![5]);
    }

    #[test]
    fn local_id_is_dropped_once_known() {
        let mut roster = RosterManager::new("mentor");
        roster.merge(push(&[(11, "other-name"), (5, "x")]));
        roster.set_local_id(FeedId(11));
        assert_eq!(ids(&roster), vec![5]);
        roster.merge(push(&[(11, "other-name")]));
        assert_eq!(ids(&roster), vec![5]);
    }

    #[test]
    fn leave_removes_exactly_that_entry() {
        let mut roster = RosterManager::new("mentor");
        roster.merge(push(&[(7, "guest_42"), (8, "guest_7")]));

        let first = roster.merge(RosterUpdate::Remove(LeaveTarget::Feed(FeedId(7))));
        assert_eq!(first.removed, 1);
        assert_eq!(ids(&roster), vec![8]);

        let second = roster.merge(RosterUpdate::Remove(LeaveTarget::Feed(FeedId(7))));
        assert!(second.is_empty());
        assert_eq!(ids(&roster), vec![8]);
    }

    #[test]
    fn acknowledgement_token_never_removes() {
        let mut roster = RosterManager::new("mentor");
        roster.merge(push(&[(7, "guest_42")]));
        let delta = roster.merge(RosterUpdate::Remove(LeaveTarget::Ack("ok".to_string())));
        assert!(delta.is_empty());
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn clear_empties_and_forgets_local_id() {
        let mut roster = RosterManager::new("mentor");
        roster.set_local_id(FeedId(1));
        roster.merge(push(&[(2, "b")]));
        roster.clear();
        assert!(roster.is_empty());
        roster.merge(push(&[(1, "a")]));
        assert_eq!(ids(&roster), vec![1]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Push(Vec<(u64, u8)>),
        Poll(Vec<(u64, u8)>),
        Leave(u64),
        Ack,
    }

    fn op() -> impl Strategy<Value = Op> {
        let peers = prop::collection::vec((0u64..12, 0u8..4), 0..6);
        prop_oneof![
            peers.clone().prop_map(Op::Push),
            peers.prop_map(Op::Poll),
            (0u64..12).prop_map(Op::Leave),
            Just(Op::Ack),
        ]
    }

    fn records(peers: &[(u64, u8)]) -> Vec<PeerRecord> {
        // name 0 collides with the local display name
        peers
            .iter()
            .map(|(id, name)| PeerRecord::new(*id, &format!("name{}", name)))
            .collect()
    }

    proptest! {
        #[test]
        fn roster_invariants_hold_for_any_sequence(ops in prop::collection::vec(op(), 0..40)) {
            let mut roster = RosterManager::new("name0");
            for op in ops {
                let before = ids(&roster);
                let update = match &op {
                    Op::Push(peers) => RosterUpdate::Upsert { source: RosterSource::Push, peers: records(peers) },
                    Op::Poll(peers) => RosterUpdate::Upsert { source: RosterSource::Poll, peers: records(peers) },
                    Op::Leave(id) => RosterUpdate::Remove(LeaveTarget::Feed(FeedId(*id))),
                    Op::Ack => RosterUpdate::Remove(LeaveTarget::Ack("ok".to_string())),
                };
                roster.merge(update);
                let after = ids(&roster);

                let unique: HashSet<u64> = after.iter().copied().collect();
                prop_assert_eq!(unique.len(), after.len());
                prop_assert!(roster.participants().iter().all(|p| p.display != "name0"));

                match op {
                    Op::Ack => prop_assert_eq!(&after, &before),
                    Op::Push(_) | Op::Poll(_) => prop_assert_eq!(&after[..before.len()], &before[..]),
                    Op::Leave(_) => {}
                }
            }
        }

        #[test]
        fn upserting_present_ids_changes_nothing(ids_in in prop::collection::vec(1u64..50, 1..10)) {
            let mut roster = RosterManager::new("local");
            let peers: Vec<PeerRecord> = ids_in.iter().map(|id| PeerRecord::new(*id, "peer")).collect();
            roster.merge(RosterUpdate::Upsert { source: RosterSource::Push, peers: peers.clone() });
            let snapshot = roster.participants().to_vec();
            let delta = roster.merge(RosterUpdate::Upsert { source: RosterSource::Poll, peers });
            prop_assert!(delta.is_empty());
            prop_assert_eq!(roster.participants(), &snapshot[..]);
        }
    }
}
