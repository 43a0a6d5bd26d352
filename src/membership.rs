use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::MembershipError;
use crate::types::MemberId;

/// Requested change to the cluster membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipChange {
    AddVoter { id: MemberId, address: String },
    RemoveVoter { id: MemberId },
    /// Adds an edge member (read replica) that replicates but never votes.
    AddLearner { id: MemberId, address: String },
    RemoveLearner { id: MemberId },
}

/// A set of members as recorded in a membership log entry.
///
/// While `outgoing` is set the cluster is in joint consensus: `voters` is the
/// incoming set and decisions need a majority of both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipSet {
    pub voters: BTreeSet<MemberId>,
    pub learners: BTreeSet<MemberId>,
    pub outgoing: Option<BTreeSet<MemberId>>,
    pub addresses: BTreeMap<MemberId, String>,
}

impl MembershipSet {
    pub fn new(voters: impl IntoIterator<Item = (MemberId, String)>) -> Self {
        let addresses: BTreeMap<MemberId, String> = voters.into_iter().collect();
        Self {
            voters: addresses.keys().cloned().collect(),
            learners: BTreeSet::new(),
            outgoing: None,
            addresses,
        }
    }

    pub fn is_joint(&self) -> bool {
        self.outgoing.is_some()
    }

    /// Whether `id` takes part in elections and commit decisions.
    pub fn is_voter(&self, id: &MemberId) -> bool {
        self.voters.contains(id) || self.outgoing.as_ref().is_some_and(|o| o.contains(id))
    }

    pub fn is_learner(&self, id: &MemberId) -> bool {
        self.learners.contains(id)
    }

    pub fn contains(&self, id: &MemberId) -> bool {
        self.is_voter(id) || self.is_learner(id)
    }

    /// Union of incoming and outgoing voters.
    pub fn all_voters(&self) -> BTreeSet<MemberId> {
        let mut all = self.voters.clone();
        if let Some(outgoing) = &self.outgoing {
            all.extend(outgoing.iter().cloned());
        }
        all
    }

    /// Every member that should receive replicated entries.
    pub fn members(&self) -> BTreeSet<MemberId> {
        let mut all = self.all_voters();
        all.extend(self.learners.iter().cloned());
        all
    }

    pub fn address_of(&self, id: &MemberId) -> Option<&str> {
        self.addresses.get(id).map(String::as_str)
    }

    pub fn has_majority(&self, acks: &HashSet<MemberId>) -> bool {
        let majority_of = |set: &BTreeSet<MemberId>| {
            !set.is_empty() && set.iter().filter(|m| acks.contains(*m)).count() > set.len() / 2
        };
        match &self.outgoing {
            Some(old) => majority_of(old) && majority_of(&self.voters),
            None => majority_of(&self.voters),
        }
    }

    /// Highest index replicated on a majority, given each voter's match index.
    pub fn quorum_index(&self, matched: impl Fn(&MemberId) -> u64) -> u64 {
        let quorum_of = |set: &BTreeSet<MemberId>| {
            if set.is_empty() {
                return 0;
            }
            let mut indexes: Vec<u64> = set.iter().map(&matched).collect();
            indexes.sort_unstable_by(|a, b| b.cmp(a));
            indexes[set.len() / 2]
        };
        match &self.outgoing {
            Some(old) => quorum_of(old).min(quorum_of(&self.voters)),
            None => quorum_of(&self.voters),
        }
    }

    /// Computes the set that results from `change`.
    ///
    /// Voter changes enter joint consensus; learner changes take effect
    /// directly since learners never count towards a quorum.
    pub fn apply_change(&self, change: &MembershipChange) -> Result<MembershipSet, MembershipError> {
        if self.is_joint() {
            return Err(MembershipError::AlreadyInJoint);
        }
        let mut next = self.clone();
        match change {
            MembershipChange::AddVoter { id, address } => {
                if self.is_voter(id) {
                    return Err(MembershipError::AlreadyMember(id.clone()));
                }
                next.learners.remove(id);
                next.voters.insert(id.clone());
                next.addresses.insert(id.clone(), address.clone());
                next.outgoing = Some(self.voters.clone());
            }
            MembershipChange::RemoveVoter { id } => {
                if !self.voters.contains(id) {
                    return Err(MembershipError::NotMember(id.clone()));
                }
                next.voters.remove(id);
                if next.voters.is_empty() {
                    return Err(MembershipError::EmptyVoters);
                }
                next.outgoing = Some(self.voters.clone());
            }
            MembershipChange::AddLearner { id, address } => {
                if self.contains(id) {
                    return Err(MembershipError::AlreadyMember(id.clone()));
                }
                next.learners.insert(id.clone());
                next.addresses.insert(id.clone(), address.clone());
            }
            MembershipChange::RemoveLearner { id } => {
                if !next.learners.remove(id) {
                    return Err(MembershipError::NotMember(id.clone()));
                }
                next.addresses.remove(id);
            }
        }
        Ok(next)
    }

    /// The second step of a voter change: drop the outgoing set.
    pub fn leave_joint(&self) -> Result<MembershipSet, MembershipError> {
        if !self.is_joint() {
            return Err(MembershipError::NotInJoint);
        }
        let mut next = self.clone();
        next.outgoing = None;
        let members = next.members();
        next.addresses.retain(|id, _| members.contains(id));
        Ok(next)
    }
}

/// A membership set together with the log position it was appended at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEntry {
    pub index: u64,
    pub term: u64,
    pub set: MembershipSet,
}

/// History of membership sets still covered by the log.
///
/// A set is used for quorum decisions from the moment it is appended, even
/// before it commits; entries above the commit index may be rolled back.
#[derive(Debug, Clone)]
pub struct MembershipRegistry {
    history: Vec<MembershipEntry>,
    committed_index: u64,
}

impl MembershipRegistry {
    pub fn new(base: MembershipEntry) -> Self {
        let committed_index = base.index;
        Self {
            history: vec![base],
            committed_index,
        }
    }

    pub fn current(&self) -> &MembershipSet {
        &self.current_entry().set
    }

    pub fn current_entry(&self) -> &MembershipEntry {
        // history is never empty
        &self.history[self.history.len() - 1]
    }

    pub fn current_voters(&self) -> BTreeSet<MemberId> {
        self.current().all_voters()
    }

    /// Latest set whose entry is at or below the commit index.
    pub fn committed(&self) -> &MembershipEntry {
        self.entry_at(self.committed_index)
    }

    /// The set in force at log position `index`.
    pub fn entry_at(&self, index: u64) -> &MembershipEntry {
        self.history
            .iter()
            .rev()
            .find(|e| e.index <= index)
            .unwrap_or(&self.history[0])
    }

    /// A change is in progress while the latest set is uncommitted or joint.
    pub fn change_in_progress(&self) -> bool {
        let current = self.current_entry();
        current.index > self.committed_index || current.set.is_joint()
    }

    pub fn propose_change(&self, change: &MembershipChange) -> Result<MembershipSet, MembershipError> {
        if self.change_in_progress() {
            return Err(MembershipError::ChangeInProgress);
        }
        self.current().apply_change(change)
    }

    pub fn append(&mut self, entry: MembershipEntry) {
        debug!(
            "Membership at index {} (term {}): voters {:?}, learners {:?}, joint {}",
            entry.index,
            entry.term,
            entry.set.voters,
            entry.set.learners,
            entry.set.is_joint()
        );
        self.history.retain(|e| e.index < entry.index);
        self.history.push(entry);
    }

    /// Advances the commit watermark; returns true when a newer set committed.
    pub fn commit(&mut self, index: u64) -> bool {
        if index <= self.committed_index {
            return false;
        }
        let before = self.committed().index;
        self.committed_index = index;
        self.committed().index != before
    }

    /// Rolls back sets appended after `index`.
    pub fn truncate_after(&mut self, index: u64) {
        if self.history.len() > 1 {
            let base = self.history[0].clone();
            self.history.retain(|e| e.index <= index);
            if self.history.is_empty() {
                self.history.push(base);
            }
        }
    }

    /// Drops history no longer needed once the log before `index` is gone.
    pub fn compact(&mut self, index: u64) {
        let keep_from = self
            .history
            .iter()
            .rposition(|e| e.index < index)
            .unwrap_or(0);
        self.history.drain(..keep_from);
    }

    /// Replaces all history with the membership carried by a snapshot.
    pub fn reset(&mut self, entry: MembershipEntry) {
        self.committed_index = entry.index;
        self.history = vec![entry];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> MemberId {
        MemberId::new(s)
    }

    fn three() -> MembershipSet {
        MembershipSet::new(["a", "b", "c"].map(|m| (id(m), format!("{}:1", m))))
    }

    fn acks(members: &[&str]) -> HashSet<MemberId> {
        members.iter().map(|m| id(m)).collect()
    }

    #[test]
    fn simple_majority() {
        let set = three();
        assert!(set.has_majority(&acks(&["a", "b"])));
        assert!(!set.has_majority(&acks(&["a", "x"])));
    }

    #[test]
    fn joint_requires_both_majorities() {
        let joint = three()
            .apply_change(&MembershipChange::AddVoter {
                id: id("d"),
                address: "d:1".into(),
            })
            .unwrap();
        assert!(joint.is_joint());
        // majority of old, but only 2 of 4 in new
        assert!(!joint.has_majority(&acks(&["a", "b"])));
        assert!(joint.has_majority(&acks(&["a", "b", "d"])));
        // majority of new alone is not enough
        assert!(!joint.has_majority(&acks(&["a", "d", "x"])));

        let fin = joint.leave_joint().unwrap();
        assert!(!fin.is_joint());
        assert_eq!(fin.voters.len(), 4);
    }

    #[test]
    fn quorum_index_uses_median_of_each_set() {
        let set = three();
        let matched = |m: &MemberId| match m.as_str() {
            "a" => 10,
            "b" => 7,
            _ => 3,
        };
        assert_eq!(set.quorum_index(matched), 7);

        let joint = set
            .apply_change(&MembershipChange::RemoveVoter { id: id("a") })
            .unwrap();
        // old {a,b,c} -> 7, new {b,c} -> 3
        assert_eq!(joint.quorum_index(matched), 3);
    }

    #[test]
    fn learners_never_count() {
        let set = three()
            .apply_change(&MembershipChange::AddLearner {
                id: id("edge"),
                address: "edge:1".into(),
            })
            .unwrap();
        assert!(!set.is_joint());
        assert!(set.is_learner(&id("edge")));
        assert!(!set.is_voter(&id("edge")));
        assert!(!set.has_majority(&acks(&["a", "edge"])));
        assert!(set.members().contains(&id("edge")));
    }

    #[test]
    fn invalid_changes_are_rejected() {
        let set = three();
        assert_eq!(
            set.apply_change(&MembershipChange::AddVoter {
                id: id("a"),
                address: String::new()
            }),
            Err(MembershipError::AlreadyMember(id("a")))
        );
        assert_eq!(
            set.apply_change(&MembershipChange::RemoveLearner { id: id("z") }),
            Err(MembershipError::NotMember(id("z")))
        );
        let single = MembershipSet::new([(id("a"), String::new())]);
        assert_eq!(
            single.apply_change(&MembershipChange::RemoveVoter { id: id("a") }),
            Err(MembershipError::EmptyVoters)
        );
    }

    #[test]
    fn registry_allows_one_change_at_a_time() {
        let mut registry = MembershipRegistry::new(MembershipEntry {
            index: 0,
            term: 0,
            set: three(),
        });
        let change = MembershipChange::AddVoter {
            id: id("d"),
            address: "d:1".into(),
        };
        let joint = registry.propose_change(&change).unwrap();
        registry.append(MembershipEntry {
            index: 5,
            term: 2,
            set: joint,
        });
        assert!(registry.current().is_joint());
        assert_eq!(
            registry.propose_change(&MembershipChange::RemoveVoter { id: id("b") }),
            Err(MembershipError::ChangeInProgress)
        );
        assert!(registry.commit(5));
        // still joint until the final set commits
        assert!(registry.change_in_progress());

        let fin = registry.current().leave_joint().unwrap();
        registry.append(MembershipEntry {
            index: 6,
            term: 2,
            set: fin,
        });
        assert!(registry.change_in_progress());
        assert!(registry.commit(6));
        assert!(!registry.change_in_progress());
        assert_eq!(registry.committed().index, 6);
    }

    #[test]
    fn registry_rolls_back_uncommitted_sets() {
        let mut registry = MembershipRegistry::new(MembershipEntry {
            index: 0,
            term: 0,
            set: three(),
        });
        let joint = registry
            .propose_change(&MembershipChange::RemoveVoter { id: id("c") })
            .unwrap();
        registry.append(MembershipEntry {
            index: 4,
            term: 1,
            set: joint,
        });
        registry.truncate_after(3);
        assert!(!registry.current().is_joint());
        assert_eq!(registry.current_voters().len(), 3);
        assert_eq!(registry.entry_at(10).index, 0);
    }

    #[test]
    fn compact_keeps_set_in_force() {
        let mut registry = MembershipRegistry::new(MembershipEntry::default());
        for index in [3, 8, 12] {
            registry.append(MembershipEntry {
                index,
                term: 1,
                set: three(),
            });
        }
        registry.commit(12);
        registry.compact(10);
        assert_eq!(registry.entry_at(10).index, 8);
        assert_eq!(registry.current_entry().index, 12);
    }
}
